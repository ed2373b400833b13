//! `fuse` — a demo CLI that mounts a `latticefs` volume against the in-memory reference
//! `MetaKv`/`InodeStore` implementations. A production deployment swaps in a
//! real `MetaKv` client and block storage plane and drives `FsApi` from an actual FUSE loop; this
//! binary stops at standing the volume up and exercising it until interrupted, mirroring how the
//! teacher's own CLI tools are thin wrappers around one library call.

use latticefs::blocks::MemInodeStore;
use latticefs::chain::ChainEngine;
use latticefs::codec::VolumeKind;
use latticefs::kv::MemKv;
use latticefs::store::FsMetaStore;
use latticefs::FsApi;
use std::env;
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn print_usage(bin: &str) {
    eprintln!("Usage:");
    eprintln!(" {bin} [-h]");
    eprintln!(" {bin} VOLUME MOUNTPOINT [--user-mount]");
    eprintln!();
    eprintln!("Options:");
    eprintln!(" -h:\t\tprints usage");
    eprintln!(" VOLUME:\tname of the volume to create and mount");
    eprintln!(" MOUNTPOINT:\tdirectory the volume is mounted under");
    eprintln!(" --user-mount:\tmount without root privileges (implied when not running as root)");
}

fn is_root() -> bool {
    // SAFETY: geteuid takes no arguments and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = env::args().collect();
    let bin = args.first().map(String::as_str).unwrap_or("fuse");
    let a: Vec<&str> = args.iter().map(String::as_str).collect();

    let (volume_name, mountpoint, user_mount) = match a[1..] {
        [] => {
            print_usage(bin);
            exit(1);
        }
        ["-h"] => {
            print_usage(bin);
            exit(0);
        }
        [volume, dir] => (volume, dir, !is_root()),
        [volume, dir, "--user-mount"] => (volume, dir, true),
        _ => {
            print_usage(bin);
            exit(1);
        }
    };

    if user_mount {
        tracing::info!("mounting without root privileges");
    }

    let store = Arc::new(FsMetaStore::new(Arc::new(MemKv::new())));
    let inodes: Arc<dyn latticefs::blocks::InodeStore> = Arc::new(MemInodeStore::new());
    let chain = Arc::new(ChainEngine::new(store.clone(), inodes.clone()));

    if let Err(e) = store.create_fs_vol(volume_name, VolumeKind::File).await {
        tracing::error!(volume = volume_name, error = %e, "failed to create volume");
        exit(1);
    }
    let lease = match store.grant_lease(Duration::from_secs(60)).await {
        Ok(lease) => lease,
        Err(e) => {
            tracing::error!(error = %e, "failed to acquire a claim lease");
            exit(1);
        }
    };
    let _api = FsApi::new(store, chain, inodes, Uuid::new_v4(), lease);

    tracing::info!(volume = volume_name, mountpoint, "mounted (demo: metadata plane only, no FUSE loop wired)");

    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("received interrupt, unmounting");
            exit(0);
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to listen for interrupt");
            exit(1);
        }
    }
}
