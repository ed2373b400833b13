//! `FsApi` — the POSIX-shaped surface this crate presents to a filesystem front end.
//! Grounded on `examples/original_source/fs/fileinfo.go` (`Lstat`, `Readdir`, `Mkdir`),
//! `fs/links.go` (`Rename`, `Link`, `Symlink`, `removeFile`) and `fs/helpers.go` (`Chmod`,
//! `Chown`), translated from a `*server` with ad hoc fields onto the explicit collaborators this
//! crate specifies ([`FsMetaStore`], [`ChainEngine`], [`InodeStore`], [`LivenessTracker`]).

use crate::blocks::{BlockSet, FlatBlockSet, InodeStore};
use crate::chain::{ChainEngine, ModOutcome};
use crate::codec::{FileEntry, INode, Metadata};
use crate::error::{Error, Result};
use crate::file::{ClaimPublisher, FileHandle};
use crate::ids::{INodeId, INodeRef, VolumeId};
use crate::kv::LeaseId;
use crate::liveness::LivenessTracker;
use crate::path::Path;
use crate::store::FsMetaStore;
use async_trait::async_trait;
use roaring::RoaringBitmap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;
use uuid::Uuid;

const MAX_SYMLINK_DEPTH: u32 = 40;

/// An opaque handle to one open [`FileHandle`], minted fresh by every [`FsApi::create`]/
/// [`FsApi::open`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileHandleId(u64);

/// The read model for a path: exactly one of directory, regular file, or symlink, replacing the
/// source's `FileInfo` struct (which carries all three as optional fields and picks one by
/// convention) with a sealed enum an exhaustive match can check at compile time.
#[derive(Debug, Clone)]
pub enum FileInfo {
    Dir {
        path: Path,
        metadata: Metadata,
        entry_count: usize,
    },
    File {
        path: Path,
        inode: INode,
        ref_: INodeRef,
    },
    Symlink {
        path: Path,
        target: String,
    },
}

/// The full POSIX-shaped operation set this layer exposes.
#[async_trait]
pub trait PosixFs: Send + Sync {
    async fn mkdir(&self, path: &Path, md: Metadata) -> Result<()>;
    async fn readdir(&self, path: &Path) -> Result<Vec<Path>>;
    async fn lstat(&self, path: &Path) -> Result<FileInfo>;
    async fn create(&self, path: &Path, md: Metadata) -> Result<FileHandleId>;
    async fn open(&self, path: &Path) -> Result<FileHandleId>;
    async fn close(&self, handle: FileHandleId) -> Result<()>;
    async fn rename(&self, from: &Path, to: &Path) -> Result<()>;
    async fn link(&self, from: &Path, to: &Path) -> Result<()>;
    async fn symlink(&self, target: &str, at: &Path) -> Result<()>;
    async fn remove(&self, path: &Path) -> Result<()>;
    async fn chmod(&self, path: &Path, mode: u32) -> Result<()>;
    async fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<()>;
}

pub struct FsApi {
    store: Arc<FsMetaStore>,
    chain: Arc<ChainEngine>,
    inodes: Arc<dyn InodeStore>,
    liveness: Arc<LivenessTracker>,
    block_set: Arc<dyn BlockSet>,
    open_files: RwLock<HashMap<u64, Arc<AsyncMutex<FileHandle>>>>,
    next_handle: AtomicU64,
}

impl FsApi {
    pub fn new(
        store: Arc<FsMetaStore>,
        chain: Arc<ChainEngine>,
        inodes: Arc<dyn InodeStore>,
        client: Uuid,
        lease: LeaseId,
    ) -> Self {
        Self::with_block_set(store, chain, inodes, client, lease, Arc::new(FlatBlockSet))
    }

    pub fn with_block_set(
        store: Arc<FsMetaStore>,
        chain: Arc<ChainEngine>,
        inodes: Arc<dyn InodeStore>,
        client: Uuid,
        lease: LeaseId,
        block_set: Arc<dyn BlockSet>,
    ) -> Self {
        let liveness = Arc::new(LivenessTracker::new(store.clone(), client, lease));
        Self {
            store,
            chain,
            inodes,
            liveness,
            block_set,
            open_files: RwLock::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    pub fn handle(&self, id: FileHandleId) -> Option<Arc<AsyncMutex<FileHandle>>> {
        self.open_files.read().unwrap().get(&id.0).cloned()
    }

    fn open_entry(&self, fh: FileHandle) -> FileHandleId {
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.open_files.write().unwrap().insert(id, Arc::new(AsyncMutex::new(fh)));
        FileHandleId(id)
    }

    /// Follows a `FileEntry`'s symlink chain (if any) to the inode it ultimately refers to,
    /// bounded at `MAX_SYMLINK_DEPTH` the way most POSIX implementations cap `ELOOP` (the source
    /// relies on unbounded recursion via `path.Clean`, which this crate's straight-line loop form
    /// avoids).
    async fn resolve_inode_ref(&self, path: &Path) -> Result<(VolumeId, INodeRef)> {
        let mut current = path.clone();
        for _ in 0..MAX_SYMLINK_DEPTH {
            let volume = self.store.get_volume_id(&current.volume).await?;
            let entry = self.store.file_entry_for_path(&current).await?;
            if entry.is_symlink() {
                let target = if entry.sympath.starts_with('/') {
                    entry.sympath.clone()
                } else {
                    format!("{}{}", current.base(), entry.sympath)
                };
                current = Path::new(current.volume.clone(), target);
                continue;
            }
            let r = self
                .store
                .get_chain_inode(INodeRef::new(volume, INodeId(entry.chain)))
                .await?;
            return Ok((volume, r));
        }
        Err(Error::Invalid("too many levels of symlinks".into()))
    }

    /// Scans currently open handles for one that holds unflushed writes to `path`, so `chmod`/
    /// `chown` on a file someone has open for writing lands on the in-memory pending inode rather
    /// than racing `ChainEngine::mod_file_metadata` against that handle's eventual `sync`.
    async fn find_open_write_handle(&self, path: &Path) -> Option<Arc<AsyncMutex<FileHandle>>> {
        let candidates: Vec<_> = self.open_files.read().unwrap().values().cloned().collect();
        for handle in candidates {
            let fh = handle.lock().await;
            if fh.write_open && fh.inode.filenames.iter().any(|f| f == &path.path) {
                drop(fh);
                return Some(handle);
            }
        }
        None
    }
}

#[async_trait]
impl ClaimPublisher for FsApi {
    async fn update_held_inodes(&self, volume: VolumeId, old: &RoaringBitmap, new: &RoaringBitmap) -> Result<()> {
        self.liveness.dec_ref(volume, old);
        self.liveness.inc_ref(volume, new);
        self.liveness.publish_claim(volume).await
    }
}

#[async_trait]
impl PosixFs for FsApi {
    async fn mkdir(&self, path: &Path, md: Metadata) -> Result<()> {
        if !path.is_dir() {
            return Err(Error::Invalid("mkdir requires a directory path".into()));
        }
        self.store.mkdir(path, md).await
    }

    async fn readdir(&self, path: &Path) -> Result<Vec<Path>> {
        if !path.is_dir() {
            return Err(Error::NotDir);
        }
        let (dir, mut entries, _) = self.store.getdir(path).await?;
        for filename in dir.files.keys() {
            entries.push(path.child(filename).ok_or_else(|| Error::Invalid("malformed entry".into()))?);
        }
        Ok(entries)
    }

    async fn lstat(&self, path: &Path) -> Result<FileInfo> {
        if path.is_dir() {
            let (dir, _, _) = self.store.getdir(path).await?;
            return Ok(FileInfo::Dir {
                path: path.clone(),
                entry_count: dir.files.len(),
                metadata: dir.metadata,
            });
        }
        let entry = self.store.file_entry_for_path(path).await?;
        if entry.is_symlink() {
            return Ok(FileInfo::Symlink {
                path: path.clone(),
                target: entry.sympath,
            });
        }
        let volume = self.store.get_volume_id(&path.volume).await?;
        let r = self
            .store
            .get_chain_inode(INodeRef::new(volume, INodeId(entry.chain)))
            .await?;
        let inode = self.inodes.get(r).await?;
        Ok(FileInfo::File {
            path: path.clone(),
            inode,
            ref_: r,
        })
    }

    async fn create(&self, path: &Path, md: Metadata) -> Result<FileHandleId> {
        if path.is_dir() {
            return Err(Error::IsDir);
        }
        match self.store.file_entry_for_path(path).await {
            Ok(existing) if !existing.is_deleted() => return Err(Error::Exists),
            Ok(_) | Err(Error::NotExist) => {}
            Err(e) => return Err(e),
        }
        let volume = self.store.get_volume_id(&path.volume).await?;
        let id = self.store.commit_inode_index(volume).await?;
        let inode = INode {
            inode: id.0,
            chain: id.0,
            filesize: 0,
            permissions: md,
            filenames: vec![path.path.clone()],
            blocks: vec![],
        };
        let handle = FileHandle::new(path.clone(), volume, inode, 0, self.block_set.clone());
        Ok(self.open_entry(handle))
    }

    async fn open(&self, path: &Path) -> Result<FileHandleId> {
        let (volume, r) = self.resolve_inode_ref(path).await?;
        if r.is_zero() {
            return Err(Error::NotExist);
        }
        let inode = self.inodes.get(r).await?;
        let replaces = inode.inode;
        let handle = FileHandle::new(path.clone(), volume, inode, replaces, self.block_set.clone());
        Ok(self.open_entry(handle))
    }

    async fn close(&self, handle: FileHandleId) -> Result<()> {
        let entry = {
            let mut table = self.open_files.write().unwrap();
            table.remove(&handle.0).ok_or(Error::NotExist)?
        };
        let mut fh = entry.lock().await;
        fh.sync(&self.chain, self).await
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        if from.volume != to.volume {
            return Err(Error::Invalid("rename across volumes".into()));
        }
        let volume = self.store.get_volume_id(&from.volume).await?;
        let new_id = self.store.commit_inode_index(volume).await?;
        let from_name = from.path.clone();
        let to_name = to.path.clone();
        let result = self
            .chain
            .update_inode_chain(from, |inode, vol| match inode {
                None => Err(Error::NotExist.into()),
                Some(inode) => {
                    let mut updated = inode.clone();
                    updated.inode = new_id.0;
                    updated.filenames = updated
                        .filenames
                        .iter()
                        .map(|f| if *f == from_name { to_name.clone() } else { f.clone() })
                        .collect();
                    Ok(ModOutcome::Write(updated, INodeRef::new(vol, new_id)))
                }
            })
            .await;
        let (written, _) = ChainEngine::no_abort(result)?;
        self.store.set_file_entry(from, FileEntry::default()).await?;
        self.store.set_file_entry(to, FileEntry::chain(written.chain)).await?;
        Ok(())
    }

    async fn link(&self, from: &Path, to: &Path) -> Result<()> {
        if from.volume != to.volume {
            return Err(Error::Invalid("link across volumes".into()));
        }
        match self.store.file_entry_for_path(to).await {
            Ok(existing) if !existing.is_deleted() => return Err(Error::Exists),
            Ok(_) | Err(Error::NotExist) => {}
            Err(e) => return Err(e),
        }
        let volume = self.store.get_volume_id(&from.volume).await?;
        let new_id = self.store.commit_inode_index(volume).await?;
        let to_name = to.path.clone();
        let result = self
            .chain
            .update_inode_chain(from, |inode, vol| match inode {
                None => Err(Error::NotExist.into()),
                Some(inode) => {
                    let mut updated = inode.clone();
                    updated.inode = new_id.0;
                    updated.filenames.push(to_name.clone());
                    Ok(ModOutcome::Write(updated, INodeRef::new(vol, new_id)))
                }
            })
            .await;
        let (written, _) = ChainEngine::no_abort(result)?;
        self.store.set_file_entry(to, FileEntry::chain(written.chain)).await.map(|_| ())
    }

    async fn symlink(&self, target: &str, at: &Path) -> Result<()> {
        match self.store.file_entry_for_path(at).await {
            Ok(existing) if !existing.is_deleted() => return Err(Error::Exists),
            Ok(_) | Err(Error::NotExist) => {}
            Err(e) => return Err(e),
        }
        self.store.set_file_entry(at, FileEntry::symlink(target)).await.map(|_| ())
    }

    async fn remove(&self, path: &Path) -> Result<()> {
        if path.is_dir() {
            return self.store.rmdir(path).await;
        }
        let entry = self.store.file_entry_for_path(path).await?;
        if entry.is_symlink() {
            return self.store.set_file_entry(path, FileEntry::default()).await.map(|_| ());
        }

        let volume = self.store.get_volume_id(&path.volume).await?;
        let ref_ = self
            .store
            .get_chain_inode(INodeRef::new(volume, INodeId(entry.chain)))
            .await?;
        let inode = self.inodes.get(ref_).await?;
        let remaining: Vec<String> = inode.filenames.iter().filter(|f| **f != path.path).cloned().collect();

        if remaining.len() == inode.filenames.len() {
            // This path wasn't actually one of the inode's known names; just drop its directory entry.
            return self.store.set_file_entry(path, FileEntry::default()).await.map(|_| ());
        }

        if remaining.is_empty() {
            debug!(%path, "remove: last link gone, retiring chain");
            self.store.set_file_entry(path, FileEntry::default()).await?;
            self.store
                .set_chain_inode(INodeRef::new(volume, INodeId(inode.chain)), ref_, INodeRef::zero(volume))
                .await?;
            let dead = self.block_set.live_inodes(&inode);
            self.store.modify_dead_map(volume, &RoaringBitmap::new(), &dead).await?;
            return Ok(());
        }

        // Rewrite the chain's filename list before dropping this path's own directory entry:
        // update_inode_chain resolves the chain via `path`'s entry, so the entry must still exist.
        let new_id = self.store.commit_inode_index(volume).await?;
        let result = self
            .chain
            .update_inode_chain(path, |inode, vol| match inode {
                None => Err(Error::NotExist.into()),
                Some(inode) => {
                    let mut updated = inode.clone();
                    updated.inode = new_id.0;
                    updated.filenames = remaining.clone();
                    Ok(ModOutcome::Write(updated, INodeRef::new(vol, new_id)))
                }
            })
            .await;
        ChainEngine::no_abort(result)?;
        self.store.set_file_entry(path, FileEntry::default()).await.map(|_| ())
    }

    async fn chmod(&self, path: &Path, mode: u32) -> Result<()> {
        if path.is_dir() {
            let (dir, _, _) = self.store.getdir(path).await?;
            let mut md = dir.metadata;
            md.mode = mode;
            return self.store.change_dir_metadata(path, md).await;
        }
        if let Some(entry) = self.find_open_write_handle(path).await {
            let mut fh = entry.lock().await;
            fh.inode.permissions.mode = mode;
            fh.changed.insert("mode");
            return Ok(());
        }
        self.chain.mod_file_metadata(path, |md| md.mode = mode).await
    }

    async fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        if path.is_dir() {
            let (dir, _, _) = self.store.getdir(path).await?;
            let mut md = dir.metadata;
            if let Some(uid) = uid {
                md.uid = uid;
            }
            if let Some(gid) = gid {
                md.gid = gid;
            }
            return self.store.change_dir_metadata(path, md).await;
        }
        self.chain
            .mod_file_metadata(path, |md| {
                if let Some(uid) = uid {
                    md.uid = uid;
                }
                if let Some(gid) = gid {
                    md.gid = gid;
                }
            })
            .await
    }
}
