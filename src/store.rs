//! `FsMetaStore` — the KV-key schema and the full metadata operation table.
//! Grounded on `examples/original_source/fs/etcd.go`, `metadata.go`, `helpers.go`: each method
//! here corresponds to one of that file's `fsEtcd` methods, translated from etcd's `Txn{If, Then}`
//! idiom onto the narrower [`MetaKv`] surface this crate specifies.

use crate::codec::{self, Directory, FileChainSet, FileEntry, Metadata, Volume, VolumeKind};
use crate::error::{Error, Result};
use crate::ids::{INodeId, INodeRef, VolumeId};
use crate::kv::{LeaseId, MetaKv, ReadOp};
use crate::path::Path;
use crate::telemetry::{NoopTelemetry, Telemetry};
use roaring::RoaringBitmap;
use std::sync::Arc;
use tracing::trace;
use uuid::Uuid;

const TABLE_VOLUMES: &str = "volumes";
const TABLE_VOLUME_ID: &str = "volumeid";
const TABLE_VOLUME_INODE_MINTER: &str = "volumemeta:inode";
const TABLE_DEADMAP: &str = "volumemeta:deadmap";
const TABLE_OPEN: &str = "volumemeta:open";
const TABLE_CHAIN: &str = "volumemeta:chain";
const TABLE_DIRS: &str = "dirs";
const KEY_VOLUME_MINTER: &str = "meta:volumeminter";

fn chain_key(volume: VolumeId, page: u64) -> String {
    format!("{TABLE_CHAIN}:{}:{page:016x}", volume.to_hex())
}

fn open_key(volume: VolumeId, client: Uuid) -> String {
    format!("{TABLE_OPEN}:{}:{}", volume.to_hex(), client)
}

/// The metadata plane: one `FsMetaStore` per deployment, shared across volumes, backed by a
/// single [`MetaKv`] client.
pub struct FsMetaStore {
    kv: Arc<dyn MetaKv>,
    telemetry: Arc<dyn Telemetry>,
}

impl FsMetaStore {
    pub fn new(kv: Arc<dyn MetaKv>) -> Self {
        Self {
            kv,
            telemetry: Arc::new(NoopTelemetry),
        }
    }

    pub fn with_telemetry(kv: Arc<dyn MetaKv>, telemetry: Arc<dyn Telemetry>) -> Self {
        Self { kv, telemetry }
    }

    /// Read-modify-write loop: retries transparently when `f`'s result loses the race against a
    /// concurrent writer, but propagates any error `f` itself returns immediately (that is a
    /// business-logic rejection, not an optimistic-concurrency collision — see
    /// [`Self::set_chain_inode`] for the case that matters).
    async fn atomic_modify<T>(
        &self,
        key: &str,
        f: impl Fn(Option<&[u8]>) -> Result<(Vec<u8>, T)>,
    ) -> Result<T> {
        loop {
            let current = self.kv.get(key.as_bytes()).await?;
            let (bytes, version) = match &current {
                Some(v) => (Some(v.value.as_slice()), Some(v.version)),
                None => (None, None),
            };
            let (new_bytes, extra) = f(bytes)?;
            if self
                .kv
                .txn_check_and_put(key.as_bytes(), version, &new_bytes)
                .await?
            {
                return Ok(extra);
            }
            trace!(key, "atomic_modify lost race, retrying");
            self.telemetry.atomic_modify_retry(key);
        }
    }

    /// Mints a new volume and its root directory. Fails with [`Error::Exists`] if the name is
    /// already taken.
    pub async fn create_fs_vol(&self, name: &str, kind: VolumeKind) -> Result<VolumeId> {
        let id = self
            .atomic_modify(KEY_VOLUME_MINTER, |bytes| {
                let cur = match bytes {
                    Some(b) => codec::decode_u64(b)?,
                    None => 0,
                };
                let next = cur + 1;
                Ok((codec::encode_u64(next).to_vec(), next))
            })
            .await?;
        let id = VolumeId(id);

        let created = self
            .kv
            .txn_check_and_put(
                format!("{TABLE_VOLUMES}:{name}").as_bytes(),
                None,
                &codec::encode_u64(id.0),
            )
            .await?;
        if !created {
            return Err(Error::Exists);
        }

        let volume = Volume {
            id: id.0,
            name: name.to_string(),
            kind,
        };
        self.kv
            .put(
                format!("{TABLE_VOLUME_ID}:{}", id.to_hex()).as_bytes(),
                &codec::encode(&volume)?,
            )
            .await?;
        self.kv
            .put(
                format!("{TABLE_VOLUME_INODE_MINTER}:{}", id.to_hex()).as_bytes(),
                &codec::encode_u64(1),
            )
            .await?;
        self.kv
            .put(
                format!("{TABLE_DEADMAP}:{}", id.to_hex()).as_bytes(),
                &codec::bitmap_to_bytes(&RoaringBitmap::new()),
            )
            .await?;
        let root = Path::root(name);
        self.kv
            .put(
                format!("{TABLE_DIRS}:{}", root.key()).as_bytes(),
                &codec::encode(&Directory::new(Metadata::default()))?,
            )
            .await?;
        Ok(id)
    }

    pub async fn mkdir(&self, path: &Path, md: Metadata) -> Result<()> {
        let parent = path.parent().ok_or_else(|| Error::Invalid("cannot mkdir root".into()))?;
        if self
            .kv
            .get(format!("{TABLE_DIRS}:{}", parent.key()).as_bytes())
            .await?
            .is_none()
        {
            return Err(Error::NotExist);
        }
        let created = self
            .kv
            .txn_check_and_put(
                format!("{TABLE_DIRS}:{}", path.key()).as_bytes(),
                None,
                &codec::encode(&Directory::new(md))?,
            )
            .await?;
        if !created {
            return Err(Error::Exists);
        }
        Ok(())
    }

    pub async fn change_dir_metadata(&self, path: &Path, md: Metadata) -> Result<()> {
        let key = format!("{TABLE_DIRS}:{}", path.key());
        self.atomic_modify(&key, |bytes| {
            let mut dir: Directory = codec::decode(bytes.ok_or(Error::NotExist)?)?;
            dir.metadata = md.clone();
            Ok((codec::encode(&dir)?, ()))
        })
        .await
    }

    /// Returns the directory, its immediate subdirectories, and the directory key's KV version
    /// (needed by [`Self::rmdir`]'s CAS-delete).
    pub async fn getdir(&self, path: &Path) -> Result<(Directory, Vec<Path>, u64)> {
        let table_prefix = format!("{TABLE_DIRS}:{}", path.subdirs_prefix());
        let results = self
            .kv
            .txn_read(&[
                ReadOp::Get(format!("{TABLE_DIRS}:{}", path.key()).as_bytes()),
                ReadOp::ScanPrefix(table_prefix.as_bytes()),
            ])
            .await?;
        let mut results = results.into_iter();
        let dir_value = results.next().unwrap().into_value().ok_or(Error::NotExist)?;
        let dir: Directory = codec::decode(&dir_value.value)?;

        let mut subdirs = Vec::new();
        for (key, _) in results.next().unwrap().into_scan() {
            let key_str = String::from_utf8(key).map_err(|e| Error::Codec(e.to_string()))?;
            let suffix = match key_str.strip_prefix(&table_prefix) {
                Some(s) => s,
                None => continue,
            };
            if suffix.is_empty() || !suffix.ends_with('/') {
                continue;
            }
            if suffix[..suffix.len() - 1].contains('/') {
                continue; // more than one path segment below us: not an immediate child
            }
            subdirs.push(Path::new(path.volume.clone(), format!("{}{}", path.path, suffix)));
        }
        Ok((dir, subdirs, dir_value.version))
    }

    pub async fn rmdir(&self, path: &Path) -> Result<()> {
        if !path.is_dir() {
            return Err(Error::NotDir);
        }
        if path.is_root() {
            return Err(Error::Invalid("cannot remove the root directory".into()));
        }
        let (dir, subdirs, version) = self.getdir(path).await?;
        if !dir.files.is_empty() || !subdirs.is_empty() {
            return Err(Error::Invalid("directory not empty".into()));
        }
        let deleted = self
            .kv
            .txn_check_and_delete(format!("{TABLE_DIRS}:{}", path.key()).as_bytes(), Some(version))
            .await?;
        if !deleted {
            return Err(Error::Invalid("directory changed concurrently".into()));
        }
        Ok(())
    }

    /// Sets (or, if both fields are empty, deletes) the file entry at `path`. Returns the entry
    /// that was previously there, if any.
    pub async fn set_file_entry(&self, path: &Path, entry: FileEntry) -> Result<FileEntry> {
        let key = format!("{TABLE_DIRS}:{}", path.parent().ok_or(Error::IsDir)?.key());
        let filename = path.filename().to_string();
        self.atomic_modify(&key, |bytes| {
            let mut dir: Directory = codec::decode(bytes.ok_or(Error::NotExist)?)?;
            let old = dir.files.get(&filename).cloned().unwrap_or_default();
            if entry.is_deleted() {
                dir.files.remove(&filename);
            } else {
                dir.files.insert(filename.clone(), entry.clone());
            }
            Ok((codec::encode(&dir)?, old))
        })
        .await
    }

    pub async fn file_entry_for_path(&self, path: &Path) -> Result<FileEntry> {
        let parent = path.parent().ok_or(Error::IsDir)?;
        let (dir, _, _) = self.getdir(&parent).await?;
        dir.files.get(path.filename()).cloned().ok_or(Error::NotExist)
    }

    pub async fn get_volume_id(&self, name: &str) -> Result<VolumeId> {
        let raw = self
            .kv
            .get(format!("{TABLE_VOLUMES}:{name}").as_bytes())
            .await?
            .ok_or(Error::NotExist)?;
        Ok(VolumeId(codec::decode_u64(&raw.value)?))
    }

    pub async fn get_volume(&self, id: VolumeId) -> Result<Volume> {
        let raw = self
            .kv
            .get(format!("{TABLE_VOLUME_ID}:{}", id.to_hex()).as_bytes())
            .await?
            .ok_or(Error::NotExist)?;
        codec::decode(&raw.value)
    }

    /// Resolves a chain pointer. Per the resolved `GetChainINode` open question: any transport
    /// error from the KV layer propagates; a zero ref is only ever returned when the page or the
    /// chain entry is confirmed absent.
    pub async fn get_chain_inode(&self, base: INodeRef) -> Result<INodeRef> {
        let key = chain_key(base.volume, base.inode.page());
        let page = match self.kv.get(key.as_bytes()).await? {
            Some(v) => v,
            None => return Ok(INodeRef::zero(base.volume)),
        };
        let set: FileChainSet = codec::decode(&page.value)?;
        match set.chains.get(&base.inode.0) {
            Some(&inode) => Ok(INodeRef::new(base.volume, INodeId(inode))),
            None => Ok(INodeRef::zero(base.volume)),
        }
    }

    /// Compare-and-swap the chain pointer `base -> was` to `base -> new`. `new.is_zero()` deletes
    /// the chain entry. Fails with [`Error::CompareFailed`] — propagated immediately, not retried
    /// by [`Self::atomic_modify`] — when the chain's current target is not `was`; retrying that
    /// case is [`crate::chain::ChainEngine`]'s responsibility, since it must recompute `was`/`new`
    /// against a freshly re-read inode.
    pub async fn set_chain_inode(&self, base: INodeRef, was: INodeRef, new: INodeRef) -> Result<()> {
        let key = chain_key(base.volume, base.inode.page());
        self.atomic_modify(&key, |bytes| {
            let mut set: FileChainSet = match bytes {
                Some(b) => codec::decode(b)?,
                None => FileChainSet::default(),
            };
            let current = set.chains.get(&base.inode.0).copied().unwrap_or(0);
            if current != was.inode.0 {
                return Err(Error::CompareFailed);
            }
            if new.is_zero() {
                set.chains.remove(&base.inode.0);
            } else {
                set.chains.insert(base.inode.0, new.inode.0);
            }
            Ok((codec::encode(&set)?, ()))
        })
        .await
    }

    pub async fn get_inode_chains(&self, volume: VolumeId) -> Result<Vec<FileChainSet>> {
        let prefix = format!("{TABLE_CHAIN}:{}:", volume.to_hex());
        let scanned = self.kv.scan_prefix(prefix.as_bytes()).await?;
        scanned
            .into_iter()
            .map(|(_, v)| codec::decode(&v.value))
            .collect()
    }

    pub async fn get_volume_liveness(
        &self,
        volume: VolumeId,
    ) -> Result<(RoaringBitmap, Vec<RoaringBitmap>)> {
        let deadmap_key = format!("{TABLE_DEADMAP}:{}", volume.to_hex());
        let open_prefix = format!("{TABLE_OPEN}:{}:", volume.to_hex());
        let mut results = self
            .kv
            .txn_read(&[
                ReadOp::Get(deadmap_key.as_bytes()),
                ReadOp::ScanPrefix(open_prefix.as_bytes()),
            ])
            .await?
            .into_iter();
        let dead = match results.next().unwrap().into_value() {
            Some(v) => codec::bytes_to_bitmap(&v.value)?,
            None => RoaringBitmap::new(),
        };
        let mut open = Vec::new();
        for (_, v) in results.next().unwrap().into_scan() {
            open.push(codec::bytes_to_bitmap(&v.value)?);
        }
        Ok((dead, open))
    }

    /// Publishes (or, if `inodes` is `None`, revokes) the set of inodes `client` currently holds
    /// open on `volume`, under `lease`.
    pub async fn claim_volume_inodes(
        &self,
        lease: LeaseId,
        volume: VolumeId,
        client: Uuid,
        inodes: Option<&RoaringBitmap>,
    ) -> Result<()> {
        let key = open_key(volume, client);
        match inodes {
            None => self.kv.delete(key.as_bytes()).await,
            Some(bm) => {
                self.kv
                    .put_leased(key.as_bytes(), &codec::bitmap_to_bytes(bm), lease)
                    .await
            }
        }
    }

    pub async fn modify_dead_map(
        &self,
        volume: VolumeId,
        live: &RoaringBitmap,
        dead: &RoaringBitmap,
    ) -> Result<()> {
        let key = format!("{TABLE_DEADMAP}:{}", volume.to_hex());
        self.atomic_modify(&key, |bytes| {
            let mut bm = match bytes {
                Some(b) => codec::bytes_to_bitmap(b)?,
                None => RoaringBitmap::new(),
            };
            bm |= dead;
            bm -= live;
            Ok((codec::bitmap_to_bytes(&bm), ()))
        })
        .await
    }

    pub async fn grant_lease(&self, ttl: std::time::Duration) -> Result<LeaseId> {
        self.kv.grant_lease(ttl).await
    }

    pub async fn commit_inode_index(&self, volume: VolumeId) -> Result<INodeId> {
        let key = format!("{TABLE_VOLUME_INODE_MINTER}:{}", volume.to_hex());
        let id = self
            .atomic_modify(&key, |bytes| {
                let cur = match bytes {
                    Some(b) => codec::decode_u64(b)?,
                    None => 0,
                };
                let next = cur + 1;
                Ok((codec::encode_u64(next).to_vec(), next))
            })
            .await?;
        Ok(INodeId(id))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::kv::MemKv;

    fn store() -> FsMetaStore {
        FsMetaStore::new(Arc::new(MemKv::new()))
    }

    #[tokio::test]
    async fn create_vol_then_mkdir_then_getdir() {
        let s = store();
        let vol = s.create_fs_vol("v", VolumeKind::File).await.unwrap();
        assert_eq!(vol.0, 1);
        let dir = Path::new("v", "/a/");
        s.mkdir(&dir, Metadata::new(0o755, 0, 0, 1)).await.unwrap();
        let (got, subdirs, _) = s.getdir(&Path::root("v")).await.unwrap();
        assert!(got.files.is_empty());
        assert_eq!(subdirs, vec![dir.clone()]);
    }

    #[tokio::test]
    async fn mkdir_without_parent_fails() {
        let s = store();
        s.create_fs_vol("v", VolumeKind::File).await.unwrap();
        let err = s
            .mkdir(&Path::new("v", "/a/b/"), Metadata::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotExist);
    }

    #[tokio::test]
    async fn mkdir_twice_is_exists() {
        let s = store();
        s.create_fs_vol("v", VolumeKind::File).await.unwrap();
        let dir = Path::new("v", "/a/");
        s.mkdir(&dir, Metadata::default()).await.unwrap();
        let err = s.mkdir(&dir, Metadata::default()).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Exists);
    }

    #[tokio::test]
    async fn rmdir_requires_empty() {
        let s = store();
        s.create_fs_vol("v", VolumeKind::File).await.unwrap();
        let dir = Path::new("v", "/a/");
        s.mkdir(&dir, Metadata::default()).await.unwrap();
        s.mkdir(&Path::new("v", "/a/b/"), Metadata::default())
            .await
            .unwrap();
        assert!(s.rmdir(&dir).await.is_err());
        s.rmdir(&Path::new("v", "/a/b/")).await.unwrap();
        s.rmdir(&dir).await.unwrap();
        assert!(s.getdir(&dir).await.is_err());
    }

    #[tokio::test]
    async fn rmdir_root_is_invalid() {
        let s = store();
        s.create_fs_vol("v", VolumeKind::File).await.unwrap();
        let err = s.rmdir(&Path::root("v")).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Invalid);
    }

    #[tokio::test]
    async fn set_and_resolve_chain_inode() {
        let s = store();
        let vol = s.create_fs_vol("v", VolumeKind::File).await.unwrap();
        let base = INodeRef::new(vol, INodeId(5));
        assert!(s.get_chain_inode(base).await.unwrap().is_zero());
        s.set_chain_inode(base, INodeRef::zero(vol), INodeRef::new(vol, INodeId(5)))
            .await
            .unwrap();
        assert_eq!(s.get_chain_inode(base).await.unwrap().inode, INodeId(5));
        // Stale `was` is rejected.
        let err = s
            .set_chain_inode(base, INodeRef::zero(vol), INodeRef::new(vol, INodeId(6)))
            .await
            .unwrap_err();
        assert!(err.is_compare_failed());
    }

    #[tokio::test]
    async fn set_file_entry_round_trips_through_getdir() {
        let s = store();
        s.create_fs_vol("v", VolumeKind::File).await.unwrap();
        let file = Path::new("v", "/f");
        let old = s
            .set_file_entry(&file, FileEntry::chain(9))
            .await
            .unwrap();
        assert!(old.is_deleted());
        let got = s.file_entry_for_path(&file).await.unwrap();
        assert_eq!(got.chain, 9);
    }

    #[tokio::test]
    async fn claim_and_read_volume_liveness() {
        let s = store();
        let vol = s.create_fs_vol("v", VolumeKind::File).await.unwrap();
        let lease = s.grant_lease(std::time::Duration::from_secs(60)).await.unwrap();
        let mut bm = RoaringBitmap::new();
        bm.insert(5);
        s.claim_volume_inodes(lease, vol, Uuid::nil(), Some(&bm))
            .await
            .unwrap();
        let (dead, open) = s.get_volume_liveness(vol).await.unwrap();
        assert!(dead.is_empty());
        assert_eq!(open.len(), 1);
        assert!(open[0].contains(5));
    }
}
