//! `ChainEngine` — the critical transaction at the heart of this layer.
//! Grounded on `examples/original_source/fs/fileinfo.go`'s `updateINodeChain` and
//! `file_metadata.go`'s `modFileMetadata`/`modDirMetadata`.

use crate::blocks::InodeStore;
use crate::codec::INode;
use crate::error::{Error, Result};
use crate::ids::{INodeId, INodeRef, VolumeId};
use crate::path::Path;
use crate::store::FsMetaStore;
use crate::telemetry::{NoopTelemetry, Telemetry};
use std::sync::Arc;
use tracing::trace;

/// What a chain-update closure wants to happen to the chain it was handed.
pub(crate) enum ModOutcome {
    /// Install `0` as the new head, referenced by `1`.
    Write(INode, INodeRef),
    /// Reject this attempt. `File::sync` is the only caller that ever returns this; it fetches
    /// the conflicting inode at `0` and retries with a last-write-wins merge.
    Abort(INodeRef),
}

/// Internal signal carried out of a chain-update closure. Kept distinct from [`Error`] so the
/// abort-and-retry path used by `File::sync` can never be mistaken for, or leak out as, a
/// user-visible error.
pub(crate) enum EngineSignal {
    Error(Error),
    Abort(INodeRef),
}

impl From<Error> for EngineSignal {
    fn from(e: Error) -> Self {
        EngineSignal::Error(e)
    }
}

type EngineResult<T> = std::result::Result<T, EngineSignal>;

/// Applies the write-once-inode / mutable-chain-pointer model on top of
/// [`FsMetaStore`] and an [`InodeStore`].
pub struct ChainEngine {
    store: Arc<FsMetaStore>,
    inodes: Arc<dyn InodeStore>,
    telemetry: Arc<dyn Telemetry>,
}

impl ChainEngine {
    pub fn new(store: Arc<FsMetaStore>, inodes: Arc<dyn InodeStore>) -> Self {
        Self {
            store,
            inodes,
            telemetry: Arc::new(NoopTelemetry),
        }
    }

    pub fn with_telemetry(
        store: Arc<FsMetaStore>,
        inodes: Arc<dyn InodeStore>,
        telemetry: Arc<dyn Telemetry>,
    ) -> Self {
        Self {
            store,
            inodes,
            telemetry,
        }
    }

    pub fn store(&self) -> &Arc<FsMetaStore> {
        &self.store
    }

    pub fn inodes(&self) -> &Arc<dyn InodeStore> {
        &self.inodes
    }

    /// The critical transaction. Reads the current chain head for `path` (if any), hands it to
    /// `f`, and CAS-installs whatever `f` decides. Retries transparently on
    /// [`Error::CompareFailed`] (someone else advanced the chain between our read and our write);
    /// surfaces [`EngineSignal::Abort`] to the caller otherwise, since only `File::sync`'s merge
    /// loop knows how to recover from a real conflict.
    pub(crate) async fn update_inode_chain<F>(
        &self,
        path: &Path,
        f: F,
    ) -> EngineResult<(INode, INodeRef)>
    where
        F: Fn(Option<&INode>, VolumeId) -> EngineResult<ModOutcome>,
    {
        let volume = self.store.get_volume_id(&path.volume).await?;
        let entry = match self.store.file_entry_for_path(path).await {
            Ok(entry) => {
                if entry.is_symlink() {
                    return Err(Error::IsSymlink.into());
                }
                Some(entry)
            }
            Err(Error::NotExist) => None,
            Err(e) => return Err(e.into()),
        };
        let chain_ref = INodeRef::new(
            volume,
            INodeId(entry.as_ref().map(|e| e.chain).unwrap_or(0)),
        );

        loop {
            let (inode, current_ref) = if chain_ref.is_zero() {
                (None, INodeRef::zero(volume))
            } else {
                let r = self.store.get_chain_inode(chain_ref).await?;
                let inode = if !r.is_zero() {
                    Some(self.inodes.get(r).await?)
                } else {
                    None
                };
                (inode, r)
            };

            match f(inode.as_ref(), volume)? {
                ModOutcome::Write(new_inode, new_ref) => {
                    let set_result = if chain_ref.is_zero() {
                        self.store
                            .set_chain_inode(new_ref, INodeRef::zero(volume), new_ref)
                            .await
                    } else {
                        self.store
                            .set_chain_inode(chain_ref, current_ref, new_ref)
                            .await
                    };
                    match set_result {
                        Ok(()) => {
                            self.inodes.write(new_ref, &new_inode).await?;
                            return Ok((new_inode, current_ref));
                        }
                        Err(e) if e.is_compare_failed() => {
                            trace!(%path, "chain head moved under us, retrying");
                            self.telemetry.cas_retry("update_inode_chain");
                            continue;
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                ModOutcome::Abort(conflict) => return Err(EngineSignal::Abort(conflict)),
            }
        }
    }

    /// Collapses an [`EngineResult`] into a plain [`Result`] for callers whose modify closure
    /// never returns [`ModOutcome::Abort`] (every caller except `File::sync`).
    pub(crate) fn no_abort<T>(r: EngineResult<T>) -> Result<T> {
        match r {
            Ok(v) => Ok(v),
            Err(EngineSignal::Error(e)) => Err(e),
            Err(EngineSignal::Abort(_)) => {
                unreachable!("this modify closure never returns ModOutcome::Abort")
            }
        }
    }

    /// Versions the inode at `path` by applying `f` to its permissions, leaving filesize,
    /// filenames and blocks untouched (grounded on `modFileMetadata`).
    pub async fn mod_file_metadata<F>(&self, path: &Path, f: F) -> Result<()>
    where
        F: Fn(&mut crate::codec::Metadata),
    {
        let volume = self.store.get_volume_id(&path.volume).await?;
        let new_id = self.store.commit_inode_index(volume).await?;
        let result = self
            .update_inode_chain(path, |inode, vol| match inode {
                None => Err(Error::NotExist.into()),
                Some(inode) => {
                    let mut updated = inode.clone();
                    f(&mut updated.permissions);
                    updated.inode = new_id.0;
                    Ok(ModOutcome::Write(updated, INodeRef::new(vol, new_id)))
                }
            })
            .await;
        Self::no_abort(result).map(|_| ())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::blocks::MemInodeStore;
    use crate::codec::{FileEntry, Metadata, VolumeKind};
    use crate::kv::MemKv;

    fn engine() -> ChainEngine {
        let store = Arc::new(FsMetaStore::new(Arc::new(MemKv::new())));
        ChainEngine::new(store, Arc::new(MemInodeStore::new()))
    }

    async fn make_file(engine: &ChainEngine, path: &Path) -> INodeRef {
        let volume = engine.store.get_volume_id(&path.volume).await.unwrap();
        let id = engine.store.commit_inode_index(volume).await.unwrap();
        let new_ref = INodeRef::new(volume, id);
        let inode = INode {
            inode: id.0,
            chain: id.0,
            filesize: 0,
            permissions: Metadata::new(0o644, 0, 0, 1),
            filenames: vec![path.path.clone()],
            blocks: vec![],
        };
        engine
            .update_inode_chain(path, |existing, vol| {
                assert!(existing.is_none());
                Ok(ModOutcome::Write(inode.clone(), INodeRef::new(vol, id)))
            })
            .await
            .map_err(|_| ())
            .unwrap();
        engine
            .store
            .set_file_entry(path, FileEntry::chain(id.0))
            .await
            .unwrap();
        new_ref
    }

    #[tokio::test]
    async fn first_write_establishes_chain_at_its_own_id() {
        let engine = engine();
        engine
            .store
            .create_fs_vol("v", VolumeKind::File)
            .await
            .unwrap();
        let path = Path::new("v", "/f");
        let r = make_file(&engine, &path).await;
        let head = engine.store.get_chain_inode(r).await.unwrap();
        assert_eq!(head, r, "a freshly created chain points at itself");
    }

    #[tokio::test]
    async fn mod_file_metadata_versions_the_inode() {
        let engine = engine();
        engine
            .store
            .create_fs_vol("v", VolumeKind::File)
            .await
            .unwrap();
        let path = Path::new("v", "/f");
        let original = make_file(&engine, &path).await;

        engine
            .mod_file_metadata(&path, |md| md.mode = 0o600)
            .await
            .unwrap();

        let entry = engine.store.file_entry_for_path(&path).await.unwrap();
        let head = engine
            .store
            .get_chain_inode(INodeRef::new(original.volume, INodeId(entry.chain)))
            .await
            .unwrap();
        let inode = engine.inodes.get(head).await.unwrap();
        assert_eq!(inode.permissions.mode, 0o600);
        assert_ne!(inode.inode, original.inode.0, "metadata change mints a new inode version");
    }

    #[tokio::test]
    async fn mod_file_metadata_on_missing_file_is_not_exist() {
        let engine = engine();
        engine
            .store
            .create_fs_vol("v", VolumeKind::File)
            .await
            .unwrap();
        let err = engine
            .mod_file_metadata(&Path::new("v", "/missing"), |_| {})
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotExist);
    }
}
