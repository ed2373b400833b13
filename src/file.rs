//! `FileHandle` and the multi-writer merge performed by [`FileHandle::sync`].
//! Grounded on `examples/original_source/fs/file.go`'s `File.Sync` — "Here there be dragons" in
//! the source, because it is the one place concurrent writers to the same chain actually race
//! each other and must merge rather than simply retry.
//!
//! [`ClaimPublisher`] exists to break the reference cycle a direct `FileHandle -> FsApi` link
//! would create: `FileHandle` only needs "tell someone my open-inode set changed", not the rest
//! of `FsApi`'s surface.

use crate::blocks::BlockSet;
use crate::chain::{ChainEngine, EngineSignal, ModOutcome};
use crate::codec::{FileEntry, INode};
use crate::error::Result;
use crate::ids::{INodeId, INodeRef, VolumeId};
use crate::path::Path;
use async_trait::async_trait;
use roaring::RoaringBitmap;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, trace};

/// Callback `FileHandle` uses to report a change in the set of inodes it holds live, so the
/// owning `FsApi`'s [`crate::liveness::LivenessTracker`] can be updated and republished without
/// `FileHandle` holding a reference back to it.
#[async_trait]
pub trait ClaimPublisher: Send + Sync {
    async fn update_held_inodes(&self, volume: VolumeId, old: &RoaringBitmap, new: &RoaringBitmap) -> Result<()>;
}

/// An open file. One `FileHandle` per `open()` call; `write_open` tracks whether this handle has
/// unflushed writes that `sync` needs to commit.
pub struct FileHandle {
    pub path: Path,
    pub volume: VolumeId,
    /// The inode version this handle will write on its next `sync`. Mutated by writes in between
    /// syncs (filesize, blocks, permissions as the caller edits them).
    pub inode: INode,
    pub write_open: bool,
    /// The inode id this handle expects to be replacing. `0` means "no expectation — overwrite
    /// whatever is there" (e.g. an `O_TRUNC` open); nonzero pins the write to a specific prior
    /// version, so a concurrent writer's intervening change is detected as a conflict.
    pub replaces: u64,
    /// Fields this handle explicitly changed out-of-band (e.g. `"mode"` via `chmod` on an open
    /// file) and which must survive a merge even though the rest of the record is rebased onto
    /// the conflicting writer's version.
    pub changed: HashSet<&'static str>,
    initial_inodes: RoaringBitmap,
    block_set: Arc<dyn BlockSet>,
}

impl FileHandle {
    pub fn new(path: Path, volume: VolumeId, inode: INode, replaces: u64, block_set: Arc<dyn BlockSet>) -> Self {
        let initial_inodes = block_set.live_inodes(&inode);
        Self {
            path,
            volume,
            inode,
            write_open: false,
            replaces,
            changed: HashSet::new(),
            initial_inodes,
            block_set,
        }
    }

    /// The set of inodes this handle currently depends on, per its [`BlockSet`] — matching the
    /// source's `Blocks.GetLiveINodes()`, which can report block-level references shared with
    /// older versions via copy-on-write, not just the handle's own inode id.
    fn live_inodes(&self, inode: &INode) -> RoaringBitmap {
        self.block_set.live_inodes(inode)
    }

    /// Commits this handle's pending write, or — if nothing is pending — just republishes the
    /// liveness claim. On a concurrent-writer conflict, rebases the pending write onto the
    /// conflicting version (last-write-wins on content, explicitly-changed fields preserved) and
    /// retries, rather than failing the caller's `sync()`.
    pub async fn sync(&mut self, engine: &ChainEngine, publisher: &dyn ClaimPublisher) -> Result<()> {
        if !self.write_open {
            let empty = RoaringBitmap::new();
            publisher.update_held_inodes(self.volume, &self.initial_inodes, &empty).await?;
            self.initial_inodes = empty;
            return Ok(());
        }

        trace!(path = %self.path, "syncing file");
        let mut candidate = self.inode.clone();

        let (written, replaced_ref) = loop {
            let replaces = self.replaces;
            let write_ref = INodeRef::new(self.volume, INodeId(candidate.inode));
            let attempt = candidate.clone();
            let result = engine
                .update_inode_chain(&self.path, |existing, vol| match existing {
                    None => {
                        let mut c = attempt.clone();
                        if replaces != 0 {
                            c.chain = c.inode;
                        }
                        Ok(ModOutcome::Write(c, write_ref))
                    }
                    Some(existing) if existing.chain != attempt.chain => {
                        Ok(ModOutcome::Write(attempt.clone(), write_ref))
                    }
                    Some(existing) if replaces == 0 || replaces == existing.inode => {
                        Ok(ModOutcome::Write(attempt.clone(), write_ref))
                    }
                    Some(existing) => Ok(ModOutcome::Abort(INodeRef::new(vol, INodeId(existing.inode)))),
                })
                .await;

            match result {
                Ok((written, old_ref)) => break (written, old_ref),
                Err(EngineSignal::Abort(conflict)) => {
                    debug!(path = %self.path, "sync: concurrent writer, merging");
                    let theirs = engine.inodes().get(conflict).await?;
                    self.replaces = theirs.inode;
                    let mut merged = theirs;
                    merged.inode = candidate.inode;
                    merged.chain = candidate.chain;
                    merged.blocks = candidate.blocks.clone();
                    merged.filesize = candidate.filesize;
                    if self.changed.contains("mode") {
                        merged.permissions.mode = candidate.permissions.mode;
                    }
                    candidate = merged;
                }
                Err(EngineSignal::Error(e)) => return Err(e),
            }
        };

        engine
            .store()
            .set_file_entry(&self.path, FileEntry::chain(written.chain))
            .await?;

        let new_live = self.live_inodes(&written);
        let mut dead = &self.initial_inodes - &new_live;
        if !replaced_ref.is_zero() && self.replaces == 0 {
            // We overwrote a still-live chain target unconditionally (an O_TRUNC-style write):
            // that old version is now unreachable too.
            let dead_inode = engine.inodes().get(replaced_ref).await?;
            dead.insert(dead_inode.inode as u32);
            dead -= &new_live;
        }
        engine.store().modify_dead_map(self.volume, &new_live, &dead).await?;

        publisher.update_held_inodes(self.volume, &self.initial_inodes, &new_live).await?;
        self.initial_inodes = new_live;

        self.inode = written;
        // The version we just wrote becomes the baseline the next sync expects to replace.
        self.replaces = self.inode.inode;
        self.changed.clear();
        self.write_open = false;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::blocks::{FlatBlockSet, MemInodeStore};
    use crate::codec::{Metadata, VolumeKind};
    use crate::kv::MemKv;
    use crate::store::FsMetaStore;
    use std::sync::{Arc, Mutex as StdMutex};

    #[derive(Default)]
    struct RecordingPublisher {
        calls: StdMutex<Vec<(RoaringBitmap, RoaringBitmap)>>,
    }

    #[async_trait]
    impl ClaimPublisher for RecordingPublisher {
        async fn update_held_inodes(&self, _volume: VolumeId, old: &RoaringBitmap, new: &RoaringBitmap) -> Result<()> {
            self.calls.lock().unwrap().push((old.clone(), new.clone()));
            Ok(())
        }
    }

    fn sample_inode(id: u64, chain: u64, filesize: u64) -> INode {
        INode {
            inode: id,
            chain,
            filesize,
            permissions: Metadata::new(0o644, 0, 0, 1),
            filenames: vec!["/f".into()],
            blocks: vec![],
        }
    }

    async fn setup() -> (ChainEngine, VolumeId, Path) {
        let store = Arc::new(FsMetaStore::new(Arc::new(MemKv::new())));
        let vol = store.create_fs_vol("v", VolumeKind::File).await.unwrap();
        let engine = ChainEngine::new(store, Arc::new(MemInodeStore::new()));
        (engine, vol, Path::new("v", "/f"))
    }

    #[tokio::test]
    async fn uncontended_sync_writes_and_publishes_claim() {
        let (engine, vol, path) = setup().await;
        let id = engine.store().commit_inode_index(vol).await.unwrap();
        let mut handle = FileHandle::new(path.clone(), vol, sample_inode(id.0, id.0, 0), 0, Arc::new(FlatBlockSet));
        handle.write_open = true;
        handle.inode.filesize = 4096;

        let publisher = RecordingPublisher::default();
        handle.sync(&engine, &publisher).await.unwrap();

        let entry = engine.store().file_entry_for_path(&path).await.unwrap();
        assert_eq!(entry.chain, id.0);
        let head = engine
            .inodes()
            .get(INodeRef::new(vol, id))
            .await
            .unwrap();
        assert_eq!(head.filesize, 4096);
        assert_eq!(publisher.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_writer_triggers_merge_not_failure() {
        let (engine, vol, path) = setup().await;
        let id = engine.store().commit_inode_index(vol).await.unwrap();
        let base = sample_inode(id.0, id.0, 0);
        // Install the initial version directly, as if some other writer already synced it.
        engine
            .update_inode_chain(&path, |_, v| {
                Ok(ModOutcome::Write(base.clone(), INodeRef::new(v, id)))
            })
            .await
            .map_err(|_| ())
            .unwrap();
        engine
            .store()
            .set_file_entry(&path, FileEntry::chain(id.0))
            .await
            .unwrap();

        // A second writer versions the chain without our handle's knowledge.
        let their_id = engine.store().commit_inode_index(vol).await.unwrap();
        let mut their_inode = base.clone();
        their_inode.inode = their_id.0;
        their_inode.filesize = 10;
        engine
            .update_inode_chain(&path, |_, v| {
                Ok(ModOutcome::Write(their_inode.clone(), INodeRef::new(v, their_id)))
            })
            .await
            .map_err(|_| ())
            .unwrap();
        engine
            .store()
            .set_file_entry(&path, FileEntry::chain(id.0))
            .await
            .unwrap();

        // Our handle still expects to replace the original `id`, not `their_id`.
        let our_id = engine.store().commit_inode_index(vol).await.unwrap();
        let mut handle = FileHandle::new(
            path.clone(),
            vol,
            sample_inode(our_id.0, id.0, 0),
            id.0,
            Arc::new(FlatBlockSet),
        );
        handle.write_open = true;
        handle.inode.filesize = 99;

        let publisher = RecordingPublisher::default();
        handle.sync(&engine, &publisher).await.unwrap();

        // Our content (filesize) won the merge; their other fields (filenames) were kept.
        assert_eq!(handle.inode.filesize, 99);
        assert_eq!(handle.replaces, their_id.0);
        let entry = engine.store().file_entry_for_path(&path).await.unwrap();
        let head = engine
            .inodes()
            .get(INodeRef::new(vol, our_id))
            .await
            .unwrap();
        assert_eq!(head.filesize, 99);
        let _ = entry;
    }

    #[tokio::test]
    async fn non_writing_sync_only_republishes_claim() {
        let (engine, vol, path) = setup().await;
        let id = engine.store().commit_inode_index(vol).await.unwrap();
        let mut handle = FileHandle::new(path, vol, sample_inode(id.0, id.0, 0), 0, Arc::new(FlatBlockSet));
        let publisher = RecordingPublisher::default();
        handle.sync(&engine, &publisher).await.unwrap();
        assert_eq!(publisher.calls.lock().unwrap().len(), 1);
    }
}
