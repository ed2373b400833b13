//! The block storage plane — the other external collaborator; marshalling the `blocks` field of
//! an `INode` is owned by the out-of-scope block storage plane. This module specifies the two
//! trait boundaries `latticefs` needs from it — [`InodeStore`] (persist/fetch whole inode
//! records) and [`BlockSet`] (what one record's data keeps alive) — plus in-memory reference
//! implementations of both, used by the test suite and the `fuse` demo CLI.

use crate::codec::INode;
use crate::error::{Error, Result};
use crate::ids::INodeRef;
use async_trait::async_trait;
use dashmap::DashMap;
use roaring::RoaringBitmap;

/// Content-addressed storage and retrieval of whole immutable inode records. `latticefs` never
/// interprets the block layout inside [`crate::codec::INode::blocks`] — it only needs to persist
/// and fetch one `INode` per [`INodeRef`].
#[async_trait]
pub trait InodeStore: Send + Sync {
    async fn get(&self, r: INodeRef) -> Result<crate::codec::INode>;
    async fn write(&self, r: INodeRef, inode: &crate::codec::INode) -> Result<()>;

    /// Best-effort reclamation hint: the caller (a GC oracle) has determined `r` is
    /// unreachable. A conforming store may ignore this entirely; the in-memory reference
    /// implementation actually frees the entry.
    async fn forget(&self, r: INodeRef) -> Result<()>;
}

/// An in-memory reference implementation of [`InodeStore`]. Exists for the test suite and the
/// `fuse` demo CLI; a production deployment points at the real content-addressed block service.
#[derive(Default)]
pub struct MemInodeStore {
    records: DashMap<INodeRef, crate::codec::INode>,
}

impl MemInodeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Derives the set of block-level inode ids a file's data keeps alive from the opaque `blocks`
/// bytes on one of its [`INode`] versions. Kept distinct from [`InodeStore`]: `InodeStore`
/// persists whole inode records, while `BlockSet` answers "what does this one record's data
/// depend on" — the question liveness tracking and dead-map population actually need answered,
/// since two inode versions can share block-level storage via copy-on-write even though they are
/// different [`INodeRef`]s.
pub trait BlockSet: Send + Sync {
    /// The block-level inode ids `inode`'s data depends on. Always includes `inode.inode` itself.
    fn live_inodes(&self, inode: &INode) -> RoaringBitmap;
}

/// A trivial reference implementation: the opaque `blocks` blob carries no block-level structure
/// here, so the only live id is the inode's own. Sufficient for the in-memory test/demo path,
/// where `blocks` stays empty; a production `BlockSet` would decode `blocks` into the actual
/// per-chunk inode references the real block storage plane hands back.
#[derive(Default)]
pub struct FlatBlockSet;

impl BlockSet for FlatBlockSet {
    fn live_inodes(&self, inode: &INode) -> RoaringBitmap {
        let mut bm = RoaringBitmap::new();
        bm.insert(inode.inode as u32);
        bm
    }
}

#[async_trait]
impl InodeStore for MemInodeStore {
    async fn get(&self, r: INodeRef) -> Result<crate::codec::INode> {
        self.records
            .get(&r)
            .map(|entry| entry.value().clone())
            .ok_or(Error::NotExist)
    }

    async fn write(&self, r: INodeRef, inode: &crate::codec::INode) -> Result<()> {
        self.records.insert(r, inode.clone());
        Ok(())
    }

    async fn forget(&self, r: INodeRef) -> Result<()> {
        self.records.remove(&r);
        Ok(())
    }
}
