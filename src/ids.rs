//! Identifiers: [`VolumeId`], [`INodeId`], [`INodeRef`], [`BlockRef`].
//!
//! Newtypes over `u64`, not bare integers, so the type system catches volume/inode confusion at
//! compile time (grounded on the `Ino` newtype pattern used throughout the kiseki-fs meta engine
//! reference material).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Minted by atomic increment of the `meta:volumeminter` counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VolumeId(pub u64);

impl VolumeId {
    /// The 16-hex-digit zero-padded lowercase form used in KV keys (`<volHex>`).
    pub fn to_hex(self) -> String {
        format!("{:016x}", self.0)
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vol:{}", self.0)
    }
}

/// Monotonically minted per volume. Zero means "absent".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct INodeId(pub u64);

impl INodeId {
    pub const ZERO: INodeId = INodeId(0);

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Chain pages batch 1000 entries sharing `id / 1000`.
    pub const PAGE_SIZE: u64 = 1000;

    pub fn page(self) -> u64 {
        self.0 / Self::PAGE_SIZE
    }
}

impl fmt::Display for INodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ino:{}", self.0)
    }
}

/// Identifies one immutable inode record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct INodeRef {
    pub volume: VolumeId,
    pub inode: INodeId,
}

impl INodeRef {
    pub const fn new(volume: VolumeId, inode: INodeId) -> Self {
        Self { volume, inode }
    }

    pub fn zero(volume: VolumeId) -> Self {
        Self::new(volume, INodeId::ZERO)
    }

    pub fn is_zero(&self) -> bool {
        self.inode.is_zero()
    }
}

impl fmt::Display for INodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.volume, self.inode)
    }
}

/// Discriminant on a [`BlockRef`]; only `INode` is consumed by this layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockType {
    INode,
    Data,
}

/// A reference into the (out-of-scope) block storage plane. Carries a block-type discriminant
/// and a block index in addition to the inode bits; only the inode bits matter here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRef {
    pub volume: VolumeId,
    pub inode: INodeId,
    pub block_type: BlockType,
    pub index: u32,
}

impl BlockRef {
    pub fn for_inode(r: INodeRef, index: u32) -> Self {
        Self {
            volume: r.volume,
            inode: r.inode,
            block_type: BlockType::Data,
            index,
        }
    }

    pub fn inode_record(r: INodeRef) -> Self {
        Self {
            volume: r.volume,
            inode: r.inode,
            block_type: BlockType::INode,
            index: 0,
        }
    }
}
