//! `MetaCodec` — bit-exact encoding/decoding of keys and values.
//!
//! Fixed-width integers use big-endian byte order; schema-evolving records (`Directory`,
//! `FileEntry`, `INode`, `FileChainSet`, `Volume`, `Metadata`) are encoded with `serde` +
//! `bincode`, which is deterministic for a fixed Rust type and round-trips exactly (testable
//! property 6). Bitmaps use the `roaring` crate's own serialized container format directly.

use crate::error::{Error, Result};
use roaring::RoaringBitmap;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;

/// Encodes a `u64` as 8-byte big-endian.
pub fn encode_u64(v: u64) -> [u8; 8] {
    v.to_be_bytes()
}

/// Decodes a big-endian `u64`. Fails with [`Error::Codec`] on malformed input.
pub fn decode_u64(b: &[u8]) -> Result<u64> {
    let arr: [u8; 8] = b
        .try_into()
        .map_err(|_| Error::Codec(format!("expected 8 bytes for u64, got {}", b.len())))?;
    Ok(u64::from_be_bytes(arr))
}

/// Serializes any record type to its on-disk bytes.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| Error::Codec(e.to_string()))
}

/// Deserializes a record type from its on-disk bytes.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| Error::Codec(e.to_string()))
}

pub fn bitmap_to_bytes(bm: &RoaringBitmap) -> Vec<u8> {
    let mut buf = Vec::new();
    // RoaringBitmap's own serialization never fails for an in-memory writer.
    bm.serialize_into(&mut buf).expect("serialize into Vec cannot fail");
    buf
}

pub fn bytes_to_bitmap(bytes: &[u8]) -> Result<RoaringBitmap> {
    if bytes.is_empty() {
        return Ok(RoaringBitmap::new());
    }
    RoaringBitmap::deserialize_from(bytes).map_err(|e| Error::Codec(e.to_string()))
}

/// Per-file attributes shared by directories and inodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub ctime: u64,
    pub mtime: u64,
    pub atime: u64,
}

impl Metadata {
    pub fn new(mode: u32, uid: u32, gid: u32, now: u64) -> Self {
        Self {
            mode,
            uid,
            gid,
            ctime: now,
            mtime: now,
            atime: now,
        }
    }
}

/// Per-filename pointer record inside a directory. Invariant: at most one of
/// `{chain != 0, sympath non-empty}` is set; both zero/empty means the entry is deleted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub chain: u64,
    pub sympath: String,
}

impl FileEntry {
    pub fn chain(chain: u64) -> Self {
        Self {
            chain,
            sympath: String::new(),
        }
    }

    pub fn symlink(target: impl Into<String>) -> Self {
        Self {
            chain: 0,
            sympath: target.into(),
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.chain == 0 && self.sympath.is_empty()
    }

    pub fn is_symlink(&self) -> bool {
        !self.sympath.is_empty()
    }
}

/// A directory is the unit of readdir and of per-file metadata-entry storage. Invariant: a
/// directory key exists iff the directory exists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Directory {
    pub metadata: Metadata,
    pub files: HashMap<String, FileEntry>,
}

impl Default for Metadata {
    fn default() -> Self {
        Metadata {
            mode: 0,
            uid: 0,
            gid: 0,
            ctime: 0,
            mtime: 0,
            atime: 0,
        }
    }
}

impl Directory {
    pub fn new(metadata: Metadata) -> Self {
        Self {
            metadata,
            files: HashMap::new(),
        }
    }
}

/// An immutable record describing one version of a file's contents. Invariant: `inode >= chain`;
/// for a freshly-created file, `inode == chain`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct INode {
    pub inode: u64,
    pub chain: u64,
    pub filesize: u64,
    pub permissions: Metadata,
    pub filenames: Vec<String>,
    /// Opaque block-set bytes; marshalling is owned by the (out-of-scope) block storage plane.
    pub blocks: Vec<u8>,
}

/// The mapping stored in one chain page: `chainHeadINodeID -> currentINodeID`, batched 1000
/// entries per page sharing `chainHeadINodeID / 1000`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileChainSet {
    pub chains: HashMap<u64, u64>,
}

/// Volume kind discriminant. Only `File` volumes are meaningfully exercised by this layer; the
/// discriminant exists on the wire so [`crate::gc::GcOracle`] can correctly no-op on the other
/// kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeKind {
    File,
    Block,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    pub id: u64,
    pub name: String,
    pub kind: VolumeKind,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn u64_round_trip() {
        let b = encode_u64(0xdeadbeefu64);
        assert_eq!(decode_u64(&b).unwrap(), 0xdeadbeefu64);
    }

    #[test]
    fn directory_round_trip() {
        let mut dir = Directory::new(Metadata::new(0o755, 0, 0, 1000));
        dir.files.insert("f".into(), FileEntry::chain(5));
        let bytes = encode(&dir).unwrap();
        let back: Directory = decode(&bytes).unwrap();
        assert_eq!(dir, back);
    }

    #[test]
    fn inode_round_trip() {
        let inode = INode {
            inode: 7,
            chain: 5,
            filesize: 4096,
            permissions: Metadata::new(0o644, 0, 0, 1000),
            filenames: vec!["/a/f".into()],
            blocks: vec![1, 2, 3],
        };
        let bytes = encode(&inode).unwrap();
        let back: INode = decode(&bytes).unwrap();
        assert_eq!(inode, back);
    }

    #[test]
    fn chain_set_round_trip() {
        let mut set = FileChainSet::default();
        set.chains.insert(5, 7);
        let bytes = encode(&set).unwrap();
        let back: FileChainSet = decode(&bytes).unwrap();
        assert_eq!(set, back);
    }

    #[test]
    fn volume_round_trip() {
        let v = Volume {
            id: 1,
            name: "vol".into(),
            kind: VolumeKind::File,
        };
        let bytes = encode(&v).unwrap();
        let back: Volume = decode(&bytes).unwrap();
        assert_eq!(v, back);
    }

    #[test]
    fn bitmap_round_trip() {
        let mut bm = RoaringBitmap::new();
        bm.insert(1);
        bm.insert(1000);
        let bytes = bitmap_to_bytes(&bm);
        let back = bytes_to_bitmap(&bytes).unwrap();
        assert_eq!(bm, back);
    }

    #[test]
    fn empty_bitmap_bytes_round_trip() {
        let bm = RoaringBitmap::new();
        let bytes = bitmap_to_bytes(&bm);
        let back = bytes_to_bitmap(&bytes).unwrap();
        assert_eq!(bm, back);
    }
}
