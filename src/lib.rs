//! `latticefs` — a POSIX-shaped metadata and concurrency layer over a strongly-consistent,
//! lease-capable key-value service, for content-addressed storage planes that need a filesystem
//! surface without owning file contents themselves.
//!
//! Layering, outside in:
//! - [`path`] / [`codec`] — pure key derivation and wire encoding, no I/O.
//! - [`kv`] — the external `MetaKv` collaborator this crate is built on ([`kv::MemKv`] for tests).
//! - [`blocks`] — the external block storage collaborator ([`blocks::MemInodeStore`] for tests).
//! - [`store`] — [`store::FsMetaStore`], the KV-key schema and metadata operation table.
//! - [`chain`] — [`chain::ChainEngine`], the write-once-inode / mutable-chain-pointer transaction.
//! - [`file`] — [`file::FileHandle`] and the multi-writer merge performed on `sync`.
//! - [`liveness`] — [`liveness::LivenessTracker`], this client's open-inode claim publisher.
//! - [`gc`] — [`gc::GcOracle`], the dead-block/dead-inode liveness oracles a GC pass consults.
//! - [`cache`] — [`cache::BlockCache`], a fixed-capacity LRU for hot blocks.
//! - [`api`] — [`api::FsApi`], the [`api::PosixFs`] surface tying the above together.
//! - [`telemetry`] — the counter/retry observability seam.
//! - [`error`] — the crate-wide [`error::Error`] taxonomy.
//! - [`ids`] — newtype identifiers shared by every layer.

pub mod api;
pub mod blocks;
pub mod cache;
pub mod chain;
pub mod codec;
pub mod error;
pub mod file;
pub mod gc;
pub mod ids;
pub mod kv;
pub mod liveness;
pub mod path;
pub mod store;
pub mod telemetry;

pub use api::{FileHandleId, FileInfo, FsApi, PosixFs};
pub use error::{Error, ErrorKind, Result};
pub use ids::{INodeId, INodeRef, VolumeId};
pub use path::Path;
