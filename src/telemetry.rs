//! Structured observability hooks. The source logs through `capnslog` package loggers
//! (`clog.Tracef`, `clog.Debugf`, `clog.Error`) sprinkled through every operation; this crate
//! uses `tracing` spans and events the same way throughout (`cache.rs`, `store.rs`, `chain.rs`).
//! `Telemetry` is the one seam a production deployment can hook counters into without this crate
//! depending on a specific metrics backend, matching how the source isolates its
//! `prometheus.GaugeVec`/`CounterVec` registrations to a handful of call sites.

use crate::ids::VolumeId;

pub trait Telemetry: Send + Sync {
    /// A `[crate::chain::ChainEngine::update_inode_chain]` CAS attempt lost the race and retried.
    fn cas_retry(&self, op: &str) {
        let _ = op;
    }

    /// A `[crate::store::FsMetaStore::atomic_modify]` write lost the race and retried.
    fn atomic_modify_retry(&self, table: &str) {
        let _ = table;
    }

    /// A GC pass over `volume` reclaimed `count` blocks.
    fn gc_reclaimed(&self, volume: VolumeId, count: u64) {
        let _ = (volume, count);
    }

    /// `File::sync` hit a concurrent-writer conflict and ran its last-write-wins merge.
    fn sync_merge(&self, volume: VolumeId) {
        let _ = volume;
    }
}

/// The default: every hook is a no-op. Exists so call sites don't need an `Option<dyn
/// Telemetry>` check at every instrumentation point.
#[derive(Default, Clone, Copy)]
pub struct NoopTelemetry;

impl Telemetry for NoopTelemetry {}
