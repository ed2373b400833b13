//! `MetaKv` — the external strongly-consistent KV service collaborator.
//! Out of scope for this crate proper; `latticefs` only specifies the trait boundary plus
//! an in-memory reference implementation ([`MemKv`]) used by the test suite and the demo CLI.
//! A production deployment supplies its own client (e.g. backed by etcd) implementing [`MetaKv`].

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A value together with the KV version it was read at, used to drive compare-and-swap.
#[derive(Debug, Clone)]
pub struct VersionedValue {
    pub value: Vec<u8>,
    pub version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaseId(pub u64);

/// One read in a multi-key read transaction (the "single Txn { Get(...), Get(...) }" pattern
/// used by `Getdir` and `GetVolumeLiveness`).
pub enum ReadOp<'a> {
    Get(&'a [u8]),
    ScanPrefix(&'a [u8]),
}

pub enum ReadResult {
    Value(Option<VersionedValue>),
    Scan(Vec<(Vec<u8>, VersionedValue)>),
}

impl ReadResult {
    pub fn into_value(self) -> Option<VersionedValue> {
        match self {
            ReadResult::Value(v) => v,
            ReadResult::Scan(_) => panic!("expected a Value read result, got a Scan"),
        }
    }

    pub fn into_scan(self) -> Vec<(Vec<u8>, VersionedValue)> {
        match self {
            ReadResult::Scan(v) => v,
            ReadResult::Value(_) => panic!("expected a Scan read result, got a Value"),
        }
    }
}

/// The multi-key transactional, lease-aware KV surface this layer is built on.
#[async_trait]
pub trait MetaKv: Send + Sync {
    async fn get(&self, key: &[u8]) -> Result<Option<VersionedValue>>;
    async fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;
    async fn put_leased(&self, key: &[u8], value: &[u8], lease: LeaseId) -> Result<()>;
    async fn delete(&self, key: &[u8]) -> Result<()>;
    async fn delete_prefix(&self, prefix: &[u8]) -> Result<()>;
    async fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, VersionedValue)>>;

    /// Executes several reads as a single linearizable snapshot.
    async fn txn_read(&self, ops: &[ReadOp<'_>]) -> Result<Vec<ReadResult>>;

    /// Writes `value` to `key` iff the key's current version equals `expect_version` (`None`
    /// means "key must not exist"). Returns whether the write took effect.
    async fn txn_check_and_put(
        &self,
        key: &[u8],
        expect_version: Option<u64>,
        value: &[u8],
    ) -> Result<bool>;

    /// Same as `txn_check_and_put`, but deletes the key instead of writing to it.
    async fn txn_check_and_delete(&self, key: &[u8], expect_version: Option<u64>) -> Result<bool>;

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId>;
}

struct Entry {
    value: Vec<u8>,
    version: u64,
    lease: Option<LeaseId>,
}

struct LeaseState {
    expires_at: Instant,
}

struct MemKvInner {
    data: HashMap<Vec<u8>, Entry>,
    next_lease: u64,
    leases: HashMap<LeaseId, LeaseState>,
}

/// An in-memory reference implementation of [`MetaKv`]. Not a production KV client: leases are
/// expired lazily on read rather than by a cluster-wide watch, and there is no persistence or
/// replication. Exists for the test suite and the `fuse` demo CLI.
pub struct MemKv {
    inner: Mutex<MemKvInner>,
}

impl Default for MemKv {
    fn default() -> Self {
        Self::new()
    }
}

impl MemKv {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemKvInner {
                data: HashMap::new(),
                next_lease: 1,
                leases: HashMap::new(),
            }),
        }
    }

    /// Test hook: force a lease to be considered expired, simulating a crashed client.
    pub fn expire_lease_for_test(&self, lease: LeaseId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(state) = inner.leases.get_mut(&lease) {
            state.expires_at = Instant::now() - Duration::from_secs(1);
        }
    }

    fn live_entry<'a>(inner: &'a MemKvInner, key: &[u8]) -> Option<&'a Entry> {
        let entry = inner.data.get(key)?;
        if let Some(lease) = entry.lease {
            let state = inner.leases.get(&lease)?;
            if state.expires_at <= Instant::now() {
                return None;
            }
        }
        Some(entry)
    }
}

#[async_trait]
impl MetaKv for MemKv {
    async fn get(&self, key: &[u8]) -> Result<Option<VersionedValue>> {
        let inner = self.inner.lock().unwrap();
        Ok(Self::live_entry(&inner, key).map(|e| VersionedValue {
            value: e.value.clone(),
            version: e.version,
        }))
    }

    async fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let version = inner.data.get(key).map(|e| e.version + 1).unwrap_or(1);
        inner.data.insert(
            key.to_vec(),
            Entry {
                value: value.to_vec(),
                version,
                lease: None,
            },
        );
        Ok(())
    }

    async fn put_leased(&self, key: &[u8], value: &[u8], lease: LeaseId) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.leases.contains_key(&lease) {
            return Err(Error::NoLease);
        }
        let version = inner.data.get(key).map(|e| e.version + 1).unwrap_or(1);
        inner.data.insert(
            key.to_vec(),
            Entry {
                value: value.to_vec(),
                version,
                lease: Some(lease),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.data.remove(key);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.data.retain(|k, _| !k.starts_with(prefix));
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, VersionedValue)>> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<_> = inner
            .data
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .filter_map(|(k, _)| {
                Self::live_entry(&inner, k).map(|e| {
                    (
                        k.clone(),
                        VersionedValue {
                            value: e.value.clone(),
                            version: e.version,
                        },
                    )
                })
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    async fn txn_read(&self, ops: &[ReadOp<'_>]) -> Result<Vec<ReadResult>> {
        let inner = self.inner.lock().unwrap();
        let mut out = Vec::with_capacity(ops.len());
        for op in ops {
            match op {
                ReadOp::Get(key) => {
                    let v = Self::live_entry(&inner, key).map(|e| VersionedValue {
                        value: e.value.clone(),
                        version: e.version,
                    });
                    out.push(ReadResult::Value(v));
                }
                ReadOp::ScanPrefix(prefix) => {
                    let mut scanned: Vec<_> = inner
                        .data
                        .iter()
                        .filter(|(k, _)| k.starts_with(*prefix))
                        .filter_map(|(k, _)| {
                            Self::live_entry(&inner, k).map(|e| {
                                (
                                    k.clone(),
                                    VersionedValue {
                                        value: e.value.clone(),
                                        version: e.version,
                                    },
                                )
                            })
                        })
                        .collect();
                    scanned.sort_by(|a, b| a.0.cmp(&b.0));
                    out.push(ReadResult::Scan(scanned));
                }
            }
        }
        Ok(out)
    }

    async fn txn_check_and_put(
        &self,
        key: &[u8],
        expect_version: Option<u64>,
        value: &[u8],
    ) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let current = Self::live_entry(&inner, key).map(|e| e.version);
        if current != expect_version {
            return Ok(false);
        }
        let version = current.unwrap_or(0) + 1;
        inner.data.insert(
            key.to_vec(),
            Entry {
                value: value.to_vec(),
                version,
                lease: None,
            },
        );
        Ok(true)
    }

    async fn txn_check_and_delete(&self, key: &[u8], expect_version: Option<u64>) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let current = Self::live_entry(&inner, key).map(|e| e.version);
        if current != expect_version {
            return Ok(false);
        }
        inner.data.remove(key);
        Ok(true)
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId> {
        let mut inner = self.inner.lock().unwrap();
        let id = LeaseId(inner.next_lease);
        inner.next_lease += 1;
        inner.leases.insert(
            id,
            LeaseState {
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(id)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn cas_guards_concurrent_writers() {
        let kv = MemKv::new();
        assert!(kv.txn_check_and_put(b"k", None, b"v1").await.unwrap());
        // A second "create" with the same expectation must fail: the key now exists.
        assert!(!kv.txn_check_and_put(b"k", None, b"v2").await.unwrap());
        let got = kv.get(b"k").await.unwrap().unwrap();
        assert_eq!(got.value, b"v1");
        assert!(kv
            .txn_check_and_put(b"k", Some(got.version), b"v2")
            .await
            .unwrap());
        assert_eq!(kv.get(b"k").await.unwrap().unwrap().value, b"v2");
    }

    #[tokio::test]
    async fn lease_expiry_hides_key() {
        let kv = MemKv::new();
        let lease = kv.grant_lease(Duration::from_secs(60)).await.unwrap();
        kv.put_leased(b"claim", b"1", lease).await.unwrap();
        assert!(kv.get(b"claim").await.unwrap().is_some());
        kv.expire_lease_for_test(lease);
        assert!(kv.get(b"claim").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn scan_prefix_is_ordered_and_scoped() {
        let kv = MemKv::new();
        kv.put(b"dirs:v:/a/", b"1").await.unwrap();
        kv.put(b"dirs:v:/a/b/", b"2").await.unwrap();
        kv.put(b"dirs:v:/z/", b"3").await.unwrap();
        let scanned = kv.scan_prefix(b"dirs:v:/a/").await.unwrap();
        assert_eq!(scanned.len(), 2);
        assert_eq!(scanned[0].0, b"dirs:v:/a/");
    }
}
