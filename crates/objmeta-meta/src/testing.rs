//! Fault-injecting cache and store wrappers for tests.

use async_trait::async_trait;
use objmeta_cache::{CacheKey, CacheStore, CacheTable, MemoryCache};
use objmeta_common::{
    Bucket, Error, LifeCycle, Result, ScanHiddenBucketsResult, ScanLifeCycleResult,
};
use objmeta_meta_store::{BucketSnapshot, MetaStore, PersistentStore, UsageUpdateReport};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::Notify;

pub fn open_store() -> (TempDir, MetaStore) {
    let dir = TempDir::new().unwrap();
    let store = MetaStore::open(dir.path().join("meta.redb")).unwrap();
    (dir, store)
}

/// Cache command family that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    Read,
    Write,
    Remove,
    Incr,
    AddMember,
    Members,
    RemoveMembers,
    Keys,
}

/// [`MemoryCache`] with switchable per-command failures
pub struct FlakyCache {
    inner: MemoryCache,
    faults: Mutex<HashSet<Fault>>,
    hide_keys: AtomicBool,
}

impl FlakyCache {
    pub fn new(inner: MemoryCache) -> Self {
        Self {
            inner,
            faults: Mutex::new(HashSet::new()),
            hide_keys: AtomicBool::new(false),
        }
    }

    /// Make key listings come back empty while the keys stay readable
    pub fn hide_keys(&self) {
        self.hide_keys.store(true, Ordering::SeqCst);
    }

    pub fn fail(&self, fault: Fault) {
        self.faults.lock().unwrap().insert(fault);
    }

    pub fn heal(&self) {
        self.faults.lock().unwrap().clear();
    }

    /// Simulate an engine restart without persistence
    pub fn wipe(&self) {
        self.inner.clear();
    }

    fn check(&self, fault: Fault) -> Result<()> {
        if self.faults.lock().unwrap().contains(&fault) {
            return Err(Error::ConnectionFailed(format!("injected {fault:?} failure")));
        }
        Ok(())
    }
}

#[async_trait]
impl CacheStore for FlakyCache {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn get_fields(&self, key: &CacheKey) -> Result<Option<HashMap<String, String>>> {
        self.check(Fault::Read)?;
        self.inner.get_fields(key).await
    }

    async fn set_fields(&self, key: &CacheKey, fields: &HashMap<String, String>) -> Result<()> {
        self.check(Fault::Write)?;
        self.inner.set_fields(key, fields).await
    }

    async fn remove(&self, key: &CacheKey) -> Result<()> {
        self.check(Fault::Remove)?;
        self.inner.remove(key).await
    }

    async fn exists(&self, key: &CacheKey) -> Result<bool> {
        self.check(Fault::Read)?;
        self.inner.exists(key).await
    }

    async fn incr_field(&self, key: &CacheKey, field: &str, delta: i64) -> Result<i64> {
        self.check(Fault::Incr)?;
        self.inner.incr_field(key, field, delta).await
    }

    async fn get_field_int(&self, key: &CacheKey, field: &str) -> Result<Option<i64>> {
        self.check(Fault::Read)?;
        self.inner.get_field_int(key, field).await
    }

    async fn set_field_if_absent(
        &self,
        key: &CacheKey,
        field: &str,
        value: &str,
    ) -> Result<bool> {
        self.check(Fault::Write)?;
        self.inner.set_field_if_absent(key, field, value).await
    }

    async fn add_member(&self, set: &CacheKey, member: &str) -> Result<u64> {
        self.check(Fault::AddMember)?;
        self.inner.add_member(set, member).await
    }

    async fn get_all_members(&self, set: &CacheKey) -> Result<HashMap<String, u64>> {
        self.check(Fault::Members)?;
        self.inner.get_all_members(set).await
    }

    async fn remove_members(&self, set: &CacheKey, members: &[String]) -> Result<usize> {
        self.check(Fault::RemoveMembers)?;
        self.inner.remove_members(set, members).await
    }

    async fn remove_members_if_unchanged(
        &self,
        set: &CacheKey,
        members: &[(String, u64)],
    ) -> Result<Vec<String>> {
        self.check(Fault::RemoveMembers)?;
        self.inner.remove_members_if_unchanged(set, members).await
    }

    async fn keys(&self, table: CacheTable, pattern: &str) -> Result<Vec<String>> {
        self.check(Fault::Keys)?;
        if self.hide_keys.load(Ordering::SeqCst) {
            return Ok(Vec::new());
        }
        self.inner.keys(table, pattern).await
    }
}

/// Pauses the next usage write until released
#[derive(Default)]
pub struct Gate {
    pub reached: Notify,
    pub release: Notify,
}

/// [`MetaStore`] with call counting, global failure, per-bucket usage
/// write failures and rows that read back as undecodable
pub struct FlakyStore {
    inner: MetaStore,
    failing: AtomicBool,
    failing_usage: Mutex<HashSet<String>>,
    corrupt: Mutex<HashSet<String>>,
    gate: Mutex<Option<Arc<Gate>>>,
    pub bucket_reads: AtomicUsize,
    pub usage_writes: AtomicUsize,
}

impl FlakyStore {
    pub fn new(inner: MetaStore) -> Self {
        Self {
            inner,
            failing: AtomicBool::new(false),
            failing_usage: Mutex::new(HashSet::new()),
            corrupt: Mutex::new(HashSet::new()),
            gate: Mutex::new(None),
            bucket_reads: AtomicUsize::new(0),
            usage_writes: AtomicUsize::new(0),
        }
    }

    /// Fail every call while set
    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Fail usage writes of one bucket until healed
    pub fn fail_usage(&self, bucket: &str) {
        self.failing_usage.lock().unwrap().insert(bucket.to_string());
    }

    pub fn heal_usage(&self) {
        self.failing_usage.lock().unwrap().clear();
    }

    /// Make a bucket row fail to decode on every read and usage write
    pub fn corrupt(&self, bucket: &str) {
        self.corrupt.lock().unwrap().insert(bucket.to_string());
    }

    fn is_corrupt(&self, bucket: &str) -> bool {
        self.corrupt.lock().unwrap().contains(bucket)
    }

    fn check_decodable(&self, bucket: &str) -> Result<()> {
        if self.is_corrupt(bucket) {
            return Err(Error::Deserialization(format!("injected bad row for {bucket}")));
        }
        Ok(())
    }

    /// Hold the next usage write until `release` is notified
    pub fn install_gate(&self) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        *self.gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::ServiceUnavailable("injected store failure".into()));
        }
        Ok(())
    }

    fn check_usage(&self, bucket: &str) -> Result<()> {
        self.check()?;
        self.check_decodable(bucket)?;
        if self.failing_usage.lock().unwrap().contains(bucket) {
            return Err(Error::ServiceUnavailable(format!(
                "injected usage failure for {bucket}"
            )));
        }
        Ok(())
    }

    async fn pass_gate(&self) {
        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.reached.notify_one();
            gate.release.notified().await;
        }
    }
}

#[async_trait]
impl PersistentStore for FlakyStore {
    async fn get_bucket(&self, name: &str) -> Result<Bucket> {
        self.check()?;
        self.bucket_reads.fetch_add(1, Ordering::SeqCst);
        self.check_decodable(name)?;
        self.inner.get_bucket(name).await
    }

    async fn snapshot_buckets(&self) -> Result<BucketSnapshot> {
        self.check()?;
        let mut snapshot = self.inner.snapshot_buckets().await?;
        let (bad, good): (Vec<Bucket>, Vec<Bucket>) = snapshot
            .buckets
            .into_iter()
            .partition(|b| self.is_corrupt(&b.name));
        snapshot.buckets = good;
        snapshot.undecodable.extend(bad.into_iter().map(|b| b.name));
        Ok(snapshot)
    }

    async fn put_bucket(&self, bucket: &Bucket) -> Result<()> {
        self.check()?;
        self.inner.put_bucket(bucket).await
    }

    async fn delete_bucket(&self, name: &str) -> Result<()> {
        self.check()?;
        self.inner.delete_bucket(name).await
    }

    async fn get_user_buckets(&self, uid: &str) -> Result<Vec<String>> {
        self.check()?;
        self.inner.get_user_buckets(uid).await
    }

    async fn update_usage(&self, name: &str, usage: i64) -> Result<()> {
        self.pass_gate().await;
        self.check_usage(name)?;
        self.usage_writes.fetch_add(1, Ordering::SeqCst);
        self.inner.update_usage(name, usage).await
    }

    async fn update_usages(&self, usages: &HashMap<String, i64>) -> Result<UsageUpdateReport> {
        self.pass_gate().await;
        self.check()?;
        let (failing, passing): (HashMap<_, _>, HashMap<_, _>) = {
            let failing_usage = self.failing_usage.lock().unwrap();
            usages
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .partition(|(k, _)| failing_usage.contains(k) || self.is_corrupt(k))
        };
        self.usage_writes.fetch_add(passing.len(), Ordering::SeqCst);
        let mut report = self.inner.update_usages(&passing).await?;
        report.failed.extend(failing.into_keys().map(|name| {
            let err = if self.is_corrupt(&name) {
                Error::Deserialization(format!("injected bad row for {name}"))
            } else {
                Error::ServiceUnavailable(format!("injected usage failure for {name}"))
            };
            (name, err)
        }));
        Ok(report)
    }

    async fn put_lifecycle(&self, lifecycle: &LifeCycle) -> Result<()> {
        self.check()?;
        self.inner.put_lifecycle(lifecycle).await
    }

    async fn remove_lifecycle(&self, bucket_name: &str) -> Result<()> {
        self.check()?;
        self.inner.remove_lifecycle(bucket_name).await
    }

    async fn scan_lifecycle(&self, limit: usize, marker: &str) -> Result<ScanLifeCycleResult> {
        self.check()?;
        self.inner.scan_lifecycle(limit, marker).await
    }

    async fn scan_hidden_buckets(
        &self,
        limit: usize,
        marker: &str,
    ) -> Result<ScanHiddenBucketsResult> {
        self.check()?;
        self.inner.scan_hidden_buckets(limit, marker).await
    }
}
