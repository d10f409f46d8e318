//! Write-back bucket usage accounting.
//!
//! Deltas are applied to a counter hash in the cache (`usage:<bucket>`) and
//! the bucket is marked in the dirty set. A periodic flush copies the current
//! counter values into the store.
//!
//! Each dirty mark bumps a per-member stamp. The flush captures the stamps
//! before reading counter values and later removes only the members whose
//! stamp is unchanged, so an increment that lands mid-flush keeps its bucket
//! dirty for the next cycle.

use crate::metrics::{UsageMetrics, UsageStage};
use objmeta_cache::{CacheKey, CacheStore, CacheTable};
use objmeta_common::{Bucket, CacheEntity, FIELD_NAME_USAGE, RequestContext, Result};
use objmeta_meta_store::PersistentStore;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{Instrument, debug, error, info, warn};

/// Default threshold above which an `update_usage` stage is reported slow
pub const DEFAULT_SLOW_THRESHOLD: Duration = Duration::from_millis(100);

/// Outcome of one flush cycle
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FlushReport {
    /// Buckets whose usage was persisted
    pub flushed: usize,
    /// Buckets that stay dirty for the next cycle
    pub failed: usize,
    /// Dirty marks dropped because the bucket or its counter is gone
    pub dropped: usize,
}

/// Outcome of startup reconciliation
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Counters seeded from the store
    pub seeded: usize,
    /// Cached counters persisted to the store
    pub flushed: usize,
    /// Cached counters that could not be persisted and were marked dirty
    pub failed: usize,
    /// Counters removed because their bucket no longer exists
    pub dropped: usize,
}

/// Clears the in-progress flag when the flush ends, however it ends
struct FlushGuard<'a>(&'a AtomicBool);

impl<'a> FlushGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Usage accountant over a cache and the persistent store
pub struct UsageAccountant {
    cache: Arc<dyn CacheStore>,
    store: Arc<dyn PersistentStore>,
    metrics: Arc<UsageMetrics>,
    slow_threshold: Duration,
    flushing: AtomicBool,
}

impl UsageAccountant {
    pub fn new(cache: Arc<dyn CacheStore>, store: Arc<dyn PersistentStore>) -> Self {
        Self {
            cache,
            store,
            metrics: Arc::new(UsageMetrics::new()),
            slow_threshold: DEFAULT_SLOW_THRESHOLD,
            flushing: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<UsageMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    #[must_use]
    pub const fn with_slow_threshold(mut self, threshold: Duration) -> Self {
        self.slow_threshold = threshold;
        self
    }

    pub fn metrics(&self) -> &Arc<UsageMetrics> {
        &self.metrics
    }

    /// True while a flush cycle is running
    pub fn is_flushing(&self) -> bool {
        self.flushing.load(Ordering::Acquire)
    }

    async fn timed<T>(
        &self,
        bucket: &str,
        stage: UsageStage,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let start = Instant::now();
        let result = fut.await;
        let elapsed = start.elapsed();
        if elapsed > self.slow_threshold {
            warn!(
                bucket,
                stage = stage.as_str(),
                elapsed_ms = elapsed.as_millis() as u64,
                "slow usage update stage"
            );
            self.metrics.record_slow_stage(stage);
        }
        result
    }

    // ---- Increments ----

    /// Apply `delta` bytes to the cached usage of `bucket` and mark it dirty.
    ///
    /// Fails if the counter cannot be seeded or incremented, or the bucket
    /// cannot be marked dirty. A timed-out call may still have been applied.
    pub async fn update_usage(&self, ctx: &RequestContext, bucket: &str, delta: i64) -> Result<()> {
        let result = self.apply_delta(bucket, delta).instrument(ctx.span()).await;
        match &result {
            Ok(()) => self.metrics.record_increment(),
            Err(e) => {
                self.metrics.record_increment_failure();
                let _entered = ctx.span().entered();
                error!(bucket, delta, error = %e, "usage update failed");
            }
        }
        result
    }

    async fn apply_delta(&self, bucket: &str, delta: i64) -> Result<()> {
        let key = CacheKey::usage(bucket);

        let seeded = self.cache.exists(&key).await?;
        if !seeded {
            self.timed(bucket, UsageStage::Seed, self.seed_counter(bucket))
                .await?;
        }

        let usage = self
            .timed(
                bucket,
                UsageStage::Increment,
                self.cache.incr_field(&key, FIELD_NAME_USAGE, delta),
            )
            .await?;
        if usage < 0 {
            warn!(bucket, delta, usage, "bucket usage went negative");
            self.metrics.record_negative_usage();
        }

        let stamp = self
            .timed(
                bucket,
                UsageStage::MarkDirty,
                self.cache.add_member(&CacheKey::usage_trigger(), bucket),
            )
            .await?;
        debug!(bucket, delta, usage, stamp, "usage updated");
        Ok(())
    }

    /// Load the persisted usage into an absent counter.
    ///
    /// Returns the persisted value. A concurrent seeder or incrementer that
    /// got there first wins; the counter is never overwritten.
    async fn seed_counter(&self, bucket: &str) -> Result<i64> {
        let persisted = self.store.get_bucket(bucket).await?.usage;
        let inserted = self
            .cache
            .set_field_if_absent(
                &CacheKey::usage(bucket),
                FIELD_NAME_USAGE,
                &persisted.to_string(),
            )
            .await?;
        if inserted {
            debug!(bucket, usage = persisted, "seeded usage counter");
        }
        Ok(persisted)
    }

    /// Current usage of `bucket`, including deltas not yet flushed.
    ///
    /// Seeds the counter from the store when it is absent. If the cache
    /// cannot be read the persisted value is returned.
    pub async fn get_usage(&self, ctx: &RequestContext, bucket: &str) -> Result<i64> {
        async {
            let key = CacheKey::usage(bucket);
            match self.cache.get_field_int(&key, FIELD_NAME_USAGE).await {
                Ok(Some(usage)) => return Ok(usage),
                Ok(None) => {}
                Err(e) => {
                    warn!(bucket, error = %e, "usage counter unreadable, using persisted usage");
                    return Ok(self.store.get_bucket(bucket).await?.usage);
                }
            }

            let persisted = self.seed_counter(bucket).await?;
            // Re-read: an increment may have landed right after seeding
            match self.cache.get_field_int(&key, FIELD_NAME_USAGE).await {
                Ok(Some(usage)) => Ok(usage),
                Ok(None) => Ok(persisted),
                Err(e) => {
                    warn!(bucket, error = %e, "usage counter unreadable after seeding");
                    Ok(persisted)
                }
            }
        }
        .instrument(ctx.span())
        .await
    }

    // ---- Flush ----

    /// Persist the cached usage of every dirty bucket.
    ///
    /// Returns `Ok(None)` without doing anything when another flush is in
    /// progress. Per-bucket failures leave the bucket dirty and are counted in
    /// the report; only failing to read the dirty set fails the cycle.
    pub async fn sync_dirty_usages(&self, ctx: &RequestContext) -> Result<Option<FlushReport>> {
        let Some(_guard) = FlushGuard::acquire(&self.flushing) else {
            self.metrics.record_flush_skipped();
            let _entered = ctx.span().entered();
            debug!("flush already in progress, skipping");
            return Ok(None);
        };
        let report = self.flush_dirty().instrument(ctx.span()).await?;
        self.metrics
            .record_flush(report.flushed, report.failed, report.dropped);
        Ok(Some(report))
    }

    async fn flush_dirty(&self) -> Result<FlushReport> {
        let trigger = CacheKey::usage_trigger();
        let dirty = self.cache.get_all_members(&trigger).await?;
        let mut report = FlushReport::default();
        if dirty.is_empty() {
            return Ok(report);
        }
        debug!(count = dirty.len(), "flushing dirty bucket usages");

        let mut persisted: Vec<(String, u64)> = Vec::with_capacity(dirty.len());
        let mut stale: Vec<(String, u64)> = Vec::new();
        let mut deleted: Vec<String> = Vec::new();

        for (bucket, stamp) in dirty {
            let key = CacheKey::usage(&bucket);
            let usage = match self.cache.get_field_int(&key, FIELD_NAME_USAGE).await {
                Ok(Some(usage)) => usage,
                Ok(None) => {
                    warn!(bucket = %bucket, "dirty bucket has no usage counter, dropping mark");
                    stale.push((bucket, stamp));
                    continue;
                }
                Err(e) => {
                    warn!(bucket = %bucket, error = %e, "failed to read usage counter");
                    report.failed += 1;
                    continue;
                }
            };

            match self.store.update_usage(&bucket, usage).await {
                Ok(()) => persisted.push((bucket, stamp)),
                Err(e) if e.is_not_found() => {
                    info!(bucket = %bucket, usage, "bucket no longer exists, dropping usage counter");
                    if let Err(e) = self.cache.remove(&key).await {
                        warn!(bucket = %bucket, error = %e, "failed to remove usage counter");
                    }
                    deleted.push(bucket);
                }
                Err(e) => {
                    warn!(bucket = %bucket, usage, error = %e, "failed to persist usage");
                    report.failed += 1;
                }
            }
        }

        report.flushed = persisted.len();
        if !persisted.is_empty() {
            match self
                .cache
                .remove_members_if_unchanged(&trigger, &persisted)
                .await
            {
                Ok(removed) if removed.len() < persisted.len() => debug!(
                    redirtied = persisted.len() - removed.len(),
                    "buckets updated during flush stay dirty"
                ),
                Ok(_) => {}
                // Persisting is idempotent, the next cycle writes them again
                Err(e) => warn!(error = %e, "failed to clear dirty marks"),
            }
        }

        if !stale.is_empty() {
            match self.cache.remove_members_if_unchanged(&trigger, &stale).await {
                Ok(removed) => report.dropped += removed.len(),
                Err(e) => warn!(error = %e, "failed to clear stale dirty marks"),
            }
        }

        if !deleted.is_empty() {
            match self.cache.remove_members(&trigger, &deleted).await {
                Ok(_) => report.dropped += deleted.len(),
                Err(e) => warn!(error = %e, "failed to clear dirty marks of deleted buckets"),
            }
        }

        info!(
            flushed = report.flushed,
            failed = report.failed,
            dropped = report.dropped,
            "usage flush complete"
        );
        Ok(report)
    }

    // ---- Startup reconciliation ----

    /// Bring cache and store into agreement after a restart.
    ///
    /// Counters already in the cache win over the store and are persisted;
    /// buckets without a counter are seeded from the store. Counters whose
    /// bucket is gone from the store are removed.
    pub async fn init_usage_cache(&self, ctx: &RequestContext) -> Result<ReconcileReport> {
        let report = self.reconcile().instrument(ctx.span()).await?;
        self.metrics
            .record_reconcile(report.seeded, report.flushed, report.dropped);
        Ok(report)
    }

    async fn reconcile(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let trigger = CacheKey::usage_trigger();

        let snapshot = self.store.snapshot_buckets().await?;
        let undecodable: HashSet<String> = snapshot.undecodable.into_iter().collect();
        let mut needs_seeding: HashMap<String, Bucket> = snapshot
            .buckets
            .into_iter()
            .map(|b| (b.name.clone(), b))
            .collect();
        // Stamps first: a mark added after this point must survive
        let dirty = self.cache.get_all_members(&trigger).await?;
        let keys = self
            .cache
            .keys(CacheTable::Bucket, &CacheKey::usage_pattern())
            .await?;

        let mut to_flush: HashMap<String, i64> = HashMap::new();
        let mut cached: HashMap<String, Bucket> = HashMap::new();
        let mut kept_dirty: Vec<String> = Vec::new();
        for key in &keys {
            let Some(name) = CacheKey::usage_bucket_name(key) else {
                continue;
            };
            if undecodable.contains(name) {
                // The row exists; keep its counter for a later flush
                warn!(bucket = name, "bucket row undecodable, keeping usage counter dirty");
                kept_dirty.push(name.to_string());
                continue;
            }
            if !needs_seeding.contains_key(name) {
                info!(bucket = name, "usage counter for unknown bucket, removing");
                self.drop_counter(name).await;
                report.dropped += 1;
                continue;
            }
            match self
                .cache
                .get_field_int(&CacheKey::usage(name), FIELD_NAME_USAGE)
                .await
            {
                Ok(Some(usage)) => {
                    to_flush.insert(name.to_string(), usage);
                }
                // Counter vanished between listing and reading
                Ok(None) => continue,
                Err(e) => {
                    warn!(bucket = name, error = %e, "failed to read usage counter");
                    kept_dirty.push(name.to_string());
                }
            }
            if let Some(bucket) = needs_seeding.remove(name) {
                cached.insert(name.to_string(), bucket);
            }
        }

        for (name, bucket) in &needs_seeding {
            match self
                .cache
                .set_field_if_absent(
                    &CacheKey::usage(name),
                    FIELD_NAME_USAGE,
                    &bucket.usage.to_string(),
                )
                .await
            {
                Ok(true) => {
                    report.seeded += 1;
                    self.warm_entity(bucket).await;
                }
                // An update seeded it after the key listing
                Ok(false) => debug!(bucket = %name, "usage counter already present"),
                // Left unseeded; the first update seeds it lazily
                Err(e) => warn!(bucket = %name, error = %e, "failed to seed usage counter"),
            }
        }

        let mut redirty: Vec<String> = kept_dirty;
        if !to_flush.is_empty() {
            match self.store.update_usages(&to_flush).await {
                Ok(outcome) => {
                    let clear: Vec<(String, u64)> = outcome
                        .updated
                        .iter()
                        .filter_map(|name| dirty.get(name).map(|stamp| (name.clone(), *stamp)))
                        .collect();
                    report.flushed = outcome.updated.len();
                    if !clear.is_empty() {
                        if let Err(e) =
                            self.cache.remove_members_if_unchanged(&trigger, &clear).await
                        {
                            warn!(error = %e, "failed to clear dirty marks after reconciliation");
                        }
                    }
                    for (name, e) in outcome.failed {
                        if e.is_not_found() {
                            self.drop_counter(&name).await;
                            report.dropped += 1;
                        } else {
                            warn!(bucket = %name, error = %e, "failed to persist cached usage");
                            redirty.push(name);
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "failed to persist cached usages");
                    redirty.extend(to_flush.keys().cloned());
                }
            }
        }

        for name in &redirty {
            if let Err(e) = self.cache.add_member(&trigger, name).await {
                error!(bucket = %name, error = %e, "failed to mark bucket dirty");
            }
        }
        report.failed = redirty.len();

        for (name, usage) in &to_flush {
            if let Some(bucket) = cached.remove(name) {
                self.warm_entity(&bucket.with_usage(*usage)).await;
            }
        }

        info!(
            seeded = report.seeded,
            flushed = report.flushed,
            failed = report.failed,
            dropped = report.dropped,
            "usage cache initialized"
        );
        Ok(report)
    }

    async fn drop_counter(&self, bucket: &str) {
        if let Err(e) = self.cache.remove(&CacheKey::usage(bucket)).await {
            warn!(bucket, error = %e, "failed to remove usage counter");
        }
        if let Err(e) = self
            .cache
            .remove_members(&CacheKey::usage_trigger(), &[bucket.to_string()])
            .await
        {
            warn!(bucket, error = %e, "failed to clear dirty mark");
        }
    }

    async fn warm_entity(&self, bucket: &Bucket) {
        let fields = match bucket.to_fields() {
            Ok(fields) => fields,
            Err(e) => {
                warn!(bucket = %bucket.name, error = %e, "failed to encode bucket");
                return;
            }
        };
        if let Err(e) = self
            .cache
            .set_fields(&CacheKey::bucket(&bucket.name), &fields)
            .await
        {
            debug!(bucket = %bucket.name, error = %e, "failed to warm bucket entity");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Fault, FlakyCache, FlakyStore, open_store};
    use objmeta_cache::MemoryCache;
    use objmeta_common::Error;

    struct Fixture {
        _dir: tempfile::TempDir,
        cache: Arc<FlakyCache>,
        store: Arc<FlakyStore>,
        accountant: Arc<UsageAccountant>,
    }

    async fn fixture(buckets: &[(&str, i64)]) -> Fixture {
        let (dir, meta) = open_store();
        let cache = Arc::new(FlakyCache::new(MemoryCache::new()));
        let store = Arc::new(FlakyStore::new(meta));
        for (name, usage) in buckets {
            store
                .put_bucket(&Bucket::new(*name, "owner", 1).with_usage(*usage))
                .await
                .unwrap();
        }
        let accountant = Arc::new(UsageAccountant::new(cache.clone(), store.clone()));
        Fixture {
            _dir: dir,
            cache,
            store,
            accountant,
        }
    }

    async fn persisted(store: &FlakyStore, name: &str) -> i64 {
        store.get_bucket(name).await.unwrap().usage
    }

    async fn dirty(cache: &FlakyCache) -> HashMap<String, u64> {
        cache.get_all_members(&CacheKey::usage_trigger()).await.unwrap()
    }

    async fn counter(cache: &FlakyCache, name: &str) -> Option<i64> {
        cache
            .get_field_int(&CacheKey::usage(name), FIELD_NAME_USAGE)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_update_seeds_then_flush_persists() {
        let fx = fixture(&[("photos", 100)]).await;
        let ctx = RequestContext::new();

        fx.accountant.update_usage(&ctx, "photos", 5).await.unwrap();
        assert_eq!(counter(&fx.cache, "photos").await, Some(105));
        assert_eq!(fx.accountant.get_usage(&ctx, "photos").await.unwrap(), 105);
        assert_eq!(persisted(&fx.store, "photos").await, 100);
        assert!(dirty(&fx.cache).await.contains_key("photos"));

        let report = fx.accountant.sync_dirty_usages(&ctx).await.unwrap().unwrap();
        assert_eq!(report, FlushReport { flushed: 1, failed: 0, dropped: 0 });
        assert_eq!(persisted(&fx.store, "photos").await, 105);
        assert!(dirty(&fx.cache).await.is_empty());
        assert_eq!(fx.accountant.metrics().increments(), 1);
    }

    #[tokio::test]
    async fn test_update_unknown_bucket_fails() {
        let fx = fixture(&[]).await;
        let err = fx
            .accountant
            .update_usage(&RequestContext::new(), "missing", 5)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BucketNotFound(_)));
        assert_eq!(counter(&fx.cache, "missing").await, None);
        assert!(dirty(&fx.cache).await.is_empty());
        assert_eq!(fx.accountant.metrics().increment_failures(), 1);
    }

    #[tokio::test]
    async fn test_empty_flush_is_a_no_op() {
        let fx = fixture(&[("photos", 1)]).await;
        let report = fx
            .accountant
            .sync_dirty_usages(&RequestContext::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report, FlushReport::default());
        assert_eq!(fx.store.usage_writes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_sum_into_store() {
        let fx = fixture(&[("aaa", 0), ("bbb", 1_000)]).await;

        let mut handles = Vec::new();
        for i in 0..16 {
            let accountant = Arc::clone(&fx.accountant);
            handles.push(tokio::spawn(async move {
                let ctx = RequestContext::new();
                let bucket = if i % 2 == 0 { "aaa" } else { "bbb" };
                for _ in 0..50 {
                    accountant.update_usage(&ctx, bucket, 3).await.unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let ctx = RequestContext::new();
        let report = fx.accountant.sync_dirty_usages(&ctx).await.unwrap().unwrap();
        assert_eq!(report.flushed, 2);
        assert_eq!(persisted(&fx.store, "aaa").await, 8 * 50 * 3);
        assert_eq!(persisted(&fx.store, "bbb").await, 1_000 + 8 * 50 * 3);
    }

    #[tokio::test]
    async fn test_repeated_flush_never_double_counts() {
        let fx = fixture(&[("photos", 10)]).await;
        let ctx = RequestContext::new();
        fx.accountant.update_usage(&ctx, "photos", 7).await.unwrap();

        fx.accountant.sync_dirty_usages(&ctx).await.unwrap();
        // the same value written again leaves the store unchanged
        fx.store.update_usage("photos", 17).await.unwrap();
        fx.accountant.update_usage(&ctx, "photos", 0).await.unwrap();
        fx.accountant.sync_dirty_usages(&ctx).await.unwrap();
        assert_eq!(persisted(&fx.store, "photos").await, 17);
    }

    #[tokio::test]
    async fn test_failed_persist_keeps_bucket_dirty() {
        let fx = fixture(&[("aaa", 0), ("bbb", 0)]).await;
        let ctx = RequestContext::new();
        fx.accountant.update_usage(&ctx, "aaa", 4).await.unwrap();
        fx.accountant.update_usage(&ctx, "bbb", 6).await.unwrap();

        fx.store.fail_usage("aaa");
        let report = fx.accountant.sync_dirty_usages(&ctx).await.unwrap().unwrap();
        assert_eq!(report, FlushReport { flushed: 1, failed: 1, dropped: 0 });
        assert_eq!(persisted(&fx.store, "aaa").await, 0);
        assert_eq!(persisted(&fx.store, "bbb").await, 6);
        let marks = dirty(&fx.cache).await;
        assert!(marks.contains_key("aaa"));
        assert!(!marks.contains_key("bbb"));

        fx.store.heal_usage();
        let report = fx.accountant.sync_dirty_usages(&ctx).await.unwrap().unwrap();
        assert_eq!(report.flushed, 1);
        assert_eq!(persisted(&fx.store, "aaa").await, 4);
        assert!(dirty(&fx.cache).await.is_empty());
    }

    #[tokio::test]
    async fn test_increment_during_flush_stays_dirty() {
        let fx = fixture(&[("photos", 0)]).await;
        let ctx = RequestContext::new();
        fx.accountant.update_usage(&ctx, "photos", 10).await.unwrap();

        let gate = fx.store.install_gate();
        let accountant = Arc::clone(&fx.accountant);
        let flush = tokio::spawn(async move {
            accountant
                .sync_dirty_usages(&RequestContext::background("test-flush"))
                .await
        });

        // the flush has read the counter and is about to persist it
        gate.reached.notified().await;
        fx.accountant.update_usage(&ctx, "photos", 5).await.unwrap();
        gate.release.notify_one();

        let report = flush.await.unwrap().unwrap().unwrap();
        assert_eq!(report.flushed, 1);
        assert_eq!(persisted(&fx.store, "photos").await, 10);
        assert!(dirty(&fx.cache).await.contains_key("photos"));

        fx.accountant.sync_dirty_usages(&ctx).await.unwrap();
        assert_eq!(persisted(&fx.store, "photos").await, 15);
        assert!(dirty(&fx.cache).await.is_empty());
    }

    #[tokio::test]
    async fn test_overlapping_flush_is_skipped() {
        let fx = fixture(&[("photos", 0)]).await;
        let ctx = RequestContext::new();
        fx.accountant.update_usage(&ctx, "photos", 1).await.unwrap();

        let gate = fx.store.install_gate();
        let accountant = Arc::clone(&fx.accountant);
        let flush = tokio::spawn(async move {
            accountant
                .sync_dirty_usages(&RequestContext::background("test-flush"))
                .await
        });
        gate.reached.notified().await;

        assert!(fx.accountant.is_flushing());
        assert!(fx.accountant.sync_dirty_usages(&ctx).await.unwrap().is_none());
        assert_eq!(fx.accountant.metrics().flush_skipped(), 1);

        gate.release.notify_one();
        assert!(flush.await.unwrap().unwrap().is_some());
        assert!(!fx.accountant.is_flushing());
    }

    #[tokio::test]
    async fn test_mark_dirty_failure_aborts_update() {
        let fx = fixture(&[("photos", 0)]).await;
        let ctx = RequestContext::new();
        fx.cache.fail(Fault::AddMember);

        assert!(fx.accountant.update_usage(&ctx, "photos", 3).await.is_err());
        assert_eq!(fx.accountant.metrics().increment_failures(), 1);
        assert_eq!(fx.accountant.metrics().increments(), 0);
    }

    #[tokio::test]
    async fn test_increment_failure_leaves_no_dirty_mark() {
        let fx = fixture(&[("photos", 0)]).await;
        let ctx = RequestContext::new();
        fx.cache.fail(Fault::Incr);

        assert!(fx.accountant.update_usage(&ctx, "photos", 3).await.is_err());
        fx.cache.heal();
        assert!(dirty(&fx.cache).await.is_empty());
    }

    #[tokio::test]
    async fn test_dirty_set_read_failure_fails_flush() {
        let fx = fixture(&[("photos", 0)]).await;
        let ctx = RequestContext::new();
        fx.accountant.update_usage(&ctx, "photos", 3).await.unwrap();

        fx.cache.fail(Fault::Members);
        assert!(fx.accountant.sync_dirty_usages(&ctx).await.is_err());
        assert!(!fx.accountant.is_flushing());

        fx.cache.heal();
        let report = fx.accountant.sync_dirty_usages(&ctx).await.unwrap().unwrap();
        assert_eq!(report.flushed, 1);
    }

    #[tokio::test]
    async fn test_balanced_deltas_never_go_negative() {
        let fx = fixture(&[("photos", 0)]).await;
        let ctx = RequestContext::new();
        for delta in [10, -10, 7, 3, -3, -7] {
            fx.accountant.update_usage(&ctx, "photos", delta).await.unwrap();
            assert!(fx.accountant.get_usage(&ctx, "photos").await.unwrap() >= 0);
        }
        assert_eq!(fx.accountant.get_usage(&ctx, "photos").await.unwrap(), 0);
        assert_eq!(fx.accountant.metrics().negative_usages(), 0);

        fx.accountant.update_usage(&ctx, "photos", -1).await.unwrap();
        assert_eq!(fx.accountant.metrics().negative_usages(), 1);
    }

    #[tokio::test]
    async fn test_flush_drops_deleted_bucket() {
        let fx = fixture(&[("photos", 0)]).await;
        let ctx = RequestContext::new();
        fx.accountant.update_usage(&ctx, "photos", 3).await.unwrap();
        fx.store.delete_bucket("photos").await.unwrap();

        let report = fx.accountant.sync_dirty_usages(&ctx).await.unwrap().unwrap();
        assert_eq!(report, FlushReport { flushed: 0, failed: 0, dropped: 1 });
        assert_eq!(counter(&fx.cache, "photos").await, None);
        assert!(dirty(&fx.cache).await.is_empty());
    }

    #[tokio::test]
    async fn test_get_usage_seeds_and_falls_back() {
        let fx = fixture(&[("photos", 42)]).await;
        let ctx = RequestContext::new();

        assert_eq!(fx.accountant.get_usage(&ctx, "photos").await.unwrap(), 42);
        assert_eq!(counter(&fx.cache, "photos").await, Some(42));
        // reads never mark a bucket dirty
        assert!(dirty(&fx.cache).await.is_empty());

        fx.cache.fail(Fault::Read);
        assert_eq!(fx.accountant.get_usage(&ctx, "photos").await.unwrap(), 42);
        assert!(fx.accountant.get_usage(&ctx, "missing").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_lost_counter_is_reseeded() {
        let fx = fixture(&[("photos", 0)]).await;
        let ctx = RequestContext::new();
        fx.accountant.update_usage(&ctx, "photos", 8).await.unwrap();
        fx.accountant.sync_dirty_usages(&ctx).await.unwrap();

        fx.cache.wipe();
        fx.accountant.update_usage(&ctx, "photos", 2).await.unwrap();
        assert_eq!(fx.accountant.get_usage(&ctx, "photos").await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_reconcile_cached_value_wins() {
        let fx = fixture(&[("aaa", 100), ("bbb", 7)]).await;
        let trigger = CacheKey::usage_trigger();
        // state left behind by a previous process
        fx.cache.incr_field(&CacheKey::usage("aaa"), FIELD_NAME_USAGE, 150).await.unwrap();
        fx.cache.add_member(&trigger, "aaa").await.unwrap();
        fx.cache.incr_field(&CacheKey::usage("ghost"), FIELD_NAME_USAGE, 5).await.unwrap();
        fx.cache.add_member(&trigger, "ghost").await.unwrap();

        let report = fx
            .accountant
            .init_usage_cache(&RequestContext::background("startup"))
            .await
            .unwrap();
        assert_eq!(
            report,
            ReconcileReport { seeded: 1, flushed: 1, failed: 0, dropped: 1 }
        );

        assert_eq!(persisted(&fx.store, "aaa").await, 150);
        assert_eq!(counter(&fx.cache, "aaa").await, Some(150));
        assert_eq!(counter(&fx.cache, "bbb").await, Some(7));
        assert_eq!(counter(&fx.cache, "ghost").await, None);
        assert!(dirty(&fx.cache).await.is_empty());

        let fields = fx.cache.get_fields(&CacheKey::bucket("aaa")).await.unwrap().unwrap();
        assert_eq!(Bucket::from_fields(&fields).unwrap().usage, 150);
    }

    #[tokio::test]
    async fn test_reconcile_failed_persist_marks_dirty() {
        let fx = fixture(&[("aaa", 100)]).await;
        fx.cache.incr_field(&CacheKey::usage("aaa"), FIELD_NAME_USAGE, 120).await.unwrap();
        fx.store.fail_usage("aaa");

        let ctx = RequestContext::background("startup");
        let report = fx.accountant.init_usage_cache(&ctx).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.flushed, 0);
        assert!(dirty(&fx.cache).await.contains_key("aaa"));
        assert_eq!(persisted(&fx.store, "aaa").await, 100);

        fx.store.heal_usage();
        fx.accountant.sync_dirty_usages(&ctx).await.unwrap();
        assert_eq!(persisted(&fx.store, "aaa").await, 120);
    }

    #[tokio::test]
    async fn test_reconcile_fails_without_snapshot() {
        let fx = fixture(&[("aaa", 1)]).await;
        fx.store.fail(true);
        assert!(fx
            .accountant
            .init_usage_cache(&RequestContext::background("startup"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_reconcile_fails_when_counters_cannot_be_listed() {
        let fx = fixture(&[("aaa", 1)]).await;
        fx.cache.fail(Fault::Keys);
        assert!(fx
            .accountant
            .init_usage_cache(&RequestContext::background("startup"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_unflushed_usage_survives_process_restart() {
        let fx = fixture(&[("photos", 100)]).await;
        fx.accountant
            .update_usage(&RequestContext::new(), "photos", 50)
            .await
            .unwrap();
        drop(fx.accountant);

        // a new process against the same cache server, no flush in between
        let restarted = UsageAccountant::new(fx.cache.clone(), fx.store.clone());
        let report = restarted
            .init_usage_cache(&RequestContext::background("startup"))
            .await
            .unwrap();
        assert_eq!(report.flushed, 1);
        assert_eq!(persisted(&fx.store, "photos").await, 150);
        assert!(dirty(&fx.cache).await.is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_keeps_counter_of_undecodable_bucket() {
        let fx = fixture(&[("photos", 100), ("videos", 3)]).await;
        fx.cache.incr_field(&CacheKey::usage("photos"), FIELD_NAME_USAGE, 150).await.unwrap();
        fx.cache.add_member(&CacheKey::usage_trigger(), "photos").await.unwrap();
        fx.store.corrupt("photos");

        let ctx = RequestContext::background("startup");
        let report = fx.accountant.init_usage_cache(&ctx).await.unwrap();
        assert_eq!(
            report,
            ReconcileReport { seeded: 1, flushed: 0, failed: 1, dropped: 0 }
        );
        assert_eq!(counter(&fx.cache, "photos").await, Some(150));
        assert!(dirty(&fx.cache).await.contains_key("photos"));
        assert_eq!(counter(&fx.cache, "videos").await, Some(3));

        // flushing cannot write the row either; the counter stays dirty
        let flush = fx.accountant.sync_dirty_usages(&ctx).await.unwrap().unwrap();
        assert_eq!(flush.failed, 1);
        assert_eq!(flush.dropped, 0);
        assert_eq!(counter(&fx.cache, "photos").await, Some(150));
        assert!(dirty(&fx.cache).await.contains_key("photos"));
    }

    #[tokio::test]
    async fn test_reconcile_counts_only_inserted_seeds() {
        let fx = fixture(&[("aaa", 100), ("bbb", 7)]).await;
        // counter written by an update racing the key listing
        fx.cache.incr_field(&CacheKey::usage("aaa"), FIELD_NAME_USAGE, 130).await.unwrap();
        fx.cache.hide_keys();

        let report = fx
            .accountant
            .init_usage_cache(&RequestContext::background("startup"))
            .await
            .unwrap();
        assert_eq!(report.seeded, 1);
        assert_eq!(counter(&fx.cache, "aaa").await, Some(130));
        assert!(!fx.cache.exists(&CacheKey::bucket("aaa")).await.unwrap());
        assert!(fx.cache.exists(&CacheKey::bucket("bbb")).await.unwrap());
    }
}
