//! Bucket and user metadata reads through the cache.
//!
//! Reads are cache-aside; bucket usage seen through these paths is whatever
//! the entity hash last held. Callers that need the current usage go through
//! [`UsageAccountant::get_usage`](crate::UsageAccountant::get_usage).

use objmeta_cache::{CacheKey, CacheStore, SingleFlight, get_or_load};
use objmeta_common::{
    Bucket, LifeCycle, RequestContext, Result, ScanHiddenBucketsResult, ScanLifeCycleResult,
    UserBuckets,
};
use objmeta_meta_store::PersistentStore;
use std::sync::Arc;
use tracing::{Instrument, debug, info, warn};

/// Metadata service over a cache and the persistent store
pub struct MetadataService {
    cache: Arc<dyn CacheStore>,
    store: Arc<dyn PersistentStore>,
    flight: Option<SingleFlight>,
}

impl MetadataService {
    pub fn new(cache: Arc<dyn CacheStore>, store: Arc<dyn PersistentStore>) -> Self {
        Self {
            cache,
            store,
            flight: None,
        }
    }

    /// Collapse concurrent warming misses on the same key into one load
    #[must_use]
    pub fn with_single_flight(mut self, enabled: bool) -> Self {
        self.flight = enabled.then(SingleFlight::new);
        self
    }

    pub fn cache(&self) -> &Arc<dyn CacheStore> {
        &self.cache
    }

    pub fn store(&self) -> &Arc<dyn PersistentStore> {
        &self.store
    }

    // ---- Buckets ----

    /// Cache-aside bucket read; `warm_on_miss` writes the loaded bucket back.
    pub async fn get_bucket(
        &self,
        ctx: &RequestContext,
        name: &str,
        warm_on_miss: bool,
    ) -> Result<Bucket> {
        self.read_bucket(name, warm_on_miss)
            .instrument(ctx.span())
            .await
    }

    /// Bucket read that always reflects the store: drops the cached entity
    /// first, then reloads and re-warms it.
    pub async fn get_bucket_info(&self, ctx: &RequestContext, name: &str) -> Result<Bucket> {
        async {
            let key = CacheKey::bucket(name);
            if let Err(e) = self.cache.remove(&key).await {
                // A stale entry may still be cached, so bypass it
                warn!(bucket = name, error = %e, "failed to invalidate bucket, reading store");
                return self.store.get_bucket(name).await;
            }
            self.read_bucket(name, true).await
        }
        .instrument(ctx.span())
        .await
    }

    /// Snapshot of every bucket, straight from the store
    pub async fn get_buckets(&self, ctx: &RequestContext) -> Result<Vec<Bucket>> {
        self.store.get_buckets().instrument(ctx.span()).await
    }

    /// Drop the cached entity hash of a bucket
    pub async fn invalidate_bucket(&self, ctx: &RequestContext, name: &str) -> Result<()> {
        async {
            debug!(bucket = name, "invalidating bucket");
            self.cache.remove(&CacheKey::bucket(name)).await
        }
        .instrument(ctx.span())
        .await
    }

    async fn read_bucket(&self, name: &str, warm_on_miss: bool) -> Result<Bucket> {
        let key = CacheKey::bucket(name);
        let store = &self.store;
        let loader = move || async move {
            info!(bucket = name, "bucket cache miss");
            store.get_bucket(name).await
        };
        match &self.flight {
            Some(flight) if warm_on_miss => {
                flight.get_or_load(self.cache.as_ref(), &key, loader).await
            }
            _ => get_or_load(self.cache.as_ref(), &key, loader, warm_on_miss).await,
        }
    }

    // ---- Users ----

    /// Cache-aside read of the names of the buckets a user owns
    pub async fn get_user_buckets(
        &self,
        ctx: &RequestContext,
        uid: &str,
        warm_on_miss: bool,
    ) -> Result<Vec<String>> {
        self.read_user_buckets(uid, warm_on_miss)
            .instrument(ctx.span())
            .await
    }

    /// User bucket list that always reflects the store
    pub async fn get_user_info(&self, ctx: &RequestContext, uid: &str) -> Result<Vec<String>> {
        async {
            if let Err(e) = self.cache.remove(&CacheKey::user(uid)).await {
                warn!(uid, error = %e, "failed to invalidate user, reading store");
                return self.store.get_user_buckets(uid).await;
            }
            self.read_user_buckets(uid, true).await
        }
        .instrument(ctx.span())
        .await
    }

    /// Drop the cached bucket list of a user
    pub async fn invalidate_user(&self, ctx: &RequestContext, uid: &str) -> Result<()> {
        async {
            debug!(uid, "invalidating user");
            self.cache.remove(&CacheKey::user(uid)).await
        }
        .instrument(ctx.span())
        .await
    }

    async fn read_user_buckets(&self, uid: &str, warm_on_miss: bool) -> Result<Vec<String>> {
        let key = CacheKey::user(uid);
        let store = &self.store;
        let loader = move || async move {
            info!(uid, "user cache miss");
            let buckets = store.get_user_buckets(uid).await?;
            Ok(UserBuckets {
                user_id: uid.to_string(),
                buckets,
            })
        };
        let user: UserBuckets = match &self.flight {
            Some(flight) if warm_on_miss => {
                flight.get_or_load(self.cache.as_ref(), &key, loader).await?
            }
            _ => get_or_load(self.cache.as_ref(), &key, loader, warm_on_miss).await?,
        };
        Ok(user.buckets)
    }

    // ---- Lifecycle and scans ----

    pub async fn put_lifecycle(&self, ctx: &RequestContext, lifecycle: &LifeCycle) -> Result<()> {
        self.store
            .put_lifecycle(lifecycle)
            .instrument(ctx.span())
            .await
    }

    pub async fn remove_lifecycle(&self, ctx: &RequestContext, bucket_name: &str) -> Result<()> {
        self.store
            .remove_lifecycle(bucket_name)
            .instrument(ctx.span())
            .await
    }

    pub async fn scan_lifecycle(
        &self,
        ctx: &RequestContext,
        limit: usize,
        marker: &str,
    ) -> Result<ScanLifeCycleResult> {
        self.store
            .scan_lifecycle(limit, marker)
            .instrument(ctx.span())
            .await
    }

    pub async fn scan_hidden_buckets(
        &self,
        ctx: &RequestContext,
        limit: usize,
        marker: &str,
    ) -> Result<ScanHiddenBucketsResult> {
        self.store
            .scan_hidden_buckets(limit, marker)
            .instrument(ctx.span())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Fault, FlakyCache, FlakyStore, open_store};
    use objmeta_cache::MemoryCache;
    use objmeta_common::{Error, HIDDEN_BUCKET_PREFIX};
    use std::collections::HashMap;
    use std::sync::atomic::Ordering;

    struct Fixture {
        _dir: tempfile::TempDir,
        cache: Arc<FlakyCache>,
        store: Arc<FlakyStore>,
        service: MetadataService,
    }

    async fn fixture(single_flight: bool) -> Fixture {
        let (dir, meta) = open_store();
        let cache = Arc::new(FlakyCache::new(MemoryCache::new()));
        let store = Arc::new(FlakyStore::new(meta));
        store.put_bucket(&Bucket::new("photos", "alice", 1).with_usage(10)).await.unwrap();
        store.put_bucket(&Bucket::new("videos", "alice", 2)).await.unwrap();
        let service = MetadataService::new(cache.clone(), store.clone())
            .with_single_flight(single_flight);
        Fixture {
            _dir: dir,
            cache,
            store,
            service,
        }
    }

    #[tokio::test]
    async fn test_get_bucket_warm_loads_once() {
        let fx = fixture(false).await;
        let ctx = RequestContext::new();

        let first = fx.service.get_bucket(&ctx, "photos", true).await.unwrap();
        let second = fx.service.get_bucket(&ctx, "photos", true).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.usage, 10);
        assert_eq!(fx.store.bucket_reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_get_bucket_without_warm_reloads() {
        let fx = fixture(false).await;
        let ctx = RequestContext::new();

        fx.service.get_bucket(&ctx, "photos", false).await.unwrap();
        fx.service.get_bucket(&ctx, "photos", false).await.unwrap();
        assert_eq!(fx.store.bucket_reads.load(Ordering::SeqCst), 2);
        assert!(!fx.cache.exists(&CacheKey::bucket("photos")).await.unwrap());
    }

    #[tokio::test]
    async fn test_get_bucket_not_found() {
        let fx = fixture(true).await;
        let err = fx
            .service
            .get_bucket(&RequestContext::new(), "missing", true)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BucketNotFound(_)));
        assert!(!fx.cache.exists(&CacheKey::bucket("missing")).await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_cached_bucket_is_internal() {
        let fx = fixture(false).await;
        fx.cache
            .set_fields(
                &CacheKey::bucket("photos"),
                &HashMap::from([("owner_id".to_string(), "alice".to_string())]),
            )
            .await
            .unwrap();
        let err = fx
            .service
            .get_bucket(&RequestContext::new(), "photos", true)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[tokio::test]
    async fn test_cache_read_failure_falls_back_to_store() {
        let fx = fixture(false).await;
        fx.cache.fail(Fault::Read);
        let bucket = fx
            .service
            .get_bucket(&RequestContext::new(), "photos", true)
            .await
            .unwrap();
        assert_eq!(bucket.name, "photos");
    }

    #[tokio::test]
    async fn test_warm_failure_still_returns_bucket() {
        let fx = fixture(false).await;
        fx.cache.fail(Fault::Write);
        let bucket = fx
            .service
            .get_bucket(&RequestContext::new(), "photos", true)
            .await
            .unwrap();
        assert_eq!(bucket.usage, 10);
        fx.cache.heal();
        assert!(!fx.cache.exists(&CacheKey::bucket("photos")).await.unwrap());
    }

    #[tokio::test]
    async fn test_get_bucket_info_sees_latest_store_state() {
        let fx = fixture(false).await;
        let ctx = RequestContext::new();
        fx.service.get_bucket(&ctx, "photos", true).await.unwrap();

        // the store moves on while the cache holds the old entity
        fx.store.update_usage("photos", 999).await.unwrap();
        assert_eq!(fx.service.get_bucket(&ctx, "photos", true).await.unwrap().usage, 10);

        let fresh = fx.service.get_bucket_info(&ctx, "photos").await.unwrap();
        assert_eq!(fresh.usage, 999);
        // and the cache was re-warmed with it
        assert_eq!(fx.service.get_bucket(&ctx, "photos", true).await.unwrap().usage, 999);
    }

    #[tokio::test]
    async fn test_get_bucket_info_with_failed_invalidation_reads_store() {
        let fx = fixture(false).await;
        let ctx = RequestContext::new();
        fx.service.get_bucket(&ctx, "photos", true).await.unwrap();
        fx.store.update_usage("photos", 7).await.unwrap();

        fx.cache.fail(Fault::Remove);
        let fresh = fx.service.get_bucket_info(&ctx, "photos").await.unwrap();
        assert_eq!(fresh.usage, 7);
    }

    #[tokio::test]
    async fn test_user_buckets_and_user_info() {
        let fx = fixture(true).await;
        let ctx = RequestContext::new();

        let names = fx.service.get_user_buckets(&ctx, "alice", true).await.unwrap();
        assert_eq!(names, vec!["photos".to_string(), "videos".to_string()]);

        fx.store.put_bucket(&Bucket::new("archive", "alice", 3)).await.unwrap();
        // cached list is stale until the user is reloaded
        assert_eq!(fx.service.get_user_buckets(&ctx, "alice", true).await.unwrap().len(), 2);
        let names = fx.service.get_user_info(&ctx, "alice").await.unwrap();
        assert_eq!(names, vec!["archive".to_string(), "photos".to_string(), "videos".to_string()]);

        fx.service.invalidate_user(&ctx, "alice").await.unwrap();
        assert!(!fx.cache.exists(&CacheKey::user("alice")).await.unwrap());

        assert!(fx.service.get_user_buckets(&ctx, "nobody", true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalidate_bucket_keeps_usage_counter() {
        let fx = fixture(false).await;
        let ctx = RequestContext::new();
        fx.service.get_bucket(&ctx, "photos", true).await.unwrap();
        fx.cache.incr_field(&CacheKey::usage("photos"), "usage", 5).await.unwrap();

        fx.service.invalidate_bucket(&ctx, "photos").await.unwrap();
        assert!(!fx.cache.exists(&CacheKey::bucket("photos")).await.unwrap());
        assert_eq!(
            fx.cache.get_field_int(&CacheKey::usage("photos"), "usage").await.unwrap(),
            Some(5)
        );
    }

    #[tokio::test]
    async fn test_lifecycle_pass_through_and_error_propagation() {
        let fx = fixture(false).await;
        let ctx = RequestContext::new();
        for name in ["c", "a", "b"] {
            fx.service
                .put_lifecycle(&ctx, &LifeCycle::new(name, "Pending"))
                .await
                .unwrap();
        }

        let page = fx.service.scan_lifecycle(&ctx, 2, "").await.unwrap();
        assert_eq!(page.items.len(), 2);
        assert!(page.truncated);
        assert_eq!(page.next_marker, "b");
        let page = fx.service.scan_lifecycle(&ctx, 2, &page.next_marker).await.unwrap();
        assert_eq!(page.items, vec![LifeCycle::new("c", "Pending")]);
        assert!(!page.truncated);

        fx.store.fail(true);
        assert!(fx
            .service
            .put_lifecycle(&ctx, &LifeCycle::new("d", "Pending"))
            .await
            .is_err());
        assert!(fx.service.remove_lifecycle(&ctx, "a").await.is_err());
    }

    #[tokio::test]
    async fn test_scan_hidden_buckets_and_get_buckets() {
        let fx = fixture(false).await;
        let ctx = RequestContext::new();
        let hidden = format!("{HIDDEN_BUCKET_PREFIX}tmp");
        fx.store.put_bucket(&Bucket::new(hidden.as_str(), "alice", 4)).await.unwrap();

        let page = fx.service.scan_hidden_buckets(&ctx, 10, "").await.unwrap();
        assert_eq!(page.items, vec![hidden]);
        assert!(!page.truncated);

        assert_eq!(fx.service.get_buckets(&ctx).await.unwrap().len(), 3);
    }
}
