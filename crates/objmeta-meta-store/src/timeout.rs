//! Per-call deadline for any persistent store.

use crate::persistent::{BucketSnapshot, PersistentStore, UsageUpdateReport};
use async_trait::async_trait;
use objmeta_common::{
    Bucket, Error, LifeCycle, Result, ScanHiddenBucketsResult, ScanLifeCycleResult,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Wraps a [`PersistentStore`] so every call fails with [`Error::Timeout`]
/// once the deadline passes.
pub struct TimeoutStore {
    inner: Arc<dyn PersistentStore>,
    timeout: Duration,
}

impl TimeoutStore {
    pub fn new(inner: Arc<dyn PersistentStore>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn run<T>(&self, op: &str, fut: impl Future<Output = Result<T>> + Send) -> Result<T> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .unwrap_or_else(|_| {
                Err(Error::Timeout(format!(
                    "store {op} exceeded {:?}",
                    self.timeout
                )))
            })
    }
}

#[async_trait]
impl PersistentStore for TimeoutStore {
    async fn get_bucket(&self, name: &str) -> Result<Bucket> {
        self.run("get_bucket", self.inner.get_bucket(name)).await
    }

    async fn snapshot_buckets(&self) -> Result<BucketSnapshot> {
        self.run("snapshot_buckets", self.inner.snapshot_buckets())
            .await
    }

    async fn put_bucket(&self, bucket: &Bucket) -> Result<()> {
        self.run("put_bucket", self.inner.put_bucket(bucket)).await
    }

    async fn delete_bucket(&self, name: &str) -> Result<()> {
        self.run("delete_bucket", self.inner.delete_bucket(name))
            .await
    }

    async fn get_user_buckets(&self, uid: &str) -> Result<Vec<String>> {
        self.run("get_user_buckets", self.inner.get_user_buckets(uid))
            .await
    }

    async fn update_usage(&self, name: &str, usage: i64) -> Result<()> {
        self.run("update_usage", self.inner.update_usage(name, usage))
            .await
    }

    async fn update_usages(&self, usages: &HashMap<String, i64>) -> Result<UsageUpdateReport> {
        self.run("update_usages", self.inner.update_usages(usages))
            .await
    }

    async fn put_lifecycle(&self, lifecycle: &LifeCycle) -> Result<()> {
        self.run("put_lifecycle", self.inner.put_lifecycle(lifecycle))
            .await
    }

    async fn remove_lifecycle(&self, bucket_name: &str) -> Result<()> {
        self.run("remove_lifecycle", self.inner.remove_lifecycle(bucket_name))
            .await
    }

    async fn scan_lifecycle(&self, limit: usize, marker: &str) -> Result<ScanLifeCycleResult> {
        self.run("scan_lifecycle", self.inner.scan_lifecycle(limit, marker))
            .await
    }

    async fn scan_hidden_buckets(
        &self,
        limit: usize,
        marker: &str,
    ) -> Result<ScanHiddenBucketsResult> {
        self.run(
            "scan_hidden_buckets",
            self.inner.scan_hidden_buckets(limit, marker),
        )
        .await
    }
}
