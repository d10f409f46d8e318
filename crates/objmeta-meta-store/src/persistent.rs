//! Persistent store interface

use async_trait::async_trait;
use objmeta_common::{
    Bucket, Error, LifeCycle, Result, ScanHiddenBucketsResult, ScanLifeCycleResult,
};
use std::collections::HashMap;

/// Outcome of a batched usage overwrite
#[derive(Debug, Default)]
pub struct UsageUpdateReport {
    /// Buckets whose usage was written
    pub updated: Vec<String>,
    /// Buckets that could not be written, with the reason
    pub failed: Vec<(String, Error)>,
}

impl UsageUpdateReport {
    /// True when every requested entry was written
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Every bucket row, split into the rows that decoded and the names of
/// those that did not
#[derive(Debug, Default)]
pub struct BucketSnapshot {
    pub buckets: Vec<Bucket>,
    /// Rows that exist but could not be decoded
    pub undecodable: Vec<String>,
}

/// The authoritative store for buckets, ownership and lifecycle records.
///
/// Scans are keyset-paginated: they return up to `limit` records whose key
/// is strictly greater than `marker`, in ascending key order.
#[async_trait]
pub trait PersistentStore: Send + Sync {
    /// Point lookup; `BucketNotFound` when absent
    async fn get_bucket(&self, name: &str) -> Result<Bucket>;

    /// Snapshot of every bucket row, reporting rows that fail to decode
    async fn snapshot_buckets(&self) -> Result<BucketSnapshot>;

    /// Every bucket that decodes
    async fn get_buckets(&self) -> Result<Vec<Bucket>> {
        Ok(self.snapshot_buckets().await?.buckets)
    }

    /// Create or replace a bucket and its ownership rows
    async fn put_bucket(&self, bucket: &Bucket) -> Result<()>;

    /// Delete a bucket, its ownership rows and its lifecycle record
    async fn delete_bucket(&self, name: &str) -> Result<()>;

    /// Names of the buckets owned by `uid`, ascending
    async fn get_user_buckets(&self, uid: &str) -> Result<Vec<String>>;

    /// Overwrite the stored usage of one bucket
    async fn update_usage(&self, name: &str, usage: i64) -> Result<()>;

    /// Overwrite the stored usage of many buckets, best effort per entry
    async fn update_usages(&self, usages: &HashMap<String, i64>) -> Result<UsageUpdateReport>;

    /// Insert a lifecycle record; an existing record is left untouched
    async fn put_lifecycle(&self, lifecycle: &LifeCycle) -> Result<()>;

    /// Delete a lifecycle record; deleting a missing record is not an error
    async fn remove_lifecycle(&self, bucket_name: &str) -> Result<()>;

    /// Page through lifecycle records
    async fn scan_lifecycle(&self, limit: usize, marker: &str) -> Result<ScanLifeCycleResult>;

    /// Page through hidden bucket names
    async fn scan_hidden_buckets(
        &self,
        limit: usize,
        marker: &str,
    ) -> Result<ScanHiddenBucketsResult>;
}
