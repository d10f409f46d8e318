//! Persistent metadata store backed by redb.
//!
//! Every write is its own write transaction. Buckets are bincode-encoded;
//! ownership and lifecycle rows are plain strings. Ordered string keys give
//! keyset pagination directly through `range`.

use crate::persistent::{BucketSnapshot, PersistentStore, UsageUpdateReport};
use crate::tables;
use async_trait::async_trait;
use objmeta_common::{
    Bucket, BucketNameError, Error, LifeCycle, Result, ScanHiddenBucketsResult, ScanLifeCycleResult,
    ScanPage, HIDDEN_BUCKET_PREFIX, validate_bucket_name,
};
use redb::{Database, ReadableTable};
use std::collections::HashMap;
use std::ops::Bound;
use std::path::Path;
use tracing::{debug, error, info, warn};

/// Error type for metadata store operations
#[derive(Debug, thiserror::Error)]
pub enum MetaStoreError {
    #[error("bucket not found: {0}")]
    BucketNotFound(String),
    #[error("invalid bucket name: {0}")]
    InvalidBucketName(#[from] BucketNameError),
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redb::TransactionError> for MetaStoreError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl From<MetaStoreError> for Error {
    fn from(e: MetaStoreError) -> Self {
        match e {
            MetaStoreError::BucketNotFound(name) => Self::BucketNotFound(name),
            MetaStoreError::InvalidBucketName(e) => Self::InvalidBucketName(e),
            MetaStoreError::Bincode(e) => Self::Deserialization(e.to_string()),
            other => Self::Storage(other.to_string()),
        }
    }
}

pub type MetaStoreResult<T> = std::result::Result<T, MetaStoreError>;

/// Persistent metadata store backed by redb.
pub struct MetaStore {
    db: Database,
}

impl MetaStore {
    /// Open (or create) the redb database at the given path.
    pub fn open(path: impl AsRef<Path>) -> MetaStoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Create all tables eagerly so later read txns don't fail
        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(tables::BUCKETS)?;
            let _t = write_txn.open_table(tables::BUCKET_OWNERS)?;
            let _t = write_txn.open_table(tables::USER_BUCKETS)?;
            let _t = write_txn.open_table(tables::LIFECYCLE)?;
        }
        write_txn.commit()?;

        info!("Opened metadata store at {}", path.display());
        Ok(Self { db })
    }

    // ---- Buckets (bincode) ----

    pub fn load_bucket(&self, name: &str) -> MetaStoreResult<Bucket> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::BUCKETS)?;
        match table.get(name)? {
            Some(val) => Ok(bincode::deserialize(val.value())?),
            None => Err(MetaStoreError::BucketNotFound(name.to_string())),
        }
    }

    pub fn load_buckets(&self) -> MetaStoreResult<BucketSnapshot> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::BUCKETS)?;
        let mut snapshot = BucketSnapshot::default();
        for entry in table.iter()? {
            let entry = entry?;
            let key = entry.0.value().to_string();
            match bincode::deserialize::<Bucket>(entry.1.value()) {
                Ok(bucket) => snapshot.buckets.push(bucket),
                Err(e) => {
                    error!("Failed to decode bucket '{}': {}", key, e);
                    snapshot.undecodable.push(key);
                }
            }
        }
        Ok(snapshot)
    }

    pub fn store_bucket(&self, bucket: &Bucket) -> MetaStoreResult<()> {
        validate_bucket_name(&bucket.name)?;
        let bytes = bincode::serialize(bucket)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut buckets = write_txn.open_table(tables::BUCKETS)?;
            buckets.insert(bucket.name.as_str(), bytes.as_slice())?;

            let mut owners = write_txn.open_table(tables::BUCKET_OWNERS)?;
            let previous = owners
                .insert(bucket.name.as_str(), bucket.owner_id.as_str())?
                .map(|old| old.value().to_string());

            let mut user_buckets = write_txn.open_table(tables::USER_BUCKETS)?;
            if let Some(old_owner) = previous.filter(|o| *o != bucket.owner_id) {
                user_buckets.remove(tables::user_bucket_key(&old_owner, &bucket.name).as_str())?;
            }
            user_buckets.insert(
                tables::user_bucket_key(&bucket.owner_id, &bucket.name).as_str(),
                bucket.name.as_str(),
            )?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn remove_bucket(&self, name: &str) -> MetaStoreResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut buckets = write_txn.open_table(tables::BUCKETS)?;
            if buckets.remove(name)?.is_none() {
                return Err(MetaStoreError::BucketNotFound(name.to_string()));
            }

            let mut owners = write_txn.open_table(tables::BUCKET_OWNERS)?;
            let owner = owners.remove(name)?.map(|o| o.value().to_string());
            if let Some(owner) = owner {
                let mut user_buckets = write_txn.open_table(tables::USER_BUCKETS)?;
                user_buckets.remove(tables::user_bucket_key(&owner, name).as_str())?;
            }

            let mut lifecycle = write_txn.open_table(tables::LIFECYCLE)?;
            lifecycle.remove(name)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn load_user_buckets(&self, uid: &str) -> MetaStoreResult<Vec<String>> {
        let prefix = tables::user_bucket_prefix(uid);
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::USER_BUCKETS)?;
        let mut result = Vec::new();
        for entry in table.range::<&str>(prefix.as_str()..)? {
            let entry = entry?;
            if !entry.0.value().starts_with(&prefix) {
                break;
            }
            result.push(entry.1.value().to_string());
        }
        Ok(result)
    }

    // ---- Usage ----

    /// Overwrite the usage field of one bucket.
    pub fn store_usage(&self, name: &str, usage: i64) -> MetaStoreResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(tables::BUCKETS)?;
            Self::overwrite_usage(&mut table, name, usage)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Overwrite many usage fields in one transaction.
    ///
    /// Rows that are missing or undecodable are reported per entry and do
    /// not prevent the others from being written.
    pub fn store_usages(&self, usages: &HashMap<String, i64>) -> MetaStoreResult<UsageUpdateReport> {
        let mut report = UsageUpdateReport::default();
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(tables::BUCKETS)?;
            for (name, usage) in usages {
                match Self::overwrite_usage(&mut table, name, *usage) {
                    Ok(()) => report.updated.push(name.clone()),
                    Err(e) => {
                        warn!("Failed to update usage of bucket '{}': {}", name, e);
                        report.failed.push((name.clone(), e.into()));
                    }
                }
            }
        }
        write_txn.commit()?;
        Ok(report)
    }

    fn overwrite_usage(
        table: &mut redb::Table<'_, &'static str, &'static [u8]>,
        name: &str,
        usage: i64,
    ) -> MetaStoreResult<()> {
        let existing = table.get(name)?.map(|v| v.value().to_vec());
        let Some(bytes) = existing else {
            return Err(MetaStoreError::BucketNotFound(name.to_string()));
        };
        let mut bucket: Bucket = bincode::deserialize(&bytes)?;
        if bucket.usage == usage {
            return Ok(());
        }
        bucket.usage = usage;
        let bytes = bincode::serialize(&bucket)?;
        table.insert(name, bytes.as_slice())?;
        Ok(())
    }

    // ---- Lifecycle ----

    /// Insert a lifecycle row unless one already exists for the bucket.
    pub fn insert_lifecycle(&self, lifecycle: &LifeCycle) -> MetaStoreResult<bool> {
        let write_txn = self.db.begin_write()?;
        let inserted = {
            let mut table = write_txn.open_table(tables::LIFECYCLE)?;
            let exists = table.get(lifecycle.bucket_name.as_str())?.is_some();
            if !exists {
                table.insert(lifecycle.bucket_name.as_str(), lifecycle.status.as_str())?;
            }
            !exists
        };
        write_txn.commit()?;
        Ok(inserted)
    }

    pub fn delete_lifecycle(&self, bucket_name: &str) -> MetaStoreResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(tables::LIFECYCLE)?;
            table.remove(bucket_name)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn list_lifecycle(&self, limit: usize, marker: &str) -> MetaStoreResult<ScanLifeCycleResult> {
        if limit == 0 {
            return Ok(ScanPage::empty());
        }
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::LIFECYCLE)?;
        let mut items = Vec::with_capacity(limit);
        for entry in table.range::<&str>((Bound::Excluded(marker), Bound::Unbounded))? {
            let entry = entry?;
            items.push(LifeCycle::new(entry.0.value(), entry.1.value()));
            if items.len() == limit {
                break;
            }
        }
        Ok(ScanPage::from_items(items, limit, |lc| lc.bucket_name.as_str()))
    }

    pub fn list_hidden_buckets(
        &self,
        limit: usize,
        marker: &str,
    ) -> MetaStoreResult<ScanHiddenBucketsResult> {
        if limit == 0 {
            return Ok(ScanPage::empty());
        }
        // Start at the prefix unless the marker is already past it
        let lower = if marker >= HIDDEN_BUCKET_PREFIX {
            Bound::Excluded(marker)
        } else {
            Bound::Included(HIDDEN_BUCKET_PREFIX)
        };
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::BUCKET_OWNERS)?;
        let mut items = Vec::with_capacity(limit);
        for entry in table.range::<&str>((lower, Bound::Unbounded))? {
            let entry = entry?;
            let name = entry.0.value();
            if !name.starts_with(HIDDEN_BUCKET_PREFIX) {
                break;
            }
            items.push(name.to_string());
            if items.len() == limit {
                break;
            }
        }
        debug!("Scanned {} hidden buckets after '{}'", items.len(), marker);
        Ok(ScanPage::from_items(items, limit, String::as_str))
    }
}

#[async_trait]
impl PersistentStore for MetaStore {
    async fn get_bucket(&self, name: &str) -> Result<Bucket> {
        Ok(self.load_bucket(name)?)
    }

    async fn snapshot_buckets(&self) -> Result<BucketSnapshot> {
        Ok(self.load_buckets()?)
    }

    async fn put_bucket(&self, bucket: &Bucket) -> Result<()> {
        Ok(self.store_bucket(bucket)?)
    }

    async fn delete_bucket(&self, name: &str) -> Result<()> {
        Ok(self.remove_bucket(name)?)
    }

    async fn get_user_buckets(&self, uid: &str) -> Result<Vec<String>> {
        Ok(self.load_user_buckets(uid)?)
    }

    async fn update_usage(&self, name: &str, usage: i64) -> Result<()> {
        Ok(self.store_usage(name, usage)?)
    }

    async fn update_usages(&self, usages: &HashMap<String, i64>) -> Result<UsageUpdateReport> {
        Ok(self.store_usages(usages)?)
    }

    async fn put_lifecycle(&self, lifecycle: &LifeCycle) -> Result<()> {
        if !self.insert_lifecycle(lifecycle)? {
            debug!(
                "Lifecycle for bucket '{}' already registered",
                lifecycle.bucket_name
            );
        }
        Ok(())
    }

    async fn remove_lifecycle(&self, bucket_name: &str) -> Result<()> {
        Ok(self.delete_lifecycle(bucket_name)?)
    }

    async fn scan_lifecycle(&self, limit: usize, marker: &str) -> Result<ScanLifeCycleResult> {
        Ok(self.list_lifecycle(limit, marker)?)
    }

    async fn scan_hidden_buckets(
        &self,
        limit: usize,
        marker: &str,
    ) -> Result<ScanHiddenBucketsResult> {
        Ok(self.list_hidden_buckets(limit, marker)?)
    }
}
