//! Cache engine trait

use crate::keys::{CacheKey, CacheTable};
use async_trait::async_trait;
use objmeta_common::Result;
use std::collections::HashMap;

/// A remote key-value cache with hash fields, atomic increment, glob key
/// enumeration and stamped set membership.
///
/// Every method is a single engine round trip. Implementations surface
/// transport failures as errors; nothing is retried internally.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Engine name (for logs)
    fn name(&self) -> &str;

    /// All fields of a hash, `None` if the key does not exist
    async fn get_fields(&self, key: &CacheKey) -> Result<Option<HashMap<String, String>>>;

    /// Set (merge) fields of a hash, creating it if needed
    async fn set_fields(&self, key: &CacheKey, fields: &HashMap<String, String>) -> Result<()>;

    /// Delete a key. Deleting a missing key is not an error.
    async fn remove(&self, key: &CacheKey) -> Result<()>;

    /// Whether a key exists
    async fn exists(&self, key: &CacheKey) -> Result<bool>;

    /// Atomically add `delta` to an integer field and return the new value.
    ///
    /// A missing key or field counts as 0. Fails if the field holds a
    /// non-integer value.
    async fn incr_field(&self, key: &CacheKey, field: &str, delta: i64) -> Result<i64>;

    /// Integer value of a field, `None` if the key or field is missing
    async fn get_field_int(&self, key: &CacheKey, field: &str) -> Result<Option<i64>>;

    /// Set a field only if it does not exist yet; returns whether it was set
    async fn set_field_if_absent(&self, key: &CacheKey, field: &str, value: &str)
    -> Result<bool>;

    /// Add `member` to a set, bumping its version stamp; returns the new stamp
    async fn add_member(&self, set: &CacheKey, member: &str) -> Result<u64>;

    /// All members of a set with their current stamps
    async fn get_all_members(&self, set: &CacheKey) -> Result<HashMap<String, u64>>;

    /// Unconditionally remove members; returns how many were present
    async fn remove_members(&self, set: &CacheKey, members: &[String]) -> Result<usize>;

    /// Remove each member only if its stamp still equals the given one.
    ///
    /// The check and the delete are one atomic step per member. Returns the
    /// members actually removed.
    async fn remove_members_if_unchanged(
        &self,
        set: &CacheKey,
        members: &[(String, u64)],
    ) -> Result<Vec<String>>;

    /// All keys of `table` matching a glob pattern
    async fn keys(&self, table: CacheTable, pattern: &str) -> Result<Vec<String>>;
}
