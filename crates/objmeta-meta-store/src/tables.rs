//! Redb table definitions for persistent metadata storage.

use redb::TableDefinition;

// Key: bucket name, Value: bincode-encoded Bucket
pub const BUCKETS: TableDefinition<&str, &[u8]> = TableDefinition::new("buckets");
// Key: bucket name, Value: owner user id. Ordered by bucket name, so it also
// serves the hidden-bucket prefix scan.
pub const BUCKET_OWNERS: TableDefinition<&str, &str> = TableDefinition::new("bucket_owners");
// Key: "uid\0bucket", Value: bucket name
pub const USER_BUCKETS: TableDefinition<&str, &str> = TableDefinition::new("user_buckets");
// Key: bucket name, Value: lifecycle status
pub const LIFECYCLE: TableDefinition<&str, &str> = TableDefinition::new("lifecycle");

/// Separator between user id and bucket name in `USER_BUCKETS` keys
pub const USER_BUCKET_SEP: char = '\0';

/// Key of a `USER_BUCKETS` row
#[must_use]
pub fn user_bucket_key(uid: &str, bucket: &str) -> String {
    format!("{uid}{USER_BUCKET_SEP}{bucket}")
}

/// Common prefix of every `USER_BUCKETS` row of `uid`
#[must_use]
pub fn user_bucket_prefix(uid: &str) -> String {
    format!("{uid}{USER_BUCKET_SEP}")
}
