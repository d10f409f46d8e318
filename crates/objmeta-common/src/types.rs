//! Core type definitions for objmeta
//!
//! Entities are stored twice: bincode-encoded in the persistent store and as
//! a flat field mapping (field name -> string value) in the cache. The
//! [`CacheEntity`] trait describes the second encoding.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Reserved prefix for internal bookkeeping buckets hidden from end users
pub const HIDDEN_BUCKET_PREFIX: &str = ".__hidden__";

/// Cache field holding a bucket's byte usage
pub const FIELD_NAME_USAGE: &str = "usage";

const FIELD_NAME_NAME: &str = "name";
const FIELD_NAME_OWNER: &str = "owner_id";
const FIELD_NAME_CREATED: &str = "created_at";
const FIELD_NAME_ACL: &str = "acl";
const FIELD_NAME_VERSIONING: &str = "versioning";
const FIELD_NAME_USER: &str = "user_id";
const FIELD_NAME_BUCKETS: &str = "buckets";

/// An entity that can live in the cache as a flat field mapping.
pub trait CacheEntity: Sized {
    /// Encode into field name -> string value pairs
    fn to_fields(&self) -> Result<HashMap<String, String>>;

    /// Decode from a field mapping previously produced by [`to_fields`](Self::to_fields)
    fn from_fields(fields: &HashMap<String, String>) -> Result<Self>;
}

fn required<'a>(fields: &'a HashMap<String, String>, name: &str) -> Result<&'a str> {
    fields
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| Error::Deserialization(format!("missing field '{name}'")))
}

fn parse_field<T: FromStr>(fields: &HashMap<String, String>, name: &str) -> Result<T>
where
    T::Err: fmt::Display,
{
    let raw = required(fields, name)?;
    raw.parse::<T>()
        .map_err(|e| Error::Deserialization(format!("field '{name}' = {raw:?}: {e}")))
}

/// Bucket versioning state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Versioning {
    #[default]
    Disabled,
    Enabled,
    Suspended,
}

impl Versioning {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "Disabled",
            Self::Enabled => "Enabled",
            Self::Suspended => "Suspended",
        }
    }
}

impl FromStr for Versioning {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "Disabled" => Ok(Self::Disabled),
            "Enabled" => Ok(Self::Enabled),
            "Suspended" => Ok(Self::Suspended),
            other => Err(format!("unknown versioning state {other:?}")),
        }
    }
}

/// Bucket record
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    /// Globally unique bucket name
    pub name: String,
    /// Owning user id
    pub owner_id: String,
    /// Creation time (unix seconds)
    pub created_at: u64,
    /// Canned ACL
    pub acl: String,
    /// Versioning state
    pub versioning: Versioning,
    /// Bytes stored in the bucket
    pub usage: i64,
}

impl Bucket {
    /// Create a new empty private bucket
    pub fn new(name: impl Into<String>, owner_id: impl Into<String>, created_at: u64) -> Self {
        Self {
            name: name.into(),
            owner_id: owner_id.into(),
            created_at,
            acl: "private".to_string(),
            versioning: Versioning::Disabled,
            usage: 0,
        }
    }

    /// Set the usage counter
    #[must_use]
    pub const fn with_usage(mut self, usage: i64) -> Self {
        self.usage = usage;
        self
    }

    /// Whether this is an internal bookkeeping bucket
    #[must_use]
    pub fn is_hidden(&self) -> bool {
        is_hidden_bucket(&self.name)
    }
}

impl CacheEntity for Bucket {
    fn to_fields(&self) -> Result<HashMap<String, String>> {
        Ok(HashMap::from([
            (FIELD_NAME_NAME.to_string(), self.name.clone()),
            (FIELD_NAME_OWNER.to_string(), self.owner_id.clone()),
            (FIELD_NAME_CREATED.to_string(), self.created_at.to_string()),
            (FIELD_NAME_ACL.to_string(), self.acl.clone()),
            (
                FIELD_NAME_VERSIONING.to_string(),
                self.versioning.as_str().to_string(),
            ),
            (FIELD_NAME_USAGE.to_string(), self.usage.to_string()),
        ]))
    }

    fn from_fields(fields: &HashMap<String, String>) -> Result<Self> {
        Ok(Self {
            name: required(fields, FIELD_NAME_NAME)?.to_string(),
            owner_id: required(fields, FIELD_NAME_OWNER)?.to_string(),
            created_at: parse_field(fields, FIELD_NAME_CREATED)?,
            acl: required(fields, FIELD_NAME_ACL)?.to_string(),
            versioning: parse_field(fields, FIELD_NAME_VERSIONING)?,
            usage: parse_field(fields, FIELD_NAME_USAGE)?,
        })
    }
}

/// The set of buckets owned by one user
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserBuckets {
    pub user_id: String,
    /// Bucket names in ascending order
    pub buckets: Vec<String>,
}

impl CacheEntity for UserBuckets {
    fn to_fields(&self) -> Result<HashMap<String, String>> {
        let buckets = serde_json::to_string(&self.buckets)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        Ok(HashMap::from([
            (FIELD_NAME_USER.to_string(), self.user_id.clone()),
            (FIELD_NAME_BUCKETS.to_string(), buckets),
        ]))
    }

    fn from_fields(fields: &HashMap<String, String>) -> Result<Self> {
        let raw = required(fields, FIELD_NAME_BUCKETS)?;
        let buckets = serde_json::from_str(raw)
            .map_err(|e| Error::Deserialization(format!("field 'buckets': {e}")))?;
        Ok(Self {
            user_id: required(fields, FIELD_NAME_USER)?.to_string(),
            buckets,
        })
    }
}

/// Lifecycle registration for a bucket
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifeCycle {
    pub bucket_name: String,
    pub status: String,
}

impl LifeCycle {
    pub fn new(bucket_name: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            bucket_name: bucket_name.into(),
            status: status.into(),
        }
    }
}

/// One page of a keyset-paginated scan
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanPage<T> {
    /// Records in ascending key order
    pub items: Vec<T>,
    /// True when the page is full and more records may follow
    pub truncated: bool,
    /// Last key returned; only meaningful when `truncated`
    pub next_marker: String,
}

impl<T> ScanPage<T> {
    /// An empty, non-truncated page
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            items: Vec::new(),
            truncated: false,
            next_marker: String::new(),
        }
    }

    /// Build a page from records collected for a scan limited to `limit`
    pub fn from_items(items: Vec<T>, limit: usize, key: impl Fn(&T) -> &str) -> Self {
        let next_marker = items.last().map(|i| key(i).to_string()).unwrap_or_default();
        Self {
            truncated: limit > 0 && items.len() == limit,
            items,
            next_marker,
        }
    }
}

/// Page of lifecycle records
pub type ScanLifeCycleResult = ScanPage<LifeCycle>;

/// Page of hidden bucket names
pub type ScanHiddenBucketsResult = ScanPage<String>;

/// Whether a bucket name carries the hidden-bucket prefix
#[must_use]
pub fn is_hidden_bucket(name: &str) -> bool {
    name.starts_with(HIDDEN_BUCKET_PREFIX)
}

/// Validate a user-visible bucket name according to S3 rules.
///
/// Hidden bucket names bypass these rules.
pub fn validate_bucket_name(name: &str) -> std::result::Result<(), BucketNameError> {
    if is_hidden_bucket(name) {
        return Ok(());
    }

    if name.len() < 3 {
        return Err(BucketNameError::TooShort);
    }
    if name.len() > 63 {
        return Err(BucketNameError::TooLong);
    }

    let bytes = name.as_bytes();
    let edge_ok = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    if !edge_ok(bytes[0]) {
        return Err(BucketNameError::InvalidStartChar);
    }
    if !edge_ok(bytes[bytes.len() - 1]) {
        return Err(BucketNameError::InvalidEndChar);
    }

    if let Some(c) = name
        .chars()
        .find(|c| !c.is_ascii_lowercase() && !c.is_ascii_digit() && *c != '-' && *c != '.')
    {
        return Err(BucketNameError::InvalidChar(c));
    }

    if name.contains("..") {
        return Err(BucketNameError::ConsecutivePeriods);
    }

    if name.parse::<std::net::Ipv4Addr>().is_ok() {
        return Err(BucketNameError::LooksLikeIpAddress);
    }

    Ok(())
}

/// Errors that can occur when validating a bucket name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BucketNameError {
    #[error("bucket name must be at least 3 characters")]
    TooShort,
    #[error("bucket name must be at most 63 characters")]
    TooLong,
    #[error("bucket name must start with a lowercase letter or number")]
    InvalidStartChar,
    #[error("bucket name must end with a lowercase letter or number")]
    InvalidEndChar,
    #[error("bucket name contains invalid character: {0}")]
    InvalidChar(char),
    #[error("bucket name cannot contain consecutive periods")]
    ConsecutivePeriods,
    #[error("bucket name cannot be formatted as an IP address")]
    LooksLikeIpAddress,
}
