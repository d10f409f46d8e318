//! Cache key composition.
//!
//! Keys are `<namespace-prefix><entity-name>` inside a logical table.

use std::fmt;

pub const BUCKET_CACHE_PREFIX: &str = "bucket:";
pub const USER_CACHE_PREFIX: &str = "user:";
pub const USAGE_CACHE_PREFIX: &str = "usage:";
pub const SYNC_EVENT_BUCKET_USAGE_PREFIX: &str = "sync:bucket_usage:";

/// Member name of the dirty-bucket trigger set
pub const USAGE_TRIGGER: &str = "trigger";

/// Logical cache table (a separate keyspace on the engine)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CacheTable {
    Bucket,
    User,
}

impl CacheTable {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Bucket => "bucket",
            Self::User => "user",
        }
    }
}

/// Fully composed cache key
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub table: CacheTable,
    pub key: String,
}

impl CacheKey {
    pub fn new(table: CacheTable, prefix: &str, name: &str) -> Self {
        Self {
            table,
            key: format!("{prefix}{name}"),
        }
    }

    /// Entity hash of a bucket
    #[must_use]
    pub fn bucket(name: &str) -> Self {
        Self::new(CacheTable::Bucket, BUCKET_CACHE_PREFIX, name)
    }

    /// Entity hash of a user's bucket list
    #[must_use]
    pub fn user(uid: &str) -> Self {
        Self::new(CacheTable::User, USER_CACHE_PREFIX, uid)
    }

    /// Usage counter hash of a bucket
    #[must_use]
    pub fn usage(name: &str) -> Self {
        Self::new(CacheTable::Bucket, USAGE_CACHE_PREFIX, name)
    }

    /// The dirty-bucket trigger set
    #[must_use]
    pub fn usage_trigger() -> Self {
        Self::new(CacheTable::Bucket, SYNC_EVENT_BUCKET_USAGE_PREFIX, USAGE_TRIGGER)
    }

    /// Glob matching every usage counter key
    #[must_use]
    pub fn usage_pattern() -> String {
        format!("{USAGE_CACHE_PREFIX}*")
    }

    /// Entity name of a usage counter key, if it is one
    #[must_use]
    pub fn usage_bucket_name(key: &str) -> Option<&str> {
        key.strip_prefix(USAGE_CACHE_PREFIX)
            .filter(|name| !name.is_empty())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.table.as_str(), self.key)
    }
}

/// Glob match supporting `*` (any run) and `?` (any single char).
#[must_use]
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    // Position of the last '*' and the text index it was tried at
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }

    p[pi..].iter().all(|c| *c == '*')
}
