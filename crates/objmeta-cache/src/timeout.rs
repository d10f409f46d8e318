//! Per-call deadline for any cache engine.

use crate::keys::{CacheKey, CacheTable};
use crate::store::CacheStore;
use async_trait::async_trait;
use objmeta_common::{Error, Result};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Wraps a [`CacheStore`] so every call fails with [`Error::Timeout`] once
/// the deadline passes.
///
/// A timed-out write may or may not have been applied by the engine.
pub struct TimeoutCache {
    inner: Arc<dyn CacheStore>,
    timeout: Duration,
}

impl TimeoutCache {
    pub fn new(inner: Arc<dyn CacheStore>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn run<T>(&self, op: &str, fut: impl Future<Output = Result<T>> + Send) -> Result<T> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .unwrap_or_else(|_| {
                Err(Error::Timeout(format!(
                    "cache {} {op} exceeded {:?}",
                    self.inner.name(),
                    self.timeout
                )))
            })
    }
}

#[async_trait]
impl CacheStore for TimeoutCache {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn get_fields(&self, key: &CacheKey) -> Result<Option<HashMap<String, String>>> {
        self.run("HGETALL", self.inner.get_fields(key)).await
    }

    async fn set_fields(&self, key: &CacheKey, fields: &HashMap<String, String>) -> Result<()> {
        self.run("HMSET", self.inner.set_fields(key, fields)).await
    }

    async fn remove(&self, key: &CacheKey) -> Result<()> {
        self.run("DEL", self.inner.remove(key)).await
    }

    async fn exists(&self, key: &CacheKey) -> Result<bool> {
        self.run("EXISTS", self.inner.exists(key)).await
    }

    async fn incr_field(&self, key: &CacheKey, field: &str, delta: i64) -> Result<i64> {
        self.run("HINCRBY", self.inner.incr_field(key, field, delta))
            .await
    }

    async fn get_field_int(&self, key: &CacheKey, field: &str) -> Result<Option<i64>> {
        self.run("HGET", self.inner.get_field_int(key, field)).await
    }

    async fn set_field_if_absent(
        &self,
        key: &CacheKey,
        field: &str,
        value: &str,
    ) -> Result<bool> {
        self.run("HSETNX", self.inner.set_field_if_absent(key, field, value))
            .await
    }

    async fn add_member(&self, set: &CacheKey, member: &str) -> Result<u64> {
        self.run("HINCRBY", self.inner.add_member(set, member)).await
    }

    async fn get_all_members(&self, set: &CacheKey) -> Result<HashMap<String, u64>> {
        self.run("HGETALL", self.inner.get_all_members(set)).await
    }

    async fn remove_members(&self, set: &CacheKey, members: &[String]) -> Result<usize> {
        self.run("HDEL", self.inner.remove_members(set, members)).await
    }

    async fn remove_members_if_unchanged(
        &self,
        set: &CacheKey,
        members: &[(String, u64)],
    ) -> Result<Vec<String>> {
        self.run(
            "HDEL-IF-EQ",
            self.inner.remove_members_if_unchanged(set, members),
        )
        .await
    }

    async fn keys(&self, table: CacheTable, pattern: &str) -> Result<Vec<String>> {
        self.run("KEYS", self.inner.keys(table, pattern)).await
    }
}
