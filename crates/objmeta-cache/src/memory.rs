//! In-process cache engine.
//!
//! Each key maps to a hash held in a `DashMap` shard. Every operation holds
//! the shard lock for its whole read-modify-write, which gives the same
//! per-command atomicity a remote engine provides for `HINCRBY`/`HSETNX`.

use crate::keys::{CacheKey, CacheTable, glob_match};
use crate::store::CacheStore;
use async_trait::async_trait;
use dashmap::DashMap;
use objmeta_common::{Error, Result};
use std::collections::HashMap;

type Hash = HashMap<String, String>;

fn parse_int(key: &CacheKey, field: &str, raw: &str) -> Result<i64> {
    raw.parse::<i64>().map_err(|_| {
        Error::cache(format!(
            "field '{field}' of {key} holds a non-integer value {raw:?}"
        ))
    })
}

/// In-process [`CacheStore`] implementation
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: DashMap<(CacheTable, String), Hash>,
}

impl MemoryCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys across all tables
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every key (an engine restart without persistence)
    pub fn clear(&self) {
        self.entries.clear();
    }

    fn slot(key: &CacheKey) -> (CacheTable, String) {
        (key.table, key.key.clone())
    }

    fn drop_if_empty(&self, slot: &(CacheTable, String)) {
        self.entries.remove_if(slot, |_, hash| hash.is_empty());
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get_fields(&self, key: &CacheKey) -> Result<Option<HashMap<String, String>>> {
        Ok(self.entries.get(&Self::slot(key)).map(|h| h.clone()))
    }

    async fn set_fields(&self, key: &CacheKey, fields: &HashMap<String, String>) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut hash = self.entries.entry(Self::slot(key)).or_default();
        for (field, value) in fields {
            hash.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn remove(&self, key: &CacheKey) -> Result<()> {
        self.entries.remove(&Self::slot(key));
        Ok(())
    }

    async fn exists(&self, key: &CacheKey) -> Result<bool> {
        Ok(self.entries.contains_key(&Self::slot(key)))
    }

    async fn incr_field(&self, key: &CacheKey, field: &str, delta: i64) -> Result<i64> {
        let mut hash = self.entries.entry(Self::slot(key)).or_default();
        let current = match hash.get(field) {
            Some(raw) => parse_int(key, field, raw)?,
            None => 0,
        };
        let updated = current
            .checked_add(delta)
            .ok_or_else(|| Error::cache(format!("increment of {key}.{field} overflows")))?;
        hash.insert(field.to_string(), updated.to_string());
        Ok(updated)
    }

    async fn get_field_int(&self, key: &CacheKey, field: &str) -> Result<Option<i64>> {
        let Some(hash) = self.entries.get(&Self::slot(key)) else {
            return Ok(None);
        };
        hash.get(field)
            .map(|raw| parse_int(key, field, raw))
            .transpose()
    }

    async fn set_field_if_absent(
        &self,
        key: &CacheKey,
        field: &str,
        value: &str,
    ) -> Result<bool> {
        let mut hash = self.entries.entry(Self::slot(key)).or_default();
        if hash.contains_key(field) {
            return Ok(false);
        }
        hash.insert(field.to_string(), value.to_string());
        Ok(true)
    }

    async fn add_member(&self, set: &CacheKey, member: &str) -> Result<u64> {
        let mut hash = self.entries.entry(Self::slot(set)).or_default();
        let stamp = match hash.get(member) {
            Some(raw) => raw.parse::<u64>().map_err(|_| {
                Error::cache(format!("member '{member}' of {set} has a bad stamp {raw:?}"))
            })?,
            None => 0,
        } + 1;
        hash.insert(member.to_string(), stamp.to_string());
        Ok(stamp)
    }

    async fn get_all_members(&self, set: &CacheKey) -> Result<HashMap<String, u64>> {
        let Some(hash) = self.entries.get(&Self::slot(set)) else {
            return Ok(HashMap::new());
        };
        hash.iter()
            .map(|(member, raw)| {
                raw.parse::<u64>()
                    .map(|stamp| (member.clone(), stamp))
                    .map_err(|_| {
                        Error::cache(format!("member '{member}' of {set} has a bad stamp {raw:?}"))
                    })
            })
            .collect()
    }

    async fn remove_members(&self, set: &CacheKey, members: &[String]) -> Result<usize> {
        let slot = Self::slot(set);
        let removed = match self.entries.get_mut(&slot) {
            Some(mut hash) => members
                .iter()
                .filter(|m| hash.remove(m.as_str()).is_some())
                .count(),
            None => 0,
        };
        self.drop_if_empty(&slot);
        Ok(removed)
    }

    async fn remove_members_if_unchanged(
        &self,
        set: &CacheKey,
        members: &[(String, u64)],
    ) -> Result<Vec<String>> {
        let slot = Self::slot(set);
        let mut removed = Vec::with_capacity(members.len());
        if let Some(mut hash) = self.entries.get_mut(&slot) {
            for (member, stamp) in members {
                let unchanged = hash
                    .get(member)
                    .is_some_and(|raw| raw.parse::<u64>().ok() == Some(*stamp));
                if unchanged {
                    hash.remove(member);
                    removed.push(member.clone());
                }
            }
        }
        self.drop_if_empty(&slot);
        Ok(removed)
    }

    async fn keys(&self, table: CacheTable, pattern: &str) -> Result<Vec<String>> {
        Ok(self
            .entries
            .iter()
            .filter(|e| e.key().0 == table && glob_match(pattern, &e.key().1))
            .map(|e| e.key().1.clone())
            .collect())
    }
}
