//! Redis cache engine.
//!
//! Keys live as `<table>/<key>` so each [`CacheTable`] is its own keyspace
//! on a shared server. Entity and usage values are Redis hashes; the dirty
//! set is a hash of member -> stamp so `HINCRBY` bumps a stamp atomically.

use crate::keys::{CacheKey, CacheTable};
use crate::store::CacheStore;
use async_trait::async_trait;
use objmeta_common::{Error, Result};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError, Script};
use std::collections::HashMap;
use tracing::info;

const SCAN_COUNT: usize = 500;

/// Deletes each `(member, stamp)` pair whose stamp is unchanged and returns
/// the deleted members.
const REMOVE_IF_UNCHANGED: &str = r"
local removed = {}
for i = 1, #ARGV, 2 do
    if redis.call('HGET', KEYS[1], ARGV[i]) == ARGV[i + 1] then
        redis.call('HDEL', KEYS[1], ARGV[i])
        table.insert(removed, ARGV[i])
    end
end
return removed
";

fn map_redis_error(e: &RedisError) -> Error {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
    {
        Error::ConnectionFailed(format!("redis: {e}"))
    } else {
        Error::cache(format!("redis: {e}"))
    }
}

fn physical_key(key: &CacheKey) -> String {
    format!("{}/{}", key.table.as_str(), key.key)
}

fn table_prefix(table: CacheTable) -> String {
    format!("{}/", table.as_str())
}

fn parse_stamp(set: &CacheKey, member: &str, raw: &str) -> Result<u64> {
    raw.parse::<u64>().map_err(|_| {
        Error::cache(format!("member '{member}' of {set} has a bad stamp {raw:?}"))
    })
}

/// [`CacheStore`] backed by a Redis server
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
    remove_if_unchanged: Script,
}

impl RedisCache {
    /// Connect to `url` (e.g. `redis://127.0.0.1:6379/0`)
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| Error::Configuration(format!("invalid cache url {url}: {e}")))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| map_redis_error(&e))?;
        info!("Connected to redis cache at {}", url);
        Ok(Self {
            conn,
            remove_if_unchanged: Script::new(REMOVE_IF_UNCHANGED),
        })
    }
}

#[async_trait]
impl CacheStore for RedisCache {
    fn name(&self) -> &str {
        "redis"
    }

    async fn get_fields(&self, key: &CacheKey) -> Result<Option<HashMap<String, String>>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn
            .hgetall(physical_key(key))
            .await
            .map_err(|e| map_redis_error(&e))?;
        // Redis never keeps an empty hash
        Ok((!fields.is_empty()).then_some(fields))
    }

    async fn set_fields(&self, key: &CacheKey, fields: &HashMap<String, String>) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let items: Vec<(&str, &str)> = fields
            .iter()
            .map(|(f, v)| (f.as_str(), v.as_str()))
            .collect();
        let mut conn = self.conn.clone();
        let (): () = conn
            .hset_multiple(physical_key(key), items.as_slice())
            .await
            .map_err(|e| map_redis_error(&e))?;
        Ok(())
    }

    async fn remove(&self, key: &CacheKey) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: usize = conn
            .del(physical_key(key))
            .await
            .map_err(|e| map_redis_error(&e))?;
        Ok(())
    }

    async fn exists(&self, key: &CacheKey) -> Result<bool> {
        let mut conn = self.conn.clone();
        conn.exists(physical_key(key))
            .await
            .map_err(|e| map_redis_error(&e))
    }

    async fn incr_field(&self, key: &CacheKey, field: &str, delta: i64) -> Result<i64> {
        let mut conn = self.conn.clone();
        conn.hincr(physical_key(key), field, delta)
            .await
            .map_err(|e| map_redis_error(&e))
    }

    async fn get_field_int(&self, key: &CacheKey, field: &str) -> Result<Option<i64>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .hget(physical_key(key), field)
            .await
            .map_err(|e| map_redis_error(&e))?;
        raw.map(|raw| {
            raw.parse::<i64>().map_err(|_| {
                Error::cache(format!(
                    "field '{field}' of {key} holds a non-integer value {raw:?}"
                ))
            })
        })
        .transpose()
    }

    async fn set_field_if_absent(
        &self,
        key: &CacheKey,
        field: &str,
        value: &str,
    ) -> Result<bool> {
        let mut conn = self.conn.clone();
        conn.hset_nx(physical_key(key), field, value)
            .await
            .map_err(|e| map_redis_error(&e))
    }

    async fn add_member(&self, set: &CacheKey, member: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        conn.hincr(physical_key(set), member, 1_u64)
            .await
            .map_err(|e| map_redis_error(&e))
    }

    async fn get_all_members(&self, set: &CacheKey) -> Result<HashMap<String, u64>> {
        let mut conn = self.conn.clone();
        let raw: HashMap<String, String> = conn
            .hgetall(physical_key(set))
            .await
            .map_err(|e| map_redis_error(&e))?;
        raw.into_iter()
            .map(|(member, stamp)| {
                let stamp = parse_stamp(set, &member, &stamp)?;
                Ok((member, stamp))
            })
            .collect()
    }

    async fn remove_members(&self, set: &CacheKey, members: &[String]) -> Result<usize> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        conn.hdel(physical_key(set), members)
            .await
            .map_err(|e| map_redis_error(&e))
    }

    async fn remove_members_if_unchanged(
        &self,
        set: &CacheKey,
        members: &[(String, u64)],
    ) -> Result<Vec<String>> {
        if members.is_empty() {
            return Ok(Vec::new());
        }
        let mut invocation = self.remove_if_unchanged.key(physical_key(set));
        for (member, stamp) in members {
            invocation.arg(member).arg(stamp.to_string());
        }
        let mut conn = self.conn.clone();
        let removed: Vec<String> = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_redis_error(&e))?;
        Ok(removed)
    }

    async fn keys(&self, table: CacheTable, pattern: &str) -> Result<Vec<String>> {
        let prefix = table_prefix(table);
        let pattern = format!("{prefix}{pattern}");
        let mut conn = self.conn.clone();
        let mut cursor = 0_u64;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await
                .map_err(|e| map_redis_error(&e))?;
            keys.extend(
                batch
                    .into_iter()
                    .filter_map(|k| k.strip_prefix(prefix.as_str()).map(str::to_string)),
            );
            if next == 0 {
                break;
            }
            cursor = next;
        }
        // SCAN may return a key more than once
        keys.sort_unstable();
        keys.dedup();
        Ok(keys)
    }
}
