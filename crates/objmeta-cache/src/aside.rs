//! Cache-aside reads.
//!
//! Check the cache, fall back to a loader on miss and optionally write the
//! loaded entity back. Cache errors on this path degrade to a load; only a
//! cached value that cannot be decoded is reported as an error.

use crate::keys::CacheKey;
use crate::store::CacheStore;
use dashmap::DashMap;
use objmeta_common::{CacheEntity, Error, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

enum Lookup<T> {
    Hit(T),
    Miss,
}

async fn lookup<T: CacheEntity>(cache: &dyn CacheStore, key: &CacheKey) -> Result<Lookup<T>> {
    match cache.get_fields(key).await {
        Ok(Some(fields)) => T::from_fields(&fields).map(Lookup::Hit).map_err(|e| {
            error!(key = %key, error = %e, "cached entry cannot be decoded");
            Error::internal(format!("corrupt cache entry {key}: {e}"))
        }),
        Ok(None) => Ok(Lookup::Miss),
        Err(e) => {
            warn!(key = %key, error = %e, "cache read failed, loading from store");
            Ok(Lookup::Miss)
        }
    }
}

async fn warm<T: CacheEntity>(cache: &dyn CacheStore, key: &CacheKey, entity: &T) {
    let fields = match entity.to_fields() {
        Ok(fields) => fields,
        Err(e) => {
            warn!(key = %key, error = %e, "failed to encode entity for cache");
            return;
        }
    };
    if let Err(e) = cache.set_fields(key, &fields).await {
        warn!(key = %key, error = %e, "failed to warm cache");
    }
}

/// Read `key` through the cache.
///
/// On a miss `loader` runs exactly once; its result is written back when
/// `warm_on_miss` is set. A loader error (e.g. not found) is returned as is.
pub async fn get_or_load<T, F, Fut>(
    cache: &dyn CacheStore,
    key: &CacheKey,
    loader: F,
    warm_on_miss: bool,
) -> Result<T>
where
    T: CacheEntity,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    if let Lookup::Hit(entity) = lookup(cache, key).await? {
        return Ok(entity);
    }
    debug!(key = %key, "cache miss");

    let entity = loader().await?;
    if warm_on_miss {
        warm(cache, key, &entity).await;
    }
    Ok(entity)
}

/// Collapses concurrent misses on the same key into a single load.
///
/// Callers that miss take a per-key lock, then look at the cache again
/// before loading: whoever held the lock first has usually warmed it.
#[derive(Default)]
pub struct SingleFlight {
    inflight: DashMap<CacheKey, Arc<Mutex<()>>>,
}

impl SingleFlight {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys with a load in progress
    #[must_use]
    pub fn inflight(&self) -> usize {
        self.inflight.len()
    }

    /// Same contract as [`get_or_load`] with the write-back always enabled.
    pub async fn get_or_load<T, F, Fut>(
        &self,
        cache: &dyn CacheStore,
        key: &CacheKey,
        loader: F,
    ) -> Result<T>
    where
        T: CacheEntity,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Lookup::Hit(entity) = lookup(cache, key).await? {
            return Ok(entity);
        }

        let gate = Arc::clone(self.inflight.entry(key.clone()).or_default().value());
        let result = {
            let _turn = gate.lock().await;
            match lookup(cache, key).await {
                Ok(Lookup::Hit(entity)) => Ok(entity),
                Ok(Lookup::Miss) => {
                    debug!(key = %key, "cache miss");
                    match loader().await {
                        Ok(entity) => {
                            warm(cache, key, &entity).await;
                            Ok(entity)
                        }
                        Err(e) => Err(e),
                    }
                }
                Err(e) => Err(e),
            }
        };
        drop(gate);
        self.inflight
            .remove_if(key, |_, gate| Arc::strong_count(gate) == 1);
        result
    }
}
