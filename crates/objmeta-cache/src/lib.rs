//! objmeta Cache - key-value cache abstraction
//!
//! The cache holds per-entity hashes (field -> string value), usage
//! counters updated with an atomic increment, and the dirty-bucket trigger
//! set. [`CacheStore`] is the engine seam; [`RedisCache`] is the production
//! engine, [`MemoryCache`] the in-process one, and [`TimeoutCache`] applies a
//! per-call deadline to any engine.

pub mod aside;
pub mod keys;
pub mod memory;
pub mod redis_cache;
pub mod store;
pub mod timeout;

pub use aside::{SingleFlight, get_or_load};
pub use keys::{CacheKey, CacheTable, glob_match};
pub use memory::MemoryCache;
pub use redis_cache::RedisCache;
pub use store::CacheStore;
pub use timeout::TimeoutCache;
