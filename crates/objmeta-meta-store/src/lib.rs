//! objmeta Metadata Store - persistent bucket metadata
//!
//! [`PersistentStore`] is the interface the metadata service and the usage
//! accountant consume; [`MetaStore`] implements it on redb.

pub mod persistent;
pub mod store;
pub mod tables;
pub mod timeout;

// Re-exports
pub use persistent::{BucketSnapshot, PersistentStore, UsageUpdateReport};
pub use store::{MetaStore, MetaStoreError, MetaStoreResult};
pub use timeout::TimeoutStore;
