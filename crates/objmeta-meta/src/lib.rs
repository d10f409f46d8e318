//! objmeta Meta - bucket metadata service and usage accounting
//!
//! [`MetadataService`] serves cache-aside bucket and user reads.
//! [`UsageAccountant`] keeps per-bucket usage counters in the cache and
//! writes them back to the persistent store from [`flush_loop`].

pub mod accountant;
pub mod flush;
pub mod metrics;
pub mod service;

#[cfg(test)]
mod testing;

pub use accountant::{FlushReport, ReconcileReport, UsageAccountant};
pub use flush::{flush_loop, flush_once};
pub use metrics::{UsageMetrics, UsageStage};
pub use service::MetadataService;
