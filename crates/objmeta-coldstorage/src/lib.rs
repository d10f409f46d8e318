//! objmeta Cold Storage - archival retrieval client
//!
//! Restoring an archived object is a three step job: initiate a retrieval,
//! poll its status, then stream the output. [`ArchiveClient`] is the seam;
//! [`HttpArchiveClient`] talks to a Glacier-style REST endpoint and
//! [`MemoryArchiveClient`] is an in-process fake.

pub mod client;
pub mod error;
pub mod http;
pub mod memory;

pub use client::{ArchiveClient, ArchiveStream, JobStatus, RetrievalRequest, RetrievalTier};
pub use error::{ArchiveError, ArchiveResult};
pub use http::HttpArchiveClient;
pub use memory::{ArchiveOp, MemoryArchiveClient};
