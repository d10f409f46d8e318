//! Archival retrieval interface

use crate::error::{ArchiveError, ArchiveResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Byte stream of a finished retrieval job
pub type ArchiveStream = BoxStream<'static, ArchiveResult<Bytes>>;

/// How fast (and how expensively) the archive is restored
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetrievalTier {
    Expedited,
    #[default]
    Standard,
    Bulk,
}

impl RetrievalTier {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Expedited => "Expedited",
            Self::Standard => "Standard",
            Self::Bulk => "Bulk",
        }
    }
}

impl fmt::Display for RetrievalTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RetrievalTier {
    type Err = ArchiveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Expedited" => Ok(Self::Expedited),
            "Standard" => Ok(Self::Standard),
            "Bulk" => Ok(Self::Bulk),
            other => Err(ArchiveError::InvalidParameter(format!(
                "unknown retrieval tier: {other}"
            ))),
        }
    }
}

/// Parameters of an archive retrieval job
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetrievalRequest {
    pub account_id: String,
    pub vault_name: String,
    pub archive_id: String,
    /// Topic notified when the job completes
    pub notification_topic: String,
    pub tier: RetrievalTier,
    /// Bucket the restored object is written to
    pub output_bucket: String,
}

impl RetrievalRequest {
    pub fn new(
        account_id: impl Into<String>,
        vault_name: impl Into<String>,
        archive_id: impl Into<String>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            vault_name: vault_name.into(),
            archive_id: archive_id.into(),
            notification_topic: String::new(),
            tier: RetrievalTier::default(),
            output_bucket: String::new(),
        }
    }

    #[must_use]
    pub fn with_notification_topic(mut self, topic: impl Into<String>) -> Self {
        self.notification_topic = topic.into();
        self
    }

    #[must_use]
    pub const fn with_tier(mut self, tier: RetrievalTier) -> Self {
        self.tier = tier;
        self
    }

    #[must_use]
    pub fn with_output_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.output_bucket = bucket.into();
        self
    }

    /// Reject requests the remote would refuse anyway
    pub fn validate(&self) -> ArchiveResult<()> {
        for (name, value) in [
            ("account id", &self.account_id),
            ("vault name", &self.vault_name),
            ("archive id", &self.archive_id),
        ] {
            if value.is_empty() {
                return Err(ArchiveError::MissingParameter(format!("{name} is required")));
            }
        }
        Ok(())
    }
}

/// Progress of a retrieval job
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct JobStatus {
    pub completed: bool,
    /// `InProgress`, `Succeeded` or `Failed`
    pub status_code: String,
}

impl JobStatus {
    pub const IN_PROGRESS: &'static str = "InProgress";
    pub const SUCCEEDED: &'static str = "Succeeded";
    pub const FAILED: &'static str = "Failed";

    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.completed && self.status_code == Self::SUCCEEDED
    }
}

/// Archival retrieval service
#[async_trait]
pub trait ArchiveClient: Send + Sync {
    /// Start restoring an archive; returns the job id
    async fn initiate_retrieval(&self, request: &RetrievalRequest) -> ArchiveResult<String>;

    async fn job_status(
        &self,
        account_id: &str,
        vault_name: &str,
        job_id: &str,
    ) -> ArchiveResult<JobStatus>;

    /// Stream the restored bytes of a completed job
    async fn job_output(
        &self,
        account_id: &str,
        vault_name: &str,
        job_id: &str,
    ) -> ArchiveResult<ArchiveStream>;
}
