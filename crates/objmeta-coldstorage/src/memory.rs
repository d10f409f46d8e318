//! In-process archival service.
//!
//! Jobs complete after a fixed number of status polls. Archives are
//! registered up front; errors can be injected per operation.

use crate::client::{ArchiveClient, ArchiveStream, JobStatus, RetrievalRequest};
use crate::error::{ArchiveError, ArchiveResult};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

/// Size of the chunks job output is streamed in
const OUTPUT_CHUNK_SIZE: usize = 64 * 1024;

/// Operation an error can be injected into
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ArchiveOp {
    Initiate,
    Status,
    Output,
}

#[derive(Debug)]
struct Job {
    account_id: String,
    vault_name: String,
    archive_id: String,
    polls: u32,
}

/// In-memory [`ArchiveClient`]
#[derive(Debug, Default)]
pub struct MemoryArchiveClient {
    /// (vault, archive id) -> content
    archives: Mutex<HashMap<(String, String), Bytes>>,
    jobs: Mutex<HashMap<String, Job>>,
    polls_to_complete: u32,
    injected: Mutex<HashMap<ArchiveOp, ArchiveError>>,
}

impl MemoryArchiveClient {
    /// Jobs report completion on the `polls_to_complete`-th status call
    #[must_use]
    pub fn new(polls_to_complete: u32) -> Self {
        Self {
            polls_to_complete,
            ..Self::default()
        }
    }

    pub fn put_archive(&self, vault_name: &str, archive_id: &str, content: impl Into<Bytes>) {
        self.archives
            .lock()
            .insert((vault_name.to_string(), archive_id.to_string()), content.into());
    }

    /// Fail the next call of `op` with `err`
    pub fn inject(&self, op: ArchiveOp, err: ArchiveError) {
        self.injected.lock().insert(op, err);
    }

    /// Number of jobs ever started
    pub fn job_count(&self) -> usize {
        self.jobs.lock().len()
    }

    fn take_injected(&self, op: ArchiveOp) -> ArchiveResult<()> {
        self.injected.lock().remove(&op).map_or(Ok(()), Err)
    }

    fn check_job(job: &Job, job_id: &str, account_id: &str, vault_name: &str) -> ArchiveResult<()> {
        if job.account_id != account_id || job.vault_name != vault_name {
            return Err(ArchiveError::NotFound(format!(
                "job {job_id} not found in vault {vault_name}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ArchiveClient for MemoryArchiveClient {
    async fn initiate_retrieval(&self, request: &RetrievalRequest) -> ArchiveResult<String> {
        self.take_injected(ArchiveOp::Initiate)?;
        request.validate()?;
        let key = (request.vault_name.clone(), request.archive_id.clone());
        if !self.archives.lock().contains_key(&key) {
            return Err(ArchiveError::NotFound(format!(
                "archive {} not found in vault {}",
                request.archive_id, request.vault_name
            )));
        }

        let job_id = Uuid::new_v4().simple().to_string();
        self.jobs.lock().insert(
            job_id.clone(),
            Job {
                account_id: request.account_id.clone(),
                vault_name: request.vault_name.clone(),
                archive_id: request.archive_id.clone(),
                polls: 0,
            },
        );
        debug!(job_id = %job_id, archive_id = %request.archive_id, "retrieval job started");
        Ok(job_id)
    }

    async fn job_status(
        &self,
        account_id: &str,
        vault_name: &str,
        job_id: &str,
    ) -> ArchiveResult<JobStatus> {
        self.take_injected(ArchiveOp::Status)?;
        let mut jobs = self.jobs.lock();
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| ArchiveError::NotFound(format!("job {job_id} not found")))?;
        Self::check_job(job, job_id, account_id, vault_name)?;

        job.polls = job.polls.saturating_add(1);
        let completed = job.polls >= self.polls_to_complete;
        Ok(JobStatus {
            completed,
            status_code: if completed {
                JobStatus::SUCCEEDED
            } else {
                JobStatus::IN_PROGRESS
            }
            .to_string(),
        })
    }

    async fn job_output(
        &self,
        account_id: &str,
        vault_name: &str,
        job_id: &str,
    ) -> ArchiveResult<ArchiveStream> {
        self.take_injected(ArchiveOp::Output)?;
        let key = {
            let jobs = self.jobs.lock();
            let job = jobs
                .get(job_id)
                .ok_or_else(|| ArchiveError::NotFound(format!("job {job_id} not found")))?;
            Self::check_job(job, job_id, account_id, vault_name)?;
            if job.polls < self.polls_to_complete {
                return Err(ArchiveError::InvalidParameter(format!(
                    "job {job_id} has not completed"
                )));
            }
            (job.vault_name.clone(), job.archive_id.clone())
        };

        let content = self
            .archives
            .lock()
            .get(&key)
            .cloned()
            .ok_or_else(|| ArchiveError::NotFound(format!("archive {} was removed", key.1)))?;

        let mut chunks = Vec::with_capacity(content.len() / OUTPUT_CHUNK_SIZE + 1);
        let mut offset = 0;
        while offset < content.len() {
            let end = (offset + OUTPUT_CHUNK_SIZE).min(content.len());
            chunks.push(Ok(content.slice(offset..end)));
            offset = end;
        }
        Ok(Box::pin(futures::stream::iter(chunks)))
    }
}
