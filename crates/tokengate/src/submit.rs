//! Job submission seam.
//!
//! `LimiterService` never runs work itself. It hands a job to a
//! [`JobSubmitter`], which decides when the job runs (a durable queue, a
//! worker pool, or the tokio runtime directly). The only contract is that a
//! submitted job eventually runs exactly once.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::Instrument;

use crate::id::RequestId;
use crate::limiter::TokenLimiter;

/// Unit handed to a submitter. Acquires the slot, runs the work, releases.
pub type Job = BoxFuture<'static, ()>;

/// What a submitter needs to know about the service a job belongs to.
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    name: Arc<str>,
    limiter: TokenLimiter,
}

impl ServiceDescriptor {
    pub fn new(name: impl Into<Arc<str>>, limiter: TokenLimiter) -> Self {
        Self {
            name: name.into(),
            limiter,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn limiter(&self) -> &TokenLimiter {
        &self.limiter
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SubmitError {
    #[error("job submitter is shut down")]
    Closed,
    #[error("job {job_id} rejected by submitter: {reason}")]
    Rejected { job_id: RequestId, reason: String },
}

#[async_trait]
pub trait JobSubmitter: Send + Sync {
    /// Schedule `job` on behalf of `service`.
    ///
    /// On `Ok`, the job must eventually be polled to completion exactly once.
    /// On `Err`, it must never run.
    async fn submit(
        &self,
        service: &ServiceDescriptor,
        job_id: &RequestId,
        job: Job,
    ) -> Result<(), SubmitError>;
}

/// Runs each job as its own tokio task, immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpawnSubmitter;

#[async_trait]
impl JobSubmitter for SpawnSubmitter {
    async fn submit(
        &self,
        service: &ServiceDescriptor,
        job_id: &RequestId,
        job: Job,
    ) -> Result<(), SubmitError> {
        let span = tracing::debug_span!("limited_job", service = %service.name(), %job_id);
        tokio::spawn(job.instrument(span));
        Ok(())
    }
}
