//! LimiterService: run work only while holding a slot.
//!
//! `run` returns a [`LimitedStream`]. Polling it submits a job; when the job
//! runs it acquires a slot, drives the caller's stream and forwards every
//! item. The slot is released:
//! - on the first item (`ReleasePolicy::FirstResult`, the default), or
//! - when the work ends (`ReleasePolicy::Completion`), and in any case
//! - when the caller drops the `LimitedStream`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::{FutureExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::config::LimiterConfig;
use crate::id::RequestId;
use crate::limiter::{LimiterError, TokenLimiter};
use crate::permit::ActiveSlot;
use crate::submit::{JobSubmitter, ServiceDescriptor, SpawnSubmitter, SubmitError};

const OUTCOME_BUFFER: usize = 16;

/// When a running unit of work gives its slot back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReleasePolicy {
    /// Release as soon as the work yields its first item or ends.
    #[default]
    FirstResult,
    /// Hold the slot until the work ends.
    Completion,
}

/// A named limiter wired to a job submitter.
#[derive(Clone)]
pub struct LimiterService {
    descriptor: ServiceDescriptor,
    submitter: Arc<dyn JobSubmitter>,
    policy: ReleasePolicy,
}

impl LimiterService {
    /// Start a limiter from `config` and submit jobs with [`SpawnSubmitter`].
    pub fn new(config: LimiterConfig) -> Self {
        let name = config.name.clone();
        Self::from_limiter(name, TokenLimiter::new(config))
    }

    pub fn from_limiter(name: impl Into<Arc<str>>, limiter: TokenLimiter) -> Self {
        Self {
            descriptor: ServiceDescriptor::new(name, limiter),
            submitter: Arc::new(SpawnSubmitter),
            policy: ReleasePolicy::default(),
        }
    }

    pub fn with_submitter(mut self, submitter: Arc<dyn JobSubmitter>) -> Self {
        self.submitter = submitter;
        self
    }

    pub fn with_release_policy(mut self, policy: ReleasePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn name(&self) -> &str {
        self.descriptor.name()
    }

    pub fn limiter(&self) -> &TokenLimiter {
        self.descriptor.limiter()
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    pub fn release_policy(&self) -> ReleasePolicy {
        self.policy
    }

    /// Run `work` once a slot is granted, tagging the job with `request_id`
    /// or a short generated id.
    ///
    /// Nothing is submitted until the returned stream is first polled.
    /// Limiter-side failures arrive as a final `Err` item.
    pub fn run<S>(&self, work: S, request_id: Option<RequestId>) -> LimitedStream<S::Item>
    where
        S: Stream + Send + 'static,
        S::Item: Send + 'static,
    {
        let request_id = request_id.unwrap_or_else(RequestId::short);
        let cancel = CancellationToken::new();
        let (outcomes_tx, outcomes_rx) = mpsc::channel(OUTCOME_BUFFER);

        let job = run_job(
            self.limiter().clone(),
            request_id.clone(),
            work,
            self.policy,
            outcomes_tx,
            cancel.clone(),
        )
        .boxed();

        let submitter = Arc::clone(&self.submitter);
        let descriptor = self.descriptor.clone();
        let job_id = request_id.clone();
        let submission =
            async move { submitter.submit(&descriptor, &job_id, job).await }.boxed();

        LimitedStream {
            request_id,
            submission: Some(submission),
            outcomes: outcomes_rx,
            _cancel: cancel.drop_guard(),
        }
    }

    /// Run a single-result unit of work under a slot.
    pub async fn run_future<F>(
        &self,
        work: F,
        request_id: Option<RequestId>,
    ) -> Result<F::Output, LimiterError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let mut outcomes = self.run(futures::stream::once(work), request_id);
        match outcomes.next().await {
            Some(outcome) => outcome,
            None => Err(LimiterError::NoResult {
                request_id: outcomes.request_id().clone(),
            }),
        }
    }
}

impl std::fmt::Debug for LimiterService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimiterService")
            .field("name", &self.descriptor.name())
            .field("policy", &self.policy)
            .finish()
    }
}

/// Body of every submitted job.
async fn run_job<S>(
    limiter: TokenLimiter,
    request_id: RequestId,
    work: S,
    policy: ReleasePolicy,
    outcomes: mpsc::Sender<Result<S::Item, LimiterError>>,
    cancel: CancellationToken,
) where
    S: Stream + Send + 'static,
    S::Item: Send + 'static,
{
    let acquire = limiter.acquire(request_id.clone());
    let slot = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            // Dropping the Acquire withdraws the request.
            tracing::debug!(limiter = limiter.name(), %request_id, "caller gone before admission");
            return;
        }
        slot = acquire => slot,
    };

    let slot = match slot {
        Ok(slot) => slot,
        Err(e) => {
            tracing::warn!(limiter = limiter.name(), %request_id, error = %e, "admission failed");
            let _ = outcomes.send(Err(e)).await;
            return;
        }
    };

    let mut slot: Option<ActiveSlot> = Some(slot);
    let mut work = std::pin::pin!(work);
    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(limiter = limiter.name(), %request_id, "caller gone, aborting work");
                break;
            }
            item = work.next() => item,
        };
        let Some(item) = item else {
            break;
        };
        if policy == ReleasePolicy::FirstResult
            && let Some(slot) = slot.take()
        {
            slot.release();
        }
        if outcomes.send(Ok(item)).await.is_err() {
            break;
        }
    }

    drop(slot);
}

/// Outcome stream returned by [`LimiterService::run`].
///
/// Dropping it cancels the job: a queued request is withdrawn, running work
/// is abandoned, and the slot is released either way.
#[must_use = "streams do nothing unless polled"]
pub struct LimitedStream<T> {
    request_id: RequestId,
    submission: Option<BoxFuture<'static, Result<(), SubmitError>>>,
    outcomes: mpsc::Receiver<Result<T, LimiterError>>,
    _cancel: DropGuard,
}

impl<T> LimitedStream<T> {
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }
}

impl<T> Stream for LimitedStream<T> {
    type Item = Result<T, LimiterError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if let Some(submission) = this.submission.as_mut() {
            match submission.as_mut().poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Ok(())) => this.submission = None,
                Poll::Ready(Err(e)) => {
                    this.submission = None;
                    this.outcomes.close();
                    tracing::warn!(request_id = %this.request_id, error = %e, "job submission failed");
                    return Poll::Ready(Some(Err(e.into())));
                }
            }
        }

        this.outcomes.poll_recv(cx)
    }
}
