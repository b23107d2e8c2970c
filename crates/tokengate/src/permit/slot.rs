//! Caller-side handles for one admission.
//!
//! The handles use ownership to make release happen exactly once:
//! - `Acquire` dropped before it resolves → `Cancel` (flagged in the queue,
//!   recycled on its turn)
//! - `Acquire` resolved → `ActiveSlot`
//! - `ActiveSlot` released or dropped → `Release`

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::{mpsc, oneshot};

use super::Token;
use crate::id::RequestId;
use crate::limiter::{Command, Grant, LimiterError, Ticket};

/// Pending admission returned by [`TokenLimiter::acquire`](crate::TokenLimiter::acquire).
///
/// The request is already queued when this value is created; awaiting it
/// waits for the grant.
#[must_use = "dropping an Acquire withdraws the request"]
pub struct Acquire {
    ticket: Ticket,
    request_id: RequestId,
    limiter: Arc<str>,
    grant_rx: oneshot::Receiver<Grant>,
    commands: mpsc::UnboundedSender<Command>,
    settled: bool,
}

impl Acquire {
    pub(crate) fn new(
        ticket: Ticket,
        request_id: RequestId,
        limiter: Arc<str>,
        grant_rx: oneshot::Receiver<Grant>,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            ticket,
            request_id,
            limiter,
            grant_rx,
            commands,
            settled: false,
        }
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }
}

impl Future for Acquire {
    type Output = Result<ActiveSlot, LimiterError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.settled {
            return Poll::Ready(Err(LimiterError::Consumed));
        }

        match Pin::new(&mut this.grant_rx).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(grant)) => {
                this.settled = true;
                Poll::Ready(Ok(ActiveSlot {
                    ticket: this.ticket,
                    grant,
                    limiter: Arc::clone(&this.limiter),
                    commands: this.commands.clone(),
                }))
            }
            Poll::Ready(Err(_)) => {
                this.settled = true;
                Poll::Ready(Err(LimiterError::Defunct {
                    limiter: this.limiter.to_string(),
                }))
            }
        }
    }
}

impl Drop for Acquire {
    fn drop(&mut self) {
        if !self.settled {
            tracing::debug!(
                limiter = %self.limiter,
                request_id = %self.request_id,
                "withdrawing request before it was served"
            );
            let _ = self.commands.send(Command::Cancel {
                ticket: self.ticket,
            });
        }
    }
}

/// A granted slot. The protected work runs while this is held.
///
/// Dropping the slot releases it: the concurrency token goes back at once,
/// the rate token comes back one rate window after the grant.
#[must_use = "dropping an ActiveSlot releases it immediately"]
pub struct ActiveSlot {
    ticket: Ticket,
    grant: Grant,
    limiter: Arc<str>,
    commands: mpsc::UnboundedSender<Command>,
}

impl ActiveSlot {
    pub fn request_id(&self) -> &RequestId {
        &self.grant.request_id
    }

    pub fn rate_token(&self) -> Option<Token> {
        self.grant.rate_token
    }

    pub fn concurrency_token(&self) -> Option<Token> {
        self.grant.concurrency_token
    }

    pub fn grant(&self) -> &Grant {
        &self.grant
    }

    pub fn release(self) {}
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        tracing::trace!(limiter = %self.limiter, grant = %self.grant, "releasing slot");
        if self
            .commands
            .send(Command::Release {
                ticket: self.ticket,
            })
            .is_err()
        {
            tracing::warn!(
                limiter = %self.limiter,
                grant = %self.grant,
                "slot released after limiter stopped"
            );
        }
    }
}

impl std::fmt::Debug for ActiveSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveSlot")
            .field("limiter", &self.limiter)
            .field("grant", &self.grant)
            .finish()
    }
}
