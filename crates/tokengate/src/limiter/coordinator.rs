//! Coordinator - the single owner of limiter state.
//!
//! One event loop handles, in order:
//! - commands from handles (submit, release, cancel, stats)
//! - rate tokens whose window has elapsed
//! - the idle deadline
//!
//! After every event it pairs queued requests with free tokens.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::time::DelayQueue;

use super::idle::IdleTimer;
use super::{Command, Grant, Ticket};
use crate::config::{IdleHook, LimiterConfig};
use crate::id::RequestId;
use crate::permit::{PoolKind, Token, TokenPool};
use crate::stats::{LimiterStats, PoolStats};

struct PendingRequest {
    ticket: Ticket,
    request_id: RequestId,
    arrival: u64,
    reply: oneshot::Sender<Grant>,
    cancelled: bool,
}

pub(super) struct Coordinator {
    name: Arc<str>,
    rate_window: Duration,
    rate: Option<TokenPool>,
    concurrency: Option<TokenPool>,
    pending: VecDeque<PendingRequest>,
    /// Grants produced but not yet released or cancelled.
    granted: HashMap<Ticket, Grant>,
    recycling: DelayQueue<Token>,
    idle: IdleTimer,
    next_arrival: u64,
    granted_total: u64,
    cancelled_total: u64,
}

impl Coordinator {
    pub fn new(name: Arc<str>, config: &LimiterConfig) -> Self {
        Self {
            name,
            rate_window: config.rate_window(),
            rate: config
                .rate_limit()
                .map(|size| TokenPool::new(PoolKind::Rate, size)),
            concurrency: config
                .concurrency_limit()
                .map(|size| TokenPool::new(PoolKind::Concurrency, size)),
            pending: VecDeque::new(),
            granted: HashMap::new(),
            recycling: DelayQueue::new(),
            idle: IdleTimer::new(config.idle(), config.on_idle.clone()),
            next_arrival: 0,
            granted_total: 0,
            cancelled_total: 0,
        }
    }

    /// Run until every sender is gone.
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                Some(expired) = std::future::poll_fn(|cx| self.recycling.poll_expired(cx)),
                    if !self.recycling.is_empty() =>
                {
                    self.recycle_rate(expired.into_inner());
                }
                _ = self.idle.expired(), if self.idle.is_armed() => {
                    if self.idle.fire() {
                        tracing::debug!(limiter = %self.name, "idle");
                        if let Some(hook) = self.idle.hook() {
                            tokio::spawn(run_idle_hook(Arc::clone(&self.name), Arc::clone(hook)));
                        }
                    }
                }
            }

            self.dispatch();
        }

        tracing::debug!(
            limiter = %self.name,
            pending = self.pending.len(),
            "All limiter handles dropped, coordinator stopping"
        );
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Submit {
                ticket,
                request_id,
                reply,
            } => {
                let arrival = self.next_arrival;
                self.next_arrival += 1;
                tracing::trace!(limiter = %self.name, %request_id, %ticket, arrival, "queued");
                self.pending.push_back(PendingRequest {
                    ticket,
                    request_id,
                    arrival,
                    reply,
                    cancelled: false,
                });
                self.idle.increment();
            }
            Command::Release { ticket } => self.release(ticket, false),
            Command::Cancel { ticket } => self.cancel(ticket),
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
        }
    }

    fn can_grant(&self) -> bool {
        !self.pending.is_empty()
            && self.rate.as_ref().is_none_or(TokenPool::has_available)
            && self.concurrency.as_ref().is_none_or(TokenPool::has_available)
    }

    /// Pair queued requests with tokens, strictly in arrival order.
    fn dispatch(&mut self) {
        while self.can_grant() {
            let Some(request) = self.pending.pop_front() else {
                break;
            };

            let grant = Grant {
                request_id: request.request_id,
                rate_token: self.rate.as_mut().and_then(TokenPool::take),
                concurrency_token: self.concurrency.as_mut().and_then(TokenPool::take),
            };
            self.granted_total += 1;

            // The rate window counts from the grant, whatever happens to the slot.
            if let Some(token) = grant.rate_token {
                self.recycling.insert(token, self.rate_window);
            }

            if request.cancelled {
                tracing::debug!(
                    limiter = %self.name,
                    grant = %grant,
                    arrival = request.arrival,
                    "recycling grant of withdrawn request"
                );
                self.cancelled_total += 1;
                self.recycle_concurrency(&grant, true);
                self.idle.decrement();
                continue;
            }

            tracing::debug!(limiter = %self.name, grant = %grant, arrival = request.arrival, "serving");
            self.granted.insert(request.ticket, grant.clone());
            if request.reply.send(grant).is_err() {
                // The Acquire was dropped; its Cancel is already queued behind us.
                tracing::trace!(limiter = %self.name, ticket = %request.ticket, "grant not received");
            }
        }
    }

    fn cancel(&mut self, ticket: Ticket) {
        if let Some(request) = self.pending.iter_mut().find(|r| r.ticket == ticket) {
            tracing::debug!(
                limiter = %self.name,
                request_id = %request.request_id,
                "request withdrawn while queued"
            );
            request.cancelled = true;
            return;
        }
        self.cancelled_total += 1;
        self.release(ticket, true);
    }

    fn release(&mut self, ticket: Ticket, cancelled: bool) {
        let Some(grant) = self.granted.remove(&ticket) else {
            panic!(
                "limiter {}: release of {ticket} which holds no token and is not pending cancellation",
                self.name
            );
        };
        self.recycle_concurrency(&grant, cancelled);
        self.idle.decrement();
    }

    fn recycle_concurrency(&mut self, grant: &Grant, cancelled: bool) {
        if let (Some(pool), Some(token)) = (self.concurrency.as_mut(), grant.concurrency_token) {
            tracing::debug!(
                limiter = %self.name,
                grant = %grant,
                cancelled,
                "recycling concurrency token"
            );
            pool.recycle(token);
        }
    }

    fn recycle_rate(&mut self, token: Token) {
        if let Some(pool) = self.rate.as_mut() {
            tracing::debug!(limiter = %self.name, %token, "recycling rate token");
            pool.recycle(token);
        }
    }

    fn stats(&self) -> LimiterStats {
        let pool_stats = |pool: &TokenPool| PoolStats {
            size: pool.size(),
            available: pool.available(),
            held: pool.held(),
        };
        LimiterStats {
            name: self.name.to_string(),
            rate: self.rate.as_ref().map(pool_stats),
            concurrency: self.concurrency.as_ref().map(pool_stats),
            pending: self.pending.len(),
            outstanding: self.idle.outstanding(),
            granted_total: self.granted_total,
            cancelled_total: self.cancelled_total,
        }
    }
}

/// Run the caller's idle hook on the blocking pool. A panic in the hook is
/// logged and the coordinator keeps granting.
async fn run_idle_hook(name: Arc<str>, hook: IdleHook) {
    if let Err(e) = tokio::task::spawn_blocking(move || hook()).await {
        tracing::error!(limiter = %name, error = %e, "Idle hook failed");
    }
}

/// Log the coordinator's exit. A panic leaves the limiter unable to grant
/// anything for the rest of the process; it is reported and never restarted.
pub(super) async fn watch(name: Arc<str>, task: JoinHandle<()>) {
    match task.await {
        Ok(()) => tracing::debug!(limiter = %name, "Coordinator stopped"),
        Err(e) if e.is_panic() => {
            tracing::error!(
                limiter = %name,
                fatal = true,
                error = %e,
                "Token coordinator panicked - limiter will not grant further slots"
            );
        }
        Err(e) => {
            tracing::error!(
                limiter = %name,
                fatal = true,
                error = %e,
                "Token coordinator cancelled - limiter will not grant further slots"
            );
        }
    }
}
