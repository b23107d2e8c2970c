//! TokenLimiter: FIFO admission against a rate pool and a concurrency pool.
//!
//! Flow:
//! 1. `acquire` queues the request with the coordinator and returns an `Acquire`
//! 2. The coordinator pairs the oldest request with one token from each
//!    configured pool and sends the grant back
//! 3. The caller holds the resulting `ActiveSlot` while it works
//! 4. Dropping the slot returns the concurrency token immediately; the rate
//!    token returns one rate window after its grant
//!
//! All limiter state belongs to a single coordinator task. Handles talk to it
//! over an unbounded channel, so no locks guard the pools.

mod coordinator;
mod idle;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, oneshot};

use crate::config::LimiterConfig;
use crate::id::RequestId;
use crate::permit::{Acquire, Token};
use crate::stats::LimiterStats;

use coordinator::Coordinator;

/// Process-unique identity of one `acquire` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct Ticket(u64);

impl std::fmt::Display for Ticket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub(crate) enum Command {
    Submit {
        ticket: Ticket,
        request_id: RequestId,
        reply: oneshot::Sender<Grant>,
    },
    Release {
        ticket: Ticket,
    },
    Cancel {
        ticket: Ticket,
    },
    Stats {
        reply: oneshot::Sender<LimiterStats>,
    },
}

/// A request paired with one token from each configured pool.
///
/// A `None` token means that dimension is unlimited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub request_id: RequestId,
    pub rate_token: Option<Token>,
    pub concurrency_token: Option<Token>,
}

impl std::fmt::Display for Grant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Token<{}", self.request_id)?;
        if let Some(token) = self.rate_token {
            write!(f, ",{token}")?;
        }
        if let Some(token) = self.concurrency_token {
            write!(f, ",{token}")?;
        }
        f.write_str(">")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LimiterError {
    #[error("token limiter '{limiter}' is no longer granting slots")]
    Defunct { limiter: String },
    #[error("acquire polled after completion")]
    Consumed,
    #[error(transparent)]
    Submit(#[from] crate::submit::SubmitError),
    #[error("job {request_id} finished without producing a result")]
    NoResult { request_id: RequestId },
}

struct Shared {
    name: Arc<str>,
    commands: mpsc::UnboundedSender<Command>,
    next_ticket: AtomicU64,
}

/// Handle to a running limiter. Cheap to clone; every clone feeds the same
/// coordinator.
///
/// Must be created inside a tokio runtime. The coordinator stops once every
/// handle, pending `Acquire` and `ActiveSlot` has been dropped.
#[derive(Clone)]
pub struct TokenLimiter {
    shared: Arc<Shared>,
}

impl TokenLimiter {
    pub fn new(config: LimiterConfig) -> Self {
        let name: Arc<str> = Arc::from(config.name.as_str());
        let (commands, commands_rx) = mpsc::unbounded_channel();

        tracing::info!(
            limiter = %name,
            max_rate = ?config.rate_limit(),
            max_concurrency = ?config.concurrency_limit(),
            rate_window_ms = config.rate_window_ms,
            idle_ms = config.idle_ms,
            "Starting token limiter"
        );

        let coordinator = Coordinator::new(Arc::clone(&name), &config);
        let task = tokio::spawn(coordinator.run(commands_rx));
        tokio::spawn(coordinator::watch(Arc::clone(&name), task));

        Self {
            shared: Arc::new(Shared {
                name,
                commands,
                next_ticket: AtomicU64::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Queue a request for a slot.
    ///
    /// Queue position is fixed by this call, not by when the returned future
    /// is first polled.
    pub fn acquire(&self, request_id: impl Into<RequestId>) -> Acquire {
        let request_id = request_id.into();
        let ticket = Ticket(self.shared.next_ticket.fetch_add(1, Ordering::Relaxed));
        let (reply, grant_rx) = oneshot::channel();

        tracing::debug!(limiter = %self.shared.name, %request_id, %ticket, "requesting slot");

        // On a dead coordinator the reply sender is dropped with the command,
        // so the Acquire resolves to Defunct.
        let _ = self.shared.commands.send(Command::Submit {
            ticket,
            request_id: request_id.clone(),
            reply,
        });

        Acquire::new(
            ticket,
            request_id,
            Arc::clone(&self.shared.name),
            grant_rx,
            self.shared.commands.clone(),
        )
    }

    /// Queue a request under a freshly generated id.
    pub fn acquire_anonymous(&self) -> Acquire {
        self.acquire(RequestId::generate())
    }

    pub async fn stats(&self) -> Result<LimiterStats, LimiterError> {
        let (reply, rx) = oneshot::channel();
        let defunct = || LimiterError::Defunct {
            limiter: self.shared.name.to_string(),
        };
        self.shared
            .commands
            .send(Command::Stats { reply })
            .map_err(|_| defunct())?;
        rx.await.map_err(|_| defunct())
    }
}

impl std::fmt::Debug for TokenLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenLimiter")
            .field("name", &self.shared.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use futures::FutureExt;
    use tokio::time::{Instant, advance, sleep};

    /// Let the coordinator drain its channel without moving the paused clock.
    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn limiter(config: LimiterConfig) -> TokenLimiter {
        TokenLimiter::new(config)
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_defers_third_request_by_one_window() {
        let limiter = limiter(LimiterConfig::new("rate").with_max_rate(2));
        let start = Instant::now();

        let a = limiter.acquire("a");
        let b = limiter.acquire("b");
        let c = limiter.acquire("c");

        let a = a.await.unwrap();
        let b = b.await.unwrap();
        assert_eq!(start.elapsed().as_millis(), 0);

        let c = c.await.unwrap();
        assert_eq!(start.elapsed().as_millis(), 1000);
        assert_eq!(a.rate_token().map(|t| t.number()), Some(1));
        assert_eq!(b.rate_token().map(|t| t.number()), Some(2));
        assert!(c.rate_token().is_some());
        assert!(c.concurrency_token().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn rate_token_recycles_from_grant_not_release() {
        let limiter = limiter(LimiterConfig::new("rate").with_max_rate(1));
        let start = Instant::now();

        let held = limiter.acquire("held").await.unwrap();
        let next = limiter.acquire("next");
        let next = next.await.unwrap();
        assert_eq!(start.elapsed().as_millis(), 1000);
        drop(held);
        drop(next);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_limit_waits_for_release() {
        let limiter = limiter(LimiterConfig::new("conc").with_max_concurrency(1));

        let a = limiter.acquire("a").await.unwrap();
        let mut b = limiter.acquire("b");

        sleep(Duration::from_secs(60)).await;
        assert!((&mut b).now_or_never().is_none());

        a.release();
        let b = b.await.unwrap();
        assert_eq!(b.concurrency_token().map(|t| t.number()), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_grant_returns_its_slot() {
        let limiter = limiter(LimiterConfig::new("cancel").with_max_concurrency(1));

        let a = limiter.acquire("a");
        advance(Duration::from_millis(1)).await;
        drop(a);
        advance(Duration::from_millis(1)).await;

        let start = Instant::now();
        let b = limiter.acquire("b").await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(b.request_id().as_str(), "b");

        let stats = limiter.stats().await.unwrap();
        assert_eq!(stats.cancelled_total, 1);
        assert_eq!(stats.granted_total, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_pending_request_is_recycled_on_its_turn() {
        let limiter = limiter(LimiterConfig::new("queue").with_max_concurrency(1));

        let a = limiter.acquire("a").await.unwrap();
        let b = limiter.acquire("b");
        let c = limiter.acquire("c");
        drop(b);
        settle().await;

        let stats = limiter.stats().await.unwrap();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.outstanding, 3);

        a.release();
        let c = c.await.unwrap();
        assert_eq!(c.request_id().as_str(), "c");

        let stats = limiter.stats().await.unwrap();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.outstanding, 1);
        assert_eq!(stats.cancelled_total, 1);
        assert_eq!(stats.concurrency.map(|p| p.available), Some(0));

        drop(c);
        settle().await;
        let stats = limiter.stats().await.unwrap();
        assert_eq!(stats.concurrency.map(|p| p.available), Some(1));
        assert_eq!(stats.outstanding, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn grants_follow_submission_order() {
        let limiter = limiter(
            LimiterConfig::new("fifo")
                .with_max_rate(2)
                .with_max_concurrency(1),
        );
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for i in 0..6 {
            let acquire = limiter.acquire(format!("r{i}"));
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                let slot = acquire.await.unwrap();
                order.lock().unwrap().push(slot.request_id().to_string());
                sleep(Duration::from_millis(10)).await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let order = order.lock().unwrap().clone();
        assert_eq!(order, vec!["r0", "r1", "r2", "r3", "r4", "r5"]);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_and_rate_bounds_hold() {
        let limiter = limiter(
            LimiterConfig::new("bounds")
                .with_rate_window(Duration::from_millis(100))
                .with_max_rate(3)
                .with_max_concurrency(2),
        );
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let grants = Arc::new(Mutex::new(Vec::new()));
        let start = Instant::now();

        let mut tasks = Vec::new();
        for i in 0..12u64 {
            let acquire = limiter.acquire(format!("w{i}"));
            let (in_flight, peak, grants) =
                (Arc::clone(&in_flight), Arc::clone(&peak), Arc::clone(&grants));
            tasks.push(tokio::spawn(async move {
                let slot = acquire.await.unwrap();
                grants.lock().unwrap().push(start.elapsed());
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_millis(5 + (i % 4) * 20)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                drop(slot);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        let grants = grants.lock().unwrap().clone();
        assert_eq!(grants.len(), 12);
        for (i, at) in grants.iter().enumerate() {
            let window = grants[i..]
                .iter()
                .take_while(|t| **t < *at + Duration::from_millis(100))
                .count();
            assert!(window <= 3, "{window} grants within 100ms of {at:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unlimited_dimensions_pass_through() {
        let limiter = limiter(LimiterConfig::new("open"));
        let start = Instant::now();

        let mut slots = Vec::new();
        for i in 0..100 {
            slots.push(limiter.acquire(format!("{i}")).await.unwrap());
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(slots.iter().all(|s| s.rate_token().is_none()));
        assert!(slots.iter().all(|s| s.concurrency_token().is_none()));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_hook_fires_after_quiet_period() {
        let fired = Arc::new(AtomicUsize::new(0));
        let hook_fired = Arc::clone(&fired);
        let limiter = limiter(
            LimiterConfig::new("idle")
                .with_idle(Duration::from_millis(500))
                .with_on_idle(move || {
                    hook_fired.fetch_add(1, Ordering::SeqCst);
                }),
        );

        let slots = vec![
            limiter.acquire("a").await.unwrap(),
            limiter.acquire("b").await.unwrap(),
        ];
        drop(slots);
        settle().await;

        sleep(Duration::from_millis(499)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        sleep(Duration::from_millis(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn activity_resets_idle_timer() {
        let fired = Arc::new(AtomicUsize::new(0));
        let hook_fired = Arc::clone(&fired);
        let limiter = limiter(
            LimiterConfig::new("idle")
                .with_idle(Duration::from_millis(500))
                .with_on_idle(move || {
                    hook_fired.fetch_add(1, Ordering::SeqCst);
                }),
        );

        limiter.acquire("a").await.unwrap().release();
        settle().await;

        sleep(Duration::from_millis(400)).await;
        let b = limiter.acquire("b").await.unwrap();
        sleep(Duration::from_millis(150)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        b.release();
        settle().await;
        sleep(Duration::from_millis(501)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_hook_does_not_fire_before_first_request() {
        let fired = Arc::new(AtomicUsize::new(0));
        let hook_fired = Arc::clone(&fired);
        let _limiter = limiter(
            LimiterConfig::new("quiet")
                .with_idle(Duration::from_millis(10))
                .with_on_idle(move || {
                    hook_fired.fetch_add(1, Ordering::SeqCst);
                }),
        );

        sleep(Duration::from_secs(1)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_idle_hook_does_not_stop_granting() {
        let limiter = limiter(
            LimiterConfig::new("hook")
                .with_max_concurrency(1)
                .with_idle(Duration::from_millis(10))
                .with_on_idle(|| panic!("idle hook bug")),
        );

        limiter.acquire("a").await.unwrap().release();
        sleep(Duration::from_millis(50)).await;

        let b = limiter.acquire("b").await.unwrap();
        assert_eq!(b.request_id(), &RequestId::from("b"));
        let stats = limiter.stats().await.unwrap();
        assert_eq!(stats.granted_total, 2);
        assert_eq!(stats.outstanding, 1);
    }

    #[tokio::test]
    async fn dead_coordinator_fails_every_caller() {
        let limiter = limiter(LimiterConfig::new("dead").with_max_concurrency(1));
        let held = limiter.acquire("held").await.unwrap();
        let queued = limiter.acquire("queued");

        // A release nobody was granted trips the coordinator's invariant check.
        let sent = limiter.shared.commands.send(Command::Release {
            ticket: Ticket(u64::MAX),
        });
        assert!(sent.is_ok());

        let err = queued.await.unwrap_err();
        assert!(matches!(err, LimiterError::Defunct { ref limiter } if limiter == "dead"));
        assert!(matches!(
            limiter.acquire("late").await,
            Err(LimiterError::Defunct { .. })
        ));
        assert!(matches!(
            limiter.stats().await,
            Err(LimiterError::Defunct { .. })
        ));
        drop(held);
    }

    #[tokio::test]
    async fn anonymous_requests_get_distinct_uuids() {
        let limiter = limiter(LimiterConfig::new("anon"));
        let a = limiter.acquire_anonymous().await.unwrap();
        let b = limiter.acquire_anonymous().await.unwrap();

        assert!(uuid::Uuid::parse_str(a.request_id().as_str()).is_ok());
        assert_ne!(a.request_id(), b.request_id());
    }

    #[tokio::test]
    async fn acquire_polled_after_grant_is_consumed() {
        let limiter = limiter(LimiterConfig::new("once").with_max_concurrency(1));
        let mut acquire = limiter.acquire("once");

        let slot = (&mut acquire).await.unwrap();
        assert!(matches!((&mut acquire).await, Err(LimiterError::Consumed)));

        // The consumed handle must not withdraw the live grant.
        drop(acquire);
        let stats = limiter.stats().await.unwrap();
        assert_eq!(stats.cancelled_total, 0);
        assert_eq!(stats.outstanding, 1);
        drop(slot);
    }

    #[tokio::test]
    async fn grant_display_matches_log_tag() {
        let limiter = limiter(
            LimiterConfig::new("tag")
                .with_max_rate(1)
                .with_max_concurrency(1),
        );
        let slot = limiter.acquire("job").await.unwrap();
        assert_eq!(slot.grant().to_string(), "Token<job,R1,C1>");
    }
}
