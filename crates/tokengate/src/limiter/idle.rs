//! Debounced idle detection.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::IdleHook;

/// Tracks the outstanding count and arms a quiet timer whenever it hits zero.
///
/// Every change of the count re-evaluates the deadline, so the hook only fires
/// after `quiet` of uninterrupted zero, and once per idle stretch.
pub(super) struct IdleTimer {
    quiet: Duration,
    outstanding: usize,
    deadline: Option<Instant>,
    hook: Option<IdleHook>,
}

impl IdleTimer {
    pub fn new(quiet: Duration, hook: Option<IdleHook>) -> Self {
        Self {
            quiet,
            outstanding: 0,
            deadline: None,
            hook,
        }
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn increment(&mut self) {
        self.outstanding += 1;
        self.rearm();
    }

    pub fn decrement(&mut self) {
        assert!(self.outstanding > 0, "outstanding count would go negative");
        self.outstanding -= 1;
        self.rearm();
    }

    fn rearm(&mut self) {
        self.deadline = (self.outstanding == 0).then(|| Instant::now() + self.quiet);
    }

    /// Resolves at the armed deadline. Never resolves while disarmed.
    pub async fn expired(&self) {
        match self.deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }

    /// Disarm. Returns false if a change raced the timer.
    pub fn fire(&mut self) -> bool {
        self.deadline.take().is_some() && self.outstanding == 0
    }

    pub fn hook(&self) -> Option<&IdleHook> {
        self.hook.as_ref()
    }
}
