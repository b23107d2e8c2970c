//! Point-in-time view of a limiter, produced by the coordinator.

use serde::Serialize;

/// Occupancy of one token pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub size: usize,
    pub available: usize,
    pub held: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LimiterStats {
    pub name: String,
    /// `None` when rate limiting is disabled.
    pub rate: Option<PoolStats>,
    /// `None` when concurrency limiting is disabled.
    pub concurrency: Option<PoolStats>,
    /// Requests waiting for a grant, including withdrawn ones still holding their place.
    pub pending: usize,
    /// Submitted but not yet released.
    pub outstanding: usize,
    pub granted_total: u64,
    pub cancelled_total: u64,
}

impl LimiterStats {
    pub fn is_idle(&self) -> bool {
        self.outstanding == 0
    }

    /// All slots taken on the concurrency dimension.
    pub fn is_saturated(&self) -> bool {
        self.concurrency.is_some_and(|pool| pool.available == 0)
    }
}
