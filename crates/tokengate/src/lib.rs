//! tokengate: FIFO admission control for scarce external resources.
//!
//! A [`TokenLimiter`] enforces a request rate over a sliding window and a cap
//! on in-flight work at the same time, granting slots strictly in the order
//! they were requested. [`LimiterService`] wraps arbitrary async work so it
//! only runs while holding a slot.

mod config;
mod id;
mod limiter;
pub mod permit;
pub mod service;
mod stats;
pub mod submit;

pub use config::{ConfigError, DEFAULT_IDLE_MS, DEFAULT_RATE_WINDOW_MS, IdleHook, LimiterConfig};
pub use id::RequestId;
pub use limiter::{Grant, LimiterError, TokenLimiter};
pub use permit::{Acquire, ActiveSlot, PoolKind, Token};
pub use service::{LimitedStream, LimiterService, ReleasePolicy};
pub use stats::{LimiterStats, PoolStats};
pub use submit::{Job, JobSubmitter, ServiceDescriptor, SpawnSubmitter, SubmitError};
