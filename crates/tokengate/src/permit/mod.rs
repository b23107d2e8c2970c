//! Tokens and the handles that hold them.
//!
//! Pools live inside the coordinator; callers only ever see tokens through an
//! [`ActiveSlot`].

mod pool;
mod slot;

pub(crate) use pool::TokenPool;
pub use pool::{PoolKind, Token};
pub use slot::{Acquire, ActiveSlot};
