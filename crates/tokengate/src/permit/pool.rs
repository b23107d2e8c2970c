//! Fixed-size token pools owned by the coordinator.
//!
//! Tokens leave in FIFO order and come back in whatever order they are
//! recycled. Pairing only looks at how many tokens are available; identities
//! exist for diagnostics.

use std::collections::VecDeque;

use serde::Serialize;

/// Which limit a pool enforces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolKind {
    Rate,
    Concurrency,
}

impl PoolKind {
    fn prefix(&self) -> char {
        match self {
            PoolKind::Rate => 'R',
            PoolKind::Concurrency => 'C',
        }
    }
}

/// Permit identifier in `[1, size]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token {
    kind: PoolKind,
    number: usize,
}

impl Token {
    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    pub fn number(&self) -> usize {
        self.number
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.kind.prefix(), self.number)
    }
}

pub(crate) struct TokenPool {
    kind: PoolKind,
    size: usize,
    available: VecDeque<Token>,
}

impl TokenPool {
    pub fn new(kind: PoolKind, size: usize) -> Self {
        Self {
            kind,
            size,
            available: (1..=size).map(|number| Token { kind, number }).collect(),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.available.len()
    }

    pub fn held(&self) -> usize {
        self.size - self.available.len()
    }

    pub fn has_available(&self) -> bool {
        !self.available.is_empty()
    }

    pub fn take(&mut self) -> Option<Token> {
        self.available.pop_front()
    }

    /// Return a held token. Recycling a token that is not held is a logic
    /// error in the coordinator and panics.
    pub fn recycle(&mut self, token: Token) {
        assert_eq!(token.kind, self.kind, "token {token} recycled into {:?} pool", self.kind);
        assert!(
            self.held() > 0 && !self.available.contains(&token),
            "token {token} recycled while not held"
        );
        self.available.push_back(token);
    }
}
