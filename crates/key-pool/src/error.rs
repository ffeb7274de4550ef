//! Error types for pool construction
//!
//! Exhaustion and throttling are not errors: `Pool::acquire` reports them as
//! `Acquisition::Blocked`. Only a misconfigured pool fails, and only once, at
//! startup.

/// Configuration errors detected while building a pool.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("key pool is empty: at least one key must be configured")]
    EmptyPool,

    #[error("key #{index} has an empty identity")]
    EmptyIdentity { index: usize },

    #[error("key #{index} duplicates key #{first}")]
    DuplicateIdentity { index: usize, first: usize },

    #[error("key #{index} has {limit} limit 0; limits must be positive")]
    ZeroLimit { index: usize, limit: &'static str },
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
