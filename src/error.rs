//! Crate-wide error type.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, FluxError>;

#[derive(Error, Debug)]
pub enum FluxError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {message}")]
    Config { message: String },

    #[error("operation timed out")]
    Timeout,

    #[error("pool exhausted: all {capacity} slots are in use")]
    PoolExhausted { capacity: usize },

    #[error("queue is full")]
    QueueFull,

    #[error("queue is empty")]
    QueueEmpty,

    #[error("unexpected error: {message}")]
    Unexpected { message: String },
}

impl FluxError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected { message: message.into() }
    }

    /// Whether retrying the operation that produced this error could plausibly succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout | Self::PoolExhausted { .. } | Self::QueueFull | Self::QueueEmpty)
    }
}
