//! Error types for bfs-walker
//!
//! The traversal core distinguishes two kinds of failure:
//! - Fatal setup errors (queue allocation, worker spawn, bad configuration),
//!   returned from [`walk`](crate::walker::walk) before any visit fires.
//! - Per-entry errors (open/stat/readdir failures), which are attached to the
//!   affected entry and delivered through the visit callback. They never
//!   abort the traversal on their own.
//!
//! Library code uses thiserror; the binary wraps everything in anyhow.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for bfs-walker
#[derive(Error, Debug)]
pub enum WalkerError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O queue errors
    #[error("I/O queue error: {0}")]
    Queue(#[from] QueueError),

    /// I/O errors outside the traversal itself
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration validation errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// No root paths were given
    #[error("No paths to search")]
    NoPaths,

    /// Invalid worker count
    #[error("Invalid thread count {count}: must be between 1 and {max}")]
    InvalidThreadCount { count: usize, max: usize },

    /// Invalid queue capacity
    #[error("Invalid queue capacity {capacity}: must be at least {min}")]
    InvalidQueueCapacity { capacity: usize, min: usize },

    /// Invalid descriptor cache capacity
    #[error("Invalid cache capacity {capacity}: must be at least {min}")]
    InvalidCacheCapacity { capacity: usize, min: usize },

    /// Depth limits are inverted
    #[error("Invalid depth range: min {min} exceeds max {max}")]
    InvalidDepthRange { min: u32, max: u32 },

    /// Root path is not representable as a C string
    #[error("Invalid path {path:?}: embedded NUL byte")]
    InvalidPath { path: PathBuf },
}

/// I/O queue errors
#[derive(Error, Debug)]
pub enum QueueError {
    /// Worker thread could not be spawned
    #[error("Failed to spawn I/O worker {id}: {reason}")]
    SpawnFailed { id: usize, reason: String },

    /// The queue has been cancelled and accepts no new work
    #[error("I/O queue is cancelled")]
    Cancelled,

    /// All workers exited and the completion ring is drained
    #[error("I/O queue is disconnected")]
    Disconnected,
}

/// Result type alias for WalkerError
pub type Result<T> = std::result::Result<T, WalkerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversion() {
        let cfg = ConfigError::NoPaths;
        let err: WalkerError = cfg.into();
        assert!(matches!(err, WalkerError::Config(_)));

        let q = QueueError::Disconnected;
        let err: WalkerError = q.into();
        assert!(matches!(err, WalkerError::Queue(_)));
    }

    #[test]
    fn test_error_display() {
        let err = ConfigError::InvalidThreadCount { count: 0, max: 64 };
        assert!(err.to_string().contains("thread count 0"));
    }
}
