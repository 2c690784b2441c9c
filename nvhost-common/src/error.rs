// SPDX-FileCopyrightText: 2025 ruzu contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Error types shared by the engine, the hardware backends and the memory
//! collaborator.
//!
//! Invariant violations are not represented here: they indicate the engine
//! instance can no longer be trusted and are reported with a diagnostic dump
//! followed by a panic.

use thiserror::Error;

use crate::types::{ChannelId, SyncptId};

/// Errors reported by the memory collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemError {
    #[error("out of contiguous memory (requested {words} words)")]
    OutOfMemory { words: usize },

    #[error("handle {0} cannot be made resident")]
    PinFailed(u32),

    #[error("I/O error while pinning handle {0}")]
    Io(u32),
}

/// Errors reported by a hardware backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HwError {
    #[error("interrupt line {0} unavailable")]
    IrqUnavailable(u32),
}

/// Errors returned by engine operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The submitting context was abandoned by the timeout recovery path.
    /// Sticky: every later submission from that context fails the same way.
    #[error("submission context has timed out")]
    TimedOut,

    #[error("memory: {0}")]
    Mem(#[from] MemError),

    #[error("hardware: {0}")]
    Hw(#[from] HwError),

    #[error("invalid sync point id {0}")]
    InvalidSyncpt(SyncptId),

    #[error("invalid channel {0}")]
    InvalidChannel(ChannelId),

    #[error("hardware mutex {0} is busy")]
    MutexBusy(u32),

    #[error("sync point {id} did not reach {thresh} (value {value})")]
    WaitTimeout {
        id: SyncptId,
        thresh: u32,
        value: u32,
    },

    #[error("wait interrupted")]
    Interrupted,

    #[error("channel flush timed out after {0} ms")]
    FlushTimeout(u64),

    #[error("read FIFO drain timed out with {remaining} words outstanding")]
    FifoTimeout { remaining: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: String,
        source: std::io::Error,
    },
}

impl Error {
    /// Whether the caller may retry the same request later.
    ///
    /// A timed-out context is permanent: the owner has to open a new one.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Mem(_)
                | Self::Hw(_)
                | Self::MutexBusy(_)
                | Self::WaitTimeout { .. }
                | Self::Interrupted
                | Self::FlushTimeout(_)
                | Self::FifoTimeout { .. }
        )
    }
}

/// Result alias for engine operations.
pub type NvResult<T> = Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_permanent() {
        assert!(!Error::TimedOut.is_retryable());
        assert!(!Error::InvalidSyncpt(40).is_retryable());
    }

    #[test]
    fn test_resource_errors_are_retryable() {
        let err: Error = MemError::PinFailed(3).into();
        assert!(err.is_retryable());
        let err: Error = HwError::IrqUnavailable(65).into();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_display() {
        let err = Error::WaitTimeout {
            id: 22,
            thresh: 10,
            value: 7,
        };
        assert_eq!(err.to_string(), "sync point 22 did not reach 10 (value 7)");
        let err: Error = MemError::OutOfMemory { words: 1025 }.into();
        assert_eq!(
            err.to_string(),
            "memory: out of contiguous memory (requested 1025 words)"
        );
    }
}
