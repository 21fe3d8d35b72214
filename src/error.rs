// Error taxonomy for the tracking pipeline

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors reported by a position source, either per reading or on setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionError {
    #[error("location permission denied")]
    PermissionDenied,
    #[error("position unavailable")]
    PositionUnavailable,
    #[error("position read timed out")]
    Timeout,
}

/// Errors raised while establishing or using the delivery channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("invalid channel address {0:?}")]
    InvalidAddress(String),
    #[error("failed to connect after {attempts} attempts: {last}")]
    ConnectFailed { attempts: u32, last: String },
    #[error("channel closed")]
    Closed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced to callers of the tracking orchestrator.
#[derive(Debug, Error)]
pub enum TrackingError {
    #[error("cannot start tracking: {0}")]
    Permission(PositionError),
    #[error("position source error: {0}")]
    Position(PositionError),
    #[error("delivery channel error: {0}")]
    Channel(#[from] ChannelError),
    #[error("tracking start cancelled")]
    Cancelled,
}

impl From<PositionError> for TrackingError {
    fn from(err: PositionError) -> Self {
        match err {
            PositionError::PermissionDenied => TrackingError::Permission(err),
            other => TrackingError::Position(other),
        }
    }
}

/// Errors loading a recorded reading file.
#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}
