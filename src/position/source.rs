// Position source abstraction

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::constants::{DEFAULT_MAXIMUM_AGE_MS, DEFAULT_POSITION_TIMEOUT_MS};
use crate::error::PositionError;
use crate::location::Coordinate;

/// One item from a position source: a fix or a typed failure.
pub type PositionReading = Result<Coordinate, PositionError>;

/// Access state for the positioning capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionState {
    Granted,
    Denied,
    /// Not decided yet; `request_permission` resolves it
    Prompt,
}

/// Options for continuous and one-shot reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingOptions {
    pub enable_high_accuracy: bool,
    /// Longest wait for a single read
    #[serde(with = "crate::millis")]
    pub timeout: Duration,
    /// Oldest cached fix a read may return. Zero forces a fresh fix.
    #[serde(with = "crate::millis")]
    pub maximum_age: Duration,
}

impl Default for TrackingOptions {
    fn default() -> Self {
        TrackingOptions {
            enable_high_accuracy: true,
            timeout: Duration::from_millis(DEFAULT_POSITION_TIMEOUT_MS),
            maximum_age: Duration::from_millis(DEFAULT_MAXIMUM_AGE_MS),
        }
    }
}

/// Platform positioning capability.
pub trait PositionSource: Send + Sync + 'static {
    fn check_permission(&self) -> PermissionState;

    /// Ask for access. Fails with `PermissionDenied` if refused.
    fn request_permission(&self) -> impl Future<Output = Result<(), PositionError>> + Send;

    /// Start a continuous watch. Readings stop when the watch is dropped.
    fn watch_position(&self, options: &TrackingOptions) -> Result<PositionWatch, PositionError>;

    /// Single read honoring `timeout` and `maximum_age`.
    fn current_position(
        &self,
        options: &TrackingOptions,
    ) -> impl Future<Output = PositionReading> + Send;
}

/// Handle to an active continuous watch.
///
/// Dropping the handle (or calling `clear`) releases the registration with
/// the source.
pub struct PositionWatch {
    readings: mpsc::Receiver<PositionReading>,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl PositionWatch {
    pub fn new<F>(readings: mpsc::Receiver<PositionReading>, release: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        PositionWatch {
            readings,
            release: Some(Box::new(release)),
        }
    }

    /// Next reading, or None once the source has gone away.
    pub async fn next(&mut self) -> Option<PositionReading> {
        self.readings.recv().await
    }

    pub fn clear(self) {}
}

impl Drop for PositionWatch {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for PositionWatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionWatch")
            .field("released", &self.release.is_none())
            .finish()
    }
}
