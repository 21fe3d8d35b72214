// Push-fed position source
// The embedding platform (or a replay) pushes readings in through a PositionFeed

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use super::source::{PermissionState, PositionReading, PositionSource, PositionWatch, TrackingOptions};
use crate::constants::WATCH_BUFFER;
use crate::error::PositionError;
use crate::location::Coordinate;

struct FeedShared {
    permission: Mutex<PermissionState>,
    watchers: Mutex<HashMap<u64, mpsc::Sender<PositionReading>>>,
    next_watch_id: AtomicU64,
    last_fix: Mutex<Option<(Coordinate, Instant)>>,
    /// Wakes pending one-shot reads
    oneshot_tx: broadcast::Sender<PositionReading>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Position source fed by an external producer
#[derive(Clone)]
pub struct FeedSource {
    shared: Arc<FeedShared>,
}

/// Producer side of a `FeedSource`
#[derive(Clone)]
pub struct PositionFeed {
    shared: Arc<FeedShared>,
}

impl FeedSource {
    pub fn new(permission: PermissionState) -> Self {
        let (oneshot_tx, _) = broadcast::channel(WATCH_BUFFER);
        FeedSource {
            shared: Arc::new(FeedShared {
                permission: Mutex::new(permission),
                watchers: Mutex::new(HashMap::new()),
                next_watch_id: AtomicU64::new(1),
                last_fix: Mutex::new(None),
                oneshot_tx,
            }),
        }
    }

    /// Handle for pushing readings into this source.
    pub fn feed(&self) -> PositionFeed {
        PositionFeed {
            shared: self.shared.clone(),
        }
    }

    /// Number of watches currently registered.
    pub fn active_watches(&self) -> usize {
        lock(&self.shared.watchers).len()
    }
}

impl PositionFeed {
    /// Deliver a reading to every active watch and any pending one-shot read.
    pub fn push(&self, reading: PositionReading) {
        if let Ok(fix) = &reading {
            *lock(&self.shared.last_fix) = Some((fix.clone(), Instant::now()));
        }

        let mut watchers = lock(&self.shared.watchers);
        watchers.retain(|id, tx| match tx.try_send(reading.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(watch = id, "position watch lagging, reading dropped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        drop(watchers);

        let _ = self.shared.oneshot_tx.send(reading);
    }

    pub fn set_permission(&self, state: PermissionState) {
        *lock(&self.shared.permission) = state;
    }
}

impl PositionSource for FeedSource {
    fn check_permission(&self) -> PermissionState {
        *lock(&self.shared.permission)
    }

    /// A pending prompt is treated as accepted; an explicit denial stays denied.
    async fn request_permission(&self) -> Result<(), PositionError> {
        let mut permission = lock(&self.shared.permission);
        match *permission {
            PermissionState::Granted => Ok(()),
            PermissionState::Denied => Err(PositionError::PermissionDenied),
            PermissionState::Prompt => {
                *permission = PermissionState::Granted;
                Ok(())
            }
        }
    }

    fn watch_position(&self, options: &TrackingOptions) -> Result<PositionWatch, PositionError> {
        if self.check_permission() != PermissionState::Granted {
            return Err(PositionError::PermissionDenied);
        }

        let id = self.shared.next_watch_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        lock(&self.shared.watchers).insert(id, tx);
        debug!(watch = id, high_accuracy = options.enable_high_accuracy, "position watch started");

        let shared = self.shared.clone();
        Ok(PositionWatch::new(rx, move || {
            lock(&shared.watchers).remove(&id);
            debug!(watch = id, "position watch released");
        }))
    }

    async fn current_position(&self, options: &TrackingOptions) -> PositionReading {
        if self.check_permission() != PermissionState::Granted {
            return Err(PositionError::PermissionDenied);
        }

        if !options.maximum_age.is_zero() {
            let cached = lock(&self.shared.last_fix).clone();
            if let Some((fix, seen)) = cached {
                if seen.elapsed() <= options.maximum_age {
                    return Ok(fix);
                }
            }
        }

        let mut rx = self.shared.oneshot_tx.subscribe();
        match tokio::time::timeout(options.timeout, rx.recv()).await {
            Ok(Ok(reading)) => reading,
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => Err(PositionError::PositionUnavailable),
            Ok(Err(broadcast::error::RecvError::Closed)) => Err(PositionError::PositionUnavailable),
            Err(_) => Err(PositionError::Timeout),
        }
    }
}
