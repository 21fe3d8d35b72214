// Tracking orchestrator
// Wires a position source through the estimator to the delivery channel,
// falling back to the offline queue while the channel is down

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::constants::INBOUND_BUFFER;
use crate::error::TrackingError;
use crate::kalman::{Estimator, EstimatorConfig, EstimatorState};
use crate::location::{Coordinate, LocationUpdate};
use crate::net::channel::{ChannelConfig, ChannelSender, ChannelState, DeliveryChannel};
use crate::net::messages::InboundEvent;
use crate::position::{DeviceProbe, NoopProbe, PermissionState, PositionSource, PositionWatch, TrackingOptions};
use crate::queue::{OfflineQueue, QueueConfig, SharedQueue};

/// Lifecycle of a tracking session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingState {
    Idle,
    Starting,
    Tracking,
    Stopping,
}

/// Settings for every component the orchestrator owns
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub estimator: EstimatorConfig,
    pub channel: ChannelConfig,
    pub queue: QueueConfig,
}

struct Session {
    entity_id: String,
    channel: DeliveryChannel,
    worker: JoinHandle<()>,
}

fn lock(estimator: &Mutex<Estimator>) -> MutexGuard<'_, Estimator> {
    estimator.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle owning one tracking pipeline. At most one session is active.
pub struct TrackingOrchestrator<S: PositionSource> {
    source: Arc<S>,
    probe: Arc<dyn DeviceProbe>,
    channel_config: ChannelConfig,
    estimator: Arc<Mutex<Estimator>>,
    queue: SharedQueue,
    events: broadcast::Sender<InboundEvent>,
    state: watch::Sender<TrackingState>,
    /// Delivery channel state of the active session; `Closed` when there is none
    channel_state: Arc<watch::Sender<ChannelState>>,
    /// Bumped by every start and stop; in-flight setup for an older value is abandoned
    generation: watch::Sender<u64>,
    session: tokio::sync::Mutex<Option<Session>>,
}

impl<S: PositionSource> TrackingOrchestrator<S> {
    pub fn new(source: Arc<S>, config: OrchestratorConfig) -> Self {
        let (events, _) = broadcast::channel(INBOUND_BUFFER);
        let (state, _) = watch::channel(TrackingState::Idle);
        let (generation, _) = watch::channel(0);
        let (channel_state, _) = watch::channel(ChannelState::Closed);

        TrackingOrchestrator {
            source,
            probe: Arc::new(NoopProbe),
            channel_config: config.channel,
            estimator: Arc::new(Mutex::new(Estimator::new(config.estimator))),
            queue: OfflineQueue::shared(config.queue),
            events,
            state,
            channel_state: Arc::new(channel_state),
            generation,
            session: tokio::sync::Mutex::new(None),
        }
    }

    /// Attach a device metadata probe.
    pub fn with_probe(mut self, probe: Arc<dyn DeviceProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn state(&self) -> TrackingState {
        *self.state.borrow()
    }

    /// Follow state transitions.
    pub fn watch_state(&self) -> watch::Receiver<TrackingState> {
        self.state.subscribe()
    }

    /// Delivery channel state. `Failed` means background reconnection gave up
    /// and updates are only being queued until tracking is restarted.
    pub fn channel_state(&self) -> ChannelState {
        *self.channel_state.borrow()
    }

    pub fn watch_channel(&self) -> watch::Receiver<ChannelState> {
        self.channel_state.subscribe()
    }

    /// Inbound geofence alerts and location updates from the server.
    pub fn subscribe(&self) -> broadcast::Receiver<InboundEvent> {
        self.events.subscribe()
    }

    pub fn estimator_state(&self) -> EstimatorState {
        lock(&self.estimator).get_state()
    }

    pub async fn queue_len(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Entity of the active session, if any.
    pub async fn entity_id(&self) -> Option<String> {
        self.session.lock().await.as_ref().map(|s| s.entity_id.clone())
    }

    pub async fn is_connected(&self) -> bool {
        self.session
            .lock()
            .await
            .as_ref()
            .is_some_and(|s| s.channel.is_connected())
    }

    /// Start a session for `entity_id`, replacing any active one.
    ///
    /// Resolves once permission is granted, the channel has joined the
    /// entity's room and the position watch is running.
    pub async fn start_tracking(
        &self,
        entity_id: impl Into<String>,
        options: TrackingOptions,
    ) -> Result<(), TrackingError> {
        let entity_id = entity_id.into();

        let generation = {
            let mut session = self.session.lock().await;
            if let Some(active) = session.take() {
                info!(entity = %active.entity_id, "replacing active tracking session");
                self.set_state(TrackingState::Stopping);
                self.teardown(active).await;
            }
            self.generation.send_modify(|g| *g += 1);
            self.set_state(TrackingState::Starting);
            *self.generation.borrow()
        };

        let mut generations = self.generation.subscribe();
        let superseded = async move {
            let _ = generations.wait_for(|g| *g != generation).await;
        };

        let result = tokio::select! {
            result = self.open_session(&entity_id, &options) => result,
            _ = superseded => Err(TrackingError::Cancelled),
        };

        let mut session = self.session.lock().await;
        if *self.generation.borrow() != generation {
            if let Ok(stale) = result {
                self.teardown(stale).await;
            }
            debug!(entity = %entity_id, "tracking start superseded");
            return Err(TrackingError::Cancelled);
        }

        match result {
            Ok(opened) => {
                self.channel_state.send_replace(opened.channel.state());
                *session = Some(opened);
                self.set_state(TrackingState::Tracking);
                info!(entity = %entity_id, "tracking started");
                Ok(())
            }
            Err(e) => {
                self.set_state(TrackingState::Idle);
                warn!(entity = %entity_id, "tracking start failed: {}", e);
                Err(e)
            }
        }
    }

    /// Stop the active session. No-op when idle; cancels a start in progress.
    pub async fn stop_tracking(&self) {
        let mut session = self.session.lock().await;
        if session.is_none() && self.state() == TrackingState::Idle {
            return;
        }

        self.generation.send_modify(|g| *g += 1);
        if let Some(active) = session.take() {
            self.set_state(TrackingState::Stopping);
            self.teardown(active).await;
        }
        self.channel_state.send_replace(ChannelState::Closed);
        self.set_state(TrackingState::Idle);
    }

    /// One-shot read passed through the estimator.
    pub async fn get_current_location(&self, options: &TrackingOptions) -> Result<Coordinate, TrackingError> {
        let raw = self.source.current_position(options).await?;
        Ok(lock(&self.estimator).filter(&raw))
    }

    async fn open_session(&self, entity_id: &str, options: &TrackingOptions) -> Result<Session, TrackingError> {
        lock(&self.estimator).reset();

        if self.source.check_permission() != PermissionState::Granted {
            self.source.request_permission().await?;
        }

        let channel = DeliveryChannel::connect(
            self.channel_config.clone(),
            entity_id.to_string(),
            self.queue.clone(),
            self.events.clone(),
        )
        .await?;

        let watch = match self.source.watch_position(options) {
            Ok(watch) => watch,
            Err(e) => {
                channel.close().await;
                return Err(e.into());
            }
        };

        let worker = ReadingWorker {
            entity_id: entity_id.to_string(),
            estimator: self.estimator.clone(),
            probe: self.probe.clone(),
            queue: self.queue.clone(),
            sender: channel.sender(),
            channel_status: self.channel_state.clone(),
        };
        let channel_updates = channel.watch_state();

        Ok(Session {
            entity_id: entity_id.to_string(),
            channel,
            worker: tokio::spawn(worker.run(watch, channel_updates)),
        })
    }

    /// Release the watch, flush what the channel can still carry, disconnect.
    async fn teardown(&self, session: Session) {
        let Session {
            entity_id,
            channel,
            worker,
        } = session;

        worker.abort();
        if let Err(e) = worker.await {
            if !e.is_cancelled() {
                warn!(entity = %entity_id, "reading worker ended abnormally: {}", e);
            }
        }

        let flushed = channel.flush().await;
        channel.close().await;
        info!(entity = %entity_id, flushed, "tracking stopped");
    }

    fn set_state(&self, state: TrackingState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("tracking state {:?} -> {:?}", previous, state);
        }
    }
}

impl<S: PositionSource> Drop for TrackingOrchestrator<S> {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            session.worker.abort();
        }
    }
}

/// Per-session task turning readings into delivered or queued updates
struct ReadingWorker {
    entity_id: String,
    estimator: Arc<Mutex<Estimator>>,
    probe: Arc<dyn DeviceProbe>,
    queue: SharedQueue,
    sender: ChannelSender,
    channel_status: Arc<watch::Sender<ChannelState>>,
}

impl ReadingWorker {
    async fn run(self, mut watch: PositionWatch, mut channel: watch::Receiver<ChannelState>) {
        let mut following = true;
        loop {
            tokio::select! {
                reading = watch.next() => match reading {
                    Some(Ok(raw)) => self.handle_fix(&raw).await,
                    Some(Err(e)) => warn!(entity = %self.entity_id, "position reading failed: {}", e),
                    None => break,
                },
                changed = channel.changed(), if following => match changed {
                    Ok(()) => {
                        let state = *channel.borrow_and_update();
                        if state == ChannelState::Failed {
                            error!(entity = %self.entity_id, "delivery channel gave up, updates are queued until restart");
                        }
                        self.channel_status.send_replace(state);
                    }
                    Err(_) => following = false,
                },
            }
        }
        debug!(entity = %self.entity_id, "position watch ended");
    }

    async fn handle_fix(&self, raw: &Coordinate) {
        let coordinate = lock(&self.estimator).filter(raw);
        let update = LocationUpdate {
            entity_id: self.entity_id.clone(),
            coordinate,
            battery_level: self.probe.battery_level(),
            network_type: self.probe.network_type(),
            timestamp: Utc::now(),
        };

        if let Err(update) = self.sender.try_emit(update) {
            let id = self.queue.lock().await.push(update);
            debug!(entity = %self.entity_id, %id, "channel down, update queued");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ChannelError, PositionError};
    use crate::net::connection::Connection;
    use crate::net::relay::Relay;
    use crate::position::{FeedSource, PositionReading, StaticProbe};
    use serde_json::Value;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};

    fn config(addr: SocketAddr) -> OrchestratorConfig {
        OrchestratorConfig {
            channel: ChannelConfig {
                address: addr.to_string(),
                reconnect_attempts: 2,
                reconnect_delay: Duration::from_millis(10),
                connect_timeout: Duration::from_secs(1),
                heartbeat_interval: Duration::from_secs(30),
            },
            ..Default::default()
        }
    }

    async fn next_json(conn: &mut Connection) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(2), conn.read_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        serde_json::from_str(&line).unwrap()
    }

    async fn eventually<F: Fn() -> bool>(check: F) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }

    #[tokio::test]
    async fn test_double_start_keeps_one_watch_and_channel() {
        let relay = Relay::new();
        let server = relay.serve("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let source = Arc::new(FeedSource::new(PermissionState::Granted));
        let orchestrator = TrackingOrchestrator::new(source.clone(), config(server.addr()));

        orchestrator.start_tracking("asset-1", TrackingOptions::default()).await.unwrap();
        orchestrator.start_tracking("asset-1", TrackingOptions::default()).await.unwrap();

        assert_eq!(orchestrator.state(), TrackingState::Tracking);
        assert_eq!(source.active_watches(), 1);
        assert!(eventually(|| relay.client_count() == 1).await);

        orchestrator.stop_tracking().await;
        assert_eq!(orchestrator.state(), TrackingState::Idle);
        assert_eq!(source.active_watches(), 0);
        assert!(eventually(|| relay.client_count() == 0).await);
    }

    #[tokio::test]
    async fn test_permission_denied_fails_start() {
        let source = Arc::new(FeedSource::new(PermissionState::Denied));
        let orchestrator = TrackingOrchestrator::new(source.clone(), OrchestratorConfig::default());

        let err = orchestrator
            .start_tracking("asset-1", TrackingOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TrackingError::Permission(PositionError::PermissionDenied)));
        assert_eq!(orchestrator.state(), TrackingState::Idle);
        assert_eq!(source.active_watches(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_server_fails_start() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let source = Arc::new(FeedSource::new(PermissionState::Prompt));
        let orchestrator = TrackingOrchestrator::new(source.clone(), config(addr));

        let err = orchestrator
            .start_tracking("asset-1", TrackingOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TrackingError::Channel(ChannelError::ConnectFailed { attempts: 2, .. })
        ));
        assert_eq!(orchestrator.state(), TrackingState::Idle);
        assert_eq!(source.active_watches(), 0);
        assert!(!orchestrator.is_connected().await);
    }

    #[tokio::test]
    async fn test_readings_reach_room_members() {
        let relay = Relay::new();
        let server = relay.serve("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let stream = TcpStream::connect(server.addr()).await.unwrap();
        let mut observer = Connection::new(stream, server.addr());
        observer
            .write_line(r#"{"type":"join","entity_id":"asset-1"}"#)
            .await
            .unwrap();
        assert_eq!(next_json(&mut observer).await["type"], "joined");

        let source = Arc::new(FeedSource::new(PermissionState::Granted));
        let probe = StaticProbe {
            battery_level: Some(0.8),
            network_type: Some("wifi".to_string()),
        };
        let orchestrator =
            TrackingOrchestrator::new(source.clone(), config(server.addr())).with_probe(Arc::new(probe));
        orchestrator.start_tracking("asset-1", TrackingOptions::default()).await.unwrap();
        assert!(orchestrator.is_connected().await);
        assert_eq!(orchestrator.entity_id().await.as_deref(), Some("asset-1"));

        let feed = source.feed();
        let t0 = Utc::now();
        feed.push(Err(PositionError::Timeout));
        feed.push(Ok(Coordinate::new(10.0, -66.0, 30.0, t0)));
        feed.push(Ok(Coordinate::new(10.0001, -66.0, 30.0, t0 + chrono::Duration::seconds(1))));

        let first = next_json(&mut observer).await;
        assert_eq!(first["type"], "location_update");
        assert_eq!(first["entity_id"], "asset-1");
        assert_eq!(first["coordinate"]["latitude"], 10.0);
        assert_eq!(first["network_type"], "wifi");

        let second = next_json(&mut observer).await;
        assert!(second["coordinate"]["accuracy"].as_f64().unwrap() <= 5.0);
        assert!(orchestrator.estimator_state().initialized);
        assert_eq!(orchestrator.estimator_state().updates, 1);
        assert_eq!(orchestrator.queue_len().await, 0);

        orchestrator.stop_tracking().await;
        assert_eq!(orchestrator.entity_id().await, None);
    }

    /// Source whose permission prompt never resolves
    struct UnansweredPrompt(FeedSource);

    impl PositionSource for UnansweredPrompt {
        fn check_permission(&self) -> PermissionState {
            PermissionState::Prompt
        }

        async fn request_permission(&self) -> Result<(), PositionError> {
            std::future::pending().await
        }

        fn watch_position(&self, options: &TrackingOptions) -> Result<PositionWatch, PositionError> {
            self.0.watch_position(options)
        }

        async fn current_position(&self, options: &TrackingOptions) -> PositionReading {
            self.0.current_position(options).await
        }
    }

    #[tokio::test]
    async fn test_stop_during_start_cancels_setup() {
        let feed = FeedSource::new(PermissionState::Granted);
        let source = Arc::new(UnansweredPrompt(feed.clone()));
        let orchestrator = Arc::new(TrackingOrchestrator::new(source, OrchestratorConfig::default()));
        let mut state = orchestrator.watch_state();

        let starting = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move {
                orchestrator
                    .start_tracking("asset-1", TrackingOptions::default())
                    .await
            })
        };
        tokio::time::timeout(Duration::from_secs(2), state.wait_for(|s| *s == TrackingState::Starting))
            .await
            .unwrap()
            .unwrap();

        orchestrator.stop_tracking().await;
        let result = tokio::time::timeout(Duration::from_secs(2), starting)
            .await
            .unwrap()
            .unwrap();

        assert!(matches!(result, Err(TrackingError::Cancelled)));
        assert_eq!(orchestrator.state(), TrackingState::Idle);
        assert_eq!(orchestrator.channel_state(), ChannelState::Closed);
        assert_eq!(feed.active_watches(), 0);
        assert_eq!(orchestrator.queue_len().await, 0);
        assert_eq!(orchestrator.entity_id().await, None);
    }

    #[tokio::test]
    async fn test_reconnect_exhaustion_reaches_caller() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Takes the join, then the server goes away for good
        let server = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            let mut conn = Connection::new(stream, peer);
            let join = next_json(&mut conn).await;
            drop(listener);
            drop(conn);
            join
        });

        let source = Arc::new(FeedSource::new(PermissionState::Granted));
        let orchestrator = TrackingOrchestrator::new(source.clone(), config(addr));
        orchestrator.start_tracking("asset-1", TrackingOptions::default()).await.unwrap();
        assert_ne!(orchestrator.channel_state(), ChannelState::Closed);
        assert_eq!(server.await.unwrap()["type"], "join");

        let mut channel = orchestrator.watch_channel();
        tokio::time::timeout(Duration::from_secs(5), channel.wait_for(|s| *s == ChannelState::Failed))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(orchestrator.state(), TrackingState::Tracking);
        assert!(!orchestrator.is_connected().await);

        // Readings keep landing in the offline queue
        source.feed().push(Ok(Coordinate::new(10.0, -66.0, 5.0, Utc::now())));
        let mut queued = 0;
        for _ in 0..200 {
            queued = orchestrator.queue_len().await;
            if queued == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(queued, 1);

        orchestrator.stop_tracking().await;
        assert_eq!(orchestrator.channel_state(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_noop() {
        let source = Arc::new(FeedSource::new(PermissionState::Granted));
        let orchestrator = TrackingOrchestrator::new(source, OrchestratorConfig::default());

        orchestrator.stop_tracking().await;
        orchestrator.stop_tracking().await;
        assert_eq!(orchestrator.state(), TrackingState::Idle);
    }

    #[tokio::test]
    async fn test_current_location_goes_through_estimator() {
        let source = Arc::new(FeedSource::new(PermissionState::Granted));
        let orchestrator = TrackingOrchestrator::new(source.clone(), OrchestratorConfig::default());
        source.feed().push(Ok(Coordinate::new(10.0, -66.0, 50.0, Utc::now())));

        let options = TrackingOptions {
            maximum_age: Duration::from_secs(60),
            ..Default::default()
        };
        let first = orchestrator.get_current_location(&options).await.unwrap();
        assert_eq!(first.accuracy, 50.0);

        let second = orchestrator.get_current_location(&options).await.unwrap();
        assert!(second.accuracy <= 5.0);
    }
}
