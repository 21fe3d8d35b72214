// Delivery channel
// Persistent connection to the tracking server with bounded reconnection,
// room join on every connect and offline queue flush

use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::connection::Connection;
use super::messages::{parse_inbound, ClientMessage, Inbound, InboundEvent};
use crate::constants::{
    DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_RECONNECT_ATTEMPTS, DEFAULT_RECONNECT_DELAY_MS,
    HEARTBEAT_INTERVAL_SECS, MIN_HEARTBEAT_INTERVAL_MS, OUTBOUND_BUFFER,
};
use crate::error::ChannelError;
use crate::location::LocationUpdate;
use crate::queue::SharedQueue;

/// Delivery channel settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Server address as host:port
    pub address: String,
    /// Connection attempts per (re)connect cycle
    pub reconnect_attempts: u32,
    /// Fixed delay between attempts
    #[serde(with = "crate::millis")]
    pub reconnect_delay: Duration,
    /// Deadline for a single connection attempt
    #[serde(with = "crate::millis")]
    pub connect_timeout: Duration,
    /// Idle keep-alive period, raised to `MIN_HEARTBEAT_INTERVAL_MS` if shorter
    #[serde(with = "crate::millis")]
    pub heartbeat_interval: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            address: "127.0.0.1:7400".to_string(),
            reconnect_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            reconnect_delay: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            heartbeat_interval: Duration::from_secs(HEARTBEAT_INTERVAL_SECS),
        }
    }
}

impl ChannelConfig {
    fn heartbeat_period(&self) -> Duration {
        self.heartbeat_interval
            .max(Duration::from_millis(MIN_HEARTBEAT_INTERVAL_MS))
    }
}

/// Connection state of a delivery channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Connected,
    /// Lost the connection, retrying in the background
    Reconnecting,
    /// Gave up after exhausting the reconnect attempts
    Failed,
    Closed,
}

/// Why a connected session ended
enum Exit {
    Shutdown,
    Lost(io::Error),
}

/// Cheap sending side of a channel, for the reading path.
#[derive(Clone)]
pub struct ChannelSender {
    updates: mpsc::Sender<LocationUpdate>,
    state: watch::Receiver<ChannelState>,
}

impl ChannelSender {
    pub fn is_connected(&self) -> bool {
        *self.state.borrow() == ChannelState::Connected
    }

    /// Follow connection state changes, including a final `Failed`.
    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.state.clone()
    }

    /// Fire-and-forget send. Hands the update back if the channel is not
    /// connected or its buffer is full, so the caller can queue it.
    pub fn try_emit(&self, update: LocationUpdate) -> Result<(), LocationUpdate> {
        if !self.is_connected() {
            return Err(update);
        }
        self.updates.try_send(update).map_err(|e| e.into_inner())
    }
}

/// Persistent connection for one entity's updates
pub struct DeliveryChannel {
    entity_id: String,
    config: ChannelConfig,
    sender: ChannelSender,
    flushes: mpsc::Sender<oneshot::Sender<usize>>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl DeliveryChannel {
    /// Connect, join the entity's room and flush any queued updates.
    ///
    /// Retries up to `reconnect_attempts` times before failing. After this
    /// returns, reconnection happens in the background.
    pub async fn connect(
        config: ChannelConfig,
        entity_id: String,
        queue: SharedQueue,
        events: broadcast::Sender<InboundEvent>,
    ) -> Result<Self, ChannelError> {
        let mut conn = connect_with_retry(&config).await?;
        join_and_flush(&mut conn, &entity_id, &queue).await?;

        let (updates_tx, updates_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let (flushes_tx, flushes_rx) = mpsc::channel(1);
        let (state_tx, state_rx) = watch::channel(ChannelState::Connected);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let worker = ChannelWorker {
            config: config.clone(),
            entity_id: entity_id.clone(),
            queue,
            events,
            updates: updates_rx,
            flushes: flushes_rx,
            state: state_tx,
            shutdown: shutdown_rx,
        };
        let task = tokio::spawn(worker.run(conn));

        Ok(DeliveryChannel {
            entity_id,
            config,
            sender: ChannelSender {
                updates: updates_tx,
                state: state_rx,
            },
            flushes: flushes_tx,
            shutdown: shutdown_tx,
            task: Some(task),
        })
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn state(&self) -> ChannelState {
        *self.sender.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.sender.is_connected()
    }

    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.sender.watch_state()
    }

    pub fn sender(&self) -> ChannelSender {
        self.sender.clone()
    }

    pub fn try_emit(&self, update: LocationUpdate) -> Result<(), LocationUpdate> {
        self.sender.try_emit(update)
    }

    /// Send everything in the offline queue now. Returns the number sent;
    /// zero when disconnected.
    pub async fn flush(&self) -> usize {
        if !self.is_connected() {
            return 0;
        }
        let (tx, rx) = oneshot::channel();
        if self.flushes.send(tx).await.is_err() {
            return 0;
        }
        match time::timeout(self.config.connect_timeout, rx).await {
            Ok(Ok(sent)) => sent,
            _ => 0,
        }
    }

    /// Leave the room and close the socket. Waits for the I/O task to exit.
    pub async fn close(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(entity = %self.entity_id, "channel task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for DeliveryChannel {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            let _ = self.shutdown.send(true);
            task.abort();
        }
    }
}

/// Connect with bounded attempts, fixed delay and a per-attempt deadline.
pub async fn connect_with_retry(config: &ChannelConfig) -> Result<Connection, ChannelError> {
    let attempts = config.reconnect_attempts.max(1);
    let mut last = String::new();

    for attempt in 1..=attempts {
        match time::timeout(config.connect_timeout, TcpStream::connect(config.address.as_str())).await {
            Ok(Ok(stream)) => {
                let peer_addr = stream.peer_addr()?;
                info!(attempt, "connected to {}", peer_addr);
                return Ok(Connection::new(stream, peer_addr));
            }
            Ok(Err(e)) if e.kind() == io::ErrorKind::InvalidInput => {
                return Err(ChannelError::InvalidAddress(config.address.clone()));
            }
            Ok(Err(e)) => last = e.to_string(),
            Err(_) => last = format!("timed out after {:?}", config.connect_timeout),
        }

        warn!(attempt, attempts, "connect to {} failed: {}", config.address, last);
        if attempt < attempts {
            time::sleep(config.reconnect_delay).await;
        }
    }

    Err(ChannelError::ConnectFailed { attempts, last })
}

async fn join(conn: &mut Connection, entity_id: &str) -> io::Result<()> {
    conn.write_json(&ClientMessage::Join {
        entity_id: entity_id.to_string(),
    })
    .await
}

async fn join_and_flush(conn: &mut Connection, entity_id: &str, queue: &SharedQueue) -> io::Result<usize> {
    join(conn, entity_id).await?;
    flush_queue(conn, queue).await
}

/// Send queued entries in FIFO order until the queue is empty.
///
/// The queue stays locked for each write and an entry is removed only once
/// its write has completed, so a failed or cancelled flush leaves every
/// unsent entry queued. Entries pushed mid-flush go out in the same pass.
async fn flush_queue(conn: &mut Connection, queue: &SharedQueue) -> io::Result<usize> {
    let mut sent = 0;
    loop {
        let mut pending = queue.lock().await;
        let msg = match pending.front() {
            Some(entry) => ClientMessage::LocationUpdate(entry.update.clone()),
            None => break,
        };
        if let Err(e) = conn.write_json(&msg).await {
            warn!(sent, unsent = pending.len(), "queue flush interrupted: {}", e);
            return Err(e);
        }
        pending.pop_front();
        sent += 1;
    }

    if sent > 0 {
        info!(sent, "flushed offline queue");
    }
    Ok(sent)
}

struct ChannelWorker {
    config: ChannelConfig,
    entity_id: String,
    queue: SharedQueue,
    events: broadcast::Sender<InboundEvent>,
    updates: mpsc::Receiver<LocationUpdate>,
    flushes: mpsc::Receiver<oneshot::Sender<usize>>,
    state: watch::Sender<ChannelState>,
    shutdown: watch::Receiver<bool>,
}

impl ChannelWorker {
    async fn run(mut self, conn: Connection) {
        let mut conn = Some(conn);

        loop {
            let exit = match conn.as_mut() {
                Some(c) => self.serve(c).await,
                None => break,
            };

            match exit {
                Exit::Shutdown => {
                    if let Some(c) = conn.as_mut() {
                        let leave = ClientMessage::Leave {
                            entity_id: self.entity_id.clone(),
                        };
                        let _ = c.write_json(&leave).await;
                        let _ = c.shutdown().await;
                    }
                    break;
                }
                Exit::Lost(e) => {
                    warn!(entity = %self.entity_id, "delivery channel lost: {}", e);
                    drop(conn.take());
                    self.state.send_replace(ChannelState::Reconnecting);
                    self.divert_pending().await;
                    conn = self.reconnect().await;
                }
            }
        }

        if *self.state.borrow() == ChannelState::Failed && !*self.shutdown.borrow() {
            self.idle_until_shutdown().await;
        }

        self.state.send_replace(ChannelState::Closed);
        self.divert_pending().await;
        debug!(entity = %self.entity_id, "channel task finished");
    }

    /// Pump one live connection until shutdown or an I/O failure.
    ///
    /// Anything queued while the state was not yet `Connected` is flushed first.
    async fn serve(&mut self, conn: &mut Connection) -> Exit {
        let mut heartbeat = time::interval(self.config.heartbeat_period());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        heartbeat.tick().await;

        if let Err(e) = flush_queue(conn, &self.queue).await {
            return Exit::Lost(e);
        }

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => return Exit::Shutdown,
                update = self.updates.recv() => match update {
                    Some(update) => {
                        if let Err(e) = self.send_update(conn, update).await {
                            return Exit::Lost(e);
                        }
                    }
                    None => return Exit::Shutdown,
                },
                Some(reply) = self.flushes.recv() => match flush_queue(conn, &self.queue).await {
                    Ok(sent) => {
                        let _ = reply.send(sent);
                    }
                    Err(e) => {
                        let _ = reply.send(0);
                        return Exit::Lost(e);
                    }
                },
                line = conn.read_line() => match line {
                    Ok(Some(line)) => self.handle_inbound(&line),
                    Ok(None) => {
                        return Exit::Lost(io::Error::new(io::ErrorKind::UnexpectedEof, "server closed connection"));
                    }
                    Err(e) => return Exit::Lost(e),
                },
                _ = heartbeat.tick() => {
                    if let Err(e) = conn.write_json(&ClientMessage::Heartbeat {}).await {
                        return Exit::Lost(e);
                    }
                    // Picks up anything queued in the gap before reconnection finished
                    if let Err(e) = flush_queue(conn, &self.queue).await {
                        return Exit::Lost(e);
                    }
                }
            }
        }
    }

    /// Write one update, unless older ones are still queued: then it joins
    /// the back of the queue and the whole queue is flushed in order.
    async fn send_update(&self, conn: &mut Connection, update: LocationUpdate) -> io::Result<()> {
        {
            let mut queue = self.queue.lock().await;
            if !queue.is_empty() {
                queue.push(update);
                drop(queue);
                return flush_queue(conn, &self.queue).await.map(|_| ());
            }
        }

        let msg = ClientMessage::LocationUpdate(update);
        if let Err(e) = conn.write_json(&msg).await {
            if let ClientMessage::LocationUpdate(update) = msg {
                self.queue.lock().await.push(update);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Background reconnection. Returns None on shutdown or exhaustion.
    ///
    /// Only joins; `serve` flushes the queue once the state is `Connected`.
    async fn reconnect(&mut self) -> Option<Connection> {
        let attempt = async {
            let mut conn = connect_with_retry(&self.config).await?;
            join(&mut conn, &self.entity_id).await?;
            Ok::<_, ChannelError>(conn)
        };

        let mut shutdown = self.shutdown.clone();
        let result = tokio::select! {
            result = attempt => result,
            _ = shutdown.changed() => return None,
        };

        match result {
            Ok(conn) => {
                info!(entity = %self.entity_id, "delivery channel reconnected");
                self.state.send_replace(ChannelState::Connected);
                Some(conn)
            }
            Err(e) => {
                error!(entity = %self.entity_id, "giving up on delivery channel: {}", e);
                self.state.send_replace(ChannelState::Failed);
                None
            }
        }
    }

    /// After giving up, keep routing stray updates into the queue.
    async fn idle_until_shutdown(&mut self) {
        loop {
            tokio::select! {
                _ = self.shutdown.changed() => return,
                update = self.updates.recv() => match update {
                    Some(update) => {
                        self.queue.lock().await.push(update);
                    }
                    None => return,
                },
                Some(reply) = self.flushes.recv() => {
                    let _ = reply.send(0);
                }
            }
        }
    }

    /// Move updates already buffered for sending into the offline queue.
    async fn divert_pending(&mut self) {
        let mut diverted = 0;
        while let Ok(update) = self.updates.try_recv() {
            self.queue.lock().await.push(update);
            diverted += 1;
        }
        while let Ok(reply) = self.flushes.try_recv() {
            let _ = reply.send(0);
        }
        if diverted > 0 {
            debug!(diverted, "buffered updates moved to offline queue");
        }
    }

    fn handle_inbound(&self, line: &str) {
        match parse_inbound(line) {
            Ok(Inbound::Event(event)) => {
                // No subscribers is fine
                let _ = self.events.send(event);
            }
            Ok(Inbound::Joined { entity_id }) => debug!(entity = %entity_id, "room joined"),
            Ok(Inbound::Heartbeat) => {}
            Ok(Inbound::Unknown(value)) => debug!("ignoring inbound message: {}", value),
            Err(e) => warn!("malformed inbound line: {}", e),
        }
    }
}
