// Room relay server
// Development endpoint for delivery channels: tracks room membership and
// rebroadcasts location updates and alerts to the other members of a room

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use super::connection::Connection;
use super::listener::TcpServer;
use super::messages::{message_type, ServerMessage};
use crate::constants::OUTBOUND_BUFFER;

type Room = HashMap<u64, mpsc::Sender<String>>;

/// Relay state shared by all client handlers
pub struct Relay {
    rooms: RwLock<HashMap<String, Room>>,
    next_client_id: AtomicU64,
    clients: AtomicUsize,
    relayed: AtomicU64,
}

/// Decrements the live client count when a handler exits
struct ClientGuard<'a>(&'a AtomicUsize);

impl Drop for ClientGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Relay {
    pub fn new() -> Arc<Self> {
        Arc::new(Relay {
            rooms: RwLock::new(HashMap::new()),
            next_client_id: AtomicU64::new(1),
            clients: AtomicUsize::new(0),
            relayed: AtomicU64::new(0),
        })
    }

    /// Bind and start accepting channel clients.
    pub async fn serve(self: &Arc<Self>, addr: SocketAddr) -> io::Result<TcpServer> {
        let relay = Arc::clone(self);
        TcpServer::start(addr, move |conn| {
            let relay = Arc::clone(&relay);
            async move { relay.handle_client(conn).await }
        })
        .await
    }

    /// Connected clients
    pub fn client_count(&self) -> usize {
        self.clients.load(Ordering::SeqCst)
    }

    /// Messages rebroadcast so far
    pub fn relayed_count(&self) -> u64 {
        self.relayed.load(Ordering::Relaxed)
    }

    pub async fn room_size(&self, room: &str) -> usize {
        self.rooms.read().await.get(room).map_or(0, HashMap::len)
    }

    async fn handle_client(&self, mut conn: Connection) {
        let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        self.clients.fetch_add(1, Ordering::SeqCst);
        let _guard = ClientGuard(&self.clients);
        let peer = conn.peer_addr();
        info!(client = client_id, "relay client connected from {}", peer);

        let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);
        let mut room: Option<String> = None;

        loop {
            tokio::select! {
                line = conn.read_line() => match line {
                    Ok(Some(line)) => {
                        if let Err(e) = self.handle_line(client_id, &line, &mut room, &tx, &mut conn).await {
                            debug!(client = client_id, "write failed: {}", e);
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!(client = client_id, "read error: {}", e);
                        break;
                    }
                },
                Some(out) = rx.recv() => {
                    if let Err(e) = conn.write_line(&out).await {
                        debug!(client = client_id, "write failed: {}", e);
                        break;
                    }
                }
            }
        }

        if let Some(room) = room.take() {
            self.leave(&room, client_id).await;
        }
        info!(client = client_id, "relay client {} disconnected", peer);
    }

    async fn handle_line(
        &self,
        client_id: u64,
        line: &str,
        room: &mut Option<String>,
        tx: &mpsc::Sender<String>,
        conn: &mut Connection,
    ) -> io::Result<()> {
        let value: serde_json::Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                warn!(client = client_id, "invalid message: {}", e);
                return Ok(());
            }
        };

        match message_type(&value) {
            Some("join") => {
                let entity_id = match value.get("entity_id").and_then(|v| v.as_str()) {
                    Some(id) => id.to_string(),
                    None => {
                        warn!(client = client_id, "join without entity_id");
                        return Ok(());
                    }
                };
                if let Some(old) = room.take() {
                    self.leave(&old, client_id).await;
                }
                self.rooms
                    .write()
                    .await
                    .entry(entity_id.clone())
                    .or_default()
                    .insert(client_id, tx.clone());
                debug!(client = client_id, room = %entity_id, "joined");
                *room = Some(entity_id.clone());
                conn.write_json(&ServerMessage::Joined { entity_id }).await?;
            }
            Some("leave") => {
                if let Some(old) = room.take() {
                    self.leave(&old, client_id).await;
                }
            }
            Some("location_update") | Some("geofence_alert") => {
                if let Some(room) = room.as_deref() {
                    self.broadcast(room, client_id, line).await;
                }
            }
            Some("heartbeat") => {
                let server_time = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs_f64())
                    .unwrap_or_default();
                conn.write_json(&ServerMessage::Heartbeat { server_time }).await?;
            }
            other => debug!(client = client_id, "unhandled message type {:?}", other),
        }

        Ok(())
    }

    /// Forward a line unmodified to every other member of the room.
    async fn broadcast(&self, room: &str, from: u64, line: &str) {
        let rooms = self.rooms.read().await;
        let Some(members) = rooms.get(room) else {
            return;
        };
        for (id, tx) in members {
            if *id == from {
                continue;
            }
            if tx.try_send(line.to_string()).is_ok() {
                self.relayed.fetch_add(1, Ordering::Relaxed);
            } else {
                warn!(client = id, "relay client lagging, message dropped");
            }
        }
    }

    async fn leave(&self, room: &str, client_id: u64) {
        let mut rooms = self.rooms.write().await;
        if let Some(members) = rooms.get_mut(room) {
            members.remove(&client_id);
            if members.is_empty() {
                rooms.remove(room);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::time::Duration;
    use tokio::net::TcpStream;

    async fn client(addr: SocketAddr) -> Connection {
        let stream = TcpStream::connect(addr).await.unwrap();
        Connection::new(stream, addr)
    }

    async fn next_json(conn: &mut Connection) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(2), conn.read_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test]
    async fn test_join_and_rebroadcast() {
        let relay = Relay::new();
        let server = relay.serve("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let mut tracker = client(server.addr()).await;
        let mut watcher = client(server.addr()).await;

        tracker.write_line(r#"{"type":"join","entity_id":"asset-1"}"#).await.unwrap();
        assert_eq!(next_json(&mut tracker).await["type"], "joined");
        watcher.write_line(r#"{"type":"join","entity_id":"asset-1"}"#).await.unwrap();
        assert_eq!(next_json(&mut watcher).await["type"], "joined");
        assert_eq!(relay.room_size("asset-1").await, 2);

        let update = r#"{"type":"location_update","entity_id":"asset-1","lat":1}"#;
        tracker.write_line(update).await.unwrap();
        let got = next_json(&mut watcher).await;
        assert_eq!(got, serde_json::from_str::<Value>(update).unwrap());
        assert_eq!(relay.relayed_count(), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_reply_and_disconnect_cleanup() {
        let relay = Relay::new();
        let server = relay.serve("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let mut conn = client(server.addr()).await;
        conn.write_line(r#"{"type":"join","entity_id":"x"}"#).await.unwrap();
        next_json(&mut conn).await;
        conn.write_line(r#"{"type":"heartbeat"}"#).await.unwrap();
        assert_eq!(next_json(&mut conn).await["type"], "heartbeat");
        assert_eq!(relay.client_count(), 1);

        drop(conn);
        for _ in 0..100 {
            if relay.client_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(relay.client_count(), 0);
        assert_eq!(relay.room_size("x").await, 0);
    }
}
