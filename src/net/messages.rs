// JSON message type definitions
// Line-delimited protocol between a delivery channel and its server

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::location::LocationUpdate;

/// Messages sent from a tracking client to the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Join the room for an entity; sent on every (re)connect
    Join { entity_id: String },
    /// Filtered position for an entity
    LocationUpdate(LocationUpdate),
    /// Leave the room on graceful disconnect
    Leave { entity_id: String },
    /// Keep-alive
    Heartbeat {},
}

/// Messages generated by the server itself
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Join acknowledgment
    Joined { entity_id: String },
    Heartbeat { server_time: f64 },
}

/// Kinds of inbound events forwarded to consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InboundKind {
    GeofenceAlert,
    LocationUpdate,
}

/// Inbound event, payload forwarded unmodified
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    pub kind: InboundKind,
    pub payload: Value,
}

/// Classified inbound line
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Event(InboundEvent),
    Joined { entity_id: String },
    Heartbeat,
    /// Valid JSON with an unrecognized or missing type
    Unknown(Value),
}

/// Message type tag of a JSON object, if any
pub fn message_type(value: &Value) -> Option<&str> {
    value.get("type").and_then(Value::as_str)
}

/// Parse one inbound line.
pub fn parse_inbound(line: &str) -> Result<Inbound, serde_json::Error> {
    let value: Value = serde_json::from_str(line)?;

    let kind = match message_type(&value) {
        Some("geofence_alert") => InboundKind::GeofenceAlert,
        Some("location_update") => InboundKind::LocationUpdate,
        Some("joined") | Some("heartbeat") => {
            return match serde_json::from_value::<ServerMessage>(value.clone()) {
                Ok(ServerMessage::Joined { entity_id }) => Ok(Inbound::Joined { entity_id }),
                Ok(ServerMessage::Heartbeat { .. }) => Ok(Inbound::Heartbeat),
                Err(_) => Ok(Inbound::Unknown(value)),
            };
        }
        _ => return Ok(Inbound::Unknown(value)),
    };

    Ok(Inbound::Event(InboundEvent { kind, payload: value }))
}
