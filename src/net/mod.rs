// Network layer module
// Line-delimited JSON over TCP: delivery channel client and relay server

pub mod channel;
pub mod connection;
pub mod listener;
pub mod messages;
pub mod relay;

pub use channel::{connect_with_retry, ChannelConfig, ChannelSender, ChannelState, DeliveryChannel};
pub use connection::Connection;
pub use listener::TcpServer;
pub use messages::{ClientMessage, InboundEvent, InboundKind, ServerMessage};
pub use relay::Relay;
