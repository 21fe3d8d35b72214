pub mod constants;
pub mod error;
pub mod location;
mod millis;
pub mod kalman;
pub mod position;
pub mod queue;
pub mod net;
pub mod orchestrator;
pub mod replay;
pub mod config;

pub use error::{ChannelError, PositionError, ReplayError, TrackingError};
pub use location::{Coordinate, LocationUpdate};
pub use orchestrator::{OrchestratorConfig, TrackingOrchestrator, TrackingState};
