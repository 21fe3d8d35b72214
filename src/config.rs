use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::constants::{
    DEFAULT_ACCURACY_CEILING_M, DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_ESTIMATION_ERROR,
    DEFAULT_MAXIMUM_AGE_MS, DEFAULT_MEASUREMENT_NOISE, DEFAULT_POSITION_TIMEOUT_MS,
    DEFAULT_PROCESS_NOISE, DEFAULT_QUEUE_CAPACITY, DEFAULT_RECONNECT_ATTEMPTS,
    DEFAULT_RECONNECT_DELAY_MS, HEARTBEAT_INTERVAL_SECS,
};
use crate::kalman::EstimatorConfig;
use crate::net::channel::ChannelConfig;
use crate::orchestrator::OrchestratorConfig;
use crate::position::TrackingOptions;
use crate::queue::QueueConfig;

/// Geotrack Configuration
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    #[command(subcommand)]
    pub command: Command,

    /// Verbose logging (DEBUG level)
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Replay a recording of position readings through the tracking pipeline.
    Track(TrackArgs),
    /// Run a relay server that rebroadcasts updates between room members.
    Relay(RelayArgs),
}

#[derive(Args, Debug, Clone)]
pub struct TrackArgs {
    /// Tracking server to connect to.
    #[arg(long, value_name = "HOST:PORT", default_value = "127.0.0.1:7400")]
    pub server: String,

    /// Entity whose room the updates are published to.
    #[arg(long)]
    pub entity: String,

    /// JSON-lines file of recorded readings.
    #[arg(long, value_name = "FILE")]
    pub readings: PathBuf,

    /// Replay speed multiplier, 0 to push readings without pacing
    #[arg(long, default_value_t = 1.0)]
    pub speed: f64,

    /// Request high-accuracy positioning.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub high_accuracy: bool,

    /// Timeout for a single position read in milliseconds
    #[arg(long, default_value_t = DEFAULT_POSITION_TIMEOUT_MS)]
    pub timeout_ms: u64,

    /// Maximum age of a cached fix in milliseconds
    #[arg(long, default_value_t = DEFAULT_MAXIMUM_AGE_MS)]
    pub max_age_ms: u64,

    #[arg(long, default_value_t = DEFAULT_PROCESS_NOISE)]
    pub process_noise: f64,

    #[arg(long, default_value_t = DEFAULT_MEASUREMENT_NOISE)]
    pub measurement_noise: f64,

    #[arg(long, default_value_t = DEFAULT_ESTIMATION_ERROR)]
    pub estimation_error: f64,

    /// Upper bound on the reported accuracy in meters
    #[arg(long, default_value_t = DEFAULT_ACCURACY_CEILING_M)]
    pub accuracy_ceiling: f64,

    /// Updates held while the server is unreachable
    #[arg(long, default_value_t = DEFAULT_QUEUE_CAPACITY)]
    pub queue_capacity: usize,

    #[arg(long, default_value_t = DEFAULT_RECONNECT_ATTEMPTS)]
    pub reconnect_attempts: u32,

    #[arg(long, default_value_t = DEFAULT_RECONNECT_DELAY_MS)]
    pub reconnect_delay_ms: u64,

    #[arg(long, default_value_t = DEFAULT_CONNECT_TIMEOUT_MS)]
    pub connect_timeout_ms: u64,

    /// Seconds to wait for queued updates to drain after the replay ends
    #[arg(long, default_value_t = 2)]
    pub linger_secs: u64,
}

#[derive(Args, Debug, Clone)]
pub struct RelayArgs {
    /// Address to accept delivery channels on.
    #[arg(long, value_name = "ADDR", default_value = "0.0.0.0:7400")]
    pub listen: SocketAddr,
}

impl TrackArgs {
    pub fn tracking_options(&self) -> TrackingOptions {
        TrackingOptions {
            enable_high_accuracy: self.high_accuracy,
            timeout: Duration::from_millis(self.timeout_ms),
            maximum_age: Duration::from_millis(self.max_age_ms),
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            estimator: EstimatorConfig {
                process_noise: self.process_noise,
                measurement_noise: self.measurement_noise,
                estimation_error: self.estimation_error,
                accuracy_ceiling: self.accuracy_ceiling,
            },
            channel: ChannelConfig {
                address: self.server.clone(),
                reconnect_attempts: self.reconnect_attempts,
                reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
                connect_timeout: Duration::from_millis(self.connect_timeout_ms),
                heartbeat_interval: Duration::from_secs(HEARTBEAT_INTERVAL_SECS),
            },
            queue: QueueConfig {
                capacity: self.queue_capacity,
            },
        }
    }
}
