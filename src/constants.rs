// Shared constants for estimation and delivery

/// Meters per degree of latitude (flat approximation used for accuracy and speed).
pub const METERS_PER_DEGREE: f64 = 111_000.0;

/// Default ceiling applied to the emitted accuracy (m).
pub const DEFAULT_ACCURACY_CEILING_M: f64 = 5.0;

/// Default process noise added to every state component per predict step.
pub const DEFAULT_PROCESS_NOISE: f64 = 0.01;

/// Default measurement noise, scaled by the reported accuracy squared.
pub const DEFAULT_MEASUREMENT_NOISE: f64 = 0.1;

/// Default initial estimation error (diagonal of P after initialization).
pub const DEFAULT_ESTIMATION_ERROR: f64 = 1.0;

/// Lower clamp for the predict step (s).
pub const MIN_DT_SECS: f64 = 0.1;

/// Upper clamp for the predict step (s).
pub const MAX_DT_SECS: f64 = 10.0;

/// Determinant below which a 2x2 matrix is treated as singular.
pub const SINGULAR_DETERMINANT: f64 = 1e-12;

/// Below this speed (m/s) the raw heading is kept instead of the derived one.
pub const MIN_HEADING_SPEED_MS: f64 = 0.5;

/// Default offline queue capacity (entries).
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Default number of connection attempts before giving up.
pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 5;

/// Default fixed delay between connection attempts (ms).
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 1_000;

/// Default per-attempt connect timeout (ms).
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 20_000;

/// Heartbeat interval on an idle delivery channel (s).
pub const HEARTBEAT_INTERVAL_SECS: u64 = 25;

/// Default position read timeout (ms).
pub const DEFAULT_POSITION_TIMEOUT_MS: u64 = 10_000;

/// Default maximum age of a cached fix (ms). Zero means always read fresh.
pub const DEFAULT_MAXIMUM_AGE_MS: u64 = 0;

/// Buffered readings per position watch before the feed starts dropping.
pub const WATCH_BUFFER: usize = 64;

/// Buffered outbound messages on the delivery channel.
pub const OUTBOUND_BUFFER: usize = 256;

/// Capacity of the inbound event broadcast.
pub const INBOUND_BUFFER: usize = 100;

/// Shortest heartbeat period accepted from configuration (ms).
pub const MIN_HEARTBEAT_INTERVAL_MS: u64 = 100;
