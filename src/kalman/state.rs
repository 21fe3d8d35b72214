// Kalman filter state for a single tracked entity
// Constant-velocity model over [lat, lon, v_lat, v_lon] in degrees

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::linalg::{
    constant_velocity_transition, invert_2x2_or_identity, position_observation, Matrix2,
    Matrix4, Vector2, Vector4,
};
use crate::constants::{
    DEFAULT_ACCURACY_CEILING_M, DEFAULT_ESTIMATION_ERROR, DEFAULT_MEASUREMENT_NOISE,
    DEFAULT_PROCESS_NOISE, MAX_DT_SECS, METERS_PER_DEGREE, MIN_DT_SECS, MIN_HEADING_SPEED_MS,
};
use crate::location::Coordinate;

/// Estimator tuning
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    /// Diagonal of the process-noise matrix Q
    pub process_noise: f64,
    /// Measurement noise, scaled by the reported accuracy squared to form R
    pub measurement_noise: f64,
    /// Diagonal of P after (re)initialization
    pub estimation_error: f64,
    /// Upper bound on the emitted accuracy (m)
    pub accuracy_ceiling: f64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        EstimatorConfig {
            process_noise: DEFAULT_PROCESS_NOISE,
            measurement_noise: DEFAULT_MEASUREMENT_NOISE,
            estimation_error: DEFAULT_ESTIMATION_ERROR,
            accuracy_ceiling: DEFAULT_ACCURACY_CEILING_M,
        }
    }
}

/// Read-only snapshot of the filter internals
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EstimatorState {
    /// [lat, lon] in degrees
    pub position: [f64; 2],
    /// [lat, lon] rates in degrees per second
    pub velocity: [f64; 2],
    /// Row-major 4x4 covariance
    pub covariance: [[f64; 4]; 4],
    pub initialized: bool,
    /// Number of predict/update cycles since the last reset
    pub updates: u64,
}

/// Kalman filter for one tracked entity
#[derive(Debug, Clone)]
pub struct Estimator {
    config: EstimatorConfig,
    x: Vector4,
    p: Matrix4,
    q: Matrix4,
    last_timestamp: Option<DateTime<Utc>>,
    updates: u64,
}

impl Estimator {
    pub fn new(config: EstimatorConfig) -> Self {
        Estimator {
            config,
            x: Vector4::zeros(),
            p: Matrix4::identity() * config.estimation_error,
            q: Matrix4::identity() * config.process_noise,
            last_timestamp: None,
            updates: 0,
        }
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.last_timestamp.is_some()
    }

    /// Seed the state directly from a reading. Velocity starts at zero.
    pub fn initialize(&mut self, raw: &Coordinate) {
        self.x = Vector4::new(raw.latitude, raw.longitude, 0.0, 0.0);
        self.p = Matrix4::identity() * self.config.estimation_error;
        self.last_timestamp = Some(raw.timestamp);
        self.updates = 0;
    }

    /// Return to the uninitialized state with default covariance.
    pub fn reset(&mut self) {
        self.x = Vector4::zeros();
        self.p = Matrix4::identity() * self.config.estimation_error;
        self.last_timestamp = None;
        self.updates = 0;
    }

    /// Feed one raw reading and return the filtered coordinate.
    ///
    /// The first reading after construction or `reset()` only initializes the
    /// state and is returned unchanged.
    pub fn filter(&mut self, raw: &Coordinate) -> Coordinate {
        let last = match self.last_timestamp {
            Some(t) => t,
            None => {
                self.initialize(raw);
                return raw.clone();
            }
        };

        let dt = clamp_dt(raw.timestamp, last);
        self.predict(dt);
        self.update(raw);
        self.last_timestamp = Some(raw.timestamp);
        self.updates += 1;

        self.emit(raw)
    }

    pub fn get_state(&self) -> EstimatorState {
        let mut covariance = [[0.0; 4]; 4];
        for (i, row) in covariance.iter_mut().enumerate() {
            for (j, cell) in row.iter_mut().enumerate() {
                *cell = self.p[(i, j)];
            }
        }
        EstimatorState {
            position: [self.x[0], self.x[1]],
            velocity: [self.x[2], self.x[3]],
            covariance,
            initialized: self.is_initialized(),
            updates: self.updates,
        }
    }

    /// x' = F x, P' = F P Fᵗ + Q
    fn predict(&mut self, dt: f64) {
        let f = constant_velocity_transition(dt);
        self.x = f * self.x;
        self.p = f * self.p * f.transpose() + self.q;
    }

    /// Measurement update against the reported position.
    ///
    /// A singular innovation covariance leaves the prediction in place.
    fn update(&mut self, raw: &Coordinate) {
        let r = match self.measurement_covariance(raw.accuracy) {
            Some(r) => r,
            None => {
                warn!(
                    accuracy = raw.accuracy,
                    "degenerate measurement accuracy, skipping correction"
                );
                return;
            }
        };

        let h = position_observation();
        let z = Vector2::new(raw.latitude, raw.longitude);
        let innovation = z - h * self.x;
        let s = h * self.p * h.transpose() + r;

        let (s_inv, singular) = invert_2x2_or_identity(&s);
        if singular {
            warn!(det = s.determinant(), "singular innovation covariance, skipping correction");
            return;
        }

        let k = self.p * h.transpose() * s_inv;
        self.x += k * innovation;
        self.p = (Matrix4::identity() - k * h) * self.p;

        debug!(
            innovation_lat = innovation[0],
            innovation_lon = innovation[1],
            gain = k[(0, 0)],
            "filter update"
        );
    }

    /// R = I * measurement_noise * accuracy². None for unusable accuracies.
    fn measurement_covariance(&self, accuracy: f64) -> Option<Matrix2> {
        if !accuracy.is_finite() || accuracy <= 0.0 {
            return None;
        }
        Some(Matrix2::identity() * (self.config.measurement_noise * accuracy * accuracy))
    }

    fn emit(&self, raw: &Coordinate) -> Coordinate {
        let latitude = self.x[0];
        let longitude = self.x[1];

        let spread = self.p[(0, 0)] + self.p[(1, 1)];
        let accuracy = (spread.max(0.0).sqrt() * METERS_PER_DEGREE).min(self.config.accuracy_ceiling);

        let north = self.x[2] * METERS_PER_DEGREE;
        let east = self.x[3] * METERS_PER_DEGREE * latitude.to_radians().cos();
        let speed = (north * north + east * east).sqrt();

        let heading = if speed > MIN_HEADING_SPEED_MS {
            let mut heading = east.atan2(north).to_degrees();
            if heading < 0.0 {
                heading += 360.0;
            }
            Some(heading)
        } else {
            raw.heading
        };

        Coordinate {
            latitude,
            longitude,
            accuracy,
            timestamp: raw.timestamp,
            altitude: raw.altitude,
            heading,
            speed: Some(speed),
        }
    }
}

impl Default for Estimator {
    fn default() -> Self {
        Self::new(EstimatorConfig::default())
    }
}

/// Elapsed seconds between readings, clamped to [MIN_DT_SECS, MAX_DT_SECS].
fn clamp_dt(now: DateTime<Utc>, last: DateTime<Utc>) -> f64 {
    let dt = (now - last).num_milliseconds() as f64 / 1000.0;
    dt.clamp(MIN_DT_SECS, MAX_DT_SECS)
}
