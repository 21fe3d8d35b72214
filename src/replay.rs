// Recorded reading replay
// Loads JSON-lines recordings and pushes them into a position feed

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{PositionError, ReplayError};
use crate::location::Coordinate;
use crate::position::{PositionFeed, PositionReading};

/// One recorded line: a failure marker or a fix
#[derive(Deserialize)]
#[serde(untagged)]
enum RecordedReading {
    Failure { error: PositionError },
    Fix(Coordinate),
}

/// An in-memory recording of position readings
#[derive(Debug, Clone, Default)]
pub struct Replay {
    readings: Vec<PositionReading>,
}

impl Replay {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ReplayError> {
        let text = tokio::fs::read_to_string(path.as_ref()).await?;
        let replay = Self::parse(&text)?;
        info!(
            readings = replay.len(),
            "loaded recording from {}",
            path.as_ref().display()
        );
        Ok(replay)
    }

    /// Parse one reading per line. Blank lines and `#` comments are skipped.
    pub fn parse(text: &str) -> Result<Self, ReplayError> {
        let mut readings = Vec::new();
        for (idx, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let recorded: RecordedReading =
                serde_json::from_str(line).map_err(|source| ReplayError::Parse { line: idx + 1, source })?;
            readings.push(match recorded {
                RecordedReading::Failure { error } => Err(error),
                RecordedReading::Fix(fix) => Ok(fix),
            });
        }
        Ok(Replay { readings })
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    pub fn readings(&self) -> &[PositionReading] {
        &self.readings
    }

    /// Push every reading into `feed`, sleeping for the recorded gap between
    /// fixes divided by `speed`. A non-positive speed disables pacing.
    pub async fn play(&self, feed: &PositionFeed, speed: f64) -> usize {
        let mut previous: Option<DateTime<Utc>> = None;

        for reading in &self.readings {
            if let Ok(fix) = reading {
                if let Some(delay) = previous.and_then(|prev| pacing_delay(prev, fix.timestamp, speed)) {
                    tokio::time::sleep(delay).await;
                }
                previous = Some(fix.timestamp);
            }
            feed.push(reading.clone());
        }

        debug!(pushed = self.readings.len(), "replay finished");
        self.readings.len()
    }
}

/// Wall-clock wait between two recorded timestamps at the given speed.
fn pacing_delay(previous: DateTime<Utc>, next: DateTime<Utc>, speed: f64) -> Option<Duration> {
    if !speed.is_finite() || speed <= 0.0 {
        return None;
    }
    let gap = (next - previous).to_std().ok()?;
    Some(gap.div_f64(speed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::{FeedSource, PermissionState, PositionSource, TrackingOptions};

    const RECORDING: &str = r#"
# depot loop
{"latitude": 10.0, "longitude": -66.0, "accuracy": 12.0, "timestamp": "2024-03-01T12:00:00Z"}
{"error": "timeout"}
{"latitude": 10.0001, "longitude": -66.0, "accuracy": 8.0, "timestamp": "2024-03-01T12:00:02Z", "speed": 5.5}
"#;

    #[test]
    fn test_parse_fixes_and_failures() {
        let replay = Replay::parse(RECORDING).unwrap();
        assert_eq!(replay.len(), 3);
        assert_eq!(replay.readings()[0].as_ref().unwrap().accuracy, 12.0);
        assert_eq!(replay.readings()[1], Err(PositionError::Timeout));
        assert_eq!(replay.readings()[2].as_ref().unwrap().speed, Some(5.5));
    }

    #[test]
    fn test_parse_reports_line_number() {
        let text = "{\"error\": \"timeout\"}\n{\"latitude\": 1.0}\n";
        match Replay::parse(text) {
            Err(ReplayError::Parse { line, .. }) => assert_eq!(line, 2),
            other => panic!("Expected parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_pacing_delay() {
        let t0: DateTime<Utc> = "2024-03-01T12:00:00Z".parse().unwrap();
        let t1: DateTime<Utc> = "2024-03-01T12:00:02Z".parse().unwrap();

        assert_eq!(pacing_delay(t0, t1, 1.0), Some(Duration::from_secs(2)));
        assert_eq!(pacing_delay(t0, t1, 4.0), Some(Duration::from_millis(500)));
        assert_eq!(pacing_delay(t0, t1, 0.0), None);
        // Out-of-order timestamps do not wait
        assert_eq!(pacing_delay(t1, t0, 1.0), None);
    }

    #[tokio::test]
    async fn test_play_pushes_in_order() {
        let source = FeedSource::new(PermissionState::Granted);
        let mut watch = source.watch_position(&TrackingOptions::default()).unwrap();
        let replay = Replay::parse(RECORDING).unwrap();

        assert_eq!(replay.play(&source.feed(), 0.0).await, 3);

        assert_eq!(watch.next().await.unwrap().unwrap().latitude, 10.0);
        assert_eq!(watch.next().await.unwrap(), Err(PositionError::Timeout));
        assert_eq!(watch.next().await.unwrap().unwrap().latitude, 10.0001);
    }
}
