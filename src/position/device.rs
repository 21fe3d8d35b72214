// Best-effort device metadata attached to each update

/// Optional platform capabilities. Either lookup may be unavailable.
pub trait DeviceProbe: Send + Sync {
    /// Battery level in [0, 1]
    fn battery_level(&self) -> Option<f32> {
        None
    }

    /// Connection type label such as "wifi" or "4g"
    fn network_type(&self) -> Option<String> {
        None
    }
}

/// Probe for platforms with no metadata support
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProbe;

impl DeviceProbe for NoopProbe {}

/// Probe returning fixed values
#[derive(Debug, Clone, Default)]
pub struct StaticProbe {
    pub battery_level: Option<f32>,
    pub network_type: Option<String>,
}

impl DeviceProbe for StaticProbe {
    fn battery_level(&self) -> Option<f32> {
        self.battery_level.map(|b| b.clamp(0.0, 1.0))
    }

    fn network_type(&self) -> Option<String> {
        self.network_type.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_probe_reports_nothing() {
        let probe = NoopProbe;
        assert_eq!(probe.battery_level(), None);
        assert_eq!(probe.network_type(), None);
    }

    #[test]
    fn test_static_probe_clamps_battery() {
        let probe = StaticProbe {
            battery_level: Some(1.4),
            network_type: Some("wifi".to_string()),
        };
        assert_eq!(probe.battery_level(), Some(1.0));
        assert_eq!(probe.network_type().as_deref(), Some("wifi"));
    }
}
