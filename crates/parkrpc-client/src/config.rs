use std::time::Duration;

/// Failover tuning knobs for one client.
///
/// `host_id` identifies the calling host toward the session service and is
/// required: without it sessions can be neither created nor resumed.
#[derive(Debug, Clone)]
pub struct FailoverConfig {
    /// Identity of the local host, sent on session create/resume
    pub host_id: String,
    /// Period between the monitor's health-probe sweeps
    pub detection_interval: Duration,
    /// Per-node probe deadline
    pub probe_timeout: Duration,
    /// Backoff inserted before the second and later reconnection attempts
    pub recovery_timeout: Duration,
    /// Deadline for one remote call
    pub call_timeout: Duration,
    /// Retry forever instead of surfacing `ServiceUnavailable` when no
    /// primary is registered
    pub never_give_up: bool,
    /// Quarantine window as a multiple of `detection_interval`
    pub quarantine_multiplier: u32,
}

impl FailoverConfig {
    /// Defaults for the given host identity.
    pub fn for_host(host_id: impl Into<String>) -> Self {
        Self {
            host_id: host_id.into(),
            detection_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(2),
            recovery_timeout: Duration::from_secs(2),
            call_timeout: Duration::from_secs(30),
            never_give_up: false,
            quarantine_multiplier: 5,
        }
    }

    /// How long a failed node stays out of candidacy.
    pub fn quarantine_window(&self) -> Duration {
        self.detection_interval * self.quarantine_multiplier
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = FailoverConfig::for_host("client-host");
        assert_eq!(config.host_id, "client-host");
        assert_eq!(config.detection_interval, Duration::from_secs(1));
        assert_eq!(config.quarantine_multiplier, 5);
        assert!(!config.never_give_up);
    }

    #[test]
    fn test_quarantine_window_scales_with_detection_interval() {
        let mut config = FailoverConfig::for_host("client-host");
        config.detection_interval = Duration::from_millis(200);
        assert_eq!(config.quarantine_window(), Duration::from_secs(1));
    }
}
