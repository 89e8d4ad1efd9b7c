//! Per-service configuration types: mesh discovery, pulse, saga execution.

use std::time::Duration;

use serde::Deserialize;

/// Mesh discovery configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Seconds between health sweeps. The first sweep runs immediately.
    pub sweep_interval_secs: u64,
    /// Per-probe timeout in seconds.
    pub probe_timeout_secs: u64,
}

impl MeshConfig {
    /// Sweep interval as a Duration.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Probe timeout as a Duration.
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 30,
            probe_timeout_secs: 5,
        }
    }
}

/// Pulse detection and dispatch configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PulseConfig {
    /// Maximum retained events; the oldest are evicted first.
    pub event_log_capacity: usize,
    /// Seconds between mesh snapshot diffs.
    pub watch_interval_secs: u64,
    /// Seconds between broker reconnect attempts for the dead-letter listener.
    pub reconnect_delay_secs: u64,
    /// Remediation actor that receives escalated events.
    pub remediation_agent: String,
    /// Base URL for direct dispatch when the task queue is unavailable.
    pub dispatch_url: Option<String>,
    /// Timeout for direct dispatch calls, in seconds.
    pub dispatch_timeout_secs: u64,
    /// Queue priority for escalation tasks (0-9, above ordinary work).
    pub task_priority: u8,
}

impl PulseConfig {
    /// Watch interval as a Duration.
    pub fn watch_interval(&self) -> Duration {
        Duration::from_secs(self.watch_interval_secs)
    }

    /// Reconnect delay as a Duration.
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    /// Dispatch timeout as a Duration.
    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch_timeout_secs)
    }
}

impl Default for PulseConfig {
    fn default() -> Self {
        Self {
            event_log_capacity: 200,
            watch_interval_secs: 30,
            reconnect_delay_secs: 30,
            remediation_agent: "remediation".to_string(),
            dispatch_url: None,
            dispatch_timeout_secs: 15,
            task_priority: 8,
        }
    }
}

/// Saga execution configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SagaConfig {
    /// Timeout for step action and compensation tool calls, in seconds.
    pub tool_timeout_secs: u64,
}

impl SagaConfig {
    /// Tool call timeout as a Duration.
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            tool_timeout_secs: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mesh_defaults() {
        let mesh = MeshConfig::default();
        assert_eq!(mesh.sweep_interval(), Duration::from_secs(30));
        assert_eq!(mesh.probe_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_pulse_defaults() {
        let pulse = PulseConfig::default();
        assert_eq!(pulse.event_log_capacity, 200);
        assert_eq!(pulse.reconnect_delay(), Duration::from_secs(30));
        assert_eq!(pulse.task_priority, 8);
        assert!(pulse.dispatch_url.is_none());
    }

    #[test]
    fn test_saga_defaults() {
        let saga = SagaConfig::default();
        assert_eq!(saga.tool_timeout(), Duration::from_secs(30));
    }
}
