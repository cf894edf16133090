use std::time::Duration;

use forge_audit::{BatteryBelow, ComplianceAuditor};
use forge_protocol::{SessionConfig, StressConfig};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub grid_size: i64,
    /// Seconds.
    pub latency_threshold: f64,
    pub stress: StressConfig,
    /// Battery reserve enforced by the auditor when set.
    pub min_battery: Option<f64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            grid_size: 10,
            latency_threshold: 0.5,
            stress: StressConfig::calm(),
            min_battery: None,
        }
    }
}

impl EngineConfig {
    pub fn with_grid_size(mut self, grid_size: i64) -> Self {
        self.grid_size = grid_size;
        self
    }

    pub fn with_stress(mut self, stress: StressConfig) -> Self {
        self.stress = stress;
        self
    }

    pub fn with_min_battery(mut self, min_battery: f64) -> Self {
        self.min_battery = Some(min_battery);
        self
    }

    /// Built-in rules plus the battery reserve, if one is configured.
    pub fn auditor(&self) -> ComplianceAuditor {
        let auditor = ComplianceAuditor::new(self.grid_size);
        match self.min_battery {
            Some(min) if min.is_finite() => auditor.with_rule(BatteryBelow { min }),
            _ => auditor,
        }
    }

    pub fn with_latency_threshold(mut self, secs: f64) -> Self {
        self.latency_threshold = secs;
        self
    }

    pub fn latency_threshold(&self) -> Duration {
        if self.latency_threshold.is_finite() && self.latency_threshold > 0.0 {
            Duration::from_secs_f64(self.latency_threshold)
        } else {
            Duration::ZERO
        }
    }
}

impl From<&SessionConfig> for EngineConfig {
    fn from(config: &SessionConfig) -> Self {
        Self {
            grid_size: config.grid_size,
            latency_threshold: config.latency_threshold,
            stress: config.stress.clone(),
            min_battery: config.min_battery,
        }
    }
}
