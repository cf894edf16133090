//! Stress configuration and fault decisions.
//!
//! The stress configuration is consumed verbatim from the outer control
//! surface: `{latency_rate, latency_range: [min, max], failure_rate,
//! drop_rate, seed?}`. Latency bounds are expressed in seconds.
//!
//! Two optional knobs shape the latency further: a [`LatencyProfile`]
//! (`{"kind": "flaky_wifi", ...}`) and `network_partition`, which cuts every
//! bus delivery while set.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Parameters controlling injected latency, failures, and message loss.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StressConfig {
    /// Probability in `[0, 1]` that an action is delayed.
    #[serde(default)]
    pub latency_rate: f64,
    /// Uniform delay bounds in seconds, `[min, max]`.
    #[serde(default)]
    pub latency_range: [f64; 2],
    /// Probability in `[0, 1]` that an action fails synthetically.
    #[serde(default)]
    pub failure_rate: f64,
    /// Probability in `[0, 1]` that one message delivery is dropped.
    #[serde(default)]
    pub drop_rate: f64,
    /// Fixed seed for reproducible fault sequences.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default)]
    pub profile: LatencyProfile,
    /// Every message delivery is dropped while set.
    #[serde(default)]
    pub network_partition: bool,
}

/// Shape of injected latency over time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LatencyProfile {
    /// Independent draws against `latency_rate`.
    #[default]
    Uniform,
    /// Two-state burst model. A calm link enters a burst with probability
    /// `spike_chance` per action and leaves it with probability
    /// [`LatencyProfile::BURST_RECOVERY`]. Every action inside a burst is
    /// delayed by a `latency_range` draw times `spike_multiplier`.
    FlakyWifi {
        #[serde(default = "default_spike_chance")]
        spike_chance: f64,
        #[serde(default = "default_spike_multiplier")]
        spike_multiplier: f64,
    },
    /// Periodic blackouts. After each `interval` seconds of normal service
    /// the link goes down for `duration` seconds, and an action issued during
    /// the blackout waits until it ends.
    DataCenterOutage {
        #[serde(default = "default_outage_interval")]
        interval: f64,
        #[serde(default = "default_outage_duration")]
        duration: f64,
    },
}

fn default_spike_chance() -> f64 {
    0.05
}

fn default_spike_multiplier() -> f64 {
    10.0
}

fn default_outage_interval() -> f64 {
    30.0
}

fn default_outage_duration() -> f64 {
    5.0
}

impl LatencyProfile {
    pub const BURST_RECOVERY: f64 = 0.3;

    pub fn flaky_wifi() -> Self {
        Self::FlakyWifi {
            spike_chance: default_spike_chance(),
            spike_multiplier: default_spike_multiplier(),
        }
    }

    pub fn data_center_outage() -> Self {
        Self::DataCenterOutage {
            interval: default_outage_interval(),
            duration: default_outage_duration(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Uniform => "uniform",
            Self::FlakyWifi { .. } => "flaky_wifi",
            Self::DataCenterOutage { .. } => "data_center_outage",
        }
    }

    fn validated(self) -> Self {
        match self {
            Self::Uniform => Self::Uniform,
            Self::FlakyWifi {
                spike_chance,
                spike_multiplier,
            } => Self::FlakyWifi {
                spike_chance: if spike_chance.is_finite() {
                    spike_chance.clamp(0.0, 1.0)
                } else {
                    0.0
                },
                spike_multiplier: if spike_multiplier.is_finite() {
                    spike_multiplier.max(1.0)
                } else {
                    1.0
                },
            },
            Self::DataCenterOutage { interval, duration } => Self::DataCenterOutage {
                interval: if interval.is_finite() { interval.max(0.0) } else { 0.0 },
                duration: if duration.is_finite() { duration.max(0.0) } else { 0.0 },
            },
        }
    }
}

impl Default for StressConfig {
    fn default() -> Self {
        Self::calm()
    }
}

impl StressConfig {
    /// No latency, no failures, no drops.
    pub fn calm() -> Self {
        Self {
            latency_rate: 0.0,
            latency_range: [0.0, 0.0],
            failure_rate: 0.0,
            drop_rate: 0.0,
            seed: None,
            profile: LatencyProfile::Uniform,
            network_partition: false,
        }
    }

    pub fn with_latency(mut self, rate: f64, min_secs: f64, max_secs: f64) -> Self {
        self.latency_rate = rate;
        self.latency_range = [min_secs, max_secs];
        self
    }

    pub fn with_failure_rate(mut self, rate: f64) -> Self {
        self.failure_rate = rate;
        self
    }

    pub fn with_drop_rate(mut self, rate: f64) -> Self {
        self.drop_rate = rate;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_profile(mut self, profile: LatencyProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_network_partition(mut self, partitioned: bool) -> Self {
        self.network_partition = partitioned;
        self
    }

    /// Drop rate the message bus applies. A partition drops everything.
    pub fn effective_drop_rate(&self) -> f64 {
        if self.network_partition { 1.0 } else { self.drop_rate }
    }

    /// Clamps rates into `[0, 1]`, floors negative bounds at zero, and orders
    /// the latency range so `min <= max`. Non-finite values become zero.
    pub fn validated(mut self) -> Self {
        fn rate(value: f64) -> f64 {
            if value.is_finite() { value.clamp(0.0, 1.0) } else { 0.0 }
        }
        fn bound(value: f64) -> f64 {
            if value.is_finite() { value.max(0.0) } else { 0.0 }
        }

        self.latency_rate = rate(self.latency_rate);
        self.failure_rate = rate(self.failure_rate);
        self.drop_rate = rate(self.drop_rate);
        let [a, b] = [bound(self.latency_range[0]), bound(self.latency_range[1])];
        self.latency_range = if a <= b { [a, b] } else { [b, a] };
        self.profile = self.profile.validated();
        self
    }

    pub fn min_latency(&self) -> Duration {
        Duration::from_secs_f64(self.latency_range[0].max(0.0))
    }

    pub fn max_latency(&self) -> Duration {
        Duration::from_secs_f64(self.latency_range[1].max(0.0))
    }
}

/// Outcome of one fault-injection draw.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultDecision {
    pub delay: Duration,
    pub should_fail: bool,
}

impl FaultDecision {
    pub fn is_clean(&self) -> bool {
        self.delay.is_zero() && !self.should_fail
    }
}
