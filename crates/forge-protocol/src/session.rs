//! Session lifecycle types and the session configuration accepted by
//! `Runner::setup`.

use serde::{Deserialize, Serialize};

use crate::ids::{AgentId, SessionId};
use crate::stress::StressConfig;

/// Lifecycle phase of a session and its engine.
///
/// `Idle` is an engine that exists but has never been started; the outer
/// status surface reports it as [`SessionPhase::Stopped`] alongside
/// `NotCreated` for ids that were never set up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionPhase {
    #[default]
    NotCreated,
    Idle,
    Running,
    Paused,
    Stopped,
    Failed,
}

impl SessionPhase {
    /// Running or paused: agent tasks are alive.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }

    /// Phase as reported to status queries.
    pub fn external(self) -> Self {
        match self {
            Self::Idle => Self::Stopped,
            other => other,
        }
    }
}

/// Queryable session status. `error` is set only while `phase` is FAILED.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub session_id: Option<SessionId>,
    pub phase: SessionPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub agent_ids: Vec<AgentId>,
}

impl SessionStatus {
    pub fn not_created(session_id: SessionId) -> Self {
        Self {
            session_id: Some(session_id),
            ..Self::default()
        }
    }
}

/// Session setup parameters. Every field has a default so the outer API can
/// pass a partial JSON document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub num_agents: usize,
    pub grid_size: i64,
    pub stress: StressConfig,
    /// Step duration (seconds) above which a violation is attributed to
    /// injected latency.
    pub latency_threshold: f64,
    /// Pause between an agent's steps, in seconds.
    pub step_interval: f64,
    /// Stop an agent's loop after this many actions.
    pub max_steps_per_agent: Option<u64>,
    /// Broadcast a status message on the bus every N steps (0 disables).
    pub broadcast_every: u64,
    /// Battery drained per step by the reference warehouse.
    pub battery_drain: f64,
    /// Clamp moves at the grid walls instead of letting agents leave it.
    pub safety_rails: bool,
    /// Flag agents whose battery drops under this reserve.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_battery: Option<f64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            num_agents: 2,
            grid_size: 10,
            stress: StressConfig::calm(),
            latency_threshold: 0.5,
            step_interval: 0.01,
            max_steps_per_agent: None,
            broadcast_every: 0,
            battery_drain: 0.2,
            safety_rails: true,
            min_battery: None,
        }
    }
}

impl SessionConfig {
    pub fn with_agents(mut self, num_agents: usize) -> Self {
        self.num_agents = num_agents;
        self
    }

    pub fn with_grid_size(mut self, grid_size: i64) -> Self {
        self.grid_size = grid_size;
        self
    }

    pub fn with_stress(mut self, stress: StressConfig) -> Self {
        self.stress = stress;
        self
    }

    pub fn with_max_steps(mut self, steps: u64) -> Self {
        self.max_steps_per_agent = Some(steps);
        self
    }

    pub fn with_step_interval(mut self, secs: f64) -> Self {
        self.step_interval = secs;
        self
    }

    pub fn with_broadcast_every(mut self, steps: u64) -> Self {
        self.broadcast_every = steps;
        self
    }

    pub fn with_safety_rails(mut self, enabled: bool) -> Self {
        self.safety_rails = enabled;
        self
    }

    pub fn with_latency_threshold(mut self, secs: f64) -> Self {
        self.latency_threshold = secs;
        self
    }

    pub fn with_min_battery(mut self, min_battery: f64) -> Self {
        self.min_battery = Some(min_battery);
        self
    }

    pub fn agent_ids(&self) -> Vec<AgentId> {
        (0..self.num_agents).map(AgentId::indexed).collect()
    }
}
