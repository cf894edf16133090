//! Agent state snapshots, actions, and step results.
//!
//! The environment owns the live [`AgentState`]; everything handed out of the
//! engine is an owned clone, so readers (agents, loggers, test harnesses)
//! can never mutate world state through a snapshot.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::AgentId;

/// Integer grid coordinates. Signed so out-of-bounds moves stay representable
/// for the auditor to catch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    pub x: i64,
    pub y: i64,
}

impl Position {
    pub const fn new(x: i64, y: i64) -> Self {
        Self { x, y }
    }

    /// Manhattan distance, used by grid brains for greedy navigation.
    pub fn manhattan(&self, other: &Position) -> u64 {
        self.x.abs_diff(other.x) + self.y.abs_diff(other.y)
    }

    /// True when `0 <= x < size` and `0 <= y < size`.
    pub fn within(&self, size: i64) -> bool {
        (0..size).contains(&self.x) && (0..size).contains(&self.y)
    }
}

/// Read-only snapshot of one agent's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub agent_id: AgentId,
    pub position: Position,
    pub battery: f64,
    /// Environment-specific extras (e.g. what a warehouse robot carries).
    #[serde(default)]
    pub custom_fields: Map<String, Value>,
}

impl AgentState {
    pub fn new(agent_id: AgentId, position: Position, battery: f64) -> Self {
        Self {
            agent_id,
            position,
            battery,
            custom_fields: Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.custom_fields.insert(key.into(), value);
        self
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.custom_fields.get(key)
    }
}

/// An action chosen by an agent brain. Opaque to the engine; each
/// environment interprets the names it understands.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Action(String);

impl Action {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn up() -> Self {
        Self::new("UP")
    }

    pub fn down() -> Self {
        Self::new("DOWN")
    }

    pub fn left() -> Self {
        Self::new("LEFT")
    }

    pub fn right() -> Self {
        Self::new("RIGHT")
    }

    pub fn stay() -> Self {
        Self::new("STAY")
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Action {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Result of one `Environment::step`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
    pub state: AgentState,
    pub reward: f64,
    pub done: bool,
    #[serde(default)]
    pub info: Map<String, Value>,
}

/// Cached environment feedback from an agent's most recent action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    pub reward: f64,
    pub done: bool,
    #[serde(default)]
    pub info: Map<String, Value>,
}
