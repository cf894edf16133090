use forge_protocol::{AgentId, AgentState, RuleId, Violation};
use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use tracing::warn;

/// One independent safety invariant over an agent snapshot.
pub trait ComplianceRule: Send + Sync {
    fn rule_id(&self) -> RuleId;

    /// `Some` when `state` breaks the invariant.
    fn check(&self, agent_id: &AgentId, state: &AgentState) -> Option<Violation>;
}

/// Battery must be `>= 0.0`. Exactly zero is a depleted agent, not a broken one.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatteryNonNegative;

impl ComplianceRule for BatteryNonNegative {
    fn rule_id(&self) -> RuleId {
        RuleId::PhysicsBatteryNegative
    }

    fn check(&self, agent_id: &AgentId, state: &AgentState) -> Option<Violation> {
        if state.battery >= 0.0 || state.battery.is_nan() {
            return None;
        }
        Some(Violation {
            agent_id: agent_id.clone(),
            rule_id: self.rule_id(),
            message: format!("battery level negative: {}", state.battery),
            context: context([("battery", json!(state.battery))]),
        })
    }
}

/// Position must satisfy `0 <= x < grid_size` and `0 <= y < grid_size`.
/// Either axis out of range yields a single violation.
#[derive(Debug, Clone, Copy)]
pub struct WithinGrid {
    pub grid_size: i64,
}

impl ComplianceRule for WithinGrid {
    fn rule_id(&self) -> RuleId {
        RuleId::BoundaryOutOfBounds
    }

    fn check(&self, agent_id: &AgentId, state: &AgentState) -> Option<Violation> {
        if state.position.within(self.grid_size) {
            return None;
        }
        let position = state.position;
        Some(Violation {
            agent_id: agent_id.clone(),
            rule_id: self.rule_id(),
            message: format!(
                "position ({}, {}) is out of grid bounds (0-{})",
                position.x,
                position.y,
                self.grid_size - 1
            ),
            context: context([
                ("position", json!([position.x, position.y])),
                ("grid_size", json!(self.grid_size)),
            ]),
        })
    }
}

/// Battery must stay at or above a reserve of `min`. Optional; the default
/// auditor does not carry it.
#[derive(Debug, Clone, Copy)]
pub struct BatteryBelow {
    pub min: f64,
}

impl ComplianceRule for BatteryBelow {
    fn rule_id(&self) -> RuleId {
        RuleId::BatteryCritical
    }

    fn check(&self, agent_id: &AgentId, state: &AgentState) -> Option<Violation> {
        if state.battery >= self.min || state.battery.is_nan() {
            return None;
        }
        Some(Violation {
            agent_id: agent_id.clone(),
            rule_id: self.rule_id(),
            message: format!("battery {:.1} below reserve {:.1}", state.battery, self.min),
            context: context([
                ("battery", json!(state.battery)),
                ("min_battery", json!(self.min)),
            ]),
        })
    }
}

fn context<const N: usize>(pairs: [(&str, Value); N]) -> Map<String, Value> {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_owned(), value))
        .collect()
}

pub struct ComplianceAuditor {
    grid_size: i64,
    rules: Vec<Box<dyn ComplianceRule>>,
    history: Mutex<Vec<Violation>>,
}

impl std::fmt::Debug for ComplianceAuditor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComplianceAuditor")
            .field("grid_size", &self.grid_size)
            .field("rules", &self.rule_ids())
            .finish()
    }
}

impl ComplianceAuditor {
    /// Auditor with the built-in battery and boundary rules.
    pub fn new(grid_size: i64) -> Self {
        Self::without_rules(grid_size)
            .with_rule(BatteryNonNegative)
            .with_rule(WithinGrid { grid_size })
    }

    pub fn without_rules(grid_size: i64) -> Self {
        Self {
            grid_size,
            rules: Vec::new(),
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn with_rule(mut self, rule: impl ComplianceRule + 'static) -> Self {
        self.rules.push(Box::new(rule));
        self
    }

    pub fn grid_size(&self) -> i64 {
        self.grid_size
    }

    pub fn rule_ids(&self) -> Vec<RuleId> {
        self.rules.iter().map(|rule| rule.rule_id()).collect()
    }

    /// Evaluate every rule against `state`; no rule short-circuits another.
    pub fn audit(&self, agent_id: &AgentId, state: &AgentState) -> Vec<Violation> {
        let found: Vec<Violation> = self
            .rules
            .iter()
            .filter_map(|rule| rule.check(agent_id, state))
            .collect();

        if !found.is_empty() {
            for violation in &found {
                warn!(
                    agent_id = %violation.agent_id,
                    rule = %violation.rule_id,
                    message = %violation.message,
                    "compliance violation"
                );
            }
            self.history.lock().extend(found.iter().cloned());
        }
        found
    }

    pub fn history(&self) -> Vec<Violation> {
        self.history.lock().clone()
    }

    pub fn violation_count(&self) -> usize {
        self.history.lock().len()
    }

    /// Clears accumulated history. The rule set is untouched.
    pub fn reset(&self) {
        self.history.lock().clear();
    }
}
