//! Compliance violations, risk levels, and risk events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;

use crate::ids::AgentId;

/// Identifier of a compliance rule.
///
/// Built-in rules are closed variants with explicit impact weights; rules
/// registered by callers travel as [`RuleId::Other`] and are weighted by the
/// category keywords their identifier contains.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RuleId {
    PhysicsBatteryNegative,
    BoundaryOutOfBounds,
    /// Battery under a configured reserve.
    BatteryCritical,
    Other(String),
}

impl RuleId {
    pub fn as_str(&self) -> &str {
        match self {
            Self::PhysicsBatteryNegative => "PHYSICS_BATTERY_NEGATIVE",
            Self::BoundaryOutOfBounds => "BOUNDARY_OUT_OF_BOUNDS",
            Self::BatteryCritical => "BATTERY_CRITICAL",
            Self::Other(name) => name,
        }
    }

    /// Risk impact of one violation of this rule.
    pub fn impact(&self) -> f64 {
        match self {
            Self::PhysicsBatteryNegative => 60.0,
            Self::BoundaryOutOfBounds => 20.0,
            Self::BatteryCritical => 50.0,
            Self::Other(name) => keyword_impact(name),
        }
    }
}

/// Category weighting for free-form rule identifiers. The first matching
/// keyword wins, in this order: NEGATIVE, LOW, DEGRADED, BATTERY|SOLVENCY,
/// BOUNDARY, otherwise the default weight.
pub fn keyword_impact(rule: &str) -> f64 {
    if rule.contains("NEGATIVE") {
        60.0
    } else if rule.contains("LOW") {
        30.0
    } else if rule.contains("DEGRADED") {
        10.0
    } else if rule.contains("BATTERY") || rule.contains("SOLVENCY") {
        50.0
    } else if rule.contains("BOUNDARY") {
        20.0
    } else {
        10.0
    }
}

impl From<String> for RuleId {
    fn from(value: String) -> Self {
        match value.as_str() {
            "PHYSICS_BATTERY_NEGATIVE" => Self::PhysicsBatteryNegative,
            "BOUNDARY_OUT_OF_BOUNDS" => Self::BoundaryOutOfBounds,
            "BATTERY_CRITICAL" => Self::BatteryCritical,
            _ => Self::Other(value),
        }
    }
}

impl From<&str> for RuleId {
    fn from(value: &str) -> Self {
        Self::from(value.to_owned())
    }
}

impl From<RuleId> for String {
    fn from(value: RuleId) -> Self {
        value.as_str().to_owned()
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single invariant breach found by the auditor. Never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub agent_id: AgentId,
    pub rule_id: RuleId,
    pub message: String,
    #[serde(default)]
    pub context: Map<String, Value>,
}

/// A violation together with the timing of the step that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedViolation {
    pub violation: Violation,
    /// Wall-clock duration of the step, injected delay included.
    pub step_duration: Duration,
    /// Latency the fault injector added before the step ran.
    pub injected_delay: Duration,
}

/// Ordered risk classification, a pure function of the cumulative score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn from_score(score: f64) -> Self {
        if score >= 100.0 {
            Self::Critical
        } else if score >= 50.0 {
            Self::High
        } else if score >= 20.0 {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

/// A measured signal backing a risk attribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceAnchor {
    pub signal_type: String,
    pub measured_value: f64,
    pub unit: String,
}

impl EvidenceAnchor {
    pub fn seconds(signal_type: impl Into<String>, value: Duration) -> Self {
        Self {
            signal_type: signal_type.into(),
            measured_value: value.as_secs_f64(),
            unit: "seconds".to_owned(),
        }
    }
}

/// One entry of the risk monitor's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskEvent {
    pub timestamp: DateTime<Utc>,
    pub agent_id: AgentId,
    pub violation: Violation,
    pub impact: f64,
    /// Step duration in seconds.
    pub step_duration: f64,
    pub is_latency_correlated: bool,
    #[serde(default)]
    pub evidence_anchors: Vec<EvidenceAnchor>,
    pub cumulative_score: f64,
    #[serde(default)]
    pub causal_chain: Vec<String>,
}
