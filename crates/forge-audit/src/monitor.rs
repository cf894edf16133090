use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::Utc;
use forge_protocol::{AgentId, EvidenceAnchor, ObservedViolation, RiskEvent, RiskLevel};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Summary of one `record` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordOutcome {
    pub agent_id: AgentId,
    pub previous_level: RiskLevel,
    pub level: RiskLevel,
    pub score: f64,
    pub events: usize,
    pub latency_correlated: usize,
}

impl RecordOutcome {
    pub fn escalated(&self) -> bool {
        self.level > self.previous_level
    }
}

#[derive(Debug, Default)]
struct Ledger {
    scores: HashMap<AgentId, f64>,
    history: Vec<RiskEvent>,
}

/// Per-agent cumulative risk. Scores only grow until [`RiskMonitor::reset`].
#[derive(Debug)]
pub struct RiskMonitor {
    latency_threshold: Mutex<Duration>,
    ledger: Mutex<Ledger>,
}

impl RiskMonitor {
    pub fn new(latency_threshold: Duration) -> Self {
        Self {
            latency_threshold: Mutex::new(latency_threshold),
            ledger: Mutex::new(Ledger::default()),
        }
    }

    pub fn latency_threshold(&self) -> Duration {
        *self.latency_threshold.lock()
    }

    pub fn set_latency_threshold(&self, threshold: Duration) {
        *self.latency_threshold.lock() = threshold;
    }

    pub fn record(&self, agent_id: &AgentId, violations: &[ObservedViolation]) -> RecordOutcome {
        let threshold = self.latency_threshold();
        let mut ledger = self.ledger.lock();
        let previous_score = ledger.scores.get(agent_id).copied().unwrap_or(0.0);
        let previous_level = RiskLevel::from_score(previous_score);

        let mut score = previous_score;
        let mut latency_correlated = 0;
        for observed in violations {
            let impact = observed.violation.rule_id.impact();
            score += impact;

            let is_latency_correlated = observed.step_duration > threshold;
            if is_latency_correlated {
                latency_correlated += 1;
            }
            let event = RiskEvent {
                timestamp: Utc::now(),
                agent_id: agent_id.clone(),
                violation: observed.violation.clone(),
                impact,
                step_duration: observed.step_duration.as_secs_f64(),
                is_latency_correlated,
                evidence_anchors: vec![
                    EvidenceAnchor::seconds("STEP_DURATION", observed.step_duration),
                    EvidenceAnchor::seconds("INJECTED_DELAY", observed.injected_delay),
                ],
                cumulative_score: score,
                causal_chain: causal_chain(observed, threshold, is_latency_correlated),
            };
            ledger.history.push(event);
        }
        if !violations.is_empty() {
            ledger.scores.insert(agent_id.clone(), score);
        }
        drop(ledger);

        let level = RiskLevel::from_score(score);
        if level > previous_level {
            warn!(
                agent_id = %agent_id,
                score,
                from = ?previous_level,
                to = ?level,
                "risk level escalated"
            );
        } else if !violations.is_empty() {
            info!(agent_id = %agent_id, score, level = ?level, "risk score increased");
        }

        RecordOutcome {
            agent_id: agent_id.clone(),
            previous_level,
            level,
            score,
            events: violations.len(),
            latency_correlated,
        }
    }

    pub fn level(&self, agent_id: &AgentId) -> RiskLevel {
        RiskLevel::from_score(self.score(agent_id))
    }

    pub fn score(&self, agent_id: &AgentId) -> f64 {
        self.ledger
            .lock()
            .scores
            .get(agent_id)
            .copied()
            .unwrap_or(0.0)
    }

    pub fn scores(&self) -> BTreeMap<AgentId, f64> {
        self.ledger
            .lock()
            .scores
            .iter()
            .map(|(agent, score)| (agent.clone(), *score))
            .collect()
    }

    pub fn history(&self) -> Vec<RiskEvent> {
        self.ledger.lock().history.clone()
    }

    pub fn history_for(&self, agent_id: &AgentId) -> Vec<RiskEvent> {
        self.ledger
            .lock()
            .history
            .iter()
            .filter(|event| &event.agent_id == agent_id)
            .cloned()
            .collect()
    }

    pub fn reset(&self) {
        let mut ledger = self.ledger.lock();
        ledger.scores.clear();
        ledger.history.clear();
    }
}

fn causal_chain(observed: &ObservedViolation, threshold: Duration, correlated: bool) -> Vec<String> {
    let step = observed.step_duration.as_secs_f64();
    let injected = observed.injected_delay.as_secs_f64();
    let rule = &observed.violation.rule_id;

    let mut chain = vec![format!(
        "step took {step:.3}s including {injected:.3}s of injected delay"
    )];
    if correlated {
        chain.push(format!(
            "step exceeded the {:.3}s latency threshold; agent acted on stale state",
            threshold.as_secs_f64()
        ));
        chain.push(format!("stale decision led to {rule}"));
    } else {
        chain.push(format!("step within latency threshold; {rule} attributed to agent behavior"));
    }
    chain
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_protocol::{RuleId, Violation};
    use serde_json::Map;

    fn observed(rule: RuleId, step_ms: u64, injected_ms: u64) -> ObservedViolation {
        ObservedViolation {
            violation: Violation {
                agent_id: AgentId::indexed(0),
                rule_id: rule,
                message: "test".to_owned(),
                context: Map::new(),
            },
            step_duration: Duration::from_millis(step_ms),
            injected_delay: Duration::from_millis(injected_ms),
        }
    }

    #[test]
    fn scores_accumulate_and_levels_follow() {
        let monitor = RiskMonitor::new(Duration::from_millis(500));
        let agent = AgentId::indexed(0);
        assert_eq!(monitor.level(&agent), RiskLevel::Low);

        let outcome = monitor.record(&agent, &[observed(RuleId::BoundaryOutOfBounds, 1, 0)]);
        assert_eq!(outcome.score, 20.0);
        assert_eq!(outcome.level, RiskLevel::Medium);
        assert!(outcome.escalated());

        monitor.record(&agent, &[observed(RuleId::PhysicsBatteryNegative, 1, 0)]);
        assert_eq!(monitor.score(&agent), 80.0);
        assert_eq!(monitor.level(&agent), RiskLevel::High);

        let outcome = monitor.record(&agent, &[observed(RuleId::BoundaryOutOfBounds, 1, 0)]);
        assert_eq!(monitor.level(&agent), RiskLevel::Critical);
        assert_eq!(outcome.previous_level, RiskLevel::High);
    }

    #[test]
    fn empty_record_changes_nothing() {
        let monitor = RiskMonitor::new(Duration::from_millis(500));
        let agent = AgentId::indexed(3);
        let outcome = monitor.record(&agent, &[]);
        assert!(!outcome.escalated());
        assert!(monitor.history().is_empty());
        assert!(monitor.scores().is_empty());
    }

    #[test]
    fn slow_steps_are_latency_correlated() {
        let monitor = RiskMonitor::new(Duration::from_millis(500));
        let agent = AgentId::indexed(0);
        let outcome = monitor.record(
            &agent,
            &[
                observed(RuleId::BoundaryOutOfBounds, 800, 700),
                observed(RuleId::BoundaryOutOfBounds, 100, 0),
            ],
        );
        assert_eq!(outcome.latency_correlated, 1);

        let history = monitor.history_for(&agent);
        assert!(history[0].is_latency_correlated);
        assert!(history[0].causal_chain.iter().any(|note| note.contains("stale state")));
        assert!(!history[1].is_latency_correlated);
        assert_eq!(history[1].cumulative_score, 40.0);

        let anchors: Vec<_> = history[0]
            .evidence_anchors
            .iter()
            .map(|anchor| anchor.signal_type.as_str())
            .collect();
        assert_eq!(anchors, ["STEP_DURATION", "INJECTED_DELAY"]);
        assert_eq!(history[0].evidence_anchors[1].measured_value, 0.7);
    }

    #[test]
    fn duration_equal_to_threshold_is_not_correlated() {
        let monitor = RiskMonitor::new(Duration::from_millis(500));
        monitor.record(
            &AgentId::indexed(0),
            &[observed(RuleId::BoundaryOutOfBounds, 500, 500)],
        );
        assert!(!monitor.history()[0].is_latency_correlated);
    }

    #[test]
    fn reset_clears_scores_and_history() {
        let monitor = RiskMonitor::new(Duration::from_millis(500));
        let agent = AgentId::indexed(0);
        monitor.record(&agent, &[observed(RuleId::PhysicsBatteryNegative, 1, 0)]);
        monitor.reset();
        assert_eq!(monitor.score(&agent), 0.0);
        assert!(monitor.history().is_empty());
    }
}
