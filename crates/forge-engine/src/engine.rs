use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::Utc;
use forge_audit::{ComplianceAuditor, RiskMonitor};
use forge_chaos::FaultInjector;
use forge_justice::{JusticeLog, event_type};
use forge_protocol::{
    Action, AgentId, AgentState, Environment, FaultDecision, Feedback, FrameKind, HarnessError,
    HarnessResult, ObservedViolation, SeqId, SessionId, SessionPhase, StreamFrame, StressConfig,
    Violation,
};
use forge_stream::{Broadcaster, Observer};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tracing::{debug, error, info, instrument, warn};

use crate::config::EngineConfig;
use crate::gate::{Gate, PauseGate};

struct World {
    env: Option<Box<dyn Environment>>,
    agents: Vec<AgentId>,
    feedback: HashMap<AgentId, Feedback>,
    done: HashSet<AgentId>,
    auditor: ComplianceAuditor,
}

#[derive(Debug, Clone, Default)]
struct Lifecycle {
    phase: SessionPhase,
    error: Option<String>,
}

/// Steps one session's environment on behalf of its agents.
///
/// Every mutating operation (`perform_action`, lifecycle transitions) runs
/// under the world lock, so Justice Log entries and frames are produced in
/// the exact order the operations complete. `seq_id` is shared by all frame
/// kinds and never resets for the lifetime of the engine.
pub struct SimulationEngine {
    session_id: SessionId,
    world: tokio::sync::Mutex<World>,
    lifecycle: Mutex<Lifecycle>,
    gate: PauseGate,
    seq: AtomicU64,
    stress: Mutex<StressConfig>,
    injector: Arc<FaultInjector>,
    monitor: Arc<RiskMonitor>,
    justice: Arc<JusticeLog>,
    broadcaster: Arc<Broadcaster>,
}

impl std::fmt::Debug for SimulationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulationEngine")
            .field("session_id", &self.session_id)
            .field("phase", &self.phase())
            .field("seq_id", &self.current_seq())
            .finish()
    }
}

impl SimulationEngine {
    pub fn new(
        session_id: SessionId,
        config: EngineConfig,
        injector: Arc<FaultInjector>,
        justice: Arc<JusticeLog>,
        broadcaster: Arc<Broadcaster>,
    ) -> Self {
        let stress = config.stress.clone().validated();
        Self {
            session_id,
            world: tokio::sync::Mutex::new(World {
                env: None,
                agents: Vec::new(),
                feedback: HashMap::new(),
                done: HashSet::new(),
                auditor: ComplianceAuditor::new(config.grid_size),
            }),
            lifecycle: Mutex::new(Lifecycle {
                phase: SessionPhase::Idle,
                error: None,
            }),
            gate: PauseGate::new(),
            seq: AtomicU64::new(0),
            stress: Mutex::new(stress),
            injector,
            monitor: Arc::new(RiskMonitor::new(config.latency_threshold())),
            justice,
            broadcaster,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn phase(&self) -> SessionPhase {
        self.lifecycle.lock().phase
    }

    pub fn error(&self) -> Option<String> {
        self.lifecycle.lock().error.clone()
    }

    /// Last emitted `seq_id` (0 before the first frame).
    pub fn current_seq(&self) -> SeqId {
        self.seq.load(Ordering::SeqCst)
    }

    pub fn stress(&self) -> StressConfig {
        self.stress.lock().clone()
    }

    pub fn monitor(&self) -> &Arc<RiskMonitor> {
        &self.monitor
    }

    pub fn justice(&self) -> &Arc<JusticeLog> {
        &self.justice
    }

    pub fn injector(&self) -> &Arc<FaultInjector> {
        &self.injector
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    pub fn subscribe(&self) -> Observer {
        self.broadcaster.subscribe()
    }

    pub async fn agent_ids(&self) -> Vec<AgentId> {
        self.world.lock().await.agents.clone()
    }

    /// Accumulated auditor history across every step.
    pub async fn violations(&self) -> Vec<Violation> {
        self.world.lock().await.auditor.history()
    }

    /// Bind an environment and agent roster, then reset the world.
    ///
    /// Allowed only while no session is active. Risk history, the Justice
    /// Log chain and the `seq_id` counter carry over.
    #[instrument(skip(self, env, config), fields(session_id = %self.session_id, agents = agents.len()))]
    pub async fn install(
        &self,
        env: Box<dyn Environment>,
        agents: Vec<AgentId>,
        config: EngineConfig,
    ) -> HarnessResult<BTreeMap<AgentId, AgentState>> {
        let mut world = self.world.lock().await;
        let phase = self.phase();
        if phase.is_active() {
            return Err(HarnessError::InvalidTransition {
                from: phase,
                to: SessionPhase::Idle,
            });
        }

        let stress = config.stress.clone().validated();
        if let Some(seed) = stress.seed {
            self.injector.reseed(seed);
            self.journal(event_type::SEEDED, None, json!({ "seed": seed }))
                .await?;
        } else {
            self.injector.reset_profile();
        }
        self.monitor.set_latency_threshold(config.latency_threshold());
        *self.stress.lock() = stress.clone();

        let environment = env.name().to_owned();
        world.env = Some(env);
        world.agents = agents;
        world.auditor = config.auditor();
        let initial = Self::reset_world(&mut world)?;

        self.journal(
            event_type::SESSION_CONFIGURED,
            None,
            json!({
                "session_id": self.session_id,
                "environment": environment,
                "agents": world.agents,
                "grid_size": config.grid_size,
                "latency_threshold": config.latency_threshold,
                "stress": stress,
            }),
        )
        .await?;
        info!(environment = %environment, "engine configured");
        Ok(initial)
    }

    /// Replace the stress configuration at runtime. Takes effect from the
    /// next action and returns the validated configuration now in force.
    #[instrument(skip(self, stress), fields(session_id = %self.session_id))]
    pub async fn set_stress(&self, stress: StressConfig) -> HarnessResult<StressConfig> {
        let _world = self.world.lock().await;
        let stress = stress.validated();
        let previous = std::mem::replace(&mut *self.stress.lock(), stress.clone());
        match stress.seed {
            Some(seed) if previous.seed != Some(seed) => self.injector.reseed(seed),
            _ if previous.profile != stress.profile => self.injector.reset_profile(),
            _ => {}
        }
        self.journal(
            event_type::STRESS_UPDATED,
            None,
            json!({ "session_id": self.session_id, "previous": previous, "stress": stress }),
        )
        .await?;
        info!(
            profile = stress.profile.name(),
            latency_rate = stress.latency_rate,
            network_partition = stress.network_partition,
            "stress updated"
        );
        Ok(stress)
    }

    /// Re-initialize the environment and return every agent's initial
    /// observation.
    pub async fn reset(&self) -> HarnessResult<BTreeMap<AgentId, AgentState>> {
        let mut world = self.world.lock().await;
        Self::reset_world(&mut world)
    }

    fn reset_world(world: &mut World) -> HarnessResult<BTreeMap<AgentId, AgentState>> {
        let agents = world.agents.clone();
        let env = world
            .env
            .as_mut()
            .ok_or_else(|| HarnessError::NotConfigured("no environment installed".to_owned()))?;
        let initial = env.reset(&agents);
        world.feedback.clear();
        world.done.clear();
        Ok(initial)
    }

    #[instrument(skip(self), fields(session_id = %self.session_id))]
    pub async fn start(&self) -> HarnessResult<()> {
        let world = self.world.lock().await;
        if world.env.is_none() {
            return Err(HarnessError::NotConfigured(
                "install an environment before starting".to_owned(),
            ));
        }
        let from = self.phase();
        if from.is_active() {
            return Err(HarnessError::InvalidTransition {
                from,
                to: SessionPhase::Running,
            });
        }
        self.set_phase(SessionPhase::Running, None);
        self.gate.set(Gate::Open);
        self.journal(
            event_type::SESSION_STARTED,
            None,
            json!({ "session_id": self.session_id, "from": from, "agents": world.agents }),
        )
        .await?;
        info!(from = ?from, "session running");
        Ok(())
    }

    /// Freeze the agent-facing read path. Idempotent while paused.
    #[instrument(skip(self), fields(session_id = %self.session_id))]
    pub async fn pause(&self) -> HarnessResult<()> {
        let _world = self.world.lock().await;
        match self.phase() {
            SessionPhase::Paused => Ok(()),
            SessionPhase::Running => {
                self.set_phase(SessionPhase::Paused, None);
                self.gate.set(Gate::Paused);
                self.lifecycle_event(event_type::SESSION_PAUSED, "paused", None)
                    .await?;
                info!("session paused");
                Ok(())
            }
            from => Err(HarnessError::InvalidTransition {
                from,
                to: SessionPhase::Paused,
            }),
        }
    }

    /// Release every `get_state` caller parked on the gate.
    #[instrument(skip(self), fields(session_id = %self.session_id))]
    pub async fn resume(&self) -> HarnessResult<()> {
        let _world = self.world.lock().await;
        match self.phase() {
            SessionPhase::Running => Ok(()),
            SessionPhase::Paused => {
                self.set_phase(SessionPhase::Running, None);
                self.gate.set(Gate::Open);
                self.lifecycle_event(event_type::SESSION_RESUMED, "resumed", None)
                    .await?;
                info!("session resumed");
                Ok(())
            }
            from => Err(HarnessError::InvalidTransition {
                from,
                to: SessionPhase::Running,
            }),
        }
    }

    /// Safe from any phase. Parked `get_state` callers fail with a
    /// cancellation instead of waiting forever. A failed session keeps its
    /// FAILED phase and error.
    #[instrument(skip(self), fields(session_id = %self.session_id))]
    pub async fn stop(&self) -> HarnessResult<()> {
        let _world = self.world.lock().await;
        let from = self.phase();
        self.gate.set(Gate::Closed);
        if matches!(
            from,
            SessionPhase::Stopped | SessionPhase::Idle | SessionPhase::Failed
        ) {
            debug!(from = ?from, "stop ignored, session not running");
            return Ok(());
        }
        self.set_phase(SessionPhase::Stopped, None);
        self.lifecycle_event(event_type::SESSION_STOPPED, "stopped", None)
            .await?;
        info!(from = ?from, "session stopped");
        Ok(())
    }

    /// Force the session into FAILED. Never raises; the reason becomes the
    /// queryable session error.
    pub async fn fail(&self, reason: impl Into<String>) {
        let _world = self.world.lock().await;
        self.fail_locked(reason.into()).await;
    }

    async fn fail_locked(&self, reason: String) {
        error!(session_id = %self.session_id, reason = %reason, "session failed");
        self.set_phase(SessionPhase::Failed, Some(reason.clone()));
        self.gate.set(Gate::Closed);
        if let Err(error) = self
            .lifecycle_event(event_type::SESSION_FAILED, "failed", Some(&reason))
            .await
        {
            warn!(%error, "failed to record session failure");
        }
    }

    /// Deep copy of one agent's state. Blocks while the session is paused.
    pub async fn get_state(&self, agent_id: &AgentId) -> HarnessResult<AgentState> {
        self.gate.wait_open().await?;
        let world = self.world.lock().await;
        let env = world
            .env
            .as_ref()
            .ok_or_else(|| HarnessError::NotConfigured("no environment installed".to_owned()))?;
        env.state(agent_id)
            .ok_or_else(|| HarnessError::UnknownAgent(agent_id.to_string()))
    }

    /// Privileged read of every agent's state. Ignores the pause gate.
    pub async fn snapshot(&self) -> BTreeMap<AgentId, AgentState> {
        let world = self.world.lock().await;
        let Some(env) = world.env.as_ref() else {
            return BTreeMap::new();
        };
        world
            .agents
            .iter()
            .filter_map(|agent| env.state(agent).map(|state| (agent.clone(), state)))
            .collect()
    }

    /// Apply one action through fault injection, the environment, the
    /// auditor and the risk monitor.
    ///
    /// `Ok(false)` means the action was halted (compliance violation,
    /// synthetic failure, inactive session, or an agent already done) and
    /// the agent must not proceed past it.
    #[instrument(skip(self, action), fields(session_id = %self.session_id, agent_id = %agent_id, action = %action))]
    pub async fn perform_action(&self, agent_id: &AgentId, action: &Action) -> HarnessResult<bool> {
        let started = Instant::now();
        if !self.phase().is_active() {
            return Ok(false);
        }

        let stress = self.stress();
        let decision = self.injector.inject(&stress);
        if !decision.delay.is_zero() {
            tokio::time::sleep(decision.delay).await;
        }

        let mut world = self.world.lock().await;
        if !self.phase().is_active() {
            return Ok(false);
        }
        if world.env.is_none() {
            return Err(HarnessError::NotConfigured("no environment installed".to_owned()));
        }
        if !world.agents.contains(agent_id) {
            return Err(HarnessError::UnknownAgent(agent_id.to_string()));
        }

        if decision.should_fail {
            self.record_synthetic_failure(agent_id, action, &decision).await;
            return Ok(false);
        }
        if world.done.contains(agent_id) {
            return Ok(false);
        }

        let stepped = match world.env.as_mut() {
            Some(env) => env.step(agent_id, action),
            None => Err(HarnessError::NotConfigured("no environment installed".to_owned())),
        };
        let outcome = match stepped {
            Ok(outcome) => outcome,
            Err(error) => {
                self.fail_locked(format!("environment step failed for {agent_id}: {error}"))
                    .await;
                return Ok(false);
            }
        };
        let duration = started.elapsed();

        let violations = world.auditor.audit(agent_id, &outcome.state);
        let observed: Vec<ObservedViolation> = violations
            .iter()
            .map(|violation| ObservedViolation {
                violation: violation.clone(),
                step_duration: duration,
                injected_delay: decision.delay,
            })
            .collect();
        let risk = self.monitor.record(agent_id, &observed);

        let mut info = outcome.info.clone();
        info.insert("duration".to_owned(), json!(duration.as_secs_f64()));
        info.insert("injected_delay".to_owned(), json!(decision.delay.as_secs_f64()));
        if !violations.is_empty() {
            info.insert(
                "violations".to_owned(),
                Value::Array(violations.iter().map(violation_summary).collect()),
            );
        }
        world.feedback.insert(
            agent_id.clone(),
            Feedback {
                reward: outcome.reward,
                done: outcome.done,
                info: info.clone(),
            },
        );
        if outcome.done {
            world.done.insert(agent_id.clone());
        }

        let seq_id = self.current_seq() + 1;
        let step_payload = json!({
            "seq_id": seq_id,
            "action": action,
            "state": outcome.state,
            "reward": outcome.reward,
            "done": outcome.done,
            "info": info,
            "risk_score": risk.score,
            "risk_level": risk.level,
        });
        if let Err(error) = self.justice.log(event_type::STEP, Some(agent_id), step_payload).await {
            self.fail_locked(format!("justice log write failed: {error:#}")).await;
            return Ok(false);
        }
        if risk.escalated() {
            let escalation = json!({
                "from": risk.previous_level,
                "to": risk.level,
                "score": risk.score,
                "latency_correlated": risk.latency_correlated,
            });
            if let Err(error) = self
                .justice
                .log(event_type::RISK_ESCALATED, Some(agent_id), escalation)
                .await
            {
                warn!(%error, "failed to record risk escalation");
            }
        }

        self.emit(
            FrameKind::Step,
            json!({
                "session_id": self.session_id,
                "agent_id": agent_id,
                "action": action,
                "observation": outcome.state,
                "reward": outcome.reward,
                "done": outcome.done,
                "info": info,
                "risk_level": risk.level,
                "timestamp": Utc::now(),
            }),
        );
        debug!(seq_id, violations = violations.len(), "step applied");
        Ok(violations.is_empty())
    }

    /// Reward, done and info from the agent's most recent action.
    pub async fn get_feedback(&self, agent_id: &AgentId) -> HarnessResult<Feedback> {
        let world = self.world.lock().await;
        if !world.agents.contains(agent_id) {
            return Err(HarnessError::UnknownAgent(agent_id.to_string()));
        }
        Ok(world.feedback.get(agent_id).cloned().unwrap_or_default())
    }

    async fn record_synthetic_failure(&self, agent_id: &AgentId, action: &Action, decision: &FaultDecision) {
        warn!(agent_id = %agent_id, "synthetic failure injected");
        let payload = json!({
            "action": action,
            "injected": true,
            "injected_delay": decision.delay.as_secs_f64(),
        });
        if let Err(error) = self
            .justice
            .log(event_type::SYNTHETIC_FAILURE, Some(agent_id), payload)
            .await
        {
            warn!(%error, "failed to record synthetic failure");
        }
        self.emit(
            FrameKind::Fault,
            json!({
                "session_id": self.session_id,
                "agent_id": agent_id,
                "action": action,
                "reason": "synthetic_failure",
                "injected": true,
                "timestamp": Utc::now(),
            }),
        );
    }

    async fn lifecycle_event(&self, event: &str, transition: &str, reason: Option<&str>) -> HarnessResult<()> {
        let phase = self.phase();
        self.journal(
            event,
            None,
            json!({ "session_id": self.session_id, "phase": phase, "reason": reason }),
        )
        .await?;
        self.emit(
            FrameKind::Lifecycle,
            json!({
                "session_id": self.session_id,
                "event": transition,
                "phase": phase,
                "reason": reason,
                "timestamp": Utc::now(),
            }),
        );
        Ok(())
    }

    fn emit(&self, kind: FrameKind, payload: Value) {
        let seq_id = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.broadcaster.emit(StreamFrame::new(seq_id, kind, payload));
    }

    async fn journal(&self, event: &str, agent_id: Option<&AgentId>, payload: Value) -> HarnessResult<()> {
        self.justice
            .log(event, agent_id, payload)
            .await
            .map(|_| ())
            .map_err(|error| HarnessError::Io(format!("{error:#}")))
    }

    fn set_phase(&self, phase: SessionPhase, error: Option<String>) {
        let mut lifecycle = self.lifecycle.lock();
        lifecycle.phase = phase;
        lifecycle.error = error;
    }
}

fn violation_summary(violation: &Violation) -> Value {
    json!({
        "rule": violation.rule_id,
        "msg": violation.message,
        "context": violation.context,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::{Result, anyhow};
    use forge_chaos::FaultInjector;
    use forge_justice::{JusticeLog, event_type};
    use forge_protocol::{
        Action, AgentId, AgentState, Environment, FrameKind, HarnessError, HarnessResult,
        Position, RiskLevel, SessionId, SessionPhase, StepOutcome, StressConfig,
    };
    use forge_stream::Broadcaster;
    use serde_json::Map;
    use tokio::time::timeout;

    use crate::{EngineConfig, SimulationEngine};

    /// Unbounded grid with a fixed battery drain; "EXPLODE" errors.
    struct OpenGrid {
        agents: BTreeMap<AgentId, AgentState>,
        drain: f64,
    }

    impl OpenGrid {
        fn boxed(drain: f64) -> Box<dyn Environment> {
            Box::new(Self {
                agents: BTreeMap::new(),
                drain,
            })
        }
    }

    impl Environment for OpenGrid {
        fn name(&self) -> &str {
            "open-grid"
        }

        fn reset(&mut self, agent_ids: &[AgentId]) -> BTreeMap<AgentId, AgentState> {
            self.agents = agent_ids
                .iter()
                .enumerate()
                .map(|(i, id)| (id.clone(), AgentState::new(id.clone(), Position::new(i as i64, 0), 1.0)))
                .collect();
            self.agents.clone()
        }

        fn state(&self, agent_id: &AgentId) -> Option<AgentState> {
            self.agents.get(agent_id).cloned()
        }

        fn step(&mut self, agent_id: &AgentId, action: &Action) -> HarnessResult<StepOutcome> {
            if action.as_str() == "EXPLODE" {
                return Err(HarnessError::environment("physics diverged"));
            }
            let state = self
                .agents
                .get_mut(agent_id)
                .ok_or_else(|| HarnessError::UnknownAgent(agent_id.to_string()))?;
            match action.as_str() {
                "UP" => state.position.y += 1,
                "DOWN" => state.position.y -= 1,
                "LEFT" => state.position.x -= 1,
                "RIGHT" => state.position.x += 1,
                _ => {}
            }
            state.battery -= self.drain;
            Ok(StepOutcome {
                state: state.clone(),
                reward: -0.1,
                done: false,
                info: Map::new(),
            })
        }
    }

    async fn engine_with(stress: StressConfig, drain: f64) -> Result<(Arc<SimulationEngine>, Arc<JusticeLog>)> {
        let justice = Arc::new(JusticeLog::in_memory());
        let engine = Arc::new(SimulationEngine::new(
            SessionId::from_string("engine-test"),
            EngineConfig::default(),
            Arc::new(FaultInjector::seeded(1)),
            justice.clone(),
            Arc::new(Broadcaster::new()),
        ));
        engine
            .install(
                OpenGrid::boxed(drain),
                vec![AgentId::indexed(0), AgentId::indexed(1)],
                EngineConfig::default().with_stress(stress),
            )
            .await?;
        Ok((engine, justice))
    }

    #[tokio::test]
    async fn clean_steps_return_true_and_sequence_frames() -> Result<()> {
        let (engine, justice) = engine_with(StressConfig::calm(), 0.0).await?;
        engine.start().await?;
        let mut observer = engine.subscribe();

        let agent = AgentId::indexed(0);
        assert!(engine.perform_action(&agent, &Action::up()).await?);
        let frame = timeout(Duration::from_secs(1), observer.next())
            .await?
            .ok_or_else(|| anyhow!("closed"))?;
        assert_eq!(frame.seq_id, 1);
        assert_eq!(frame.kind, FrameKind::Step);
        assert_eq!(frame.payload["observation"]["position"]["y"], 1);

        assert!(engine.perform_action(&AgentId::indexed(1), &Action::up()).await?);
        assert_eq!(engine.current_seq(), 2);
        assert_eq!(justice.count_of(event_type::STEP).await, 2);

        let feedback = engine.get_feedback(&agent).await?;
        assert_eq!(feedback.reward, -0.1);
        assert!(feedback.info.contains_key("duration"));
        Ok(())
    }

    #[tokio::test]
    async fn violation_halts_the_action_and_feeds_the_monitor() -> Result<()> {
        let (engine, _justice) = engine_with(StressConfig::calm(), 0.0).await?;
        engine.start().await?;
        let agent = AgentId::indexed(0);

        assert!(!engine.perform_action(&agent, &Action::left()).await?);
        assert_eq!(engine.monitor().score(&agent), 20.0);
        assert_eq!(engine.monitor().level(&agent), RiskLevel::Medium);
        assert_eq!(engine.violations().await.len(), 1);

        let feedback = engine.get_feedback(&agent).await?;
        assert!(feedback.info.contains_key("violations"));
        Ok(())
    }

    #[tokio::test]
    async fn escalation_is_recorded_in_the_log() -> Result<()> {
        let (engine, justice) = engine_with(StressConfig::calm(), 5.0).await?;
        engine.start().await?;
        let agent = AgentId::indexed(1);
        assert!(!engine.perform_action(&agent, &Action::stay()).await?);
        assert_eq!(engine.monitor().level(&agent), RiskLevel::High);
        assert_eq!(justice.count_of(event_type::RISK_ESCALATED).await, 1);
        Ok(())
    }

    #[tokio::test]
    async fn delayed_steps_attribute_violations_to_latency() -> Result<()> {
        let justice = Arc::new(JusticeLog::in_memory());
        let engine = SimulationEngine::new(
            SessionId::from_string("engine-latency"),
            EngineConfig::default(),
            Arc::new(FaultInjector::seeded(4)),
            justice.clone(),
            Arc::new(Broadcaster::new()),
        );
        let config = EngineConfig::default()
            .with_latency_threshold(0.01)
            .with_stress(StressConfig::calm().with_latency(1.0, 0.05, 0.05));
        engine
            .install(
                OpenGrid::boxed(0.0),
                vec![AgentId::indexed(0), AgentId::indexed(1)],
                config,
            )
            .await?;
        engine.start().await?;

        let agent = AgentId::indexed(0);
        assert!(!engine.perform_action(&agent, &Action::left()).await?);
        let history = engine.monitor().history_for(&agent);
        assert_eq!(history.len(), 1);
        let event = &history[0];
        assert!(event.is_latency_correlated);
        assert!(event.step_duration >= 0.05);
        assert!(event.causal_chain.iter().any(|link| link.contains("stale state")));
        let injected = event
            .evidence_anchors
            .iter()
            .find(|anchor| anchor.signal_type == "INJECTED_DELAY")
            .ok_or_else(|| anyhow!("no injected delay anchor"))?;
        assert!((injected.measured_value - 0.05).abs() < 1e-9);
        assert_eq!(injected.unit, "seconds");

        let feedback = engine.get_feedback(&agent).await?;
        let recorded = feedback.info["injected_delay"].as_f64();
        assert!(recorded.is_some_and(|delay| (delay - 0.05).abs() < 1e-9));
        Ok(())
    }

    #[tokio::test]
    async fn stress_updates_apply_to_the_next_action() -> Result<()> {
        let (engine, justice) = engine_with(StressConfig::calm(), 0.0).await?;
        engine.start().await?;
        let agent = AgentId::indexed(1);
        assert!(engine.perform_action(&agent, &Action::stay()).await?);

        let applied = engine
            .set_stress(StressConfig::calm().with_failure_rate(7.0).with_network_partition(true))
            .await?;
        assert_eq!(applied.failure_rate, 1.0);
        assert!(engine.stress().network_partition);
        assert_eq!(justice.count_of(event_type::STRESS_UPDATED).await, 1);
        assert!(!engine.perform_action(&agent, &Action::stay()).await?);
        assert_eq!(justice.count_of(event_type::SYNTHETIC_FAILURE).await, 1);

        engine.set_stress(StressConfig::calm()).await?;
        assert!(engine.perform_action(&agent, &Action::stay()).await?);
        Ok(())
    }

    #[tokio::test]
    async fn synthetic_failures_are_tagged_separately() -> Result<()> {
        let (engine, justice) =
            engine_with(StressConfig::calm().with_failure_rate(1.0), 0.0).await?;
        engine.start().await?;
        let mut observer = engine.subscribe();

        assert!(!engine.perform_action(&AgentId::indexed(0), &Action::up()).await?);
        let frame = timeout(Duration::from_secs(1), observer.next())
            .await?
            .ok_or_else(|| anyhow!("closed"))?;
        assert_eq!(frame.kind, FrameKind::Fault);
        assert_eq!(frame.payload["injected"], true);
        assert_eq!(justice.count_of(event_type::SYNTHETIC_FAILURE).await, 1);
        assert_eq!(justice.count_of(event_type::STEP).await, 0);
        assert!(engine.monitor().history().is_empty());
        assert_eq!(engine.phase(), SessionPhase::Running);
        Ok(())
    }

    #[tokio::test]
    async fn pause_blocks_get_state_until_resume() -> Result<()> {
        let (engine, _justice) = engine_with(StressConfig::calm(), 0.0).await?;
        engine.start().await?;
        engine.pause().await?;

        let reader = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.get_state(&AgentId::indexed(0)).await })
        };
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!reader.is_finished());

        let snapshot = engine.snapshot().await;
        assert_eq!(snapshot.len(), 2);

        engine.resume().await?;
        let state = timeout(Duration::from_secs(1), reader).await???;
        assert_eq!(state.agent_id, AgentId::indexed(0));
        Ok(())
    }

    #[tokio::test]
    async fn stop_releases_paused_readers() -> Result<()> {
        let (engine, _justice) = engine_with(StressConfig::calm(), 0.0).await?;
        engine.start().await?;
        engine.pause().await?;
        let reader = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.get_state(&AgentId::indexed(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        engine.stop().await?;

        let result = timeout(Duration::from_secs(1), reader).await??;
        assert!(result.is_err_and(|error| error.is_cancellation()));
        assert_eq!(engine.phase(), SessionPhase::Stopped);
        engine.stop().await?;
        Ok(())
    }

    #[tokio::test]
    async fn lifecycle_frames_share_the_step_counter() -> Result<()> {
        let (engine, _justice) = engine_with(StressConfig::calm(), 0.0).await?;
        engine.start().await?;
        assert_eq!(engine.current_seq(), 0);
        engine.perform_action(&AgentId::indexed(0), &Action::up()).await?;
        engine.pause().await?;
        engine.pause().await?;
        engine.resume().await?;
        engine.perform_action(&AgentId::indexed(0), &Action::up()).await?;
        assert_eq!(engine.current_seq(), 4);
        Ok(())
    }

    #[tokio::test]
    async fn environment_error_fails_the_session() -> Result<()> {
        let (engine, justice) = engine_with(StressConfig::calm(), 0.0).await?;
        engine.start().await?;
        let halted = engine
            .perform_action(&AgentId::indexed(0), &Action::new("EXPLODE"))
            .await?;
        assert!(!halted);
        assert_eq!(engine.phase(), SessionPhase::Failed);
        assert!(engine.error().is_some_and(|e| e.contains("physics diverged")));
        assert_eq!(justice.count_of(event_type::SESSION_FAILED).await, 1);
        assert!(!engine.perform_action(&AgentId::indexed(1), &Action::up()).await?);

        engine.stop().await?;
        assert_eq!(engine.phase(), SessionPhase::Failed);

        engine.start().await?;
        assert_eq!(engine.phase(), SessionPhase::Running);
        assert_eq!(engine.error(), None);
        Ok(())
    }

    #[tokio::test]
    async fn invalid_transitions_are_rejected() -> Result<()> {
        let (engine, _justice) = engine_with(StressConfig::calm(), 0.0).await?;
        assert!(matches!(
            engine.pause().await,
            Err(HarnessError::InvalidTransition { .. })
        ));
        engine.start().await?;
        assert!(engine.start().await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn unknown_agents_are_rejected() -> Result<()> {
        let (engine, _justice) = engine_with(StressConfig::calm(), 0.0).await?;
        engine.start().await?;
        let stranger = AgentId::from_string("stranger");
        assert!(matches!(
            engine.perform_action(&stranger, &Action::up()).await,
            Err(HarnessError::UnknownAgent(_))
        ));
        assert!(engine.get_state(&stranger).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn seeded_stress_is_logged() -> Result<()> {
        let (engine, justice) = engine_with(StressConfig::calm().with_seed(9), 0.0).await?;
        assert_eq!(engine.injector().seed(), Some(9));
        assert_eq!(justice.count_of(event_type::SEEDED).await, 1);
        Ok(())
    }
}
