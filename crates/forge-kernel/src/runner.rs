use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use forge_bus::{ChannelHandler, MessageBus, SubscriptionId};
use forge_chaos::FaultInjector;
use forge_engine::{EngineConfig, SimulationEngine};
use forge_justice::JusticeLog;
use forge_protocol::{
    AgentId, AgentState, SessionConfig, SessionId, SessionPhase, SessionStatus, StressConfig,
};
use forge_stream::{Broadcaster, Observer};
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::agent::{AgentLoop, LoopReport, LoopSettings, STATUS_TOPIC};
use crate::scenario::Scenario;

struct AgentTask {
    agent_id: AgentId,
    handle: JoinHandle<LoopReport>,
}

impl From<&SessionConfig> for LoopSettings {
    fn from(config: &SessionConfig) -> Self {
        let step_interval = if config.step_interval.is_finite() && config.step_interval > 0.0 {
            Duration::from_secs_f64(config.step_interval)
        } else {
            Duration::ZERO
        };
        Self {
            step_interval,
            max_steps: config.max_steps_per_agent,
            broadcast_every: config.broadcast_every,
        }
    }
}

/// Owns one session: its engine, agent tasks, bus and live feed.
///
/// The engine is created on first setup and reused for the life of the
/// runner, so a stop followed by a start keeps the same engine instance,
/// Justice Log chain and `seq_id` counter. Lifecycle operations are
/// serialized on the agent task list.
pub struct Runner {
    session_id: SessionId,
    scenario: Scenario,
    default_config: SessionConfig,
    justice: Arc<JusticeLog>,
    injector: Arc<FaultInjector>,
    broadcaster: Arc<Broadcaster>,
    bus: Arc<MessageBus>,
    engine: Mutex<Option<Arc<SimulationEngine>>>,
    config: Mutex<Option<SessionConfig>>,
    /// Status-topic subscriptions of the current (or last) agent set.
    subscriptions: Mutex<Vec<SubscriptionId>>,
    agents: tokio::sync::Mutex<Vec<AgentTask>>,
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("session_id", &self.session_id)
            .field("engine", &self.engine())
            .finish_non_exhaustive()
    }
}

impl Runner {
    pub fn new(
        session_id: SessionId,
        justice: Arc<JusticeLog>,
        scenario: Scenario,
        default_config: SessionConfig,
    ) -> Self {
        let injector = Arc::new(FaultInjector::for_stress(&default_config.stress));
        let bus = Arc::new(MessageBus::new(
            injector.clone(),
            justice.clone(),
            default_config.stress.effective_drop_rate(),
        ));
        Self {
            session_id,
            scenario,
            default_config,
            justice,
            injector,
            broadcaster: Arc::new(Broadcaster::new()),
            bus,
            engine: Mutex::new(None),
            config: Mutex::new(None),
            subscriptions: Mutex::new(Vec::new()),
            agents: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// The session's engine. Stable across stop and start once created.
    pub fn engine(&self) -> Option<Arc<SimulationEngine>> {
        self.engine.lock().clone()
    }

    pub fn config(&self) -> Option<SessionConfig> {
        self.config.lock().clone()
    }

    pub fn justice(&self) -> &Arc<JusticeLog> {
        &self.justice
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    /// Live feed of engine frames emitted from now on.
    pub fn subscribe(&self) -> Observer {
        self.broadcaster.subscribe()
    }

    /// Install a fresh environment. An active session is stopped first.
    #[instrument(skip(self, config), fields(session_id = %self.session_id, agents = config.num_agents))]
    pub async fn setup(&self, config: SessionConfig) -> Result<()> {
        let mut tasks = self.agents.lock().await;
        self.configure(&mut tasks, config).await?;
        Ok(())
    }

    /// Start the agent loops. Sets up the default configuration when the
    /// session was never configured; a no-op while already active.
    #[instrument(skip(self), fields(session_id = %self.session_id))]
    pub async fn start(&self) -> Result<()> {
        let mut tasks = self.agents.lock().await;
        let engine = match (self.engine(), self.config()) {
            (Some(engine), Some(_)) => engine,
            _ => self.configure(&mut tasks, self.default_config.clone()).await?,
        };

        let phase = engine.phase();
        if phase.is_active() {
            debug!(?phase, "session already active");
            return Ok(());
        }
        Self::reap(&mut tasks).await;
        if phase != SessionPhase::Idle {
            engine.reset().await.context("failed to reset environment")?;
        }
        engine.start().await?;

        let config = self.config().unwrap_or_else(|| self.default_config.clone());
        let settings = LoopSettings::from(&config);
        self.release_subscriptions();
        let inboxes: Vec<_> = engine
            .agent_ids()
            .await
            .into_iter()
            .map(|agent_id| {
                let (handler, inbox) = ChannelHandler::new();
                let subscription =
                    self.bus
                        .subscribe(STATUS_TOPIC, agent_id.clone(), Arc::new(handler));
                self.subscriptions.lock().push(subscription);
                (agent_id, inbox)
            })
            .collect();
        for (agent_id, inbox) in inboxes {
            let brain = (self.scenario.brain)(&agent_id, &config);
            let agent = AgentLoop::new(
                agent_id.clone(),
                brain,
                engine.clone(),
                self.bus.clone(),
                inbox,
                settings,
            );
            let handle = tokio::spawn(supervise(agent_id.clone(), agent));
            tasks.push(AgentTask { agent_id, handle });
        }
        info!(agents = tasks.len(), "session started");
        Ok(())
    }

    pub async fn pause(&self) -> Result<()> {
        let _tasks = self.agents.lock().await;
        self.require_engine()?.pause().await?;
        Ok(())
    }

    pub async fn resume(&self) -> Result<()> {
        let _tasks = self.agents.lock().await;
        self.require_engine()?.resume().await?;
        Ok(())
    }

    /// Stop the session and cancel its agent tasks. A session that was
    /// never started stops trivially; FAILED is kept.
    #[instrument(skip(self), fields(session_id = %self.session_id))]
    pub async fn stop(&self) -> Result<()> {
        let mut tasks = self.agents.lock().await;
        self.stop_locked(&mut tasks).await
    }

    /// Mark the session FAILED with `reason` and cancel its agent tasks.
    #[instrument(skip(self, reason), fields(session_id = %self.session_id))]
    pub async fn fail(&self, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        let mut tasks = self.agents.lock().await;
        let engine = self.require_engine()?;
        error!(reason = %reason, "session failed");
        engine.fail(reason).await;
        self.stop_locked(&mut tasks).await
    }

    /// Swap the session's stress configuration while it runs. The engine
    /// applies it from the next action and the bus from the next delivery.
    #[instrument(skip(self, stress), fields(session_id = %self.session_id))]
    pub async fn update_stress(&self, stress: StressConfig) -> Result<StressConfig> {
        let _tasks = self.agents.lock().await;
        let engine = self.require_engine()?;
        let stress = engine.set_stress(stress).await?;
        self.bus.set_drop_rate(stress.effective_drop_rate());
        if let Some(config) = self.config.lock().as_mut() {
            config.stress = stress.clone();
        }
        Ok(stress)
    }

    pub fn status(&self) -> SessionStatus {
        let Some(engine) = self.engine() else {
            return SessionStatus::not_created(self.session_id.clone());
        };
        SessionStatus {
            session_id: Some(self.session_id.clone()),
            phase: engine.phase().external(),
            error: engine.error(),
            agent_ids: self
                .config()
                .map(|config| config.agent_ids())
                .unwrap_or_default(),
        }
    }

    /// Deep copy of every agent's state. Never blocks on the pause gate.
    pub async fn snapshot(&self) -> BTreeMap<AgentId, AgentState> {
        match self.engine() {
            Some(engine) => engine.snapshot().await,
            None => BTreeMap::new(),
        }
    }

    /// Wait for the current agent loops to finish on their own and collect
    /// their reports. The session stays in its current phase.
    pub async fn wait_for_agents(&self) -> Vec<LoopReport> {
        let tasks = std::mem::take(&mut *self.agents.lock().await);
        let mut reports = Vec::with_capacity(tasks.len());
        for task in tasks {
            if let Some(report) = join(task).await {
                reports.push(report);
            }
        }
        reports
    }

    async fn configure(
        &self,
        tasks: &mut Vec<AgentTask>,
        config: SessionConfig,
    ) -> Result<Arc<SimulationEngine>> {
        if self.engine().is_some_and(|engine| engine.phase().is_active()) {
            self.stop_locked(tasks).await?;
        }

        let engine = self
            .engine
            .lock()
            .get_or_insert_with(|| {
                Arc::new(SimulationEngine::new(
                    self.session_id.clone(),
                    EngineConfig::from(&config),
                    self.injector.clone(),
                    self.justice.clone(),
                    self.broadcaster.clone(),
                ))
            })
            .clone();

        let env = (self.scenario.environment)(&config);
        engine
            .install(env, config.agent_ids(), EngineConfig::from(&config))
            .await
            .context("failed to install environment")?;
        self.bus.set_drop_rate(config.stress.effective_drop_rate());
        info!(grid_size = config.grid_size, "session configured");
        *self.config.lock() = Some(config);
        Ok(engine)
    }

    async fn stop_locked(&self, tasks: &mut Vec<AgentTask>) -> Result<()> {
        let stopped = match self.engine() {
            Some(engine) => engine.stop().await.map_err(anyhow::Error::from),
            None => Ok(()),
        };
        self.release_subscriptions();
        for task in tasks.iter() {
            task.handle.abort();
        }
        Self::reap(tasks).await;
        stopped
    }

    /// Unsubscribe the inboxes of the previous agent set, including those of
    /// loops that already finished and were collected by `wait_for_agents`.
    fn release_subscriptions(&self) {
        let released: Vec<_> = self.subscriptions.lock().drain(..).collect();
        let removed = released
            .into_iter()
            .filter(|id| self.bus.unsubscribe(*id))
            .count();
        if removed > 0 {
            debug!(removed, "status subscriptions released");
        }
    }

    async fn reap(tasks: &mut Vec<AgentTask>) {
        for task in tasks.drain(..) {
            join(task).await;
        }
    }

    fn require_engine(&self) -> Result<Arc<SimulationEngine>> {
        self.engine()
            .ok_or_else(|| anyhow!("session {} has not been set up", self.session_id))
    }
}

async fn supervise(agent_id: AgentId, agent: AgentLoop) -> LoopReport {
    match AssertUnwindSafe(agent.run()).catch_unwind().await {
        Ok(report) => report,
        Err(_) => {
            error!(agent_id = %agent_id, "agent task panicked");
            LoopReport::panicked(agent_id)
        }
    }
}

async fn join(task: AgentTask) -> Option<LoopReport> {
    match task.handle.await {
        Ok(report) => Some(report),
        Err(error) if error.is_cancelled() => {
            debug!(agent_id = %task.agent_id, "agent task cancelled");
            None
        }
        Err(error) => {
            warn!(agent_id = %task.agent_id, %error, "agent task ended abnormally");
            None
        }
    }
}
