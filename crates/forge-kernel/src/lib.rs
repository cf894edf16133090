pub mod agent;
pub mod brain;
pub mod runner;
pub mod scenario;
pub mod table;
pub mod warehouse;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use forge_protocol::{AgentId, AgentState, SessionConfig, SessionId, SessionStatus, StressConfig};
use forge_stream::Observer;
use tracing::instrument;

pub use agent::{AgentLoop, LoopEnd, LoopReport, LoopSettings, STATUS_TOPIC};
pub use brain::LogisticsBrain;
pub use runner::Runner;
pub use scenario::{BrainFactory, EnvFactory, Scenario};
pub use table::{JUSTICE_LOG_FILE, SessionTable};
pub use warehouse::{Warehouse, WarehouseConfig};

#[derive(Debug, Clone, Default)]
pub struct HarnessBuilder {
    justice_root: Option<PathBuf>,
    scenario: Scenario,
    default_config: SessionConfig,
}

impl HarnessBuilder {
    /// Sessions keep their Justice Logs in memory until `justice_root` is set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Persist each session's Justice Log under `<root>/<session_id>/`.
    pub fn justice_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.justice_root = Some(root.into());
        self
    }

    pub fn scenario(mut self, scenario: Scenario) -> Self {
        self.scenario = scenario;
        self
    }

    pub fn default_config(mut self, config: SessionConfig) -> Self {
        self.default_config = config;
        self
    }

    pub fn build(self) -> AgentForge {
        AgentForge {
            sessions: Arc::new(SessionTable::new(
                self.justice_root,
                self.scenario,
                self.default_config,
            )),
        }
    }
}

/// Session-keyed control surface over the runners.
#[derive(Debug, Clone)]
pub struct AgentForge {
    sessions: Arc<SessionTable>,
}

impl AgentForge {
    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub async fn runner(&self, session_id: &SessionId) -> Result<Arc<Runner>> {
        self.sessions.runner(session_id).await
    }

    /// Set up (when `config` is given) and start a session.
    #[instrument(skip(self, config))]
    pub async fn start_session(
        &self,
        session_id: &SessionId,
        config: Option<SessionConfig>,
    ) -> Result<SessionStatus> {
        let runner = self.sessions.runner(session_id).await?;
        if let Some(config) = config {
            runner.setup(config).await?;
        }
        runner.start().await?;
        Ok(runner.status())
    }

    pub async fn pause_session(&self, session_id: &SessionId) -> Result<SessionStatus> {
        let runner = self.existing(session_id).await?;
        runner.pause().await?;
        Ok(runner.status())
    }

    pub async fn resume_session(&self, session_id: &SessionId) -> Result<SessionStatus> {
        let runner = self.existing(session_id).await?;
        runner.resume().await?;
        Ok(runner.status())
    }

    /// Stopping an unknown session succeeds and reports NOT_CREATED.
    #[instrument(skip(self))]
    pub async fn stop_session(&self, session_id: &SessionId) -> Result<SessionStatus> {
        match self.sessions.get(session_id).await {
            Some(runner) => {
                runner.stop().await?;
                Ok(runner.status())
            }
            None => Ok(SessionStatus::not_created(session_id.clone())),
        }
    }

    pub async fn fail_session(
        &self,
        session_id: &SessionId,
        reason: impl Into<String>,
    ) -> Result<SessionStatus> {
        let runner = self.existing(session_id).await?;
        runner.fail(reason).await?;
        Ok(runner.status())
    }

    /// Change chaos parameters of a set-up session without restarting it.
    pub async fn update_stress(
        &self,
        session_id: &SessionId,
        stress: StressConfig,
    ) -> Result<SessionStatus> {
        let runner = self.existing(session_id).await?;
        runner.update_stress(stress).await?;
        Ok(runner.status())
    }

    pub async fn status(&self, session_id: &SessionId) -> SessionStatus {
        self.sessions.status(session_id).await
    }

    pub async fn snapshot(&self, session_id: &SessionId) -> BTreeMap<AgentId, AgentState> {
        match self.sessions.get(session_id).await {
            Some(runner) => runner.snapshot().await,
            None => BTreeMap::new(),
        }
    }

    /// Observers may connect before the session is set up.
    pub async fn subscribe(&self, session_id: &SessionId) -> Result<Observer> {
        Ok(self.sessions.runner(session_id).await?.subscribe())
    }

    pub async fn shutdown(&self) {
        self.sessions.stop_all().await;
    }

    async fn existing(&self, session_id: &SessionId) -> Result<Arc<Runner>> {
        self.sessions
            .get(session_id)
            .await
            .ok_or_else(|| anyhow!("unknown session {session_id}"))
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use anyhow::Result;
    use forge_justice::event_type;
    use forge_protocol::{
        Action, AgentBrain, AgentId, AgentState, SessionConfig, SessionId, SessionPhase,
        StressConfig,
    };
    use tokio::time::timeout;
    use tokio_stream::StreamExt;

    use super::*;

    fn unique_test_root(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("{name}-{nanos}"))
    }

    fn bounded(agents: usize, steps: u64) -> SessionConfig {
        SessionConfig::default()
            .with_agents(agents)
            .with_grid_size(10)
            .with_max_steps(steps)
            .with_step_interval(0.0)
    }

    #[tokio::test]
    async fn bounded_run_is_clean_and_restart_keeps_the_engine() -> Result<()> {
        let forge = HarnessBuilder::new().build();
        let id = SessionId::from_string("e2e");
        let status = forge.start_session(&id, Some(bounded(2, 25))).await?;
        assert_eq!(status.phase, SessionPhase::Running);

        let runner = forge.runner(&id).await?;
        let reports = timeout(Duration::from_secs(10), runner.wait_for_agents()).await?;
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.steps == 25 && r.end == LoopEnd::MaxSteps));

        let engine = runner.engine().ok_or_else(|| anyhow!("no engine"))?;
        assert!(engine.violations().await.is_empty());
        assert!(engine.monitor().history().is_empty());
        assert_eq!(engine.current_seq(), 50);
        assert_eq!(runner.justice().count_of(event_type::STEP).await, 50);
        assert_ne!(forge.status(&id).await.phase, SessionPhase::Failed);

        let stopped = forge.stop_session(&id).await?;
        assert_eq!(stopped.phase, SessionPhase::Stopped);

        forge.start_session(&id, None).await?;
        let restarted = runner.engine().ok_or_else(|| anyhow!("no engine"))?;
        assert!(Arc::ptr_eq(&engine, &restarted));
        timeout(Duration::from_secs(10), runner.wait_for_agents()).await?;
        assert_eq!(restarted.current_seq(), 101);
        assert!(runner.justice().verify_integrity().await?.valid);
        forge.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn observer_sees_strictly_increasing_frames() -> Result<()> {
        let forge = HarnessBuilder::new().build();
        let id = SessionId::from_string("observed");
        let mut stream = forge.subscribe(&id).await?.into_stream();
        forge.start_session(&id, Some(bounded(3, 20))).await?;

        let collect = async {
            let mut seen = Vec::new();
            while let Some(frame) = stream.next().await {
                seen.push(frame.seq_id);
                if frame.seq_id >= 60 {
                    break;
                }
            }
            seen
        };
        let seen = timeout(Duration::from_secs(10), collect).await?;
        assert!(seen.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(seen.last(), Some(&60));
        forge.stop_session(&id).await?;
        Ok(())
    }

    #[tokio::test]
    async fn unknown_sessions_report_not_created() -> Result<()> {
        let forge = HarnessBuilder::new().build();
        let id = SessionId::from_string("ghost");
        assert_eq!(forge.status(&id).await.phase, SessionPhase::NotCreated);
        let stopped = forge.stop_session(&id).await?;
        assert_eq!(stopped.phase, SessionPhase::NotCreated);
        assert!(forge.pause_session(&id).await.is_err());
        assert!(forge.snapshot(&id).await.is_empty());

        let runner = forge.runner(&id).await?;
        runner.stop().await?;
        assert_eq!(runner.status().phase, SessionPhase::NotCreated);
        Ok(())
    }

    #[tokio::test]
    async fn pause_freezes_progress_until_resumed() -> Result<()> {
        let forge = HarnessBuilder::new().build();
        let id = SessionId::from_string("paused");
        let config = SessionConfig::default()
            .with_agents(2)
            .with_step_interval(0.002);
        forge.start_session(&id, Some(config)).await?;
        let runner = forge.runner(&id).await?;
        let engine = runner.engine().ok_or_else(|| anyhow!("no engine"))?;

        tokio::time::sleep(Duration::from_millis(50)).await;
        let status = forge.pause_session(&id).await?;
        assert_eq!(status.phase, SessionPhase::Paused);
        tokio::time::sleep(Duration::from_millis(30)).await;
        let frozen = engine.current_seq();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(engine.current_seq(), frozen);
        assert_eq!(forge.snapshot(&id).await.len(), 2);

        forge.resume_session(&id).await?;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(engine.current_seq() > frozen);

        let stopped = timeout(Duration::from_secs(2), forge.stop_session(&id)).await??;
        assert_eq!(stopped.phase, SessionPhase::Stopped);
        Ok(())
    }

    #[tokio::test]
    async fn stop_releases_agents_blocked_on_pause() -> Result<()> {
        let forge = HarnessBuilder::new().build();
        let id = SessionId::from_string("blocked");
        forge
            .start_session(&id, Some(SessionConfig::default().with_step_interval(0.001)))
            .await?;
        tokio::time::sleep(Duration::from_millis(20)).await;
        forge.pause_session(&id).await?;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let stopped = timeout(Duration::from_secs(2), forge.stop_session(&id)).await??;
        assert_eq!(stopped.phase, SessionPhase::Stopped);
        Ok(())
    }

    #[tokio::test]
    async fn failure_survives_stop_and_clears_on_start() -> Result<()> {
        let forge = HarnessBuilder::new().build();
        let id = SessionId::from_string("failing");
        forge.start_session(&id, Some(bounded(1, 1_000))).await?;

        let failed = forge.fail_session(&id, "external monitor tripped").await?;
        assert_eq!(failed.phase, SessionPhase::Failed);
        assert_eq!(failed.error.as_deref(), Some("external monitor tripped"));

        let after_stop = forge.stop_session(&id).await?;
        assert_eq!(after_stop.phase, SessionPhase::Failed);

        let restarted = forge.start_session(&id, None).await?;
        assert_eq!(restarted.phase, SessionPhase::Running);
        assert!(restarted.error.is_none());
        forge.stop_session(&id).await?;
        Ok(())
    }

    #[tokio::test]
    async fn start_without_setup_uses_the_default_config() -> Result<()> {
        let forge = HarnessBuilder::new()
            .default_config(bounded(3, 5))
            .build();
        let id = SessionId::from_string("defaults");
        let status = forge.start_session(&id, None).await?;
        assert_eq!(status.agent_ids.len(), 3);

        let runner = forge.runner(&id).await?;
        let reports = timeout(Duration::from_secs(5), runner.wait_for_agents()).await?;
        assert_eq!(reports.len(), 3);
        Ok(())
    }

    struct Westward;

    impl AgentBrain for Westward {
        fn choose_action(&mut self, _observation: &AgentState) -> Action {
            Action::left()
        }
    }

    #[tokio::test]
    async fn leaving_the_grid_is_halted_and_escalated() -> Result<()> {
        let brain: BrainFactory =
            Arc::new(|_: &AgentId, _: &SessionConfig| -> Box<dyn AgentBrain> { Box::new(Westward) });
        let scenario = Scenario::warehouse().with_brain(brain);
        let forge = HarnessBuilder::new().scenario(scenario).build();
        let id = SessionId::from_string("westward");
        let config = bounded(1, 12).with_safety_rails(false);
        forge.start_session(&id, Some(config)).await?;

        let runner = forge.runner(&id).await?;
        let reports = timeout(Duration::from_secs(5), runner.wait_for_agents()).await?;
        assert!(reports[0].halted > 0);

        let engine = runner.engine().ok_or_else(|| anyhow!("no engine"))?;
        assert!(!engine.violations().await.is_empty());
        assert!(!engine.monitor().history().is_empty());
        assert_eq!(forge.status(&id).await.phase, SessionPhase::Running);
        Ok(())
    }

    struct Faulty;

    impl AgentBrain for Faulty {
        fn choose_action(&mut self, _observation: &AgentState) -> Action {
            panic!("brain fault");
        }
    }

    #[tokio::test]
    async fn a_panicking_agent_does_not_stop_its_peers() -> Result<()> {
        let brain: BrainFactory = Arc::new(
            |agent_id: &AgentId, config: &SessionConfig| -> Box<dyn AgentBrain> {
                if agent_id.as_str() == "Agent-0" {
                    Box::new(Faulty)
                } else {
                    Box::new(LogisticsBrain::new(config.grid_size))
                }
            },
        );
        let scenario = Scenario::warehouse().with_brain(brain);
        let forge = HarnessBuilder::new().scenario(scenario).build();
        let id = SessionId::from_string("panicky");
        forge.start_session(&id, Some(bounded(2, 10))).await?;

        let runner = forge.runner(&id).await?;
        let reports = timeout(Duration::from_secs(5), runner.wait_for_agents()).await?;
        let ends: Vec<_> = reports.iter().map(|r| (r.agent_id.as_str(), r.end.clone())).collect();
        assert!(ends.contains(&("Agent-0", LoopEnd::Panicked)));
        assert!(ends.contains(&("Agent-1", LoopEnd::MaxSteps)));
        assert_eq!(forge.status(&id).await.phase, SessionPhase::Running);
        Ok(())
    }

    #[tokio::test]
    async fn status_broadcasts_travel_over_the_bus() -> Result<()> {
        let forge = HarnessBuilder::new().build();
        let id = SessionId::from_string("chatty");
        forge
            .start_session(&id, Some(bounded(2, 10).with_broadcast_every(2)))
            .await?;

        let runner = forge.runner(&id).await?;
        timeout(Duration::from_secs(5), runner.wait_for_agents()).await?;
        let stats = runner.bus().stats();
        assert_eq!(stats.published, 10);
        assert_eq!(stats.targets, 20);
        // A peer that already finished has closed its inbox.
        assert_eq!(stats.delivered + stats.handler_errors, 20);
        assert_eq!(
            runner.justice().count_of(event_type::MESSAGE_RECEIVED).await as u64,
            stats.delivered
        );
        Ok(())
    }

    #[tokio::test]
    async fn restarts_do_not_leave_stale_status_subscribers() -> Result<()> {
        let forge = HarnessBuilder::new().build();
        let id = SessionId::from_string("chatty-restart");
        forge
            .start_session(&id, Some(bounded(2, 10).with_broadcast_every(2)))
            .await?;
        let runner = forge.runner(&id).await?;
        timeout(Duration::from_secs(5), runner.wait_for_agents()).await?;
        assert_eq!(runner.bus().subscriber_count(STATUS_TOPIC), 2);

        forge.stop_session(&id).await?;
        forge.start_session(&id, None).await?;
        timeout(Duration::from_secs(5), runner.wait_for_agents()).await?;
        assert_eq!(runner.bus().subscriber_count(STATUS_TOPIC), 2);

        let stats = runner.bus().stats();
        assert_eq!(stats.published, 20);
        assert_eq!(stats.targets, 40);
        assert_eq!(stats.dropped, 0);
        assert_eq!(stats.delivered + stats.handler_errors, 40);

        forge.stop_session(&id).await?;
        assert_eq!(runner.bus().subscriber_count(STATUS_TOPIC), 0);
        Ok(())
    }

    #[tokio::test]
    async fn starting_from_failed_replaces_the_old_subscribers() -> Result<()> {
        let forge = HarnessBuilder::new().build();
        let id = SessionId::from_string("failed-restart");
        forge
            .start_session(&id, Some(bounded(2, 10).with_broadcast_every(2)))
            .await?;
        let runner = forge.runner(&id).await?;
        timeout(Duration::from_secs(5), runner.wait_for_agents()).await?;
        let engine = runner.engine().ok_or_else(|| anyhow!("no engine"))?;
        engine.fail("environment crashed").await;

        forge.start_session(&id, None).await?;
        assert_eq!(runner.bus().subscriber_count(STATUS_TOPIC), 2);
        timeout(Duration::from_secs(5), runner.wait_for_agents()).await?;
        assert_eq!(runner.bus().stats().targets, 40);
        forge.stop_session(&id).await?;
        Ok(())
    }

    #[tokio::test]
    async fn a_network_partition_cuts_status_broadcasts() -> Result<()> {
        let forge = HarnessBuilder::new().build();
        let id = SessionId::from_string("partitioned");
        assert!(forge.update_stress(&id, StressConfig::calm()).await.is_err());

        forge
            .start_session(&id, Some(bounded(2, 6).with_broadcast_every(1)))
            .await?;
        let runner = forge.runner(&id).await?;
        timeout(Duration::from_secs(5), runner.wait_for_agents()).await?;
        let before = runner.bus().stats();
        assert_eq!(before.dropped, 0);

        forge
            .update_stress(&id, StressConfig::calm().with_network_partition(true))
            .await?;
        assert_eq!(runner.bus().drop_rate(), 1.0);
        assert_eq!(runner.justice().count_of(event_type::STRESS_UPDATED).await, 1);
        let config = runner.config().ok_or_else(|| anyhow!("no config"))?;
        assert!(config.stress.network_partition);

        forge.stop_session(&id).await?;
        forge.start_session(&id, None).await?;
        timeout(Duration::from_secs(5), runner.wait_for_agents()).await?;
        let after = runner.bus().stats();
        assert_eq!(after.published - before.published, 12);
        assert_eq!(after.dropped, 24);
        assert_eq!(after.delivered, before.delivered);
        forge.stop_session(&id).await?;
        Ok(())
    }

    #[tokio::test]
    async fn file_backed_sessions_persist_a_verifiable_chain() -> Result<()> {
        let root = unique_test_root("forge-kernel-justice");
        let id = SessionId::from_string("persisted/run 1");
        let forge = HarnessBuilder::new().justice_root(&root).build();
        forge.start_session(&id, Some(bounded(1, 10))).await?;

        let runner = forge.runner(&id).await?;
        timeout(Duration::from_secs(5), runner.wait_for_agents()).await?;
        forge.stop_session(&id).await?;

        let path = forge
            .sessions()
            .justice_log_path(&id)
            .ok_or_else(|| anyhow!("no log path"))?;
        assert_eq!(path, root.join("persisted_run_1").join(JUSTICE_LOG_FILE));
        assert!(runner.justice().verify_integrity().await?.valid);
        let manifest = runner.justice().seal(None).await?;
        assert_eq!(manifest.total_entries as usize, runner.justice().len().await);

        let reopened = HarnessBuilder::new().justice_root(&root).build();
        let runner = reopened.runner(&id).await?;
        assert_eq!(runner.justice().len().await as u64, manifest.total_entries);
        assert!(runner.justice().verify_against_manifest(&manifest).await?.valid);

        tokio::fs::remove_dir_all(&root).await?;
        Ok(())
    }
}
