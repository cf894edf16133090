use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use forge_justice::JusticeLog;
use forge_protocol::{SessionConfig, SessionId, SessionStatus};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::runner::Runner;
use crate::scenario::Scenario;

pub const JUSTICE_LOG_FILE: &str = "justice_log.jsonl";

/// Session id to runner map. Runners are created on first use and kept for
/// the life of the table.
#[derive(Debug)]
pub struct SessionTable {
    justice_root: Option<PathBuf>,
    scenario: Scenario,
    default_config: SessionConfig,
    runners: Mutex<HashMap<SessionId, Arc<Runner>>>,
}

impl SessionTable {
    pub fn new(
        justice_root: Option<PathBuf>,
        scenario: Scenario,
        default_config: SessionConfig,
    ) -> Self {
        Self {
            justice_root,
            scenario,
            default_config,
            runners: Mutex::new(HashMap::new()),
        }
    }

    /// The runner for `session_id`, created if absent.
    pub async fn runner(&self, session_id: &SessionId) -> Result<Arc<Runner>> {
        let mut runners = self.runners.lock().await;
        if let Some(runner) = runners.get(session_id) {
            return Ok(runner.clone());
        }

        let justice = match self.justice_log_path(session_id) {
            Some(path) => JusticeLog::open(&path).await?,
            None => JusticeLog::in_memory(),
        };
        let runner = Arc::new(Runner::new(
            session_id.clone(),
            Arc::new(justice),
            self.scenario.clone(),
            self.default_config.clone(),
        ));
        debug!(session_id = %session_id, "runner created");
        runners.insert(session_id.clone(), runner.clone());
        Ok(runner)
    }

    /// Existing runner only; never creates one.
    pub async fn get(&self, session_id: &SessionId) -> Option<Arc<Runner>> {
        self.runners.lock().await.get(session_id).cloned()
    }

    pub async fn status(&self, session_id: &SessionId) -> SessionStatus {
        match self.get(session_id).await {
            Some(runner) => runner.status(),
            None => SessionStatus::not_created(session_id.clone()),
        }
    }

    pub async fn session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.runners.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Stop every session. Errors are logged and do not stop the sweep.
    pub async fn stop_all(&self) {
        let runners: Vec<_> = self.runners.lock().await.values().cloned().collect();
        for runner in runners {
            if let Err(error) = runner.stop().await {
                warn!(session_id = %runner.session_id(), %error, "failed to stop session");
            }
        }
    }

    pub fn justice_log_path(&self, session_id: &SessionId) -> Option<PathBuf> {
        let root = self.justice_root.as_ref()?;
        let dir: String = session_id
            .as_str()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        Some(root.join(dir).join(JUSTICE_LOG_FILE))
    }
}
