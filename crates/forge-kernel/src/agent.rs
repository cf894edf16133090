use std::sync::Arc;
use std::time::Duration;

use forge_bus::MessageBus;
use forge_engine::SimulationEngine;
use forge_protocol::{AgentBrain, AgentId, HarnessError, Message};
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

/// Bus topic agents announce their progress on.
pub const STATUS_TOPIC: &str = "agent_status";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopEnd {
    MaxSteps,
    Done,
    /// Released from the pause gate by a stop, or found the session inactive.
    Cancelled,
    Error(String),
    Panicked,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoopReport {
    pub agent_id: AgentId,
    /// Actions the engine accepted.
    pub steps: u64,
    /// Actions halted by a violation or a synthetic failure.
    pub halted: u64,
    pub messages_received: u64,
    pub end: LoopEnd,
}

impl LoopReport {
    pub(crate) fn panicked(agent_id: AgentId) -> Self {
        Self {
            agent_id,
            steps: 0,
            halted: 0,
            messages_received: 0,
            end: LoopEnd::Panicked,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LoopSettings {
    pub step_interval: Duration,
    pub max_steps: Option<u64>,
    pub broadcast_every: u64,
}

/// Drives one agent: observe, decide, act, read feedback, repeat.
pub struct AgentLoop {
    agent_id: AgentId,
    brain: Box<dyn AgentBrain>,
    engine: Arc<SimulationEngine>,
    bus: Arc<MessageBus>,
    inbox: mpsc::UnboundedReceiver<Message>,
    settings: LoopSettings,
}

impl AgentLoop {
    pub fn new(
        agent_id: AgentId,
        brain: Box<dyn AgentBrain>,
        engine: Arc<SimulationEngine>,
        bus: Arc<MessageBus>,
        inbox: mpsc::UnboundedReceiver<Message>,
        settings: LoopSettings,
    ) -> Self {
        Self {
            agent_id,
            brain,
            engine,
            bus,
            inbox,
            settings,
        }
    }

    #[instrument(skip(self), fields(agent_id = %self.agent_id))]
    pub async fn run(mut self) -> LoopReport {
        let mut report = LoopReport {
            agent_id: self.agent_id.clone(),
            steps: 0,
            halted: 0,
            messages_received: 0,
            end: LoopEnd::MaxSteps,
        };
        report.end = self.drive(&mut report).await;
        info!(
            steps = report.steps,
            halted = report.halted,
            end = ?report.end,
            "agent loop finished"
        );
        report
    }

    async fn drive(&mut self, report: &mut LoopReport) -> LoopEnd {
        let mut attempts = 0u64;
        loop {
            if self.settings.max_steps.is_some_and(|max| attempts >= max) {
                return LoopEnd::MaxSteps;
            }
            while self.inbox.try_recv().is_ok() {
                report.messages_received += 1;
            }

            let observation = match self.engine.get_state(&self.agent_id).await {
                Ok(state) => state,
                Err(error) => return end_for(error),
            };
            let action = self.brain.choose_action(&observation);
            attempts += 1;

            let accepted = match self.engine.perform_action(&self.agent_id, &action).await {
                Ok(accepted) => accepted,
                Err(error) => return end_for(error),
            };

            if !accepted {
                report.halted += 1;
                if !self.engine.phase().is_active() {
                    return LoopEnd::Cancelled;
                }
            } else {
                report.steps += 1;
                let feedback = match self.engine.get_feedback(&self.agent_id).await {
                    Ok(feedback) => feedback,
                    Err(error) => return end_for(error),
                };
                if feedback.done {
                    return LoopEnd::Done;
                }
                if self.settings.broadcast_every > 0
                    && report.steps % self.settings.broadcast_every == 0
                {
                    announce(&self.bus, &self.agent_id, observation.battery, report.steps).await;
                }
            }

            if self.settings.step_interval.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(self.settings.step_interval).await;
            }
        }
    }
}

/// Publish a status update. Borrows only `Sync` parts of the loop, so the
/// loop future stays `Send` with a `Send`-only brain.
async fn announce(bus: &MessageBus, agent_id: &AgentId, battery: f64, steps: u64) {
    let payload = json!({ "steps": steps, "battery": battery });
    match bus.publish(STATUS_TOPIC, payload, agent_id).await {
        Ok(report) => debug!(delivered = report.delivered, dropped = report.dropped, "status broadcast"),
        Err(error) => warn!(%error, "status broadcast failed"),
    }
}

fn end_for(error: HarnessError) -> LoopEnd {
    if error.is_cancellation() {
        LoopEnd::Cancelled
    } else {
        warn!(%error, "agent loop aborted");
        LoopEnd::Error(error.to_string())
    }
}
