//! Capability ports between the harness core and its external collaborators.
//!
//! The core never knows concrete physics or agent policy. It drives them
//! through these traits:
//! - [`Environment`]: world state and stepping (`reset`/`step`).
//! - [`AgentBrain`]: per-agent decision making (`choose_action`).
//! - [`MessageHandler`]: a bus subscriber.
//!
//! Object-safety note:
//! - `Environment` and `AgentBrain` are synchronous; the engine serializes
//!   every call through its step lock, so they only need `Send`.
//! - `MessageHandler` uses `async-trait` for async dyn-dispatch.
//! - Live frames are exposed as a boxed stream ([`FrameStream`]).

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::error::HarnessResult;
use crate::frame::StreamFrame;
use crate::ids::AgentId;
use crate::message::Message;
use crate::state::{Action, AgentState, StepOutcome};

pub type FrameStream = BoxStream<'static, StreamFrame>;

/// The world the agents act in. Owns every [`AgentState`]; callers only ever
/// receive clones.
pub trait Environment: Send {
    /// Short name recorded in the Justice Log.
    fn name(&self) -> &str {
        "environment"
    }

    /// (Re)initialize the world for `agent_ids` and return each agent's
    /// initial observation.
    fn reset(&mut self, agent_ids: &[AgentId]) -> BTreeMap<AgentId, AgentState>;

    /// Current state of one agent.
    fn state(&self, agent_id: &AgentId) -> Option<AgentState>;

    /// Apply `action` for `agent_id`. An `Err` is unrecoverable for the
    /// session and moves it to FAILED.
    fn step(&mut self, agent_id: &AgentId, action: &Action) -> HarnessResult<StepOutcome>;
}

/// Decision-making policy of a single agent.
pub trait AgentBrain: Send {
    fn choose_action(&mut self, observation: &AgentState) -> Action;
}

/// A bus subscriber. A returned error (or a panic) is isolated to this
/// handler and never affects delivery to the other subscribers.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> HarnessResult<()>;
}
