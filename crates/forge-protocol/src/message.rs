//! Inter-agent messages carried by the bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{AgentId, TraceId};

/// A transient pub/sub message. The bus never retains it; only the
/// `message_sent` / `message_received` Justice Log entries persist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub sender: AgentId,
    pub topic: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    pub trace_id: TraceId,
}

impl Message {
    pub fn new(sender: AgentId, topic: impl Into<String>, payload: Value) -> Self {
        Self {
            sender,
            topic: topic.into(),
            payload,
            timestamp: Utc::now(),
            trace_id: TraceId::generate(),
        }
    }
}

/// Per-publish delivery accounting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReport {
    pub trace_id: Option<TraceId>,
    pub targets: usize,
    pub delivered: usize,
    pub dropped: usize,
    pub handler_errors: usize,
}
