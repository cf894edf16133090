//! Live-feed frames.
//!
//! Wire shape: `{"seq_id": int, "type": "step" | "fault" | "lifecycle",
//! "payload": {...}}`. `seq_id` is shared by every frame type of a session
//! and grows by exactly one per emitted frame.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::SeqId;

/// Frame category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    /// An environment step completed.
    Step,
    /// An action was halted by an injected synthetic failure.
    Fault,
    /// Session lifecycle transition (pause, resume, stop, fail).
    Lifecycle,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamFrame {
    pub seq_id: SeqId,
    #[serde(rename = "type")]
    pub kind: FrameKind,
    pub payload: Value,
}

impl StreamFrame {
    pub fn new(seq_id: SeqId, kind: FrameKind, payload: Value) -> Self {
        Self {
            seq_id,
            kind,
            payload,
        }
    }
}

/// Number of frames an observer missed between two consecutive deliveries.
pub fn conflated_between(previous: SeqId, next: SeqId) -> u64 {
    next.saturating_sub(previous).saturating_sub(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn frame_wire_shape() {
        let frame = StreamFrame::new(7, FrameKind::Step, json!({"agent_id": "Agent-0"}));
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["seq_id"], 7);
        assert_eq!(json["type"], "step");
        assert_eq!(json["payload"]["agent_id"], "Agent-0");
    }

    #[test]
    fn gap_detection() {
        assert_eq!(conflated_between(4, 5), 0);
        assert_eq!(conflated_between(4, 9), 4);
        assert_eq!(conflated_between(9, 9), 0);
    }
}
