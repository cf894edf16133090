//! Canonical ID types for the harness.
//!
//! IDs are opaque String wrappers (serde-transparent). Sessions are keyed by
//! caller-chosen strings so an outer API can restart a logical session by id;
//! agents default to the `Agent-{index}` naming the runner assigns.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! typed_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn from_string(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

typed_id!(
    /// Identifier for a logical session. One engine is bound per session id.
    SessionId
);
typed_id!(
    /// Identifier for an agent inside a session.
    AgentId
);
typed_id!(
    /// Correlates a published message with every delivery it produced.
    TraceId
);

impl AgentId {
    /// The runner's naming for the `index`-th agent of a session.
    pub fn indexed(index: usize) -> Self {
        Self(format!("Agent-{index}"))
    }
}

impl TraceId {
    /// Fresh random (v4) trace id for one publish.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

/// Strictly monotonic per-session frame counter.
pub type SeqId = u64;
