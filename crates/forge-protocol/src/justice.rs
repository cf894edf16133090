//! Justice Log record types.
//!
//! Each entry's `entry_hash` is a SHA-256 digest over
//! `(prev_hash, sequence_index, timestamp, event_type, agent_id, payload)`;
//! the first entry links to [`GENESIS_HASH`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::AgentId;

/// Fixed predecessor hash of the first entry in every chain.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// One append-only, hash-chained audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JusticeLogEntry {
    pub sequence_index: u64,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
    pub payload: Value,
    pub prev_hash: String,
    pub entry_hash: String,
}

/// Result of recomputing a chain from genesis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub valid: bool,
    pub total_entries: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at_index: Option<u64>,
    pub message: String,
}

impl IntegrityReport {
    pub fn intact(total_entries: u64) -> Self {
        Self {
            valid: true,
            total_entries,
            failed_at_index: None,
            message: if total_entries == 0 {
                "empty chain".to_owned()
            } else {
                "all entries verified; chain is intact".to_owned()
            },
        }
    }

    pub fn broken(total_entries: u64, index: u64, message: impl Into<String>) -> Self {
        Self {
            valid: false,
            total_entries,
            failed_at_index: Some(index),
            message: message.into(),
        }
    }
}

/// Snapshot proof of the chain tail, meant to be stored out-of-band.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealManifest {
    pub total_entries: u64,
    pub chain_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<String>,
    pub sealed_at: DateTime<Utc>,
}
