//! # forge-protocol — Shared harness contract
//!
//! This crate defines the data model, error taxonomy, and capability ports
//! that every Agent Forge crate (engine, bus, auditor, Justice Log,
//! broadcaster, kernel) depends on.
//!
//! It is intentionally dependency-light (no tokio, no hashing, no file I/O)
//! so environments and agent brains can be written against it alone.
//!
//! ## Module Overview
//!
//! - [`ids`] — Typed ID wrappers (SessionId, AgentId, TraceId, SeqId)
//! - [`state`] — AgentState, Position, Action, StepOutcome, Feedback
//! - [`stress`] — StressConfig, LatencyProfile and FaultDecision
//! - [`compliance`] — RuleId, Violation, RiskLevel, RiskEvent, EvidenceAnchor
//! - [`message`] — Bus messages and delivery reports
//! - [`session`] — SessionPhase, SessionStatus, SessionConfig
//! - [`justice`] — JusticeLogEntry, IntegrityReport, SealManifest
//! - [`frame`] — StreamFrame and FrameKind for the live feed
//! - [`ports`] — Environment, AgentBrain, MessageHandler
//! - [`error`] — HarnessError, HarnessResult

pub mod compliance;
pub mod error;
pub mod frame;
pub mod ids;
pub mod justice;
pub mod message;
pub mod ports;
pub mod session;
pub mod state;
pub mod stress;

// Re-export the most commonly used types at the crate root.
pub use compliance::{
    EvidenceAnchor, ObservedViolation, RiskEvent, RiskLevel, RuleId, Violation, keyword_impact,
};
pub use error::{HarnessError, HarnessResult};
pub use frame::{FrameKind, StreamFrame, conflated_between};
pub use ids::{AgentId, SeqId, SessionId, TraceId};
pub use justice::{GENESIS_HASH, IntegrityReport, JusticeLogEntry, SealManifest};
pub use message::{DeliveryReport, Message};
pub use ports::{AgentBrain, Environment, FrameStream, MessageHandler};
pub use session::{SessionConfig, SessionPhase, SessionStatus};
pub use state::{Action, AgentState, Feedback, Position, StepOutcome};
pub use stress::{FaultDecision, LatencyProfile, StressConfig};
