//! Safety invariants and risk accounting.
//!
//! [`ComplianceAuditor`] checks one agent snapshot against a set of
//! [`ComplianceRule`]s; [`RiskMonitor`] turns the resulting violations into a
//! per-agent cumulative score and [`forge_protocol::RiskLevel`].

mod auditor;
mod monitor;

pub use auditor::{BatteryBelow, BatteryNonNegative, ComplianceAuditor, ComplianceRule, WithinGrid};
pub use monitor::{RecordOutcome, RiskMonitor};
