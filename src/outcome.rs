//! Final record of one run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::config::Severity;
use crate::monitor::MonitorEvent;
use crate::selector::Exclusion;

/// Executor state machine. `Committed`, `RolledBack` and `Aborted` are
/// terminal; no state is entered twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    Committed,
    RolledBack,
    Aborted,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Committed | RunState::RolledBack | RunState::Aborted)
    }
}

/// Why the run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum Termination {
    /// No compatible plan; nothing was attempted.
    NoViablePlan,
    /// Every stage committed and the objective verified.
    Verified,
    StageFailed { technique: String, reason: String },
    VerificationFailed { reason: String },
    SecurityTrigger { severity: Severity, flags: BTreeSet<String> },
    /// The safety monitor could not read the target's signals.
    MonitorUnavailable { reason: String },
    OperatorAbort { reason: String },
}

impl Termination {
    /// Risk-assessment text carried by the outcome.
    pub fn risk_assessment(&self) -> String {
        match self {
            Termination::NoViablePlan => "no risk - no compatible plan, nothing attempted".to_string(),
            Termination::Verified => "critical - objective verified, modifications persist".to_string(),
            Termination::StageFailed { technique, reason } => {
                format!("exploitation failed - {}: {}", technique, reason)
            }
            Termination::VerificationFailed { reason } => {
                format!("exploitation failed - verification: {}", reason)
            }
            Termination::SecurityTrigger { severity, flags } => {
                let flags: Vec<&str> = flags.iter().map(String::as_str).collect();
                format!("security trigger - {} [{}]", severity, flags.join(", "))
            }
            Termination::MonitorUnavailable { reason } => {
                format!("exploitation failed - safety monitor unavailable: {}", reason)
            }
            Termination::OperatorAbort { reason } => format!("operator abort - {}", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackFailure {
    pub technique: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub run_id: Uuid,
    pub target_id: String,
    pub operation: String,
    pub success: bool,
    pub state: RunState,
    pub termination: Termination,
    pub risk_assessment: String,
    /// Committed techniques, in plan order.
    pub techniques_applied: Vec<String>,
    /// Techniques whose stage was started, in plan order.
    pub techniques_attempted: Vec<String>,
    pub artifacts: Vec<String>,
    pub persistence_achieved: bool,
    pub cleanup_required: bool,
    /// Rollbacks in the order they were performed.
    pub rolled_back: Vec<String>,
    pub rollback_failures: Vec<RollbackFailure>,
    pub not_applicable: Vec<Exclusion>,
    pub observed_flags: BTreeSet<String>,
    /// Safety monitor log for this run, one entry per check.
    pub monitor_events: Vec<MonitorEvent>,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

impl Outcome {
    /// One-line narrative for logs and reports.
    pub fn narrative(&self) -> String {
        let mut parts = vec![format!(
            "{} ({}): {}",
            self.operation,
            if self.success { "success" } else { "failure" },
            self.risk_assessment
        )];
        if !self.techniques_applied.is_empty() {
            parts.push(format!("applied {}", self.techniques_applied.join(", ")));
        }
        if !self.rolled_back.is_empty() {
            parts.push(format!("rolled back {}", self.rolled_back.join(", ")));
        }
        if !self.rollback_failures.is_empty() {
            let failed: Vec<&str> = self
                .rollback_failures
                .iter()
                .map(|f| f.technique.as_str())
                .collect();
            parts.push(format!("cleanup required for {}", failed.join(", ")));
        }
        if !self.not_applicable.is_empty() {
            let skipped: Vec<&str> = self
                .not_applicable
                .iter()
                .map(|e| e.technique.as_str())
                .collect();
            parts.push(format!("not applicable {}", skipped.join(", ")));
        }
        parts.join("; ")
    }
}
