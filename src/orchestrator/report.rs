//! Execution and status reports surfaced by the orchestrator.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Outcome of one phase attempted during a run.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseReport {
    pub index: usize,
    pub name: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// The full result of one `run()` invocation.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub context_id: String,
    pub branch: String,
    /// Phases attempted during this run, in execution order.
    pub phases: Vec<PhaseReport>,
    /// True when the run stopped at an unmet manual gate.
    pub paused: bool,
    /// True when a phase handler reported failure.
    pub failed: bool,
    /// Exact external actions required to unblock a paused run.
    pub required_actions: Vec<String>,
    pub summary: String,
}

impl ExecutionReport {
    pub fn new(context_id: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            context_id: context_id.into(),
            branch: branch.into(),
            phases: Vec::new(),
            paused: false,
            failed: false,
            required_actions: Vec::new(),
            summary: String::new(),
        }
    }

    pub fn push_phase(
        &mut self,
        index: usize,
        name: &str,
        status: &str,
        detail: Option<String>,
    ) {
        self.phases.push(PhaseReport {
            index,
            name: name.to_string(),
            status: status.to_string(),
            detail,
        });
    }

    /// Count of handler invocations this run performed.
    pub fn handlers_invoked(&self) -> usize {
        self.phases.len()
    }
}

/// Machine-readable answer to the phase query (`cadence status --json`).
#[derive(Debug, Clone, Serialize)]
pub struct PhaseStatus {
    pub context_id: String,
    pub phase_index: usize,
    pub phase_name: String,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub recommended_action: String,
}
