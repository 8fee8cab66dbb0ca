//! Phase derivation: (log history, observable facts) → current phase.
//!
//! `determine_phase` is a pure function. It never trusts cached state: the
//! phase is recomputed on every invocation from the completed records of the
//! current lineage plus what is observable right now (branch shape, release
//! tag, approval status). Interrupted `pending` records are ignored, so a
//! killed process retries its phase from the start.

use crate::pipeline::facts::{BranchKind, Facts};
use crate::pipeline::{
    BACKMERGE_PHASE, COMPLETE_PHASE, FIRST_PHASE, PIPELINE, PhaseDef, RELEASE_PHASE,
    phase_by_index, phase_by_name,
};
use crate::synclog::{SyncStatus, TransitionRecord};

/// What the orchestrator should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Invoke the handler for this phase.
    Start { phase: usize },
    /// The newest attempt at this phase failed; invoke its handler again.
    Retry { phase: usize, detail: String },
    /// A manual gate after `after` is unmet; wait for the listed approvals.
    Paused { after: usize, waiting: Vec<String> },
    /// The pipeline is finished for this lineage.
    Complete,
}

/// Result of a phase derivation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseDecision {
    pub phase_index: usize,
    pub action: Action,
}

impl PhaseDecision {
    fn start(phase: usize) -> Self {
        Self {
            phase_index: phase,
            action: Action::Start { phase },
        }
    }

    /// The phase definition this decision points at.
    pub fn phase(&self) -> &'static PhaseDef {
        phase_by_index(self.phase_index).unwrap_or(&PIPELINE[FIRST_PHASE])
    }

    /// Human-readable recommended action, also used by `status`.
    pub fn describe(&self) -> String {
        match &self.action {
            Action::Start { phase } => {
                format!("start {}", phase_name(*phase))
            }
            Action::Retry { phase, detail } if detail.is_empty() => {
                format!("retry {}", phase_name(*phase))
            }
            Action::Retry { phase, detail } => {
                format!("retry {}: {detail}", phase_name(*phase))
            }
            Action::Paused { after, waiting } => format!(
                "paused after {}, waiting for: {}",
                phase_name(*after),
                waiting.join(", ")
            ),
            Action::Complete => "pipeline complete".to_string(),
        }
    }
}

fn phase_name(index: usize) -> &'static str {
    phase_by_index(index).map(|p| p.name).unwrap_or("unknown")
}

/// Whether the newest record overall belongs to a different lineage than the
/// observed branch. Informational; the derivation resolves it by itself.
pub fn is_stale_lineage(records: &[TransitionRecord], facts: &Facts) -> bool {
    records
        .first()
        .map(|r| r.source_ref.as_deref() != Some(facts.branch.as_str()))
        .unwrap_or(false)
}

/// Review references attached to the newest completed attempt of each gated
/// phase in the given lineage. These are the references whose approval
/// status must be observed before derivation.
pub fn gate_references(records: &[TransitionRecord], branch: &str) -> Vec<String> {
    let mut references = Vec::new();
    for def in PIPELINE.iter().filter(|p| p.has_manual_gate) {
        let newest_completed = records.iter().find(|r| {
            r.source_ref.as_deref() == Some(branch)
                && r.status == SyncStatus::Completed
                && r.phase == def.name
        });
        if let Some(record) = newest_completed {
            for reference in record.artifacts() {
                if !references.contains(&reference) {
                    references.push(reference);
                }
            }
        }
    }
    references
}

/// Derive the current phase and recommended action.
///
/// `records` must be ordered newest-first, as returned by
/// [`crate::synclog::SyncLog::latest_for`].
pub fn determine_phase(records: &[TransitionRecord], facts: &Facts) -> PhaseDecision {
    let lineage: Vec<&TransitionRecord> = records
        .iter()
        .filter(|r| r.source_ref.as_deref() == Some(facts.branch.as_str()))
        .collect();

    // Newest attempt failed: never advance past a failure.
    if let Some(newest) = lineage.first() {
        if newest.status == SyncStatus::Failed {
            let phase = phase_by_name(&newest.phase)
                .map(|p| p.index)
                .unwrap_or(FIRST_PHASE);
            return PhaseDecision {
                phase_index: phase,
                action: Action::Retry {
                    phase,
                    detail: newest.error_detail().unwrap_or_default().to_string(),
                },
            };
        }
    }

    let highest_completed = lineage
        .iter()
        .filter(|r| r.status == SyncStatus::Completed)
        .filter_map(|r| phase_by_name(&r.phase))
        .map(|p| p.index)
        .max();

    let Some(highest) = highest_completed else {
        // No history for this lineage: derive purely from branch shape plus
        // artifact existence, ignoring records from other lineages.
        return match facts.branch_kind {
            BranchKind::Release if facts.release_tagged => PhaseDecision::start(BACKMERGE_PHASE),
            BranchKind::Release => PhaseDecision::start(RELEASE_PHASE),
            _ => PhaseDecision::start(FIRST_PHASE),
        };
    };

    let done = &PIPELINE[highest];
    if done.has_manual_gate {
        // Gate refs are the artifacts of the newest completed attempt.
        let waiting: Vec<String> = lineage
            .iter()
            .find(|r| r.status == SyncStatus::Completed && r.phase == done.name)
            .map(|r| r.artifacts())
            .unwrap_or_default()
            .into_iter()
            .filter(|reference| !facts.is_approved(reference))
            .collect();
        if !waiting.is_empty() {
            return PhaseDecision {
                phase_index: highest,
                action: Action::Paused {
                    after: highest,
                    waiting,
                },
            };
        }
    }

    let next = highest + 1;
    if next >= COMPLETE_PHASE {
        PhaseDecision {
            phase_index: COMPLETE_PHASE,
            action: Action::Complete,
        }
    } else {
        PhaseDecision::start(next)
    }
}
