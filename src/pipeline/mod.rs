//! Pipeline phase definitions and the phase state machine.
//!
//! This module provides:
//! - `PhaseDef` — the static definition of one delivery phase
//! - `PIPELINE` — the ordered table of all phases
//! - `facts` — observable facts gathered before each derivation
//! - `engine` — the pure `determine_phase` derivation

pub mod engine;
pub mod facts;

pub use engine::{Action, PhaseDecision, determine_phase, gate_references, is_stale_lineage};
pub use facts::{BranchKind, BranchRules, Facts};

use serde::{Deserialize, Serialize};

/// Index of the `specify` phase, where every new feature starts.
pub const FIRST_PHASE: usize = 0;
/// Index of the `release` phase, forced by release mode.
pub const RELEASE_PHASE: usize = 5;
/// Index of the `backmerge` phase.
pub const BACKMERGE_PHASE: usize = 6;
/// Index of the terminal `complete` pseudo-phase.
pub const COMPLETE_PHASE: usize = 7;

/// Static definition of a single delivery phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseDef {
    /// Position in the pipeline, 0-indexed
    pub index: usize,
    /// Stable phase name, also used as the phase pattern in log records
    pub name: &'static str,
    /// Whether advancing past this phase requires observed external approval
    pub has_manual_gate: bool,
}

impl PhaseDef {
    /// The phase that must complete before this one, if any.
    pub fn predecessor(&self) -> Option<&'static PhaseDef> {
        self.index.checked_sub(1).and_then(phase_by_index)
    }

    /// The phase that follows this one, if any.
    pub fn successor(&self) -> Option<&'static PhaseDef> {
        phase_by_index(self.index + 1)
    }

    /// Whether this is the terminal pseudo-phase.
    pub fn is_terminal(&self) -> bool {
        self.index == COMPLETE_PHASE
    }
}

/// The full delivery pipeline, in execution order.
///
/// `complete` is a pseudo-phase: it has no handler and loops back to
/// `specify` for the next feature.
pub const PIPELINE: [PhaseDef; 8] = [
    PhaseDef {
        index: 0,
        name: "specify",
        has_manual_gate: false,
    },
    PhaseDef {
        index: 1,
        name: "plan",
        has_manual_gate: false,
    },
    PhaseDef {
        index: 2,
        name: "tasks",
        has_manual_gate: false,
    },
    PhaseDef {
        index: 3,
        name: "implement",
        has_manual_gate: false,
    },
    PhaseDef {
        index: 4,
        name: "integrate",
        has_manual_gate: true,
    },
    PhaseDef {
        index: 5,
        name: "release",
        has_manual_gate: true,
    },
    PhaseDef {
        index: 6,
        name: "backmerge",
        has_manual_gate: true,
    },
    PhaseDef {
        index: 7,
        name: "complete",
        has_manual_gate: false,
    },
];

/// Look up a phase by its pipeline index.
pub fn phase_by_index(index: usize) -> Option<&'static PhaseDef> {
    PIPELINE.get(index)
}

/// Look up a phase by its stable name.
pub fn phase_by_name(name: &str) -> Option<&'static PhaseDef> {
    PIPELINE.iter().find(|p| p.name == name)
}

/// All phases that have an executable handler (everything except `complete`).
pub fn executable_phases() -> &'static [PhaseDef] {
    &PIPELINE[..COMPLETE_PHASE]
}
