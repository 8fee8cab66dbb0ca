//! External collaborators: phase handlers and the approval signal.
//!
//! The orchestrator treats the work of each phase as an opaque operation
//! behind [`PhaseHandler`], and code-review approval as a boolean query
//! behind [`ApprovalSource`]. The shipped implementations spawn configured
//! commands; tests substitute in-process doubles.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::process::Command;
use tracing::debug;

use crate::context::ExecutionContext;
use crate::pipeline::PhaseDef;

/// Prefix a handler prints to report an artifact reference on stdout.
const ARTIFACT_PREFIX: &str = "ref:";

/// Result of one phase-handler invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerOutcome {
    pub success: bool,
    /// Handler output; carried verbatim into the failure record on failure.
    pub detail: String,
    /// Artifact references the handler produced (paths, review-request ids).
    pub artifacts: Vec<String>,
}

impl HandlerOutcome {
    pub fn success_with(artifacts: Vec<String>) -> Self {
        Self {
            success: true,
            detail: String::new(),
            artifacts,
        }
    }

    pub fn failure(detail: impl Into<String>) -> Self {
        Self {
            success: false,
            detail: detail.into(),
            artifacts: Vec::new(),
        }
    }
}

/// The external operation performing the actual work of one phase.
pub trait PhaseHandler {
    fn execute(&self, ctx: &ExecutionContext, phase: &PhaseDef) -> Result<HandlerOutcome>;
}

/// Boolean-per-reference query against the code-review system.
pub trait ApprovalSource {
    fn is_approved(&self, reference: &str) -> Result<bool>;
}

/// Runs a configured executable with the phase name as its argument, in the
/// checkout root. Exit 0 is success; `ref:`-prefixed stdout lines are
/// collected as artifact references.
pub struct CommandHandler {
    program: String,
}

impl CommandHandler {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl PhaseHandler for CommandHandler {
    fn execute(&self, ctx: &ExecutionContext, phase: &PhaseDef) -> Result<HandlerOutcome> {
        debug!(program = %self.program, phase = phase.name, "spawning phase handler");
        let output = Command::new(&self.program)
            .arg(phase.name)
            .current_dir(&ctx.root)
            .output()
            .with_context(|| format!("failed to spawn phase handler '{}'", self.program))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let artifacts: Vec<String> = stdout
            .lines()
            .filter_map(|line| line.strip_prefix(ARTIFACT_PREFIX))
            .map(|reference| reference.trim().to_string())
            .filter(|reference| !reference.is_empty())
            .collect();

        if output.status.success() {
            Ok(HandlerOutcome {
                success: true,
                detail: String::new(),
                artifacts,
            })
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                if stderr.trim().is_empty() {
                    stdout.trim()
                } else {
                    stderr.trim()
                }
            );
            Ok(HandlerOutcome {
                success: false,
                detail,
                artifacts,
            })
        }
    }
}

/// Runs a configured executable with the reference as its argument; exit 0
/// means the reference is approved/merged.
pub struct CommandApprovals {
    program: String,
}

impl CommandApprovals {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl ApprovalSource for CommandApprovals {
    fn is_approved(&self, reference: &str) -> Result<bool> {
        let status = Command::new(&self.program)
            .arg(reference)
            .status()
            .with_context(|| format!("failed to spawn approval query '{}'", self.program))?;
        Ok(status.success())
    }
}

/// Fixed approval observations. The default (empty) source observes
/// nothing, which keeps every gate closed; also the test double.
#[derive(Debug, Default, Clone)]
pub struct StaticApprovals {
    observed: BTreeMap<String, bool>,
}

impl StaticApprovals {
    pub fn approving(references: &[&str]) -> Self {
        Self {
            observed: references
                .iter()
                .map(|reference| (reference.to_string(), true))
                .collect(),
        }
    }

    pub fn set(&mut self, reference: impl Into<String>, approved: bool) {
        self.observed.insert(reference.into(), approved);
    }
}

impl ApprovalSource for StaticApprovals {
    fn is_approved(&self, reference: &str) -> Result<bool> {
        Ok(self.observed.get(reference).copied().unwrap_or(false))
    }
}
