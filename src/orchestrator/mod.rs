//! Step executor: drives phase execution until a pause, failure, or the
//! terminal phase.
//!
//! Every loop iteration re-derives the current phase from durable history
//! plus fresh observations; nothing is carried over from previous
//! invocations. Outcomes are recorded before they are surfaced, so a later
//! invocation (or another checkout sharing the log) always sees what
//! happened here.

pub mod report;

pub use report::{ExecutionReport, PhaseReport, PhaseStatus};

use serde_json::{Value, json};
use tracing::{debug, info};

use crate::context::{ExecutionContext, tag_exists};
use crate::errors::RunError;
use crate::handlers::{ApprovalSource, HandlerOutcome, PhaseHandler};
use crate::pipeline::{
    Action, BranchKind, BranchRules, FIRST_PHASE, Facts, PIPELINE, PhaseDecision, RELEASE_PHASE,
    determine_phase, gate_references, is_stale_lineage,
};
use crate::synclog::{
    META_ARTIFACTS, META_DESCRIPTION, META_ERROR, META_RETRY_OF, META_ROOT, NewTransition,
    RecordFilter, SyncLog, SyncStatus, TransitionRecord,
};

/// How an invocation was asked to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunMode {
    /// Start a new feature at `specify`, recording its description.
    New { description: String },
    /// Start at whatever phase the derivation recommends.
    Default,
    /// Force the `release` phase on an integration-eligible branch.
    Release,
    /// Resume a run paused at a manual gate, re-checking approvals.
    Continue,
}

/// Drives the pipeline for one execution context.
pub struct Orchestrator<'a> {
    ctx: &'a ExecutionContext,
    log: SyncLog,
    rules: BranchRules,
    handler: &'a dyn PhaseHandler,
    approvals: &'a dyn ApprovalSource,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        ctx: &'a ExecutionContext,
        log: SyncLog,
        rules: BranchRules,
        handler: &'a dyn PhaseHandler,
        approvals: &'a dyn ApprovalSource,
    ) -> Self {
        Self {
            ctx,
            log,
            rules,
            handler,
            approvals,
        }
    }

    /// Answer the machine-readable phase query without executing anything.
    pub fn status(&self) -> Result<PhaseStatus, RunError> {
        let (records, facts) = self.snapshot()?;
        let decision = determine_phase(&records, &facts);
        let last_sync_time = self
            .log
            .latest(RecordFilter::Context {
                id: &self.ctx.context_id,
                include_legacy: !self.ctx.is_secondary,
            })?
            .map(|r| r.created_at);

        Ok(PhaseStatus {
            context_id: self.ctx.context_id.clone(),
            phase_index: decision.phase_index,
            phase_name: decision.phase().name.to_string(),
            last_sync_time,
            recommended_action: decision.describe(),
        })
    }

    /// Execute phases until an unmet manual gate, a handler failure, or the
    /// terminal phase. A handler failure is reported, not returned as `Err`;
    /// `Err` is reserved for mode validation and storage failures.
    pub fn run(&mut self, mode: RunMode) -> Result<ExecutionReport, RunError> {
        let mut forced = self.validate_mode(&mode)?;
        let mut report = ExecutionReport::new(&self.ctx.context_id, &self.ctx.branch);

        // One slot per phase plus the terminal derivation; anything more
        // means the derivation stopped converging.
        for _ in 0..=PIPELINE.len() {
            let (records, facts) = self.snapshot()?;
            let decision = match forced.take() {
                Some(phase) => PhaseDecision {
                    phase_index: phase,
                    action: Action::Start { phase },
                },
                None => determine_phase(&records, &facts),
            };

            let described = decision.describe();
            match decision.action {
                Action::Complete => {
                    report.summary = format!("{}: pipeline complete", self.ctx.branch);
                    return Ok(report);
                }
                Action::Paused { waiting, .. } => {
                    report.paused = true;
                    report.required_actions = waiting
                        .iter()
                        .map(|reference| format!("approve or merge {reference}"))
                        .collect();
                    report.summary = format!("{}: {described}", self.ctx.branch);
                    return Ok(report);
                }
                Action::Start { phase } | Action::Retry { phase, .. } => {
                    let succeeded = self.execute_phase(phase, &mode, &records, &mut report)?;
                    if !succeeded {
                        report.failed = true;
                        let detail = report
                            .phases
                            .last()
                            .and_then(|p| p.detail.clone())
                            .unwrap_or_default();
                        report.summary = format!(
                            "{}: {} failed: {detail}",
                            self.ctx.branch,
                            PIPELINE[phase].name
                        );
                        return Ok(report);
                    }
                }
            }
        }

        Err(RunError::Other(anyhow::anyhow!(
            "phase derivation did not converge after {} steps",
            PIPELINE.len() + 1
        )))
    }

    /// Mode validation; returns the forced start phase, if any.
    fn validate_mode(&self, mode: &RunMode) -> Result<Option<usize>, RunError> {
        match mode {
            RunMode::New { description } => {
                if description.trim().is_empty() {
                    return Err(RunError::Validation(
                        "feature description must not be empty".to_string(),
                    ));
                }
                Ok(Some(FIRST_PHASE))
            }
            RunMode::Default => Ok(None),
            RunMode::Release => {
                if self.rules.classify(&self.ctx.branch) == BranchKind::Trunk {
                    return Err(RunError::BranchNotEligible {
                        branch: self.ctx.branch.clone(),
                    });
                }
                Ok(Some(RELEASE_PHASE))
            }
            RunMode::Continue => {
                // The gate must exist regardless of whether its approvals
                // have since arrived, so validate against a view that
                // observes no approvals.
                let (records, facts) = self.snapshot_with(false)?;
                let decision = determine_phase(&records, &facts);
                if !matches!(decision.action, Action::Paused { .. }) {
                    return Err(RunError::NoPausedGate);
                }
                Ok(None)
            }
        }
    }

    /// Invoke the handler for one phase and record the outcome durably.
    /// Returns whether the handler succeeded.
    fn execute_phase(
        &mut self,
        phase: usize,
        mode: &RunMode,
        records: &[TransitionRecord],
        report: &mut ExecutionReport,
    ) -> Result<bool, RunError> {
        let def = &PIPELINE[phase];
        info!(phase = def.name, context = %self.ctx.context_id, "executing phase");

        // A spawn failure is a handler failure like any other: it gets
        // recorded before it is surfaced.
        let outcome = self
            .handler
            .execute(self.ctx, def)
            .unwrap_or_else(|err| HandlerOutcome::failure(err.to_string()));

        let mut metadata = json!({ META_ROOT: self.ctx.root.to_string_lossy() });
        if !outcome.artifacts.is_empty() {
            metadata[META_ARTIFACTS] = json!(outcome.artifacts);
        }
        if !outcome.success {
            metadata[META_ERROR] = Value::String(outcome.detail.clone());
        }
        if let RunMode::New { description } = mode {
            if phase == FIRST_PHASE {
                metadata[META_DESCRIPTION] = Value::String(description.clone());
            }
        }
        let prior_failure = records.iter().find(|r| {
            r.source_ref.as_deref() == Some(self.ctx.branch.as_str())
                && r.phase == def.name
                && r.status == SyncStatus::Failed
        });
        if let Some(prior) = prior_failure {
            metadata[META_RETRY_OF] = Value::String(prior.sync_id.clone());
        }

        let status = if outcome.success {
            SyncStatus::Completed
        } else {
            SyncStatus::Failed
        };
        let target_ref = match def.name {
            "integrate" | "backmerge" => self.rules.default_trunk().map(str::to_string),
            _ => None,
        };
        self.log.record(NewTransition {
            context_id: Some(self.ctx.context_id.clone()),
            phase: def.name.to_string(),
            source_ref: Some(self.ctx.branch.clone()),
            target_ref,
            status,
            metadata,
            actor: self.ctx.context_id.clone(),
            detail: format!("phase {} {}", def.name, status),
        })?;

        report.push_phase(
            def.index,
            def.name,
            status.as_str(),
            (!outcome.detail.is_empty()).then(|| outcome.detail.clone()),
        );
        Ok(outcome.success)
    }

    /// One consistent view of history plus fresh observations.
    fn snapshot(&self) -> Result<(Vec<TransitionRecord>, Facts), RunError> {
        self.snapshot_with(true)
    }

    fn snapshot_with(
        &self,
        observe_approvals: bool,
    ) -> Result<(Vec<TransitionRecord>, Facts), RunError> {
        let records = self.log.latest_for(RecordFilter::All)?;
        let mut facts = Facts::for_branch(&self.ctx.branch, &self.rules);

        if facts.branch_kind == BranchKind::Release {
            let candidates = self.rules.release_tag_candidates(&facts.branch);
            facts.release_tagged = match tag_exists(&self.ctx.root, &candidates) {
                Ok(tagged) => tagged,
                Err(err) => {
                    debug!(error = %err, "release tag query failed; treating branch as untagged");
                    false
                }
            };
        }

        if observe_approvals {
            for reference in gate_references(&records, &facts.branch) {
                let approved = self
                    .approvals
                    .is_approved(&reference)
                    .map_err(RunError::Other)?;
                facts.approvals.insert(reference, approved);
            }
        }

        if is_stale_lineage(&records, &facts) {
            info!(
                branch = %facts.branch,
                "newest record belongs to another lineage; deriving from branch shape"
            );
        }

        Ok((records, facts))
    }
}
