//! Typed error hierarchy for the Cadence orchestrator.
//!
//! Four top-level enums cover the four subsystems:
//! - `ContextError` — execution-context resolution failures (fatal, no retry)
//! - `StoreError` — state-store location/creation failures (recoverable via
//!   the isolated fallback store)
//! - `SyncError` — synchronization-log storage failures (fatal for the
//!   current invocation, scoped to one store)
//! - `RunError` — orchestrator mode validation failures

use std::path::PathBuf;
use thiserror::Error;

/// Errors from execution-context resolution.
#[derive(Debug, Error)]
pub enum ContextError {
    #[error(
        "{path} is not inside a managed checkout; switch to a checkout of the repository and retry"
    )]
    NotManaged { path: PathBuf },

    #[error("checkout at {path} has no working directory")]
    NoWorkdir { path: PathBuf },

    #[error("failed to canonicalize checkout root {path}: {source}")]
    Canonicalize {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("git query failed: {0}")]
    Git(#[from] git2::Error),
}

/// Errors from state-store location and creation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to create state directory {path}: {source}")]
    CreateFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write state marker {path}: {source}")]
    MarkerWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to link store to primary log {target}: {source}")]
    LinkFailed {
        target: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("secondary checkout has no reachable primary checkout to share a log with")]
    NoPrimary,

    #[error(transparent)]
    Sync(#[from] SyncError),
}

/// Errors from the synchronization log's backing storage.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("failed to open synchronization log {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("synchronization log write rejected: {0}")]
    Write(#[source] rusqlite::Error),

    #[error("synchronization log query failed: {0}")]
    Query(#[source] rusqlite::Error),
}

/// Errors from orchestrator run-mode validation.
///
/// Handler failures and unmet manual gates are *not* errors: they are
/// recorded durably and surfaced through the execution report.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("branch '{branch}' is a persistent trunk branch and cannot be released directly")]
    BranchNotEligible { branch: String },

    #[error("no paused manual gate to continue; run 'cadence run' to advance normally")]
    NoPausedGate,

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
