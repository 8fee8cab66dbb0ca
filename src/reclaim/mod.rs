//! Orphan state-store detection and reclamation.
//!
//! Stores are colocated with checkout roots, and every record carries the
//! writing checkout's root, so the shared log knows where stores have ever
//! lived. A root whose store directory still exists on disk but which git no
//! longer lists as a live checkout is an orphan (typically a worktree pruned
//! while its directory lingered). Detection is side-effect-free; deletion is
//! a separate, explicitly confirmed step.

use anyhow::{Context, Result, bail};
use std::fs;
use std::path::PathBuf;
use tracing::info;

use crate::context::{ExecutionContext, list_checkouts};
use crate::store::{STORE_DIR_NAME, StateStore};
use crate::synclog::SyncLog;

/// A state store whose owning checkout is gone from the live set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanCandidate {
    /// The store directory that can be reclaimed.
    pub store_path: PathBuf,
    /// Context id last seen owning the store.
    pub last_seen_context_id: Option<String>,
    /// Checkout root the store belongs to.
    pub root: PathBuf,
}

/// Diff the log's known checkout roots against the live-checkout
/// enumeration. Side-effect-free.
pub fn find_orphans(primary: &ExecutionContext, log: &SyncLog) -> Result<Vec<OrphanCandidate>> {
    let primary_root = primary
        .primary_root
        .clone()
        .unwrap_or_else(|| primary.root.clone());
    let live = list_checkouts(&primary_root)
        .with_context(|| format!("failed to enumerate checkouts of {}", primary_root.display()))?;

    let mut orphans = Vec::new();
    for (logged_id, root) in log.known_roots()? {
        let store_path = root.join(STORE_DIR_NAME);
        if !store_path.exists() {
            // The whole checkout is gone; nothing left to reclaim.
            continue;
        }
        let canonical = root.canonicalize().unwrap_or_else(|_| root.clone());
        if live.contains(&canonical) {
            continue;
        }
        // The marker inside the store is more authoritative than the log.
        let last_seen_context_id = StateStore::read_marker(&store_path)
            .map(|m| m.context_id)
            .or(logged_id);
        orphans.push(OrphanCandidate {
            store_path,
            last_seen_context_id,
            root,
        });
    }

    Ok(orphans)
}

/// Delete an orphaned store directory. Refuses to run unconfirmed, and
/// refuses paths that are not a state-store directory.
pub fn reclaim(candidate: &OrphanCandidate, confirmed: bool) -> Result<()> {
    if !confirmed {
        bail!(
            "refusing to delete {} without confirmation",
            candidate.store_path.display()
        );
    }
    if candidate.store_path.file_name().and_then(|n| n.to_str()) != Some(STORE_DIR_NAME) {
        bail!(
            "{} is not a {} state directory",
            candidate.store_path.display(),
            STORE_DIR_NAME
        );
    }
    fs::remove_dir_all(&candidate.store_path)
        .with_context(|| format!("failed to remove {}", candidate.store_path.display()))?;
    info!(
        store = %candidate.store_path.display(),
        context = candidate.last_seen_context_id.as_deref().unwrap_or("unknown"),
        "reclaimed orphaned state store"
    );
    Ok(())
}
