//! State-store location and creation.
//!
//! Each checkout carries its durable state in a `.cadence/` directory at the
//! checkout root, excluded from version control:
//!
//! ```text
//! .cadence/
//! ├── sync.db       # the synchronization log (primary checkouts)
//! ├── sync.path     # or: relative reference to the primary's sync.db
//! ├── context.json  # identity marker: { context_id, root }
//! └── .gitignore    # "*" so the store never enters version control
//! ```
//!
//! Secondary checkouts do not get an independent log: at store creation they
//! write `sync.path` pointing at the primary's `sync.db` (relative, so the
//! pair survives relocation), initializing an empty primary log first when
//! needed. The reference is written once and read-only afterwards. Every
//! step is idempotent; repeated calls never duplicate structure.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::context::{ExecutionContext, context_id_for};
use crate::errors::StoreError;
use crate::synclog::SyncLog;

/// Name of the per-checkout state directory.
pub const STORE_DIR_NAME: &str = ".cadence";
const DB_FILE: &str = "sync.db";
const LINK_FILE: &str = "sync.path";
const MARKER_FILE: &str = "context.json";
const IGNORE_FILE: &str = ".gitignore";

/// Identity marker recorded inside every store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityMarker {
    pub context_id: String,
    pub root: PathBuf,
}

/// Handle to one checkout's state store.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
    db_path: PathBuf,
    is_shared: bool,
    backing_context_id: String,
}

impl StateStore {
    /// Locate (or create) the store for a context, applying the sharing
    /// policy: primary checkouts own their log, secondary checkouts link to
    /// the primary's. Idempotent.
    pub fn locate(ctx: &ExecutionContext) -> Result<Self, StoreError> {
        let dir = ctx.root.join(STORE_DIR_NAME);
        ensure_store_skeleton(&dir, &ctx.context_id, &ctx.root)?;

        if !ctx.is_secondary {
            return Ok(Self {
                db_path: dir.join(DB_FILE),
                dir,
                is_shared: false,
                backing_context_id: ctx.context_id.clone(),
            });
        }

        let primary_root = ctx.primary_root.as_ref().ok_or(StoreError::NoPrimary)?;
        let primary_db = primary_root.join(STORE_DIR_NAME).join(DB_FILE);
        if !primary_db.exists() {
            let primary_id = context_id_for(primary_root);
            ensure_store_skeleton(
                primary_root.join(STORE_DIR_NAME).as_path(),
                &primary_id,
                primary_root,
            )?;
            // Initialize an empty primary log so the reference has a target.
            SyncLog::open(&primary_db)?;
        }

        let link = dir.join(LINK_FILE);
        if !link.exists() {
            let rel = relative_path(&dir, &primary_db);
            fs::write(&link, rel.to_string_lossy().as_bytes()).map_err(|source| {
                StoreError::LinkFailed {
                    target: primary_db.clone(),
                    source,
                }
            })?;
        }
        let db_path = resolve_link(&dir, &link)?;

        Ok(Self {
            dir,
            db_path,
            is_shared: true,
            backing_context_id: context_id_for(primary_root),
        })
    }

    /// Locate the store, falling back to an isolated store in a temp
    /// location when the default location cannot be created. Returns the
    /// store and whether it is running degraded.
    pub fn locate_or_isolated(ctx: &ExecutionContext) -> Result<(Self, bool), StoreError> {
        match Self::locate(ctx) {
            Ok(store) => Ok((store, false)),
            Err(err) => {
                warn!(
                    error = %err,
                    "state store unavailable; continuing with an isolated store \
                     invisible to other checkouts"
                );
                let dir = std::env::temp_dir().join(format!("cadence-{}", ctx.context_id));
                fs::create_dir_all(&dir).map_err(|source| StoreError::CreateFailed {
                    path: dir.clone(),
                    source,
                })?;
                let store = Self {
                    db_path: dir.join(DB_FILE),
                    dir,
                    is_shared: false,
                    backing_context_id: ctx.context_id.clone(),
                };
                Ok((store, true))
            }
        }
    }

    /// Open the synchronization log this store backs onto.
    pub fn open_log(&self) -> Result<SyncLog, StoreError> {
        Ok(SyncLog::open(&self.db_path)?)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn is_shared(&self) -> bool {
        self.is_shared
    }

    /// Context that owns the backing log: the primary's id for shared
    /// stores, the checkout's own id otherwise.
    pub fn backing_context_id(&self) -> &str {
        &self.backing_context_id
    }

    /// Read the identity marker of a store directory, if present.
    pub fn read_marker(dir: &Path) -> Option<IdentityMarker> {
        let content = fs::read_to_string(dir.join(MARKER_FILE)).ok()?;
        serde_json::from_str(&content).ok()
    }
}

/// Create directory, ignore marker, and identity marker; all idempotent.
fn ensure_store_skeleton(dir: &Path, context_id: &str, root: &Path) -> Result<(), StoreError> {
    fs::create_dir_all(dir).map_err(|source| StoreError::CreateFailed {
        path: dir.to_path_buf(),
        source,
    })?;

    let ignore = dir.join(IGNORE_FILE);
    if !ignore.exists() {
        fs::write(&ignore, "*\n").map_err(|source| StoreError::MarkerWriteFailed {
            path: ignore.clone(),
            source,
        })?;
    }

    let marker_path = dir.join(MARKER_FILE);
    if !marker_path.exists() {
        let marker = IdentityMarker {
            context_id: context_id.to_string(),
            root: root.to_path_buf(),
        };
        let json = serde_json::to_string_pretty(&marker)
            .expect("identity marker serialization is infallible");
        fs::write(&marker_path, json).map_err(|source| StoreError::MarkerWriteFailed {
            path: marker_path.clone(),
            source,
        })?;
    }

    Ok(())
}

fn resolve_link(dir: &Path, link: &Path) -> Result<PathBuf, StoreError> {
    let rel = fs::read_to_string(link).map_err(|source| StoreError::LinkFailed {
        target: link.to_path_buf(),
        source,
    })?;
    Ok(dir.join(rel.trim()))
}

/// Relative path from `from` (a directory) to `to` (a file), both absolute.
fn relative_path(from: &Path, to: &Path) -> PathBuf {
    let from_comps: Vec<_> = from.components().collect();
    let to_comps: Vec<_> = to.components().collect();
    let common = from_comps
        .iter()
        .zip(&to_comps)
        .take_while(|(a, b)| a == b)
        .count();

    let mut rel = PathBuf::new();
    for _ in common..from_comps.len() {
        rel.push("..");
    }
    for comp in &to_comps[common..] {
        rel.push(comp);
    }
    rel
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synclog::{NewTransition, RecordFilter, SyncStatus};
    use serde_json::json;
    use tempfile::tempdir;

    fn primary_context(root: &Path) -> ExecutionContext {
        let root = root.canonicalize().unwrap();
        ExecutionContext {
            context_id: context_id_for(&root),
            branch: "main".to_string(),
            primary_root: Some(root.clone()),
            root,
            is_secondary: false,
        }
    }

    fn secondary_context(root: &Path, primary_root: Option<&Path>) -> ExecutionContext {
        let root = root.canonicalize().unwrap();
        ExecutionContext {
            context_id: context_id_for(&root),
            branch: "feat/x".to_string(),
            primary_root: primary_root.map(|p| p.canonicalize().unwrap()),
            root,
            is_secondary: true,
        }
    }

    fn transition(context_id: &str) -> NewTransition {
        NewTransition {
            context_id: Some(context_id.to_string()),
            phase: "specify".to_string(),
            source_ref: Some("feat/x".to_string()),
            target_ref: None,
            status: SyncStatus::Completed,
            metadata: json!({}),
            actor: context_id.to_string(),
            detail: "specify completed".to_string(),
        }
    }

    #[test]
    fn test_locate_primary_creates_structure() {
        let dir = tempdir().unwrap();
        let ctx = primary_context(dir.path());

        let store = StateStore::locate(&ctx).unwrap();
        assert!(!store.is_shared());
        assert_eq!(store.backing_context_id(), ctx.context_id);
        assert!(store.dir().join(".gitignore").exists());
        assert!(store.dir().join("context.json").exists());
        assert_eq!(
            fs::read_to_string(store.dir().join(".gitignore")).unwrap(),
            "*\n"
        );

        let marker = StateStore::read_marker(store.dir()).unwrap();
        assert_eq!(marker.context_id, ctx.context_id);
        assert_eq!(marker.root, ctx.root);
    }

    #[test]
    fn test_locate_is_idempotent() {
        let dir = tempdir().unwrap();
        let ctx = primary_context(dir.path());

        let first = StateStore::locate(&ctx).unwrap();
        let marker_before = fs::read_to_string(first.dir().join("context.json")).unwrap();

        let second = StateStore::locate(&ctx).unwrap();
        let marker_after = fs::read_to_string(second.dir().join("context.json")).unwrap();

        assert_eq!(first.db_path(), second.db_path());
        assert_eq!(marker_before, marker_after);
        let entries: Vec<_> = fs::read_dir(second.dir()).unwrap().collect();
        assert_eq!(entries.len(), 2, ".gitignore and context.json only");
    }

    #[test]
    fn test_secondary_links_to_primary_log() {
        let primary_dir = tempdir().unwrap();
        let secondary_dir = tempdir().unwrap();
        let ctx = secondary_context(secondary_dir.path(), Some(primary_dir.path()));

        let store = StateStore::locate(&ctx).unwrap();
        assert!(store.is_shared());
        assert_eq!(
            store.backing_context_id(),
            context_id_for(&primary_dir.path().canonicalize().unwrap())
        );

        // The primary log was initialized so the reference has a target.
        let primary_db = primary_dir.path().join(".cadence/sync.db");
        assert!(primary_db.exists());
        assert_eq!(
            store.db_path().canonicalize().unwrap(),
            primary_db.canonicalize().unwrap()
        );

        // The reference is relative, so the pair survives relocation.
        let link = fs::read_to_string(store.dir().join("sync.path")).unwrap();
        assert!(link.starts_with(".."), "link must be relative: {link}");
    }

    #[test]
    fn test_secondary_link_written_once() {
        let primary_dir = tempdir().unwrap();
        let secondary_dir = tempdir().unwrap();
        let ctx = secondary_context(secondary_dir.path(), Some(primary_dir.path()));

        StateStore::locate(&ctx).unwrap();
        let link_before =
            fs::read_to_string(secondary_dir.path().join(".cadence/sync.path")).unwrap();
        StateStore::locate(&ctx).unwrap();
        let link_after =
            fs::read_to_string(secondary_dir.path().join(".cadence/sync.path")).unwrap();
        assert_eq!(link_before, link_after);
    }

    #[test]
    fn test_shared_write_visible_through_both_handles() {
        let primary_dir = tempdir().unwrap();
        let secondary_dir = tempdir().unwrap();
        let primary_ctx = primary_context(primary_dir.path());
        let secondary_ctx = secondary_context(secondary_dir.path(), Some(primary_dir.path()));

        let primary_store = StateStore::locate(&primary_ctx).unwrap();
        let secondary_store = StateStore::locate(&secondary_ctx).unwrap();

        let mut writer = secondary_store.open_log().unwrap();
        writer.record(transition(&secondary_ctx.context_id)).unwrap();

        let reader = primary_store.open_log().unwrap();
        let seen = reader.latest_for(RecordFilter::All).unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(
            seen[0].context_id.as_deref(),
            Some(secondary_ctx.context_id.as_str())
        );
    }

    #[test]
    fn test_secondary_without_primary_errors() {
        let dir = tempdir().unwrap();
        let ctx = secondary_context(dir.path(), None);
        let err = StateStore::locate(&ctx).unwrap_err();
        assert!(matches!(err, StoreError::NoPrimary));
    }

    #[test]
    fn test_locate_or_isolated_falls_back_degraded() {
        let dir = tempdir().unwrap();
        let ctx = secondary_context(dir.path(), None);

        let (store, degraded) = StateStore::locate_or_isolated(&ctx).unwrap();
        assert!(degraded);
        assert!(!store.is_shared());
        // The isolated store still yields a working log.
        let mut log = store.open_log().unwrap();
        log.record(transition(&ctx.context_id)).unwrap();

        fs::remove_dir_all(store.dir()).ok();
    }

    #[test]
    fn test_corrupt_store_does_not_affect_independent_store() {
        let dir_a = tempdir().unwrap();
        let dir_b = tempdir().unwrap();
        let ctx_a = primary_context(dir_a.path());
        let ctx_b = primary_context(dir_b.path());

        let store_a = StateStore::locate(&ctx_a).unwrap();
        let store_b = StateStore::locate(&ctx_b).unwrap();

        // Prime both logs, then corrupt A's database file.
        store_a.open_log().unwrap();
        {
            let mut log_b = store_b.open_log().unwrap();
            log_b.record(transition(&ctx_b.context_id)).unwrap();
        }
        fs::write(store_a.db_path(), "not a database").unwrap();

        assert!(store_a.open_log().is_err());
        let log_b = store_b.open_log().unwrap();
        assert_eq!(log_b.latest_for(RecordFilter::All).unwrap().len(), 1);
    }

    #[test]
    fn test_relative_path_between_siblings() {
        let rel = relative_path(
            Path::new("/work/wt/.cadence"),
            Path::new("/work/main/.cadence/sync.db"),
        );
        assert_eq!(rel, PathBuf::from("../../main/.cadence/sync.db"));
    }
}
