//! Append-only synchronization log, safe for concurrent writers.
//!
//! The log is a SQLite database in WAL mode. Each `record()` call is one
//! atomic unit: it inserts a transition record plus its correlated audit
//! entry in a single transaction. Records are never updated or deleted;
//! retries append new records that point at the prior attempt through the
//! `retry_of` metadata key. Concurrent writers from other processes are
//! serialized by SQLite's write lock, waited on with a busy timeout instead
//! of failing immediately; reads do not block under WAL.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

use crate::errors::SyncError;

/// How long a writer waits on another writer's lock before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Metadata key linking a retry record to the attempt it supersedes.
pub const META_RETRY_OF: &str = "retry_of";
/// Metadata key carrying handler artifact references (paths, review ids).
pub const META_ARTIFACTS: &str = "artifacts";
/// Metadata key carrying the verbatim handler failure detail.
pub const META_ERROR: &str = "error";
/// Metadata key recording the writing checkout's root path.
pub const META_ROOT: &str = "root";
/// Metadata key carrying the feature description given to `new`.
pub const META_DESCRIPTION: &str = "description";

/// Lifecycle status of a transition record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// Written before the handler ran; an interrupted process leaves this.
    Pending,
    /// The phase handler finished successfully.
    Completed,
    /// The phase handler reported failure.
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Completed => "completed",
            SyncStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SyncStatus::Pending),
            "completed" => Some(SyncStatus::Completed),
            "failed" => Some(SyncStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable phase-transition entry.
#[derive(Debug, Clone)]
pub struct TransitionRecord {
    pub sync_id: String,
    /// Null for records written before context tracking existed; those
    /// belong to the primary context.
    pub context_id: Option<String>,
    /// Phase name this record belongs to.
    pub phase: String,
    /// Branch the phase ran on; identifies the lineage.
    pub source_ref: Option<String>,
    pub target_ref: Option<String>,
    pub status: SyncStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub metadata: Value,
}

impl TransitionRecord {
    /// Artifact references recorded by the handler, if any.
    pub fn artifacts(&self) -> Vec<String> {
        self.metadata
            .get(META_ARTIFACTS)
            .and_then(Value::as_array)
            .map(|refs| {
                refs.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The verbatim failure detail, for failed records.
    pub fn error_detail(&self) -> Option<&str> {
        self.metadata.get(META_ERROR).and_then(Value::as_str)
    }

    /// The checkout root recorded at write time, if any.
    pub fn root(&self) -> Option<PathBuf> {
        self.metadata
            .get(META_ROOT)
            .and_then(Value::as_str)
            .map(PathBuf::from)
    }
}

/// Audit entry correlated 1:1 with a transition record.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub sync_id: String,
    pub actor: String,
    pub detail: String,
    pub created_at: DateTime<Utc>,
}

/// Input to [`SyncLog::record`].
#[derive(Debug, Clone)]
pub struct NewTransition {
    pub context_id: Option<String>,
    pub phase: String,
    pub source_ref: Option<String>,
    pub target_ref: Option<String>,
    pub status: SyncStatus,
    pub metadata: Value,
    /// Who performed the transition, for the audit entry.
    pub actor: String,
    /// Human-readable audit detail.
    pub detail: String,
}

/// Record selection for queries.
#[derive(Debug, Clone, Copy)]
pub enum RecordFilter<'a> {
    /// Every record, regardless of writer.
    All,
    /// Records for one context. `include_legacy` additionally selects rows
    /// with a null context id, which belong to the primary context.
    Context {
        id: &'a str,
        include_legacy: bool,
    },
}

/// Handle to one synchronization log database.
pub struct SyncLog {
    conn: Connection,
    path: PathBuf,
}

impl SyncLog {
    /// Open (or create) the log at the given path and run migrations.
    pub fn open(path: &Path) -> Result<Self, SyncError> {
        let conn = Connection::open(path).map_err(|source| SyncError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let log = Self {
            conn,
            path: path.to_path_buf(),
        };
        log.init()?;
        Ok(log)
    }

    /// Open an in-memory log (for testing).
    pub fn open_in_memory() -> Result<Self, SyncError> {
        let conn = Connection::open_in_memory().map_err(|source| SyncError::Open {
            path: PathBuf::from(":memory:"),
            source,
        })?;
        let log = Self {
            conn,
            path: PathBuf::from(":memory:"),
        };
        log.init()?;
        Ok(log)
    }

    /// Path of the backing database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn init(&self) -> Result<(), SyncError> {
        self.conn
            .busy_timeout(BUSY_TIMEOUT)
            .map_err(SyncError::Write)?;
        // WAL keeps readers non-blocking while one writer holds the lock.
        self.conn
            .pragma_update(None, "journal_mode", "wal")
            .map_err(SyncError::Write)?;
        self.migrate()
    }

    fn migrate(&self) -> Result<(), SyncError> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS sync_records (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    sync_id TEXT NOT NULL UNIQUE,
                    context_id TEXT,
                    phase TEXT NOT NULL,
                    source_ref TEXT,
                    target_ref TEXT,
                    status TEXT NOT NULL DEFAULT 'pending',
                    created_at TEXT NOT NULL,
                    completed_at TEXT,
                    metadata TEXT NOT NULL DEFAULT '{}'
                );

                CREATE TABLE IF NOT EXISTS audit_entries (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    sync_id TEXT NOT NULL REFERENCES sync_records(sync_id),
                    actor TEXT NOT NULL,
                    detail TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_sync_records_context
                    ON sync_records(context_id);
                CREATE INDEX IF NOT EXISTS idx_audit_entries_sync
                    ON audit_entries(sync_id);
                ",
            )
            .map_err(SyncError::Write)
    }

    /// Append one transition record plus its audit entry atomically.
    ///
    /// Returns the generated sync id. `completed_at` is set only when the
    /// status is `completed`. Callers must not assume multi-call
    /// transactions; each call commits independently.
    pub fn record(&mut self, new: NewTransition) -> Result<String, SyncError> {
        let sync_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let completed_at = match new.status {
            SyncStatus::Completed => Some(now),
            _ => None,
        };

        let tx = self.conn.transaction().map_err(SyncError::Write)?;
        tx.execute(
            "INSERT INTO sync_records
                 (sync_id, context_id, phase, source_ref, target_ref,
                  status, created_at, completed_at, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                sync_id,
                new.context_id,
                new.phase,
                new.source_ref,
                new.target_ref,
                new.status.as_str(),
                now,
                completed_at,
                new.metadata.to_string(),
            ],
        )
        .map_err(SyncError::Write)?;
        tx.execute(
            "INSERT INTO audit_entries (sync_id, actor, detail, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![sync_id, new.actor, new.detail, now],
        )
        .map_err(SyncError::Write)?;
        tx.commit().map_err(SyncError::Write)?;

        Ok(sync_id)
    }

    /// Records newest-first, optionally filtered to one context.
    pub fn latest_for(&self, filter: RecordFilter<'_>) -> Result<Vec<TransitionRecord>, SyncError> {
        let (clause, ctx): (&str, Option<&str>) = match filter {
            RecordFilter::All => ("", None),
            RecordFilter::Context {
                id,
                include_legacy: true,
            } => ("WHERE context_id = ?1 OR context_id IS NULL", Some(id)),
            RecordFilter::Context {
                id,
                include_legacy: false,
            } => ("WHERE context_id = ?1", Some(id)),
        };
        let sql = format!(
            "SELECT sync_id, context_id, phase, source_ref, target_ref,
                    status, created_at, completed_at, metadata
             FROM sync_records {clause}
             ORDER BY id DESC"
        );

        let mut stmt = self.conn.prepare(&sql).map_err(SyncError::Query)?;
        let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<TransitionRecord> {
            let status: String = row.get(5)?;
            let metadata: String = row.get(8)?;
            Ok(TransitionRecord {
                sync_id: row.get(0)?,
                context_id: row.get(1)?,
                phase: row.get(2)?,
                source_ref: row.get(3)?,
                target_ref: row.get(4)?,
                status: SyncStatus::parse(&status).unwrap_or(SyncStatus::Pending),
                created_at: row.get(6)?,
                completed_at: row.get(7)?,
                metadata: serde_json::from_str(&metadata).unwrap_or(Value::Null),
            })
        };
        let rows = match ctx {
            Some(id) => stmt.query_map(params![id], map_row),
            None => stmt.query_map([], map_row),
        }
        .map_err(SyncError::Query)?;

        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(SyncError::Query)
    }

    /// The newest record matching the filter, if any.
    pub fn latest(&self, filter: RecordFilter<'_>) -> Result<Option<TransitionRecord>, SyncError> {
        Ok(self.latest_for(filter)?.into_iter().next())
    }

    /// Audit entries for one sync id, oldest-first.
    pub fn audit_for(&self, sync_id: &str) -> Result<Vec<AuditEntry>, SyncError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT sync_id, actor, detail, created_at
                 FROM audit_entries WHERE sync_id = ?1 ORDER BY id ASC",
            )
            .map_err(SyncError::Query)?;
        let rows = stmt
            .query_map(params![sync_id], |row| {
                Ok(AuditEntry {
                    sync_id: row.get(0)?,
                    actor: row.get(1)?,
                    detail: row.get(2)?,
                    created_at: row.get(3)?,
                })
            })
            .map_err(SyncError::Query)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(SyncError::Query)
    }

    /// The newest recorded checkout root per context.
    ///
    /// Legacy records without a context id are keyed under `None`. Records
    /// without a root in their metadata are skipped.
    pub fn known_roots(&self) -> Result<Vec<(Option<String>, PathBuf)>, SyncError> {
        let mut seen: Vec<Option<String>> = Vec::new();
        let mut roots = Vec::new();
        for record in self.latest_for(RecordFilter::All)? {
            if seen.contains(&record.context_id) {
                continue;
            }
            seen.push(record.context_id.clone());
            if let Some(root) = record.root() {
                roots.push((record.context_id, root));
            }
        }
        Ok(roots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn transition(context_id: Option<&str>, phase: &str, status: SyncStatus) -> NewTransition {
        NewTransition {
            context_id: context_id.map(str::to_string),
            phase: phase.to_string(),
            source_ref: Some("feat/login".to_string()),
            target_ref: None,
            status,
            metadata: json!({}),
            actor: context_id.unwrap_or("primary").to_string(),
            detail: format!("{phase} {status}"),
        }
    }

    #[test]
    fn test_record_returns_unique_sync_ids() {
        let mut log = SyncLog::open_in_memory().unwrap();
        let a = log
            .record(transition(Some("aaa"), "specify", SyncStatus::Completed))
            .unwrap();
        let b = log
            .record(transition(Some("aaa"), "plan", SyncStatus::Completed))
            .unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_latest_for_newest_first() {
        let mut log = SyncLog::open_in_memory().unwrap();
        log.record(transition(Some("aaa"), "specify", SyncStatus::Completed))
            .unwrap();
        log.record(transition(Some("aaa"), "plan", SyncStatus::Completed))
            .unwrap();

        let records = log.latest_for(RecordFilter::All).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].phase, "plan");
        assert_eq!(records[1].phase, "specify");
    }

    #[test]
    fn test_context_filter_excludes_other_contexts() {
        let mut log = SyncLog::open_in_memory().unwrap();
        log.record(transition(Some("aaa"), "specify", SyncStatus::Completed))
            .unwrap();
        log.record(transition(Some("bbb"), "specify", SyncStatus::Completed))
            .unwrap();

        let records = log
            .latest_for(RecordFilter::Context {
                id: "aaa",
                include_legacy: false,
            })
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].context_id.as_deref(), Some("aaa"));
    }

    #[test]
    fn test_null_context_belongs_to_primary() {
        let mut log = SyncLog::open_in_memory().unwrap();
        // Legacy row written before context tracking existed.
        log.record(transition(None, "specify", SyncStatus::Completed))
            .unwrap();
        log.record(transition(Some("aaa"), "plan", SyncStatus::Completed))
            .unwrap();

        let primary = log
            .latest_for(RecordFilter::Context {
                id: "aaa",
                include_legacy: true,
            })
            .unwrap();
        assert_eq!(primary.len(), 2);

        let secondary = log
            .latest_for(RecordFilter::Context {
                id: "bbb",
                include_legacy: false,
            })
            .unwrap();
        assert!(secondary.is_empty());
    }

    #[test]
    fn test_completed_at_only_set_when_completed() {
        let mut log = SyncLog::open_in_memory().unwrap();
        log.record(transition(Some("aaa"), "implement", SyncStatus::Pending))
            .unwrap();
        log.record(transition(Some("aaa"), "implement", SyncStatus::Failed))
            .unwrap();
        log.record(transition(Some("aaa"), "implement", SyncStatus::Completed))
            .unwrap();

        let records = log.latest_for(RecordFilter::All).unwrap();
        assert!(records[0].completed_at.is_some());
        assert!(records[1].completed_at.is_none());
        assert!(records[2].completed_at.is_none());
    }

    #[test]
    fn test_audit_entry_correlated_with_record() {
        let mut log = SyncLog::open_in_memory().unwrap();
        let sync_id = log
            .record(transition(Some("aaa"), "specify", SyncStatus::Completed))
            .unwrap();

        let entries = log.audit_for(&sync_id).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].sync_id, sync_id);
        assert_eq!(entries[0].actor, "aaa");
        assert!(entries[0].detail.contains("specify"));
    }

    #[test]
    fn test_metadata_roundtrip_and_accessors() {
        let mut log = SyncLog::open_in_memory().unwrap();
        let mut new = transition(Some("aaa"), "integrate", SyncStatus::Completed);
        new.metadata = json!({
            META_ARTIFACTS: ["PR#12", "PR#13"],
            META_ROOT: "/work/repo",
        });
        log.record(new).unwrap();

        let record = log.latest(RecordFilter::All).unwrap().unwrap();
        assert_eq!(record.artifacts(), vec!["PR#12", "PR#13"]);
        assert_eq!(record.root(), Some(PathBuf::from("/work/repo")));
        assert!(record.error_detail().is_none());
    }

    #[test]
    fn test_retry_references_prior_record() {
        let mut log = SyncLog::open_in_memory().unwrap();
        let mut failed = transition(Some("aaa"), "implement", SyncStatus::Failed);
        failed.metadata = json!({ META_ERROR: "tests failed" });
        let first = log.record(failed).unwrap();

        let mut retry = transition(Some("aaa"), "implement", SyncStatus::Completed);
        retry.metadata = json!({ META_RETRY_OF: first });
        log.record(retry).unwrap();

        let records = log.latest_for(RecordFilter::All).unwrap();
        assert_eq!(records.len(), 2, "retries append, never overwrite");
        assert_eq!(
            records[0].metadata.get(META_RETRY_OF).and_then(|v| v.as_str()),
            Some(first.as_str())
        );
        assert_eq!(records[1].error_detail(), Some("tests failed"));
    }

    #[test]
    fn test_shared_visibility_across_handles() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sync.db");

        let mut writer = SyncLog::open(&path).unwrap();
        let reader = SyncLog::open(&path).unwrap();

        writer
            .record(transition(Some("aaa"), "tasks", SyncStatus::Completed))
            .unwrap();

        // Visible to the other handle immediately after the write commits.
        let seen = reader.latest_for(RecordFilter::All).unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].context_id.as_deref(), Some("aaa"));
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sync.db");

        {
            let mut log = SyncLog::open(&path).unwrap();
            log.record(transition(Some("aaa"), "specify", SyncStatus::Completed))
                .unwrap();
        }

        let log = SyncLog::open(&path).unwrap();
        let records = log.latest_for(RecordFilter::All).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].phase, "specify");
    }

    #[test]
    fn test_known_roots_newest_per_context() {
        let mut log = SyncLog::open_in_memory().unwrap();
        let mut a1 = transition(Some("aaa"), "specify", SyncStatus::Completed);
        a1.metadata = json!({ META_ROOT: "/work/old" });
        log.record(a1).unwrap();
        let mut a2 = transition(Some("aaa"), "plan", SyncStatus::Completed);
        a2.metadata = json!({ META_ROOT: "/work/repo" });
        log.record(a2).unwrap();
        let mut b = transition(Some("bbb"), "specify", SyncStatus::Completed);
        b.metadata = json!({ META_ROOT: "/work/repo-wt" });
        log.record(b).unwrap();

        let mut roots = log.known_roots().unwrap();
        roots.sort();
        assert_eq!(
            roots,
            vec![
                (Some("aaa".to_string()), PathBuf::from("/work/repo")),
                (Some("bbb".to_string()), PathBuf::from("/work/repo-wt")),
            ]
        );
    }
}
