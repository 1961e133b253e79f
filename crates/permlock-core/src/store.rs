//! Embedded SQLite store shared by the audit ledger, the rate limiter and
//! the permission change history.
//!
//! The connection is opened once by the composition root and handed to each
//! service as an `Arc<Store>`; no service opens its own handle. All files
//! the store creates (the database plus its `-wal`/`-shm` siblings) are
//! clamped to owner-only access.

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::paths::restrict_file_permissions;

const SCHEMA: &str = r#"
PRAGMA journal_mode=WAL;
PRAGMA synchronous=NORMAL;
PRAGMA foreign_keys=ON;

CREATE TABLE IF NOT EXISTS audit_logs (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  timestamp TEXT NOT NULL,
  action_type TEXT NOT NULL,
  user TEXT NOT NULL,
  file_path TEXT,
  details TEXT,
  severity TEXT NOT NULL DEFAULT 'info',
  checksum TEXT
);

CREATE TABLE IF NOT EXISTS file_hashes (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  file_path TEXT NOT NULL UNIQUE,
  hash_sha256 TEXT NOT NULL,
  permissions TEXT,
  file_size INTEGER,
  last_checked TEXT NOT NULL,
  status TEXT NOT NULL DEFAULT 'verified'
);

CREATE TABLE IF NOT EXISTS rate_limit_attempts (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  key TEXT NOT NULL,
  timestamp TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS permission_changes (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  file_path TEXT NOT NULL,
  file_name TEXT NOT NULL,
  old_permission TEXT NOT NULL,
  new_permission TEXT NOT NULL,
  risk_level TEXT NOT NULL,
  changed_at TEXT NOT NULL,
  reverted INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_logs(timestamp);
CREATE INDEX IF NOT EXISTS idx_audit_action ON audit_logs(action_type);
CREATE INDEX IF NOT EXISTS idx_file_path ON file_hashes(file_path);
CREATE INDEX IF NOT EXISTS idx_rate_key ON rate_limit_attempts(key);
CREATE INDEX IF NOT EXISTS idx_perm_path ON permission_changes(file_path);
"#;

pub struct Store {
    conn: Mutex<Connection>,
    db_path: Option<PathBuf>,
}

impl Store {
    /// Open (or create) the database at `path`, apply the schema, and clamp
    /// file permissions.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        let store = Self {
            conn: Mutex::new(conn),
            db_path: Some(path.to_path_buf()),
        };
        store.restrict_db_files();
        Ok(store)
    }

    /// In-memory database with the full schema applied. No files, no
    /// persistence; useful for tests and dry runs.
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            db_path: None,
        })
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Re-clamp the database file and its WAL/shared-memory siblings to
    /// owner-only. The siblings appear only after the first write, so this
    /// is safe to call repeatedly.
    pub fn restrict_db_files(&self) {
        if let Some(db) = &self.db_path {
            restrict_file_permissions(db);
            for suffix in ["-wal", "-shm"] {
                let sibling = PathBuf::from(format!("{}{}", db.display(), suffix));
                if sibling.exists() {
                    restrict_file_permissions(&sibling);
                }
            }
        }
    }

    /// Native consistency check. Runs both `integrity_check` and
    /// `quick_check`; either reporting anything other than "ok" fails.
    pub fn integrity_check(&self) -> anyhow::Result<bool> {
        let conn = self.conn();
        for pragma in ["PRAGMA integrity_check", "PRAGMA quick_check"] {
            let verdict: String = conn.query_row(pragma, [], |row| row.get(0))?;
            if verdict.to_lowercase() != "ok" {
                warn!(pragma, verdict = %verdict, "database consistency check failed");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Cheap liveness probe for availability reporting.
    pub fn is_reachable(&self) -> bool {
        self.conn()
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .is_ok()
    }
}

/// Fixed-width RFC 3339 UTC timestamp. Lexicographic order equals
/// chronological order, which the rate limiter's textual comparisons
/// depend on.
pub(crate) fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn format_rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_rfc3339(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
