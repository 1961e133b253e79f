//! Append-only audit ledger with tamper-evidence checksums, plus the file
//! hash registry backing integrity verification.
//!
//! Every entry carries `checksum = sha256(action|path|details|user)` truncated
//! to 16 hex characters. The timestamp is excluded from the hash input so
//! verification does not depend on how the storage layer formats timestamps.
//! Logging is best-effort: a failed insert is counted and warned about, never
//! surfaced to the operation being documented.

use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::HardenError;
use crate::paths;
use crate::permissions::{current_mode, mode_octal};
use crate::store::{self, Store};

/// Entries dated before this day predate checksum stamping and are exempt
/// from tamper classification when the checksum column is empty.
pub const LEGACY_CUTOVER: &str = "2025-12-15";

const CHECKSUM_HEX_LEN: usize = 16;
const HASH_CHUNK: usize = 64 * 1024;

// ── Severity ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }
}

impl FromStr for Severity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "info" => Ok(Severity::Info),
            "warning" => Ok(Severity::Warning),
            "error" => Ok(Severity::Error),
            "critical" => Ok(Severity::Critical),
            other => Err(anyhow::anyhow!("unknown severity: {other}")),
        }
    }
}

// ── Data models ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct AuditLogEntry {
    pub id: i64,
    pub timestamp: String,
    pub action_type: String,
    pub user: String,
    pub file_path: Option<String>,
    pub details: String,
    pub severity: Severity,
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IntegrityReport {
    pub status: String,
    pub is_valid: bool,
    pub hash_match: bool,
    pub size_match: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditIntegrityReport {
    pub total: usize,
    pub valid: usize,
    pub tampered: usize,
    pub legacy: usize,
    pub integrity_valid: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CiaSection {
    pub ok: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CiaStatus {
    pub confidentiality: CiaSection,
    pub integrity: CiaSection,
    pub availability: CiaSection,
    pub overall_ok: bool,
}

// ── Ledger ──────────────────────────────────────────────────────────────────

pub struct AuditLedger {
    store: Arc<Store>,
    dropped_events: AtomicU64,
}

impl AuditLedger {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            dropped_events: AtomicU64::new(0),
        }
    }

    /// Append one audit entry. Returns false instead of raising when the
    /// insert fails; the drop is counted and visible via [`dropped_events`].
    ///
    /// [`dropped_events`]: AuditLedger::dropped_events
    pub fn log_event(
        &self,
        action_type: &str,
        file_path: Option<&Path>,
        details: &str,
        severity: Severity,
    ) -> bool {
        let user = current_user();
        let path_str = file_path.map(|p| p.display().to_string());
        let checksum = entry_checksum(action_type, path_str.as_deref(), details, &user);

        let result = {
            let conn = self.store.conn();
            conn.execute(
                "INSERT INTO audit_logs (timestamp, action_type, user, file_path, details, severity, checksum)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    store::now_rfc3339(),
                    action_type,
                    user,
                    path_str,
                    details,
                    severity.as_str(),
                    checksum
                ],
            )
        };

        match result {
            Ok(_) => true,
            Err(e) => {
                self.dropped_events.fetch_add(1, Ordering::Relaxed);
                warn!(action_type, error = %e, "audit event dropped");
                false
            }
        }
    }

    /// Count of events lost to insert failures since this ledger was built.
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Most-recent-first read, optionally filtered by action type and
    /// severity.
    pub fn get_audit_logs(
        &self,
        limit: usize,
        action_type: Option<&str>,
        severity: Option<Severity>,
    ) -> Result<Vec<AuditLogEntry>, HardenError> {
        let conn = self.store.conn();
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, action_type, user, file_path, details, severity, checksum
             FROM audit_logs
             WHERE (?1 IS NULL OR action_type = ?1)
               AND (?2 IS NULL OR severity = ?2)
             ORDER BY timestamp DESC, id DESC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            params![action_type, severity.map(|s| s.as_str()), limit as i64],
            |row| {
                Ok(AuditLogEntry {
                    id: row.get(0)?,
                    timestamp: row.get(1)?,
                    action_type: row.get(2)?,
                    user: row.get(3)?,
                    file_path: row.get(4)?,
                    details: row.get(5)?,
                    severity: row
                        .get::<_, String>(6)?
                        .parse()
                        .unwrap_or(Severity::Info),
                    checksum: row.get(7)?,
                })
            },
        )?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    // ── File hash registry ──────────────────────────────────────────────────

    /// Compute sha256 and size for `path` and upsert its registry row.
    /// Best-effort like `log_event`; an unreadable file returns false.
    pub fn register_file_hash(&self, path: &Path, permission: Option<u32>) -> bool {
        let (hash, size) = match sha256_file(path) {
            Ok(pair) => pair,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot hash file for registry");
                return false;
            }
        };
        let permissions = permission
            .map(mode_octal)
            .or_else(|| current_mode(path).ok().map(mode_octal))
            .unwrap_or_default();

        let result = {
            let conn = self.store.conn();
            conn.execute(
                "INSERT INTO file_hashes (file_path, hash_sha256, permissions, file_size, last_checked, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'verified')
                 ON CONFLICT(file_path) DO UPDATE SET
                     hash_sha256 = excluded.hash_sha256,
                     permissions = excluded.permissions,
                     file_size = excluded.file_size,
                     last_checked = excluded.last_checked,
                     status = 'verified'",
                params![
                    path.display().to_string(),
                    hash,
                    permissions,
                    size as i64,
                    store::now_rfc3339()
                ],
            )
        };
        match result {
            Ok(_) => {
                debug!(path = %path.display(), "file hash registered");
                true
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot upsert file hash");
                false
            }
        }
    }

    /// Compare the current on-disk hash/size against the registered baseline.
    /// Any mismatch is itself logged as a critical `integrity_violation`.
    pub fn verify_file_integrity(&self, path: &Path) -> Result<IntegrityReport, HardenError> {
        let path_str = path.display().to_string();
        let registered: Option<(String, i64)> = {
            let conn = self.store.conn();
            conn.query_row(
                "SELECT hash_sha256, file_size FROM file_hashes WHERE file_path = ?1",
                params![path_str],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
        };

        let Some((expected_hash, expected_size)) = registered else {
            return Ok(IntegrityReport {
                status: "not_registered".to_string(),
                is_valid: false,
                hash_match: false,
                size_match: false,
            });
        };

        if !path.exists() {
            self.mark_status(&path_str, "missing");
            self.log_event(
                "integrity_violation",
                Some(path),
                "Registered file is missing",
                Severity::Critical,
            );
            return Ok(IntegrityReport {
                status: "missing".to_string(),
                is_valid: false,
                hash_match: false,
                size_match: false,
            });
        }

        let (actual_hash, actual_size) = sha256_file(path)?;
        let hash_match = actual_hash == expected_hash;
        let size_match = actual_size as i64 == expected_size;
        let is_valid = hash_match && size_match;
        let status = if is_valid { "verified" } else { "modified" };
        self.mark_status(&path_str, status);

        if !is_valid {
            self.log_event(
                "integrity_violation",
                Some(path),
                &format!(
                    "Hash match: {hash_match}, size match: {size_match} (expected {expected_size} bytes, found {actual_size})"
                ),
                Severity::Critical,
            );
        }

        Ok(IntegrityReport {
            status: status.to_string(),
            is_valid,
            hash_match,
            size_match,
        })
    }

    fn mark_status(&self, path_str: &str, status: &str) {
        let conn = self.store.conn();
        let result = conn.execute(
            "UPDATE file_hashes SET status = ?1, last_checked = ?2 WHERE file_path = ?3",
            params![status, store::now_rfc3339(), path_str],
        );
        if let Err(e) = result {
            warn!(path = path_str, error = %e, "cannot update registry status");
        }
    }

    // ── Self-verification ───────────────────────────────────────────────────

    /// Run the store's native consistency check. A failure is logged as a
    /// critical `database_corruption` event (which may itself be dropped if
    /// the database is unusable).
    pub fn verify_database_integrity(&self) -> bool {
        match self.store.integrity_check() {
            Ok(true) => true,
            Ok(false) => {
                self.log_event(
                    "database_corruption",
                    None,
                    "Store consistency check reported corruption",
                    Severity::Critical,
                );
                false
            }
            Err(e) => {
                self.log_event(
                    "database_corruption",
                    None,
                    &format!("Store consistency check failed: {e}"),
                    Severity::Critical,
                );
                false
            }
        }
    }

    /// Recompute checksums over the most recent `limit` entries. Entries
    /// without a checksum dated before [`LEGACY_CUTOVER`] are classified
    /// legacy, not tampered.
    pub fn verify_audit_log_integrity(
        &self,
        limit: usize,
    ) -> Result<AuditIntegrityReport, HardenError> {
        let entries = self.get_audit_logs(limit, None, None)?;
        let mut valid = 0usize;
        let mut tampered = 0usize;
        let mut legacy = 0usize;

        for entry in &entries {
            let stored = entry.checksum.as_deref().unwrap_or("");
            let predates_cutover = entry
                .timestamp
                .get(..LEGACY_CUTOVER.len())
                .map(|day| day < LEGACY_CUTOVER)
                .unwrap_or(true);
            if stored.is_empty() || predates_cutover {
                legacy += 1;
                continue;
            }
            let recomputed = entry_checksum(
                &entry.action_type,
                entry.file_path.as_deref(),
                &entry.details,
                &entry.user,
            );
            if recomputed == stored {
                valid += 1;
            } else {
                tampered += 1;
            }
        }

        Ok(AuditIntegrityReport {
            total: entries.len(),
            valid,
            tampered,
            legacy,
            integrity_valid: tampered == 0,
        })
    }

    /// Aggregate confidentiality, integrity and availability into one
    /// report. Never fails; problems degrade the relevant section instead.
    pub fn get_cia_status(&self) -> CiaStatus {
        let confidentiality = match self.store.db_path() {
            None => CiaSection {
                ok: true,
                detail: "in-memory store, no file exposure".to_string(),
            },
            Some(db) => match current_mode(db) {
                Ok(mode) if mode & 0o777 == 0o600 => CiaSection {
                    ok: true,
                    detail: format!("store file is owner-only ({})", mode_octal(mode)),
                },
                Ok(mode) => CiaSection {
                    ok: false,
                    detail: format!("store file mode is {}, expected 600", mode_octal(mode)),
                },
                Err(e) => CiaSection {
                    ok: false,
                    detail: format!("cannot read store file mode: {e}"),
                },
            },
        };

        let db_ok = self.verify_database_integrity();
        let audit = self.verify_audit_log_integrity(500);
        let integrity = match audit {
            Ok(report) if db_ok && report.integrity_valid => CiaSection {
                ok: true,
                detail: format!(
                    "{} entries checked, {} legacy, none tampered",
                    report.total, report.legacy
                ),
            },
            Ok(report) => CiaSection {
                ok: false,
                detail: format!(
                    "database ok: {db_ok}, tampered entries: {}",
                    report.tampered
                ),
            },
            Err(e) => CiaSection {
                ok: false,
                detail: format!("audit verification failed: {e}"),
            },
        };

        let availability = if self.store.is_reachable() {
            CiaSection {
                ok: true,
                detail: "store is reachable".to_string(),
            }
        } else {
            CiaSection {
                ok: false,
                detail: "store is not responding".to_string(),
            }
        };

        let overall_ok = confidentiality.ok && integrity.ok && availability.ok;
        CiaStatus {
            confidentiality,
            integrity,
            availability,
            overall_ok,
        }
    }

    /// Write `<path>.sha256` containing `"{hex}  {basename}\n"`, owner-only.
    pub fn create_checksum_file(&self, path: &Path) -> Result<PathBuf, HardenError> {
        let (hash, _) = sha256_file(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let mut sidecar_name = path.as_os_str().to_os_string();
        sidecar_name.push(".sha256");
        let sidecar = PathBuf::from(sidecar_name);
        fs::write(&sidecar, format!("{hash}  {name}\n"))?;
        paths::restrict_file_permissions(&sidecar);
        Ok(sidecar)
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────────

/// `sha256(action|path|details|user)` truncated to 16 hex characters. The
/// timestamp never participates.
pub fn entry_checksum(
    action_type: &str,
    file_path: Option<&str>,
    details: &str,
    user: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(action_type.as_bytes());
    hasher.update(b"|");
    hasher.update(file_path.unwrap_or("").as_bytes());
    hasher.update(b"|");
    hasher.update(details.as_bytes());
    hasher.update(b"|");
    hasher.update(user.as_bytes());
    let mut hex = hex::encode(hasher.finalize());
    hex.truncate(CHECKSUM_HEX_LEN);
    hex
}

/// Streaming sha256 of a file, returning `(hex_digest, size_bytes)`.
pub fn sha256_file(path: &Path) -> io::Result<(String, u64)> {
    let file = File::open(path)?;
    let mut reader = io::BufReader::with_capacity(HASH_CHUNK, file);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_CHUNK];
    let mut size = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((hex::encode(hasher.finalize()), size))
}

/// Acting user for audit attribution.
pub fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn ledger() -> AuditLedger {
        AuditLedger::new(Arc::new(Store::open_in_memory().unwrap()))
    }

    #[test]
    fn checksum_is_16_hex_and_field_sensitive() {
        let a = entry_checksum("chmod", Some("/tmp/a"), "d", "root");
        assert_eq!(a.len(), 16);
        assert!(a.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_eq!(a, entry_checksum("chmod", Some("/tmp/a"), "d", "root"));
        assert_ne!(a, entry_checksum("chmod", Some("/tmp/b"), "d", "root"));
        assert_ne!(a, entry_checksum("chmod", None, "d", "root"));
        assert_ne!(a, entry_checksum("chmod", Some("/tmp/a"), "d", "admin"));
    }

    #[test]
    fn log_event_round_trips_through_the_store() {
        let ledger = ledger();
        assert!(ledger.log_event(
            "permission_changed",
            Some(Path::new("/tmp/x")),
            "777 -> 644",
            Severity::Info
        ));
        let entries = ledger.get_audit_logs(10, None, None).unwrap();
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.action_type, "permission_changed");
        assert_eq!(entry.file_path.as_deref(), Some("/tmp/x"));
        assert_eq!(
            entry.checksum.as_deref().unwrap(),
            entry_checksum(
                "permission_changed",
                Some("/tmp/x"),
                "777 -> 644",
                &current_user()
            )
        );
    }

    #[test]
    fn filters_apply_to_action_and_severity() {
        let ledger = ledger();
        ledger.log_event("a", None, "", Severity::Info);
        ledger.log_event("b", None, "", Severity::Critical);
        ledger.log_event("b", None, "", Severity::Info);

        assert_eq!(ledger.get_audit_logs(10, Some("b"), None).unwrap().len(), 2);
        assert_eq!(
            ledger
                .get_audit_logs(10, None, Some(Severity::Critical))
                .unwrap()
                .len(),
            1
        );
        assert_eq!(
            ledger
                .get_audit_logs(10, Some("b"), Some(Severity::Info))
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn tampered_entries_are_counted() {
        let ledger = ledger();
        for i in 0..3 {
            ledger.log_event("chmod", None, &format!("run {i}"), Severity::Info);
        }
        {
            let conn = ledger.store.conn();
            conn.execute(
                "UPDATE audit_logs SET details = 'rewritten' WHERE id = 2",
                [],
            )
            .unwrap();
        }
        let report = ledger.verify_audit_log_integrity(500).unwrap();
        assert_eq!(report.total, 3);
        assert_eq!(report.valid, 2);
        assert_eq!(report.tampered, 1);
        assert_eq!(report.legacy, 0);
        assert!(!report.integrity_valid);
    }

    #[test]
    fn legacy_entries_do_not_count_as_tampered() {
        let ledger = ledger();
        {
            let conn = ledger.store.conn();
            conn.execute(
                "INSERT INTO audit_logs (timestamp, action_type, user, file_path, details, severity, checksum)
                 VALUES ('2024-01-05T00:00:00.000000Z', 'chmod', 'root', NULL, 'old row', 'info', NULL)",
                [],
            )
            .unwrap();
        }
        ledger.log_event("chmod", None, "new row", Severity::Info);

        let report = ledger.verify_audit_log_integrity(500).unwrap();
        assert_eq!(report.total, 2);
        assert_eq!(report.legacy, 1);
        assert_eq!(report.valid, 1);
        assert_eq!(report.tampered, 0);
        assert!(report.integrity_valid);
    }

    #[test]
    fn registered_file_verifies_then_reports_modification() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("config.toml");
        fs::write(&target, b"v = 1").unwrap();

        let ledger = ledger();
        assert!(ledger.register_file_hash(&target, Some(0o644)));

        let report = ledger.verify_file_integrity(&target).unwrap();
        assert_eq!(report.status, "verified");
        assert!(report.is_valid);

        fs::write(&target, b"v = 2 // tampered").unwrap();
        let report = ledger.verify_file_integrity(&target).unwrap();
        assert_eq!(report.status, "modified");
        assert!(!report.is_valid);
        assert!(!report.hash_match);

        let violations = ledger
            .get_audit_logs(10, Some("integrity_violation"), None)
            .unwrap();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].severity, Severity::Critical);
    }

    #[test]
    fn unregistered_and_missing_files_report_their_status() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("ghost.txt");
        let ledger = ledger();

        let report = ledger.verify_file_integrity(&target).unwrap();
        assert_eq!(report.status, "not_registered");

        fs::write(&target, b"here").unwrap();
        ledger.register_file_hash(&target, None);
        fs::remove_file(&target).unwrap();

        let report = ledger.verify_file_integrity(&target).unwrap();
        assert_eq!(report.status, "missing");
        assert!(!report.is_valid);
    }

    #[test]
    fn dropped_events_are_counted_not_raised() {
        let ledger = ledger();
        {
            let conn = ledger.store.conn();
            conn.execute_batch("DROP TABLE audit_logs").unwrap();
        }
        assert!(!ledger.log_event("chmod", None, "", Severity::Info));
        assert_eq!(ledger.dropped_events(), 1);
    }

    #[test]
    fn cia_status_is_green_on_a_fresh_store() {
        let ledger = ledger();
        ledger.log_event("startup", None, "", Severity::Info);
        let status = ledger.get_cia_status();
        assert!(status.confidentiality.ok);
        assert!(status.integrity.ok);
        assert!(status.availability.ok);
        assert!(status.overall_ok);
    }

    #[test]
    fn checksum_sidecar_has_the_two_space_format() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("archive.tar.gz");
        fs::write(&target, b"not really an archive").unwrap();

        let ledger = ledger();
        let sidecar = ledger.create_checksum_file(&target).unwrap();
        assert_eq!(sidecar, dir.path().join("archive.tar.gz.sha256"));

        let content = fs::read_to_string(&sidecar).unwrap();
        let (hash, _) = sha256_file(&target).unwrap();
        assert_eq!(content, format!("{hash}  archive.tar.gz\n"));
    }
}
