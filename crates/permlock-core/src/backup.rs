//! Backup and restore engine.
//!
//! Content backups are gzip-compressed tar archives named
//! `backup_{YYYYMMDDTHHMMSS}.tar.gz` holding payload files by base name plus
//! a `manifest.json` describing hash, size and permission per file, with a
//! detached `<archive>.sha256` sidecar. Permission-only backups are plain
//! JSON files in the permission log directory and feed the append-only
//! change history in the store.
//!
//! Restore extraction joins each archive entry name onto the restore root
//! and rejects any entry that escapes it after lexical normalization. Writes
//! go through a staging file in the target directory followed by an atomic
//! rename.

use chrono::Utc;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tar::{Archive, Builder, Header};
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{sha256_file, AuditLedger, Severity};
use crate::error::HardenError;
use crate::paths;
use crate::permissions::{
    apply_mode, current_mode, is_symlink, mode_octal, mode_symbolic, parse_mode, RiskLevel,
};
use crate::settings::BackupSettings;
use crate::store::{self, Store};

const MANIFEST_NAME: &str = "manifest.json";
const ARCHIVE_PREFIX: &str = "backup_";
const ARCHIVE_SUFFIX: &str = ".tar.gz";

/// Staging file prefix used so orphans from a crash can be swept on the
/// next restore into the same directory.
const STAGING_PREFIX: &str = ".permlock_stage_";

/// Minimum free space beyond the payload size before a restore writes (bytes).
const MIN_FREE_SPACE_BYTES: u64 = 10 * 1024 * 1024; // 10 MiB

// ── Data models ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub path: String,
    pub sha256: String,
    pub size: u64,
    pub permission_octal: String,
    pub permission_symbolic: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupManifest {
    pub created_at: String,
    pub note: String,
    pub files: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionChange {
    pub filepath: String,
    pub filename: String,
    pub old_permission: String,
    pub new_permission: String,
    pub risk_level: RiskLevel,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionBackup {
    pub created_at: String,
    pub note: String,
    pub total_files: usize,
    pub changes: Vec<PermissionChange>,
}

/// One row of the append-only permission change history.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeRecord {
    pub id: i64,
    pub file_path: String,
    pub file_name: String,
    pub old_permission: String,
    pub new_permission: String,
    pub risk_level: RiskLevel,
    pub changed_at: String,
    pub reverted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreErrorKind {
    PathTraversalBlocked,
    HashMismatch,
    MissingFromArchive,
    Io,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreError {
    pub entry: String,
    pub kind: RestoreErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub success: bool,
    pub restored: Vec<String>,
    pub errors: Vec<RestoreError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupInfo {
    pub path: PathBuf,
    pub created_at: String,
    pub note: String,
    pub file_count: usize,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupValidation {
    pub archive: PathBuf,
    pub sidecar_ok: Option<bool>,
    pub manifest_ok: bool,
    pub entries_expected: usize,
    pub entries_present: usize,
    pub missing: Vec<String>,
    pub valid: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PreviewEntry {
    pub entry: String,
    pub target: PathBuf,
    pub exists: bool,
    pub would_block: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestorePreview {
    pub archive: PathBuf,
    pub restore_dir: PathBuf,
    pub restore_dir_exists: bool,
    pub entries: Vec<PreviewEntry>,
    pub conflicts: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PermissionReplayReport {
    pub applied: usize,
    pub skipped_missing: usize,
    pub errors: Vec<String>,
}

// ── Engine ──────────────────────────────────────────────────────────────────

pub struct BackupEngine {
    backups_dir: PathBuf,
    permission_log_dir: PathBuf,
    store: Arc<Store>,
    audit: Arc<AuditLedger>,
    history_limit: usize,
    note_prefix: String,
}

impl BackupEngine {
    pub fn new(
        backups_dir: PathBuf,
        permission_log_dir: PathBuf,
        store: Arc<Store>,
        audit: Arc<AuditLedger>,
        settings: &BackupSettings,
    ) -> Self {
        Self {
            backups_dir,
            permission_log_dir,
            store,
            audit,
            history_limit: settings.history_limit,
            note_prefix: settings.note_prefix.clone(),
        }
    }

    fn effective_note(&self, note: &str) -> String {
        if self.note_prefix.is_empty() {
            note.to_string()
        } else {
            format!("{}{}", self.note_prefix, note)
        }
    }

    // ── Content backups ─────────────────────────────────────────────────────

    /// Archive every existing regular file in `inputs` together with a
    /// manifest, write the checksum sidecar, and return the archive path.
    /// Missing inputs are skipped with a warning; symlinks are never
    /// followed.
    pub fn create_backup(&self, inputs: &[PathBuf], note: &str) -> Result<PathBuf, HardenError> {
        fs::create_dir_all(&self.backups_dir)?;
        paths::restrict_dir_permissions(&self.backups_dir);

        let mut entries = Vec::new();
        for input in inputs {
            let meta = match fs::symlink_metadata(input) {
                Ok(m) => m,
                Err(e) => {
                    warn!(path = %input.display(), error = %e, "skipping missing backup input");
                    continue;
                }
            };
            if meta.file_type().is_symlink() {
                warn!(path = %input.display(), "skipping symlink backup input");
                continue;
            }
            if !meta.is_file() {
                warn!(path = %input.display(), "skipping non-file backup input");
                continue;
            }
            let (sha256, size) = sha256_file(input)?;
            let mode = current_mode(input).unwrap_or(0);
            entries.push(ManifestEntry {
                path: input.display().to_string(),
                sha256,
                size,
                permission_octal: mode_octal(mode),
                permission_symbolic: mode_symbolic(mode),
            });
        }
        if entries.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "no existing files to back up",
            )
            .into());
        }

        let manifest = BackupManifest {
            created_at: store::now_rfc3339(),
            note: self.effective_note(note),
            files: entries,
        };
        let manifest_bytes = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let archive_path = self.unique_archive_path();
        let staging_path = self
            .backups_dir
            .join(format!("{}{}", STAGING_PREFIX, Uuid::new_v4()));

        {
            let file = File::create(&staging_path)?;
            let encoder = GzEncoder::new(file, Compression::default());
            let mut tar = Builder::new(encoder);

            let mut header = Header::new_gnu();
            header.set_size(manifest_bytes.len() as u64);
            header.set_mode(0o600);
            header.set_cksum();
            tar.append_data(&mut header, MANIFEST_NAME, manifest_bytes.as_slice())?;

            for entry in &manifest.files {
                let source = Path::new(&entry.path);
                let name = source
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| entry.path.clone());
                tar.append_path_with_name(source, name)?;
            }

            let encoder = tar.into_inner()?;
            let file = encoder.finish()?;
            file.sync_all()?;
        }
        fsync_dir(&self.backups_dir);
        fs::rename(&staging_path, &archive_path)?;
        paths::restrict_file_permissions(&archive_path);

        self.audit.create_checksum_file(&archive_path)?;

        info!(
            archive = %archive_path.display(),
            files = manifest.files.len(),
            "backup created"
        );
        self.audit.log_event(
            "backup_created",
            Some(&archive_path),
            &format!("{} file(s), note: {}", manifest.files.len(), manifest.note),
            Severity::Info,
        );
        Ok(archive_path)
    }

    fn unique_archive_path(&self) -> PathBuf {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S");
        let base = self
            .backups_dir
            .join(format!("{ARCHIVE_PREFIX}{stamp}{ARCHIVE_SUFFIX}"));
        if !base.exists() {
            return base;
        }
        let mut counter = 1u32;
        loop {
            let candidate = self
                .backups_dir
                .join(format!("{ARCHIVE_PREFIX}{stamp}_{counter}{ARCHIVE_SUFFIX}"));
            if !candidate.exists() {
                return candidate;
            }
            counter += 1;
        }
    }

    /// Extract the embedded manifest without unpacking anything else.
    pub fn read_manifest(&self, archive_path: &Path) -> Result<BackupManifest, HardenError> {
        let file = File::open(archive_path)?;
        let mut archive = Archive::new(GzDecoder::new(file));
        for entry in archive.entries()? {
            let mut entry = entry?;
            if entry.path()?.as_ref() == Path::new(MANIFEST_NAME) {
                let mut raw = Vec::new();
                entry.read_to_end(&mut raw)?;
                return serde_json::from_slice(&raw)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e).into());
            }
        }
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} carries no manifest", archive_path.display()),
        )
        .into())
    }

    /// Unpack `archive_path` into `restore_dir`. Every entry name is joined
    /// onto the restore root and rejected if it lexically escapes it; blocked
    /// entries become per-entry errors and the rest of the archive still
    /// restores. Extracted content is verified against the manifest hash.
    pub fn restore_backup(
        &self,
        archive_path: &Path,
        restore_dir: &Path,
    ) -> Result<RestoreReport, HardenError> {
        let manifest = self.read_manifest(archive_path)?;

        fs::create_dir_all(restore_dir)?;
        let root = restore_dir.canonicalize()?;
        cleanup_staging_in_dir(&root);

        let total_bytes: u64 = manifest.files.iter().map(|f| f.size).sum();
        check_disk_space(&root, total_bytes)?;

        let by_name: HashMap<String, &ManifestEntry> = manifest
            .files
            .iter()
            .map(|f| {
                let name = Path::new(&f.path)
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| f.path.clone());
                (name, f)
            })
            .collect();

        let mut restored = Vec::new();
        let mut errors = Vec::new();

        let file = File::open(archive_path)?;
        let mut archive = Archive::new(GzDecoder::new(file));
        for entry in archive.entries()? {
            let mut entry = entry?;
            let declared = entry.path()?.to_string_lossy().to_string();
            if declared == MANIFEST_NAME {
                continue;
            }

            let Some(target) = contained_join(&root, &declared) else {
                warn!(entry = declared, root = %root.display(), "blocked archive entry escaping restore root");
                self.audit.log_event(
                    "path_traversal_blocked",
                    None,
                    &format!("Archive entry {declared} resolves outside {}", root.display()),
                    Severity::Warning,
                );
                errors.push(RestoreError {
                    entry: declared,
                    kind: RestoreErrorKind::PathTraversalBlocked,
                    message: "entry resolves outside the restore root".to_string(),
                });
                continue;
            };

            match self.extract_entry(&mut entry, &target, by_name.get(declared.as_str()).copied()) {
                Ok(()) => restored.push(declared),
                Err(err) => errors.push(RestoreError {
                    entry: declared,
                    kind: err.kind,
                    message: err.message,
                }),
            }
        }

        for (name, _) in &by_name {
            let present = restored.iter().any(|r| r == name)
                || errors.iter().any(|e| &e.entry == name);
            if !present {
                errors.push(RestoreError {
                    entry: name.clone(),
                    kind: RestoreErrorKind::MissingFromArchive,
                    message: "declared in manifest but absent from archive".to_string(),
                });
            }
        }

        let success = errors.is_empty();
        let severity = if success { Severity::Info } else { Severity::Warning };
        self.audit.log_event(
            "backup_restored",
            Some(archive_path),
            &format!(
                "Restored {} file(s) into {}, {} error(s)",
                restored.len(),
                root.display(),
                errors.len()
            ),
            severity,
        );
        Ok(RestoreReport {
            success,
            restored,
            errors,
        })
    }

    fn extract_entry(
        &self,
        entry: &mut tar::Entry<'_, GzDecoder<File>>,
        target: &Path,
        manifest_entry: Option<&ManifestEntry>,
    ) -> Result<(), RestoreError> {
        let describe = |kind: RestoreErrorKind, message: String| RestoreError {
            entry: target.display().to_string(),
            kind,
            message,
        };

        let parent = target
            .parent()
            .ok_or_else(|| describe(RestoreErrorKind::Io, "target has no parent".to_string()))?;
        fs::create_dir_all(parent)
            .map_err(|e| describe(RestoreErrorKind::Io, format!("create parent: {e}")))?;

        let staging = parent.join(format!("{}{}", STAGING_PREFIX, Uuid::new_v4()));
        let write_result = (|| -> io::Result<()> {
            let mut file = File::create(&staging)?;
            io::copy(entry, &mut file)?;
            file.sync_all()?;
            Ok(())
        })();
        if let Err(e) = write_result {
            let _ = fs::remove_file(&staging);
            return Err(describe(RestoreErrorKind::Io, format!("stage write: {e}")));
        }
        fsync_dir(parent);
        if let Err(e) = fs::rename(&staging, target) {
            let _ = fs::remove_file(&staging);
            return Err(describe(RestoreErrorKind::Io, format!("rename: {e}")));
        }

        if let Some(manifest_entry) = manifest_entry {
            if let Ok(mode) = parse_mode(&manifest_entry.permission_octal) {
                if let Err(e) = apply_mode(target, mode) {
                    return Err(describe(
                        RestoreErrorKind::Io,
                        format!("apply permission {}: {e}", manifest_entry.permission_octal),
                    ));
                }
            }
            let (actual, _) = sha256_file(target)
                .map_err(|e| describe(RestoreErrorKind::Io, format!("verify hash: {e}")))?;
            if actual != manifest_entry.sha256 {
                return Err(describe(
                    RestoreErrorKind::HashMismatch,
                    format!("expected {}, got {actual}", manifest_entry.sha256),
                ));
            }
        }
        Ok(())
    }

    // ── Introspection ───────────────────────────────────────────────────────

    /// Newest-first listing of archives in the backups directory, capped at
    /// the configured history limit. Archives with an unreadable manifest
    /// are skipped with a warning.
    pub fn list_backups(&self) -> Result<Vec<BackupInfo>, HardenError> {
        let mut infos = Vec::new();
        let entries = match fs::read_dir(&self.backups_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(infos),
            Err(e) => return Err(e.into()),
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with(ARCHIVE_PREFIX) || !name.ends_with(ARCHIVE_SUFFIX) {
                continue;
            }
            let path = entry.path();
            let size_bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);
            match self.read_manifest(&path) {
                Ok(manifest) => infos.push(BackupInfo {
                    path,
                    created_at: manifest.created_at,
                    note: manifest.note,
                    file_count: manifest.files.len(),
                    size_bytes,
                }),
                Err(e) => {
                    warn!(archive = %path.display(), error = %e, "skipping archive with unreadable manifest");
                }
            }
        }
        infos.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        infos.truncate(self.history_limit);
        Ok(infos)
    }

    /// Check an archive without extracting: sidecar checksum, manifest
    /// readability and that every declared file is present.
    pub fn validate_backup(&self, archive_path: &Path) -> Result<BackupValidation, HardenError> {
        let mut sidecar_name = archive_path.as_os_str().to_os_string();
        sidecar_name.push(".sha256");
        let sidecar_path = PathBuf::from(sidecar_name);
        let sidecar_ok = if sidecar_path.exists() {
            let recorded = fs::read_to_string(&sidecar_path)?;
            let recorded_hash = recorded.split_whitespace().next().unwrap_or("");
            let (actual, _) = sha256_file(archive_path)?;
            Some(recorded_hash == actual)
        } else {
            None
        };

        let (manifest_ok, expected_names) = match self.read_manifest(archive_path) {
            Ok(manifest) => {
                let names: Vec<String> = manifest
                    .files
                    .iter()
                    .map(|f| {
                        Path::new(&f.path)
                            .file_name()
                            .map(|n| n.to_string_lossy().to_string())
                            .unwrap_or_else(|| f.path.clone())
                    })
                    .collect();
                (true, names)
            }
            Err(e) => {
                warn!(archive = %archive_path.display(), error = %e, "manifest unreadable");
                (false, Vec::new())
            }
        };

        let mut present = Vec::new();
        if manifest_ok || sidecar_ok.is_some() {
            let file = File::open(archive_path)?;
            let mut archive = Archive::new(GzDecoder::new(file));
            for entry in archive.entries()? {
                let entry = entry?;
                let name = entry.path()?.to_string_lossy().to_string();
                if name != MANIFEST_NAME {
                    present.push(name);
                }
            }
        }

        let missing: Vec<String> = expected_names
            .iter()
            .filter(|n| !present.contains(n))
            .cloned()
            .collect();
        let valid = manifest_ok && missing.is_empty() && sidecar_ok != Some(false);

        Ok(BackupValidation {
            archive: archive_path.to_path_buf(),
            sidecar_ok,
            manifest_ok,
            entries_expected: expected_names.len(),
            entries_present: present.len(),
            missing,
            valid,
        })
    }

    /// Dry-run a restore: report per-entry targets, destination conflicts
    /// and entries that would be blocked, without writing anything.
    pub fn preview_restore(
        &self,
        archive_path: &Path,
        restore_dir: &Path,
    ) -> Result<RestorePreview, HardenError> {
        let manifest = self.read_manifest(archive_path)?;
        let restore_dir_exists = restore_dir.is_dir();

        let mut entries = Vec::new();
        let mut conflicts = 0usize;
        for file in &manifest.files {
            let name = Path::new(&file.path)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| file.path.clone());
            let (target, would_block) = match contained_join(restore_dir, &name) {
                Some(target) => (target, false),
                None => (restore_dir.join(&name), true),
            };
            let exists = !would_block && target.exists();
            if exists {
                conflicts += 1;
            }
            entries.push(PreviewEntry {
                entry: name,
                target,
                exists,
                would_block,
            });
        }

        Ok(RestorePreview {
            archive: archive_path.to_path_buf(),
            restore_dir: restore_dir.to_path_buf(),
            restore_dir_exists,
            entries,
            conflicts,
        })
    }

    // ── Permission backups ──────────────────────────────────────────────────

    /// Write a JSON-only permission snapshot and append each change to the
    /// store's change history. Returns the JSON path.
    pub fn create_permission_backup(
        &self,
        changes: &[PermissionChange],
        note: &str,
    ) -> Result<PathBuf, HardenError> {
        fs::create_dir_all(&self.permission_log_dir)?;
        paths::restrict_dir_permissions(&self.permission_log_dir);

        let backup = PermissionBackup {
            created_at: store::now_rfc3339(),
            note: self.effective_note(note),
            total_files: changes.len(),
            changes: changes.to_vec(),
        };
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%3f");
        let path = self
            .permission_log_dir
            .join(format!("perm_backup_{stamp}.json"));
        let json = serde_json::to_string_pretty(&backup)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(&path, json)?;
        paths::restrict_file_permissions(&path);

        for change in changes {
            self.insert_change_row(change)?;
        }

        self.audit.log_event(
            "permission_backup_created",
            Some(&path),
            &format!("{} file(s), note: {}", backup.total_files, backup.note),
            Severity::Info,
        );
        Ok(path)
    }

    fn insert_change_row(&self, change: &PermissionChange) -> Result<(), HardenError> {
        let conn = self.store.conn();
        conn.execute(
            "INSERT INTO permission_changes
                 (file_path, file_name, old_permission, new_permission, risk_level, changed_at, reverted)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
            params![
                change.filepath,
                change.filename,
                change.old_permission,
                change.new_permission,
                change.risk_level.as_str(),
                change.timestamp
            ],
        )?;
        Ok(())
    }

    pub fn get_file_history(&self, path: &Path) -> Result<Vec<ChangeRecord>, HardenError> {
        self.query_changes(
            "SELECT id, file_path, file_name, old_permission, new_permission, risk_level, changed_at, reverted
             FROM permission_changes WHERE file_path = ?1 ORDER BY changed_at DESC, id DESC",
            params![path.display().to_string()],
        )
    }

    pub fn get_changes_by_risk_level(
        &self,
        level: RiskLevel,
    ) -> Result<Vec<ChangeRecord>, HardenError> {
        self.query_changes(
            "SELECT id, file_path, file_name, old_permission, new_permission, risk_level, changed_at, reverted
             FROM permission_changes WHERE risk_level = ?1 ORDER BY changed_at DESC, id DESC",
            params![level.as_str()],
        )
    }

    fn query_changes(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<ChangeRecord>, HardenError> {
        let conn = self.store.conn();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, |row| {
            Ok(ChangeRecord {
                id: row.get(0)?,
                file_path: row.get(1)?,
                file_name: row.get(2)?,
                old_permission: row.get(3)?,
                new_permission: row.get(4)?,
                risk_level: row
                    .get::<_, String>(5)?
                    .parse()
                    .unwrap_or(RiskLevel::Low),
                changed_at: row.get(6)?,
                reverted: row.get::<_, i64>(7)? != 0,
            })
        })?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    /// Re-apply the old permission recorded under history id `id`.
    pub fn revert_change(&self, id: i64) -> Result<(), HardenError> {
        let record = {
            let conn = self.store.conn();
            conn.query_row(
                "SELECT file_path, old_permission, reverted FROM permission_changes WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)? != 0,
                    ))
                },
            )?
        };
        let (file_path, old_permission, reverted) = record;
        if reverted {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("change {id} was already reverted"),
            )
            .into());
        }

        let mode = parse_mode(&old_permission)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        let target = PathBuf::from(&file_path);
        apply_mode(&target, mode)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

        {
            let conn = self.store.conn();
            conn.execute(
                "UPDATE permission_changes SET reverted = 1 WHERE id = ?1",
                params![id],
            )?;
        }
        self.audit.log_event(
            "permission_reverted",
            Some(&target),
            &format!("Restored mode {old_permission} from change {id}"),
            Severity::Info,
        );
        Ok(())
    }

    /// Replay only the permission component of a backup: the old permission
    /// from a permission-backup JSON, or the recorded mode from an archive
    /// manifest. Content is never touched. Each applied change lands in the
    /// history with the pre-replay mode as its old side.
    pub fn restore_permissions_only(
        &self,
        source: &Path,
        validate_exists: bool,
    ) -> Result<PermissionReplayReport, HardenError> {
        let targets: Vec<(String, String, RiskLevel)> =
            if source.extension().and_then(|e| e.to_str()) == Some("json") {
                let raw = fs::read_to_string(source)?;
                let backup: PermissionBackup = serde_json::from_str(&raw)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                backup
                    .changes
                    .into_iter()
                    .map(|c| (c.filepath, c.old_permission, c.risk_level))
                    .collect()
            } else {
                let manifest = self.read_manifest(source)?;
                manifest
                    .files
                    .into_iter()
                    .map(|f| (f.path, f.permission_octal, RiskLevel::Low))
                    .collect()
            };

        let mut applied = 0usize;
        let mut skipped_missing = 0usize;
        let mut errors = Vec::new();

        for (path_str, permission, risk_level) in targets {
            let target = PathBuf::from(&path_str);
            if validate_exists && !target.exists() {
                skipped_missing += 1;
                continue;
            }
            if is_symlink(&target) {
                errors.push(format!("{path_str}: target is a symlink"));
                continue;
            }
            let mode = match parse_mode(&permission) {
                Ok(mode) => mode,
                Err(e) => {
                    errors.push(format!("{path_str}: bad recorded mode {permission}: {e}"));
                    continue;
                }
            };
            let previous = current_mode(&target).unwrap_or(0);
            if let Err(e) = apply_mode(&target, mode) {
                errors.push(format!("{path_str}: {e}"));
                continue;
            }
            applied += 1;
            let change = PermissionChange {
                filepath: path_str.clone(),
                filename: target
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| path_str.clone()),
                old_permission: mode_octal(previous),
                new_permission: permission,
                risk_level,
                timestamp: store::now_rfc3339(),
            };
            if let Err(e) = self.insert_change_row(&change) {
                warn!(path = path_str, error = %e, "cannot record replayed change");
            }
        }

        self.audit.log_event(
            "permissions_restored",
            Some(source),
            &format!("{applied} applied, {skipped_missing} missing, {} error(s)", errors.len()),
            Severity::Info,
        );
        Ok(PermissionReplayReport {
            applied,
            skipped_missing,
            errors,
        })
    }
}

// ── Path containment ────────────────────────────────────────────────────────

/// Join `declared` onto `root` and normalize lexically. Returns `None` for
/// absolute names and anything that does not stay strictly inside `root`.
fn contained_join(root: &Path, declared: &str) -> Option<PathBuf> {
    let declared_path = Path::new(declared);
    if declared_path.is_absolute() {
        return None;
    }
    let mut out = root.to_path_buf();
    for component in declared_path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if out.starts_with(root) && out != root {
        Some(out)
    } else {
        None
    }
}

// ── Platform helpers ────────────────────────────────────────────────────────

fn cleanup_staging_in_dir(dir: &Path) {
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(STAGING_PREFIX) {
                warn!(path = %entry.path().display(), "removing orphaned staging file");
                let _ = fs::remove_file(entry.path());
            }
        }
    }
}

fn fsync_dir(path: &Path) {
    #[cfg(unix)]
    {
        if let Ok(dir) = OpenOptions::new().read(true).open(path) {
            let _ = dir.sync_all();
        }
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
}

/// Check that the filesystem containing `dir` has room for `needed` bytes
/// plus a safety margin.
fn check_disk_space(dir: &Path, needed: u64) -> Result<(), HardenError> {
    #[cfg(unix)]
    {
        use std::mem::MaybeUninit;
        let c_path = match std::ffi::CString::new(dir.to_string_lossy().as_bytes()) {
            Ok(c) => c,
            Err(_) => return Ok(()),
        };
        let mut stat = MaybeUninit::<libc::statvfs>::uninit();
        let ret = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
        if ret == 0 {
            let stat = unsafe { stat.assume_init() };
            let available = stat.f_bavail as u64 * stat.f_frsize as u64;
            let required = needed + MIN_FREE_SPACE_BYTES;
            if available < required {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!(
                        "insufficient disk space: need {} bytes, only {} available in {}",
                        required,
                        available,
                        dir.display()
                    ),
                )
                .into());
            }
        } else {
            warn!(dir = %dir.display(), "statvfs failed; skipping space check");
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (dir, needed);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn engine(backups: &Path, perm_logs: &Path) -> (BackupEngine, Arc<AuditLedger>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let audit = Arc::new(AuditLedger::new(store.clone()));
        let engine = BackupEngine::new(
            backups.to_path_buf(),
            perm_logs.to_path_buf(),
            store,
            audit.clone(),
            &BackupSettings {
                history_limit: 50,
                note_prefix: String::new(),
            },
        );
        (engine, audit)
    }

    #[test]
    fn contained_join_accepts_plain_and_nested_names() {
        let root = Path::new("/restore/here");
        assert_eq!(
            contained_join(root, "file.txt"),
            Some(PathBuf::from("/restore/here/file.txt"))
        );
        assert_eq!(
            contained_join(root, "sub/dir/file.txt"),
            Some(PathBuf::from("/restore/here/sub/dir/file.txt"))
        );
        assert_eq!(
            contained_join(root, "a/../b.txt"),
            Some(PathBuf::from("/restore/here/b.txt"))
        );
    }

    #[test]
    fn contained_join_blocks_escapes() {
        let root = Path::new("/restore/here");
        assert_eq!(contained_join(root, "../../etc/passwd"), None);
        assert_eq!(contained_join(root, "../sibling.txt"), None);
        assert_eq!(contained_join(root, "/etc/passwd"), None);
        assert_eq!(contained_join(root, "a/../.."), None);
        assert_eq!(contained_join(root, "."), None);
    }

    #[test]
    fn create_validate_and_list_backups() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("data");
        fs::create_dir_all(&data).unwrap();
        let a = data.join("a.txt");
        let b = data.join("b.conf");
        fs::write(&a, b"alpha").unwrap();
        fs::write(&b, b"bravo").unwrap();

        let (engine, _) = engine(&dir.path().join("backups"), &dir.path().join("perms"));
        let archive = engine
            .create_backup(&[a.clone(), b.clone(), data.join("missing.txt")], "nightly")
            .unwrap();
        assert!(archive.exists());

        let manifest = engine.read_manifest(&archive).unwrap();
        assert_eq!(manifest.files.len(), 2);
        assert_eq!(manifest.note, "nightly");

        let validation = engine.validate_backup(&archive).unwrap();
        assert_eq!(validation.sidecar_ok, Some(true));
        assert!(validation.manifest_ok);
        assert_eq!(validation.entries_expected, 2);
        assert_eq!(validation.entries_present, 2);
        assert!(validation.missing.is_empty());
        assert!(validation.valid);

        let listed = engine.list_backups().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].file_count, 2);
        assert_eq!(listed[0].note, "nightly");
    }

    #[test]
    fn restore_round_trips_content_and_permissions() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("data");
        fs::create_dir_all(&data).unwrap();
        let secret = data.join("secret.key");
        fs::write(&secret, b"key material").unwrap();
        #[cfg(unix)]
        apply_mode(&secret, 0o600).unwrap();

        let (engine, _) = engine(&dir.path().join("backups"), &dir.path().join("perms"));
        let archive = engine.create_backup(&[secret.clone()], "keys").unwrap();

        let restore_dir = dir.path().join("restored");
        let report = engine.restore_backup(&archive, &restore_dir).unwrap();
        assert!(report.success, "errors: {:?}", report.errors);
        assert_eq!(report.restored, vec!["secret.key".to_string()]);

        let restored = restore_dir.join("secret.key");
        assert_eq!(fs::read(&restored).unwrap(), b"key material");
        #[cfg(unix)]
        assert_eq!(current_mode(&restored).unwrap(), 0o600);
    }

    #[test]
    fn crafted_traversal_entry_is_blocked_and_the_rest_restores() {
        let dir = tempdir().unwrap();
        let good = dir.path().join("good.txt");
        fs::write(&good, b"fine").unwrap();
        let (good_hash, good_size) = sha256_file(&good).unwrap();

        let manifest = BackupManifest {
            created_at: "2026-01-01T00:00:00.000000Z".to_string(),
            note: "crafted".to_string(),
            files: vec![ManifestEntry {
                path: good.display().to_string(),
                sha256: good_hash,
                size: good_size,
                permission_octal: "644".to_string(),
                permission_symbolic: "rw-r--r--".to_string(),
            }],
        };
        let manifest_bytes = serde_json::to_vec_pretty(&manifest).unwrap();

        let archive_path = dir.path().join("backup_evil.tar.gz");
        {
            let file = File::create(&archive_path).unwrap();
            let encoder = GzEncoder::new(file, Compression::default());
            let mut tar = Builder::new(encoder);

            let mut header = Header::new_gnu();
            header.set_size(manifest_bytes.len() as u64);
            header.set_mode(0o600);
            header.set_cksum();
            tar.append_data(&mut header, MANIFEST_NAME, manifest_bytes.as_slice())
                .unwrap();

            tar.append_path_with_name(&good, "good.txt").unwrap();

            let payload = b"owned";
            let mut header = Header::new_gnu();
            // `append_data` refuses `..` components, so write the crafted
            // name straight into the header bytes and append it as-is.
            let evil_name = b"../../etc/passwd";
            header.as_gnu_mut().unwrap().name[..evil_name.len()].copy_from_slice(evil_name);
            header.set_size(payload.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            tar.append(&header, payload.as_slice()).unwrap();

            tar.into_inner().unwrap().finish().unwrap();
        }

        let restore_dir = dir.path().join("out");
        let (engine, audit) = engine(&dir.path().join("backups"), &dir.path().join("perms"));
        let report = engine.restore_backup(&archive_path, &restore_dir).unwrap();

        assert!(!report.success);
        assert_eq!(report.restored, vec!["good.txt".to_string()]);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].kind, RestoreErrorKind::PathTraversalBlocked);
        assert!(!dir.path().join("etc/passwd").exists());
        assert!(restore_dir.join("good.txt").exists());

        let blocked = audit
            .get_audit_logs(10, Some("path_traversal_blocked"), None)
            .unwrap();
        assert_eq!(blocked.len(), 1);
    }

    #[test]
    fn restore_flags_hash_mismatch_without_dropping_the_file() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("payload.bin");
        fs::write(&data, b"first contents").unwrap();

        let (engine, _) = engine(&dir.path().join("backups"), &dir.path().join("perms"));
        let archive = engine.create_backup(&[data.clone()], "before edit").unwrap();

        // Repack the archive with altered payload under the same manifest.
        let manifest = engine.read_manifest(&archive).unwrap();
        let manifest_bytes = serde_json::to_vec_pretty(&manifest).unwrap();
        {
            let file = File::create(&archive).unwrap();
            let encoder = GzEncoder::new(file, Compression::default());
            let mut tar = Builder::new(encoder);
            let mut header = Header::new_gnu();
            header.set_size(manifest_bytes.len() as u64);
            header.set_mode(0o600);
            header.set_cksum();
            tar.append_data(&mut header, MANIFEST_NAME, manifest_bytes.as_slice())
                .unwrap();
            let altered = b"second contents!!";
            let mut header = Header::new_gnu();
            header.set_size(altered.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            tar.append_data(&mut header, "payload.bin", altered.as_slice())
                .unwrap();
            tar.into_inner().unwrap().finish().unwrap();
        }

        let out = dir.path().join("out");
        let report = engine.restore_backup(&archive, &out).unwrap();
        assert!(!report.success);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].kind, RestoreErrorKind::HashMismatch);
        assert!(out.join("payload.bin").exists());
    }

    #[test]
    fn permission_backup_history_and_revert() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("script.sh");
        fs::write(&target, b"#!/bin/sh\n").unwrap();
        #[cfg(unix)]
        apply_mode(&target, 0o600).unwrap();

        let (engine, _) = engine(&dir.path().join("backups"), &dir.path().join("perms"));
        let change = PermissionChange {
            filepath: target.display().to_string(),
            filename: "script.sh".to_string(),
            old_permission: "755".to_string(),
            new_permission: "600".to_string(),
            risk_level: RiskLevel::High,
            timestamp: "2026-02-02T10:00:00.000000Z".to_string(),
        };
        let json = engine
            .create_permission_backup(&[change], "hardening run")
            .unwrap();
        assert!(json.exists());
        let parsed: PermissionBackup =
            serde_json::from_str(&fs::read_to_string(&json).unwrap()).unwrap();
        assert_eq!(parsed.total_files, 1);
        assert_eq!(parsed.changes[0].new_permission, "600");

        let history = engine.get_file_history(&target).unwrap();
        assert_eq!(history.len(), 1);
        assert!(!history[0].reverted);
        assert_eq!(history[0].risk_level, RiskLevel::High);

        assert_eq!(engine.get_changes_by_risk_level(RiskLevel::High).unwrap().len(), 1);
        assert!(engine.get_changes_by_risk_level(RiskLevel::Low).unwrap().is_empty());

        #[cfg(unix)]
        {
            engine.revert_change(history[0].id).unwrap();
            assert_eq!(current_mode(&target).unwrap(), 0o755);
            let history = engine.get_file_history(&target).unwrap();
            assert!(history[0].reverted);
            // A second revert of the same id is refused.
            assert!(engine.revert_change(history[0].id).is_err());
        }
    }

    #[cfg(unix)]
    #[test]
    fn replaying_a_permission_backup_restores_old_modes() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("app.cfg");
        fs::write(&target, b"k=v").unwrap();
        apply_mode(&target, 0o777).unwrap();

        let (engine, _) = engine(&dir.path().join("backups"), &dir.path().join("perms"));
        let change = PermissionChange {
            filepath: target.display().to_string(),
            filename: "app.cfg".to_string(),
            old_permission: "644".to_string(),
            new_permission: "777".to_string(),
            risk_level: RiskLevel::Medium,
            timestamp: store::now_rfc3339(),
        };
        let json = engine.create_permission_backup(&[change], "loosened").unwrap();

        let report = engine.restore_permissions_only(&json, true).unwrap();
        assert_eq!(report.applied, 1);
        assert!(report.errors.is_empty());
        assert_eq!(current_mode(&target).unwrap(), 0o644);

        // The replay itself lands in the history with the pre-replay mode.
        let history = engine.get_file_history(&target).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].old_permission, "777");
        assert_eq!(history[0].new_permission, "644");
    }

    #[test]
    fn replay_skips_missing_targets_when_validating() {
        let dir = tempdir().unwrap();
        let (engine, _) = engine(&dir.path().join("backups"), &dir.path().join("perms"));
        let change = PermissionChange {
            filepath: dir.path().join("gone.txt").display().to_string(),
            filename: "gone.txt".to_string(),
            old_permission: "644".to_string(),
            new_permission: "600".to_string(),
            risk_level: RiskLevel::Low,
            timestamp: store::now_rfc3339(),
        };
        let json = engine.create_permission_backup(&[change], "").unwrap();
        let report = engine.restore_permissions_only(&json, true).unwrap();
        assert_eq!(report.applied, 0);
        assert_eq!(report.skipped_missing, 1);
    }

    #[test]
    fn preview_reports_conflicts_without_writing() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("report.txt");
        fs::write(&data, b"quarterly").unwrap();

        let (engine, _) = engine(&dir.path().join("backups"), &dir.path().join("perms"));
        let archive = engine.create_backup(&[data.clone()], "").unwrap();

        let out = dir.path().join("out");
        let preview = engine.preview_restore(&archive, &out).unwrap();
        assert!(!preview.restore_dir_exists);
        assert_eq!(preview.conflicts, 0);
        assert!(!out.exists(), "preview must not create the restore dir");

        fs::create_dir_all(&out).unwrap();
        fs::write(out.join("report.txt"), b"already here").unwrap();
        let preview = engine.preview_restore(&archive, &out).unwrap();
        assert!(preview.restore_dir_exists);
        assert_eq!(preview.conflicts, 1);
        assert_eq!(fs::read(out.join("report.txt")).unwrap(), b"already here");
    }

    #[test]
    fn listing_caps_at_the_history_limit_newest_first() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("f.txt");
        fs::write(&data, b"x").unwrap();

        let store = Arc::new(Store::open_in_memory().unwrap());
        let audit = Arc::new(AuditLedger::new(store.clone()));
        let engine = BackupEngine::new(
            dir.path().join("backups"),
            dir.path().join("perms"),
            store,
            audit,
            &BackupSettings {
                history_limit: 1,
                note_prefix: String::new(),
            },
        );
        engine.create_backup(&[data.clone()], "first").unwrap();
        engine.create_backup(&[data.clone()], "second").unwrap();

        let listed = engine.list_backups().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].note, "second");
    }
}
