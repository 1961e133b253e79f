//! Six-state hardening pipeline with ordered rollback.
//!
//! `Scan → Backup → HashBefore → [Encrypt] → ChangePermission → HashAfter`,
//! ending in `Completed`, or in `RolledBack` after the first failed or
//! cancelled step triggers reverse-order undo of everything that already
//! ran. Steps execute sequentially because each step's output feeds the
//! next; only the individual chmod calls inside `ChangePermission` fan out
//! to a bounded worker pool, and their results are merged back in input
//! order. Cancellation is cooperative: the flag is checked between steps
//! and between files, and in-flight operations are left to finish.

use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::audit::{sha256_file, AuditLedger, Severity};
use crate::backup::{BackupEngine, PermissionChange};
use crate::crypto::CryptoEngine;
use crate::permissions::{
    apply_mode, current_mode, is_symlink, mode_octal, suggested_mode, RiskLevel,
};
use crate::quarantine::restore_from_quarantine;
use crate::settings::PipelineSettings;
use crate::store;

const SCAN_MISSING_LISTED: usize = 5;

// ── States and results ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStep {
    Scan,
    Backup,
    HashBefore,
    Encrypt,
    ChangePermission,
    HashAfter,
    Completed,
    Failed,
    RolledBack,
}

impl PipelineStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStep::Scan => "scan",
            PipelineStep::Backup => "backup",
            PipelineStep::HashBefore => "hash_before",
            PipelineStep::Encrypt => "encrypt",
            PipelineStep::ChangePermission => "change_permission",
            PipelineStep::HashAfter => "hash_after",
            PipelineStep::Completed => "completed",
            PipelineStep::Failed => "failed",
            PipelineStep::RolledBack => "rolled_back",
        }
    }
}

impl fmt::Display for PipelineStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One file the pipeline operates on.
#[derive(Debug, Clone, Serialize)]
pub struct FileRecord {
    pub path: PathBuf,
    pub current_mode: u32,
    pub risk_level: RiskLevel,
    pub expected_mode: Option<u32>,
}

impl FileRecord {
    pub fn new(path: PathBuf, risk_level: RiskLevel, expected_mode: Option<u32>) -> Self {
        let current_mode = current_mode(&path).unwrap_or(0);
        Self {
            path,
            current_mode,
            risk_level,
            expected_mode,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AppliedChange {
    pub path: String,
    pub previous_mode: u32,
    pub new_mode: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileFailure {
    pub path: String,
    pub error: String,
}

/// Per-step payload. Each variant's shape is fixed so downstream consumers
/// never probe an open map.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepData {
    Scan {
        total: usize,
    },
    Backup {
        backup_path: PathBuf,
        entries: usize,
    },
    HashBefore {
        hashes: BTreeMap<String, String>,
    },
    Encrypt {
        artifact: PathBuf,
        quarantined: Option<PathBuf>,
        original: PathBuf,
    },
    ChangePermission {
        applied: Vec<AppliedChange>,
        failed: Vec<FileFailure>,
        skipped_symlinks: Vec<String>,
    },
    HashAfter {
        verified: usize,
        corrupted: Vec<String>,
        unreadable: Vec<String>,
    },
    None,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub step: PipelineStep,
    pub success: bool,
    pub message: String,
    pub data: StepData,
    pub error: Option<String>,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RollbackResult {
    pub step: PipelineStep,
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub success: bool,
    pub final_state: PipelineStep,
    pub completed_steps: Vec<StepResult>,
    pub failed_step: Option<PipelineStep>,
    pub rolled_back: bool,
    pub rollback_results: Vec<RollbackResult>,
    pub total_files: usize,
    pub files_processed: usize,
    pub start_time: String,
    pub end_time: Option<String>,
}

pub type ProgressCallback = dyn Fn(PipelineStep, usize, usize) + Send + Sync;
pub type StepCallback = dyn Fn(&StepResult) + Send + Sync;

// ── Pipeline ────────────────────────────────────────────────────────────────

pub struct PermissionPipeline {
    crypto: Arc<CryptoEngine>,
    backup: Arc<BackupEngine>,
    audit: Arc<AuditLedger>,
    encrypt_backups: bool,
    cancel: Arc<AtomicBool>,
    pool: rayon::ThreadPool,
    encrypt_password: Option<Zeroizing<String>>,
    on_progress: Option<Box<ProgressCallback>>,
    on_step_complete: Option<Box<StepCallback>>,
}

impl PermissionPipeline {
    pub fn new(
        crypto: Arc<CryptoEngine>,
        backup: Arc<BackupEngine>,
        audit: Arc<AuditLedger>,
        settings: &PipelineSettings,
    ) -> anyhow::Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(settings.workers.max(1))
            .build()?;
        Ok(Self {
            crypto,
            backup,
            audit,
            encrypt_backups: settings.encrypt_backups,
            cancel: Arc::new(AtomicBool::new(false)),
            pool,
            encrypt_password: None,
            on_progress: None,
            on_step_complete: None,
        })
    }

    /// Flag shared with callers; setting it to true makes the current step
    /// behave as failed and triggers the normal rollback path.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn set_encryption_password(&mut self, password: String) {
        self.encrypt_password = Some(Zeroizing::new(password));
    }

    pub fn set_on_progress(
        &mut self,
        callback: impl Fn(PipelineStep, usize, usize) + Send + Sync + 'static,
    ) {
        self.on_progress = Some(Box::new(callback));
    }

    pub fn set_on_step_complete(&mut self, callback: impl Fn(&StepResult) + Send + Sync + 'static) {
        self.on_step_complete = Some(Box::new(callback));
    }

    fn plan(&self) -> Vec<PipelineStep> {
        let mut plan = vec![
            PipelineStep::Scan,
            PipelineStep::Backup,
            PipelineStep::HashBefore,
        ];
        if self.encrypt_backups {
            if self.encrypt_password.is_some() {
                plan.push(PipelineStep::Encrypt);
            } else {
                warn!("backup encryption enabled but no password set; skipping encrypt step");
            }
        }
        plan.push(PipelineStep::ChangePermission);
        plan.push(PipelineStep::HashAfter);
        plan
    }

    /// Run the state machine over `records`. Never fails: every outcome,
    /// including rollback of a cancelled run, is described by the returned
    /// [`PipelineResult`].
    pub fn execute(&self, records: &[FileRecord], custom_mode: Option<u32>) -> PipelineResult {
        let start_time = store::now_rfc3339();
        let plan = self.plan();
        let mut ctx = RunContext::default();
        let mut completed_steps: Vec<StepResult> = Vec::new();
        let mut failed_step = None;

        for (index, step) in plan.iter().enumerate() {
            if let Some(cb) = &self.on_progress {
                cb(*step, index + 1, plan.len());
            }

            let result = if self.cancel.load(Ordering::SeqCst) {
                StepResult {
                    step: *step,
                    success: false,
                    message: "cancelled before step started".to_string(),
                    data: StepData::None,
                    error: Some("cancelled".to_string()),
                    timestamp: store::now_rfc3339(),
                }
            } else {
                self.run_step(*step, records, custom_mode, &mut ctx)
            };

            if let Some(cb) = &self.on_step_complete {
                cb(&result);
            }
            let success = result.success;
            if !success {
                warn!(step = %result.step, message = %result.message, "pipeline step failed");
                self.audit.log_event(
                    "pipeline_step_failed",
                    None,
                    &format!("{} failed: {}", result.step, result.message),
                    Severity::Warning,
                );
                failed_step = Some(result.step);
            }
            completed_steps.push(result);
            if !success {
                break;
            }
        }

        let success = failed_step.is_none();
        let mut rollback_results = Vec::new();
        if !success {
            for step_result in completed_steps.iter().rev() {
                rollback_results.push(self.rollback_step(step_result));
            }
        }

        let files_processed = completed_steps
            .iter()
            .find_map(|r| match &r.data {
                StepData::ChangePermission {
                    applied,
                    skipped_symlinks,
                    ..
                } => Some(applied.len() + skipped_symlinks.len()),
                _ => None,
            })
            .unwrap_or(0);

        // Finalize runs exactly once per execute call.
        let final_state = if success {
            PipelineStep::Completed
        } else {
            PipelineStep::RolledBack
        };
        let end_time = store::now_rfc3339();
        let severity = if success { Severity::Info } else { Severity::Warning };
        self.audit.log_event(
            "pipeline_execution",
            None,
            &format!(
                "{final_state}: {files_processed}/{} file(s), {} step(s) run",
                records.len(),
                completed_steps.len()
            ),
            severity,
        );
        info!(
            state = %final_state,
            files = files_processed,
            steps = completed_steps.len(),
            "pipeline finished"
        );

        PipelineResult {
            success,
            final_state,
            completed_steps,
            failed_step,
            rolled_back: !success,
            rollback_results,
            total_files: records.len(),
            files_processed,
            start_time,
            end_time: Some(end_time),
        }
    }

    // ── Forward steps ───────────────────────────────────────────────────────

    fn run_step(
        &self,
        step: PipelineStep,
        records: &[FileRecord],
        custom_mode: Option<u32>,
        ctx: &mut RunContext,
    ) -> StepResult {
        match step {
            PipelineStep::Scan => self.step_scan(records),
            PipelineStep::Backup => self.step_backup(records, custom_mode, ctx),
            PipelineStep::HashBefore => self.step_hash_before(records, ctx),
            PipelineStep::Encrypt => self.step_encrypt(ctx),
            PipelineStep::ChangePermission => self.step_change_permission(records, custom_mode),
            PipelineStep::HashAfter => self.step_hash_after(records, ctx),
            // Terminal states never execute as steps.
            other => StepResult {
                step: other,
                success: false,
                message: format!("{other} is not an executable step"),
                data: StepData::None,
                error: Some("invalid step".to_string()),
                timestamp: store::now_rfc3339(),
            },
        }
    }

    fn step_scan(&self, records: &[FileRecord]) -> StepResult {
        let missing: Vec<String> = records
            .iter()
            .filter(|r| fs::symlink_metadata(&r.path).is_err())
            .map(|r| r.path.display().to_string())
            .collect();

        if missing.is_empty() {
            StepResult {
                step: PipelineStep::Scan,
                success: true,
                message: format!("Scanned {} file(s)", records.len()),
                data: StepData::Scan {
                    total: records.len(),
                },
                error: None,
                timestamp: store::now_rfc3339(),
            }
        } else {
            let shown: Vec<&str> = missing
                .iter()
                .take(SCAN_MISSING_LISTED)
                .map(String::as_str)
                .collect();
            let mut message = format!("{} file(s) missing: {}", missing.len(), shown.join(", "));
            if missing.len() > shown.len() {
                message.push_str(&format!(" and {} more", missing.len() - shown.len()));
            }
            StepResult {
                step: PipelineStep::Scan,
                success: false,
                message,
                data: StepData::Scan {
                    total: records.len(),
                },
                error: Some("missing files".to_string()),
                timestamp: store::now_rfc3339(),
            }
        }
    }

    fn step_backup(
        &self,
        records: &[FileRecord],
        custom_mode: Option<u32>,
        ctx: &mut RunContext,
    ) -> StepResult {
        let changes: Vec<PermissionChange> = records
            .iter()
            .map(|record| {
                let old = current_mode(&record.path).unwrap_or(record.current_mode);
                PermissionChange {
                    filepath: record.path.display().to_string(),
                    filename: record
                        .path
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_default(),
                    old_permission: mode_octal(old),
                    new_permission: mode_octal(target_mode(record, custom_mode)),
                    risk_level: record.risk_level,
                    timestamp: store::now_rfc3339(),
                }
            })
            .collect();

        match self.backup.create_permission_backup(&changes, "pipeline run") {
            Ok(path) => {
                ctx.backup_json = Some(path.clone());
                StepResult {
                    step: PipelineStep::Backup,
                    success: true,
                    message: format!("Backed up permissions for {} file(s)", changes.len()),
                    data: StepData::Backup {
                        backup_path: path,
                        entries: changes.len(),
                    },
                    error: None,
                    timestamp: store::now_rfc3339(),
                }
            }
            Err(e) => StepResult {
                step: PipelineStep::Backup,
                success: false,
                message: "Could not write the permission backup".to_string(),
                data: StepData::None,
                error: Some(e.to_string()),
                timestamp: store::now_rfc3339(),
            },
        }
    }

    fn step_hash_before(&self, records: &[FileRecord], ctx: &mut RunContext) -> StepResult {
        let mut hashes = BTreeMap::new();
        let mut skipped = 0usize;
        for record in records {
            if is_symlink(&record.path) {
                skipped += 1;
                continue;
            }
            match sha256_file(&record.path) {
                Ok((hash, _)) => {
                    self.audit.register_file_hash(&record.path, None);
                    hashes.insert(record.path.display().to_string(), hash);
                }
                Err(e) => {
                    return StepResult {
                        step: PipelineStep::HashBefore,
                        success: false,
                        message: format!("Cannot hash {}", record.path.display()),
                        data: StepData::None,
                        error: Some(e.to_string()),
                        timestamp: store::now_rfc3339(),
                    };
                }
            }
        }
        ctx.hashes_before = hashes.clone();
        StepResult {
            step: PipelineStep::HashBefore,
            success: true,
            message: format!("Hashed {} file(s), {skipped} symlink(s) skipped", hashes.len()),
            data: StepData::HashBefore { hashes },
            error: None,
            timestamp: store::now_rfc3339(),
        }
    }

    fn step_encrypt(&self, ctx: &mut RunContext) -> StepResult {
        let Some(password) = self.encrypt_password.as_deref() else {
            return StepResult {
                step: PipelineStep::Encrypt,
                success: false,
                message: "No encryption password configured".to_string(),
                data: StepData::None,
                error: Some("missing password".to_string()),
                timestamp: store::now_rfc3339(),
            };
        };
        let Some(backup_json) = ctx.backup_json.clone() else {
            return StepResult {
                step: PipelineStep::Encrypt,
                success: false,
                message: "No backup artifact to encrypt".to_string(),
                data: StepData::None,
                error: Some("missing backup".to_string()),
                timestamp: store::now_rfc3339(),
            };
        };

        match self.crypto.encrypt_file(&backup_json, password, None) {
            Ok(report) => StepResult {
                step: PipelineStep::Encrypt,
                success: true,
                message: format!("Encrypted backup to {}", report.encrypted_path.display()),
                data: StepData::Encrypt {
                    artifact: report.encrypted_path,
                    quarantined: report.quarantined_original,
                    original: backup_json,
                },
                error: None,
                timestamp: store::now_rfc3339(),
            },
            Err(e) => StepResult {
                step: PipelineStep::Encrypt,
                success: false,
                message: "Could not encrypt the backup artifact".to_string(),
                data: StepData::None,
                error: Some(e.to_string()),
                timestamp: store::now_rfc3339(),
            },
        }
    }

    fn step_change_permission(
        &self,
        records: &[FileRecord],
        custom_mode: Option<u32>,
    ) -> StepResult {
        let cancel = self.cancel.clone();
        let outcomes: Vec<FileOutcome> = self.pool.install(|| {
            records
                .par_iter()
                .map(|record| {
                    let path_str = record.path.display().to_string();
                    if cancel.load(Ordering::SeqCst) {
                        return FileOutcome::Cancelled;
                    }
                    if is_symlink(&record.path) {
                        return FileOutcome::SkippedSymlink(path_str);
                    }
                    let target = target_mode(record, custom_mode);
                    let previous = match current_mode(&record.path) {
                        Ok(mode) => mode,
                        Err(e) => {
                            return FileOutcome::Failed(FileFailure {
                                path: path_str,
                                error: e.to_string(),
                            })
                        }
                    };
                    if previous == target {
                        return FileOutcome::Applied(AppliedChange {
                            path: path_str,
                            previous_mode: previous,
                            new_mode: target,
                        });
                    }
                    match apply_mode(&record.path, target) {
                        Ok(()) => FileOutcome::Applied(AppliedChange {
                            path: path_str,
                            previous_mode: previous,
                            new_mode: target,
                        }),
                        Err(e) => FileOutcome::Failed(FileFailure {
                            path: path_str,
                            error: e.to_string(),
                        }),
                    }
                })
                .collect()
        });

        let mut applied = Vec::new();
        let mut failed = Vec::new();
        let mut skipped_symlinks = Vec::new();
        let mut cancelled = false;
        for outcome in outcomes {
            match outcome {
                FileOutcome::Applied(change) => {
                    if change.previous_mode != change.new_mode {
                        self.audit.log_event(
                            "permission_changed",
                            Some(std::path::Path::new(&change.path)),
                            &format!(
                                "{} -> {}",
                                mode_octal(change.previous_mode),
                                mode_octal(change.new_mode)
                            ),
                            Severity::Info,
                        );
                    }
                    applied.push(change);
                }
                FileOutcome::Failed(failure) => failed.push(failure),
                FileOutcome::SkippedSymlink(path) => skipped_symlinks.push(path),
                FileOutcome::Cancelled => cancelled = true,
            }
        }

        // More than half of the files must fail before the step itself fails.
        let majority_failed = failed.len() * 2 > records.len();
        let success = !cancelled && !majority_failed;
        let message = if cancelled {
            format!(
                "Cancelled after {} of {} file(s); changes so far will be rolled back",
                applied.len(),
                records.len()
            )
        } else {
            format!(
                "Changed {} file(s), {} failed, {} symlink(s) skipped",
                applied.len(),
                failed.len(),
                skipped_symlinks.len()
            )
        };
        let error = if cancelled {
            Some("cancelled".to_string())
        } else if majority_failed {
            Some(format!(
                "{} of {} files failed, above the majority threshold",
                failed.len(),
                records.len()
            ))
        } else {
            None
        };

        StepResult {
            step: PipelineStep::ChangePermission,
            success,
            message,
            data: StepData::ChangePermission {
                applied,
                failed,
                skipped_symlinks,
            },
            error,
            timestamp: store::now_rfc3339(),
        }
    }

    fn step_hash_after(&self, records: &[FileRecord], ctx: &mut RunContext) -> StepResult {
        let mut verified = 0usize;
        let mut corrupted = Vec::new();
        let mut unreadable = Vec::new();

        for record in records {
            if is_symlink(&record.path) {
                continue;
            }
            let path_str = record.path.display().to_string();
            match sha256_file(&record.path) {
                Ok((hash, _)) => match ctx.hashes_before.get(&path_str) {
                    Some(before) if *before == hash => verified += 1,
                    Some(_) => {
                        self.audit.log_event(
                            "data_corruption_detected",
                            Some(&record.path),
                            "Content hash diverged after the permission change",
                            Severity::Critical,
                        );
                        corrupted.push(path_str);
                    }
                    // Not hashed before (e.g. became a regular file mid-run).
                    None => corrupted.push(path_str),
                },
                Err(e) => {
                    warn!(path = %record.path.display(), error = %e, "file unreadable after change");
                    unreadable.push(path_str);
                }
            }
        }

        let success = corrupted.is_empty() && unreadable.is_empty();
        StepResult {
            step: PipelineStep::HashAfter,
            success,
            message: if success {
                format!("Verified {verified} file(s)")
            } else {
                format!(
                    "{} corrupted, {} unreadable of {} verified",
                    corrupted.len(),
                    unreadable.len(),
                    verified
                )
            },
            data: StepData::HashAfter {
                verified,
                corrupted,
                unreadable,
            },
            error: if success {
                None
            } else {
                Some("post-change verification failed".to_string())
            },
            timestamp: store::now_rfc3339(),
        }
    }

    // ── Rollback ────────────────────────────────────────────────────────────

    fn rollback_step(&self, step_result: &StepResult) -> RollbackResult {
        match &step_result.data {
            StepData::Backup { backup_path, .. } => RollbackResult {
                step: step_result.step,
                success: true,
                message: format!("Backup preserved for reference: {}", backup_path.display()),
            },
            StepData::Encrypt {
                artifact,
                quarantined,
                original,
            } => {
                let mut problems = Vec::new();
                if artifact.exists() {
                    if let Err(e) = fs::remove_file(artifact) {
                        problems.push(format!("delete {}: {e}", artifact.display()));
                    }
                }
                if let Some(quarantined) = quarantined {
                    if let Err(e) = restore_from_quarantine(quarantined, original) {
                        problems.push(format!("restore original: {e}"));
                    }
                }
                if problems.is_empty() {
                    RollbackResult {
                        step: step_result.step,
                        success: true,
                        message: "Encrypted artifact removed, original backup restored".to_string(),
                    }
                } else {
                    RollbackResult {
                        step: step_result.step,
                        success: false,
                        message: problems.join("; "),
                    }
                }
            }
            StepData::ChangePermission { applied, .. } => {
                let mut restored = 0usize;
                let mut failures = 0usize;
                for change in applied {
                    if change.previous_mode == change.new_mode {
                        restored += 1;
                        continue;
                    }
                    let path = PathBuf::from(&change.path);
                    match apply_mode(&path, change.previous_mode) {
                        Ok(()) => restored += 1,
                        Err(e) => {
                            failures += 1;
                            warn!(path = %path.display(), error = %e, "rollback chmod failed");
                        }
                    }
                }
                RollbackResult {
                    step: step_result.step,
                    success: failures == 0,
                    message: format!(
                        "Restored {restored}/{} file permission(s)",
                        applied.len()
                    ),
                }
            }
            StepData::Scan { .. }
            | StepData::HashBefore { .. }
            | StepData::HashAfter { .. }
            | StepData::None => RollbackResult {
                step: step_result.step,
                success: true,
                message: "No rollback needed".to_string(),
            },
        }
    }
}

#[derive(Default)]
struct RunContext {
    backup_json: Option<PathBuf>,
    hashes_before: BTreeMap<String, String>,
}

enum FileOutcome {
    Applied(AppliedChange),
    Failed(FileFailure),
    SkippedSymlink(String),
    Cancelled,
}

fn target_mode(record: &FileRecord, custom_mode: Option<u32>) -> u32 {
    custom_mode
        .or(record.expected_mode)
        .unwrap_or_else(|| suggested_mode(&record.path))
}
