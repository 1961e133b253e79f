use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use walkdir::WalkDir;

use permlock_core::audit::{AuditLedger, Severity};
use permlock_core::backup::BackupEngine;
use permlock_core::crypto::{check_password_strength, generate_secure_password, CryptoEngine};
use permlock_core::error::HardenError;
use permlock_core::paths;
use permlock_core::permissions::{
    current_mode, is_symlink, mode_octal, mode_symbolic, parse_mode, suggested_mode, RiskLevel,
};
use permlock_core::pipeline::{FileRecord, PermissionPipeline};
use permlock_core::rate_limit::RateLimiter;
use permlock_core::settings::{self, PermlockSettings};
use permlock_core::store::Store;

#[derive(Parser, Debug)]
#[command(author, version, about = "Permlock file permission hardening", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List files with their current and suggested modes
    Scan {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Descend into directories
        #[arg(short, long)]
        recursive: bool,
        #[arg(long)]
        json: bool,
    },

    /// Run the full hardening pipeline over the given files
    Harden {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Target mode in octal (e.g. 600 or 0644); per-file suggestion when omitted
        #[arg(short, long)]
        mode: Option<String>,
        /// Descend into directories
        #[arg(short, long)]
        recursive: bool,
        /// Risk label recorded in the change history (low, medium, high)
        #[arg(long)]
        risk: Option<String>,
        /// Encrypt the permission backup produced by the run
        #[arg(long)]
        encrypt_backup: bool,
        #[arg(long)]
        json: bool,
    },

    /// Encrypt a file with a password
    Encrypt {
        file: PathBuf,
    },

    /// Decrypt a previously encrypted file
    Decrypt {
        file: PathBuf,
    },

    /// Generate a random password and report its strength
    GenPassword {
        #[arg(short, long, default_value = "20")]
        length: usize,
    },

    /// Score a password without storing it anywhere
    CheckPassword,

    /// Archive files into a tar.gz backup with a manifest and checksum
    Backup {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Descend into directories
        #[arg(short, long)]
        recursive: bool,
        #[arg(short, long)]
        note: Option<String>,
    },

    /// Extract a backup archive into a directory
    Restore {
        archive: PathBuf,
        dest: PathBuf,
    },

    /// Re-apply recorded permissions from a backup without touching content
    RestorePerms {
        /// Permission backup (.json) or archive (.tar.gz)
        source: PathBuf,
        /// Skip entries whose target file no longer exists
        #[arg(long)]
        skip_missing: bool,
    },

    /// List known backup archives, newest first
    ListBackups {
        #[arg(long)]
        json: bool,
    },

    /// Check an archive against its manifest and checksum sidecar
    ValidateBackup {
        archive: PathBuf,
    },

    /// Show what a restore would do without writing anything
    PreviewRestore {
        archive: PathBuf,
        dest: PathBuf,
    },

    /// Record baseline hashes for later integrity checks
    Register {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Descend into directories
        #[arg(short, long)]
        recursive: bool,
    },

    /// Compare a file against its recorded baseline hash
    Verify {
        path: PathBuf,
    },

    /// Show recent audit log entries
    AuditLog {
        #[arg(short, long, default_value = "50")]
        limit: usize,
        /// Only entries with this action type
        #[arg(long)]
        action: Option<String>,
        /// Only entries with this severity (info, warning, error, critical)
        #[arg(long)]
        severity: Option<String>,
        #[arg(long)]
        json: bool,
    },

    /// Recompute audit entry checksums and report tampering
    VerifyAudit {
        #[arg(short, long, default_value = "1000")]
        limit: usize,
    },

    /// Show the permission change history for a file or risk label
    History {
        path: Option<PathBuf>,
        /// All changes recorded with this risk label (low, medium, high)
        #[arg(long)]
        risk: Option<String>,
    },

    /// Revert a single change from the history by id
    Revert {
        id: i64,
    },

    /// Report confidentiality, integrity and availability health
    Status {
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Scan {
            paths,
            recursive,
            json,
        } => scan(paths, recursive, json)?,

        Commands::Harden {
            paths,
            mode,
            recursive,
            risk,
            encrypt_backup,
            json,
        } => harden(paths, mode, recursive, risk, encrypt_backup, json)?,

        Commands::Encrypt { file } => {
            let services = build_services()?;
            let password = prompt_password(true)?;
            let strength = check_password_strength(&password);
            if strength.score < 3 {
                eprintln!("warning: {} password", strength.label.to_lowercase());
                for hint in &strength.feedback {
                    eprintln!("  - {hint}");
                }
            }
            let report = services.crypto.encrypt_file(&file, &password, None)?;
            println!("{}", report.encrypted_path.display());
            if let Some(quarantined) = report.quarantined_original {
                eprintln!("original moved to {}", quarantined.display());
            }
        }

        Commands::Decrypt { file } => {
            let services = build_services()?;
            let password = prompt_password(false)?;
            match services.crypto.decrypt_file(&file, &password, None) {
                Ok(path) => println!("{}", path.display()),
                Err(HardenError::RateLimited { wait_seconds }) => {
                    bail!("too many failed attempts; locked for {wait_seconds}s")
                }
                Err(HardenError::InvalidPassword) => bail!("invalid password"),
                Err(e) => return Err(e.into()),
            }
        }

        Commands::GenPassword { length } => {
            let password = generate_secure_password(length);
            let strength = check_password_strength(&password);
            println!("{password}");
            eprintln!("strength: {} ({}/6)", strength.label, strength.score);
        }

        Commands::CheckPassword => {
            let password = prompt_password(false)?;
            let strength = check_password_strength(&password);
            println!("{} ({}/6)", strength.label, strength.score);
            for hint in &strength.feedback {
                println!("- {hint}");
            }
        }

        Commands::Backup {
            paths,
            recursive,
            note,
        } => {
            let services = build_services()?;
            let files = collect_files(&paths, recursive)?;
            if files.is_empty() {
                bail!("no files to back up");
            }
            let archive = services
                .backup
                .create_backup(&files, note.as_deref().unwrap_or("manual backup"))?;
            println!("{}", archive.display());
        }

        Commands::Restore { archive, dest } => {
            let services = build_services()?;
            let report = services.backup.restore_backup(&archive, &dest)?;
            for entry in &report.restored {
                println!("restored {entry}");
            }
            for error in &report.errors {
                eprintln!("error [{:?}] {}: {}", error.kind, error.entry, error.message);
            }
            if !report.success {
                bail!("restore finished with {} error(s)", report.errors.len());
            }
        }

        Commands::RestorePerms {
            source,
            skip_missing,
        } => {
            let services = build_services()?;
            let report = services
                .backup
                .restore_permissions_only(&source, skip_missing)?;
            println!(
                "{} applied, {} missing skipped",
                report.applied, report.skipped_missing
            );
            for error in &report.errors {
                eprintln!("error: {error}");
            }
            if !report.errors.is_empty() {
                bail!("{} permission(s) could not be re-applied", report.errors.len());
            }
        }

        Commands::ListBackups { json } => {
            let services = build_services()?;
            let backups = services.backup.list_backups()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&backups)?);
            } else {
                for info in &backups {
                    println!(
                        "{}  {:>4} file(s)  {:>10} bytes  {}  {}",
                        info.created_at,
                        info.file_count,
                        info.size_bytes,
                        info.note,
                        info.path.display()
                    );
                }
                eprintln!("{} backup(s)", backups.len());
            }
        }

        Commands::ValidateBackup { archive } => {
            let services = build_services()?;
            let validation = services.backup.validate_backup(&archive)?;
            let sidecar = match validation.sidecar_ok {
                Some(true) => "ok",
                Some(false) => "MISMATCH",
                None => "missing",
            };
            println!(
                "checksum {sidecar}, manifest {}, {}/{} entries present",
                if validation.manifest_ok { "ok" } else { "unreadable" },
                validation.entries_present,
                validation.entries_expected
            );
            for name in &validation.missing {
                eprintln!("missing from archive: {name}");
            }
            if !validation.valid {
                bail!("backup failed validation");
            }
        }

        Commands::PreviewRestore { archive, dest } => {
            let services = build_services()?;
            let preview = services.backup.preview_restore(&archive, &dest)?;
            for entry in &preview.entries {
                let marker = if entry.would_block {
                    "BLOCKED"
                } else if entry.exists {
                    "overwrite"
                } else {
                    "create"
                };
                println!("{marker:>9}  {}  ->  {}", entry.entry, entry.target.display());
            }
            println!(
                "{} entr(ies), {} conflict(s)",
                preview.entries.len(),
                preview.conflicts
            );
        }

        Commands::Register { paths, recursive } => {
            let services = build_services()?;
            let files = collect_files(&paths, recursive)?;
            let mut registered = 0usize;
            for file in &files {
                if services.audit.register_file_hash(file, None) {
                    registered += 1;
                }
            }
            println!("registered {registered}/{} file(s)", files.len());
            if registered < files.len() {
                bail!("{} file(s) could not be registered", files.len() - registered);
            }
        }

        Commands::Verify { path } => {
            let services = build_services()?;
            let report = services.audit.verify_file_integrity(&path)?;
            println!("{}: {}", path.display(), report.status);
            if !report.is_valid {
                bail!(
                    "integrity check failed (hash match: {}, size match: {})",
                    report.hash_match,
                    report.size_match
                );
            }
        }

        Commands::AuditLog {
            limit,
            action,
            severity,
            json,
        } => {
            let services = build_services()?;
            let severity = severity.as_deref().map(str::parse::<Severity>).transpose()?;
            let entries = services
                .audit
                .get_audit_logs(limit, action.as_deref(), severity)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                for entry in &entries {
                    println!(
                        "{}  [{:<8}] {:<24} {}  {}",
                        entry.timestamp,
                        entry.severity.as_str(),
                        entry.action_type,
                        entry.details,
                        entry.file_path.as_deref().unwrap_or("-")
                    );
                }
            }
        }

        Commands::VerifyAudit { limit } => {
            let services = build_services()?;
            let report = services.audit.verify_audit_log_integrity(limit)?;
            println!(
                "{} checked: {} valid, {} tampered, {} legacy",
                report.total, report.valid, report.tampered, report.legacy
            );
            if !report.integrity_valid {
                bail!("audit log shows {} tampered entr(ies)", report.tampered);
            }
        }

        Commands::History { path, risk } => {
            let services = build_services()?;
            let changes = match (path, risk) {
                (Some(path), None) => services.backup.get_file_history(&path)?,
                (None, Some(risk)) => services
                    .backup
                    .get_changes_by_risk_level(risk.parse::<RiskLevel>()?)?,
                (None, None) => bail!("pass a file path or --risk"),
                (Some(_), Some(_)) => bail!("path and --risk are mutually exclusive"),
            };
            for change in &changes {
                println!(
                    "#{:<5} {}  {} -> {}  [{}]  {}{}",
                    change.id,
                    change.changed_at,
                    change.old_permission,
                    change.new_permission,
                    change.risk_level.as_str(),
                    change.file_path,
                    if change.reverted { "  (reverted)" } else { "" }
                );
            }
        }

        Commands::Revert { id } => {
            let services = build_services()?;
            services.backup.revert_change(id)?;
            println!("change #{id} reverted");
        }

        Commands::Status { json } => {
            let services = build_services()?;
            let cia = services.audit.get_cia_status();
            let dropped = services.audit.dropped_events();
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&json!({
                        "cia": cia,
                        "dropped_audit_events": dropped,
                    }))?
                );
            } else {
                print_section("confidentiality", cia.confidentiality.ok, &cia.confidentiality.detail);
                print_section("integrity", cia.integrity.ok, &cia.integrity.detail);
                print_section("availability", cia.availability.ok, &cia.availability.detail);
                println!("dropped audit events: {dropped}");
            }
            if !cia.overall_ok {
                bail!("one or more health checks failed");
            }
        }
    }
    Ok(())
}

fn scan(paths: Vec<PathBuf>, recursive: bool, json: bool) -> Result<()> {
    let files = collect_files(&paths, recursive)?;
    let mut rows = Vec::new();
    for path in &files {
        if is_symlink(path) {
            if !json {
                println!("  {}  symlink (skipped)", path.display());
            }
            continue;
        }
        let mode = current_mode(path)?;
        let suggested = suggested_mode(path);
        if json {
            rows.push(json!({
                "path": path.display().to_string(),
                "mode": mode_octal(mode),
                "symbolic": mode_symbolic(mode),
                "suggested": mode_octal(suggested),
                "hardened": mode == suggested,
            }));
        } else {
            let flag = if mode == suggested { ' ' } else { '!' };
            println!(
                "{flag} {}  {} ({})  suggested {}",
                path.display(),
                mode_octal(mode),
                mode_symbolic(mode),
                mode_octal(suggested)
            );
        }
    }
    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        eprintln!("{} file(s) scanned", files.len());
    }
    Ok(())
}

fn harden(
    paths: Vec<PathBuf>,
    mode: Option<String>,
    recursive: bool,
    risk: Option<String>,
    encrypt_backup: bool,
    json: bool,
) -> Result<()> {
    let services = build_services()?;
    let files = collect_files(&paths, recursive)?;
    if files.is_empty() {
        bail!("no files to harden");
    }
    let custom_mode = mode.as_deref().map(parse_mode).transpose()?;
    let risk = match risk {
        Some(risk) => risk.parse::<RiskLevel>()?,
        None => RiskLevel::Medium,
    };

    let mut pipeline_settings = services.settings.pipeline.clone();
    if encrypt_backup {
        pipeline_settings.encrypt_backups = true;
    }
    let mut pipeline = PermissionPipeline::new(
        services.crypto.clone(),
        services.backup.clone(),
        services.audit.clone(),
        &pipeline_settings,
    )?;
    if pipeline_settings.encrypt_backups {
        pipeline.set_encryption_password(prompt_password(true)?);
    }
    if !json {
        pipeline.set_on_step_complete(|result| {
            let marker = if result.success { "ok" } else { "FAILED" };
            println!("[{marker}] {}: {}", result.step, result.message);
        });
    }

    let records: Vec<FileRecord> = files
        .into_iter()
        .map(|path| FileRecord::new(path, risk, None))
        .collect();
    let result = pipeline.execute(&records, custom_mode);
    info!(
        state = %result.final_state,
        files = result.files_processed,
        "hardening finished"
    );

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!(
            "{} ({} of {} file(s))",
            result.final_state, result.files_processed, result.total_files
        );
        for rollback in &result.rollback_results {
            println!("  rollback {}: {}", rollback.step, rollback.message);
        }
    }
    if !result.success {
        bail!("hardening did not complete; completed steps were rolled back");
    }
    Ok(())
}

struct Services {
    settings: PermlockSettings,
    audit: Arc<AuditLedger>,
    crypto: Arc<CryptoEngine>,
    backup: Arc<BackupEngine>,
}

fn build_services() -> Result<Services> {
    paths::ensure_data_dirs()?;
    let settings = settings::load_settings(&paths::settings_path()?)?;
    let store = Arc::new(Store::open(&paths::database_path()?)?);
    store.restrict_db_files();
    let audit = Arc::new(AuditLedger::new(store.clone()));
    let limiter = Arc::new(RateLimiter::new(store.clone(), &settings.rate_limit));
    let crypto = Arc::new(CryptoEngine::new(limiter, audit.clone(), &settings.crypto));
    let backup = Arc::new(BackupEngine::new(
        paths::backups_dir()?,
        paths::permission_log_dir()?,
        store,
        audit.clone(),
        &settings.backup,
    ));
    Ok(Services {
        settings,
        audit,
        crypto,
        backup,
    })
}

/// Reads from PERMLOCK_PASSWORD when set, otherwise prompts on the tty.
fn prompt_password(confirm: bool) -> Result<String> {
    if let Ok(password) = std::env::var("PERMLOCK_PASSWORD") {
        if !password.is_empty() {
            return Ok(password);
        }
    }
    let first = rpassword::prompt_password("Password: ")?;
    if first.is_empty() {
        bail!("empty password");
    }
    if confirm {
        let second = rpassword::prompt_password("Confirm password: ")?;
        if first != second {
            bail!("passwords do not match");
        }
    }
    Ok(first)
}

fn collect_files(paths: &[PathBuf], recursive: bool) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for path in paths {
        let meta = fs::symlink_metadata(path)
            .map_err(|e| anyhow!("cannot access {}: {e}", path.display()))?;
        if meta.is_dir() {
            if recursive {
                for entry in WalkDir::new(path).follow_links(false) {
                    let entry = entry.context("directory walk failed")?;
                    if entry.file_type().is_file() {
                        files.push(entry.into_path());
                    }
                }
            } else {
                for entry in fs::read_dir(path)? {
                    let entry = entry?;
                    if entry.file_type()?.is_file() {
                        files.push(entry.path());
                    }
                }
            }
        } else {
            // Plain files and symlinks; the engines decide what to skip.
            files.push(path.clone());
        }
    }
    files.sort();
    files.dedup();
    Ok(files)
}

fn print_section(label: &str, ok: bool, detail: &str) {
    println!(
        "{label:<16} {}  {detail}",
        if ok { "ok  " } else { "FAIL" }
    );
}
