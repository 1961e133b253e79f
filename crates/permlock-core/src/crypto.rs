//! Password-based authenticated encryption for Permlock.
//!
//! Containers are laid out as `salt(16) || verification_tag(32) || ciphertext`
//! where the ciphertext itself starts with the 24-byte XChaCha20-Poly1305
//! nonce. The verification tag is `SHA-256("VERIFY:" + password + salt)` and
//! lets decryption reject a wrong password before paying for key derivation.
//! Every decrypt attempt is metered through the persisted rate limiter under
//! the `"decrypt"` key.

use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use pbkdf2::pbkdf2_hmac;
use rand::{Rng, RngCore};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::audit::{AuditLedger, Severity};
use crate::error::HardenError;
use crate::paths;
use crate::quarantine::QuarantineZone;
use crate::rate_limit::RateLimiter;
use crate::settings::CryptoSettings;

pub const SALT_LEN: usize = 16;
pub const VERIFY_TAG_LEN: usize = 32;
pub const NONCE_LEN: usize = 24;
pub const DERIVED_KEY_LEN: usize = 32;
pub const KDF_MIN_ITERATIONS: u32 = 480_000;
pub const DEFAULT_KDF_ITERATIONS: u32 = 600_000;
pub const DECRYPT_LIMIT_KEY: &str = "decrypt";
pub const ENCRYPTED_EXTENSION: &str = "enc";

const AEAD_TAG_LEN: usize = 16;
const IO_CHUNK: usize = 64 * 1024;
const PASSWORD_ALPHABET: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789!@#$%^&*()-_=+";

/// Progress callback: `(bytes_done, bytes_total)`.
pub type ProgressFn = dyn Fn(u64, u64) + Send + Sync;

// ── Key derivation ──────────────────────────────────────────────────────────

/// Derive a 32-byte key with PBKDF2-HMAC-SHA256. If `salt` is omitted a fresh
/// one is generated; the salt actually used is always returned so callers can
/// persist it next to the ciphertext.
pub fn derive_key(
    password: &str,
    salt: Option<[u8; SALT_LEN]>,
    iterations: u32,
) -> (Zeroizing<Vec<u8>>, [u8; SALT_LEN]) {
    let salt = salt.unwrap_or_else(generate_salt);
    let mut key = Zeroizing::new(vec![0u8; DERIVED_KEY_LEN]);
    pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, iterations, &mut key);
    (key, salt)
}

pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// `SHA-256("VERIFY:" + password + salt)`, stored unencrypted in the
/// container header.
pub fn verification_tag(password: &str, salt: &[u8; SALT_LEN]) -> [u8; VERIFY_TAG_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(b"VERIFY:");
    hasher.update(password.as_bytes());
    hasher.update(salt);
    let digest = hasher.finalize();
    let mut tag = [0u8; VERIFY_TAG_LEN];
    tag.copy_from_slice(&digest);
    tag
}

/// Constant-time check of `tag` against the recomputed verification tag.
pub fn verify_password(password: &str, salt: &[u8; SALT_LEN], tag: &[u8; VERIFY_TAG_LEN]) -> bool {
    let expected = verification_tag(password, salt);
    bool::from(expected.ct_eq(tag))
}

// ── Container ───────────────────────────────────────────────────────────────

/// Output of [`CryptoEngine::encrypt`]. `ciphertext` already carries the
/// nonce as its first 24 bytes.
#[derive(Debug, Clone)]
pub struct EncryptedPayload {
    pub salt: [u8; SALT_LEN],
    pub verification_tag: [u8; VERIFY_TAG_LEN],
    pub ciphertext: Vec<u8>,
}

impl EncryptedPayload {
    /// Serialize as `salt || verification_tag || ciphertext`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SALT_LEN + VERIFY_TAG_LEN + self.ciphertext.len());
        out.extend_from_slice(&self.salt);
        out.extend_from_slice(&self.verification_tag);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, HardenError> {
        if bytes.len() < SALT_LEN + VERIFY_TAG_LEN + NONCE_LEN + AEAD_TAG_LEN {
            return Err(HardenError::DecryptionError(
                "encrypted container is truncated".to_string(),
            ));
        }
        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&bytes[..SALT_LEN]);
        let mut verification_tag = [0u8; VERIFY_TAG_LEN];
        verification_tag.copy_from_slice(&bytes[SALT_LEN..SALT_LEN + VERIFY_TAG_LEN]);
        Ok(Self {
            salt,
            verification_tag,
            ciphertext: bytes[SALT_LEN + VERIFY_TAG_LEN..].to_vec(),
        })
    }
}

// ── Password quality ────────────────────────────────────────────────────────

#[derive(Debug, Clone, serde::Serialize)]
pub struct PasswordStrength {
    pub score: u8,
    pub label: &'static str,
    pub feedback: Vec<String>,
}

const STRENGTH_LABELS: [&str; 7] = [
    "Very Weak",
    "Weak",
    "Medium",
    "Strong",
    "Very Strong",
    "Excellent",
    "Unbreakable",
];

/// Additive scoring over six character-class and length checks. Pure
/// function, no side effects.
pub fn check_password_strength(password: &str) -> PasswordStrength {
    let mut score = 0u8;
    let mut feedback = Vec::new();

    let checks: [(bool, &str); 6] = [
        (password.len() >= 8, "Use at least 8 characters"),
        (password.len() >= 12, "Use 12 or more characters"),
        (
            password.chars().any(|c| c.is_ascii_uppercase()),
            "Add uppercase letters",
        ),
        (
            password.chars().any(|c| c.is_ascii_lowercase()),
            "Add lowercase letters",
        ),
        (
            password.chars().any(|c| c.is_ascii_digit()),
            "Add digits",
        ),
        (
            password.chars().any(|c| !c.is_alphanumeric()),
            "Add symbols",
        ),
    ];
    for (passed, hint) in checks {
        if passed {
            score += 1;
        } else {
            feedback.push(hint.to_string());
        }
    }

    PasswordStrength {
        score,
        label: STRENGTH_LABELS[score as usize],
        feedback,
    }
}

/// Draw `length` characters from a fixed alphabet using the OS RNG.
pub fn generate_secure_password(length: usize) -> String {
    (0..length)
        .map(|_| {
            let idx = OsRng.gen_range(0..PASSWORD_ALPHABET.len());
            PASSWORD_ALPHABET[idx] as char
        })
        .collect()
}

// ── Engine ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct EncryptFileReport {
    pub encrypted_path: PathBuf,
    pub quarantined_original: Option<PathBuf>,
}

pub struct CryptoEngine {
    limiter: Arc<RateLimiter>,
    audit: Arc<AuditLedger>,
    kdf_iterations: u32,
    max_file_bytes: u64,
    quarantine_originals: bool,
}

impl CryptoEngine {
    pub fn new(
        limiter: Arc<RateLimiter>,
        audit: Arc<AuditLedger>,
        settings: &CryptoSettings,
    ) -> Self {
        Self {
            limiter,
            audit,
            kdf_iterations: settings.kdf_iterations.max(KDF_MIN_ITERATIONS),
            max_file_bytes: settings.max_file_size_mb * 1024 * 1024,
            quarantine_originals: settings.quarantine_originals,
        }
    }

    pub fn kdf_iterations(&self) -> u32 {
        self.kdf_iterations
    }

    /// Encrypt `plaintext` under a fresh salt/key pair.
    pub fn encrypt(&self, plaintext: &[u8], password: &str) -> Result<EncryptedPayload, HardenError> {
        let (key, salt) = derive_key(password, None, self.kdf_iterations);
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
        let nonce = generate_nonce();
        let sealed = cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|e| HardenError::DecryptionError(format!("encrypt: {e}")))?;

        let mut ciphertext = Vec::with_capacity(NONCE_LEN + sealed.len());
        ciphertext.extend_from_slice(&nonce);
        ciphertext.extend_from_slice(&sealed);

        Ok(EncryptedPayload {
            salt,
            verification_tag: verification_tag(password, &salt),
            ciphertext,
        })
    }

    /// Decrypt `ciphertext` (nonce-prefixed). Consults the rate limiter for
    /// the `"decrypt"` key first; a locked key fails with `RateLimited`
    /// before any cipher work. A present-but-mismatched verification tag
    /// records a failed attempt and fails with `InvalidPassword` without
    /// deriving a key. Authentication failures from the cipher are likewise
    /// normalized to `InvalidPassword`. Success resets the counter.
    pub fn decrypt(
        &self,
        ciphertext: &[u8],
        password: &str,
        salt: &[u8; SALT_LEN],
        tag: Option<&[u8; VERIFY_TAG_LEN]>,
    ) -> Result<Zeroizing<Vec<u8>>, HardenError> {
        let lock = self.limiter.key_lock(DECRYPT_LIMIT_KEY);
        let _guard = lock.lock();

        let status = self.limiter.check_limit(DECRYPT_LIMIT_KEY)?;
        if !status.allowed {
            return Err(HardenError::RateLimited {
                wait_seconds: status.wait_seconds,
            });
        }

        if let Some(tag) = tag {
            if !verify_password(password, salt, tag) {
                self.limiter.record_attempt(DECRYPT_LIMIT_KEY, false)?;
                return Err(HardenError::InvalidPassword);
            }
        }

        if ciphertext.len() < NONCE_LEN + AEAD_TAG_LEN {
            return Err(HardenError::DecryptionError(
                "ciphertext is truncated".to_string(),
            ));
        }

        let (key, _) = derive_key(password, Some(*salt), self.kdf_iterations);
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
        let nonce = XNonce::from_slice(&ciphertext[..NONCE_LEN]);
        match cipher.decrypt(nonce, &ciphertext[NONCE_LEN..]) {
            Ok(plaintext) => {
                self.limiter.record_attempt(DECRYPT_LIMIT_KEY, true)?;
                Ok(Zeroizing::new(plaintext))
            }
            Err(_) => {
                self.limiter.record_attempt(DECRYPT_LIMIT_KEY, false)?;
                Err(HardenError::InvalidPassword)
            }
        }
    }

    pub fn decrypt_payload(
        &self,
        payload: &EncryptedPayload,
        password: &str,
    ) -> Result<Zeroizing<Vec<u8>>, HardenError> {
        self.decrypt(
            &payload.ciphertext,
            password,
            &payload.salt,
            Some(&payload.verification_tag),
        )
    }

    // ── File operations ─────────────────────────────────────────────────────

    /// Encrypt `path` into `<path>.enc`. The original is moved into the
    /// per-directory quarantine zone when enabled, never deleted.
    pub fn encrypt_file(
        &self,
        path: &Path,
        password: &str,
        progress: Option<&ProgressFn>,
    ) -> Result<EncryptFileReport, HardenError> {
        let meta = fs::symlink_metadata(path)?;
        if meta.file_type().is_symlink() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("refusing to encrypt through symlink {}", path.display()),
            )
            .into());
        }
        let total = meta.len();
        if total > self.max_file_bytes {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "{} is {} bytes, above the {} byte encryption limit",
                    path.display(),
                    total,
                    self.max_file_bytes
                ),
            )
            .into());
        }

        let plaintext = read_chunked(path, total, progress)?;
        let payload = self.encrypt(&plaintext, password)?;

        let mut enc_name = path.as_os_str().to_os_string();
        enc_name.push(".");
        enc_name.push(ENCRYPTED_EXTENSION);
        let encrypted_path = PathBuf::from(enc_name);

        write_container(&encrypted_path, &payload)?;
        paths::restrict_file_permissions(&encrypted_path);

        let quarantined_original = if self.quarantine_originals {
            match QuarantineZone::for_file(path).and_then(|zone| zone.quarantine_file(path)) {
                Ok(moved) => moved,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "could not quarantine original after encryption"
                    );
                    None
                }
            }
        } else {
            None
        };

        info!(path = %path.display(), bytes = total, "file encrypted");
        self.audit.log_event(
            "file_encrypted",
            Some(path),
            &format!("Encrypted to {} ({} bytes)", encrypted_path.display(), total),
            Severity::Info,
        );

        Ok(EncryptFileReport {
            encrypted_path,
            quarantined_original,
        })
    }

    /// Decrypt `<name>.enc` back to `<name>`.
    pub fn decrypt_file(
        &self,
        path: &Path,
        password: &str,
        progress: Option<&ProgressFn>,
    ) -> Result<PathBuf, HardenError> {
        if path.extension().and_then(|e| e.to_str()) != Some(ENCRYPTED_EXTENSION) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} does not carry the .enc extension", path.display()),
            )
            .into());
        }

        let total = fs::metadata(path)?.len();
        let container = read_chunked(path, total, progress)?;
        let payload = EncryptedPayload::from_bytes(&container)?;
        let plaintext = self.decrypt_payload(&payload, password)?;

        let output = path.with_extension("");
        let file = File::create(&output)?;
        let mut writer = BufWriter::new(file);
        for chunk in plaintext.chunks(IO_CHUNK) {
            writer.write_all(chunk)?;
        }
        writer.flush()?;
        writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;
        paths::restrict_file_permissions(&output);

        info!(path = %output.display(), bytes = plaintext.len(), "file decrypted");
        self.audit.log_event(
            "file_decrypted",
            Some(&output),
            &format!("Decrypted from {}", path.display()),
            Severity::Info,
        );

        Ok(output)
    }
}

fn read_chunked(
    path: &Path,
    total: u64,
    progress: Option<&ProgressFn>,
) -> Result<Zeroizing<Vec<u8>>, HardenError> {
    let file = File::open(path)?;
    let mut reader = BufReader::with_capacity(IO_CHUNK, file);
    let mut data = Zeroizing::new(Vec::with_capacity(total as usize));
    let mut buf = vec![0u8; IO_CHUNK];
    let mut done = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        done += n as u64;
        if let Some(cb) = progress {
            cb(done, total);
        }
    }
    Ok(data)
}

fn write_container(path: &Path, payload: &EncryptedPayload) -> Result<(), HardenError> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    writer.write_all(&payload.salt)?;
    writer.write_all(&payload.verification_tag)?;
    for chunk in payload.ciphertext.chunks(IO_CHUNK) {
        writer.write_all(chunk)?;
    }
    writer.flush()?;
    writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::RateLimitSettings;
    use crate::store::Store;
    use tempfile::tempdir;

    // Low iteration count keeps derivation cheap; the container layout and
    // error paths do not depend on it.
    fn test_engine(max_attempts: u32) -> (CryptoEngine, Arc<RateLimiter>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let limiter = Arc::new(RateLimiter::new(
            store.clone(),
            &RateLimitSettings {
                max_attempts,
                window_seconds: 300,
            },
        ));
        let audit = Arc::new(AuditLedger::new(store));
        let engine = CryptoEngine {
            limiter: limiter.clone(),
            audit,
            kdf_iterations: 1_000,
            max_file_bytes: 8 * 1024 * 1024,
            quarantine_originals: true,
        };
        (engine, limiter)
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let (engine, _) = test_engine(5);
        let payload = engine.encrypt(b"attack at dawn", "hunter2!").unwrap();
        let plaintext = engine
            .decrypt(
                &payload.ciphertext,
                "hunter2!",
                &payload.salt,
                Some(&payload.verification_tag),
            )
            .unwrap();
        assert_eq!(&plaintext[..], b"attack at dawn");
    }

    #[test]
    fn wrong_password_is_invalid_password_and_counts() {
        let (engine, limiter) = test_engine(5);
        let payload = engine.encrypt(b"data", "correct").unwrap();
        let err = engine.decrypt_payload(&payload, "incorrect").unwrap_err();
        assert!(matches!(err, HardenError::InvalidPassword));
        assert_eq!(
            limiter.check_limit(DECRYPT_LIMIT_KEY).unwrap().current_attempts,
            1
        );
    }

    #[test]
    fn lockout_blocks_even_the_correct_password() {
        let (engine, _) = test_engine(3);
        let payload = engine.encrypt(b"data", "correct").unwrap();
        for _ in 0..3 {
            let err = engine.decrypt_payload(&payload, "nope").unwrap_err();
            assert!(matches!(err, HardenError::InvalidPassword));
        }
        let err = engine.decrypt_payload(&payload, "correct").unwrap_err();
        assert!(matches!(err, HardenError::RateLimited { .. }));
    }

    #[test]
    fn success_resets_the_counter() {
        let (engine, limiter) = test_engine(5);
        let payload = engine.encrypt(b"data", "correct").unwrap();
        for _ in 0..2 {
            let _ = engine.decrypt_payload(&payload, "nope");
        }
        engine.decrypt_payload(&payload, "correct").unwrap();
        assert_eq!(
            limiter.check_limit(DECRYPT_LIMIT_KEY).unwrap().current_attempts,
            0
        );
    }

    #[test]
    fn container_bytes_round_trip_and_truncation() {
        let (engine, _) = test_engine(5);
        let payload = engine.encrypt(b"payload bytes", "pw").unwrap();
        let bytes = payload.to_bytes();
        let parsed = EncryptedPayload::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.salt, payload.salt);
        assert_eq!(parsed.verification_tag, payload.verification_tag);
        assert_eq!(parsed.ciphertext, payload.ciphertext);

        let err = EncryptedPayload::from_bytes(&bytes[..40]).unwrap_err();
        assert!(matches!(err, HardenError::DecryptionError(_)));
    }

    #[test]
    fn verification_tag_matches_only_the_right_password() {
        let salt = generate_salt();
        let tag = verification_tag("s3cret", &salt);
        assert!(verify_password("s3cret", &salt, &tag));
        assert!(!verify_password("s3cret?", &salt, &tag));
    }

    #[test]
    fn strength_scoring_is_additive() {
        let weak = check_password_strength("");
        assert_eq!(weak.score, 0);
        assert_eq!(weak.label, "Very Weak");
        assert_eq!(weak.feedback.len(), 6);

        let medium = check_password_strength("abcdefgh");
        assert_eq!(medium.score, 2); // length >= 8 plus lowercase

        let full = check_password_strength("Str0ng!Passw0rd+");
        assert_eq!(full.score, 6);
        assert_eq!(full.label, "Unbreakable");
        assert!(full.feedback.is_empty());
    }

    #[test]
    fn generated_passwords_draw_from_the_alphabet() {
        let pw = generate_secure_password(32);
        assert_eq!(pw.len(), 32);
        assert!(pw.bytes().all(|b| PASSWORD_ALPHABET.contains(&b)));
        assert_ne!(pw, generate_secure_password(32));
    }

    #[test]
    fn encrypt_file_quarantines_and_decrypt_file_restores() {
        let dir = tempdir().unwrap();
        let original = dir.path().join("notes.txt");
        fs::write(&original, b"meeting at noon").unwrap();

        let (engine, _) = test_engine(5);
        let report = engine.encrypt_file(&original, "pw!", None).unwrap();
        assert!(report.encrypted_path.exists());
        assert!(!original.exists());
        let quarantined = report.quarantined_original.unwrap();
        assert!(quarantined.exists());
        assert_eq!(fs::read(&quarantined).unwrap(), b"meeting at noon");

        let restored = engine
            .decrypt_file(&report.encrypted_path, "pw!", None)
            .unwrap();
        assert_eq!(restored, original);
        assert_eq!(fs::read(&restored).unwrap(), b"meeting at noon");
    }

    #[test]
    fn decrypt_file_requires_enc_extension() {
        let dir = tempdir().unwrap();
        let plain = dir.path().join("notes.txt");
        fs::write(&plain, b"x").unwrap();
        let (engine, _) = test_engine(5);
        let err = engine.decrypt_file(&plain, "pw", None).unwrap_err();
        assert!(matches!(err, HardenError::Io(_)));
    }

    #[test]
    fn oversized_files_are_refused() {
        let dir = tempdir().unwrap();
        let big = dir.path().join("big.bin");
        fs::write(&big, vec![0u8; 64]).unwrap();

        let store = Arc::new(Store::open_in_memory().unwrap());
        let limiter = Arc::new(RateLimiter::new(
            store.clone(),
            &RateLimitSettings {
                max_attempts: 5,
                window_seconds: 300,
            },
        ));
        let audit = Arc::new(AuditLedger::new(store));
        let engine = CryptoEngine {
            limiter,
            audit,
            kdf_iterations: 1_000,
            max_file_bytes: 32,
            quarantine_originals: false,
        };
        let err = engine.encrypt_file(&big, "pw", None).unwrap_err();
        assert!(matches!(err, HardenError::Io(_)));
    }
}
