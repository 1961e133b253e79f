//! Sliding-window rate limiter persisted in the store, so a process restart
//! does not reset an attacker's lockout.
//!
//! Rows in `rate_limit_attempts` are one row per failed attempt. A key is
//! locked when the count of rows inside the trailing window reaches the
//! configured maximum; a successful attempt deletes every row for the key.
//!
//! Callers running a check-then-record sequence must hold the per-key lock
//! from [`RateLimiter::key_lock`] across the whole sequence. `check_limit`
//! and `record_attempt` do not take it themselves.

use chrono::{Duration, Utc};
use parking_lot::Mutex;
use rusqlite::params;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::HardenError;
use crate::settings::RateLimitSettings;
use crate::store::{self, Store};

#[derive(Debug, Clone, Serialize)]
pub struct LimitStatus {
    pub allowed: bool,
    pub current_attempts: u32,
    pub remaining: u32,
    pub wait_seconds: u64,
}

pub struct RateLimiter {
    store: Arc<Store>,
    max_attempts: u32,
    window_seconds: u64,
    key_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RateLimiter {
    pub fn new(store: Arc<Store>, settings: &RateLimitSettings) -> Self {
        Self {
            store,
            max_attempts: settings.max_attempts,
            window_seconds: settings.window_seconds,
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Per-key mutex serializing read-modify-write sequences for `key`.
    pub fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.key_locks.lock();
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Prune expired rows for `key`, then report whether another attempt is
    /// allowed. `wait_seconds` is derived from the oldest surviving row when
    /// the key is locked.
    pub fn check_limit(&self, key: &str) -> Result<LimitStatus, HardenError> {
        let cutoff = store::format_rfc3339(Utc::now() - Duration::seconds(self.window_seconds as i64));
        let conn = self.store.conn();

        conn.execute(
            "DELETE FROM rate_limit_attempts WHERE key = ?1 AND timestamp < ?2",
            params![key, cutoff],
        )?;

        let current_attempts: u32 = conn.query_row(
            "SELECT COUNT(*) FROM rate_limit_attempts WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )?;

        let allowed = current_attempts < self.max_attempts;
        let remaining = self.max_attempts.saturating_sub(current_attempts);

        let wait_seconds = if allowed {
            0
        } else {
            let oldest: Option<String> = conn.query_row(
                "SELECT MIN(timestamp) FROM rate_limit_attempts WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )?;
            oldest
                .and_then(|raw| store::parse_rfc3339(&raw))
                .map(|ts| {
                    let elapsed = (Utc::now() - ts).num_seconds().max(0) as u64;
                    self.window_seconds.saturating_sub(elapsed)
                })
                .unwrap_or(self.window_seconds)
        };

        debug!(key, current_attempts, allowed, wait_seconds, "rate limit check");
        Ok(LimitStatus {
            allowed,
            current_attempts,
            remaining,
            wait_seconds,
        })
    }

    /// Record the outcome of an attempt. Success resets the counter for the
    /// key; failure adds one row stamped with the current time.
    pub fn record_attempt(&self, key: &str, success: bool) -> Result<(), HardenError> {
        let conn = self.store.conn();
        if success {
            conn.execute(
                "DELETE FROM rate_limit_attempts WHERE key = ?1",
                params![key],
            )?;
        } else {
            conn.execute(
                "INSERT INTO rate_limit_attempts (key, timestamp) VALUES (?1, ?2)",
                params![key, store::now_rfc3339()],
            )?;
        }
        Ok(())
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_attempts: u32, window_seconds: u64) -> RateLimiter {
        let store = Arc::new(Store::open_in_memory().unwrap());
        RateLimiter::new(
            store,
            &RateLimitSettings {
                max_attempts,
                window_seconds,
            },
        )
    }

    #[test]
    fn locks_after_max_failures() {
        let limiter = limiter(3, 300);
        for _ in 0..3 {
            assert!(limiter.check_limit("decrypt").unwrap().allowed);
            limiter.record_attempt("decrypt", false).unwrap();
        }
        let status = limiter.check_limit("decrypt").unwrap();
        assert!(!status.allowed);
        assert_eq!(status.current_attempts, 3);
        assert_eq!(status.remaining, 0);
        assert!(status.wait_seconds > 0 && status.wait_seconds <= 300);
    }

    #[test]
    fn success_resets_counter() {
        let limiter = limiter(3, 300);
        for _ in 0..3 {
            limiter.record_attempt("decrypt", false).unwrap();
        }
        assert!(!limiter.check_limit("decrypt").unwrap().allowed);

        limiter.record_attempt("decrypt", true).unwrap();
        let status = limiter.check_limit("decrypt").unwrap();
        assert!(status.allowed);
        assert_eq!(status.current_attempts, 0);
        assert_eq!(status.remaining, 3);
    }

    #[test]
    fn expired_attempts_are_pruned() {
        let limiter = limiter(2, 1);
        limiter.record_attempt("k", false).unwrap();
        limiter.record_attempt("k", false).unwrap();
        assert!(!limiter.check_limit("k").unwrap().allowed);

        std::thread::sleep(std::time::Duration::from_millis(1100));
        let status = limiter.check_limit("k").unwrap();
        assert!(status.allowed);
        assert_eq!(status.current_attempts, 0);
    }

    #[test]
    fn keys_are_independent() {
        let limiter = limiter(1, 300);
        limiter.record_attempt("a", false).unwrap();
        assert!(!limiter.check_limit("a").unwrap().allowed);
        assert!(limiter.check_limit("b").unwrap().allowed);
    }

    #[test]
    fn key_lock_serializes_sequences() {
        let limiter = Arc::new(limiter(5, 300));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let limiter = limiter.clone();
            handles.push(std::thread::spawn(move || {
                let lock = limiter.key_lock("shared");
                let _guard = lock.lock();
                let before = limiter.check_limit("shared").unwrap().current_attempts;
                limiter.record_attempt("shared", false).unwrap();
                let after = limiter.check_limit("shared").unwrap().current_attempts;
                (before, after)
            }));
        }
        let mut observed = Vec::new();
        for h in handles {
            observed.push(h.join().unwrap());
        }
        // Each thread must have seen its own insert land exactly once.
        for (before, after) in observed {
            assert_eq!(after, before + 1);
        }
        assert_eq!(
            limiter.check_limit("shared").unwrap().current_attempts,
            4
        );
    }
}
