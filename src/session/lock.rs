//! `.ralph/.lock` management — crash detection via pid liveness + age.
//!
//! Adapted from the host's `session::lock::SessionLock`
//! (`examples/dario-valles-Ralph-UI/src-tauri/src/session/lock.rs`), which
//! already implements exactly this pid-liveness-or-age staleness test. This
//! version drops the host's per-session lock filename
//! (`session-{id}.lock`) for the single fixed `.lock` file spec.md §3/§6
//! names, since the CORE scopes one lock per change directory rather than
//! per session id.

use crate::clock::ClockProbe;
use crate::fsutil::{atomic_write_json, ensure_dir};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Default staleness threshold: 5 minutes (spec.md §3, §5, §8).
pub const DEFAULT_STALE_THRESHOLD_SECS: i64 = 5 * 60;

/// Contents of the `.ralph/.lock` file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
}

impl LockInfo {
    fn new(session_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            pid: std::process::id(),
            timestamp: now,
            session_id: session_id.to_string(),
        }
    }
}

/// Outcome of checking the lock before acquisition, per spec.md §4.3 `check_lock`.
#[derive(Debug, Clone)]
pub enum LockCheck {
    /// No lock file present.
    Free,
    /// Lock file present, owner alive and fresh — MUST NOT be replaced.
    Locked { info: LockInfo },
    /// Lock file present but stale (dead owner or age > threshold) — MAY be replaced.
    Stale { info: LockInfo },
}

/// Manages the single `.ralph/.lock` file for one change directory.
pub struct ChangeLock {
    lock_path: PathBuf,
    clock: Arc<dyn ClockProbe>,
    stale_threshold_secs: i64,
    owned: bool,
}

impl ChangeLock {
    pub fn new(ralph_dir: &Path, clock: Arc<dyn ClockProbe>) -> Self {
        Self {
            lock_path: ralph_dir.join(".lock"),
            clock,
            stale_threshold_secs: DEFAULT_STALE_THRESHOLD_SECS,
            owned: false,
        }
    }

    pub fn with_stale_threshold_secs(mut self, secs: i64) -> Self {
        self.stale_threshold_secs = secs;
        self
    }

    pub fn path(&self) -> &Path {
        &self.lock_path
    }

    /// Read the current lock file, if any, without taking ownership.
    pub fn check(&self) -> Result<LockCheck> {
        if !self.lock_path.exists() {
            return Ok(LockCheck::Free);
        }
        let info = self.read()?;
        if self.is_stale(&info) {
            Ok(LockCheck::Stale { info })
        } else {
            Ok(LockCheck::Locked { info })
        }
    }

    /// Acquire the lock, taking over a stale lock if present. Fails if the
    /// lock is held by a live, fresh owner — per spec.md §4.2 step 1.
    pub fn acquire(&mut self, session_id: &str) -> Result<()> {
        match self.check()? {
            LockCheck::Locked { info } => Err(anyhow!(
                "change is locked by live process {} (session {})",
                info.pid,
                info.session_id
            )),
            LockCheck::Free | LockCheck::Stale { .. } => {
                ensure_dir(self.lock_path.parent().unwrap())
                    .map_err(|e| anyhow!(e))?;
                let info = LockInfo::new(session_id, self.clock.now());
                atomic_write_json(&self.lock_path, &info).map_err(|e| anyhow!(e))?;
                self.owned = true;
                Ok(())
            }
        }
    }

    /// Release the lock. Deleting a missing lock is not an error.
    pub fn release(&mut self) -> Result<()> {
        if self.lock_path.exists() {
            fs::remove_file(&self.lock_path)
                .map_err(|e| anyhow!("failed to remove lock file {:?}: {}", self.lock_path, e))?;
        }
        self.owned = false;
        Ok(())
    }

    pub fn is_owned(&self) -> bool {
        self.owned
    }

    fn read(&self) -> Result<LockInfo> {
        let content = fs::read_to_string(&self.lock_path)
            .map_err(|e| anyhow!("failed to read lock file {:?}: {}", self.lock_path, e))?;
        serde_json::from_str(&content).map_err(|e| anyhow!("failed to parse lock file: {}", e))
    }

    fn is_stale(&self, info: &LockInfo) -> bool {
        let age_secs = (self.clock.now() - info.timestamp).num_seconds();
        age_secs > self.stale_threshold_secs || !self.clock.is_process_alive(info.pid)
    }
}

impl Drop for ChangeLock {
    fn drop(&mut self) {
        if self.owned {
            let _ = self.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ClockProbe;
    use chrono::Duration;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Deterministic clock for testing staleness without real sleeps.
    struct FakeClock {
        now: Mutex<DateTime<Utc>>,
        alive_pids: Mutex<Vec<u32>>,
    }

    impl FakeClock {
        fn new() -> Self {
            Self {
                now: Mutex::new(Utc::now()),
                alive_pids: Mutex::new(vec![std::process::id()]),
            }
        }

        fn advance(&self, d: Duration) {
            *self.now.lock().unwrap() += d;
        }

        fn kill(&self, pid: u32) {
            self.alive_pids.lock().unwrap().retain(|p| *p != pid);
        }
    }

    impl ClockProbe for FakeClock {
        fn now(&self) -> DateTime<Utc> {
            *self.now.lock().unwrap()
        }

        fn is_process_alive(&self, pid: u32) -> bool {
            self.alive_pids.lock().unwrap().contains(&pid)
        }
    }

    #[test]
    fn acquire_on_free_lock_succeeds() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(FakeClock::new());
        let mut lock = ChangeLock::new(dir.path(), clock);
        lock.acquire("sess-1").unwrap();
        assert!(lock.path().exists());
        assert!(lock.is_owned());
    }

    #[test]
    fn acquire_against_live_fresh_owner_fails() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(FakeClock::new());
        let mut owner = ChangeLock::new(dir.path(), clock.clone());
        owner.acquire("sess-owner").unwrap();

        let mut contender = ChangeLock::new(dir.path(), clock);
        let err = contender.acquire("sess-contender").unwrap_err();
        assert!(err.to_string().contains("locked by live process"));
        assert!(!contender.is_owned());
    }

    #[test]
    fn stale_by_age_is_replaceable() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(FakeClock::new());
        let mut owner = ChangeLock::new(dir.path(), clock.clone());
        owner.acquire("sess-owner").unwrap();
        owner.owned = false; // simulate the owner process dying without cleanup

        clock.advance(Duration::minutes(6));

        let mut contender = ChangeLock::new(dir.path(), clock);
        contender.acquire("sess-contender").unwrap();
        assert!(contender.is_owned());
    }

    #[test]
    fn stale_by_dead_pid_is_replaceable() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(FakeClock::new());
        let mut owner = ChangeLock::new(dir.path(), clock.clone());
        owner.acquire("sess-owner").unwrap();
        let owner_pid = std::process::id();
        owner.owned = false;
        clock.kill(owner_pid);

        let mut contender = ChangeLock::new(dir.path(), clock);
        contender.acquire("sess-contender").unwrap();
        assert!(contender.is_owned());
    }

    #[test]
    fn release_on_missing_lock_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(FakeClock::new());
        let mut lock = ChangeLock::new(dir.path(), clock);
        lock.release().unwrap();
    }

    #[test]
    fn drop_releases_owned_lock() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(FakeClock::new());
        {
            let mut lock = ChangeLock::new(dir.path(), clock);
            lock.acquire("sess-1").unwrap();
        }
        assert!(!dir.path().join(".lock").exists());
    }
}
