//! Session Store — durable, crash-safe session state and lock management
//! for one change directory (spec.md §4.3).
//!
//! Grounded in the host's `ralph_loop::config::ConfigManager` (read/write a
//! single state file under a project-relative dotdir) and
//! `session::recovery::SessionRecovery` (status transitions on crash
//! detection), combined with `session::lock::SessionLock` for the lock
//! file itself.

pub mod lock;
pub mod types;

use crate::clock::ClockProbe;
use crate::fsutil::{atomic_write_json, ensure_dir, read_json_opt};
use anyhow::{anyhow, Result};
use lock::{ChangeLock, LockCheck};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use types::{ErrorHandlingConfig, SessionState, SESSION_SCHEMA_VERSION};

/// Errors the Session Store can raise. Corruption is fatal and is never
/// auto-repaired (spec.md §7).
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session.json is corrupt: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

/// Durable store for one change's `.ralph/` directory.
pub struct SessionStore {
    ralph_dir: PathBuf,
    clock: Arc<dyn ClockProbe>,
}

impl SessionStore {
    pub fn new(change_dir: &Path, clock: Arc<dyn ClockProbe>) -> Self {
        Self {
            ralph_dir: change_dir.join(".ralph"),
            clock,
        }
    }

    pub fn ralph_dir(&self) -> &Path {
        &self.ralph_dir
    }

    fn session_path(&self) -> PathBuf {
        self.ralph_dir.join("session.json")
    }

    /// Create `.ralph/` and `.ralph/iterations/` if missing.
    pub fn ensure_dirs(&self) -> Result<()> {
        ensure_dir(&self.ralph_dir).map_err(|e| anyhow!(e))?;
        ensure_dir(&self.ralph_dir.join("iterations")).map_err(|e| anyhow!(e))?;
        Ok(())
    }

    /// Read `session.json`. Returns `Ok(None)` if absent (recoverable —
    /// callers should initialize fresh). Corrupt contents are a fatal,
    /// typed error that the Engine must not attempt to repair.
    pub fn read(&self) -> Result<Option<SessionState>, SessionError> {
        let path = self.session_path();
        match read_json_opt::<SessionState>(&path) {
            Ok(Some(mut state)) => {
                if state.schema_version != SESSION_SCHEMA_VERSION {
                    log::warn!(
                        "session {} has schema version {}, expected {} — using as-is (no migrations defined yet)",
                        state.session_id,
                        state.schema_version,
                        SESSION_SCHEMA_VERSION
                    );
                    state.schema_version = SESSION_SCHEMA_VERSION;
                }
                Ok(Some(state))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(SessionError::Corrupt(e)),
        }
    }

    /// Atomically persist `state` (write-temp, fsync, rename — spec.md §4.3).
    pub fn write(&self, state: &SessionState) -> Result<(), SessionError> {
        atomic_write_json(&self.session_path(), state)
            .map_err(|e| SessionError::Io(anyhow!(e)))
    }

    /// Build a fresh session for a change that has never run before.
    pub fn create_initial(
        &self,
        session_id: String,
        change_id: String,
        max_iterations: u32,
        error_handling: ErrorHandlingConfig,
    ) -> SessionState {
        SessionState::new_initial(session_id, change_id, max_iterations, error_handling)
    }

    /// Construct the lock manager for this change's `.ralph/.lock`.
    pub fn lock(&self) -> ChangeLock {
        ChangeLock::new(&self.ralph_dir, self.clock.clone())
    }

    /// Check lock status without acquiring (spec.md §4.3 `check_lock`).
    pub fn check_lock(&self) -> Result<LockCheck> {
        self.lock().check()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use tempfile::TempDir;
    use types::SessionStatus;

    fn store(dir: &Path) -> SessionStore {
        SessionStore::new(dir, Arc::new(SystemClock))
    }

    #[test]
    fn read_missing_session_is_none() {
        let dir = TempDir::new().unwrap();
        let store = store(dir.path());
        assert!(store.read().unwrap().is_none());
    }

    #[test]
    fn write_then_read_round_trips_byte_identical_after_pretty_print() {
        let dir = TempDir::new().unwrap();
        let store = store(dir.path());
        store.ensure_dirs().unwrap();
        let state = store.create_initial(
            "sess-1".into(),
            "change-1".into(),
            10,
            ErrorHandlingConfig::default(),
        );
        store.write(&state).unwrap();
        let read_back = store.read().unwrap().unwrap();
        assert_eq!(
            serde_json::to_string(&read_back).unwrap(),
            serde_json::to_string(&state).unwrap()
        );
        assert_eq!(read_back.status, SessionStatus::Running);
    }

    #[test]
    fn corrupt_session_is_a_typed_fatal_error() {
        let dir = TempDir::new().unwrap();
        let store = store(dir.path());
        store.ensure_dirs().unwrap();
        std::fs::write(dir.path().join(".ralph").join("session.json"), b"{not json").unwrap();
        match store.read() {
            Err(SessionError::Corrupt(_)) => {}
            other => panic!("expected Corrupt error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn ensure_dirs_creates_iterations_subdir() {
        let dir = TempDir::new().unwrap();
        let store = store(dir.path());
        store.ensure_dirs().unwrap();
        assert!(dir.path().join(".ralph").join("iterations").is_dir());
    }
}
