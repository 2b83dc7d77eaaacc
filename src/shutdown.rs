//! Signal trapping for graceful process shutdown.
//!
//! Adapted directly from the host's `shutdown` module (`ShutdownState`'s
//! atomic-flag-plus-`Arc` shape, `register_signal_handlers`'s SIGINT/
//! SIGTERM/SIGHUP trio on Unix and `ctrlc` on Windows) narrowed to this
//! crate's own cleanup shape: runs that were mid-flight get marked
//! `stopped` in the registry rather than the host's worktree/agent
//! bookkeeping.

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared shutdown flag, cheaply clonable and checked from any task.
#[derive(Clone)]
pub struct ShutdownState {
    shutdown_requested: Arc<AtomicBool>,
    cleanup_complete: Arc<AtomicBool>,
}

impl ShutdownState {
    pub fn new() -> Self {
        Self {
            shutdown_requested: Arc::new(AtomicBool::new(false)),
            cleanup_complete: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
        log::info!("shutdown requested");
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    pub fn mark_cleanup_complete(&self) {
        self.cleanup_complete.store(true, Ordering::SeqCst);
        log::info!("cleanup complete");
    }

    pub fn is_cleanup_complete(&self) -> bool {
        self.cleanup_complete.load(Ordering::SeqCst)
    }
}

impl Default for ShutdownState {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of one graceful-shutdown cleanup pass.
#[derive(Debug, Clone, Default)]
pub struct ShutdownResult {
    /// Runs whose registry row was transitioned to `stopped`.
    pub runs_stopped: usize,
    pub errors: Vec<String>,
}

impl ShutdownResult {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Drives one cleanup pass and records that it happened.
pub struct ShutdownHandler {
    state: ShutdownState,
}

impl ShutdownHandler {
    pub fn new() -> Self {
        Self {
            state: ShutdownState::new(),
        }
    }

    pub fn with_state(state: ShutdownState) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &ShutdownState {
        &self.state
    }

    pub fn handle_shutdown<F>(&self, cleanup_fn: F) -> Result<ShutdownResult>
    where
        F: FnOnce() -> Result<ShutdownResult>,
    {
        self.state.request_shutdown();
        log::info!("starting graceful shutdown...");

        let result = cleanup_fn()?;

        log::info!("shutdown complete: {} runs stopped", result.runs_stopped);
        for error in &result.errors {
            log::warn!("cleanup error: {}", error);
        }

        self.state.mark_cleanup_complete();
        Ok(result)
    }
}

impl Default for ShutdownHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
pub fn register_signal_handlers(state: ShutdownState) -> Result<()> {
    use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;
    use std::thread;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])
        .map_err(|e| anyhow::anyhow!("failed to register signal handlers: {}", e))?;

    thread::spawn(move || {
        for signal in signals.forever() {
            match signal {
                SIGINT => log::info!("received SIGINT"),
                SIGTERM => log::info!("received SIGTERM"),
                SIGHUP => log::info!("received SIGHUP"),
                _ => {}
            }
            state.request_shutdown();
        }
    });

    log::info!("signal handlers registered (SIGINT, SIGTERM, SIGHUP)");
    Ok(())
}

#[cfg(windows)]
pub fn register_signal_handlers(state: ShutdownState) -> Result<()> {
    ctrlc::set_handler(move || {
        log::info!("received Ctrl+C");
        state.request_shutdown();
    })
    .map_err(|e| anyhow::anyhow!("failed to register Ctrl+C handler: {}", e))?;

    log::info!("signal handler registered (Ctrl+C)");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_state_has_no_flags_set() {
        let state = ShutdownState::new();
        assert!(!state.is_shutdown_requested());
        assert!(!state.is_cleanup_complete());
    }

    #[test]
    fn request_shutdown_sets_flag() {
        let state = ShutdownState::new();
        state.request_shutdown();
        assert!(state.is_shutdown_requested());
    }

    #[test]
    fn clone_shares_state() {
        let state = ShutdownState::new();
        let clone = state.clone();
        state.request_shutdown();
        assert!(clone.is_shutdown_requested());
    }

    #[test]
    fn handle_shutdown_runs_cleanup_and_marks_complete() {
        let handler = ShutdownHandler::new();
        let result = handler
            .handle_shutdown(|| {
                Ok(ShutdownResult {
                    runs_stopped: 2,
                    errors: vec![],
                })
            })
            .unwrap();
        assert_eq!(result.runs_stopped, 2);
        assert!(result.is_clean());
        assert!(handler.state().is_shutdown_requested());
        assert!(handler.state().is_cleanup_complete());
    }
}
