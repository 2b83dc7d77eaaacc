//! Agent Runner — spawns the configured external agent as a PTY child
//! process, collects its full output, strips terminal escape sequences
//! (spec.md §4.7).
//!
//! PTY allocation and the master/reader/writer split are grounded in the
//! host's `server::pty_registry::PtySession::new` (`native_pty_system`,
//! `openpty`, `try_clone_reader`, `take_writer`); binary resolution
//! mirrors the host's layered lookup in `agents::manager::AgentSpawnConfig`
//! generalized to spec.md's explicit `<HOME>/.amp/bin/amp` →
//! `<project_path>/node_modules/.bin/amp` → PATH chain.

use crate::extractor::ansi::strip_ansi;
use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Fixed PTY geometry the agent is invoked with (spec.md §4.7).
const PTY_ROWS: u16 = 40;
const PTY_COLS: u16 = 120;

/// Grace period between SIGTERM and SIGKILL on timeout (spec.md §4.7).
const KILL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("failed to allocate pty: {0}")]
    PtyAllocation(String),
    #[error("failed to spawn agent binary {binary:?}: {source}")]
    Spawn { binary: PathBuf, source: String },
    #[error("agent exited with exit code {0}")]
    NonZeroExit(i32),
    #[error("agent timed out after {0}ms")]
    Timeout(u64),
    #[error("agent process error: {0}")]
    Io(String),
}

/// Outcome of one successful agent run.
pub struct AgentOutput {
    pub raw_output: String,
    pub duration_ms: u64,
}

/// Resolve the agent binary: `<HOME>/.amp/bin/<name>`, then
/// `<project_path>/node_modules/.bin/<name>`, then the bare name on PATH
/// (spec.md §4.7 "Binary resolution").
pub fn resolve_binary(binary_name: &str, project_path: &Path) -> PathBuf {
    if let Some(home) = dirs::home_dir() {
        let candidate = home.join(".amp").join("bin").join(binary_name);
        if candidate.is_file() {
            return candidate;
        }
    }

    let local = project_path.join("node_modules").join(".bin").join(binary_name);
    if local.is_file() {
        return local;
    }

    which::which(binary_name).unwrap_or_else(|_| PathBuf::from(binary_name))
}

/// Run the agent in a PTY, blocking until it exits or the optional
/// timeout elapses.
///
/// `run(prompt, cwd) → full_output_string` per spec.md §4.7, generalized
/// to also carry the resolved binary name, project path (for binary
/// resolution), and an optional timeout.
pub async fn run(
    binary_name: &str,
    prompt: &str,
    cwd: &Path,
    project_path: &Path,
    timeout_ms: Option<u64>,
) -> Result<AgentOutput, AgentError> {
    let binary = resolve_binary(binary_name, project_path);
    let mut cmd = CommandBuilder::new(&binary);
    cmd.arg("--execute");
    cmd.arg(prompt);
    cmd.cwd(cwd);

    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows: PTY_ROWS,
            cols: PTY_COLS,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| AgentError::PtyAllocation(e.to_string()))?;

    let mut child = pair.slave.spawn_command(cmd).map_err(|e| AgentError::Spawn {
        binary: binary.clone(),
        source: e.to_string(),
    })?;
    drop(pair.slave);
    let pid = child.process_id();

    let mut reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| AgentError::Io(format!("failed to clone pty reader: {}", e)))?;
    // Keep the master alive for the duration of the read loop; dropping it
    // early can close the slave side on some platforms.
    let _master = pair.master;

    let started = Instant::now();

    let read_handle = tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; 8192];
        let mut out = Vec::new();
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(_) => break,
            }
        }
        out
    });

    let wait_handle = tokio::task::spawn_blocking(move || child.wait());

    let exit_status = match timeout_ms {
        Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), wait_handle).await {
            Ok(joined) => joined.map_err(|e| AgentError::Io(e.to_string()))?.map_err(|e| AgentError::Io(e.to_string()))?,
            Err(_elapsed) => {
                if let Some(pid) = pid {
                    terminate_pid(pid);
                    tokio::time::sleep(KILL_GRACE).await;
                    kill_pid(pid);
                }
                return Err(AgentError::Timeout(ms));
            }
        },
        None => wait_handle
            .await
            .map_err(|e| AgentError::Io(e.to_string()))?
            .map_err(|e| AgentError::Io(e.to_string()))?,
    };

    let duration_ms = started.elapsed().as_millis() as u64;
    let raw_bytes = read_handle.await.map_err(|e| AgentError::Io(e.to_string()))?;
    let raw_text = String::from_utf8_lossy(&raw_bytes).to_string();
    let sanitized = strip_ansi(&raw_text);

    if !exit_status.success() {
        let code = exit_status.exit_code() as i32;
        return Err(AgentError::NonZeroExit(code));
    }

    Ok(AgentOutput {
        raw_output: sanitized,
        duration_ms,
    })
}

/// Send SIGTERM to a child process, the first half of the timeout
/// kill sequence (spec.md §4.7 "Timeouts").
#[cfg(unix)]
pub fn terminate_pid(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
pub fn terminate_pid(_pid: u32) {}

/// Send SIGKILL, the second half of the timeout kill sequence, invoked
/// after `KILL_GRACE` has elapsed since `terminate_pid`.
#[cfg(unix)]
pub fn kill_pid(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
pub fn kill_pid(_pid: u32) {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn resolve_binary_falls_back_to_path_lookup_name() {
        let dir = TempDir::new().unwrap();
        let resolved = resolve_binary("definitely-not-a-real-binary-xyz", dir.path());
        assert_eq!(resolved, PathBuf::from("definitely-not-a-real-binary-xyz"));
    }

    #[test]
    fn resolve_binary_prefers_project_local_bin() {
        let dir = TempDir::new().unwrap();
        let bin_dir = dir.path().join("node_modules").join(".bin");
        std::fs::create_dir_all(&bin_dir).unwrap();
        let bin_path = bin_dir.join("amp");
        std::fs::write(&bin_path, b"#!/bin/sh\n").unwrap();
        assert_eq!(resolve_binary("amp", dir.path()), bin_path);
    }
}
