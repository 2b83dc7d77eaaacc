//! Iteration Store — append-only iteration logs + derived progress summary
//! (spec.md §4.4).
//!
//! Listing/derived-view logic is grounded in the host's
//! `ralph_loop::progress_tracker::ProgressTracker` (accumulates a
//! `progress.txt` view) and `file_storage::index` (cheap listing without
//! reading every record). Logs themselves are immutable JSON files, one per
//! iteration, written via the same atomic-write primitive as the session.

pub mod types;

use crate::fsutil::{atomic_write, ensure_dir, read_json_opt, zero_padded_iteration};
use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};
use types::{FailureAnalysis, IterationLog, IterationStatus};

pub struct IterationStore {
    iterations_dir: PathBuf,
    progress_path: PathBuf,
}

impl IterationStore {
    pub fn new(ralph_dir: &Path) -> Self {
        Self {
            iterations_dir: ralph_dir.join("iterations"),
            progress_path: ralph_dir.join("progress.md"),
        }
    }

    fn path_for(&self, iteration: u32) -> PathBuf {
        self.iterations_dir
            .join(format!("{}.json", zero_padded_iteration(iteration)))
    }

    /// Append a new, immutable iteration log. Never overwrites an existing one.
    pub fn save(&self, log: &IterationLog) -> Result<()> {
        let path = self.path_for(log.iteration);
        if path.exists() {
            return Err(anyhow!(
                "iteration {} already recorded at {:?}; logs are immutable",
                log.iteration,
                path
            ));
        }
        ensure_dir(&self.iterations_dir).map_err(|e| anyhow!(e))?;
        let content =
            serde_json::to_vec_pretty(log).map_err(|e| anyhow!("failed to serialize iteration log: {}", e))?;
        atomic_write(&path, &content).map_err(|e| anyhow!(e))
    }

    /// Record the iteration that was in flight when the owning process
    /// crashed as `interrupted` (spec.md §B.1 stale-execution recovery). A
    /// no-op if that iteration already has a log — the process may have
    /// finished and exited cleanly just before the sweep ran.
    pub fn mark_interrupted(&self, session: &crate::session::types::SessionState) -> Result<()> {
        let iteration = session.iteration + 1;
        if self.read(iteration)?.is_some() {
            return Ok(());
        }
        let (task_id, task_attempt) = session
            .current_task
            .as_ref()
            .map(|t| (t.id.clone(), t.attempt_count))
            .unwrap_or_default();
        let log = IterationLog {
            schema_version: types::ITERATION_SCHEMA_VERSION,
            session_id: session.session_id.clone(),
            iteration,
            task_id,
            task_attempt,
            timestamp: chrono::Utc::now(),
            agent_thread_id: None,
            status: IterationStatus::Interrupted,
            prompt_token_estimate: None,
            agent_claimed_complete: false,
            evidence: None,
            context: None,
            implemented: Vec::new(),
            codebase_patterns: Vec::new(),
            summary: Some("owning process crashed mid-iteration".to_string()),
            failure_analysis: None,
            git_sha_before: None,
            git_sha_after: None,
            duration_ms: 0,
            raw_output: None,
        };
        self.save(&log)
    }

    /// Read a single iteration log by number, or `None` if absent.
    pub fn read(&self, iteration: u32) -> Result<Option<IterationLog>> {
        read_json_opt(&self.path_for(iteration)).map_err(|e| anyhow!(e))
    }

    /// List all iteration numbers present on disk, ascending.
    pub fn list(&self) -> Result<Vec<u32>> {
        if !self.iterations_dir.exists() {
            return Ok(Vec::new());
        }
        let mut numbers = Vec::new();
        for entry in std::fs::read_dir(&self.iterations_dir)
            .map_err(|e| anyhow!("failed to read iterations dir: {}", e))?
        {
            let entry = entry.map_err(|e| anyhow!("failed to read dir entry: {}", e))?;
            let Some(stem) = entry.path().file_stem().and_then(|s| s.to_str()).map(|s| s.to_string()) else {
                continue;
            };
            if let Ok(n) = stem.parse::<u32>() {
                numbers.push(n);
            }
        }
        numbers.sort_unstable();
        Ok(numbers)
    }

    /// The next iteration number to use: `max(list()) + 1`, or 1 if empty
    /// (spec.md §4.4, §8 property 1).
    pub fn next_iteration_number(&self) -> Result<u32> {
        Ok(self.list()?.last().map(|n| n + 1).unwrap_or(1))
    }

    /// Last `count` logs by iteration number, chronological order.
    pub fn read_recent(&self, count: usize) -> Result<Vec<IterationLog>> {
        let numbers = self.list()?;
        let start = numbers.len().saturating_sub(count);
        let mut logs = Vec::new();
        for n in &numbers[start..] {
            if let Some(log) = self.read(*n)? {
                logs.push(log);
            }
        }
        Ok(logs)
    }

    /// All logs for a given task id, in iteration order.
    pub fn read_by_task(&self, task_id: &str) -> Result<Vec<IterationLog>> {
        let mut logs = Vec::new();
        for n in self.list()? {
            if let Some(log) = self.read(n)? {
                if log.task_id == task_id {
                    logs.push(log);
                }
            }
        }
        Ok(logs)
    }

    /// Most recent log with `status=failed` and a non-null failure analysis.
    pub fn last_failure(&self) -> Result<Option<IterationLog>> {
        let mut numbers = self.list()?;
        numbers.reverse();
        for n in numbers {
            if let Some(log) = self.read(n)? {
                if log.status == IterationStatus::Failed && log.failure_analysis.is_some() {
                    return Ok(Some(log));
                }
            }
        }
        Ok(None)
    }

    /// Up to `max` most recent failure analyses for a task, newest first.
    pub fn task_failure_history(&self, task_id: &str, max: usize) -> Result<Vec<FailureAnalysis>> {
        let mut analyses: Vec<FailureAnalysis> = self
            .read_by_task(task_id)?
            .into_iter()
            .rev()
            .filter_map(|log| log.failure_analysis)
            .collect();
        analyses.truncate(max);
        Ok(analyses)
    }

    /// Derive a human-readable `progress.md` view: stats, accumulated
    /// patterns, last 5 iterations. Callers MUST NOT edit this file; it is
    /// regenerated wholesale on every call.
    pub fn generate_progress(&self, session: &crate::session::types::SessionState) -> Result<()> {
        let numbers = self.list()?;
        let total = numbers.len();
        let succeeded = numbers
            .iter()
            .filter_map(|n| self.read(*n).ok().flatten())
            .filter(|log| log.status == IterationStatus::Success)
            .count();

        let mut body = String::new();
        body.push_str("# Ralph Progress\n\n");
        body.push_str(&format!("- Iterations run: {}\n", total));
        body.push_str(&format!("- Succeeded: {}\n", succeeded));
        body.push_str(&format!("- Failed: {}\n", total.saturating_sub(succeeded)));
        body.push_str(&format!("- Session status: {:?}\n\n", session.status));

        if !session.context.codebase_patterns.is_empty() {
            body.push_str("## Accumulated codebase patterns\n\n");
            for pattern in &session.context.codebase_patterns {
                body.push_str(&format!("- {}\n", pattern));
            }
            body.push('\n');
        }

        body.push_str("## Last 5 iterations\n\n");
        for log in self.read_recent(5)? {
            let icon = match log.status {
                IterationStatus::Success => "✅",
                IterationStatus::Failed => "❌",
                IterationStatus::InProgress => "⏳",
                IterationStatus::Interrupted => "⚠️",
            };
            let line = log
                .summary
                .clone()
                .or_else(|| log.failure_analysis.as_ref().map(|f| f.root_cause.clone()))
                .unwrap_or_else(|| "(no summary)".to_string());
            body.push_str(&format!("- {} [{}] {}: {}\n", icon, log.iteration, log.task_id, line));
        }

        atomic_write(&self.progress_path, body.as_bytes()).map_err(|e| anyhow!(e))
    }
}
