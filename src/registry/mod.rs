//! Run Registry — the shared store of runs, tasks, and logs the Worker
//! and every Engine instance consult (spec.md §3 "Run", §6 "Run registry",
//! §5 "Shared resources").
//!
//! spec.md suggests "a small embedded relational store"; nothing in this
//! codebase's corpus uses one (no `rusqlite`/`sled` dependency anywhere),
//! while the corpus's own architecture is explicit about persisting state
//! in files (`ralph_loop::mod`: "Progress persists in FILES ... + git
//! commits"). This store follows that idiom instead: one JSON record per
//! run under `registry/runs/<id>.json`, plus a cheap listing index built
//! the way the host's `file_storage::index` builds one. See DESIGN.md for
//! the full rationale.

pub mod types;

use crate::fsutil::{atomic_write_json, ensure_dir, read_json_opt};
use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};
use types::{LogLevel, LogRecord, ProjectConfig, RunIndexEntry, RunRecord, RunStatus, RunTask};

pub struct RunRegistry {
    runs_dir: PathBuf,
    index_path: PathBuf,
}

impl RunRegistry {
    pub fn new(data_dir: &Path) -> Self {
        let registry_dir = data_dir.join("registry");
        Self {
            runs_dir: registry_dir.join("runs"),
            index_path: registry_dir.join("index.json"),
        }
    }

    fn run_path(&self, run_id: &str) -> PathBuf {
        self.runs_dir.join(format!("{}.json", run_id))
    }

    fn read_index(&self) -> Result<Vec<RunIndexEntry>> {
        Ok(read_json_opt(&self.index_path).map_err(|e| anyhow!(e))?.unwrap_or_default())
    }

    fn write_index(&self, entries: &[RunIndexEntry]) -> Result<()> {
        atomic_write_json(&self.index_path, entries).map_err(|e| anyhow!(e))
    }

    fn upsert_index(&self, record: &RunRecord) -> Result<()> {
        let mut entries = self.read_index()?;
        let entry = RunIndexEntry {
            id: record.id.clone(),
            status: record.status,
            change_id: record.change_id.clone(),
            updated_at: chrono::Utc::now(),
        };
        match entries.iter().position(|e| e.id == record.id) {
            Some(i) => entries[i] = entry,
            None => entries.push(entry),
        }
        self.write_index(&entries)
    }

    /// Create a new run, status `running`, iteration 0.
    pub fn create_run(
        &self,
        run_id: String,
        change_id: String,
        project_config: ProjectConfig,
        max_iterations: u32,
    ) -> Result<RunRecord> {
        ensure_dir(&self.runs_dir).map_err(|e| anyhow!(e))?;
        let record = RunRecord::new(run_id, change_id, project_config, max_iterations);
        atomic_write_json(&self.run_path(&record.id), &record).map_err(|e| anyhow!(e))?;
        self.upsert_index(&record)?;
        Ok(record)
    }

    pub fn get(&self, run_id: &str) -> Result<Option<RunRecord>> {
        read_json_opt(&self.run_path(run_id)).map_err(|e| anyhow!(e))
    }

    /// All runs whose status is `running` — the Worker's admission sweep
    /// (spec.md §4.1 "Algorithm").
    pub fn list_running(&self) -> Result<Vec<RunRecord>> {
        let mut runs = Vec::new();
        for entry in self.read_index()? {
            if entry.status == RunStatus::Running {
                if let Some(run) = self.get(&entry.id)? {
                    runs.push(run);
                }
            }
        }
        Ok(runs)
    }

    /// Read-modify-write a run record under the registry's single-writer
    /// discipline (each engine only ever touches its own run row, spec.md §5).
    pub fn update<F>(&self, run_id: &str, f: F) -> Result<RunRecord>
    where
        F: FnOnce(&mut RunRecord),
    {
        let mut record = self
            .get(run_id)?
            .ok_or_else(|| anyhow!("no such run: {}", run_id))?;
        f(&mut record);
        atomic_write_json(&self.run_path(run_id), &record).map_err(|e| anyhow!(e))?;
        self.upsert_index(&record)?;
        Ok(record)
    }

    pub fn set_status(&self, run_id: &str, status: RunStatus) -> Result<RunRecord> {
        self.update(run_id, |r| r.status = status)
    }

    pub fn set_tasks(&self, run_id: &str, tasks: Vec<RunTask>) -> Result<RunRecord> {
        self.update(run_id, |r| r.tasks = tasks)
    }

    /// Append a log line to the run's log stream (spec.md §7 "Every engine
    /// log line is ... appended to the run's log stream in the registry").
    pub fn append_log(&self, run_id: &str, level: LogLevel, message: impl Into<String>) -> Result<()> {
        self.update(run_id, |r| {
            let next_id = r.logs.last().map(|l| l.id + 1).unwrap_or(1);
            r.logs.push(LogRecord {
                id: next_id,
                level,
                message: message.into(),
                timestamp: chrono::Utc::now(),
            });
        })?;
        Ok(())
    }

    /// Last `n` log records for a run, newest last (spec.md §B.2 query surface).
    pub fn recent_logs(&self, run_id: &str, n: usize) -> Result<Vec<LogRecord>> {
        let record = self.get(run_id)?.ok_or_else(|| anyhow!("no such run: {}", run_id))?;
        let start = record.logs.len().saturating_sub(n);
        Ok(record.logs[start..].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn project_config() -> ProjectConfig {
        ProjectConfig {
            name: "demo".into(),
            path: "/tmp/demo".into(),
            check_command: Some("cargo check".into()),
            pre_check_command: None,
        }
    }

    #[test]
    fn create_then_get_round_trips() {
        let dir = TempDir::new().unwrap();
        let registry = RunRegistry::new(dir.path());
        let created = registry
            .create_run("run-1".into(), "change-1".into(), project_config(), 10)
            .unwrap();
        let fetched = registry.get("run-1").unwrap().unwrap();
        assert_eq!(fetched.id, created.id);
        assert_eq!(fetched.status, RunStatus::Running);
    }

    #[test]
    fn list_running_excludes_terminal_runs() {
        let dir = TempDir::new().unwrap();
        let registry = RunRegistry::new(dir.path());
        registry.create_run("run-1".into(), "change-1".into(), project_config(), 10).unwrap();
        registry.create_run("run-2".into(), "change-2".into(), project_config(), 10).unwrap();
        registry.set_status("run-2", RunStatus::Completed).unwrap();

        let running = registry.list_running().unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, "run-1");
    }

    #[test]
    fn append_log_assigns_increasing_ids() {
        let dir = TempDir::new().unwrap();
        let registry = RunRegistry::new(dir.path());
        registry.create_run("run-1".into(), "change-1".into(), project_config(), 10).unwrap();
        registry.append_log("run-1", LogLevel::Info, "started").unwrap();
        registry.append_log("run-1", LogLevel::Warn, "stale lock reclaimed").unwrap();

        let logs = registry.recent_logs("run-1", 10).unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].id, 1);
        assert_eq!(logs[1].id, 2);
    }

    #[test]
    fn recent_logs_caps_at_requested_count() {
        let dir = TempDir::new().unwrap();
        let registry = RunRegistry::new(dir.path());
        registry.create_run("run-1".into(), "change-1".into(), project_config(), 10).unwrap();
        for i in 0..5 {
            registry.append_log("run-1", LogLevel::Info, format!("log {}", i)).unwrap();
        }
        let logs = registry.recent_logs("run-1", 2).unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].message, "log 3");
        assert_eq!(logs[1].message, "log 4");
    }

    #[test]
    fn update_missing_run_is_an_error() {
        let dir = TempDir::new().unwrap();
        let registry = RunRegistry::new(dir.path());
        assert!(registry.set_status("nope", RunStatus::Failed).is_err());
    }
}
