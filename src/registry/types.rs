//! Run registry record shapes (spec.md §3 "Run", §6 "Run registry").

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Stopped,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Done,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// Project config blob carried on a Run (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub name: String,
    pub path: String,
    pub check_command: Option<String>,
    pub pre_check_command: Option<String>,
}

/// A task entry in the registry's `tasks` table (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunTask {
    pub id: String,
    pub title: String,
    pub status: TaskStatus,
}

/// A log entry in the registry's `logs` table (spec.md §6, §7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: u64,
    pub level: LogLevel,
    pub message: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// The full Run record this file-based registry persists (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub status: RunStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub change_id: String,
    pub project_config: ProjectConfig,
    pub current_iteration: u32,
    pub max_iterations: u32,
    pub last_task_id: Option<String>,
    #[serde(default)]
    pub tasks: Vec<RunTask>,
    #[serde(default)]
    pub logs: Vec<LogRecord>,
}

impl RunRecord {
    pub fn new(id: String, change_id: String, project_config: ProjectConfig, max_iterations: u32) -> Self {
        Self {
            id,
            status: RunStatus::Running,
            created_at: chrono::Utc::now(),
            change_id,
            project_config,
            current_iteration: 0,
            max_iterations,
            last_task_id: None,
            tasks: Vec::new(),
            logs: Vec::new(),
        }
    }
}

/// Minimal listing entry, mirroring the host's index-file pattern of
/// cheap-to-scan summaries (`file_storage::index::SessionIndexEntry`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunIndexEntry {
    pub id: String,
    pub status: RunStatus,
    pub change_id: String,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}
