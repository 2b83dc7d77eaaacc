//! Session state shape — `session.json` under a change's `.ralph/` directory.
//!
//! Field shapes are grounded in the host's `models::{SessionStatus, TaskStatus}`
//! and `ralph_loop::types` conventions (camelCase JSON, `#[serde(default)]`
//! for forward-compatible reads), generalized to the CORE's session schema
//! from spec.md §3.

use serde::{Deserialize, Serialize};

/// Current schema version for `session.json`. Bump when the shape changes;
/// `SessionStore::read` warns (and would migrate) on mismatch.
pub const SESSION_SCHEMA_VERSION: u32 = 1;

/// Maximum number of recent failures retained in the rolling window (spec.md §3, §8).
pub const RECENT_FAILURES_CAP: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Paused,
    Failed,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorStrategy {
    Retry,
    AnalyzeRetry,
    Skip,
    Escalate,
}

impl Default for ErrorStrategy {
    fn default() -> Self {
        Self::AnalyzeRetry
    }
}

/// The task currently in flight, if any (spec.md §3: "non-null whenever an
/// iteration is mid-flight").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentTask {
    pub id: String,
    pub description: String,
    pub attempt_count: u32,
}

/// One entry in the bounded recent-failures window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecentFailure {
    pub iteration: u32,
    pub task_id: String,
    pub root_cause: String,
    pub fix_plan: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorHandlingConfig {
    pub strategy: ErrorStrategy,
    pub max_retries: u32,
    #[serde(default)]
    pub current_retry_count: u32,
}

impl Default for ErrorHandlingConfig {
    fn default() -> Self {
        Self {
            strategy: ErrorStrategy::default(),
            max_retries: 3,
            current_retry_count: 0,
        }
    }
}

/// Accumulated cross-iteration context (spec.md §3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionContext {
    /// Ordered set of codebase patterns: dedup, insertion order (spec.md §8 property 4).
    #[serde(default)]
    pub codebase_patterns: Vec<String>,
    /// Bounded FIFO, cap 3 (spec.md §8 property 3).
    #[serde(default)]
    pub recent_failures: Vec<RecentFailure>,
}

impl SessionContext {
    /// Append a pattern iff not already present (spec.md §4.3 `add_pattern`).
    pub fn add_pattern(&mut self, pattern: String) {
        if !self.codebase_patterns.contains(&pattern) {
            self.codebase_patterns.push(pattern);
        }
    }

    /// Push a failure, dropping the oldest once the cap is exceeded
    /// (spec.md §4.3 `add_failure`, §8 property 3).
    pub fn add_failure(&mut self, failure: RecentFailure) {
        self.recent_failures.push(failure);
        while self.recent_failures.len() > RECENT_FAILURES_CAP {
            self.recent_failures.remove(0);
        }
    }
}

/// Informational lock descriptor mirrored onto the session for visibility;
/// the authoritative lock state lives in `.ralph/.lock` (see `session::lock`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockDescriptor {
    pub pid: u32,
    pub acquired_at: chrono::DateTime<chrono::Utc>,
}

/// The durable state of one run's engine — `session.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub session_id: String,
    pub change_id: String,
    pub status: SessionStatus,
    pub current_task: Option<CurrentTask>,
    pub iteration: u32,
    pub max_iterations: u32,
    pub last_successful_commit: Option<String>,
    pub lock: Option<LockDescriptor>,
    pub error_handling: ErrorHandlingConfig,
    #[serde(default)]
    pub context: SessionContext,
}

fn default_schema_version() -> u32 {
    SESSION_SCHEMA_VERSION
}

impl SessionState {
    /// Construct a fresh session for a change (spec.md §4.3 `create_initial`).
    pub fn new_initial(session_id: String, change_id: String, max_iterations: u32, error_handling: ErrorHandlingConfig) -> Self {
        Self {
            schema_version: SESSION_SCHEMA_VERSION,
            session_id,
            change_id,
            status: SessionStatus::Running,
            current_task: None,
            iteration: 0,
            max_iterations,
            last_successful_commit: None,
            lock: None,
            error_handling,
            context: SessionContext::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_pattern_dedups_and_preserves_order() {
        let mut ctx = SessionContext::default();
        ctx.add_pattern("use atomic writes".into());
        ctx.add_pattern("prefer traits".into());
        ctx.add_pattern("use atomic writes".into());
        assert_eq!(ctx.codebase_patterns, vec!["use atomic writes", "prefer traits"]);
    }

    #[test]
    fn add_failure_caps_at_three_dropping_oldest() {
        let mut ctx = SessionContext::default();
        for i in 0..5 {
            ctx.add_failure(RecentFailure {
                iteration: i,
                task_id: "1.1".into(),
                root_cause: format!("cause {}", i),
                fix_plan: "retry".into(),
            });
        }
        assert_eq!(ctx.recent_failures.len(), RECENT_FAILURES_CAP);
        assert_eq!(ctx.recent_failures.first().unwrap().iteration, 2);
        assert_eq!(ctx.recent_failures.last().unwrap().iteration, 4);
    }
}
