//! Iteration Log shape — `.ralph/iterations/NNNN.json` (spec.md §3).
//!
//! Field shapes follow the host's `ralph_loop::IterationMetrics` (duration,
//! token counts, story/task id, retry attempts) and
//! `ralph_loop::completion::FailurePattern`/error categorization, recombined
//! into the single immutable record spec.md §3 describes.

use serde::{Deserialize, Serialize};

pub const ITERATION_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationStatus {
    Success,
    Failed,
    InProgress,
    /// The owning process crashed or was killed mid-iteration; recorded by
    /// the Worker's stale-execution recovery sweep, never by the Engine
    /// itself (spec.md §B.1).
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Validation,
    Runtime,
    Timeout,
    Unknown,
}

/// Categorize a raw error message into the taxonomy of spec.md §4.5/§7.
pub fn categorize_error(message: &str) -> ErrorType {
    let lower = message.to_lowercase();
    if lower.contains("timeout") || lower.contains("timed out") {
        ErrorType::Timeout
    } else if lower.contains("syntax") || lower.contains("type") || lower.contains("lint") {
        ErrorType::Validation
    } else if lower.contains("error") || lower.contains("exception") || lower.contains("failed") {
        ErrorType::Runtime
    } else {
        ErrorType::Unknown
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureAnalysis {
    pub root_cause: String,
    pub fix_plan: String,
    pub error_message: String,
    pub error_type: ErrorType,
}

impl FailureAnalysis {
    /// Minimal synthesis used when no structured analysis can be extracted
    /// (spec.md §4.5 "On total miss").
    pub fn synthesize(error_message: &str) -> Self {
        Self {
            root_cause: error_message.to_string(),
            fix_plan: "Retry with careful attention to the error".to_string(),
            error_message: error_message.to_string(),
            error_type: categorize_error(error_message),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpecValidation {
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<String>,
}

/// Output of the Quality Gate (spec.md §3 "Verification Evidence", §4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationEvidence {
    pub check_output: String,
    pub check_output_summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_output: Option<String>,
    pub spec_validation: SpecValidation,
    pub all_checks_passed: bool,
    pub collected_at: chrono::DateTime<chrono::Utc>,
}

impl VerificationEvidence {
    /// First 1000 chars of `output`, per spec.md §4.8 step 4.
    pub fn summarize(output: &str) -> String {
        output.chars().take(1000).collect()
    }
}

/// Structured fields an agent may report about what it did this iteration
/// (spec.md §3 "context").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IterationContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub what_was_done: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub learnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files_changed: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gotchas: Vec<String>,
}

/// One immutable record of a single iteration (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationLog {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub session_id: String,
    pub iteration: u32,
    pub task_id: String,
    pub task_attempt: u32,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_thread_id: Option<String>,
    pub status: IterationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_token_estimate: Option<u64>,
    pub agent_claimed_complete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence: Option<VerificationEvidence>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<IterationContext>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub implemented: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub codebase_patterns: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_analysis: Option<FailureAnalysis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_sha_before: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_sha_after: Option<String>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_output: Option<String>,
}

fn default_schema_version() -> u32 {
    ITERATION_SCHEMA_VERSION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categorize_timeout() {
        assert_eq!(categorize_error("operation timed out"), ErrorType::Timeout);
    }

    #[test]
    fn categorize_validation() {
        assert_eq!(categorize_error("Type error: mismatched types"), ErrorType::Validation);
    }

    #[test]
    fn categorize_runtime() {
        assert_eq!(categorize_error("panicked, process failed"), ErrorType::Runtime);
    }

    #[test]
    fn categorize_unknown() {
        assert_eq!(categorize_error("something odd happened"), ErrorType::Unknown);
    }

    #[test]
    fn summarize_caps_at_1000_chars() {
        let long = "x".repeat(2000);
        assert_eq!(VerificationEvidence::summarize(&long).len(), 1000);
    }
}
