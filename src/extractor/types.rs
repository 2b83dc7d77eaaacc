//! Shared result types for the Output Extractor (spec.md §4.5).

use serde::{Deserialize, Serialize};

/// Which strategy produced an extraction, and how confident it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    Json,
    Regex,
    Raw,
}

impl ExtractionMethod {
    pub fn confidence(self) -> f64 {
        match self {
            ExtractionMethod::Json => 0.95,
            ExtractionMethod::Regex => 0.70,
            ExtractionMethod::Raw => 0.30,
        }
    }
}

/// Status inferred for a structured/partial extraction before the Engine
/// decides the final iteration outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InferredStatus {
    Success,
    InProgress,
}

/// Structured fields recovered from agent stdout, of varying completeness
/// depending on which strategy produced them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractedFields {
    pub task_id: Option<String>,
    pub agent_claimed_complete: Option<bool>,
    pub implemented: Vec<String>,
    pub what_was_done: Option<String>,
    pub learnings: Vec<String>,
    pub files_changed: Vec<String>,
    pub gotchas: Vec<String>,
    pub codebase_patterns: Vec<String>,
    pub summary: Option<String>,
}

impl ExtractedFields {
    pub fn status(&self) -> InferredStatus {
        match self.agent_claimed_complete {
            Some(true) => InferredStatus::Success,
            _ => InferredStatus::InProgress,
        }
    }
}

/// The full result of one extraction pass over agent stdout.
#[derive(Debug, Clone)]
pub struct ExtractionResult {
    pub structured: ExtractedFields,
    pub raw: String,
    pub method: ExtractionMethod,
    pub confidence: f64,
}
