//! Output Extractor — tolerant multi-strategy parsing of agent stdout into
//! structured iteration fields (spec.md §4.5).
//!
//! Strategy order mirrors the host's `parsers::parse_prd_auto` fallback
//! chain (try the strict format first, degrade to looser ones, never
//! error out), and the JSON-block scanning itself generalizes
//! `parsers::structured_output::extract_json_blocks`'s ```` ```json ```` regex
//! to the full delimiter priority order spec.md §4.5 requires.

pub mod ansi;
pub mod types;

use regex::{Regex, RegexBuilder};
use std::sync::LazyLock;
use types::{ExtractedFields, ExtractionMethod, ExtractionResult};

use crate::iteration::types::{categorize_error, FailureAnalysis};

static SENTINEL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<RALPH_ITERATION_LOG_JSON>(.*?)</RALPH_ITERATION_LOG_JSON>").unwrap()
});

static JSON_FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```json\s*\n?(.*?)```").unwrap());

static BARE_FENCE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)```\s*\n?(.*?)```").unwrap());

/// Find the first syntactically balanced `{...}` substring, respecting
/// string literals so braces inside quoted JSON strings don't confuse
/// the depth counter.
fn first_balanced_object(input: &str) -> Option<&str> {
    let bytes = input.as_bytes();
    let start = input.find('{')?;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&input[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Pull the best-effort candidate JSON text out of agent stdout, in
/// spec.md §4.5 priority order. Returns `None` if nothing JSON-shaped
/// is present at all.
fn candidate_json(output: &str) -> Option<String> {
    if let Some(caps) = SENTINEL_RE.captures(output) {
        return Some(caps[1].trim().to_string());
    }
    if let Some(caps) = JSON_FENCE_RE.captures(output) {
        return Some(caps[1].trim().to_string());
    }
    if let Some(caps) = BARE_FENCE_RE.captures(output) {
        return Some(caps[1].trim().to_string());
    }
    first_balanced_object(output).map(|s| s.to_string())
}

fn str_field(value: &serde_json::Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(s) = value.get(key).and_then(|v| v.as_str()) {
            return Some(s.to_string());
        }
    }
    None
}

fn bool_field(value: &serde_json::Value, keys: &[&str]) -> Option<bool> {
    for key in keys {
        if let Some(b) = value.get(key).and_then(|v| v.as_bool()) {
            return Some(b);
        }
    }
    None
}

fn string_list_field(value: &serde_json::Value, keys: &[&str]) -> Vec<String> {
    for key in keys {
        if let Some(arr) = value.get(key).and_then(|v| v.as_array()) {
            return arr
                .iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect();
        }
    }
    Vec::new()
}

/// Normalize a raw JSON value into `ExtractedFields`, tolerating the
/// field-name aliases spec.md §4.5 lists (`task`/`taskId`/`id`,
/// `complete`/`completed`/`success`, `implemented`).
fn normalize_json(value: &serde_json::Value) -> ExtractedFields {
    let context = value.get("context");
    ExtractedFields {
        task_id: str_field(value, &["taskId", "task", "id"]),
        agent_claimed_complete: bool_field(value, &["complete", "completed", "success"]),
        implemented: string_list_field(value, &["implemented"]),
        what_was_done: context
            .and_then(|c| str_field(c, &["whatWasDone", "what_was_done"]))
            .or_else(|| str_field(value, &["whatWasDone", "what_was_done"])),
        learnings: context
            .map(|c| string_list_field(c, &["learnings"]))
            .unwrap_or_default(),
        files_changed: context
            .map(|c| string_list_field(c, &["filesChanged", "files_changed"]))
            .unwrap_or_default(),
        gotchas: context.map(|c| string_list_field(c, &["gotchas"])).unwrap_or_default(),
        codebase_patterns: string_list_field(value, &["codebasePatterns", "codebase_patterns"]),
        summary: str_field(value, &["summary"]),
    }
}

/// Strategy 2: scan for conventional section headings the prompt asks
/// agents to produce when they don't (or can't) emit JSON.
fn extract_regex_sections(output: &str) -> Option<ExtractedFields> {
    fn section(heading: &str, body: &str) -> Option<String> {
        let pattern = format!(r"(?im)^#*\s*{}\s*:?\s*\n?(.+?)(?:\n#|\n\n#|\z)", regex::escape(heading));
        let re = RegexBuilder::new(&pattern).build().ok()?;
        re.captures(body)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string())
            .filter(|s| !s.is_empty())
    }

    let what_was_done = section("what was done", output);
    let learnings = section("learnings", output);
    let files_changed = section("files changed", output);
    let gotchas = section("gotchas", output);
    let summary = section("summary", output);

    let complete_re = Regex::new(r"(?im)^complete:\s*(yes|no|true|false)").unwrap();
    let agent_claimed_complete = complete_re
        .captures(output)
        .map(|c| matches!(c[1].to_lowercase().as_str(), "yes" | "true"));

    if what_was_done.is_none()
        && learnings.is_none()
        && files_changed.is_none()
        && gotchas.is_none()
        && summary.is_none()
        && agent_claimed_complete.is_none()
    {
        return None;
    }

    let split_lines = |s: Option<String>| -> Vec<String> {
        s.map(|s| {
            s.lines()
                .map(|l| l.trim_start_matches(['-', '*']).trim().to_string())
                .filter(|l| !l.is_empty())
                .collect()
        })
        .unwrap_or_default()
    };

    Some(ExtractedFields {
        task_id: None,
        agent_claimed_complete,
        implemented: Vec::new(),
        what_was_done,
        learnings: split_lines(learnings),
        files_changed: split_lines(files_changed),
        gotchas: split_lines(gotchas),
        codebase_patterns: Vec::new(),
        summary,
    })
}

/// Extract iteration fields from one iteration's raw agent stdout,
/// trying sentinel JSON, then heading regexes, then raw preservation
/// (spec.md §4.5).
pub fn extract_iteration(output: &str) -> ExtractionResult {
    let clean = ansi::strip_ansi(output);

    if let Some(json_text) = candidate_json(&clean) {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&json_text) {
            return ExtractionResult {
                structured: normalize_json(&value),
                raw: clean,
                method: ExtractionMethod::Json,
                confidence: ExtractionMethod::Json.confidence(),
            };
        }
    }

    if let Some(fields) = extract_regex_sections(&clean) {
        return ExtractionResult {
            structured: fields,
            raw: clean,
            method: ExtractionMethod::Regex,
            confidence: ExtractionMethod::Regex.confidence(),
        };
    }

    ExtractionResult {
        structured: ExtractedFields::default(),
        raw: clean,
        method: ExtractionMethod::Raw,
        confidence: ExtractionMethod::Raw.confidence(),
    }
}

/// Extract a failure analysis from agent stdout after a failed
/// iteration. Looks for a `failureAnalysis` sub-object first, then a
/// "Root Cause"/"Fix Plan" heading pair, then synthesizes a minimal
/// analysis from `error_message` on total miss (spec.md §4.5).
pub fn extract_failure_analysis(output: &str, error_message: &str) -> FailureAnalysis {
    let clean = ansi::strip_ansi(output);

    if let Some(json_text) = candidate_json(&clean) {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&json_text) {
            let analysis = value.get("failureAnalysis").or_else(|| value.get("failure_analysis"));
            if let Some(analysis) = analysis {
                let root_cause = str_field(analysis, &["rootCause", "root_cause"]);
                let fix_plan = str_field(analysis, &["fixPlan", "fix_plan"]);
                if let (Some(root_cause), Some(fix_plan)) = (root_cause, fix_plan) {
                    return FailureAnalysis {
                        error_type: categorize_error(error_message),
                        root_cause,
                        fix_plan,
                        error_message: error_message.to_string(),
                    };
                }
            }
        }
    }

    let root_cause_re = RegexBuilder::new(r"(?im)^#*\s*root cause\s*:?\s*\n?(.+?)(?:\n#|\n\n#|\z)")
        .build()
        .unwrap();
    let fix_plan_re =
        RegexBuilder::new(r"(?im)^#*\s*fix plan\s*:?\s*\n?(.+?)(?:\n#|\n\n#|\z)").build().unwrap();

    let root_cause = root_cause_re.captures(&clean).and_then(|c| c.get(1)).map(|m| m.as_str().trim().to_string());
    let fix_plan = fix_plan_re.captures(&clean).and_then(|c| c.get(1)).map(|m| m.as_str().trim().to_string());

    match (root_cause, fix_plan) {
        (Some(root_cause), Some(fix_plan)) => FailureAnalysis {
            error_type: categorize_error(error_message),
            root_cause,
            fix_plan,
            error_message: error_message.to_string(),
        },
        _ => FailureAnalysis::synthesize(error_message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_json_wins_over_fenced_json() {
        let output = format!(
            "some preamble\n<RALPH_ITERATION_LOG_JSON>{{\"taskId\": \"1.1\", \"complete\": true}}</RALPH_ITERATION_LOG_JSON>\n```json\n{{\"taskId\": \"wrong\"}}\n```"
        );
        let result = extract_iteration(&output);
        assert_eq!(result.method, ExtractionMethod::Json);
        assert_eq!(result.structured.task_id.as_deref(), Some("1.1"));
        assert_eq!(result.structured.agent_claimed_complete, Some(true));
    }

    #[test]
    fn fenced_json_block_is_parsed_when_no_sentinel() {
        let output = "Work done.\n```json\n{\"task\": \"2.3\", \"success\": true, \"implemented\": [\"a\", \"b\"]}\n```\n";
        let result = extract_iteration(output);
        assert_eq!(result.method, ExtractionMethod::Json);
        assert_eq!(result.structured.task_id.as_deref(), Some("2.3"));
        assert_eq!(result.structured.implemented, vec!["a", "b"]);
    }

    #[test]
    fn bare_balanced_object_is_parsed_as_last_json_resort() {
        let output = "Here is my result: {\"id\": \"3.1\", \"completed\": false} and some trailing text";
        let result = extract_iteration(output);
        assert_eq!(result.method, ExtractionMethod::Json);
        assert_eq!(result.structured.task_id.as_deref(), Some("3.1"));
        assert_eq!(result.structured.agent_claimed_complete, Some(false));
    }

    #[test]
    fn regex_sections_used_when_json_parse_fails() {
        let output = "# What was done\nImplemented the login form.\n\n# Complete: yes\n";
        let result = extract_iteration(output);
        assert_eq!(result.method, ExtractionMethod::Regex);
        assert_eq!(result.structured.what_was_done.as_deref(), Some("Implemented the login form."));
        assert_eq!(result.structured.agent_claimed_complete, Some(true));
    }

    #[test]
    fn raw_fallback_when_nothing_structured_is_found() {
        let output = "just some plain chatter from the agent, no structure at all";
        let result = extract_iteration(output);
        assert_eq!(result.method, ExtractionMethod::Raw);
        assert_eq!(result.confidence, 0.30);
        assert_eq!(result.raw, output);
    }

    #[test]
    fn ansi_is_stripped_before_any_strategy_runs() {
        let output = "\x1b[32m```json\n{\"task\": \"1.1\", \"complete\": true}\n```\x1b[0m";
        let result = extract_iteration(output);
        assert_eq!(result.method, ExtractionMethod::Json);
        assert_eq!(result.structured.task_id.as_deref(), Some("1.1"));
    }

    #[test]
    fn failure_analysis_from_json_sub_object() {
        let output = "```json\n{\"failureAnalysis\": {\"rootCause\": \"missing dep\", \"fixPlan\": \"add it\"}}\n```";
        let analysis = extract_failure_analysis(output, "cargo build failed: E0433");
        assert_eq!(analysis.root_cause, "missing dep");
        assert_eq!(analysis.fix_plan, "add it");
    }

    #[test]
    fn failure_analysis_from_heading_pair() {
        let output = "# Root Cause\nThe import was missing.\n\n# Fix Plan\nAdd the missing use statement.\n";
        let analysis = extract_failure_analysis(output, "compile error");
        assert_eq!(analysis.root_cause, "The import was missing.");
        assert_eq!(analysis.fix_plan, "Add the missing use statement.");
    }

    #[test]
    fn failure_analysis_synthesizes_on_total_miss() {
        let output = "the agent just printed a stack trace with no structure";
        let analysis = extract_failure_analysis(output, "timeout after 600s");
        assert_eq!(analysis.error_message, "timeout after 600s");
        assert_eq!(analysis.root_cause, "timeout after 600s");
    }
}
