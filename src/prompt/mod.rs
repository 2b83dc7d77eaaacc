//! Prompt Engine — composes the main execution prompt and the
//! failure-analysis prompt from session context (spec.md §4.6).
//!
//! Section layout and the "protected files"/"workflow" framing are
//! grounded in the host's `ralph_loop::prompt_builder::PromptBuilder`
//! (`generate_prompt` / `build_iteration_prompt`); the response-format
//! sentinel block and recent-failures section are new, sized to what
//! §4.6 specifies rather than the host's free-form progress file.

use crate::iteration::types::FailureAnalysis;
use crate::session::types::RecentFailure;

/// Everything the Prompt Engine needs to know about one task, read off
/// the Plan Provider's current task list entry.
pub struct TaskContext<'a> {
    pub id: &'a str,
    pub description: &'a str,
}

/// Inputs shared by both prompts.
pub struct PromptInputs<'a> {
    pub task: TaskContext<'a>,
    pub attempt: u32,
    pub iteration: u32,
    pub max_iterations: u32,
    pub project_name: &'a str,
    pub project_path: &'a str,
    pub check_command: Option<&'a str>,
    pub spec_context: &'a str,
    pub recent_failures: &'a [RecentFailure],
    pub codebase_patterns: &'a [String],
    pub recent_progress: &'a [ProgressLine],
}

/// One line of the "recent progress" digest (spec.md §4.6).
pub struct ProgressLine {
    pub succeeded: bool,
    pub summary: String,
}

/// `ceil(len(prompt) / 4)`, used for diagnostics only (spec.md §4.6).
pub fn estimate_tokens(prompt: &str) -> u64 {
    let chars = prompt.chars().count() as u64;
    chars.div_ceil(4)
}

fn failure_analysis_section(recent_failures: &[RecentFailure]) -> String {
    if recent_failures.is_empty() {
        return String::new();
    }
    let mut section = String::from("\n## Previous Failure Analysis\n\n");
    section.push_str(
        "Prior attempts at this (or recent) work failed for these reasons. \
         You MUST address these root causes before proceeding:\n\n",
    );
    for failure in recent_failures {
        section.push_str(&format!(
            "- Iteration {} (task {}): root cause — {}; fix plan — {}\n",
            failure.iteration, failure.task_id, failure.root_cause, failure.fix_plan
        ));
    }
    section
}

fn codebase_patterns_section(patterns: &[String]) -> String {
    if patterns.is_empty() {
        return String::new();
    }
    let mut section = String::from("\n## Accumulated Codebase Patterns\n\n");
    for pattern in patterns {
        section.push_str(&format!("- {}\n", pattern));
    }
    section
}

fn recent_progress_section(lines: &[ProgressLine]) -> String {
    if lines.is_empty() {
        return String::new();
    }
    let mut section = String::from("\n## Recent Progress\n\n");
    for line in lines {
        let icon = if line.succeeded { "✅" } else { "❌" };
        section.push_str(&format!("- {} {}\n", icon, line.summary));
    }
    section
}

/// Build the main execution prompt for one iteration (spec.md §4.6).
pub fn build_main_prompt(inputs: &PromptInputs) -> String {
    let check_line = inputs
        .check_command
        .map(|c| format!("- **Quality check command**: `{}`\n", c))
        .unwrap_or_default();

    format!(
        r#"# Ralph Engine — Iteration Instructions

Your context is fresh. You have no memory of previous iterations; all
context is in this prompt and the project files.

## Current Task

- **Task**: {task_id} — {task_description}
- **Attempt**: {attempt}
- **Iteration**: {iteration} of {max_iterations}

## Project Context

- **Project**: {project_name}
- **Path**: {project_path}
{check_line}
{failure_section}{patterns_section}

## Authoritative Spec

The following is the authoritative context for this change. Treat it as
ground truth over any assumption you might otherwise make:

```
{spec_context}
```
{progress_section}

## Execution Workflow

1. **Explore** the relevant parts of the codebase before changing anything.
2. **Implement** the current task only. Make minimal, focused changes.
3. **Run the quality check command** (if configured) and the spec
   validator; fix anything they report before declaring completion.
4. **Update the task list and any local knowledge files** your project
   keeps (progress notes, learnings).

## Response Format

At the very end of your output, emit exactly one sentinel block with
this shape (no other text inside the sentinel):

```
<RALPH_ITERATION_LOG_JSON>
{{
  "task": "{task_id}",
  "complete": true,
  "implemented": ["..."],
  "codebasePatterns": ["..."],
  "summary": "...",
  "context": {{
    "whatWasDone": "...",
    "learnings": ["..."],
    "filesChanged": ["..."],
    "gotchas": ["..."]
  }}
}}
</RALPH_ITERATION_LOG_JSON>
```

Only set `"complete": true` if the task truly meets its acceptance
criteria. Be honest.
"#,
        task_id = inputs.task.id,
        task_description = inputs.task.description,
        attempt = inputs.attempt,
        iteration = inputs.iteration,
        max_iterations = inputs.max_iterations,
        project_name = inputs.project_name,
        project_path = inputs.project_path,
        check_line = check_line,
        failure_section = failure_analysis_section(inputs.recent_failures),
        patterns_section = codebase_patterns_section(inputs.codebase_patterns),
        spec_context = inputs.spec_context,
        progress_section = recent_progress_section(inputs.recent_progress),
    )
}

/// Build the failure-analysis prompt issued after a failed iteration
/// when the error strategy is `analyze-retry` (spec.md §4.6, §4.2 step 8).
pub fn build_analysis_prompt(
    task: &TaskContext,
    attempt: u32,
    iteration: u32,
    prior_failure: Option<&RecentFailure>,
    current_error: &str,
) -> String {
    let prior_section = match prior_failure {
        Some(f) => format!(
            "\n## Prior Failure\n\n- Root cause: {}\n- Fix plan: {}\n",
            f.root_cause, f.fix_plan
        ),
        None => String::new(),
    };

    format!(
        r#"# Ralph Engine — Failure Analysis

## Task

- **Task**: {task_id} — {task_description}
- **Attempt**: {attempt}
- **Iteration**: {iteration}
{prior_section}
## Current Error

```
{current_error}
```

Analyze why this happened. Do not attempt to fix the code in this
response — only diagnose.

## Response Format

Emit exactly one sentinel block:

```
<RALPH_ITERATION_LOG_JSON>
{{
  "task": "{task_id}",
  "complete": false,
  "failureAnalysis": {{
    "rootCause": "...",
    "fixPlan": "...",
    "errorMessage": "...",
    "errorType": "validation|runtime|timeout|unknown"
  }}
}}
</RALPH_ITERATION_LOG_JSON>
"#,
        task_id = task.id,
        task_description = task.description,
        attempt = attempt,
        iteration = iteration,
        prior_section = prior_section,
        current_error = current_error,
    )
}

/// Convenience for building a `recent_progress` digest straight from
/// iteration logs (last 3, per spec.md §4.6).
pub fn progress_digest(logs: &[crate::iteration::types::IterationLog]) -> Vec<ProgressLine> {
    logs.iter()
        .rev()
        .take(3)
        .map(|log| {
            let succeeded = log.status == crate::iteration::types::IterationStatus::Success;
            let summary = log
                .summary
                .clone()
                .or_else(|| log.failure_analysis.as_ref().map(|f| f.root_cause.clone()))
                .unwrap_or_else(|| "(no summary)".to_string());
            ProgressLine { succeeded, summary }
        })
        .collect()
}

/// Build `RecentFailure` from a just-extracted `FailureAnalysis`, for
/// pushing onto `session.context.recent_failures` (spec.md §3).
pub fn to_recent_failure(iteration: u32, task_id: &str, analysis: &FailureAnalysis) -> RecentFailure {
    RecentFailure {
        iteration,
        task_id: task_id.to_string(),
        root_cause: analysis.root_cause.clone(),
        fix_plan: analysis.fix_plan.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_inputs<'a>(failures: &'a [RecentFailure], patterns: &'a [String]) -> PromptInputs<'a> {
        PromptInputs {
            task: TaskContext { id: "1.1", description: "Add X" },
            attempt: 1,
            iteration: 1,
            max_iterations: 10,
            project_name: "demo",
            project_path: "/tmp/demo",
            check_command: Some("cargo check"),
            spec_context: "spec body here",
            recent_failures: failures,
            codebase_patterns: patterns,
            recent_progress: &[],
        }
    }

    #[test]
    fn main_prompt_contains_sentinel_and_task() {
        let prompt = build_main_prompt(&base_inputs(&[], &[]));
        assert!(prompt.contains("<RALPH_ITERATION_LOG_JSON>"));
        assert!(prompt.contains("1.1"));
        assert!(prompt.contains("cargo check"));
    }

    #[test]
    fn main_prompt_includes_failure_section_when_failures_present() {
        let failures = vec![RecentFailure {
            iteration: 1,
            task_id: "2.1".into(),
            root_cause: "missing import".into(),
            fix_plan: "add import X".into(),
        }];
        let prompt = build_main_prompt(&base_inputs(&failures, &[]));
        assert!(prompt.contains("Previous Failure Analysis"));
        assert!(prompt.contains("missing import"));
        assert!(prompt.contains("add import X"));
    }

    #[test]
    fn main_prompt_omits_failure_section_when_none() {
        let prompt = build_main_prompt(&base_inputs(&[], &[]));
        assert!(!prompt.contains("Previous Failure Analysis"));
    }

    #[test]
    fn analysis_prompt_requires_complete_false_and_failure_analysis_shape() {
        let task = TaskContext { id: "2.1", description: "Add Y" };
        let prompt = build_analysis_prompt(&task, 2, 3, None, "Type error: mismatched types");
        assert!(prompt.contains("\"complete\": false"));
        assert!(prompt.contains("failureAnalysis"));
        assert!(prompt.contains("Type error"));
    }

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens("abcde"), 2); // ceil(5/4) = 2
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens(""), 0);
    }
}
