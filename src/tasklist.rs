//! Mutations to a change's `tasks.md` file: marking a task done or
//! skipped (spec.md §4.2 steps 7/8, §9 "Open questions").
//!
//! The source this spec distills implements the "done" toggle with a
//! regex that inserts a stray literal next to the checkbox instead of
//! replacing it. No corpus example implements this directly, so this
//! does the thing the spec says was actually intended: flip `[ ]` to
//! `[x]` on the line naming the task, nothing else.

use crate::fsutil::atomic_write;
use anyhow::{anyhow, Result};
use std::path::Path;

fn rewrite_line(content: &str, task_id: &str, transform: impl Fn(&str) -> String) -> Option<String> {
    let mut changed = false;
    let trailing_newline = content.ends_with('\n');
    let mut lines: Vec<String> = content.lines().map(|l| l.to_string()).collect();
    for line in lines.iter_mut() {
        if line.contains("[ ]") && line.contains(task_id) {
            *line = transform(line);
            changed = true;
            break;
        }
    }
    if !changed {
        return None;
    }
    let mut out = lines.join("\n");
    if trailing_newline {
        out.push('\n');
    }
    Some(out)
}

/// Flip the first unchecked `[ ]` line naming `task_id` to `[x]`.
pub fn mark_complete(path: &Path, task_id: &str) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read task list {:?}: {}", path, e))?;
    let updated = rewrite_line(&content, task_id, |line| line.replacen("[ ]", "[x]", 1))
        .ok_or_else(|| anyhow!("task {} not found as an unchecked item in {:?}", task_id, path))?;
    atomic_write(path, updated.as_bytes()).map_err(|e| anyhow!(e))
}

/// Mark the task skipped: strike the line through and append the reason.
pub fn mark_skipped(path: &Path, task_id: &str, reason: &str) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read task list {:?}: {}", path, e))?;
    let updated = rewrite_line(&content, task_id, |line| {
        format!("~~{}~~ (skipped: {})", line, reason)
    })
    .ok_or_else(|| anyhow!("task {} not found as an unchecked item in {:?}", task_id, path))?;
    atomic_write(path, updated.as_bytes()).map_err(|e| anyhow!(e))
}
