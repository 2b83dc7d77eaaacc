//! Plan Provider — external CLI adapter for a change's task plan
//! (spec.md §4.9, §6).
//!
//! Shelling pattern follows `quality_gate::run_validator`: spawn the
//! configured binary with tokio's `Command`, capture combined output,
//! and `serde_json::from_str` the `--json` forms.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use tokio::process::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanState {
    Ready,
    Blocked,
    AllDone,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlanTask {
    pub id: String,
    pub description: String,
    pub done: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlanProgress {
    pub total: u32,
    pub complete: u32,
    pub remaining: u32,
}

/// Response of `status --change <id> --json` (spec.md §4.9).
#[derive(Debug, Clone, Deserialize)]
pub struct PlanStatus {
    pub change_name: String,
    pub change_dir: String,
    pub schema_name: String,
    pub progress: PlanProgress,
    pub tasks: Vec<PlanTask>,
    pub state: PlanState,
    #[serde(default)]
    pub instruction: Option<String>,
}

impl PlanStatus {
    /// First task with `done = false`, spec.md §4.2 step 4.
    pub fn first_undone_task(&self) -> Option<&PlanTask> {
        self.tasks.iter().find(|t| !t.done)
    }
}

/// External CLI adapter. `binary` is the plan-provider executable name
/// or path (e.g. `openspec`).
pub struct PlanProvider {
    binary: String,
}

impl PlanProvider {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }

    fn command(&self, cwd: &Path) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.current_dir(cwd);
        cmd
    }

    /// `status --change <id> --json`
    pub async fn status(&self, change_id: &str, project_path: &Path) -> Result<PlanStatus> {
        let output = self
            .command(project_path)
            .arg("status")
            .arg("--change")
            .arg(change_id)
            .arg("--json")
            .output()
            .await
            .map_err(|e| anyhow!("failed to run plan provider status: {}", e))?;

        if !output.status.success() {
            return Err(anyhow!(
                "plan provider status failed: {}",
                String::from_utf8_lossy(&output.stderr)
            ));
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|e| anyhow!("failed to parse plan provider status JSON: {}", e))
    }

    /// `validate <id>`. Non-zero exit is an error (spec.md §4.9).
    pub async fn validate(&self, change_id: &str, project_path: &Path) -> Result<()> {
        let output = self
            .command(project_path)
            .arg("validate")
            .arg(change_id)
            .output()
            .await
            .map_err(|e| anyhow!("failed to run plan provider validate: {}", e))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(anyhow!(
                "plan provider validate failed: {}",
                String::from_utf8_lossy(&output.stderr)
            ))
        }
    }

    /// `block <id> --reason <text>`
    pub async fn block(&self, change_id: &str, reason: &str, project_path: &Path) -> Result<()> {
        let output = self
            .command(project_path)
            .arg("block")
            .arg(change_id)
            .arg("--reason")
            .arg(reason)
            .output()
            .await
            .map_err(|e| anyhow!("failed to run plan provider block: {}", e))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(anyhow!(
                "plan provider block failed: {}",
                String::from_utf8_lossy(&output.stderr)
            ))
        }
    }

    /// `archive <id> --yes`
    pub async fn archive(&self, change_id: &str, project_path: &Path) -> Result<()> {
        let output = self
            .command(project_path)
            .arg("archive")
            .arg(change_id)
            .arg("--yes")
            .output()
            .await
            .map_err(|e| anyhow!("failed to run plan provider archive: {}", e))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(anyhow!(
                "plan provider archive failed: {}",
                String::from_utf8_lossy(&output.stderr)
            ))
        }
    }

    /// `instructions apply --change <id> --json`. Used only by the
    /// excluded artifact-authoring flow (spec.md §4.9); kept for
    /// completeness but not invoked by the Engine.
    pub async fn instructions(&self, artifact: &str, change_id: &str, project_path: &Path) -> Result<String> {
        let output = self
            .command(project_path)
            .arg("instructions")
            .arg(artifact)
            .arg("--change")
            .arg(change_id)
            .arg("--json")
            .output()
            .await
            .map_err(|e| anyhow!("failed to run plan provider instructions: {}", e))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(anyhow!(
                "plan provider instructions failed: {}",
                String::from_utf8_lossy(&output.stderr)
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_undone_task_skips_completed_tasks() {
        let status = PlanStatus {
            change_name: "demo".into(),
            change_dir: "/tmp/demo".into(),
            schema_name: "default".into(),
            progress: PlanProgress { total: 2, complete: 1, remaining: 1 },
            tasks: vec![
                PlanTask { id: "1.1".into(), description: "done one".into(), done: true },
                PlanTask { id: "1.2".into(), description: "todo one".into(), done: false },
            ],
            state: PlanState::Ready,
            instruction: None,
        };
        assert_eq!(status.first_undone_task().unwrap().id, "1.2");
    }

    #[test]
    fn status_json_deserializes_snake_case_state() {
        let json = r#"{
            "change_name": "demo",
            "change_dir": "/tmp/demo",
            "schema_name": "default",
            "progress": {"total": 1, "complete": 0, "remaining": 1},
            "tasks": [{"id": "1.1", "description": "Add X", "done": false}],
            "state": "all_done"
        }"#;
        let status: PlanStatus = serde_json::from_str(json).unwrap();
        assert_eq!(status.state, PlanState::AllDone);
    }
}
