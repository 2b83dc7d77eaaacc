//! Engine — executes one run's iterations 1..max until a terminal state
//! (spec.md §4.2).
//!
//! Grounded in the host's `ralph_loop::mod::run_ralph_loop` (the per-run
//! blocking loop driving prompt → agent → verify → commit, with the same
//! ordering of session persistence around each step) and
//! `session::recovery` for the lock-then-load sequence at entry. The
//! loop body here implements spec.md's own protocol rather than the
//! host's story/assignment model; callbacks the spec describes
//! (`on_log`, `on_task_start`, `on_task_complete`, `on_iteration_complete`,
//! `on_run_complete`) are realized concretely as registry updates plus
//! `NotificationSink` events, the same pair the host forwards its own
//! `log_collector` events to.

use crate::agent;
use crate::extractor::{self, ansi::sanitize_raw_output};
use crate::fsutil::read_json_opt;
use crate::git::GitOps;
use crate::iteration::types::{
    IterationContext, IterationLog, IterationStatus, ITERATION_SCHEMA_VERSION,
};
use crate::iteration::IterationStore;
use crate::notify::{self, NotificationSink};
use crate::plan_provider::{PlanProvider, PlanState};
use crate::prompt;
use crate::registry::types::{LogLevel as RegistryLogLevel, RunStatus};
use crate::registry::RunRegistry;
use crate::session::types::{
    CurrentTask, ErrorHandlingConfig, ErrorStrategy, SessionStatus,
};
use crate::session::SessionStore;
use crate::tasklist;
use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;

/// Inputs the Engine needs to drive one run (spec.md §4.2 "Inputs").
pub struct EngineConfig {
    pub run_id: String,
    pub session_id: String,
    pub change_id: String,
    pub project_path: PathBuf,
    pub project_name: String,
    pub check_command: Option<String>,
    pub agent_binary: String,
    pub validator_binary: String,
    pub plan_provider_binary: String,
    pub max_iterations: u32,
    pub error_strategy: ErrorStrategy,
    pub max_retries: u32,
    pub agent_timeout_ms: Option<u64>,
}

/// The Engine's return contract (spec.md §4.2 "Contract").
#[derive(Debug, Clone)]
pub struct EngineOutcome {
    pub success: bool,
    pub message: Option<String>,
}

/// Internal log-level used when forwarding to both the registry and the
/// Notification Sink; those two carry structurally identical but
/// independently-defined enums (persisted-record shape vs. wire-event
/// shape), so conversion happens at the edge rather than sharing a type.
#[derive(Clone, Copy)]
enum Level {
    Info,
    Warn,
    Error,
}

fn to_registry_level(level: Level) -> RegistryLogLevel {
    match level {
        Level::Info => RegistryLogLevel::Info,
        Level::Warn => RegistryLogLevel::Warn,
        Level::Error => RegistryLogLevel::Error,
    }
}

fn to_notify_level(level: Level) -> notify::LogLevel {
    match level {
        Level::Info => notify::LogLevel::Info,
        Level::Warn => notify::LogLevel::Warn,
        Level::Error => notify::LogLevel::Error,
    }
}

/// Outcome of executing and verifying one iteration's agent call,
/// before the Engine decides what it means for the session (spec.md
/// §4.2 steps 5-7).
enum IterationAttempt {
    Success {
        raw_output: String,
        evidence: crate::iteration::types::VerificationEvidence,
        duration_ms: u64,
    },
    Failure {
        error_message: String,
        evidence: Option<crate::iteration::types::VerificationEvidence>,
        raw_output: Option<String>,
        duration_ms: u64,
    },
}

pub struct Engine {
    config: EngineConfig,
    session_store: SessionStore,
    iteration_store: IterationStore,
    plan_provider: PlanProvider,
    registry: Arc<RunRegistry>,
    notify: Arc<NotificationSink>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        registry: Arc<RunRegistry>,
        notify: Arc<NotificationSink>,
        clock: Arc<dyn crate::clock::ClockProbe>,
    ) -> Self {
        let change_dir = change_dir(&config.project_path, &config.change_id);
        let session_store = SessionStore::new(&change_dir, clock);
        let iteration_store = IterationStore::new(session_store.ralph_dir());
        let plan_provider = PlanProvider::new(config.plan_provider_binary.clone());
        Self {
            config,
            session_store,
            iteration_store,
            plan_provider,
            registry,
            notify,
        }
    }

    fn change_dir(&self) -> PathBuf {
        change_dir(&self.config.project_path, &self.config.change_id)
    }

    fn tasks_path(&self) -> PathBuf {
        self.change_dir().join("tasks.md")
    }

    fn log(&self, level: Level, message: impl Into<String>) {
        let message = message.into();
        match level {
            Level::Info => log::info!("[run {}] {}", self.config.run_id, message),
            Level::Warn => log::warn!("[run {}] {}", self.config.run_id, message),
            Level::Error => log::error!("[run {}] {}", self.config.run_id, message),
        }
        let _ = self
            .registry
            .append_log(&self.config.run_id, to_registry_level(level), message.clone());
        self.notify.log(&self.config.run_id, to_notify_level(level), message);
    }

    /// Run the engine to completion, always returning an outcome rather
    /// than propagating an error — every failure mode spec.md names is a
    /// `{success: false, message}` result, never a thrown exception
    /// (spec.md §9 "Exceptions for control flow").
    pub async fn run(&self) -> EngineOutcome {
        let mut lock = self.session_store.lock();
        if let Err(e) = lock.acquire(&self.config.session_id) {
            self.log(Level::Error, format!("lock acquisition failed: {}", e));
            let outcome = EngineOutcome {
                success: false,
                message: Some(e.to_string()),
            };
            self.emit_run_complete(&outcome);
            return outcome;
        }

        // `lock` releases on drop (`ChangeLock`'s `Drop` impl) regardless
        // of which path out of `run_locked` we take, including an early
        // `?`-propagated error — this is the scoped-resource guarantee
        // spec.md §9 asks for.
        let outcome = match self.run_locked().await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.log(Level::Error, format!("engine error: {}", e));
                EngineOutcome {
                    success: false,
                    message: Some(e.to_string()),
                }
            }
        };

        self.emit_run_complete(&outcome);
        outcome
    }

    fn emit_run_complete(&self, outcome: &EngineOutcome) {
        self.log(
            Level::Info,
            format!(
                "run complete: success={} message={}",
                outcome.success,
                outcome.message.as_deref().unwrap_or("")
            ),
        );

        // A run already marked `stopped` by an external caller keeps that
        // status; a cooperative stop is not the same as failure.
        let already_stopped = matches!(
            self.registry.get(&self.config.run_id).ok().flatten().map(|r| r.status),
            Some(RunStatus::Stopped)
        );
        if already_stopped {
            return;
        }

        let status = if outcome.success {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };
        let _ = self.registry.set_status(&self.config.run_id, status);
        let kind = if outcome.success {
            notify::RunStatusKind::Completed
        } else {
            notify::RunStatusKind::Failed
        };
        self.notify.run_status(&self.config.run_id, kind);
    }

    fn run_was_stopped(&self) -> bool {
        matches!(
            self.registry.get(&self.config.run_id).ok().flatten().map(|r| r.status),
            Some(RunStatus::Stopped)
        )
    }

    async fn run_locked(&self) -> Result<EngineOutcome> {
        self.session_store.ensure_dirs()?;

        let mut session = match self.session_store.read()? {
            Some(state) => state,
            None => self.session_store.create_initial(
                self.config.session_id.clone(),
                self.config.change_id.clone(),
                self.config.max_iterations,
                ErrorHandlingConfig {
                    strategy: self.config.error_strategy,
                    max_retries: self.config.max_retries,
                    current_retry_count: 0,
                },
            ),
        };

        let spec_context = read_spec_context(&self.change_dir().join("change.json"));

        loop {
            if self.run_was_stopped() {
                session.status = SessionStatus::Paused;
                self.session_store.write(&session)?;
                return Ok(EngineOutcome {
                    success: false,
                    message: Some("run stopped".into()),
                });
            }

            if session.iteration >= session.max_iterations {
                session.status = SessionStatus::Failed;
                self.session_store.write(&session)?;
                return Ok(EngineOutcome {
                    success: false,
                    message: Some("Max iterations reached".into()),
                });
            }

            let status = self
                .plan_provider
                .status(&self.config.change_id, &self.config.project_path)
                .await?;

            match status.state {
                PlanState::Blocked => {
                    session.status = SessionStatus::Paused;
                    self.session_store.write(&session)?;
                    let message = status
                        .instruction
                        .clone()
                        .unwrap_or_else(|| "change is blocked".to_string());
                    return Ok(EngineOutcome {
                        success: false,
                        message: Some(message),
                    });
                }
                PlanState::AllDone => {
                    session.status = SessionStatus::Completed;
                    self.session_store.write(&session)?;
                    self.plan_provider
                        .validate(&self.config.change_id, &self.config.project_path)
                        .await?;
                    self.plan_provider
                        .archive(&self.config.change_id, &self.config.project_path)
                        .await?;
                    return Ok(EngineOutcome {
                        success: true,
                        message: Some("All tasks completed".into()),
                    });
                }
                PlanState::Ready => {}
            }

            let Some(task) = status.first_undone_task() else {
                session.status = SessionStatus::Completed;
                self.session_store.write(&session)?;
                return Ok(EngineOutcome {
                    success: true,
                    message: Some("All tasks completed".into()),
                });
            };
            let task_id = task.id.clone();
            let task_description = task.description.clone();

            let attempt = match &session.current_task {
                Some(current) if current.id == task_id => current.attempt_count + 1,
                _ => 1,
            };
            session.current_task = Some(CurrentTask {
                id: task_id.clone(),
                description: task_description.clone(),
                attempt_count: attempt,
            });
            self.session_store.write(&session)?;
            self.notify
                .task_start(&self.config.run_id, &task_id, &task_description);

            let iteration_number = self.iteration_store.next_iteration_number()?;
            let recent_logs = self.iteration_store.read_recent(3)?;
            let progress = prompt::progress_digest(&recent_logs);

            let project_path_str = self.config.project_path.to_string_lossy().to_string();
            let prompt_inputs = prompt::PromptInputs {
                task: prompt::TaskContext {
                    id: &task_id,
                    description: &task_description,
                },
                attempt,
                iteration: iteration_number,
                max_iterations: session.max_iterations,
                project_name: &self.config.project_name,
                project_path: &project_path_str,
                check_command: self.config.check_command.as_deref(),
                spec_context: &spec_context,
                recent_failures: &session.context.recent_failures,
                codebase_patterns: &session.context.codebase_patterns,
                recent_progress: &progress,
            };
            let main_prompt = prompt::build_main_prompt(&prompt_inputs);
            let prompt_token_estimate = prompt::estimate_tokens(&main_prompt);

            let git_sha_before = GitOps::open(&self.config.project_path)
                .and_then(|g| g.head_sha())
                .ok();

            let attempt_result = self.execute_and_verify(&main_prompt, &task_id).await;

            match attempt_result {
                IterationAttempt::Success {
                    raw_output,
                    evidence,
                    duration_ms,
                } => {
                    self.handle_success(
                        &mut session,
                        iteration_number,
                        &task_id,
                        attempt,
                        prompt_token_estimate,
                        &raw_output,
                        evidence,
                        duration_ms,
                        git_sha_before,
                    )?;
                    session.iteration += 1;
                    self.session_store.write(&session)?;
                    self.log(
                        Level::Info,
                        format!("iteration {} complete (success)", iteration_number),
                    );
                }
                IterationAttempt::Failure {
                    error_message,
                    evidence,
                    raw_output,
                    duration_ms,
                } => {
                    if let Some(outcome) = self
                        .handle_failure(
                            &mut session,
                            iteration_number,
                            &task_id,
                            attempt,
                            prompt_token_estimate,
                            &error_message,
                            evidence,
                            raw_output,
                            duration_ms,
                        )
                        .await?
                    {
                        return Ok(outcome);
                    }
                    session.iteration += 1;
                    self.session_store.write(&session)?;
                    self.log(
                        Level::Info,
                        format!("iteration {} complete (failed)", iteration_number),
                    );
                }
            }
        }
    }

    /// Spawn the agent and run the quality gate, collapsing every way
    /// this can go wrong into a single `IterationAttempt` (spec.md §4.2
    /// steps 5-7).
    async fn execute_and_verify(&self, prompt: &str, task_id: &str) -> IterationAttempt {
        let agent_output = match agent::run(
            &self.config.agent_binary,
            prompt,
            &self.config.project_path,
            &self.config.project_path,
            self.config.agent_timeout_ms,
        )
        .await
        {
            Ok(output) => output,
            Err(e) => {
                self.log(
                    Level::Warn,
                    format!("agent run failed for task {}: {}", task_id, e),
                );
                return IterationAttempt::Failure {
                    error_message: e.to_string(),
                    evidence: None,
                    raw_output: None,
                    duration_ms: 0,
                };
            }
        };

        let evidence = crate::quality_gate::run(
            self.config.check_command.as_deref(),
            &self.config.validator_binary,
            &self.config.change_id,
            &self.config.project_path,
        )
        .await;

        match evidence {
            Ok(evidence) if evidence.all_checks_passed => IterationAttempt::Success {
                raw_output: agent_output.raw_output,
                evidence,
                duration_ms: agent_output.duration_ms,
            },
            Ok(evidence) => IterationAttempt::Failure {
                error_message: evidence.check_output_summary.clone(),
                evidence: Some(evidence),
                raw_output: Some(agent_output.raw_output),
                duration_ms: agent_output.duration_ms,
            },
            Err(e) => {
                self.log(Level::Warn, format!("quality gate failed to run: {}", e));
                IterationAttempt::Failure {
                    error_message: e.to_string(),
                    evidence: None,
                    raw_output: Some(agent_output.raw_output),
                    duration_ms: agent_output.duration_ms,
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_success(
        &self,
        session: &mut crate::session::types::SessionState,
        iteration_number: u32,
        task_id: &str,
        attempt: u32,
        prompt_token_estimate: u64,
        raw_output: &str,
        evidence: crate::iteration::types::VerificationEvidence,
        duration_ms: u64,
        git_sha_before: Option<String>,
    ) -> Result<()> {
        let extraction = extractor::extract_iteration(raw_output);

        let git_ops = GitOps::open(&self.config.project_path)?;
        git_ops.stage_all()?;
        let description = session
            .current_task
            .as_ref()
            .map(|t| t.description.clone())
            .unwrap_or_default();
        let message = format!("feat: {} - {}", task_id, description);
        git_ops.commit(&message)?;
        let git_sha_after = git_ops.head_sha().ok();

        tasklist::mark_complete(&self.tasks_path(), task_id)?;

        for pattern in &extraction.structured.codebase_patterns {
            session.context.add_pattern(pattern.clone());
        }

        let log = IterationLog {
            schema_version: ITERATION_SCHEMA_VERSION,
            session_id: session.session_id.clone(),
            iteration: iteration_number,
            task_id: task_id.to_string(),
            task_attempt: attempt,
            timestamp: chrono::Utc::now(),
            agent_thread_id: None,
            status: IterationStatus::Success,
            prompt_token_estimate: Some(prompt_token_estimate),
            agent_claimed_complete: extraction.structured.agent_claimed_complete.unwrap_or(true),
            evidence: Some(evidence),
            context: Some(IterationContext {
                what_was_done: extraction.structured.what_was_done.clone(),
                learnings: extraction.structured.learnings.clone(),
                files_changed: extraction.structured.files_changed.clone(),
                gotchas: extraction.structured.gotchas.clone(),
            }),
            implemented: extraction.structured.implemented.clone(),
            codebase_patterns: extraction.structured.codebase_patterns.clone(),
            summary: extraction.structured.summary.clone(),
            failure_analysis: None,
            git_sha_before,
            git_sha_after,
            duration_ms,
            raw_output: Some(sanitize_raw_output(&extraction.raw)),
        };
        self.iteration_store.save(&log)?;
        self.iteration_store.generate_progress(session)?;

        session.last_successful_commit = log.git_sha_after.clone();
        session.error_handling.current_retry_count = 0;
        self.notify
            .task_complete(&self.config.run_id, task_id, true);

        Ok(())
    }

    /// Returns `Some(outcome)` when the failure path reaches a terminal
    /// state for the run (escalation); `None` means the loop continues.
    #[allow(clippy::too_many_arguments)]
    async fn handle_failure(
        &self,
        session: &mut crate::session::types::SessionState,
        iteration_number: u32,
        task_id: &str,
        attempt: u32,
        prompt_token_estimate: u64,
        error_message: &str,
        evidence: Option<crate::iteration::types::VerificationEvidence>,
        raw_output: Option<String>,
        duration_ms: u64,
    ) -> Result<Option<EngineOutcome>> {
        let strategy = session.error_handling.strategy;

        let failure_analysis = if strategy == ErrorStrategy::AnalyzeRetry {
            let task_ctx = prompt::TaskContext {
                id: task_id,
                description: session
                    .current_task
                    .as_ref()
                    .map(|t| t.description.as_str())
                    .unwrap_or(""),
            };
            let prior = session.context.recent_failures.last();
            let analysis_prompt =
                prompt::build_analysis_prompt(&task_ctx, attempt, iteration_number, prior, error_message);
            match agent::run(
                &self.config.agent_binary,
                &analysis_prompt,
                &self.config.project_path,
                &self.config.project_path,
                self.config.agent_timeout_ms,
            )
            .await
            {
                Ok(output) => extractor::extract_failure_analysis(&output.raw_output, error_message),
                Err(e) => {
                    self.log(
                        Level::Warn,
                        format!("analysis agent call failed, synthesizing instead: {}", e),
                    );
                    crate::iteration::types::FailureAnalysis::synthesize(error_message)
                }
            }
        } else {
            crate::iteration::types::FailureAnalysis::synthesize(error_message)
        };

        let log = IterationLog {
            schema_version: ITERATION_SCHEMA_VERSION,
            session_id: session.session_id.clone(),
            iteration: iteration_number,
            task_id: task_id.to_string(),
            task_attempt: attempt,
            timestamp: chrono::Utc::now(),
            agent_thread_id: None,
            status: IterationStatus::Failed,
            prompt_token_estimate: Some(prompt_token_estimate),
            agent_claimed_complete: false,
            evidence,
            context: None,
            implemented: Vec::new(),
            codebase_patterns: Vec::new(),
            summary: None,
            failure_analysis: Some(failure_analysis.clone()),
            git_sha_before: None,
            git_sha_after: None,
            duration_ms,
            raw_output: raw_output.map(|r| sanitize_raw_output(&r)),
        };
        self.iteration_store.save(&log)?;
        self.iteration_store.generate_progress(session)?;

        session
            .context
            .add_failure(prompt::to_recent_failure(iteration_number, task_id, &failure_analysis));
        session.error_handling.current_retry_count += 1;

        let retries_exhausted = session.error_handling.current_retry_count >= session.error_handling.max_retries;

        if retries_exhausted && matches!(strategy, ErrorStrategy::Escalate | ErrorStrategy::AnalyzeRetry) {
            self.plan_provider
                .block(&self.config.change_id, &failure_analysis.root_cause, &self.config.project_path)
                .await?;
            session.status = SessionStatus::Failed;
            self.session_store.write(session)?;
            self.notify.task_complete(&self.config.run_id, task_id, false);
            return Ok(Some(EngineOutcome {
                success: false,
                message: Some(failure_analysis.root_cause.clone()),
            }));
        }

        if strategy == ErrorStrategy::Skip && retries_exhausted {
            tasklist::mark_skipped(&self.tasks_path(), task_id, &failure_analysis.root_cause)?;
            session.error_handling.current_retry_count = 0;
            self.notify.task_complete(&self.config.run_id, task_id, false);
            return Ok(None);
        }

        Ok(None)
    }
}

pub(crate) fn change_dir(project_path: &std::path::Path, change_id: &str) -> PathBuf {
    project_path.join("openspec").join("changes").join(change_id)
}

/// Read the authoritative spec context for a change: the verbatim
/// contents of `change.json` (produced by the plan provider, read-only
/// to the core), or an empty string if the change hasn't been authored
/// yet (spec.md §4.6, §6).
fn read_spec_context(change_json_path: &std::path::Path) -> String {
    read_json_opt::<serde_json::Value>(change_json_path)
        .ok()
        .flatten()
        .map(|v| serde_json::to_string_pretty(&v).unwrap_or_default())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn change_dir_nests_under_openspec_changes() {
        let project = std::path::Path::new("/tmp/my-project");
        let dir = change_dir(project, "add-widgets");
        assert_eq!(dir, std::path::PathBuf::from("/tmp/my-project/openspec/changes/add-widgets"));
    }

    #[test]
    fn read_spec_context_is_empty_when_change_json_absent() {
        let dir = TempDir::new().unwrap();
        let context = read_spec_context(&dir.path().join("change.json"));
        assert_eq!(context, "");
    }

    #[test]
    fn read_spec_context_pretty_prints_existing_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("change.json");
        std::fs::write(&path, r#"{"why":"users need widgets"}"#).unwrap();

        let context = read_spec_context(&path);
        assert!(context.contains("why"));
        assert!(context.contains("users need widgets"));
    }

    #[test]
    fn to_registry_and_notify_levels_agree_on_severity() {
        for level in [Level::Info, Level::Warn, Level::Error] {
            let registry_level = to_registry_level(level);
            let notify_level = to_notify_level(level);
            let matches = matches!(
                (registry_level, notify_level),
                (RegistryLogLevel::Info, notify::LogLevel::Info)
                    | (RegistryLogLevel::Warn, notify::LogLevel::Warn)
                    | (RegistryLogLevel::Error, notify::LogLevel::Error)
            );
            assert!(matches);
        }
    }
}
