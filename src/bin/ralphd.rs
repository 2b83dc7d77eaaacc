//! `ralphd` — CLI entrypoint that admits one run onto the Worker and waits
//! for it to reach a terminal state.
//!
//! Grounded in the host's own split between a long-lived dispatcher
//! (`server::state` wiring up `AgentManager`/`EventBroadcaster` once at
//! startup) and a thin per-invocation command layer
//! (`commands::ralph_loop::execution::start_ralph_loop`), collapsed here
//! into one process since this crate has no HTTP/UI layer to keep alive
//! (spec.md "Out of scope": "The HTTP/UI presentation layer").

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use ralph_core::clock::SystemClock;
use ralph_core::config::{ConfigManager, ConfigOverrides};
use ralph_core::engine::{Engine, EngineConfig};
use ralph_core::notify::NotificationSink;
use ralph_core::registry::types::{ProjectConfig, RunStatus};
use ralph_core::registry::RunRegistry;
use ralph_core::session::types::ErrorStrategy;
use ralph_core::shutdown::{register_signal_handlers, ShutdownState};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "ralphd", about = "Ralph autonomous-agent orchestration engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Drive one change's task plan to completion (or a blocking/failing state).
    Run {
        /// Path to the project root (must contain openspec/changes/<change>).
        #[arg(long, env = "RALPH_PROJECT_PATH")]
        project_path: PathBuf,

        /// The change id under openspec/changes/ to work.
        #[arg(long)]
        change: String,

        /// Agent binary to invoke for implementation iterations.
        #[arg(long, env = "RALPH_AGENT_BIN", default_value = "claude")]
        agent_binary: String,

        /// Binary that runs the quality-gate's spec validation step.
        #[arg(long, env = "RALPH_VALIDATOR_BIN", default_value = "openspec")]
        validator_binary: String,

        /// Binary that answers plan-provider status/validate/block/archive.
        #[arg(long, env = "RALPH_PLAN_PROVIDER_BIN", default_value = "openspec")]
        plan_provider_binary: String,

        #[arg(long)]
        max_iterations: Option<u32>,

        #[arg(long, value_enum)]
        error_strategy: Option<CliErrorStrategy>,

        #[arg(long)]
        max_retries: Option<u32>,

        /// Per-agent-call timeout, in milliseconds.
        #[arg(long)]
        agent_timeout_ms: Option<u64>,
    },
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum CliErrorStrategy {
    Retry,
    AnalyzeRetry,
    Skip,
    Escalate,
}

impl From<CliErrorStrategy> for ErrorStrategy {
    fn from(value: CliErrorStrategy) -> Self {
        match value {
            CliErrorStrategy::Retry => ErrorStrategy::Retry,
            CliErrorStrategy::AnalyzeRetry => ErrorStrategy::AnalyzeRetry,
            CliErrorStrategy::Skip => ErrorStrategy::Skip,
            CliErrorStrategy::Escalate => ErrorStrategy::Escalate,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            project_path,
            change,
            agent_binary,
            validator_binary,
            plan_provider_binary,
            max_iterations,
            error_strategy,
            max_retries,
            agent_timeout_ms,
        } => {
            run_command(
                project_path,
                change,
                agent_binary,
                validator_binary,
                plan_provider_binary,
                max_iterations,
                error_strategy.map(ErrorStrategy::from),
                max_retries,
                agent_timeout_ms,
            )
            .await
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_command(
    project_path: PathBuf,
    change_id: String,
    agent_binary: String,
    validator_binary: String,
    plan_provider_binary: String,
    max_iterations: Option<u32>,
    error_strategy: Option<ErrorStrategy>,
    max_retries: Option<u32>,
    agent_timeout_ms: Option<u64>,
) -> Result<()> {
    if !project_path.exists() {
        return Err(anyhow!("project path does not exist: {:?}", project_path));
    }

    let file_config = ConfigManager::new(&project_path).read()?;
    let overrides = ConfigOverrides {
        max_iterations,
        error_strategy,
        max_retries,
        check_command: None,
    };
    let config = ralph_core::config::merge_config(&file_config, &overrides);

    let shutdown = ShutdownState::new();
    register_signal_handlers(shutdown.clone())?;

    let data_dir = project_path.join(".ralph").join("registry");
    let registry = Arc::new(RunRegistry::new(&data_dir));
    let notify = Arc::new(NotificationSink::new());

    let run_id = Uuid::new_v4().to_string();
    let session_id = Uuid::new_v4().to_string();
    let project_name = project_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "project".to_string());

    registry.create_run(
        run_id.clone(),
        change_id.clone(),
        ProjectConfig {
            name: project_name.clone(),
            path: project_path.to_string_lossy().into_owned(),
            check_command: config.check_command.clone(),
            pre_check_command: config.pre_check_command.clone(),
        },
        config.max_iterations,
    )?;

    let engine = Engine::new(
        EngineConfig {
            run_id: run_id.clone(),
            session_id,
            change_id,
            project_path,
            project_name,
            check_command: config.check_command,
            agent_binary,
            validator_binary,
            plan_provider_binary,
            max_iterations: config.max_iterations,
            error_strategy: config.error_strategy,
            max_retries: config.max_retries,
            agent_timeout_ms,
        },
        registry.clone(),
        notify,
        Arc::new(SystemClock),
    );

    let engine_handle = tokio::spawn(async move { engine.run().await });

    // Poll for the shutdown signal alongside the engine so Ctrl+C marks the
    // run `stopped` instead of leaving it `running` with a dead owner.
    tokio::select! {
        outcome = engine_handle => {
            let outcome = outcome.map_err(|e| anyhow!("engine task panicked: {}", e))?;
            log::info!("run {} finished: success={} message={:?}", run_id, outcome.success, outcome.message);
            if outcome.success {
                Ok(())
            } else {
                Err(anyhow!(outcome.message.unwrap_or_else(|| "run failed".into())))
            }
        }
        _ = wait_for_shutdown(&shutdown) => {
            log::info!("shutdown requested, marking run {} stopped", run_id);
            registry.set_status(&run_id, RunStatus::Stopped)?;
            Err(anyhow!("run stopped by signal"))
        }
    }
}

async fn wait_for_shutdown(state: &ShutdownState) {
    loop {
        if state.is_shutdown_requested() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}
