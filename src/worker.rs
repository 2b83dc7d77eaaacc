//! Worker — the bounded-concurrency dispatcher admitting queued runs onto
//! Engine instances (spec.md §4.1, §5 "Concurrency & Resource Model").
//!
//! Grounded in two host pieces: `perform_auto_recovery` /
//! `recover_stale_ralph_executions` (`lib.rs`), which scans every known
//! project for a stale lock and calls `file_storage::iterations::
//! get_stale_executions`/`mark_interrupted_iterations` before resuming —
//! `start`'s `recover_stale_run` does the same cross-reference against this
//! crate's own `ChangeLock`/`IterationStore`; and `shutdown::ShutdownState`,
//! whose atomic-flag-plus-Arc shape is reused for the in-flight run
//! bookkeeping below (an `Arc<Mutex<...>>` shared between the sweep and
//! every spawned task, the same sharing style `ralph_loop::
//! parallel_orchestrator` uses for its own `cancelled` flag).

use crate::clock::ClockProbe;
use crate::engine::{change_dir, Engine, EngineConfig, EngineOutcome};
use crate::iteration::IterationStore;
use crate::notify::NotificationSink;
use crate::registry::types::{LogLevel, RunRecord, RunStatus};
use crate::registry::RunRegistry;
use crate::session::lock::LockCheck;
use crate::session::types::{ErrorStrategy, SessionStatus};
use crate::session::SessionStore;
use anyhow::Result;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

/// Default concurrency cap (spec.md §5 "Concurrency & Resource Model").
pub const DEFAULT_MAX_CONCURRENT_RUNS: usize = 20;

/// Per-run settings the Worker turns into an `EngineConfig` at admission
/// time (spec.md §4.1 "Inputs"). One of these rides along with each
/// registry row's `project_config` and is not itself persisted twice.
#[derive(Debug, Clone)]
pub struct RunSpec {
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

impl RunSpec {
    fn into_engine_config(self) -> EngineConfig {
        EngineConfig {
            run_id: self.run_id,
            session_id: self.session_id,
            change_id: self.change_id,
            project_path: self.project_path,
            project_name: self.project_name,
            check_command: self.check_command,
            agent_binary: self.agent_binary,
            validator_binary: self.validator_binary,
            plan_provider_binary: self.plan_provider_binary,
            max_iterations: self.max_iterations,
            error_strategy: self.error_strategy,
            max_retries: self.max_retries,
            agent_timeout_ms: self.agent_timeout_ms,
        }
    }
}

/// A source of `RunSpec`s for runs the registry already knows about but
/// the Worker hasn't admitted yet. The registry stores the generic
/// `RunRecord`; only the caller (the CLI, or a future HTTP layer) knows
/// the per-run agent/validator/plan-provider binaries and error policy,
/// so admission asks this trait to resolve a registry row into a full spec
/// rather than the Worker inventing defaults for fields it can't know.
pub trait RunSpecSource: Send + Sync {
    fn resolve(&self, run_id: &str) -> Result<Option<RunSpec>>;
}

/// Bounded-concurrency dispatcher. One process owns one Worker; every
/// `Engine::run` that gets admitted runs as its own tokio task, capped by
/// `semaphore` (spec.md §5 "at most N engines run concurrently").
pub struct Worker {
    registry: Arc<RunRegistry>,
    notify: Arc<NotificationSink>,
    clock: Arc<dyn ClockProbe>,
    spec_source: Arc<dyn RunSpecSource>,
    semaphore: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl Worker {
    pub fn new(
        registry: Arc<RunRegistry>,
        notify: Arc<NotificationSink>,
        clock: Arc<dyn ClockProbe>,
        spec_source: Arc<dyn RunSpecSource>,
        max_concurrent_runs: usize,
    ) -> Self {
        Self {
            registry,
            notify,
            clock,
            spec_source,
            semaphore: Arc::new(Semaphore::new(max_concurrent_runs.max(1))),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// One-time startup sweep: for every run the registry already lists as
    /// `running` (process restarted with work in flight), check whether its
    /// change lock is stale before re-admitting it, matching the host's
    /// `perform_auto_recovery` / `recover_stale_ralph_executions` sweep over
    /// every known project.
    pub fn start(&self) -> Result<()> {
        for run in self.registry.list_running()? {
            self.recover_stale_run(&run);
            self.notify_new_run(&run.id);
        }
        Ok(())
    }

    /// If `run`'s change lock is stale (owner dead or past the staleness
    /// threshold, `ChangeLock::check`), the process driving it crashed
    /// mid-iteration. Mark that iteration `interrupted` in its iteration
    /// log for the record, then fall through to re-admission — the Engine
    /// itself takes over the stale lock on acquire, so the sweep's job is
    /// bookkeeping, not recovery of the run.
    fn recover_stale_run(&self, run: &RunRecord) {
        let project_path = std::path::Path::new(&run.project_config.path);
        let change_path = change_dir(project_path, &run.change_id);
        let session_store = SessionStore::new(&change_path, self.clock.clone());

        let session = match session_store.read() {
            Ok(Some(session)) => session,
            Ok(None) => return,
            Err(e) => {
                log::warn!("run {}: failed to read session during recovery sweep: {}", run.id, e);
                return;
            }
        };
        if session.status != SessionStatus::Running {
            return;
        }

        match session_store.check_lock() {
            Ok(LockCheck::Stale { info }) => {
                log::warn!(
                    "run {}: stale lock from pid {} detected, marking iteration {} interrupted",
                    run.id,
                    info.pid,
                    session.iteration + 1
                );
                let iteration_store = IterationStore::new(session_store.ralph_dir());
                if let Err(e) = iteration_store.mark_interrupted(&session) {
                    log::warn!("run {}: failed to record interrupted iteration: {}", run.id, e);
                }
                let _ = self.registry.append_log(
                    &run.id,
                    LogLevel::Warn,
                    format!("recovered stale execution (owner pid {} no longer alive)", info.pid),
                );
            }
            Ok(_) => {}
            Err(e) => log::warn!("run {}: failed to check lock during recovery sweep: {}", run.id, e),
        }
    }

    /// Attempt immediate admission of a run and publish `run:new`
    /// regardless of whether admission succeeds (spec.md §6 "run:new").
    /// Idempotent: a run already in flight, or already non-`running` in
    /// the registry, is skipped silently rather than double-admitted
    /// (spec.md §8 property 5 / scenario S6).
    pub fn notify_new_run(&self, run_id: &str) {
        self.notify.run_new(run_id);

        {
            let mut in_flight = self.in_flight.lock().unwrap();
            if in_flight.contains(run_id) {
                log::debug!("run {} already in flight, ignoring duplicate notification", run_id);
                return;
            }
            in_flight.insert(run_id.to_string());
        }

        let run_id = run_id.to_string();
        let registry = self.registry.clone();
        let notify = self.notify.clone();
        let clock = self.clock.clone();
        let spec_source = self.spec_source.clone();
        let semaphore = self.semaphore.clone();
        let in_flight = self.in_flight.clone();

        tokio::spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    in_flight.lock().unwrap().remove(&run_id);
                    return;
                }
            };
            let outcome = run_one(&run_id, &registry, &notify, clock, spec_source.as_ref()).await;
            if let Err(e) = outcome {
                log::error!("run {} failed before engine execution: {}", run_id, e);
                let _ = registry.set_status(&run_id, RunStatus::Failed);
                let _ = registry.append_log(
                    &run_id,
                    crate::registry::types::LogLevel::Error,
                    format!("admission failed: {}", e),
                );
            }
            in_flight.lock().unwrap().remove(&run_id);
        });
    }
}

/// Resolve the run, build and execute its Engine. Failure semantics
/// (spec.md §4.1 "Failure semantics"): any error here is the Worker's own
/// fault (bad spec, can't even construct an Engine), never the run's
/// business logic, so it always marks the run `failed` in the caller.
async fn run_one(
    run_id: &str,
    registry: &Arc<RunRegistry>,
    notify: &Arc<NotificationSink>,
    clock: Arc<dyn ClockProbe>,
    spec_source: &dyn RunSpecSource,
) -> Result<EngineOutcome> {
    let record = registry
        .get(run_id)?
        .ok_or_else(|| anyhow::anyhow!("no such run: {}", run_id))?;
    if record.status != RunStatus::Running {
        log::debug!("run {} is not in running state ({:?}), skipping admission", run_id, record.status);
        return Ok(EngineOutcome {
            success: true,
            message: Some("run already settled".into()),
        });
    }

    let spec = spec_source
        .resolve(run_id)?
        .ok_or_else(|| anyhow::anyhow!("no run spec available for run: {}", run_id))?;
    let config = spec.into_engine_config();
    let engine = Engine::new(config, registry.clone(), notify.clone(), clock);
    Ok(engine.run().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::registry::types::ProjectConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct NoSpecs;
    impl RunSpecSource for NoSpecs {
        fn resolve(&self, _run_id: &str) -> Result<Option<RunSpec>> {
            Ok(None)
        }
    }

    fn project_config() -> ProjectConfig {
        ProjectConfig {
            name: "demo".into(),
            path: "/tmp/demo".into(),
            check_command: None,
            pre_check_command: None,
        }
    }

    #[tokio::test]
    async fn missing_run_spec_marks_run_failed() {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(RunRegistry::new(dir.path()));
        registry
            .create_run("run-1".into(), "change-1".into(), project_config(), 5)
            .unwrap();
        let notify = Arc::new(NotificationSink::new());
        let worker = Worker::new(
            registry.clone(),
            notify,
            Arc::new(SystemClock),
            Arc::new(NoSpecs),
            4,
        );

        worker.notify_new_run("run-1");
        // Give the spawned task a chance to run.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let record = registry.get("run-1").unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn duplicate_notification_is_ignored_while_in_flight() {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(RunRegistry::new(dir.path()));
        registry
            .create_run("run-1".into(), "change-1".into(), project_config(), 5)
            .unwrap();
        let notify = Arc::new(NotificationSink::new());

        struct CountingSlowSource(Arc<AtomicUsize>);
        impl RunSpecSource for CountingSlowSource {
            fn resolve(&self, _run_id: &str) -> Result<Option<RunSpec>> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            }
        }
        let calls = Arc::new(AtomicUsize::new(0));
        let worker = Worker::new(
            registry.clone(),
            notify,
            Arc::new(SystemClock),
            Arc::new(CountingSlowSource(calls.clone())),
            1,
        );

        worker.notify_new_run("run-1");
        worker.notify_new_run("run-1");
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    struct FakeClock {
        now: Mutex<chrono::DateTime<chrono::Utc>>,
    }

    impl FakeClock {
        fn new() -> Self {
            Self {
                now: Mutex::new(chrono::Utc::now()),
            }
        }

        fn advance(&self, d: chrono::Duration) {
            *self.now.lock().unwrap() += d;
        }
    }

    impl ClockProbe for FakeClock {
        fn now(&self) -> chrono::DateTime<chrono::Utc> {
            *self.now.lock().unwrap()
        }

        fn is_process_alive(&self, _pid: u32) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn start_marks_stale_run_iteration_interrupted() {
        use crate::iteration::types::IterationStatus;
        use crate::session::types::ErrorHandlingConfig;

        let project_dir = TempDir::new().unwrap();
        let change_path = project_dir.path().join("openspec").join("changes").join("change-1");
        std::fs::create_dir_all(&change_path).unwrap();

        let clock = Arc::new(FakeClock::new());
        let session_store = SessionStore::new(&change_path, clock.clone());
        session_store.ensure_dirs().unwrap();
        let session = session_store.create_initial("sess-1".into(), "change-1".into(), 10, ErrorHandlingConfig::default());
        session_store.write(&session).unwrap();

        let mut lock = session_store.lock();
        lock.acquire("sess-1").unwrap();
        std::mem::forget(lock); // simulate the owner crashing without releasing
        clock.advance(chrono::Duration::minutes(6));

        let registry_dir = TempDir::new().unwrap();
        let registry = Arc::new(RunRegistry::new(registry_dir.path()));
        registry
            .create_run(
                "run-1".into(),
                "change-1".into(),
                ProjectConfig {
                    name: "demo".into(),
                    path: project_dir.path().to_string_lossy().into_owned(),
                    check_command: None,
                    pre_check_command: None,
                },
                10,
            )
            .unwrap();

        let notify = Arc::new(NotificationSink::new());
        let worker = Worker::new(registry.clone(), notify, clock.clone(), Arc::new(NoSpecs), 4);
        worker.start().unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let iteration_store = IterationStore::new(session_store.ralph_dir());
        let log = iteration_store.read(1).unwrap().expect("interrupted log for iteration 1");
        assert_eq!(log.status, IterationStatus::Interrupted);
    }
}
