//! Notification Sink — process-wide, typed event broadcaster (spec.md §4.1,
//! §6, §9 "Module-level state").
//!
//! Grounded in the host's `server::events::EventBroadcaster`
//! (`tokio::sync::broadcast`, fire-and-forget `broadcast`/`subscribe`),
//! narrowed from the host's stringly-typed `{event, payload}` envelope to
//! the fixed, closed set of event shapes spec.md §6 enumerates.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatusKind {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// The closed set of typed events the Notification Sink carries
/// (spec.md §6 "Notification sink (optional)").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationEvent {
    #[serde(rename = "run:new")]
    RunNew { run_id: String },
    #[serde(rename = "run:status")]
    RunStatus { run_id: String, status: RunStatusKind },
    #[serde(rename = "task:start")]
    TaskStart { run_id: String, task_id: String, title: String },
    #[serde(rename = "task:complete")]
    TaskComplete { run_id: String, task_id: String, success: bool },
    #[serde(rename = "log")]
    Log { run_id: String, level: LogLevel, message: String },
}

/// Process-wide event broadcaster. Publishers fire-and-forget; a run
/// with no subscribers is not an error (spec.md §5 "Shared resources").
pub struct NotificationSink {
    tx: broadcast::Sender<NotificationEvent>,
}

impl NotificationSink {
    /// Channel capacity of 1000 events, matching the host's
    /// `EventBroadcaster::new`.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1000);
        Self { tx }
    }

    pub fn publish(&self, event: NotificationEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NotificationEvent> {
        self.tx.subscribe()
    }

    pub fn run_new(&self, run_id: impl Into<String>) {
        self.publish(NotificationEvent::RunNew { run_id: run_id.into() });
    }

    pub fn run_status(&self, run_id: impl Into<String>, status: RunStatusKind) {
        self.publish(NotificationEvent::RunStatus { run_id: run_id.into(), status });
    }

    pub fn task_start(&self, run_id: impl Into<String>, task_id: impl Into<String>, title: impl Into<String>) {
        self.publish(NotificationEvent::TaskStart {
            run_id: run_id.into(),
            task_id: task_id.into(),
            title: title.into(),
        });
    }

    pub fn task_complete(&self, run_id: impl Into<String>, task_id: impl Into<String>, success: bool) {
        self.publish(NotificationEvent::TaskComplete {
            run_id: run_id.into(),
            task_id: task_id.into(),
            success,
        });
    }

    pub fn log(&self, run_id: impl Into<String>, level: LogLevel, message: impl Into<String>) {
        self.publish(NotificationEvent::Log {
            run_id: run_id.into(),
            level,
            message: message.into(),
        });
    }
}

impl Default for NotificationSink {
    fn default() -> Self {
        Self::new()
    }
}
