//! Clock & Process Probe — current time and OS process liveness.
//!
//! A trait seam so the Engine's stale-lock logic can be exercised in tests
//! without depending on real wall-clock time or a real PID.

use chrono::{DateTime, Utc};
use sysinfo::{Pid, System};

/// Abstraction over "what time is it" and "is this process alive".
///
/// Grounded in the host's `session::lock::SessionLock::is_process_alive`,
/// which refreshes a `sysinfo::System` and looks the pid up directly.
pub trait ClockProbe: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    fn is_process_alive(&self, pid: u32) -> bool;
}

/// Real clock backed by `chrono::Utc::now` and `sysinfo`.
#[derive(Debug, Default)]
pub struct SystemClock;

impl ClockProbe for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn is_process_alive(&self, pid: u32) -> bool {
        let mut system = System::new();
        system.refresh_processes(sysinfo::ProcessesToUpdate::All, true);
        system.process(Pid::from_u32(pid)).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_process_is_alive() {
        let clock = SystemClock;
        assert!(clock.is_process_alive(std::process::id()));
    }

    #[test]
    fn unlikely_pid_is_not_alive() {
        let clock = SystemClock;
        assert!(!clock.is_process_alive(u32::MAX - 1));
    }

    #[test]
    fn now_is_monotonic_enough() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
