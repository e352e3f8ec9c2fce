//! Service lifecycle
//!
//! `idle -> starting -> running -> stopping -> stopped`, and back to
//! `starting` for a restart. Every transition is checked under one mutex so a
//! second `start` while running, or a second `stop`, is a no-op for the caller.

use serde::Serialize;
use std::fmt;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub struct Lifecycle {
    state: Mutex<LifecycleState>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LifecycleState::Idle),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.lock()
    }

    pub fn is_running(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    /// Claim the right to start. Returns false if already starting or running.
    pub fn begin_start(&self) -> bool {
        let mut state = self.lock();
        match *state {
            LifecycleState::Idle | LifecycleState::Stopped => {
                *state = LifecycleState::Starting;
                true
            }
            _ => false,
        }
    }

    pub fn mark_running(&self) {
        *self.lock() = LifecycleState::Running;
    }

    /// Roll back a failed start
    pub fn mark_failed(&self) {
        *self.lock() = LifecycleState::Stopped;
    }

    /// Claim the right to stop. Returns false if nothing is running.
    pub fn begin_stop(&self) -> bool {
        let mut state = self.lock();
        match *state {
            LifecycleState::Starting | LifecycleState::Running => {
                *state = LifecycleState::Stopping;
                true
            }
            _ => false,
        }
    }

    pub fn mark_stopped(&self) {
        *self.lock() = LifecycleState::Stopped;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LifecycleState> {
        // A poisoned lock still holds a valid enum value
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_double_start_is_rejected() {
        let lc = Lifecycle::new();
        assert!(lc.begin_start());
        assert!(!lc.begin_start());
        lc.mark_running();
        assert!(!lc.begin_start());
        assert!(lc.is_running());
    }

    #[test]
    fn test_double_stop_is_noop() {
        let lc = Lifecycle::new();
        assert!(!lc.begin_stop());
        assert!(lc.begin_start());
        lc.mark_running();
        assert!(lc.begin_stop());
        assert!(!lc.begin_stop());
        lc.mark_stopped();
        assert_eq!(lc.state(), LifecycleState::Stopped);
    }

    #[test]
    fn test_restart_cycle() {
        let lc = Lifecycle::new();
        for _ in 0..3 {
            assert!(lc.begin_start());
            lc.mark_running();
            assert!(lc.begin_stop());
            lc.mark_stopped();
        }
        assert_eq!(lc.state().to_string(), "stopped");
    }
}
