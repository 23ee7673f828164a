use crate::core::{RegistryError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle of a client: `NotStarted -> Started -> Stopped`, where `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleState {
    NotStarted,
    Started,
    Stopped,
}

impl LifecycleState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::NotStarted,
            1 => Self::Started,
            _ => Self::Stopped,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotStarted => "not started",
            Self::Started => "started",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// One-shot start/stop guard backed by a single atomic state flag.
///
/// `try_start` and `try_stop` each succeed for exactly one caller, so side effects gated on
/// them run at most once even under concurrent invocation.
#[derive(Debug, Default)]
pub struct LifecycleGuard {
    state: AtomicU8,
}

impl LifecycleGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_started(&self) -> bool {
        self.state() == LifecycleState::Started
    }

    /// Returns true only for the caller that moved the guard from `NotStarted` to `Started`.
    pub fn try_start(&self) -> bool {
        self.state
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Returns true only for the caller that moved the guard from `Started` to `Stopped`.
    pub fn try_stop(&self) -> bool {
        self.state
            .compare_exchange(1, 2, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn ensure_started(&self) -> Result<()> {
        match self.state() {
            LifecycleState::Started => Ok(()),
            other => Err(RegistryError::NotStarted(other)),
        }
    }
}
