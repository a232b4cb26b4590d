//! Agent lifecycle states and the transition table.
//!
//! [`transition`] is pure; the [`Supervisor`](crate::supervisor::Supervisor) is the only
//! caller that applies its result.

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// CORE TYPES
// ============================================================================

/// Status of the supervised agent. Exactly one holds at a time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// No process; ready to start
    #[default]
    Stopped,

    /// Process spawned, waiting for the health endpoint to report ready
    Starting,

    /// Serving requests
    Running,

    /// Shutdown requested, waiting for the process to exit
    Stopping,

    /// Last run failed to start or crashed
    Error,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentStatus::Stopped => write!(f, "Stopped"),
            AgentStatus::Starting => write!(f, "Starting"),
            AgentStatus::Running => write!(f, "Running"),
            AgentStatus::Stopping => write!(f, "Stopping"),
            AgentStatus::Error => write!(f, "Error"),
        }
    }
}

impl AgentStatus {
    /// Check if this state allows transitions to another state
    pub fn can_transition_to(&self, target: AgentStatus) -> bool {
        use AgentStatus::*;
        matches!(
            (*self, target),
            (Stopped, Starting)
                | (Error, Starting)
                | (Stopped, Error)
                | (Error, Error)
                | (Starting, Running)
                | (Starting, Stopping)
                | (Running, Stopping)
                | (Stopping, Stopped)
                | (Starting, Error)
                | (Running, Error)
        )
    }

    /// A start command is accepted in this state.
    pub fn accepts_start(&self) -> bool {
        matches!(self, AgentStatus::Stopped | AgentStatus::Error)
    }

    /// A stop command is accepted in this state.
    pub fn accepts_stop(&self) -> bool {
        matches!(self, AgentStatus::Starting | AgentStatus::Running)
    }
}

/// Inputs to the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Preflight passed and the process was spawned
    Launched,

    /// Preflight or launch failed; no process exists
    StartFailed,

    /// Health endpoint reported ready
    Ready,

    /// Stop command accepted
    Stop,

    /// The process exited (for any reason)
    Terminated,
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleEvent::Launched => write!(f, "launched"),
            LifecycleEvent::StartFailed => write!(f, "start failed"),
            LifecycleEvent::Ready => write!(f, "ready"),
            LifecycleEvent::Stop => write!(f, "stop"),
            LifecycleEvent::Terminated => write!(f, "terminated"),
        }
    }
}

// ============================================================================
// TRANSITIONS
// ============================================================================

/// Next status for `event` in `current`, or `None` if the event does not apply.
pub fn transition(current: AgentStatus, event: LifecycleEvent) -> Option<AgentStatus> {
    use AgentStatus::*;
    use LifecycleEvent::*;

    let next = match (current, event) {
        (Stopped | Error, Launched) => Starting,
        (Stopped | Error, StartFailed) => Error,
        (Starting, Ready) => Running,
        (Starting | Running, Stop) => Stopping,
        (Stopping, Terminated) => Stopped,
        (Starting | Running, Terminated) => Error,
        _ => return None,
    };

    debug_assert!(current.can_transition_to(next));
    Some(next)
}
