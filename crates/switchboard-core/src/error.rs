//! Error taxonomy shared across the workspace.
//!
//! Every variant here is one of the kinds enumerated by the error handling
//! design: each carries enough context to render both a log line and an
//! HTTP status/body in the adapter layer, without this crate knowing
//! anything about HTTP.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The full set of error kinds a Process, its owning group, or the router
/// can surface.
#[derive(Debug, Error, Clone)]
pub enum CoreError {
    /// The resolver could not map a requested name to a real model.
    #[error("model not found: {0}")]
    ModelNotFound(String),

    /// The inbound request was missing a `model` field or was otherwise
    /// malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The child failed to spawn, never reported healthy, or exited
    /// before becoming ready.
    #[error("start() failed: {0}")]
    StartFailed(String),

    /// Shutdown was triggered while a health probe was in flight.
    #[error("health check interrupted due to shutdown")]
    HealthInterrupted,

    /// The process's in-flight cap was exceeded.
    #[error("too many in-flight requests for {0}")]
    OverCapacity(String),

    /// The request targeted a process that has reached its terminal state.
    #[error("process {0} is shut down")]
    StateUnavailable(String),

    /// An illegal state transition was attempted. Never surfaced to a
    /// client; logged and swallowed at the call site.
    #[error("invalid state transition for {process}: {from:?} -> {to:?}")]
    InvalidStateTransition {
        process: String,
        from: ProcessState,
        to: ProcessState,
    },

    /// A network error talking to the child, or a panic-class failure in
    /// the reverse-proxy machinery.
    #[error("upstream error: {0}")]
    UpstreamError(String),
}

impl CoreError {
    /// The HTTP status code the adapter layer should map this to. Returns
    /// `None` for kinds that are never surfaced to a client
    /// (`InvalidStateTransition` is logged only).
    #[must_use]
    pub const fn suggested_status_code(&self) -> Option<u16> {
        match self {
            Self::ModelNotFound(_) => Some(404),
            Self::InvalidRequest(_) => Some(400),
            Self::StartFailed(_) | Self::HealthInterrupted | Self::UpstreamError(_) => Some(502),
            Self::OverCapacity(_) => Some(429),
            Self::StateUnavailable(_) => Some(503),
            Self::InvalidStateTransition { .. } => None,
        }
    }

    /// Short machine-stable kind tag, used in log fields and (by the
    /// adapter layer) in error response bodies.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ModelNotFound(_) => "model-not-found",
            Self::InvalidRequest(_) => "invalid-request",
            Self::StartFailed(_) => "start-failed",
            Self::HealthInterrupted => "health-interrupted",
            Self::OverCapacity(_) => "over-capacity",
            Self::StateUnavailable(_) => "state-unavailable",
            Self::InvalidStateTransition { .. } => "invalid-state-transition",
            Self::UpstreamError(_) => "upstream-error",
        }
    }
}

/// The five states a Process can occupy.
///
/// `SHUTDOWN` is terminal: no transition leads out of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessState {
    Stopped,
    Starting,
    Ready,
    Stopping,
    Shutdown,
}

impl ProcessState {
    /// Whether a child OS process is expected to exist while in this
    /// state. Mirrors the invariant that a child exists iff state is one
    /// of `STARTING`, `READY`, `STOPPING`.
    #[must_use]
    pub const fn expects_child(self) -> bool {
        matches!(self, Self::Starting | Self::Ready | Self::Stopping)
    }

    /// Whether `to` is a legal transition target from `self`. `SHUTDOWN`
    /// is reachable only from `STOPPING` — a process mid-start or already
    /// stopped passes through `STOPPING` first.
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Stopped, Self::Starting)
                | (Self::Stopped, Self::Stopping)
                | (Self::Starting, Self::Ready)
                | (Self::Starting, Self::Stopping)
                | (Self::Starting, Self::Stopped)
                | (Self::Ready, Self::Stopping)
                | (Self::Stopping, Self::Stopped)
                | (Self::Stopping, Self::Shutdown)
        )
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "STOPPED",
            Self::Starting => "STARTING",
            Self::Ready => "READY",
            Self::Stopping => "STOPPING",
            Self::Shutdown => "SHUTDOWN",
        };
        f.write_str(s)
    }
}

/// The two shutdown modes `Process::stop` and `ProcessGroup::stopAll`
/// accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Block until in-flight requests drain or the graceful timeout
    /// elapses, whichever comes first.
    WaitInflight,
    /// Send the stop signal without draining in-flight requests.
    Immediate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_transitions_match_the_documented_state_machine() {
        assert!(ProcessState::Stopped.can_transition_to(ProcessState::Starting));
        assert!(ProcessState::Stopped.can_transition_to(ProcessState::Stopping));
        assert!(ProcessState::Starting.can_transition_to(ProcessState::Ready));
        assert!(ProcessState::Starting.can_transition_to(ProcessState::Stopping));
        assert!(ProcessState::Starting.can_transition_to(ProcessState::Stopped));
        assert!(ProcessState::Ready.can_transition_to(ProcessState::Stopping));
        assert!(ProcessState::Stopping.can_transition_to(ProcessState::Stopped));
        assert!(ProcessState::Stopping.can_transition_to(ProcessState::Shutdown));
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        assert!(!ProcessState::Stopped.can_transition_to(ProcessState::Ready));
        assert!(!ProcessState::Ready.can_transition_to(ProcessState::Starting));
        assert!(!ProcessState::Stopped.can_transition_to(ProcessState::Shutdown));
        assert!(!ProcessState::Starting.can_transition_to(ProcessState::Shutdown));
        assert!(!ProcessState::Shutdown.can_transition_to(ProcessState::Starting));
    }

    #[test]
    fn expects_child_matches_the_three_running_states() {
        assert!(!ProcessState::Stopped.expects_child());
        assert!(ProcessState::Starting.expects_child());
        assert!(ProcessState::Ready.expects_child());
        assert!(ProcessState::Stopping.expects_child());
        assert!(!ProcessState::Shutdown.expects_child());
    }

    #[test]
    fn status_codes_match_the_error_table() {
        assert_eq!(
            CoreError::ModelNotFound("x".into()).suggested_status_code(),
            Some(404)
        );
        assert_eq!(
            CoreError::InvalidRequest("x".into()).suggested_status_code(),
            Some(400)
        );
        assert_eq!(
            CoreError::StartFailed("x".into()).suggested_status_code(),
            Some(502)
        );
        assert_eq!(
            CoreError::HealthInterrupted.suggested_status_code(),
            Some(502)
        );
        assert_eq!(
            CoreError::OverCapacity("x".into()).suggested_status_code(),
            Some(429)
        );
        assert_eq!(
            CoreError::StateUnavailable("x".into()).suggested_status_code(),
            Some(503)
        );
        assert_eq!(
            CoreError::UpstreamError("x".into()).suggested_status_code(),
            Some(502)
        );
        assert_eq!(
            CoreError::InvalidStateTransition {
                process: "m".into(),
                from: ProcessState::Ready,
                to: ProcessState::Starting,
            }
            .suggested_status_code(),
            None
        );
    }
}
