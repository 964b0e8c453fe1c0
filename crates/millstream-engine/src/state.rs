//! Execution states shared by workflow, task and action executions.

use serde::{Deserialize, Serialize};

/// State of a workflow, task or action execution.
///
/// All three execution kinds share one state set. Terminal states are
/// [`State::Success`], [`State::Error`] and [`State::Cancelled`]; once an
/// execution reaches one of them it is never mutated again (except for the
/// read-only marker on workflow executions).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    /// Created but not started yet
    Idle,

    /// Waiting for an external condition (join predecessors, wait delay)
    Waiting,

    /// Actively executing
    Running,

    /// Suspended, can be resumed
    Paused,

    /// Completed successfully
    Success,

    /// Completed with an unrecovered error
    Error,

    /// Completed by cancellation
    Cancelled,
}

impl State {
    /// Whether this is a terminal state.
    pub fn is_completed(self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Cancelled)
    }

    /// Whether the execution can be resumed from this state.
    pub fn is_paused_or_idle(self) -> bool {
        matches!(self, Self::Paused | Self::Idle | Self::Waiting)
    }

    pub fn is_running(self) -> bool {
        matches!(self, Self::Running)
    }

    /// Whether a transition from `self` to `to` is legal.
    ///
    /// Terminal states accept no transition (identity included: completion
    /// is applied exactly once). Rerun bypasses this check explicitly by
    /// resetting the execution.
    pub fn can_transition(self, to: State) -> bool {
        if self == to {
            return false;
        }

        match self {
            Self::Idle => matches!(
                to,
                Self::Running | Self::Waiting | Self::Paused | Self::Error | Self::Cancelled
            ),
            Self::Waiting => matches!(
                to,
                Self::Running | Self::Paused | Self::Error | Self::Cancelled
            ),
            Self::Running => matches!(
                to,
                Self::Waiting
                    | Self::Paused
                    | Self::Success
                    | Self::Error
                    | Self::Cancelled
            ),
            Self::Paused => matches!(to, Self::Running | Self::Error | Self::Cancelled),
            Self::Success | Self::Error | Self::Cancelled => false,
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Waiting => write!(f, "WAITING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Paused => write!(f, "PAUSED"),
            Self::Success => write!(f, "SUCCESS"),
            Self::Error => write!(f, "ERROR"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

impl std::str::FromStr for State {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IDLE" => Ok(Self::Idle),
            "WAITING" => Ok(Self::Waiting),
            "RUNNING" => Ok(Self::Running),
            "PAUSED" => Ok(Self::Paused),
            "SUCCESS" => Ok(Self::Success),
            "ERROR" => Ok(Self::Error),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(format!("unknown execution state: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completed_states() {
        assert!(State::Success.is_completed());
        assert!(State::Error.is_completed());
        assert!(State::Cancelled.is_completed());
        assert!(!State::Running.is_completed());
        assert!(!State::Waiting.is_completed());
    }

    #[test]
    fn test_paused_or_idle() {
        assert!(State::Paused.is_paused_or_idle());
        assert!(State::Idle.is_paused_or_idle());
        assert!(State::Waiting.is_paused_or_idle());
        assert!(!State::Running.is_paused_or_idle());
    }

    #[test]
    fn test_terminal_states_accept_no_transition() {
        for from in [State::Success, State::Error, State::Cancelled] {
            for to in [
                State::Idle,
                State::Waiting,
                State::Running,
                State::Paused,
                State::Success,
                State::Error,
                State::Cancelled,
            ] {
                assert!(!from.can_transition(to), "{} -> {} must be illegal", from, to);
            }
        }
    }

    #[test]
    fn test_regular_transitions() {
        assert!(State::Idle.can_transition(State::Running));
        assert!(State::Running.can_transition(State::Success));
        assert!(State::Running.can_transition(State::Paused));
        assert!(State::Paused.can_transition(State::Running));
        assert!(State::Waiting.can_transition(State::Running));
        assert!(!State::Paused.can_transition(State::Success));
    }

    #[test]
    fn test_roundtrip_display_parse() {
        for state in [State::Idle, State::Running, State::Cancelled] {
            let parsed: State = state.to_string().parse().expect("should parse");
            assert_eq!(parsed, state);
        }
    }
}
