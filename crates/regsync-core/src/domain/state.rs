//! Task state machine states.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Task state.
///
/// State transitions:
/// - Waiting -> Processing (claim)
/// - Processing -> Success | Fail (finish)
/// - Processing -> Waiting (timeout requeue, attempts + 1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Waiting,
    Processing,
    Success,
    Fail,
}

impl TaskState {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Success | TaskState::Fail)
    }

    /// Waiting or Processing: the bizId of such a row is taken.
    pub fn is_live(self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Waiting => "waiting",
            TaskState::Processing => "processing",
            TaskState::Success => "success",
            TaskState::Fail => "fail",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown task state {0:?}")]
pub struct UnknownTaskState(pub String);

impl FromStr for TaskState {
    type Err = UnknownTaskState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(TaskState::Waiting),
            "processing" => Ok(TaskState::Processing),
            "success" => Ok(TaskState::Success),
            "fail" => Ok(TaskState::Fail),
            other => Err(UnknownTaskState(other.to_string())),
        }
    }
}

/// The two ways a task can end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishState {
    Success,
    Fail,
}

impl From<FinishState> for TaskState {
    fn from(state: FinishState) -> Self {
        match state {
            FinishState::Success => TaskState::Success,
            FinishState::Fail => TaskState::Fail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::waiting(TaskState::Waiting, false)]
    #[case::processing(TaskState::Processing, false)]
    #[case::success(TaskState::Success, true)]
    #[case::fail(TaskState::Fail, true)]
    fn terminal_states(#[case] state: TaskState, #[case] terminal: bool) {
        assert_eq!(state.is_terminal(), terminal);
        assert_eq!(state.is_live(), !terminal);
    }

    #[test]
    fn text_form_matches_serde() {
        for state in [
            TaskState::Waiting,
            TaskState::Processing,
            TaskState::Success,
            TaskState::Fail,
        ] {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{}\"", state.as_str()));
            assert_eq!(state.as_str().parse::<TaskState>().unwrap(), state);
        }
        assert!("done".parse::<TaskState>().is_err());
    }
}
