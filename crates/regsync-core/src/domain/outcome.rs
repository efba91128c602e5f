//! Outcome model: what a handler reports back for one claimed task.

use serde::{Deserialize, Serialize};

use super::state::FinishState;

/// The result of running a handler on a claimed task.
///
/// The execution loop persists it through `TaskStore::finish`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub state: FinishState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Outcome {
    pub fn success() -> Self {
        Self {
            state: FinishState::Success,
            reason: None,
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            state: FinishState::Fail,
            reason: Some(reason.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.state == FinishState::Success
    }
}
