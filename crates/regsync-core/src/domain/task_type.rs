//! TaskType - the kind of work a task represents.
//!
//! The store treats the type as an opaque label; handlers are registered per
//! type and interpret `Task::data` accordingly.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TaskType {
    /// Sync one package (all versions, or `specificVersions` only).
    PackageSync,
    /// Sync one binary mirror directory.
    BinarySync,
    /// Poll one upstream change feed and turn its records into tasks.
    ChangeFeedPoll,
    /// Deliver one hook event.
    HookTrigger,
}

impl TaskType {
    pub const ALL: [TaskType; 4] = [
        TaskType::PackageSync,
        TaskType::BinarySync,
        TaskType::ChangeFeedPoll,
        TaskType::HookTrigger,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::PackageSync => "PackageSync",
            TaskType::BinarySync => "BinarySync",
            TaskType::ChangeFeedPoll => "ChangeFeedPoll",
            TaskType::HookTrigger => "HookTrigger",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown task type {0:?}")]
pub struct UnknownTaskType(pub String);

impl FromStr for TaskType {
    type Err = UnknownTaskType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownTaskType(s.to_string()))
    }
}
