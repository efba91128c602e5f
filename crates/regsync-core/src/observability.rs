use serde::{Deserialize, Serialize};

use crate::domain::{Cursor, TaskState};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub waiting: usize,
    pub processing: usize,
    pub success: usize,
    pub fail: usize,
}

impl TaskCounts {
    pub fn add(&mut self, state: TaskState, n: usize) {
        match state {
            TaskState::Waiting => self.waiting += n,
            TaskState::Processing => self.processing += n,
            TaskState::Success => self.success += n,
            TaskState::Fail => self.fail += n,
        }
    }

    pub fn total(&self) -> usize {
        self.waiting + self.processing + self.success + self.fail
    }
}

/// Result of one `sweep_timeouts` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepCounts {
    /// Stuck Processing rows this pass took over (`requeued + failed`).
    pub processing: usize,
    /// Stale Waiting rows re-pushed to the hint queue.
    pub waiting: usize,
    pub requeued: usize,
    pub failed: usize,
}

/// Result of one `ingest_once` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    pub registry: String,
    pub since: Option<Cursor>,
    pub cursor: Option<Cursor>,
    /// Records that reached task creation.
    pub records: u64,
    /// Records dropped by the scope filter.
    pub filtered: u64,
    pub created: u64,
    pub merged: u64,
    pub checkpoints: u64,
}

/// Result of one `run_execution_loop` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub claimed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Finished runs sent back to Waiting because a change merged in meanwhile.
    pub rerun: usize,
    /// Finishes rejected because the task had been taken over.
    pub conflicts: usize,
}
