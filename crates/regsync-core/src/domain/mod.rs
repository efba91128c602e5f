//! Domain model (IDs, task state machine, change records, cursors, errors).

pub mod change;
pub mod cursor;
pub mod errors;
pub mod ids;
pub mod outcome;
pub mod state;
pub mod sync_data;
pub mod task;
pub mod task_type;

pub use change::{ChangeRecord, package_scope};
pub use cursor::{Cursor, InvalidCursor};
pub use errors::{ErrorKind, FeedError, HintError, StoreError, SyncError, TaskError};
pub use ids::TaskId;
pub use outcome::Outcome;
pub use state::{FinishState, TaskState};
pub use sync_data::{PackageSyncData, keep_existing, merge_package_sync};
pub use task::{Precondition, Task, TaskData, Transition};
pub use task_type::TaskType;
