//! Observer-visible record of one in-flight or terminal transfer (spec §3
//! `TransferTask`). The queue exclusively owns the task list; everything
//! handed to an observer (`GetTasks`, event payloads) is a deep copy with
//! no shared state back into the queue's internals.
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type TaskId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Upload,
    Download,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Queued,
    Initializing,
    Active,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed | TaskState::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferTask {
    pub id: TaskId,
    pub direction: Direction,
    pub display_name: String,
    pub source: String,
    pub destination: String,
    pub declared_size: u64,
    pub state: TaskState,
    /// Always in `[0, 1]`, never NaN — see `TransferQueue::update_progress`.
    pub progress: f64,
    pub bytes_per_second: f64,
    pub error: Option<String>,
    pub created_at_unix: u64,
    pub started_at_unix: Option<u64>,
    pub completed_at_unix: Option<u64>,
}

impl TransferTask {
    pub(crate) fn new(
        id: TaskId,
        direction: Direction,
        display_name: String,
        source: String,
        destination: String,
        declared_size: u64,
        now_unix: u64,
    ) -> Self {
        Self {
            id,
            direction,
            display_name,
            source,
            destination,
            declared_size,
            state: TaskState::Queued,
            progress: 0.0,
            bytes_per_second: 0.0,
            error: None,
            created_at_unix: now_unix,
            started_at_unix: None,
            completed_at_unix: None,
        }
    }
}
