//! Transfer events (spec §6): one broadcast per state transition or
//! progress sample, each carrying a deep-copyable snapshot so subscribers
//! never observe the queue's internal state directly.
use serde::{Deserialize, Serialize};

use crate::task::{Direction, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Queued,
    Initializing,
    Started,
    Progress,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferEvent {
    pub kind: EventKind,
    pub task_id: TaskId,
    pub direction: Direction,
    pub name: String,
    pub size: u64,
    pub progress: f64,
    pub bytes_per_second: f64,
    pub error: Option<String>,
}
