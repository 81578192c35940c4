//! Master-side error types.

use thiserror::Error;

use crate::common::messages::{ProtocolError, TaskId, TaskStatus};
use crate::master::slave::SlaveKey;

/// Raised by a placement policy when no slave can take a task.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlacementError {
    #[error("no eligible slave for the task")]
    NoEligiblePeer,
}

#[derive(Debug, Error)]
pub enum MasterError {
    #[error("task {task_id} could not be placed: {source}")]
    Placement {
        task_id: TaskId,
        #[source]
        source: PlacementError,
    },

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("task {0} is {1:?}, expected pending")]
    TaskNotPending(TaskId, TaskStatus),

    #[error("task {0} has no live assignee")]
    TaskUnassigned(TaskId),

    #[error("slave {0} is closing")]
    SlaveClosed(SlaveKey),

    #[error("cannot determine local network address: {0}")]
    Address(#[source] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type MasterResult<T> = Result<T, MasterError>;
