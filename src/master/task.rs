//! # Task Table
//!
//! The master's table of every task it knows about, keyed by id. The table is
//! owned by the [`Master`](crate::master::Master) and shared by handle; there
//! is no process-wide task state.
//!
//! A task moves through:
//!
//! ```text
//! Pending ──assign──▶ Assigned ──result──▶ Completed ──drain──▶ (removed)
//!    ▲                   │  │
//!    └──reject / orphan──┘  └──status=failed──▶ Failed ──drain──▶ (removed)
//! ```
//!
//! Completion and failure fire the task's completion signal, which anyone
//! holding the task can wait on.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::common::messages::{TaskId, TaskStatus};
use crate::master::slave::SlaveKey;

/// A unit of work as seen by the master.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub payload: Vec<u8>,
    pub load: u64,
    pub status: TaskStatus,
    pub assigned_to: Option<SlaveKey>,
    pub result: Option<Vec<u8>>,
    completion: CancellationToken,
}

impl Task {
    pub fn new(id: TaskId, payload: Vec<u8>, load: u64) -> Self {
        Self {
            id,
            payload,
            load,
            status: TaskStatus::Pending,
            assigned_to: None,
            result: None,
            completion: CancellationToken::new(),
        }
    }

    /// Whether the completion signal has fired.
    pub fn is_done(&self) -> bool {
        self.completion.is_cancelled()
    }

    /// Handle on the completion signal; `cancelled().await` waits for it.
    pub fn completion(&self) -> CancellationToken {
        self.completion.clone()
    }

    pub fn view(&self) -> TaskView {
        TaskView {
            id: self.id,
            load: self.load,
            status: self.status,
            assigned_to: self.assigned_to,
            result: self.result.as_ref().map(|r| STANDARD.encode(r)),
        }
    }
}

/// Serializable summary of a task. `result` is base64.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskView {
    pub id: TaskId,
    pub load: u64,
    pub status: TaskStatus,
    pub assigned_to: Option<SlaveKey>,
    pub result: Option<String>,
}

#[derive(Debug, Default)]
pub struct TaskTable {
    tasks: RwLock<HashMap<TaskId, Task>>,
    last_id: AtomicU64,
}

impl TaskTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new `Pending` task under the next id.
    pub async fn create(&self, payload: Vec<u8>, load: u64) -> Task {
        let id = self.last_id.fetch_add(1, Ordering::Relaxed) + 1;
        let task = Task::new(id, payload, load);
        self.tasks.write().await.insert(id, task.clone());
        task
    }

    pub async fn get(&self, id: TaskId) -> Option<Task> {
        self.tasks.read().await.get(&id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }

    pub async fn views(&self) -> Vec<TaskView> {
        let mut views: Vec<TaskView> = self.tasks.read().await.values().map(Task::view).collect();
        views.sort_by_key(|v| v.id);
        views
    }

    /// `Pending` → `Assigned` to `slave`. Returns `false` for any other state.
    pub async fn mark_assigned(&self, id: TaskId, slave: SlaveKey) -> bool {
        let mut tasks = self.tasks.write().await;
        match tasks.get_mut(&id) {
            Some(task) if task.status == TaskStatus::Pending => {
                task.status = TaskStatus::Assigned;
                task.assigned_to = Some(slave);
                true
            }
            _ => false,
        }
    }

    /// `Assigned` to `slave` → `Pending`.
    pub async fn unassign(&self, id: TaskId, slave: SlaveKey) -> bool {
        let mut tasks = self.tasks.write().await;
        match tasks.get_mut(&id) {
            Some(task)
                if task.status == TaskStatus::Assigned && task.assigned_to == Some(slave) =>
            {
                task.status = TaskStatus::Pending;
                task.assigned_to = None;
                true
            }
            _ => false,
        }
    }

    /// Record a result and fire the completion signal.
    ///
    /// A task that already finished keeps its first outcome.
    pub async fn complete(&self, id: TaskId, result: Vec<u8>) -> Option<Task> {
        self.finish(id, TaskStatus::Completed, Some(result)).await
    }

    /// Mark a task failed and fire the completion signal.
    pub async fn fail(&self, id: TaskId) -> Option<Task> {
        self.finish(id, TaskStatus::Failed, None).await
    }

    async fn finish(&self, id: TaskId, status: TaskStatus, result: Option<Vec<u8>>) -> Option<Task> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(&id)?;
        if task.is_done() {
            return None;
        }
        task.status = status;
        task.assigned_to = None;
        task.result = result;
        task.completion.cancel();
        Some(task.clone())
    }

    /// Put an orphaned task back to `Pending` with a new load weight, keeping
    /// its id, payload and completion signal.
    pub async fn reset(&self, id: TaskId, load: u64) -> Option<Task> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(&id)?;
        if task.is_done() {
            return None;
        }
        task.status = TaskStatus::Pending;
        task.assigned_to = None;
        task.load = load;
        Some(task.clone())
    }

    pub async fn remove(&self, id: TaskId) -> Option<Task> {
        self.tasks.write().await.remove(&id)
    }

    /// Remove and return a task whose completion signal has fired.
    pub async fn drain(&self, id: TaskId) -> Option<Task> {
        let mut tasks = self.tasks.write().await;
        if tasks.get(&id).is_some_and(Task::is_done) {
            tasks.remove(&id)
        } else {
            None
        }
    }
}
