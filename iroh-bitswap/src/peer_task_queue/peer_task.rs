use std::{cmp::Ordering, fmt::Debug, time::Instant};

use super::{Data, Topic};

/// A single unit of work, scheduled for one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task<T: Topic, D: Data> {
    /// What this task is about, at most one pending task per topic and peer exists.
    pub topic: T,
    /// Higher runs first.
    pub priority: isize,
    /// Cost of the task, compared against the work targets when popping.
    pub work: usize,
    pub data: D,
}

/// Decides how tasks with the same topic are combined.
pub trait TaskMerger<T: Topic, D: Data>: Debug + Send + Sync + 'static {
    /// Returns true if `task` carries information that none of `existing` active tasks
    /// carry. Tasks without new information are dropped on push.
    fn has_new_info(&self, task: &Task<T, D>, existing: &[Task<T, D>]) -> bool;

    /// Folds the new `task` into the pending `existing` task.
    fn merge(&self, task: &Task<T, D>, existing: &mut Task<T, D>);
}

/// Drops any task whose topic is already active, and keeps pending tasks unchanged.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DefaultTaskMerger;

impl<T: Topic, D: Data> TaskMerger<T, D> for DefaultTaskMerger {
    fn has_new_info(&self, _task: &Task<T, D>, _existing: &[Task<T, D>]) -> bool {
        false
    }

    fn merge(&self, _task: &Task<T, D>, _existing: &mut Task<T, D>) {}
}

/// A task waiting in a peer's pending queue.
#[derive(Debug, Clone)]
pub(crate) struct QueueTask<T: Topic, D: Data> {
    pub task: Task<T, D>,
    pub created: Instant,
    /// Insertion sequence, orders tasks created within the same clock tick.
    pub seq: u64,
}

impl<T: Topic, D: Data> QueueTask<T, D> {
    pub fn new(task: Task<T, D>, created: Instant, seq: u64) -> Self {
        QueueTask {
            task,
            created,
            seq,
        }
    }
}

impl<T: Topic, D: Data> PartialEq for QueueTask<T, D> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T: Topic, D: Data> Eq for QueueTask<T, D> {}

impl<T: Topic, D: Data> PartialOrd for QueueTask<T, D> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: Topic, D: Data> Ord for QueueTask<T, D> {
    /// Greater pops first: higher priority, then the older task.
    fn cmp(&self, other: &Self) -> Ordering {
        self.task
            .priority
            .cmp(&other.task.priority)
            .then_with(|| other.created.cmp(&self.created))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
