use std::{cmp::Ordering, time::Instant};

use ahash::AHashMap;
use keyed_priority_queue::{Entry, KeyedPriorityQueue};
use libp2p_identity::PeerId;

use super::{peer_task::QueueTask, Data, Task, TaskMerger, Topic};

/// Tracks the pending and active tasks of a single peer.
#[derive(Debug)]
pub struct PeerTracker<T: Topic, D: Data, TM: TaskMerger<T, D>> {
    target: PeerId,
    /// Pending tasks, at most one per topic.
    pending_tasks: KeyedPriorityQueue<T, QueueTask<T, D>>,
    active_tasks: AHashMap<T, Vec<Task<T, D>>>,
    active_work: usize,
    max_active_work_per_peer: usize,
    freeze_val: isize,
    next_seq: u64,
    task_merger: TM,
}

impl<T: Topic, D: Data, TM: TaskMerger<T, D>> PeerTracker<T, D, TM> {
    pub fn new(target: PeerId, task_merger: TM, max_active_work_per_peer: usize) -> Self {
        PeerTracker {
            target,
            pending_tasks: Default::default(),
            active_tasks: Default::default(),
            active_work: 0,
            max_active_work_per_peer,
            freeze_val: 0,
            next_seq: 0,
            task_merger,
        }
    }

    pub fn target(&self) -> &PeerId {
        &self.target
    }

    /// Returns true if the peer has no active or queued tasks.
    pub fn is_idle(&self) -> bool {
        self.pending_tasks.is_empty() && self.active_tasks.is_empty()
    }

    pub fn stats(&self) -> Stats {
        Stats {
            num_pending: self.pending_tasks.len(),
            num_active: self.active_tasks.values().map(Vec::len).sum(),
        }
    }

    /// The key this tracker is ordered by in the global queue.
    pub fn priority(&self) -> PeerPriority {
        PeerPriority {
            num_pending: self.pending_tasks.len(),
            freeze_val: self.freeze_val,
            active_work: self.active_work,
        }
    }

    pub fn topics(&self) -> Topics<T> {
        let mut pending: Vec<_> = self
            .pending_tasks
            .iter()
            .map(|(_, qt)| qt.task.topic.clone())
            .collect();
        pending.sort();
        let mut active: Vec<_> = self
            .active_tasks
            .values()
            .flat_map(|t| t.iter().map(|t| t.topic.clone()))
            .collect();
        active.sort();
        Topics { pending, active }
    }

    pub fn push_tasks(&mut self, tasks: Vec<Task<T, D>>) {
        let now = Instant::now();
        for task in tasks {
            // If the new task doesn't add any more information over what we already
            // have in the active queue, then skip it.
            if !self.task_has_more_info_than_active_tasks(&task) {
                continue;
            }

            // if there is already a non-active task with this topic
            if let Entry::Occupied(existing_task_entry) =
                self.pending_tasks.entry(task.topic.clone())
            {
                let (key, mut existing_task) = existing_task_entry.remove();
                if task.priority > existing_task.task.priority {
                    existing_task.task.priority = task.priority;
                }
                self.task_merger.merge(&task, &mut existing_task.task);
                self.pending_tasks.push(key, existing_task);

                // A task with the topic exists, so no need to add a new task
                // to the queue.
                continue;
            }

            let topic = task.topic.clone();
            let qtask = QueueTask::new(task, now, self.next_seq);
            self.next_seq += 1;
            self.pending_tasks.push(topic, qtask);
        }
    }

    /// Pops off as many tasks as necessary to cover `target_min_work`, in priority order.
    /// If there are not enough tasks to cover `target_min_work`, it just returns everything
    /// available.
    pub fn pop_tasks(&mut self, target_min_work: usize) -> Vec<Task<T, D>> {
        let mut out = Vec::new();
        let mut work = 0;

        while !self.pending_tasks.is_empty() && self.freeze_val == 0 && work < target_min_work {
            // do not add work to a peer that is already maxed out
            if self.max_active_work_per_peer > 0
                && self.active_work >= self.max_active_work_per_peer
            {
                break;
            }

            if let Some((_, qtask)) = self.pending_tasks.pop() {
                let task = qtask.task;
                self.start_task(task.clone());
                work += task.work;
                out.push(task);
            }
        }

        out
    }

    fn start_task(&mut self, task: Task<T, D>) {
        self.active_work += task.work;
        self.active_tasks
            .entry(task.topic.clone())
            .or_default()
            .push(task);
    }

    pub fn get_pending_work(&self) -> usize {
        self.pending_tasks.iter().map(|(_, qt)| qt.task.work).sum()
    }

    /// Signals that the given task was completed for this peer.
    pub fn task_done(&mut self, task: &Task<T, D>) {
        let Some(active_tasks) = self.active_tasks.get_mut(&task.topic) else {
            return;
        };

        // only one instance is released, identical tasks may be active more than once
        if let Some(pos) = active_tasks.iter().position(|at| at == task) {
            let done = active_tasks.remove(pos);
            self.active_work = self.active_work.saturating_sub(done.work);
        }
        if active_tasks.is_empty() {
            self.active_tasks.remove(&task.topic);
        }
    }

    /// Removes the pending task for `topic`. Returns true if there was one.
    pub fn remove(&mut self, topic: &T) -> bool {
        self.pending_tasks.remove(topic).is_some()
    }

    pub fn freeze(&mut self) {
        self.freeze_val += 1;
    }

    /// Halves the freeze value for this peer. While a peer is frozen
    /// it will not execute any tasks. Returns true once fully thawed.
    pub fn thaw(&mut self) -> bool {
        self.freeze_val -= (self.freeze_val + 1) / 2;
        self.freeze_val <= 0
    }

    /// Completely unfreezes this peer so it can execute tasks.
    pub fn full_thaw(&mut self) {
        self.freeze_val = 0;
    }

    /// Returns whether this peer is frozen and unable to execute tasks.
    pub fn is_frozen(&self) -> bool {
        self.freeze_val > 0
    }

    fn task_has_more_info_than_active_tasks(&self, task: &Task<T, D>) -> bool {
        match self.active_tasks.get(&task.topic) {
            Some(tasks_with_topic) if !tasks_with_topic.is_empty() => {
                self.task_merger.has_new_info(task, tasks_with_topic)
            }
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub num_pending: usize,
    pub num_active: usize,
}

#[derive(Debug)]
pub struct Topics<T: Topic> {
    pub pending: Vec<T>,
    pub active: Vec<T>,
}

/// Snapshot of a tracker's scheduling state, ordered so that the peer to serve next is
/// the greatest.
#[derive(Debug, Clone, Copy)]
pub struct PeerPriority {
    num_pending: usize,
    freeze_val: isize,
    active_work: usize,
}

impl PartialEq for PeerPriority {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PeerPriority {}

impl PartialOrd for PeerPriority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PeerPriority {
    fn cmp(&self, other: &Self) -> Ordering {
        // having no pending tasks means lowest priority
        match (self.num_pending == 0, other.num_pending == 0) {
            (true, true) => return Ordering::Equal,
            (true, false) => return Ordering::Less,
            (false, true) => return Ordering::Greater,
            (false, false) => {}
        }

        // frozen peers have lowest priority
        match other.freeze_val.cmp(&self.freeze_val) {
            Ordering::Equal => {}
            ord => return ord,
        }

        // If each peer has an equal amount of work in its active queue, choose
        // the peer with most amount of work pending.
        if self.active_work == other.active_work {
            return self.num_pending.cmp(&other.num_pending);
        }

        // Choose the peer with the least amount of work in its active queue.
        // This way we "keep peers busy" by sending them as much data as they can process.
        other.active_work.cmp(&self.active_work)
    }
}
