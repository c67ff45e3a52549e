//! Fair scheduling of work across peers.
//!
//! Based on <https://github.com/ipfs/go-peertaskqueue>.

use std::{
    fmt::{self, Debug},
    hash::Hash,
    sync::{Arc, Mutex},
};

use ahash::{AHashMap, AHashSet};
use keyed_priority_queue::KeyedPriorityQueue;
use libp2p_identity::PeerId;
use tracing::trace;

mod peer_task;
mod peer_tracker;

pub use self::peer_task::{DefaultTaskMerger, Task, TaskMerger};
pub use self::peer_tracker::{Stats as PeerStats, Topics};
use self::peer_tracker::{PeerPriority, PeerTracker};

pub trait Topic: Sized + Debug + Clone + Hash + Eq + Ord + Send + Sync + 'static {}
impl<T: Sized + Debug + Clone + Hash + Eq + Ord + Send + Sync + 'static> Topic for T {}

pub trait Data: Sized + Debug + Clone + PartialEq + Send + Sync + 'static {}
impl<D: Sized + Debug + Clone + PartialEq + Send + Sync + 'static> Data for D {}

#[derive(Debug, Clone)]
pub struct Config {
    /// Do not freeze peers when their pending tasks are cancelled.
    pub ignore_freezing: bool,
    /// Upper bound on the active work per peer, `0` means unbounded.
    pub max_active_work_per_peer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            ignore_freezing: false,
            max_active_work_per_peer: 1 << 20,
        }
    }
}

/// Peer lifecycle events reported to hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    PeerAdded,
    PeerRemoved,
}

/// Callback invoked on peer lifecycle events.
pub type Hook = Arc<dyn Fn(&PeerId, Event) + Send + Sync + 'static>;

/// Prioritised queue of tasks, grouped per peer.
///
/// Cloning is cheap, all clones share the same queue.
#[derive(Clone)]
pub struct PeerTaskQueue<T: Topic, D: Data, TM: TaskMerger<T, D> + Clone> {
    inner: Arc<Mutex<Inner<T, D, TM>>>,
    hooks: Arc<Vec<Hook>>,
}

#[derive(Debug)]
struct Inner<T: Topic, D: Data, TM: TaskMerger<T, D>> {
    peer_trackers: AHashMap<PeerId, PeerTracker<T, D, TM>>,
    pq: KeyedPriorityQueue<PeerId, PeerPriority>,
    /// Peers that are currently frozen.
    frozen_peers: AHashSet<PeerId>,
    task_merger: TM,
    config: Config,
}

impl<T: Topic, D: Data, TM: TaskMerger<T, D> + Clone> Debug for PeerTaskQueue<T, D, TM> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerTaskQueue")
            .field("inner", &self.inner)
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

/// Aggregated queue statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub num_peers: usize,
    pub num_active: usize,
    pub num_pending: usize,
}

impl<T: Topic, D: Data, TM: TaskMerger<T, D> + Clone> PeerTaskQueue<T, D, TM> {
    pub fn new(task_merger: TM, config: Config) -> Self {
        Self::with_hooks(task_merger, config, Vec::new())
    }

    /// Creates a queue that reports peer lifecycle changes to `hooks`.
    ///
    /// Hooks run while the queue lock is held and must not call back into the queue.
    pub fn with_hooks(task_merger: TM, config: Config, hooks: Vec<Hook>) -> Self {
        PeerTaskQueue {
            inner: Arc::new(Mutex::new(Inner {
                peer_trackers: Default::default(),
                pq: Default::default(),
                frozen_peers: Default::default(),
                task_merger,
                config,
            })),
            hooks: Arc::new(hooks),
        }
    }

    /// Adds new tasks to the queue for the given peer.
    pub fn push_tasks(&self, peer: PeerId, tasks: Vec<Task<T, D>>) {
        if tasks.is_empty() {
            return;
        }
        let inner = &mut *self.inner.lock().expect("poisoned");

        let tracker = match inner.peer_trackers.entry(peer) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(e) => {
                trace!(%peer, "tracking peer");
                for hook in self.hooks.iter() {
                    hook(&peer, Event::PeerAdded);
                }
                e.insert(PeerTracker::new(
                    peer,
                    inner.task_merger.clone(),
                    inner.config.max_active_work_per_peer,
                ))
            }
        };

        tracker.push_tasks(tasks);
        inner.pq.push(peer, tracker.priority());
    }

    /// Finds the peer with the highest priority and pops as many tasks off the peer's
    /// queue as necessary to cover `target_min_work`, in priority order.
    ///
    /// Returns the peer, the tasks and the amount of work left pending for that peer.
    pub fn pop_tasks(&self, target_min_work: usize) -> (Option<PeerId>, Vec<Task<T, D>>, usize) {
        let inner = &mut *self.inner.lock().expect("poisoned");

        let Some((peer, _)) = inner.pq.peek() else {
            return (None, Vec::new(), 0);
        };
        let peer = *peer;
        let Some(tracker) = inner.peer_trackers.get_mut(&peer) else {
            return (None, Vec::new(), 0);
        };

        let out = tracker.pop_tasks(target_min_work);
        let pending_work = tracker.get_pending_work();
        let priority = tracker.priority();
        let idle = tracker.is_idle();

        // Idle peers are dropped on `tasks_done`, the tasks just popped are active.
        debug_assert!(!idle || out.is_empty());
        if idle {
            inner.remove_peer(&peer, &self.hooks);
        } else {
            inner.pq.push(peer, priority);
        }

        (Some(peer), out, pending_work)
    }

    /// Signals that the given tasks are done for this peer, freeing up their work.
    pub fn tasks_done(&self, peer: PeerId, tasks: &[Task<T, D>]) {
        let inner = &mut *self.inner.lock().expect("poisoned");
        let Some(tracker) = inner.peer_trackers.get_mut(&peer) else {
            return;
        };

        for task in tasks {
            tracker.task_done(task);
        }

        if tracker.is_idle() {
            inner.remove_peer(&peer, &self.hooks);
        } else {
            let priority = tracker.priority();
            inner.pq.push(peer, priority);
        }
    }

    /// Removes the pending task with the given topic for this peer.
    ///
    /// A successful removal freezes the peer, unless freezing is disabled.
    pub fn remove(&self, topic: &T, peer: PeerId) {
        let inner = &mut *self.inner.lock().expect("poisoned");
        let Some(tracker) = inner.peer_trackers.get_mut(&peer) else {
            return;
        };

        if !tracker.remove(topic) {
            return;
        }

        if !inner.config.ignore_freezing {
            tracker.freeze();
            inner.frozen_peers.insert(peer);
        }

        let priority = tracker.priority();
        if tracker.is_idle() {
            inner.remove_peer(&peer, &self.hooks);
        } else {
            inner.pq.push(peer, priority);
        }
    }

    /// Unfreezes all frozen peers by one step.
    pub fn thaw_round(&self) {
        let inner = &mut *self.inner.lock().expect("poisoned");
        let frozen: Vec<PeerId> = inner.frozen_peers.iter().copied().collect();
        for peer in frozen {
            let Some(tracker) = inner.peer_trackers.get_mut(&peer) else {
                inner.frozen_peers.remove(&peer);
                continue;
            };
            if tracker.thaw() {
                inner.frozen_peers.remove(&peer);
            }
            let priority = tracker.priority();
            inner.pq.push(peer, priority);
        }
    }

    /// Completely thaws all peers in the queue so they can execute tasks.
    pub fn full_thaw(&self) {
        let inner = &mut *self.inner.lock().expect("poisoned");
        let frozen: Vec<PeerId> = inner.frozen_peers.drain().collect();
        for peer in frozen {
            if let Some(tracker) = inner.peer_trackers.get_mut(&peer) {
                tracker.full_thaw();
                let priority = tracker.priority();
                inner.pq.push(peer, priority);
            }
        }
    }

    pub fn stats(&self) -> Stats {
        let inner = &*self.inner.lock().expect("poisoned");
        let mut stats = Stats {
            num_peers: inner.peer_trackers.len(),
            ..Default::default()
        };
        for tracker in inner.peer_trackers.values() {
            let s = tracker.stats();
            stats.num_active += s.num_active;
            stats.num_pending += s.num_pending;
        }
        stats
    }

    /// Pending and active topics of the given peer.
    pub fn peer_topics(&self, peer: &PeerId) -> Option<Topics<T>> {
        let inner = &*self.inner.lock().expect("poisoned");
        inner.peer_trackers.get(peer).map(|t| t.topics())
    }

    pub fn peer_stats(&self, peer: &PeerId) -> Option<PeerStats> {
        let inner = &*self.inner.lock().expect("poisoned");
        inner.peer_trackers.get(peer).map(|t| t.stats())
    }
}

impl<T: Topic, D: Data, TM: TaskMerger<T, D>> Inner<T, D, TM> {
    fn remove_peer(&mut self, peer: &PeerId, hooks: &[Hook]) {
        self.peer_trackers.remove(peer);
        self.pq.remove(peer);
        self.frozen_peers.remove(peer);
        trace!(%peer, "untracking peer");
        for hook in hooks {
            hook(peer, Event::PeerRemoved);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn new_queue() -> PeerTaskQueue<usize, (), DefaultTaskMerger> {
        PeerTaskQueue::new(DefaultTaskMerger, Config::default())
    }

    fn task(topic: usize, priority: isize, work: usize) -> Task<usize, ()> {
        Task {
            topic,
            priority,
            work,
            data: (),
        }
    }

    #[test]
    fn test_push_pop() {
        let ptq = new_queue();
        let partner = PeerId::random();

        let mut tasks = Vec::new();
        for i in 0..10 {
            tasks.push(task(i, i as isize, 1));
        }
        ptq.push_tasks(partner, tasks);

        let mut popped = Vec::new();
        loop {
            let (peer, out, _) = ptq.pop_tasks(1);
            if out.is_empty() {
                break;
            }
            assert_eq!(peer, Some(partner));
            popped.extend(out.into_iter().map(|t| t.topic));
        }

        // highest priority first
        assert_eq!(popped, (0..10).rev().collect::<Vec<_>>());
    }

    #[test]
    fn test_empty_queue() {
        let ptq = new_queue();
        let (peer, tasks, pending) = ptq.pop_tasks(100);
        assert!(peer.is_none());
        assert!(tasks.is_empty());
        assert_eq!(pending, 0);
    }

    #[test]
    fn test_pending_work() {
        let ptq = new_queue();
        let partner = PeerId::random();
        ptq.push_tasks(partner, vec![task(1, 3, 10), task(2, 2, 20), task(3, 1, 30)]);

        let (peer, tasks, pending) = ptq.pop_tasks(10);
        assert_eq!(peer, Some(partner));
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].topic, 1);
        assert_eq!(pending, 50);
    }

    #[test]
    fn test_round_robin_by_active_work() {
        let ptq = new_queue();
        let peers = [PeerId::random(), PeerId::random(), PeerId::random()];

        for peer in &peers {
            ptq.push_tasks(*peer, (0..4).map(|i| task(i, 1, 1)).collect());
        }

        // every pop adds active work to a peer, the next pop prefers the others
        let mut seen = HashSet::new();
        for _ in 0..3 {
            let (peer, tasks, _) = ptq.pop_tasks(1);
            assert_eq!(tasks.len(), 1);
            seen.insert(peer.unwrap());
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn test_peer_repeats() {
        let ptq = new_queue();
        let a = PeerId::random();
        let b = PeerId::random();

        ptq.push_tasks(a, (0..5).map(|i| task(i, 1, 1)).collect());
        ptq.push_tasks(b, (0..5).map(|i| task(i, 1, 1)).collect());

        let (first, tasks_a, _) = ptq.pop_tasks(1);
        let (second, _, _) = ptq.pop_tasks(1);
        assert_ne!(first, second);

        // finishing work makes the first peer attractive again
        ptq.tasks_done(first.unwrap(), &tasks_a);
        let (third, _, _) = ptq.pop_tasks(1);
        assert_eq!(third, first);
    }

    #[test]
    fn test_remove_freezes_peer() {
        let ptq = new_queue();
        let a = PeerId::random();
        let b = PeerId::random();

        ptq.push_tasks(a, vec![task(1, 10, 1), task(2, 10, 1)]);
        ptq.push_tasks(b, vec![task(1, 1, 1)]);

        ptq.remove(&1, a);

        // a is frozen, b gets served even with fewer tasks
        let (peer, tasks, _) = ptq.pop_tasks(1);
        assert_eq!(peer, Some(b));
        assert_eq!(tasks.len(), 1);
        ptq.tasks_done(b, &tasks);

        // only frozen work left
        let (peer, tasks, _) = ptq.pop_tasks(1);
        assert_eq!(peer, Some(a));
        assert!(tasks.is_empty());

        ptq.thaw_round();
        let (peer, tasks, _) = ptq.pop_tasks(1);
        assert_eq!(peer, Some(a));
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].topic, 2);
    }

    #[test]
    fn test_remove_ignore_freezing() {
        let ptq = PeerTaskQueue::<usize, (), _>::new(
            DefaultTaskMerger,
            Config {
                ignore_freezing: true,
                ..Default::default()
            },
        );
        let a = PeerId::random();
        ptq.push_tasks(a, vec![task(1, 10, 1), task(2, 10, 1)]);
        ptq.remove(&1, a);

        let (peer, tasks, _) = ptq.pop_tasks(10);
        assert_eq!(peer, Some(a));
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].topic, 2);
    }

    #[test]
    fn test_full_thaw() {
        let ptq = new_queue();
        let a = PeerId::random();
        ptq.push_tasks(a, vec![task(1, 10, 1), task(2, 10, 1)]);

        ptq.remove(&1, a);
        ptq.remove(&3, a); // not pending, no extra freeze
        assert!(ptq.pop_tasks(1).1.is_empty());

        ptq.full_thaw();
        assert_eq!(ptq.pop_tasks(1).1.len(), 1);
    }

    #[test]
    fn test_remove_last_task_drops_peer() {
        let ptq = new_queue();
        let a = PeerId::random();
        ptq.push_tasks(a, vec![task(1, 10, 1)]);
        ptq.remove(&1, a);

        assert_eq!(ptq.stats(), Stats::default());
        assert!(ptq.peer_topics(&a).is_none());
    }

    #[test]
    fn test_tasks_done_evicts_idle() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let ev = events.clone();
        let hook: Hook = Arc::new(move |peer: &PeerId, event: Event| {
            ev.lock().unwrap().push((*peer, event));
        });
        let ptq = PeerTaskQueue::<usize, (), _>::with_hooks(
            DefaultTaskMerger,
            Config::default(),
            vec![hook],
        );
        let a = PeerId::random();

        ptq.push_tasks(a, vec![task(1, 1, 1), task(2, 1, 1)]);
        ptq.push_tasks(a, vec![task(3, 1, 1)]);
        assert_eq!(
            ptq.stats(),
            Stats {
                num_peers: 1,
                num_active: 0,
                num_pending: 3
            }
        );

        let (_, tasks, pending) = ptq.pop_tasks(100);
        assert_eq!(tasks.len(), 3);
        assert_eq!(pending, 0);
        assert_eq!(ptq.stats().num_active, 3);
        assert_eq!(ptq.peer_topics(&a).unwrap().active, vec![1, 2, 3]);

        ptq.tasks_done(a, &tasks[..1]);
        assert_eq!(ptq.stats().num_peers, 1);
        ptq.tasks_done(a, &tasks[1..]);
        assert_eq!(ptq.stats().num_peers, 0);

        assert_eq!(
            *events.lock().unwrap(),
            vec![(a, Event::PeerAdded), (a, Event::PeerRemoved)]
        );
    }

    #[test]
    fn test_merge_on_push() {
        let ptq = new_queue();
        let a = PeerId::random();

        ptq.push_tasks(a, vec![task(1, 1, 1), task(2, 5, 1)]);
        // raises the priority of the pending task
        ptq.push_tasks(a, vec![task(1, 10, 1)]);
        assert_eq!(ptq.stats().num_pending, 2);

        let (_, tasks, _) = ptq.pop_tasks(1);
        assert_eq!(tasks[0].topic, 1);
        assert_eq!(tasks[0].priority, 10);

        // already active, the default merger drops it
        ptq.push_tasks(a, vec![task(1, 10, 1)]);
        assert_eq!(ptq.stats().num_pending, 1);
    }
}
