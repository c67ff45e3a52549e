use cid::Cid;

use crate::peer_task_queue::Task;

/// Extra data associated with each task in the request queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskData {
    /// Tasks can be either want-have or want-block.
    pub is_want_block: bool,
    /// Whether to immediately send a response if the block is not found.
    pub send_dont_have: bool,
    /// The size of the block corresponding to the task.
    pub block_size: usize,
    /// Whether the block was found.
    pub have_block: bool,
}

pub type EngineTask = Task<Cid, TaskData>;

/// Merges want-have and want-block tasks for the same cid.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskMerger;

impl crate::peer_task_queue::TaskMerger<Cid, TaskData> for TaskMerger {
    fn has_new_info(&self, task: &EngineTask, existing: &[EngineTask]) -> bool {
        let have_size = existing.iter().any(|e| e.data.have_block);
        let is_want_block = existing.iter().any(|e| e.data.is_want_block);

        // If there is no active want-block and the new task is a want-block
        // the new task is better.
        if !is_want_block && task.data.is_want_block {
            return true;
        }

        // If there is no size information for the Cid and the new task has size
        // information, the new task is better.
        !have_size && task.data.have_block
    }

    fn merge(&self, task: &EngineTask, existing: &mut EngineTask) {
        *existing = merge(task, existing);
    }
}

/// Folds `new` into the pending task `existing`, returning the merged task.
///
/// Priority is handled by the queue, only work and data change here.
pub fn merge(new: &EngineTask, existing: &EngineTask) -> EngineTask {
    let mut merged = existing.clone();
    let data = &mut merged.data;

    // If we now have block size information, update the task with the new block size.
    if !data.have_block && new.data.have_block {
        data.have_block = true;
        data.block_size = new.data.block_size;
    }

    // If replacing a want-have with a want-block
    if !data.is_want_block && new.data.is_want_block {
        data.is_want_block = true;
        // If the want-have was a DONT_HAVE, or the want-block has a size
        if !existing.data.have_block || new.data.have_block {
            data.have_block = new.data.have_block;
            merged.work = new.work;
        }
    }

    // A want-block for a block we have sends the whole block.
    if data.is_want_block && data.have_block {
        merged.work = data.block_size;
    }

    merged
}

#[cfg(test)]
mod tests {
    use libp2p_identity::PeerId;

    use super::*;
    use crate::block::tests::create_random_block_v1;
    use crate::peer_task_queue::{Config, PeerTaskQueue, TaskMerger as _};

    fn task(cid: Cid, is_want_block: bool, have_block: bool, block_size: usize) -> EngineTask {
        let work = if is_want_block && have_block {
            block_size
        } else {
            1
        };
        Task {
            topic: cid,
            priority: 10,
            work,
            data: TaskData {
                is_want_block,
                send_dont_have: true,
                block_size,
                have_block,
            },
        }
    }

    #[test]
    fn test_merge_have_then_block() {
        let cid = *create_random_block_v1().cid();
        let have = task(cid, false, true, 100);
        let block = task(cid, true, true, 100);

        let merged = merge(&block, &have);
        assert!(merged.data.is_want_block);
        assert!(merged.data.have_block);
        assert_eq!(merged.work, 100);
    }

    #[test]
    fn test_merge_block_then_have() {
        let cid = *create_random_block_v1().cid();
        let block = task(cid, true, true, 100);
        let have = task(cid, false, true, 100);

        let merged = merge(&have, &block);
        assert_eq!(merged, block);
    }

    #[test]
    fn test_merge_dont_have_then_have() {
        let cid = *create_random_block_v1().cid();
        let dont_have = task(cid, false, false, 0);
        let have = task(cid, false, true, 100);

        let merged = merge(&have, &dont_have);
        assert!(merged.data.have_block);
        assert!(!merged.data.is_want_block);
        assert_eq!(merged.data.block_size, 100);
    }

    #[test]
    fn test_merge_dont_have_then_block() {
        let cid = *create_random_block_v1().cid();
        let dont_have = task(cid, true, false, 0);
        let block = task(cid, true, true, 50);

        let merged = merge(&block, &dont_have);
        assert!(merged.data.have_block);
        assert_eq!(merged.work, 50);
    }

    #[test]
    fn test_has_new_info() {
        let cid = *create_random_block_v1().cid();
        let merger = TaskMerger;

        let active_have = [task(cid, false, true, 10)];
        assert!(merger.has_new_info(&task(cid, true, true, 10), &active_have));
        assert!(!merger.has_new_info(&task(cid, false, true, 10), &active_have));

        let active_dont_have = [task(cid, false, false, 0)];
        assert!(merger.has_new_info(&task(cid, false, true, 10), &active_dont_have));

        let active_block = [task(cid, true, true, 10)];
        assert!(!merger.has_new_info(&task(cid, true, true, 10), &active_block));
    }

    #[test]
    fn test_queue_merges_pending() {
        let ptq = PeerTaskQueue::new(TaskMerger, Config::default());
        let peer = PeerId::random();
        let cid = *create_random_block_v1().cid();

        ptq.push_tasks(peer, vec![task(cid, false, true, 1000)]);
        ptq.push_tasks(peer, vec![task(cid, true, true, 1000)]);

        let (_, tasks, _) = ptq.pop_tasks(10_000);
        assert_eq!(tasks.len(), 1);
        assert!(tasks[0].data.is_want_block);
        assert_eq!(tasks[0].work, 1000);

        // a want-have adds nothing over the active want-block
        ptq.push_tasks(peer, vec![task(cid, false, true, 1000)]);
        assert_eq!(ptq.stats().num_pending, 0);
    }
}
