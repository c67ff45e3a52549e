use std::{
    fmt::{self, Debug},
    sync::{Arc, Mutex},
    time::Duration,
};

use ahash::{AHashMap, AHashSet};
use cid::Cid;
use libp2p_identity::PeerId;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{
    blockstore_manager::BlockstoreManager,
    ledger::{Ledger, PeerLedger},
    task_merger::{EngineTask, TaskData, TaskMerger},
};
use crate::{
    block::Block,
    message::{BitswapMessage, BlockPresence, BlockPresenceType, Entry, WantType},
    metrics::Metrics,
    peer_task_queue::{self, PeerTaskQueue, Task},
    store::Store,
    wantlist,
};

/// Used to accept or deny requests for a cid coming from a peer.
///
/// Returns true if the request should be fulfilled.
#[derive(Clone)]
pub struct PeerBlockRequestFilter(Arc<dyn Fn(&PeerId, &Cid) -> bool + Send + Sync + 'static>);

impl PeerBlockRequestFilter {
    pub fn new(f: impl Fn(&PeerId, &Cid) -> bool + Send + Sync + 'static) -> Self {
        PeerBlockRequestFilter(Arc::new(f))
    }

    fn allows(&self, peer: &PeerId, cid: &Cid) -> bool {
        (self.0)(peer, cid)
    }
}

impl Debug for PeerBlockRequestFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PeerBlockRequestFilter")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(skip)]
    pub peer_block_request_filter: Option<PeerBlockRequestFilter>,
    /// Indicates what to do when the engine receives a want for a block that is not in the
    /// blockstore: send a DONT_HAVE if the requester asked for one, or stay silent.
    pub send_dont_haves: bool,
    /// Maximum number of concurrent blockstore reads when building a message.
    pub blockstore_worker_count: usize,
    /// Work popped off the queue per outgoing message.
    pub target_message_size: usize,
    /// Approximately how much work we are willing to have outstanding to a peer at any
    /// given time. Setting it to 0 disables limiting.
    pub max_outstanding_bytes_per_peer: usize,
    /// The maximum size of a block, in bytes, up to which a want-have is answered with
    /// the block itself.
    pub max_replace_size: usize,
    /// Do not freeze peers that cancel their wants.
    pub ignore_freezing: bool,
    /// How often frozen peers are thawed.
    #[serde(with = "humantime_serde")]
    pub thaw_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            peer_block_request_filter: None,
            send_dont_haves: true,
            blockstore_worker_count: 128,
            target_message_size: 16 * 1024,
            max_outstanding_bytes_per_peer: 1 << 20,
            max_replace_size: 1024,
            ignore_freezing: false,
            thaw_interval: Duration::from_millis(100),
        }
    }
}

/// Contains a message for a specific peer, and the tasks it completes.
#[derive(Debug)]
pub struct Envelope {
    pub peer: PeerId,
    pub message: BitswapMessage,
    pub sent_tasks: Vec<EngineTask>,
}

/// Decides what to send to whom, based on the wantlists of connected peers.
#[derive(Debug)]
pub struct Engine {
    /// Priority queue of requests received from peers.
    peer_task_queue: PeerTaskQueue<Cid, TaskData, TaskMerger>,
    blockstore_manager: BlockstoreManager,
    ledger_map: Mutex<AHashMap<PeerId, Ledger>>,
    /// Tracks which peers are waiting for a Cid.
    peer_ledger: Mutex<PeerLedger>,
    work_signal: Notify,
    target_message_size: usize,
    max_block_size_replace_has_with_block: usize,
    send_dont_haves: bool,
    peer_block_request_filter: Option<PeerBlockRequestFilter>,
    metrics: Arc<Metrics>,
}

impl Engine {
    pub fn new(store: Arc<dyn Store>, config: Config, metrics: Arc<Metrics>) -> Self {
        let log_hook: peer_task_queue::Hook =
            Arc::new(|peer: &PeerId, event: peer_task_queue::Event| {
                trace!(%peer, ?event, "task queue");
            });
        let peer_task_queue = PeerTaskQueue::with_hooks(
            TaskMerger,
            peer_task_queue::Config {
                ignore_freezing: config.ignore_freezing,
                max_active_work_per_peer: config.max_outstanding_bytes_per_peer,
            },
            vec![log_hook],
        );

        Engine {
            peer_task_queue,
            blockstore_manager: BlockstoreManager::new(store, config.blockstore_worker_count),
            ledger_map: Default::default(),
            peer_ledger: Default::default(),
            work_signal: Notify::new(),
            target_message_size: config.target_message_size,
            max_block_size_replace_has_with_block: config.max_replace_size,
            send_dont_haves: config.send_dont_haves,
            peer_block_request_filter: config.peer_block_request_filter,
            metrics,
        }
    }

    pub fn peer_task_queue(&self) -> &PeerTaskQueue<Cid, TaskData, TaskMerger> {
        &self.peer_task_queue
    }

    /// Returns a list of peers with whom the local node has active sessions.
    pub fn peers(&self) -> Vec<PeerId> {
        self.ledger_map
            .lock()
            .expect("poisoned")
            .keys()
            .copied()
            .collect()
    }

    /// The wantlist of the given peer, as far as we know it.
    pub fn wantlist_for_peer(&self, peer: &PeerId) -> Vec<wantlist::Entry> {
        let ledger_map = self.ledger_map.lock().expect("poisoned");
        let Some(ledger) = ledger_map.get(peer) else {
            return Vec::new();
        };
        let mut entries: Vec<_> = ledger.entries().cloned().collect();
        entries.sort_by(|a, b| b.priority.cmp(&a.priority));
        entries
    }

    /// Called when a message is received from a remote peer.
    ///
    /// For each item in the wantlist, add a want-have or want-block entry to the request
    /// queue, which is later popped off by the task workers.
    pub async fn message_received(&self, peer: &PeerId, message: &BitswapMessage) {
        // an empty full wantlist still replaces what the peer wanted before
        if message.is_empty() && !message.full() {
            debug!(%peer, "received empty message");
            return;
        }

        let (wants, cancels, denials) = self.split_wants(peer, message.wantlist());
        self.metrics.wants_received.inc_by(wants.len() as u64);
        self.metrics.cancels_received.inc_by(cancels.len() as u64);

        // get block sizes
        let want_ks: AHashSet<Cid> = wants.iter().map(|e| e.cid).collect();
        let want_ks_list: Vec<Cid> = want_ks.iter().copied().collect();
        let block_sizes = match self.blockstore_manager.get_block_sizes(&want_ks_list).await {
            Ok(s) => s,
            Err(err) => {
                warn!(%peer, "failed to fetch block sizes: {:?}", err);
                return;
            }
        };

        let mut active_entries = Vec::new();
        {
            let mut ledger_map = self.ledger_map.lock().expect("poisoned");
            let ledger = ledger_map
                .entry(*peer)
                .or_insert_with(|| Ledger::new(*peer));
            let mut peer_ledger = self.peer_ledger.lock().expect("poisoned");

            // if the peer sent a full wantlist, drop everything it no longer lists
            if message.full() {
                for cid in ledger.clear_wantlist() {
                    if !want_ks.contains(&cid) {
                        trace!(%peer, %cid, "replaced by full wantlist");
                        peer_ledger.cancel_want(peer, &cid);
                        self.peer_task_queue.remove(&cid, *peer);
                    }
                }
            }
            for want in &wants {
                peer_ledger.wants(*peer, want.cid);
            }
            for cancel in &cancels {
                peer_ledger.cancel_want(peer, &cancel.cid);
            }
            drop(peer_ledger);

            for entry in &cancels {
                trace!(%peer, cid = %entry.cid, "cancel");
                ledger.cancel_want(&entry.cid);
                self.peer_task_queue.remove(&entry.cid, *peer);
            }

            // deny access to blocks
            for entry in &denials {
                trace!(%peer, cid = %entry.cid, "denied");
                if let Some(task) = self.dont_have_task(entry) {
                    active_entries.push(task);
                }
            }

            for entry in &wants {
                let cid = entry.cid;
                ledger.wants(cid, entry.priority, entry.want_type);

                match block_sizes.get(&cid) {
                    Some(block_size) => {
                        active_entries.push(self.have_task(entry, *block_size));
                    }
                    None => {
                        if let Some(task) = self.dont_have_task(entry) {
                            active_entries.push(task);
                        }
                    }
                }
            }
        }

        if !active_entries.is_empty() {
            trace!(%peer, tasks = active_entries.len(), "scheduling");
            self.peer_task_queue.push_tasks(*peer, active_entries);
            self.signal_new_work();
        }
    }

    /// Task for a want whose block we hold.
    fn have_task(&self, entry: &Entry, block_size: usize) -> EngineTask {
        let is_want_block = self.send_as_block(entry.want_type, block_size);
        let work = if is_want_block {
            block_size
        } else {
            BlockPresence::encoded_len_for_cid(entry.cid)
        };

        Task {
            topic: entry.cid,
            priority: entry.priority as isize,
            work,
            data: TaskData {
                is_want_block,
                send_dont_have: entry.send_dont_have,
                block_size,
                have_block: true,
            },
        }
    }

    /// Task answering a want we can't serve, if the peer asked for a DONT_HAVE.
    fn dont_have_task(&self, entry: &Entry) -> Option<EngineTask> {
        if !(self.send_dont_haves && entry.send_dont_have) {
            return None;
        }

        Some(Task {
            topic: entry.cid,
            priority: entry.priority as isize,
            work: BlockPresence::encoded_len_for_cid(entry.cid),
            data: TaskData {
                is_want_block: entry.want_type == WantType::Block,
                send_dont_have: entry.send_dont_have,
                block_size: 0,
                have_block: false,
            },
        })
    }

    /// Called when new blocks were added to the store, schedules them for every peer
    /// that wants them.
    pub fn notify_new_blocks(&self, blocks: &[Block]) {
        if blocks.is_empty() {
            return;
        }

        let mut work: AHashMap<PeerId, Vec<EngineTask>> = AHashMap::new();
        {
            let ledger_map = self.ledger_map.lock().expect("poisoned");
            let peer_ledger = self.peer_ledger.lock().expect("poisoned");

            for block in blocks {
                let cid = *block.cid();
                for peer in peer_ledger.peers(&cid) {
                    let Some(entry) = ledger_map.get(&peer).and_then(|l| l.wantlist_get(&cid))
                    else {
                        continue;
                    };
                    let entry = Entry {
                        cid,
                        priority: entry.priority,
                        want_type: entry.want_type,
                        cancel: false,
                        // we have it now, no DONT_HAVE will be needed
                        send_dont_have: false,
                    };
                    work.entry(peer)
                        .or_default()
                        .push(self.have_task(&entry, block.len()));
                }
            }
        }

        if work.is_empty() {
            return;
        }
        for (peer, tasks) in work {
            trace!(%peer, tasks = tasks.len(), "new blocks wanted");
            self.peer_task_queue.push_tasks(peer, tasks);
        }
        self.signal_new_work();
    }

    /// Called after a message was sent to a peer, prunes what was delivered from its
    /// wantlist.
    pub fn message_sent(&self, peer: &PeerId, message: &BitswapMessage) {
        let mut ledger_map = self.ledger_map.lock().expect("poisoned");
        let Some(ledger) = ledger_map.get_mut(peer) else {
            return;
        };
        let mut peer_ledger = self.peer_ledger.lock().expect("poisoned");

        // remove sent blocks from the want list for the peer
        for block in message.blocks() {
            self.metrics.blocks_sent.inc();
            self.metrics.data_sent.inc_by(block.len() as u64);
            if ledger
                .wantlist_mut()
                .remove_type(block.cid(), WantType::Block)
                .is_some()
            {
                peer_ledger.cancel_want(peer, block.cid());
            }
        }

        // remove sent block presences from the wantlist for the peer
        for bp in message.block_presences() {
            match bp.typ {
                BlockPresenceType::Have => {
                    self.metrics.haves_sent.inc();
                    if ledger
                        .wantlist_mut()
                        .remove_type(&bp.cid, WantType::Have)
                        .is_some()
                    {
                        peer_ledger.cancel_want(peer, &bp.cid);
                    }
                }
                BlockPresenceType::DontHave => {
                    self.metrics.dont_haves_sent.inc();
                }
            }
        }
    }

    fn split_wants<'a>(
        &self,
        peer: &PeerId,
        entries: impl Iterator<Item = &'a Entry>,
    ) -> (Vec<&'a Entry>, Vec<&'a Entry>, Vec<&'a Entry>) {
        let mut wants = Vec::new();
        let mut cancels = Vec::new();
        let mut denials = Vec::new();

        for entry in entries {
            if entry.cancel {
                cancels.push(entry);
            } else if let Some(ref filter) = self.peer_block_request_filter {
                if filter.allows(peer, &entry.cid) {
                    wants.push(entry);
                } else {
                    denials.push(entry);
                }
            } else {
                wants.push(entry);
            }
        }

        (wants, cancels, denials)
    }

    /// Called when a new peer connects, which means we will start sending blocks to this peer.
    pub fn peer_connected(&self, peer: &PeerId) {
        self.ledger_map
            .lock()
            .expect("poisoned")
            .entry(*peer)
            .or_insert_with(|| Ledger::new(*peer));
    }

    /// Called when a peer is disconnected.
    pub fn peer_disconnected(&self, peer: &PeerId) {
        let removed = self.ledger_map.lock().expect("poisoned").remove(peer);
        if let Some(ledger) = removed {
            let mut peer_ledger = self.peer_ledger.lock().expect("poisoned");
            for want in ledger.entries() {
                peer_ledger.cancel_want(peer, &want.cid);
            }
        }
    }

    fn signal_new_work(&self) {
        self.work_signal.notify_waiters();
    }

    /// Thaws frozen peers by one step, and wakes workers in case work got unblocked.
    pub fn thaw_round(&self) {
        self.peer_task_queue.thaw_round();
        self.signal_new_work();
    }

    /// Marks the tasks of an envelope as done, freeing up capacity for the peer.
    pub fn tasks_done(&self, peer: PeerId, tasks: &[EngineTask]) {
        self.peer_task_queue.tasks_done(peer, tasks);
        self.signal_new_work();
    }

    fn send_as_block(&self, want_type: WantType, block_size: usize) -> bool {
        want_type == WantType::Block || block_size <= self.max_block_size_replace_has_with_block
    }

    /// Waits for work and builds the next message to send.
    ///
    /// Returns `None` once `cancel` fires.
    pub async fn next_envelope(&self, cancel: &CancellationToken) -> Option<Envelope> {
        loop {
            // register before popping, so a push in between is not missed
            let notified = self.work_signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            // pop some tasks off the request queue
            let (peer, next_tasks, pending_bytes) =
                self.peer_task_queue.pop_tasks(self.target_message_size);

            let peer = match peer {
                Some(peer) if !next_tasks.is_empty() => peer,
                _ => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return None,
                        _ = &mut notified => continue,
                    }
                }
            };

            let mut msg = BitswapMessage::new(false);
            msg.set_pending_bytes(pending_bytes.try_into().unwrap_or(i32::MAX));

            // split out want-blocks, want-haves and DONT_HAVEs
            let mut block_cids = Vec::new();
            let mut block_tasks = Vec::new();

            for task in &next_tasks {
                if task.data.have_block {
                    if task.data.is_want_block {
                        block_cids.push(task.topic);
                        block_tasks.push(task);
                    } else {
                        // add HAVEs to the message
                        msg.add_have(task.topic);
                    }
                } else {
                    // add DONT_HAVEs to the message
                    msg.add_dont_have(task.topic);
                }
            }

            let mut blocks = match self.blockstore_manager.get_blocks(&block_cids).await {
                Ok(blocks) => blocks,
                Err(err) => {
                    warn!(%peer, "failed to load blocks: {:?}", err);
                    self.tasks_done(peer, &next_tasks);
                    continue;
                }
            };

            for task in block_tasks {
                if let Some(block) = blocks.remove(&task.topic) {
                    msg.add_block(block);
                } else if task.data.send_dont_have {
                    // block was removed from the store in the meantime
                    msg.add_dont_have(task.topic);
                }
            }

            // nothing to see here
            if msg.is_empty() {
                self.tasks_done(peer, &next_tasks);
                continue;
            }

            return Some(Envelope {
                peer,
                message: msg,
                sent_tasks: next_tasks,
            });
        }
    }
}
