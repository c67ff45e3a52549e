//! The requesting side of the protocol.
//!
//! Every fetch runs its own want loop: probe known peers with WANT-HAVE, ask peers that
//! answered HAVE for the block one at a time, and park until something changes.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicI32, Ordering},
        Arc, Mutex, Weak,
    },
    time::Duration,
};

use ahash::{AHashMap, AHashSet};
use cid::Cid;
use libp2p_identity::PeerId;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{mpsc, OwnedMutexGuard},
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    block::Block,
    error::{FetchError, SendError},
    message::{BitswapMessage, Priority, WantType},
    metrics::Metrics,
    network::{Network, ProviderDiscovery},
    store::Store,
    wantlist::Wantlist,
};

mod blocker;
mod provider_query_manager;

pub use self::{blocker::Blocker, provider_query_manager::ProviderQueryManager};

const FOUND_PROVIDERS_CAP: usize = 256;
/// Upper bound on outstanding `load_blocks` probes, the oldest is evicted beyond that.
const MAX_HINTS: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// How often a running fetch re-probes its peers and restarts provider discovery.
    #[serde(with = "humantime_serde")]
    pub provider_refresh_interval: Duration,
    pub provider_query_workers: usize,
    /// Stop a provider search after this many providers were found.
    pub max_providers_per_request: usize,
    #[serde(with = "humantime_serde")]
    pub provider_query_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            provider_refresh_interval: Duration::from_secs(10),
            provider_query_workers: 8,
            max_providers_per_request: 10,
            provider_query_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stat {
    pub wantlist: Vec<Cid>,
    pub peers: Vec<PeerId>,
    pub blocks_received: u64,
    pub data_received: u64,
    pub dup_blks_received: u64,
    pub dup_data_received: u64,
}

#[derive(Debug, Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    store: Arc<dyn Store>,
    network: Network,
    provider_query_manager: ProviderQueryManager,
    blocker: Blocker,
    state: Mutex<State>,
    /// Serializes fetches of the same cid.
    fetch_locks: Mutex<AHashMap<Cid, Arc<tokio::sync::Mutex<()>>>>,
    next_priority: AtomicI32,
    config: Config,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct State {
    /// Peers we probe for new wants.
    peers: AHashSet<PeerId>,
    wantlist: Wantlist,
    /// Running fetches, removed once the block arrived.
    wants: AHashMap<Cid, Want>,
    /// Probes sent by `load_blocks` for cids nobody is fetching yet.
    hints: AHashMap<Cid, Hint>,
    next_hint: u64,
}

#[derive(Debug)]
struct Hint {
    want: Want,
    seq: u64,
    created: Instant,
}

#[derive(Debug, Default)]
struct Want {
    priority: Priority,
    /// Peers that announced HAVE and were not asked for the block yet.
    matches: VecDeque<PeerId>,
    probed: AHashSet<PeerId>,
    asked: AHashSet<PeerId>,
}

impl Want {
    fn add_match(&mut self, peer: &PeerId) {
        if !self.asked.contains(peer) && !self.matches.contains(peer) {
            self.matches.push_back(*peer);
        }
    }

    fn remove_peer(&mut self, peer: &PeerId) {
        self.matches.retain(|p| p != peer);
    }
}

impl Client {
    pub fn new(
        store: Arc<dyn Store>,
        network: Network,
        discovery: Arc<dyn ProviderDiscovery>,
        config: Config,
        metrics: Arc<Metrics>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let (found_s, found_r) = mpsc::channel(FOUND_PROVIDERS_CAP);
        let provider_query_manager = ProviderQueryManager::new(
            discovery,
            &config,
            found_s,
            metrics.clone(),
            cancel.child_token(),
        );

        let inner = Arc::new(Inner {
            store,
            network,
            provider_query_manager,
            blocker: Blocker::new(),
            state: Default::default(),
            fetch_locks: Default::default(),
            next_priority: AtomicI32::new(i32::MAX),
            config,
            metrics,
            cancel: cancel.clone(),
        });
        let prune_interval = inner.config.provider_refresh_interval;
        tokio::spawn(background_loop(
            Arc::downgrade(&inner),
            found_r,
            prune_interval,
            cancel,
        ));

        Client { inner }
    }

    /// Fetches a block, from the local store if present, otherwise from the network.
    ///
    /// Concurrent calls for the same cid are serialized, so that at most one of them talks
    /// to the network. Provider discovery is only started up front for `is_root` blocks.
    pub async fn get_block(
        &self,
        cid: &Cid,
        is_root: bool,
        cancel: &CancellationToken,
    ) -> Result<Block, FetchError> {
        let _lock = self.lock_fetch(cid).await;

        if let Some(block) = self.inner.store.get(cid).await? {
            trace!(%cid, "found block locally");
            self.forget_hint(cid);
            return Ok(block);
        }
        if self.inner.cancel.is_cancelled() {
            return Err(FetchError::Closed);
        }
        if is_root {
            self.inner.provider_query_manager.find_providers(*cid);
        }

        let _want = WantGuard::new(self.clone(), *cid, self.next_priority());
        debug!(%cid, is_root, "fetching block");
        self.want_loop(cid, cancel).await
    }

    /// Like [`Client::get_block`], giving up after `timeout`.
    pub async fn fetch(&self, cid: &Cid, is_root: bool, timeout: Duration) -> Option<Block> {
        let cancel = CancellationToken::new();
        match tokio::time::timeout(timeout, self.get_block(cid, is_root, &cancel)).await {
            Ok(Ok(block)) => Some(block),
            Ok(Err(err)) => {
                debug!(%cid, "fetch failed: {err}");
                None
            }
            Err(_) => {
                debug!(%cid, "fetch timed out after {timeout:?}");
                None
            }
        }
    }

    async fn lock_fetch(&self, cid: &Cid) -> FetchGuard<'_> {
        let lock = self
            .inner
            .fetch_locks
            .lock()
            .expect("poisoned")
            .entry(*cid)
            .or_default()
            .clone();
        FetchGuard {
            locks: &self.inner.fetch_locks,
            cid: *cid,
            _guard: lock.lock_owned().await,
        }
    }

    fn next_priority(&self) -> Priority {
        // earlier fetches are served first
        self.inner
            .next_priority
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |p| {
                Some(p.saturating_sub(1).max(1))
            })
            .unwrap_or_else(|p| p)
    }

    async fn want_loop(&self, cid: &Cid, cancel: &CancellationToken) -> Result<Block, FetchError> {
        let inner = &self.inner;
        let notify = inner.blocker.get(cid);
        let period = inner.config.provider_refresh_interval;
        let mut refresh = tokio::time::interval_at(Instant::now() + period, period);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled(*cid));
            }
            if inner.cancel.is_cancelled() {
                return Err(FetchError::Closed);
            }

            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (priority, probes, ask) = {
                let state = &mut *inner.state.lock().expect("poisoned");
                let Some(want) = state.wants.get_mut(cid) else {
                    break;
                };
                let probes: Vec<PeerId> = state
                    .peers
                    .iter()
                    .filter(|peer| want.probed.insert(**peer))
                    .copied()
                    .collect();
                let mut ask = None;
                while let Some(peer) = want.matches.pop_front() {
                    if want.asked.insert(peer) {
                        ask = Some(peer);
                        break;
                    }
                }
                (want.priority, probes, ask)
            };

            for peer in probes {
                trace!(%cid, %peer, "sending want-have");
                self.send_want(peer, *cid, priority, WantType::Have);
            }
            if let Some(peer) = ask {
                debug!(%cid, %peer, "sending want-block");
                self.send_want(peer, *cid, priority, WantType::Block);
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FetchError::Cancelled(*cid)),
                _ = inner.cancel.cancelled() => return Err(FetchError::Closed),
                _ = &mut notified => {}
                _ = refresh.tick() => self.refresh(cid),
            }
        }

        match inner.store.get(cid).await? {
            Some(block) => Ok(block),
            None => Err(FetchError::Reset(*cid)),
        }
    }

    /// Retries a stalled fetch: all peers are probed and asked again.
    fn refresh(&self, cid: &Cid) {
        debug!(%cid, "refreshing want");
        if let Some(want) = self
            .inner
            .state
            .lock()
            .expect("poisoned")
            .wants
            .get_mut(cid)
        {
            want.probed.clear();
            want.asked.clear();
        }
        self.inner.provider_query_manager.find_providers(*cid);
    }

    fn send_want(&self, peer: PeerId, cid: Cid, priority: Priority, want_type: WantType) {
        let mut message = BitswapMessage::new(false);
        message.add_entry(cid, priority, want_type, true);
        self.send(peer, message);
    }

    fn send(&self, peer: PeerId, message: BitswapMessage) {
        self.record_sent(&message);
        let client = self.clone();
        tokio::spawn(async move {
            match client.inner.network.send_message(peer, &message).await {
                Ok(()) | Err(SendError::Closed) => {}
                Err(err) => {
                    debug!(%peer, "failed to send wants: {err}");
                    client.receive_connection_failure(&peer);
                }
            }
        });
    }

    fn record_sent(&self, message: &BitswapMessage) {
        let metrics = &self.inner.metrics;
        for entry in message.wantlist() {
            if entry.cancel {
                metrics.cancels_sent.inc();
            } else if entry.want_type == WantType::Have {
                metrics.want_haves_sent.inc();
            } else {
                metrics.want_blocks_sent.inc();
            }
        }
    }

    /// Handles the client relevant parts of a message.
    ///
    /// Returns the blocks that were wanted and have been stored.
    pub async fn receive_message(&self, peer: &PeerId, message: &BitswapMessage) -> Vec<Block> {
        let mut stored = Vec::new();
        for block in message.blocks() {
            if self.block_received(peer, block.clone()).await {
                stored.push(block.clone());
            }
        }

        let haves: Vec<Cid> = message.haves().copied().collect();
        if !haves.is_empty() {
            self.have_received(peer, &haves);
        }
        let dont_haves: Vec<Cid> = message.dont_haves().copied().collect();
        if !dont_haves.is_empty() {
            self.dont_have_received(peer, &dont_haves);
        }

        stored
    }

    /// Persists a wanted or prefetched block and wakes its fetch.
    ///
    /// Returns `false` for blocks nobody asked for, those are dropped.
    pub async fn block_received(&self, peer: &PeerId, block: Block) -> bool {
        let inner = &self.inner;
        let cid = *block.cid();
        let len = block.len() as u64;
        inner.metrics.blocks_received.inc();
        inner.metrics.data_received.inc_by(len);

        let wanted = {
            let state = inner.state.lock().expect("poisoned");
            state.wants.contains_key(&cid) || state.hints.contains_key(&cid)
        };
        if !wanted {
            trace!(%cid, %peer, "dropping unwanted block");
            inner.metrics.duplicate_blocks_received.inc();
            inner.metrics.duplicate_data_received.inc_by(len);
            return false;
        }
        if let Err(err) = inner.store.put(block).await {
            warn!(%cid, "failed to store block: {err:#}");
            return false;
        }

        debug!(%cid, %peer, len, "received block");
        self.complete(&cid, Some(peer));
        true
    }

    /// Blocks that were stored locally, resolves fetches waiting for them.
    pub fn notify_new_blocks(&self, blocks: &[Block]) {
        for block in blocks {
            self.complete(block.cid(), None);
        }
    }

    fn complete(&self, cid: &Cid, from: Option<&PeerId>) {
        let want = {
            let state = &mut *self.inner.state.lock().expect("poisoned");
            state.wantlist.remove(cid);
            let hint = state.hints.remove(cid).map(|hint| hint.want);
            state.wants.remove(cid).or(hint)
        };
        self.inner.blocker.wake(cid);

        if let Some(want) = want {
            self.send_cancels(cid, &want, from);
        }
    }

    /// Cancels `cid` with every known peer we sent a want to, except `skip`.
    fn send_cancels(&self, cid: &Cid, want: &Want, skip: Option<&PeerId>) {
        let peers: Vec<PeerId> = {
            let state = self.inner.state.lock().expect("poisoned");
            want.probed
                .union(&want.asked)
                .filter(|peer| Some(*peer) != skip && state.peers.contains(*peer))
                .copied()
                .collect()
        };
        for peer in peers {
            trace!(%cid, %peer, "sending cancel");
            let mut message = BitswapMessage::new(false);
            message.cancel(*cid);
            self.send(peer, message);
        }
    }

    /// `peer` announced that it has `cids`.
    pub fn have_received(&self, peer: &PeerId, cids: &[Cid]) {
        self.inner.metrics.haves_received.inc_by(cids.len() as u64);
        let mut woken = Vec::new();
        {
            let state = &mut *self.inner.state.lock().expect("poisoned");
            state.peers.insert(*peer);
            for cid in cids {
                if let Some(want) = state.wants.get_mut(cid) {
                    want.add_match(peer);
                    woken.push(*cid);
                } else if let Some(hint) = state.hints.get_mut(cid) {
                    hint.want.add_match(peer);
                }
            }
        }
        for cid in &woken {
            self.inner.blocker.wake(cid);
        }
    }

    /// `peer` announced that it does not have `cids`.
    pub fn dont_have_received(&self, peer: &PeerId, cids: &[Cid]) {
        self.inner
            .metrics
            .dont_haves_received
            .inc_by(cids.len() as u64);
        let mut woken = Vec::new();
        {
            let state = &mut *self.inner.state.lock().expect("poisoned");
            for cid in cids {
                if let Some(want) = state.wants.get_mut(cid) {
                    want.remove_peer(peer);
                    woken.push(*cid);
                } else if let Some(hint) = state.hints.get_mut(cid) {
                    hint.want.remove_peer(peer);
                }
            }
        }
        for cid in &woken {
            self.inner.blocker.wake(cid);
        }
    }

    /// Probes all known peers for `cids`, without waiting for answers.
    ///
    /// Peers answering HAVE are asked first once the block is fetched. Small blocks sent
    /// in place of a HAVE are stored. Probes expire after `provider_refresh_interval`.
    pub fn load_blocks(&self, cids: &[Cid]) {
        self.prune_hints();

        let mut evicted = Vec::new();
        let mut messages: AHashMap<PeerId, BitswapMessage> = AHashMap::new();
        {
            let state = &mut *self.inner.state.lock().expect("poisoned");
            for cid in cids {
                if state.wants.contains_key(cid) {
                    continue;
                }
                if !state.hints.contains_key(cid) && state.hints.len() >= MAX_HINTS {
                    let oldest = state
                        .hints
                        .iter()
                        .min_by_key(|(_, hint)| hint.seq)
                        .map(|(cid, _)| *cid);
                    if let Some((cid, hint)) = oldest.and_then(|c| state.hints.remove_entry(&c))
                    {
                        evicted.push((cid, hint.want));
                    }
                }
                let seq = state.next_hint;
                let hint = state.hints.entry(*cid).or_insert_with(|| Hint {
                    want: Want::default(),
                    seq,
                    created: Instant::now(),
                });
                state.next_hint += 1;
                for peer in &state.peers {
                    if hint.want.probed.insert(*peer) {
                        messages
                            .entry(*peer)
                            .or_insert_with(|| BitswapMessage::new(false))
                            .add_entry(*cid, 1, WantType::Have, true);
                    }
                }
            }
        }
        for (cid, want) in evicted {
            trace!(%cid, "evicting probe");
            self.send_cancels(&cid, &want, None);
        }
        for (peer, message) in messages {
            trace!(%peer, wants = message.wantlist_len(), "probing peer");
            self.send(peer, message);
        }
    }

    /// Drops probes older than `provider_refresh_interval`.
    fn prune_hints(&self) {
        let ttl = self.inner.config.provider_refresh_interval;
        let expired: Vec<(Cid, Want)> = {
            let state = &mut *self.inner.state.lock().expect("poisoned");
            let now = Instant::now();
            let cids: Vec<Cid> = state
                .hints
                .iter()
                .filter(|(_, hint)| now.duration_since(hint.created) >= ttl)
                .map(|(cid, _)| *cid)
                .collect();
            cids.into_iter()
                .filter_map(|cid| state.hints.remove(&cid).map(|hint| (cid, hint.want)))
                .collect()
        };
        for (cid, want) in expired {
            trace!(%cid, "probe expired");
            self.send_cancels(&cid, &want, None);
        }
    }

    fn forget_hint(&self, cid: &Cid) {
        let hint = self.inner.state.lock().expect("poisoned").hints.remove(cid);
        if let Some(hint) = hint {
            self.send_cancels(cid, &hint.want, None);
        }
    }

    /// Drops all peers and running wants, and aborts waiting fetches.
    pub fn reset(&self) {
        debug!("resetting client");
        {
            let state = &mut *self.inner.state.lock().expect("poisoned");
            state.peers.clear();
            state.wants.clear();
            state.hints.clear();
            state.wantlist.clear();
        }
        self.inner.provider_query_manager.reset();
        self.inner.blocker.wake_all();
    }

    /// Forgets a peer that failed to receive our messages.
    pub fn receive_connection_failure(&self, peer: &PeerId) {
        debug!(%peer, "removing unreachable peer");
        self.remove_peer(peer);
    }

    pub fn peer_connected(&self, peer: &PeerId) {
        let added = self.inner.state.lock().expect("poisoned").peers.insert(*peer);
        if added {
            trace!(%peer, "peer connected");
            self.inner.blocker.wake_all();
        }
    }

    pub fn peer_disconnected(&self, peer: &PeerId) {
        trace!(%peer, "peer disconnected");
        self.remove_peer(peer);
    }

    fn remove_peer(&self, peer: &PeerId) {
        let state = &mut *self.inner.state.lock().expect("poisoned");
        state.peers.remove(peer);
        let hints = state.hints.values_mut().map(|hint| &mut hint.want);
        for want in state.wants.values_mut().chain(hints) {
            want.remove_peer(peer);
        }
    }

    fn provider_found(&self, cid: &Cid, peer: PeerId) {
        let added = self.inner.state.lock().expect("poisoned").peers.insert(peer);
        if added {
            debug!(%cid, %peer, "adding provider");
            self.inner.blocker.wake(cid);
        }
    }

    /// Cids of all running fetches, highest priority first.
    pub fn wantlist(&self) -> Vec<Cid> {
        self.inner
            .state
            .lock()
            .expect("poisoned")
            .wantlist
            .sorted_entries()
            .into_iter()
            .map(|e| e.cid)
            .collect()
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.inner
            .state
            .lock()
            .expect("poisoned")
            .peers
            .iter()
            .copied()
            .collect()
    }

    pub fn stat(&self) -> Stat {
        let metrics = &self.inner.metrics;
        Stat {
            wantlist: self.wantlist(),
            peers: self.peers(),
            blocks_received: metrics.blocks_received.get(),
            data_received: metrics.data_received.get(),
            dup_blks_received: metrics.duplicate_blocks_received.get(),
            dup_data_received: metrics.duplicate_data_received.get(),
        }
    }

    /// Aborts all running fetches and provider searches.
    pub fn stop(&self) {
        self.inner.cancel.cancel();
        self.inner.provider_query_manager.stop();
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Feeds discovered providers into the client and expires stale probes.
async fn background_loop(
    inner: Weak<Inner>,
    mut found: mpsc::Receiver<(Cid, PeerId)>,
    prune_interval: Duration,
    cancel: CancellationToken,
) {
    let mut prune = tokio::time::interval_at(Instant::now() + prune_interval, prune_interval);
    prune.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            found = found.recv() => {
                let Some((cid, peer)) = found else {
                    break;
                };
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                Client { inner }.provider_found(&cid, peer);
            }
            _ = prune.tick() => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                Client { inner }.prune_hints();
            }
        }
    }
}

/// Releases the per cid fetch lock, dropping it once nobody waits for it anymore.
struct FetchGuard<'a> {
    locks: &'a Mutex<AHashMap<Cid, Arc<tokio::sync::Mutex<()>>>>,
    cid: Cid,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for FetchGuard<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().expect("poisoned");
        // one reference in the map, one in our guard
        if locks
            .get(&self.cid)
            .is_some_and(|lock| Arc::strong_count(lock) <= 2)
        {
            locks.remove(&self.cid);
        }
    }
}

/// Registers a running fetch, and unregisters it however the fetch ends.
///
/// Wants that end without the block are cancelled with the peers that were asked.
struct WantGuard {
    client: Client,
    cid: Cid,
}

impl WantGuard {
    fn new(client: Client, cid: Cid, priority: Priority) -> Self {
        {
            let state = &mut *client.inner.state.lock().expect("poisoned");
            let mut want = state
                .hints
                .remove(&cid)
                .map(|hint| hint.want)
                .unwrap_or_default();
            want.priority = priority;
            state.wants.insert(cid, want);
            state.wantlist.add(cid, priority, WantType::Block);
        }
        WantGuard { client, cid }
    }
}

impl Drop for WantGuard {
    fn drop(&mut self) {
        let inner = &self.client.inner;
        let want = {
            let state = &mut *inner.state.lock().expect("poisoned");
            state.wantlist.remove(&self.cid);
            state.wants.remove(&self.cid)
        };
        inner.blocker.remove(&self.cid);

        if let Some(want) = want {
            if !inner.cancel.is_cancelled() {
                self.client.send_cancels(&self.cid, &want, None);
            }
        }
    }
}
