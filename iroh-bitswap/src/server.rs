//! The providing side of the protocol.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use cid::Cid;
use libp2p_identity::PeerId;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, trace, Instrument};

use self::decision::{Config as DecisionConfig, Engine as DecisionEngine, Envelope};
use crate::{
    block::Block, message::BitswapMessage, metrics::Metrics, network::Network, store::Store,
};

mod blockstore_manager;
mod decision;
mod ledger;
mod task_merger;

pub use self::decision::PeerBlockRequestFilter;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The total number of simultaneous tasks sending outgoing messages.
    pub task_worker_count: usize,
    #[serde(flatten)]
    pub decision_config: DecisionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            task_worker_count: 8,
            decision_config: DecisionConfig::default(),
        }
    }
}

#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Stat {
    pub peers: Vec<PeerId>,
    pub blocks_sent: u64,
    pub data_sent: u64,
}

#[derive(Debug)]
pub struct Server {
    /// Decision engine for which who to send which blocks to.
    engine: Arc<DecisionEngine>,
    /// Provides interaction with the network.
    network: Network,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Server {
    /// Creates the server and starts its workers on the current runtime.
    pub fn new(
        store: Arc<dyn Store>,
        network: Network,
        config: Config,
        metrics: Arc<Metrics>,
    ) -> Self {
        let thaw_interval = config.decision_config.thaw_interval;
        let engine = DecisionEngine::new(store, config.decision_config, metrics.clone());

        let server = Server {
            engine: Arc::new(engine),
            network,
            metrics,
            cancel: CancellationToken::new(),
            workers: Default::default(),
        };
        server.start_workers(config.task_worker_count, thaw_interval);

        server
    }

    fn start_workers(&self, task_worker_count: usize, thaw_interval: Duration) {
        let mut workers = self.workers.lock().expect("poisoned");

        // start up workers to handle requests from other nodes for the data on this node
        for id in 0..task_worker_count.max(1) {
            let engine = self.engine.clone();
            let network = self.network.clone();
            let cancel = self.cancel.clone();
            workers.push(tokio::spawn(
                async move {
                    while let Some(envelope) = engine.next_envelope(&cancel).await {
                        send_blocks(&engine, &network, envelope).await;
                    }
                    trace!("task worker stopped");
                }
                .instrument(info_span!("task_worker", id)),
            ));
        }

        let engine = self.engine.clone();
        let cancel = self.cancel.clone();
        workers.push(tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(thaw_interval);
                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => engine.thaw_round(),
                    }
                }
            }
            .instrument(info_span!("thaw")),
        ));
    }

    pub fn wantlist_for_peer(&self, peer: &PeerId) -> Vec<Cid> {
        self.engine
            .wantlist_for_peer(peer)
            .into_iter()
            .map(|e| e.cid)
            .collect()
    }

    /// Stops all workers and waits for them to finish.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let workers: Vec<_> = self.workers.lock().expect("poisoned").drain(..).collect();
        for worker in workers {
            if let Err(err) = worker.await {
                debug!("worker failed: {err}");
            }
        }
    }

    /// Schedules the new blocks for peers that want them.
    pub fn notify_new_blocks(&self, blocks: &[Block]) {
        self.engine.notify_new_blocks(blocks);
    }

    pub fn stat(&self) -> Stat {
        Stat {
            peers: self.engine.peers(),
            blocks_sent: self.metrics.blocks_sent.get(),
            data_sent: self.metrics.data_sent.get(),
        }
    }

    pub async fn receive_message(&self, peer: &PeerId, message: &BitswapMessage) {
        self.engine.message_received(peer, message).await;
    }

    pub fn peer_connected(&self, peer: &PeerId) {
        self.engine.peer_connected(peer);
    }

    pub fn peer_disconnected(&self, peer: &PeerId) {
        self.engine.peer_disconnected(peer);
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn send_blocks(engine: &DecisionEngine, network: &Network, envelope: Envelope) {
    match network.send_message(envelope.peer, &envelope.message).await {
        Ok(()) => engine.message_sent(&envelope.peer, &envelope.message),
        Err(err) => debug!(peer = %envelope.peer, "failed to send message: {err}"),
    }

    // trigger sent updates
    engine.tasks_done(envelope.peer, &envelope.sent_tasks);
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    use super::*;
    use crate::{
        block::tests::create_random_block_v1,
        message::{BlockPresenceType, WantType},
        network::tests::{recording_network, unsupported_network, Sent},
        store::MemStore,
    };

    fn setup() -> (Server, MemStore, Sent, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::default());
        let (network, sent) = recording_network(metrics.clone());
        let store = MemStore::new();
        let server = Server::new(
            Arc::new(store.clone()),
            network,
            Config::default(),
            metrics.clone(),
        );
        (server, store, sent, metrics)
    }

    async fn next_message(sent: &mut Sent) -> (PeerId, BitswapMessage) {
        tokio::time::timeout(Duration::from_secs(5), sent.recv())
            .await
            .expect("no message sent")
            .unwrap()
    }

    async fn wait_until(f: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !f() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    fn want(cid: Cid, want_type: WantType) -> BitswapMessage {
        let mut message = BitswapMessage::new(false);
        message.add_entry(cid, 1, want_type, true);
        message
    }

    #[tokio::test]
    #[traced_test]
    async fn test_serves_want_block() {
        let (server, store, mut sent, _) = setup();
        let block = create_random_block_v1();
        store.put(block.clone()).await.unwrap();
        let peer = PeerId::random();
        server.peer_connected(&peer);

        server
            .receive_message(&peer, &want(*block.cid(), WantType::Block))
            .await;

        let (to, message) = next_message(&mut sent).await;
        assert_eq!(to, peer);
        assert_eq!(message.blocks().collect::<Vec<_>>(), vec![&block]);

        // delivered wants are pruned from the ledger once the send completed
        wait_until(|| server.wantlist_for_peer(&peer).is_empty()).await;
        let stat = server.stat();
        assert_eq!(stat.peers, vec![peer]);
        assert_eq!(stat.blocks_sent, 1);
        assert_eq!(stat.data_sent, block.len() as u64);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_dont_have_for_missing_block() {
        let (server, _store, mut sent, metrics) = setup();
        let cid = *create_random_block_v1().cid();
        let peer = PeerId::random();
        server.peer_connected(&peer);

        server.receive_message(&peer, &want(cid, WantType::Have)).await;

        let (to, message) = next_message(&mut sent).await;
        assert_eq!(to, peer);
        let presences: Vec<_> = message.block_presences().collect();
        assert_eq!(presences.len(), 1);
        assert_eq!(presences[0].cid, cid);
        assert_eq!(presences[0].typ, BlockPresenceType::DontHave);
        wait_until(|| metrics.dont_haves_sent.get() == 1).await;

        // the want stays until the block shows up
        assert_eq!(server.wantlist_for_peer(&peer), vec![cid]);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_new_block_for_waiting_peer() {
        let (server, store, mut sent, _) = setup();
        let block = create_random_block_v1();
        let peer = PeerId::random();
        server.peer_connected(&peer);

        server
            .receive_message(&peer, &want(*block.cid(), WantType::Block))
            .await;
        let (_, message) = next_message(&mut sent).await;
        assert_eq!(message.dont_haves().collect::<Vec<_>>(), vec![block.cid()]);

        store.put(block.clone()).await.unwrap();
        server.notify_new_blocks(&[block.clone()]);

        let (to, message) = next_message(&mut sent).await;
        assert_eq!(to, peer);
        assert_eq!(message.blocks().collect::<Vec<_>>(), vec![&block]);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_failed_send_keeps_want() {
        let metrics = Arc::new(Metrics::default());
        let store = MemStore::new();
        let server = Server::new(
            Arc::new(store.clone()),
            unsupported_network(metrics.clone()),
            Config::default(),
            metrics.clone(),
        );
        let block = create_random_block_v1();
        store.put(block.clone()).await.unwrap();
        let peer = PeerId::random();
        server.peer_connected(&peer);

        server
            .receive_message(&peer, &want(*block.cid(), WantType::Block))
            .await;
        wait_until(|| metrics.message_send_failures.get() > 0).await;

        let stat = server.stat();
        assert_eq!(stat.blocks_sent, 0);
        assert_eq!(stat.data_sent, 0);
        assert_eq!(server.wantlist_for_peer(&peer), vec![*block.cid()]);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_stop() {
        let (server, _store, _sent, _) = setup();
        tokio::time::timeout(Duration::from_secs(1), server.stop())
            .await
            .unwrap();
        assert!(server.workers.lock().unwrap().is_empty());
    }
}
