//! Content addressed block exchange, based on the [bitswap protocol](https://github.com/ipfs/specs/blob/master/BITSWAP.md).
//!
//! A [`Bitswap`] node answers the wants of its peers from a local [`Store`] (the
//! [`server`] side) and fetches missing blocks from them (the [`client`] side). Dialing,
//! streams and provider lookups are injected through the [`Transport`] and
//! [`ProviderDiscovery`] traits, messages travel as length delimited frames on streams
//! opened by the transport.

use std::{
    io,
    sync::{Arc, Weak},
    time::Duration,
};

use cid::Cid;
use futures::StreamExt;
use libp2p_identity::PeerId;
use tokio::io::AsyncWriteExt;
use tokio_util::{codec::FramedRead, sync::CancellationToken};
use tracing::{debug, trace, warn};

use self::{
    client::Client,
    connect_events::{ConnectEventManager, ConnectionListener},
    network::{codec, Network},
    server::Server,
};

mod block;
pub mod client;
mod config;
pub mod connect_events;
mod error;
pub mod message;
pub mod metrics;
pub mod network;
pub mod peer_task_queue;
mod prefix;
pub mod server;
mod store;
pub mod wantlist;

pub use self::{
    block::{create_block_v1, Block},
    config::Config,
    error::{Error, FetchError, SendError, TransportError},
    message::{BitswapMessage, Priority},
    network::{
        BitswapStream, BoxStream, Connection, NoDiscovery, ProviderDiscovery, SenderConfig,
        Transport,
    },
    store::{MemStore, Store},
};

/// A bitswap node, serving its store to peers and fetching blocks from them.
///
/// Cloning is cheap, all clones refer to the same node.
#[derive(Debug, Clone)]
pub struct Bitswap {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    network: Network,
    store: Arc<dyn Store>,
    client: Client,
    server: Server,
    metrics: Arc<metrics::Metrics>,
    cancel: CancellationToken,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stat {
    pub wantlist: Vec<Cid>,
    pub peers: Vec<PeerId>,
    pub blocks_received: u64,
    pub data_received: u64,
    pub dup_blks_received: u64,
    pub dup_data_received: u64,
    pub messages_received: u64,
    pub blocks_sent: u64,
    pub data_sent: u64,
}

impl Bitswap {
    /// Creates a node and starts its workers, must be called within a tokio runtime.
    pub fn new(
        self_id: PeerId,
        store: Arc<dyn Store>,
        transport: Arc<dyn Transport>,
        discovery: Arc<dyn ProviderDiscovery>,
        config: Config,
    ) -> Self {
        let metrics = Arc::new(metrics::Metrics::default());
        let connect_events = Arc::new(ConnectEventManager::new());
        let network = Network::new(
            self_id,
            transport,
            connect_events.clone(),
            config.sender,
            metrics.clone(),
        );
        let server = Server::new(
            store.clone(),
            network.clone(),
            config.server,
            metrics.clone(),
        );
        let client = Client::new(
            store.clone(),
            network.clone(),
            discovery,
            config.client,
            metrics.clone(),
        );

        let inner = Arc::new(Inner {
            network,
            store,
            client,
            server,
            metrics,
            cancel: CancellationToken::new(),
        });
        connect_events.add_listener(Arc::new(PeerListener {
            inner: Arc::downgrade(&inner),
        }));

        Bitswap { inner }
    }

    pub fn self_id(&self) -> &PeerId {
        self.inner.network.self_id()
    }

    pub fn client(&self) -> &Client {
        &self.inner.client
    }

    pub fn server(&self) -> &Server {
        &self.inner.server
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.inner.store
    }

    pub fn metrics(&self) -> &Arc<metrics::Metrics> {
        &self.inner.metrics
    }

    /// Fetches a block locally or from the network, see [`Client::get_block`].
    pub async fn get_block(
        &self,
        cid: &Cid,
        is_root: bool,
        cancel: &CancellationToken,
    ) -> Result<Block, FetchError> {
        self.inner.client.get_block(cid, is_root, cancel).await
    }

    /// Fetches a block, `None` if it could not be found within `timeout`.
    pub async fn fetch(&self, cid: &Cid, is_root: bool, timeout: Duration) -> Option<Block> {
        self.inner.client.fetch(cid, is_root, timeout).await
    }

    /// Stores a block and announces it to interested peers and local fetches.
    pub async fn put_block(&self, block: Block) -> anyhow::Result<()> {
        self.inner.store.put(block.clone()).await?;
        self.notify_new_blocks(&[block]);
        Ok(())
    }

    /// Blocks that were added to the store by other means.
    pub fn notify_new_blocks(&self, blocks: &[Block]) {
        self.inner.client.notify_new_blocks(blocks);
        self.inner.server.notify_new_blocks(blocks);
    }

    pub fn stat(&self) -> Stat {
        let client_stat = self.inner.client.stat();
        let server_stat = self.inner.server.stat();

        Stat {
            wantlist: client_stat.wantlist,
            blocks_received: client_stat.blocks_received,
            data_received: client_stat.data_received,
            dup_blks_received: client_stat.dup_blks_received,
            dup_data_received: client_stat.dup_data_received,
            messages_received: self.inner.metrics.messages_received.get(),
            peers: server_stat.peers,
            blocks_sent: server_stat.blocks_sent,
            data_sent: server_stat.data_sent,
        }
    }

    /// Our own wantlist for `self_id`, otherwise what `peer` wants from us.
    pub fn wantlist_for_peer(&self, peer: &PeerId) -> Vec<Cid> {
        if peer == self.self_id() {
            return self.inner.client.wantlist();
        }

        self.inner.server.wantlist_for_peer(peer)
    }

    /// A connection to `peer` was established.
    pub fn peer_connected(&self, peer: &PeerId) {
        self.inner.network.connect_events().connected(peer);
    }

    /// A connection to `peer` was closed.
    pub fn peer_disconnected(&self, peer: &PeerId) {
        self.inner.network.connect_events().disconnected(peer);
        if !self.inner.network.connect_events().is_connected(peer) {
            self.inner.network.close_sender(peer);
        }
    }

    /// Handles a decoded message from `peer`.
    pub async fn receive_message(&self, peer: &PeerId, mut message: BitswapMessage) {
        trace!(%peer, "received message");
        self.inner.metrics.messages_received.inc();
        self.inner.network.connect_events().on_message(peer);
        message.verify_blocks();

        // the client stores blocks first, so the server can serve them right away
        let stored = self.inner.client.receive_message(peer, &message).await;
        self.inner.server.receive_message(peer, &message).await;
        if !stored.is_empty() {
            self.inner.server.notify_new_blocks(&stored);
        }
    }

    /// Reads messages from a stream opened by `peer` until it closes.
    ///
    /// A frame that fails to decode ends the stream.
    pub async fn handle_inbound_stream(&self, peer: PeerId, stream: BoxStream) {
        let max_message_size = self.inner.network.config().max_message_size;
        let mut frames = FramedRead::new(stream, codec(max_message_size));

        loop {
            let frame = tokio::select! {
                biased;
                _ = self.inner.cancel.cancelled() => break,
                frame = frames.next() => frame,
            };
            let bytes = match frame {
                None => {
                    trace!(%peer, "inbound stream closed");
                    break;
                }
                Some(Ok(bytes)) => bytes,
                Some(Err(err)) => {
                    if err.kind() == io::ErrorKind::InvalidData {
                        self.inner.metrics.decode_errors.inc();
                    }
                    warn!(%peer, "failed to read frame: {err}");
                    break;
                }
            };
            match BitswapMessage::try_from(bytes.freeze()) {
                Ok(message) => self.receive_message(&peer, message).await,
                Err(err) => {
                    self.inner.metrics.decode_errors.inc();
                    warn!(%peer, "failed to decode message: {err}");
                    break;
                }
            }
        }

        if let Err(err) = frames.into_inner().shutdown().await {
            debug!(%peer, "failed to shut down stream: {err}");
        }
    }

    /// Stops all workers and aborts running fetches and sends.
    pub async fn stop(&self) {
        debug!("stopping bitswap");
        self.inner.cancel.cancel();
        self.inner.network.connect_events().clear_listeners();
        self.inner.client.stop();
        self.inner.network.stop();
        self.inner.server.stop().await;
    }
}

/// Forwards peer changes to client and server.
#[derive(Debug)]
struct PeerListener {
    inner: Weak<Inner>,
}

impl ConnectionListener for PeerListener {
    fn peer_connected(&self, peer: &PeerId) {
        if let Some(inner) = self.inner.upgrade() {
            inner.client.peer_connected(peer);
            inner.server.peer_connected(peer);
        }
    }

    fn peer_disconnected(&self, peer: &PeerId) {
        if let Some(inner) = self.inner.upgrade() {
            inner.client.peer_disconnected(peer);
            inner.server.peer_disconnected(peer);
        }
    }
}
