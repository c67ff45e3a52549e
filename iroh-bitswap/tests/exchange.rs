use std::{
    collections::HashMap,
    fmt, io,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use cid::Cid;
use futures::SinkExt;
use iroh_bitswap::{
    create_block_v1, Bitswap, Block, BoxStream, Config, Connection, FetchError, MemStore,
    NoDiscovery, ProviderDiscovery, SenderConfig, Store, Transport, TransportError,
};
use libp2p_identity::PeerId;
use rand::RngCore;
use tokio::{io::AsyncReadExt, sync::mpsc};
use tokio_util::{
    codec::{FramedWrite, LengthDelimitedCodec},
    sync::CancellationToken,
};
use tracing_test::traced_test;

type Nodes = Arc<Mutex<HashMap<PeerId, Bitswap>>>;

/// Connects nodes of the same process through in memory pipes.
#[derive(Clone)]
struct MemTransport {
    local: PeerId,
    nodes: Nodes,
}

impl fmt::Debug for MemTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemTransport")
            .field("local", &self.local)
            .finish_non_exhaustive()
    }
}

struct MemConnection {
    local: PeerId,
    remote: Bitswap,
}

impl fmt::Debug for MemConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemConnection")
            .field("local", &self.local)
            .field("remote", self.remote.self_id())
            .finish()
    }
}

#[async_trait]
impl Transport for MemTransport {
    async fn connect(&self, peer: PeerId) -> Result<Arc<dyn Connection>, TransportError> {
        let remote = self
            .nodes
            .lock()
            .unwrap()
            .get(&peer)
            .cloned()
            .ok_or_else(|| io::Error::from(io::ErrorKind::ConnectionRefused))?;
        Ok(Arc::new(MemConnection {
            local: self.local,
            remote,
        }))
    }
}

#[async_trait]
impl Connection for MemConnection {
    async fn open_stream(&self) -> Result<BoxStream, TransportError> {
        let (local, remote) = tokio::io::duplex(1024 * 1024);
        let node = self.remote.clone();
        let peer = self.local;
        tokio::spawn(async move { node.handle_inbound_stream(peer, Box::new(remote)).await });
        Ok(Box::new(local))
    }
}

/// Knows a fixed set of providers per cid.
#[derive(Debug, Default)]
struct StaticDiscovery {
    providers: Mutex<HashMap<Cid, Vec<PeerId>>>,
}

#[async_trait]
impl ProviderDiscovery for StaticDiscovery {
    async fn find_providers(&self, cid: Cid, sink: mpsc::Sender<PeerId>) -> anyhow::Result<()> {
        let providers = self
            .providers
            .lock()
            .unwrap()
            .get(&cid)
            .cloned()
            .unwrap_or_default();
        for peer in providers {
            sink.send(peer).await?;
        }
        Ok(())
    }
}

fn config() -> Config {
    Config {
        sender: SenderConfig {
            max_retries: 2,
            retry_min_delay: Duration::from_millis(1),
            retry_max_delay: Duration::from_millis(5),
            send_timeout: Duration::from_secs(1),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn node(nodes: &Nodes, discovery: Arc<dyn ProviderDiscovery>) -> (Bitswap, MemStore) {
    let id = PeerId::random();
    let store = MemStore::new();
    let transport = MemTransport {
        local: id,
        nodes: nodes.clone(),
    };
    let bitswap = Bitswap::new(
        id,
        Arc::new(store.clone()),
        Arc::new(transport),
        discovery,
        config(),
    );
    nodes.lock().unwrap().insert(id, bitswap.clone());
    (bitswap, store)
}

fn connect(a: &Bitswap, b: &Bitswap) {
    a.peer_connected(b.self_id());
    b.peer_connected(a.self_id());
}

fn random_block(size: usize) -> Block {
    let mut data = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut data);
    create_block_v1(Bytes::from(data))
}

async fn shutdown(nodes: &Nodes) {
    let nodes: Vec<_> = nodes.lock().unwrap().drain().map(|(_, n)| n).collect();
    for node in nodes {
        node.stop().await;
    }
}

#[tokio::test]
#[traced_test]
async fn fetch_from_connected_peer() {
    let nodes = Nodes::default();
    let (a, a_store) = node(&nodes, Arc::new(NoDiscovery));
    let (b, _) = node(&nodes, Arc::new(NoDiscovery));
    connect(&a, &b);

    let block = random_block(50);
    b.put_block(block.clone()).await.unwrap();

    let got = a
        .fetch(block.cid(), false, Duration::from_secs(5))
        .await
        .expect("block not found");
    assert_eq!(got, block);
    assert!(a_store.has(block.cid()).await.unwrap());

    let a_stat = a.stat();
    assert_eq!(a_stat.blocks_received, 1);
    assert_eq!(a_stat.data_received, 50);
    assert!(a_stat.wantlist.is_empty());
    tokio::time::timeout(Duration::from_secs(1), async {
        while b.stat().blocks_sent == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    // the second time it is served locally
    let received = a.metrics().messages_received.get();
    let again = a
        .get_block(block.cid(), false, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(again, block);
    assert_eq!(a.metrics().messages_received.get(), received);

    shutdown(&nodes).await;
}

#[tokio::test]
async fn fetch_large_block_with_want_block() {
    let nodes = Nodes::default();
    let (a, _) = node(&nodes, Arc::new(NoDiscovery));
    let (b, _) = node(&nodes, Arc::new(NoDiscovery));
    connect(&a, &b);

    // too large to be sent in response to a want-have
    let block = random_block(64 * 1024);
    b.put_block(block.clone()).await.unwrap();

    let got = a.fetch(block.cid(), false, Duration::from_secs(5)).await;
    assert_eq!(got, Some(block));
    assert!(a.metrics().want_blocks_sent.get() >= 1);

    shutdown(&nodes).await;
}

#[tokio::test]
async fn root_block_found_through_discovery() {
    let nodes = Nodes::default();
    let discovery = Arc::new(StaticDiscovery::default());
    let (a, _) = node(&nodes, discovery.clone());
    let (b, _) = node(&nodes, Arc::new(NoDiscovery));

    let block = random_block(100);
    b.put_block(block.clone()).await.unwrap();
    discovery
        .providers
        .lock()
        .unwrap()
        .insert(*block.cid(), vec![*b.self_id()]);

    // not connected, the only way to find b is discovery
    let got = a.fetch(block.cid(), true, Duration::from_secs(5)).await;
    assert_eq!(got, Some(block));
    assert_eq!(a.metrics().providers_found.get(), 1);

    shutdown(&nodes).await;
}

#[tokio::test]
async fn concurrent_fetches_share_one_block() {
    let nodes = Nodes::default();
    let (a, _) = node(&nodes, Arc::new(NoDiscovery));
    let (b, _) = node(&nodes, Arc::new(NoDiscovery));
    connect(&a, &b);

    let block = random_block(64 * 1024);
    b.put_block(block.clone()).await.unwrap();

    let cancel = CancellationToken::new();
    let (x, y) = tokio::join!(
        a.get_block(block.cid(), false, &cancel),
        a.get_block(block.cid(), false, &cancel),
    );
    assert_eq!(x.unwrap(), block);
    assert_eq!(y.unwrap(), block);
    assert_eq!(a.metrics().want_blocks_sent.get(), 1);
    assert_eq!(a.stat().dup_blks_received, 0);

    shutdown(&nodes).await;
}

#[tokio::test]
async fn missing_block() {
    let nodes = Nodes::default();
    let (a, _) = node(&nodes, Arc::new(NoDiscovery));
    let (b, _) = node(&nodes, Arc::new(NoDiscovery));
    connect(&a, &b);

    let block = random_block(10);
    let got = a.fetch(block.cid(), false, Duration::from_millis(200)).await;
    assert!(got.is_none());
    assert!(a.metrics().dont_haves_received.get() >= 1);

    // the abandoned want is cancelled with b
    assert!(a.wantlist_for_peer(a.self_id()).is_empty());
    tokio::time::timeout(Duration::from_secs(1), async {
        while !b.wantlist_for_peer(a.self_id()).is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert!(a.metrics().cancels_sent.get() >= 1);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = a.get_block(block.cid(), false, &cancel).await.unwrap_err();
    assert!(matches!(err, FetchError::Cancelled(cid) if cid == *block.cid()));

    shutdown(&nodes).await;
}

#[tokio::test]
async fn unreachable_peer_is_dropped() {
    let nodes = Nodes::default();
    let (a, _) = node(&nodes, Arc::new(NoDiscovery));
    let ghost = PeerId::random();
    a.peer_connected(&ghost);
    assert_eq!(a.client().peers(), vec![ghost]);

    let block = random_block(10);
    assert!(a
        .fetch(block.cid(), false, Duration::from_millis(200))
        .await
        .is_none());

    assert!(a.client().peers().is_empty());
    assert!(a.metrics().unresponsive_peers.get() >= 1);

    shutdown(&nodes).await;
}

#[tokio::test]
async fn invalid_frame_closes_stream() {
    let nodes = Nodes::default();
    let (a, _) = node(&nodes, Arc::new(NoDiscovery));

    let (local, remote) = tokio::io::duplex(1024);
    let handler = tokio::spawn({
        let a = a.clone();
        async move {
            a.handle_inbound_stream(PeerId::random(), Box::new(remote))
                .await
        }
    });

    let mut frames = FramedWrite::new(local, LengthDelimitedCodec::new());
    frames.send(Bytes::from_static(&[0xff; 16])).await.unwrap();

    tokio::time::timeout(Duration::from_secs(1), handler)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(a.metrics().decode_errors.get(), 1);

    // the other side sees the stream closing
    let mut local = frames.into_inner();
    let mut buf = [0u8; 8];
    assert_eq!(local.read(&mut buf).await.unwrap(), 0);

    shutdown(&nodes).await;
}
