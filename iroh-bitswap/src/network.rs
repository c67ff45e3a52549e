//! Abstractions over the transport, and the outbound side of the protocol.

use std::{
    fmt::Debug,
    sync::{Arc, Mutex},
    time::Duration,
};

use ahash::AHashMap;
use async_trait::async_trait;
use cid::Cid;
use libp2p_identity::PeerId;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
};
use tokio_util::{codec::LengthDelimitedCodec, sync::CancellationToken};
use tracing::debug;

use crate::{
    connect_events::ConnectEventManager,
    error::{SendError, TransportError},
    message::BitswapMessage,
    metrics::Metrics,
};

mod message_sender;

pub use self::message_sender::MessageSender;

/// A bidirectional byte stream to a peer.
pub trait BitswapStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> BitswapStream for T {}

pub type BoxStream = Box<dyn BitswapStream>;

/// An established connection to a peer.
#[async_trait]
pub trait Connection: Debug + Send + Sync + 'static {
    /// Opens a new outbound stream for the bitswap protocol.
    ///
    /// Returns [`TransportError::NotSupported`] if the peer does not speak the protocol.
    async fn open_stream(&self) -> Result<BoxStream, TransportError>;
}

/// Dials peers.
#[async_trait]
pub trait Transport: Debug + Send + Sync + 'static {
    /// Returns a connection to `peer`, reusing an existing one if available.
    async fn connect(&self, peer: PeerId) -> Result<Arc<dyn Connection>, TransportError>;
}

/// Finds peers that provide a given cid.
#[async_trait]
pub trait ProviderDiscovery: Debug + Send + Sync + 'static {
    /// Streams providers for `cid` into `providers` until the search is exhausted or the
    /// receiver is dropped.
    async fn find_providers(&self, cid: Cid, providers: mpsc::Sender<PeerId>)
        -> anyhow::Result<()>;
}

/// Discovery that never finds anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDiscovery;

#[async_trait]
impl ProviderDiscovery for NoDiscovery {
    async fn find_providers(
        &self,
        _cid: Cid,
        _providers: mpsc::Sender<PeerId>,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Settings for outbound messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderConfig {
    /// Number of attempts per message, including the first one.
    pub max_retries: usize,
    /// Delay before the first retry, doubled on every further one.
    #[serde(with = "humantime_serde")]
    pub retry_min_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub retry_max_delay: Duration,
    /// Timeout for a single attempt, connecting included.
    #[serde(with = "humantime_serde")]
    pub send_timeout: Duration,
    /// Largest frame accepted or produced.
    pub max_message_size: usize,
}

impl Default for SenderConfig {
    fn default() -> Self {
        SenderConfig {
            max_retries: 3,
            retry_min_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_secs(1),
            send_timeout: Duration::from_secs(10),
            max_message_size: 4 * 1024 * 1024,
        }
    }
}

/// Frames are a length prefix followed by the encoded message.
pub(crate) fn codec(max_message_size: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(max_message_size)
        .new_codec()
}

/// Outbound side of the protocol, keeps one [`MessageSender`] per peer.
#[derive(Debug, Clone)]
pub struct Network {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    self_id: PeerId,
    transport: Arc<dyn Transport>,
    connect_events: Arc<ConnectEventManager>,
    senders: Mutex<AHashMap<PeerId, Arc<MessageSender>>>,
    config: SenderConfig,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
}

impl Network {
    pub fn new(
        self_id: PeerId,
        transport: Arc<dyn Transport>,
        connect_events: Arc<ConnectEventManager>,
        config: SenderConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Network {
            inner: Arc::new(Inner {
                self_id,
                transport,
                connect_events,
                senders: Default::default(),
                config,
                metrics,
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn self_id(&self) -> &PeerId {
        &self.inner.self_id
    }

    pub fn connect_events(&self) -> &Arc<ConnectEventManager> {
        &self.inner.connect_events
    }

    pub fn config(&self) -> &SenderConfig {
        &self.inner.config
    }

    /// Returns the sender for `peer`, creating it if needed.
    pub fn message_sender(&self, peer: PeerId) -> Arc<MessageSender> {
        self.inner
            .senders
            .lock()
            .expect("poisoned")
            .entry(peer)
            .or_insert_with(|| {
                Arc::new(MessageSender::new(
                    peer,
                    self.inner.transport.clone(),
                    self.inner.connect_events.clone(),
                    self.inner.config.clone(),
                    self.inner.metrics.clone(),
                    self.inner.cancel.child_token(),
                ))
            })
            .clone()
    }

    /// Sends a message to `peer`, retrying as configured.
    pub async fn send_message(&self, peer: PeerId, message: &BitswapMessage) -> Result<(), SendError> {
        if self.inner.cancel.is_cancelled() {
            return Err(SendError::Closed);
        }
        self.message_sender(peer).send_message(message).await
    }

    /// Drops the sender and its cached stream for `peer`.
    pub fn close_sender(&self, peer: &PeerId) {
        if let Some(sender) = self.inner.senders.lock().expect("poisoned").remove(peer) {
            debug!(%peer, "closing message sender");
            sender.close();
        }
    }

    /// Aborts all in flight sends and drops all senders.
    pub fn stop(&self) {
        self.inner.cancel.cancel();
        self.inner.senders.lock().expect("poisoned").clear();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use futures::StreamExt;
    use tokio_util::codec::FramedRead;

    use super::*;
    use crate::block::tests::create_random_block_v1;

    pub(crate) type Sent = mpsc::UnboundedReceiver<(PeerId, BitswapMessage)>;

    /// Decodes everything sent to any peer into a channel.
    #[derive(Debug)]
    pub(crate) struct RecordingTransport {
        sent: mpsc::UnboundedSender<(PeerId, BitswapMessage)>,
    }

    #[derive(Debug)]
    struct RecordingConnection {
        peer: PeerId,
        sent: mpsc::UnboundedSender<(PeerId, BitswapMessage)>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn connect(&self, peer: PeerId) -> Result<Arc<dyn Connection>, TransportError> {
            Ok(Arc::new(RecordingConnection {
                peer,
                sent: self.sent.clone(),
            }))
        }
    }

    #[async_trait]
    impl Connection for RecordingConnection {
        async fn open_stream(&self) -> Result<BoxStream, TransportError> {
            let (local, remote) = tokio::io::duplex(1024 * 1024);
            let peer = self.peer;
            let sent = self.sent.clone();
            tokio::spawn(async move {
                let max = SenderConfig::default().max_message_size;
                let mut frames = FramedRead::new(remote, codec(max));
                while let Some(Ok(frame)) = frames.next().await {
                    let message = BitswapMessage::try_from(frame.freeze()).unwrap();
                    if sent.send((peer, message)).is_err() {
                        break;
                    }
                }
            });
            Ok(Box::new(local))
        }
    }

    /// Reaches no peer, every send fails right away.
    #[derive(Debug)]
    struct UnsupportedTransport;

    #[async_trait]
    impl Transport for UnsupportedTransport {
        async fn connect(&self, _peer: PeerId) -> Result<Arc<dyn Connection>, TransportError> {
            Err(TransportError::NotSupported)
        }
    }

    pub(crate) fn unsupported_network(metrics: Arc<Metrics>) -> Network {
        Network::new(
            PeerId::random(),
            Arc::new(UnsupportedTransport),
            Arc::new(ConnectEventManager::new()),
            SenderConfig::default(),
            metrics,
        )
    }

    pub(crate) fn recording_network(metrics: Arc<Metrics>) -> (Network, Sent) {
        let (sent_s, sent_r) = mpsc::unbounded_channel();
        let network = Network::new(
            PeerId::random(),
            Arc::new(RecordingTransport { sent: sent_s }),
            Arc::new(ConnectEventManager::new()),
            SenderConfig::default(),
            metrics,
        );
        (network, sent_r)
    }

    #[tokio::test]
    async fn test_sender_per_peer() {
        let metrics = Arc::new(Metrics::default());
        let (network, mut sent) = recording_network(metrics.clone());
        let peer = PeerId::random();

        let a = network.message_sender(peer);
        let b = network.message_sender(peer);
        assert!(Arc::ptr_eq(&a, &b));

        let mut message = BitswapMessage::new(false);
        message.add_have(*create_random_block_v1().cid());
        network.send_message(peer, &message).await.unwrap();
        assert_eq!(sent.recv().await, Some((peer, message.clone())));
        assert_eq!(metrics.messages_sent.get(), 1);

        network.close_sender(&peer);
        assert!(!Arc::ptr_eq(&a, &network.message_sender(peer)));

        network.stop();
        let err = network.send_message(peer, &message).await.unwrap_err();
        assert!(matches!(err, SendError::Closed));
    }
}
