use std::{fmt, io, sync::Arc};

use backon::{Backoff, BackoffBuilder, ExponentialBuilder};
use bytes::Bytes;
use futures::SinkExt;
use libp2p_identity::PeerId;
use tokio::sync::Mutex;
use tokio_util::{
    codec::{FramedWrite, LengthDelimitedCodec},
    sync::CancellationToken,
};
use tracing::{debug, trace, warn};

use super::{codec, BoxStream, SenderConfig, Transport};
use crate::{
    connect_events::ConnectEventManager,
    error::{SendError, TransportError},
    message::BitswapMessage,
    metrics::Metrics,
};

type FramedStream = FramedWrite<BoxStream, LengthDelimitedCodec>;

/// Sends messages to a single peer, over a cached stream.
///
/// Failed sends are retried with exponential backoff. A peer that can't be reached after
/// all retries, or that doesn't speak the protocol, is marked unresponsive.
pub struct MessageSender {
    peer: PeerId,
    transport: Arc<dyn Transport>,
    connect_events: Arc<ConnectEventManager>,
    config: SenderConfig,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
    /// Serializes sends, the stream is only replaced while holding it.
    stream: Mutex<Option<FramedStream>>,
}

impl fmt::Debug for MessageSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageSender")
            .field("peer", &self.peer)
            .field("config", &self.config)
            .field("closed", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl MessageSender {
    pub(super) fn new(
        peer: PeerId,
        transport: Arc<dyn Transport>,
        connect_events: Arc<ConnectEventManager>,
        config: SenderConfig,
        metrics: Arc<Metrics>,
        cancel: CancellationToken,
    ) -> Self {
        MessageSender {
            peer,
            transport,
            connect_events,
            config,
            metrics,
            cancel,
            stream: Mutex::new(None),
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }

    fn build_backoff(&self) -> impl Backoff {
        ExponentialBuilder::new()
            .with_min_delay(self.config.retry_min_delay)
            .with_max_delay(self.config.retry_max_delay)
            .with_jitter()
            .with_max_times(self.config.max_retries.saturating_sub(1))
            .build()
    }

    /// Sends the message, retrying on transient failures.
    pub async fn send_message(&self, message: &BitswapMessage) -> Result<(), SendError> {
        let bytes = message.encode()?;
        let mut stream = self.stream.lock().await;
        let mut backoff = self.build_backoff();
        let mut attempts = 0;

        loop {
            if self.cancel.is_cancelled() {
                return Err(SendError::Closed);
            }
            attempts += 1;

            let res = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(SendError::Closed),
                res = tokio::time::timeout(
                    self.config.send_timeout,
                    self.try_send(&mut stream, bytes.clone()),
                ) => res.unwrap_or_else(|_| {
                    Err(io::Error::new(io::ErrorKind::TimedOut, "send timed out").into())
                }),
            };

            let err = match res {
                Ok(()) => {
                    trace!(peer = %self.peer, attempts, "message sent");
                    self.metrics.messages_sent.inc();
                    return Ok(());
                }
                Err(TransportError::NotSupported) => {
                    debug!(peer = %self.peer, "protocol not supported");
                    *stream = None;
                    self.fail();
                    return Err(SendError::NotSupported);
                }
                Err(err) => err,
            };

            // the stream may be in an undefined state
            *stream = None;

            let Some(delay) = backoff.next() else {
                warn!(peer = %self.peer, attempts, "failed to send message: {err}");
                self.fail();
                return Err(SendError::RetriesExhausted {
                    attempts,
                    last: err,
                });
            };
            debug!(peer = %self.peer, attempts, "send failed, retry in {delay:?}: {err}");

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(SendError::Closed),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn try_send(
        &self,
        stream: &mut Option<FramedStream>,
        bytes: Bytes,
    ) -> Result<(), TransportError> {
        let mut framed = match stream.take() {
            Some(framed) => framed,
            None => {
                let conn = self.transport.connect(self.peer).await?;
                let s = conn.open_stream().await?;
                FramedWrite::new(s, codec(self.config.max_message_size))
            }
        };
        framed.send(bytes).await?;
        *stream = Some(framed);
        Ok(())
    }

    fn fail(&self) {
        self.metrics.message_send_failures.inc();
        self.metrics.unresponsive_peers.inc();
        self.connect_events.mark_unresponsive(&self.peer);
    }
}
