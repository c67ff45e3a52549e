use cid::Cid;
use thiserror::Error;

use crate::message::{BlockPresenceType, WantType};

/// Errors produced while decoding wire messages.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Error while reading from stream: {0}")]
    Read(#[from] std::io::Error),
    #[error("Error while decoding bitswap message: {0}")]
    Decode(#[from] postcard::Error),
    #[error("Error while parsing cid: {0}")]
    Cid(#[from] cid::Error),
    #[error("Error while parsing multihash: {0}")]
    Multihash(#[from] multihash::Error),
    #[error("Error while decoding varint: {0}")]
    Varint(#[from] unsigned_varint::decode::Error),
    #[error("Invalid block presence type {0}")]
    InvalidBlockPresenceType(#[from] num_enum::TryFromPrimitiveError<BlockPresenceType>),
    #[error("Invalid want type {0}")]
    InvalidWantType(#[from] num_enum::TryFromPrimitiveError<WantType>),
}

/// Failures reported by a [`crate::Transport`] or [`crate::Connection`].
#[derive(Debug, Error)]
pub enum TransportError {
    /// The remote does not speak the bitswap protocol.
    #[error("protocol not supported by peer")]
    NotSupported,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Outcome of a failed [`crate::network::MessageSender::send_message`].
#[derive(Debug, Error)]
pub enum SendError {
    /// The peer does not support the protocol, no retries were attempted.
    #[error("peer does not support the bitswap protocol")]
    NotSupported,
    /// All attempts failed.
    #[error("failed to send message after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: usize,
        last: TransportError,
    },
    /// The sender was shut down.
    #[error("message sender closed")]
    Closed,
    #[error("failed to encode message: {0}")]
    Encode(#[from] Error),
}

/// Why a block request ended without a block.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The caller's cancellation token fired, or its deadline passed.
    #[error("request for {0} cancelled")]
    Cancelled(Cid),
    /// The exchange is shutting down.
    #[error("bitswap client closed")]
    Closed,
    /// The client was reset while the request was running.
    #[error("request for {0} aborted by reset")]
    Reset(Cid),
    /// The local store failed.
    #[error("store: {0}")]
    Store(#[from] anyhow::Error),
}
