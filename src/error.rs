//! The error types used throughout the engine.
//!
//! Errors are scoped: most variants are fatal only to the peer session that
//! raised them, while [`Error::Storage`] and persistent tracker failures
//! abort the whole engine.

use std::io;

use thiserror::Error;

use crate::PieceIndex;

/// The result type used by all fallible engine operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The bencoded metainfo could not be decoded. Fatal to the caller.
    #[error("invalid metainfo: {0}")]
    Bencode(#[from] serde_bencode::Error),

    /// The metainfo decoded but describes an impossible torrent.
    #[error("invalid metainfo: {0}")]
    InvalidMetainfo(&'static str),

    /// The peer's handshake was malformed or advertised the wrong torrent.
    /// Fatal to the session only.
    #[error("handshake error: {0}")]
    Handshake(&'static str),

    /// The peer violated the wire protocol. Fatal to the session only.
    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    /// No traffic was received from the peer within the allowed window, or
    /// the connection attempt ran out of time.
    #[error("peer timed out")]
    Timeout,

    /// A piece index outside the torrent was used.
    #[error("invalid piece index {0}")]
    InvalidPieceIndex(PieceIndex),

    /// Network level failure of a peer connection.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// Disk read or write failure. Fatal to the whole engine.
    #[error("storage error: {0}")]
    Storage(#[source] io::Error),

    /// Reported by the tracker collaborator.
    #[error(transparent)]
    Tracker(#[from] TrackerError),

    /// An internal channel was closed while sending, meaning the task on its
    /// other end has shut down.
    #[error("channel closed")]
    Channel,
}

/// Errors reported by the tracker collaborator.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TrackerError {
    /// The announce request itself failed. Usually transient.
    #[error("announce request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The tracker answered with a `failure reason`.
    #[error("tracker failure: {0}")]
    Failure(String),

    /// The tracker's response was not a valid bencoded announce response.
    #[error("unexpected tracker response: {0}")]
    UnexpectedResponse(#[from] serde_bencode::Error),

    /// The compact peer list was not a multiple of 6 bytes.
    #[error("malformed compact peer list")]
    InvalidPeerList,

    /// The tracker could not be reached repeatedly and no peers are known.
    #[error("tracker gave no usable response after {0} attempts")]
    Unreachable(usize),
}

impl From<tokio::time::Elapsed> for Error {
    fn from(_: tokio::time::Elapsed) -> Self {
        Self::Timeout
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::Channel
    }
}
