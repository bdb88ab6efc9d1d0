use std::{io, sync::Arc};

use vertex_net_codec::FrameError;
use vertex_net_transport::{PeerId, ProtocolName, TransportError};

use crate::ConfigError;

/// Failure of a single handshake exchange.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HandshakeError {
    #[error("handshake of {size} bytes exceeds limit of {max} bytes")]
    Oversized { size: usize, max: usize },

    #[error("malformed handshake: {0}")]
    Malformed(String),

    #[error("handshake timed out")]
    Timeout,

    #[error("handshake rejected")]
    Rejected,

    #[error("stream error during handshake: {0}")]
    Io(Arc<io::Error>),
}

impl From<FrameError> for HandshakeError {
    fn from(error: FrameError) -> Self {
        match error {
            FrameError::Oversized { size, max } => Self::Oversized { size, max },
            FrameError::Truncated { .. } => Self::Malformed(error.to_string()),
            FrameError::Io(e) => Self::Io(e),
        }
    }
}

/// Coarse classification of a [`NotificationError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The transport failed. Fatal to the substream.
    Transport,
    /// The remote broke the protocol. Fatal to the substream.
    ProtocolViolation,
    /// Flow control refused the operation. The substream is unaffected.
    FlowControl,
    /// Policy refused the peer before any I/O.
    Policy,
    /// The API was used in a way that cannot succeed.
    Usage,
}

/// Errors surfaced by the notification protocol.
///
/// Cloneable so that one substream failure can be reported to every pending
/// sender and receiver.
#[derive(Debug, Clone, thiserror::Error)]
pub enum NotificationError {
    #[error("peer {0} is banned")]
    Banned(PeerId),

    #[error("peer unreachable: {0}")]
    Unreachable(String),

    #[error("operation timed out")]
    Timeout,

    #[error("transport closed")]
    TransportClosed,

    #[error("protocol not supported by peer: {0}")]
    UnsupportedProtocol(ProtocolName),

    #[error("handshake failed: {0}")]
    HandshakeFailed(#[from] HandshakeError),

    #[error("substream closed")]
    Closed,

    #[error("timed out waiting for send credit")]
    BackpressureTimeout,

    #[error("no send credit available")]
    NoCredit,

    #[error("notification of {size} bytes exceeds limit of {max} bytes")]
    OversizedNotification { size: usize, max: usize },

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("IO error: {0}")]
    Io(Arc<io::Error>),

    #[error("unknown protocol: {0}")]
    UnknownProtocol(ProtocolName),

    #[error("protocol already registered: {0}")]
    AlreadyRegistered(ProtocolName),

    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
}

impl NotificationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unreachable(_)
            | Self::Timeout
            | Self::TransportClosed
            | Self::UnsupportedProtocol(_)
            | Self::Io(_) => ErrorKind::Transport,
            Self::HandshakeFailed(_) | Self::OversizedNotification { .. } | Self::Malformed(_) => {
                ErrorKind::ProtocolViolation
            }
            Self::BackpressureTimeout | Self::NoCredit => ErrorKind::FlowControl,
            Self::Banned(_) => ErrorKind::Policy,
            Self::Closed
            | Self::UnknownProtocol(_)
            | Self::AlreadyRegistered(_)
            | Self::InvalidConfig(_) => ErrorKind::Usage,
        }
    }

    /// Whether this error ends the substream it occurred on.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Transport | ErrorKind::ProtocolViolation
        )
    }
}

impl From<TransportError> for NotificationError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Unreachable(reason) => Self::Unreachable(reason),
            TransportError::Timeout => Self::Timeout,
            TransportError::TransportClosed | TransportError::Closed => Self::TransportClosed,
            TransportError::UnsupportedProtocol(protocol) => Self::UnsupportedProtocol(protocol),
            TransportError::AlreadyListening(protocol) => Self::AlreadyRegistered(protocol),
            TransportError::WouldBlock => Self::Io(Arc::new(io::ErrorKind::WouldBlock.into())),
            TransportError::Io(e) => Self::Io(e),
            TransportError::Setup(reason) => Self::Io(Arc::new(io::Error::other(reason))),
        }
    }
}

impl From<FrameError> for NotificationError {
    fn from(error: FrameError) -> Self {
        match error {
            FrameError::Oversized { size, max } => Self::OversizedNotification { size, max },
            FrameError::Truncated { .. } => Self::Malformed(error.to_string()),
            FrameError::Io(e) => match e.kind() {
                io::ErrorKind::BrokenPipe
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::NotConnected
                | io::ErrorKind::UnexpectedEof => Self::TransportClosed,
                _ => Self::Io(e),
            },
        }
    }
}
