use std::{io, sync::Arc};

use crate::ProtocolName;

/// Errors reported by transport backends.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("peer unreachable: {0}")]
    Unreachable(String),

    #[error("transport operation timed out")]
    Timeout,

    #[error("transport closed")]
    TransportClosed,

    #[error("protocol not supported: {0}")]
    UnsupportedProtocol(ProtocolName),

    #[error("already listening on {0}")]
    AlreadyListening(ProtocolName),

    #[error("operation would block")]
    WouldBlock,

    #[error("substream closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(Arc<io::Error>),

    #[error("transport setup failed: {0}")]
    Setup(String),
}

impl TransportError {
    /// Classifies a raw substream I/O error.
    pub fn from_io(error: io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::WouldBlock => Self::WouldBlock,
            io::ErrorKind::TimedOut => Self::Timeout,
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof => Self::Closed,
            _ => Self::Io(Arc::new(error)),
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(error: io::Error) -> Self {
        Self::from_io(error)
    }
}
