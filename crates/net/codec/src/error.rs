use std::sync::Arc;

/// Errors produced while encoding or decoding frames.
///
/// I/O errors are kept behind an `Arc` so a single failure can be reported to
/// every caller waiting on the same substream.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FrameError {
    #[error("frame of {size} bytes exceeds limit of {max} bytes")]
    Oversized { size: usize, max: usize },

    #[error("stream ended inside a frame ({buffered} bytes buffered)")]
    Truncated { buffered: usize },

    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),
}

impl FrameError {
    /// Whether the remote side sent bytes that violate the framing rules.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::Oversized { .. } | Self::Truncated { .. })
    }
}

impl From<std::io::Error> for FrameError {
    fn from(error: std::io::Error) -> Self {
        FrameError::Io(Arc::new(error))
    }
}
