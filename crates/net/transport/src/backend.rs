use async_trait::async_trait;
use futures::{AsyncRead, AsyncWrite};
use libp2p::PeerId;

use crate::{ProtocolName, TransportError};

/// A substream opened by a remote peer.
#[derive(Debug)]
pub struct InboundSubstream<S> {
    pub peer: PeerId,
    pub protocol: ProtocolName,
    pub substream: S,
}

/// Source of raw byte substreams between peers.
///
/// Reads, writes and closes go through the substream's `AsyncRead` /
/// `AsyncWrite` implementation; errors from those can be classified with
/// [`TransportError::from_io`].
#[async_trait]
pub trait TransportBackend: Send + Sync + 'static {
    type Substream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Short label used in logs and metrics.
    fn name(&self) -> &'static str;

    fn local_peer_id(&self) -> PeerId;

    /// Starts accepting inbound substreams for `protocol`.
    async fn listen(&self, protocol: ProtocolName) -> Result<(), TransportError>;

    /// Opens a substream to `peer` speaking `protocol`.
    async fn open(
        &self,
        peer: PeerId,
        protocol: &ProtocolName,
    ) -> Result<Self::Substream, TransportError>;

    /// Waits for the next inbound substream on any listened protocol.
    ///
    /// Returns [`TransportError::TransportClosed`] once the backend has shut down.
    async fn accept(&self) -> Result<InboundSubstream<Self::Substream>, TransportError>;
}
