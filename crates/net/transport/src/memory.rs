//! In-process transport backed by `tokio::io::duplex` pipes.
//!
//! A [`MemoryNetwork`] is a hub that endpoints register with. Opening a
//! substream creates a duplex pipe and hands one half to the remote endpoint's
//! accept queue. The pipe capacity bounds how many bytes can sit unread in
//! either direction, which makes transport-level backpressure observable in
//! tests.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use libp2p::PeerId;
use parking_lot::Mutex;
use tokio::{io::DuplexStream, sync::mpsc};
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use tracing::{debug, trace};

use crate::{InboundSubstream, ProtocolName, TransportBackend, TransportError};

/// Default per-direction capacity of a pipe, in bytes.
pub const DEFAULT_PIPE_CAPACITY: usize = 64 * 1024;

/// Depth of each endpoint's queue of substreams waiting to be accepted.
const ACCEPT_QUEUE: usize = 64;

/// Raw substream type produced by the memory backend.
pub type MemorySubstream = Compat<DuplexStream>;

struct Endpoint {
    generation: u64,
    protocols: HashSet<ProtocolName>,
    inbound: mpsc::Sender<InboundSubstream<MemorySubstream>>,
}

struct NetworkInner {
    pipe_capacity: usize,
    next_generation: AtomicU64,
    endpoints: Mutex<HashMap<PeerId, Endpoint>>,
}

/// Hub connecting in-process endpoints.
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::with_pipe_capacity(DEFAULT_PIPE_CAPACITY)
    }

    /// Creates a network whose pipes buffer at most `capacity` bytes per direction.
    pub fn with_pipe_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                pipe_capacity: capacity.max(1),
                next_generation: AtomicU64::new(0),
                endpoints: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn pipe_capacity(&self) -> usize {
        self.inner.pipe_capacity
    }

    /// Registers a new endpoint with a random peer id.
    pub fn endpoint(&self) -> MemoryBackend {
        self.endpoint_with_peer_id(PeerId::random())
    }

    /// Registers a new endpoint for `peer`, replacing any previous endpoint with that id.
    pub fn endpoint_with_peer_id(&self, peer: PeerId) -> MemoryBackend {
        let (tx, rx) = mpsc::channel(ACCEPT_QUEUE);
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let previous = self.inner.endpoints.lock().insert(
            peer,
            Endpoint {
                generation,
                protocols: HashSet::new(),
                inbound: tx,
            },
        );
        if previous.is_some() {
            debug!(target: "transport::memory", %peer, "Replaced existing endpoint");
        }

        MemoryBackend {
            peer,
            generation,
            network: self.clone(),
            inbound: tokio::sync::Mutex::new(rx),
        }
    }
}

/// One peer's view of a [`MemoryNetwork`].
pub struct MemoryBackend {
    peer: PeerId,
    generation: u64,
    network: MemoryNetwork,
    inbound: tokio::sync::Mutex<mpsc::Receiver<InboundSubstream<MemorySubstream>>>,
}

impl MemoryBackend {
    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }
}

impl Drop for MemoryBackend {
    fn drop(&mut self) {
        let mut endpoints = self.network.inner.endpoints.lock();
        // A newer endpoint may have taken over this peer id.
        if endpoints
            .get(&self.peer)
            .is_some_and(|endpoint| endpoint.generation == self.generation)
        {
            endpoints.remove(&self.peer);
        }
    }
}

#[async_trait]
impl TransportBackend for MemoryBackend {
    type Substream = MemorySubstream;

    fn name(&self) -> &'static str {
        "memory"
    }

    fn local_peer_id(&self) -> PeerId {
        self.peer
    }

    async fn listen(&self, protocol: ProtocolName) -> Result<(), TransportError> {
        let mut endpoints = self.network.inner.endpoints.lock();
        let endpoint = endpoints
            .get_mut(&self.peer)
            .ok_or(TransportError::TransportClosed)?;

        if !endpoint.protocols.insert(protocol.clone()) {
            return Err(TransportError::AlreadyListening(protocol));
        }
        debug!(target: "transport::memory", peer = %self.peer, %protocol, "Listening");
        Ok(())
    }

    async fn open(
        &self,
        peer: PeerId,
        protocol: &ProtocolName,
    ) -> Result<Self::Substream, TransportError> {
        let inbound = {
            let endpoints = self.network.inner.endpoints.lock();
            let endpoint = endpoints
                .get(&peer)
                .ok_or_else(|| TransportError::Unreachable(format!("no endpoint for {peer}")))?;
            if !endpoint.protocols.contains(protocol) {
                return Err(TransportError::UnsupportedProtocol(protocol.clone()));
            }
            endpoint.inbound.clone()
        };

        let (local, remote) = tokio::io::duplex(self.network.inner.pipe_capacity);
        inbound
            .send(InboundSubstream {
                peer: self.peer,
                protocol: protocol.clone(),
                substream: remote.compat(),
            })
            .await
            .map_err(|_| TransportError::TransportClosed)?;

        trace!(target: "transport::memory", %peer, %protocol, "Opened substream");
        Ok(local.compat())
    }

    async fn accept(&self) -> Result<InboundSubstream<Self::Substream>, TransportError> {
        self.inbound
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::TransportClosed)
    }
}
