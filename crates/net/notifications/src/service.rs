//! Entry point tying a transport backend to the notification protocol.

use std::{collections::HashMap, sync::Arc};

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tracing::{debug, trace, warn};
use vertex_net_peer_score::ReputationGate;
use vertex_net_transport::{
    Direction, InboundSubstream, PeerId, ProtocolName, TransportBackend, TransportError,
};

use crate::{
    HandshakeEngine, HandshakeValidator, NotificationError, NotificationMetrics, ProtocolConfig,
    manager::{PeerConnectionManager, RejectReason},
    substream::{
        Outbound, SubstreamHandle, SubstreamKey, SubstreamShared, SubstreamState, spawn_substream,
    },
};

/// Inbound substreams that completed the handshake but were not yet taken by
/// [`NotificationService::accept`].
const READY_QUEUE_SIZE: usize = 64;

struct RegisteredProtocol {
    config: ProtocolConfig,
    /// Sent on inbound substreams.
    handshake: RwLock<Bytes>,
    validator: Option<Arc<dyn HandshakeValidator>>,
    metrics: NotificationMetrics,
}

struct Shared<B> {
    backend: B,
    manager: PeerConnectionManager,
    /// Keyed by main and fallback names.
    protocols: RwLock<HashMap<ProtocolName, Arc<RegisteredProtocol>>>,
}

struct ServiceInner<B> {
    shared: Arc<Shared<B>>,
    ready: Mutex<mpsc::Receiver<SubstreamHandle>>,
    accept_task: JoinHandle<()>,
}

impl<B> Drop for ServiceInner<B> {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

/// Opens and accepts notification substreams over a [`TransportBackend`].
///
/// Cheap to clone. Dropping the last clone stops accepting inbound substreams;
/// substreams already handed out keep running until closed.
pub struct NotificationService<B: TransportBackend> {
    inner: Arc<ServiceInner<B>>,
}

impl<B: TransportBackend> Clone for NotificationService<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: TransportBackend> NotificationService<B> {
    /// Creates the service and starts accepting inbound substreams.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(backend: B, gate: impl ReputationGate) -> Self {
        Self::with_manager(backend, PeerConnectionManager::new(gate))
    }

    pub fn with_manager(backend: B, manager: PeerConnectionManager) -> Self {
        let shared = Arc::new(Shared {
            backend,
            manager,
            protocols: RwLock::new(HashMap::new()),
        });
        let (ready_tx, ready_rx) = mpsc::channel(READY_QUEUE_SIZE);
        let accept_task = tokio::spawn(accept_loop(Arc::clone(&shared), ready_tx));

        Self {
            inner: Arc::new(ServiceInner {
                shared,
                ready: Mutex::new(ready_rx),
                accept_task,
            }),
        }
    }

    /// Registers a protocol and starts listening on all of its names.
    pub async fn register_protocol(&self, config: ProtocolConfig) -> Result<(), NotificationError> {
        self.inner.shared.register(config, None).await
    }

    /// Like [`register_protocol`](Self::register_protocol), with a validator for
    /// inbound handshakes.
    pub async fn register_protocol_with_validator(
        &self,
        config: ProtocolConfig,
        validator: impl HandshakeValidator,
    ) -> Result<(), NotificationError> {
        self.inner.shared.register(config, Some(Arc::new(validator))).await
    }

    /// Replaces the handshake sent on future inbound substreams of `protocol`.
    pub fn set_handshake(
        &self,
        protocol: &ProtocolName,
        handshake: impl Into<Bytes>,
    ) -> Result<(), NotificationError> {
        let registered = self.inner.shared.lookup(protocol)?;
        let handshake = handshake.into();
        registered.config.check_handshake(&handshake)?;
        *registered.handshake.write() = handshake;
        Ok(())
    }

    /// Opens an outbound substream to `peer` and exchanges handshakes.
    ///
    /// Fails with [`NotificationError::TransportClosed`] after [`shutdown`](Self::shutdown).
    /// Fails with [`NotificationError::Banned`] before any transport I/O if the
    /// reputation gate reports the peer as banned. If the peer does not speak the
    /// main protocol name, the fallback names are tried in order.
    pub async fn open(
        &self,
        peer: PeerId,
        protocol: &ProtocolName,
        handshake: impl Into<Bytes>,
    ) -> Result<SubstreamHandle, NotificationError> {
        let shared = &self.inner.shared;
        if shared.manager.is_shut_down() {
            return Err(NotificationError::TransportClosed);
        }
        let registered = shared.lookup(protocol)?;
        let handshake = handshake.into();
        registered.config.check_handshake(&handshake)?;

        if shared.manager.is_banned(&peer) {
            debug!(target: "notifications::service", %peer, %protocol, "Refusing to open substream to banned peer");
            return Err(NotificationError::Banned(peer));
        }

        let (substream, outbound) = shared.new_substream(peer, &registered, Direction::Outbound);
        let result = async {
            let (negotiated, io) = shared.open_transport(peer, &registered.config).await?;
            shared
                .establish(&substream, outbound, &registered, negotiated, io, handshake)
                .await
        }
        .await;

        if let Err(error) = &result {
            debug!(target: "notifications::service", %peer, %protocol, %error, "Failed to open substream");
            abandon(&substream, error);
        }
        result
    }

    /// Waits for the next inbound substream that completed its handshake.
    ///
    /// Returns [`NotificationError::TransportClosed`] once the backend has shut down.
    pub async fn accept(&self) -> Result<SubstreamHandle, NotificationError> {
        self.inner
            .ready
            .lock()
            .await
            .recv()
            .await
            .ok_or(NotificationError::TransportClosed)
    }

    pub async fn disconnect_peer(&self, peer: &PeerId) {
        self.manager().disconnect_peer(peer).await
    }

    /// Fails every substream of `peer`. Record the ban in the reputation gate as
    /// well to refuse new ones.
    pub async fn ban_peer(&self, peer: &PeerId) {
        self.manager().ban_peer(peer).await
    }

    pub fn manager(&self) -> &PeerConnectionManager {
        &self.inner.shared.manager
    }

    pub fn backend(&self) -> &B {
        &self.inner.shared.backend
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.backend().local_peer_id()
    }

    /// Stops accepting inbound substreams, closes every open one and refuses
    /// new ones.
    pub async fn shutdown(&self) {
        self.inner.accept_task.abort();
        self.manager().shutdown().await;
    }
}

impl<B: TransportBackend> Shared<B> {
    fn lookup(&self, protocol: &ProtocolName) -> Result<Arc<RegisteredProtocol>, NotificationError> {
        self.protocols
            .read()
            .get(protocol)
            .cloned()
            .ok_or_else(|| NotificationError::UnknownProtocol(protocol.clone()))
    }

    async fn register(
        &self,
        config: ProtocolConfig,
        validator: Option<Arc<dyn HandshakeValidator>>,
    ) -> Result<(), NotificationError> {
        config.validate()?;

        let registered = Arc::new(RegisteredProtocol {
            handshake: RwLock::new(Bytes::from(config.handshake.clone())),
            validator,
            metrics: NotificationMetrics::new(&config.name, self.backend.name()),
            config,
        });
        let names: Vec<ProtocolName> = registered.config.names().cloned().collect();

        {
            let mut protocols = self.protocols.write();
            if let Some(name) = names.iter().find(|name| protocols.contains_key(*name)) {
                return Err(NotificationError::AlreadyRegistered(name.clone()));
            }
            for name in &names {
                protocols.insert(name.clone(), Arc::clone(&registered));
            }
        }

        for name in &names {
            if let Err(error) = self.backend.listen(name.clone()).await {
                let mut protocols = self.protocols.write();
                for name in &names {
                    protocols.remove(name);
                }
                return Err(error.into());
            }
        }

        debug!(target: "notifications::service", protocol = %registered.config.name, fallbacks = registered.config.fallback_names.len(), backend = self.backend.name(), "Registered protocol");
        Ok(())
    }

    fn new_substream(
        &self,
        peer: PeerId,
        registered: &RegisteredProtocol,
        direction: Direction,
    ) -> (Arc<SubstreamShared>, mpsc::UnboundedReceiver<Outbound>) {
        let key = SubstreamKey {
            peer,
            protocol: registered.config.name.clone(),
            direction,
        };
        SubstreamShared::new(
            self.manager.next_id(),
            key,
            registered.config.credit_window,
            registered.config.max_notification_size,
            registered.metrics.clone(),
            self.manager.downgrade(),
        )
    }

    /// Opens a transport substream, trying fallback names on `UnsupportedProtocol`.
    async fn open_transport(
        &self,
        peer: PeerId,
        config: &ProtocolConfig,
    ) -> Result<(ProtocolName, B::Substream), NotificationError> {
        let negotiate = async {
            let mut unsupported = None;
            for name in config.names() {
                match self.backend.open(peer, name).await {
                    Ok(io) => return Ok((name.clone(), io)),
                    Err(TransportError::UnsupportedProtocol(rejected)) => {
                        trace!(target: "notifications::service", %peer, protocol = %rejected, "Protocol not supported, trying next name");
                        unsupported = Some(rejected);
                    }
                    Err(error) => return Err(NotificationError::from(error)),
                }
            }
            Err(NotificationError::UnsupportedProtocol(
                unsupported.unwrap_or_else(|| config.name.clone()),
            ))
        };

        tokio::time::timeout(config.open_timeout, negotiate)
            .await
            .map_err(|_| NotificationError::Timeout)?
    }

    /// Runs the handshake, registers the substream with the manager and starts
    /// its driver.
    async fn establish(
        &self,
        substream: &Arc<SubstreamShared>,
        outbound: mpsc::UnboundedReceiver<Outbound>,
        registered: &RegisteredProtocol,
        negotiated: ProtocolName,
        mut io: B::Substream,
        local: Bytes,
    ) -> Result<SubstreamHandle, NotificationError> {
        let config = &registered.config;
        let key = substream.key();
        substream.transition(SubstreamState::Handshaking);
        let _handshaking = self.manager.begin_handshake(key);

        let mut engine = HandshakeEngine::new(
            key.direction,
            config.handshake_policy,
            config.max_handshake_size,
            local,
        )
        .with_validator(registered.validator.clone());

        let remote = match engine.run(&mut io, &key.peer, config.handshake_timeout).await {
            Ok(remote) => remote,
            Err(error) => {
                registered.metrics.handshake_failure();
                return Err(error.into());
            }
        };

        self.manager.activate(substream).await?;

        Ok(spawn_substream(
            Arc::clone(substream),
            io,
            outbound,
            config.inbound_buffer,
            config.close_timeout,
            negotiated,
            remote,
        ))
    }

    async fn handle_inbound(
        self: Arc<Self>,
        inbound: InboundSubstream<B::Substream>,
        ready: mpsc::Sender<SubstreamHandle>,
    ) {
        let InboundSubstream {
            peer,
            protocol: negotiated,
            substream: io,
        } = inbound;

        let registered = match self.lookup(&negotiated) {
            Ok(registered) => registered,
            Err(_) => {
                self.manager
                    .reject_inbound(peer, &negotiated, RejectReason::UnknownProtocol, None);
                NotificationMetrics::unknown_protocol_rejected(self.backend.name());
                return;
            }
        };

        // A banned peer's substream is dropped here, before any handshake byte.
        if self
            .manager
            .admit_inbound(peer, &registered.config.name, &registered.metrics)
            .is_err()
        {
            return;
        }

        let (substream, outbound) = self.new_substream(peer, &registered, Direction::Inbound);
        let local = registered.handshake.read().clone();
        match self
            .establish(&substream, outbound, &registered, negotiated, io, local)
            .await
        {
            Ok(handle) => {
                if ready.send(handle).await.is_err() {
                    trace!(target: "notifications::service", %peer, "Service dropped, discarding inbound substream");
                }
            }
            Err(error) => {
                if matches!(error, NotificationError::HandshakeFailed(_)) {
                    self.manager.reject_inbound(
                        peer,
                        &registered.config.name,
                        RejectReason::Handshake,
                        Some(&registered.metrics),
                    );
                }
                abandon(&substream, &error);
            }
        }
    }
}

/// Settles a substream that never reached its driver.
fn abandon(substream: &SubstreamShared, error: &NotificationError) {
    substream.fail(error.clone());
    substream.finish();
}

async fn accept_loop<B: TransportBackend>(
    shared: Arc<Shared<B>>,
    ready: mpsc::Sender<SubstreamHandle>,
) {
    loop {
        match shared.backend.accept().await {
            Ok(inbound) => {
                trace!(target: "notifications::service", peer = %inbound.peer, protocol = %inbound.protocol, "Inbound substream");
                tokio::spawn(Arc::clone(&shared).handle_inbound(inbound, ready.clone()));
            }
            Err(TransportError::TransportClosed) => {
                debug!(target: "notifications::service", backend = shared.backend.name(), "Backend closed, no longer accepting");
                return;
            }
            Err(error) => {
                warn!(target: "notifications::service", backend = shared.backend.name(), %error, "Failed to accept substream");
            }
        }
    }
}
