//! libp2p transport backend.
//!
//! Runs a TCP + Noise + Yamux swarm whose only behaviour is `libp2p-stream`.
//! The swarm is driven by a dedicated tokio task and controlled through a
//! command channel; substreams are opened and accepted through a
//! [`libp2p_stream::Control`] which talks to the behaviour directly.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use futures::StreamExt;
use libp2p::{
    Multiaddr, PeerId, StreamProtocol, Swarm, SwarmBuilder,
    core::transport::ListenerId,
    identity::Keypair,
    noise,
    swarm::{ConnectionId, SwarmEvent, dial_opts::DialOpts},
    tcp, yamux,
};
use libp2p_stream::OpenStreamError;
use parking_lot::Mutex;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info, trace, warn};

use crate::{InboundSubstream, ProtocolName, TransportBackend, TransportError};

const COMMAND_BUFFER: usize = 32;
const INBOUND_BUFFER: usize = 64;

/// Configuration for [`Libp2pBackend`].
#[derive(Debug, Clone)]
pub struct Libp2pConfig {
    /// Node identity. A fresh ed25519 key is generated when unset.
    pub keypair: Option<Keypair>,
    /// How long a connection without open substreams is kept alive.
    pub idle_connection_timeout: Duration,
}

impl Default for Libp2pConfig {
    fn default() -> Self {
        Self {
            keypair: None,
            idle_connection_timeout: Duration::from_secs(60),
        }
    }
}

impl Libp2pConfig {
    pub fn with_keypair(mut self, keypair: Keypair) -> Self {
        self.keypair = Some(keypair);
        self
    }

    pub fn with_idle_connection_timeout(mut self, timeout: Duration) -> Self {
        self.idle_connection_timeout = timeout;
        self
    }
}

enum SwarmCommand {
    ListenOn {
        addr: Multiaddr,
        reply: oneshot::Sender<Result<Multiaddr, TransportError>>,
    },
    Dial {
        addr: Multiaddr,
        reply: oneshot::Sender<Result<PeerId, TransportError>>,
    },
}

type Libp2pInbound = InboundSubstream<libp2p::Stream>;

/// Transport backend over a libp2p swarm.
pub struct Libp2pBackend {
    local_peer_id: PeerId,
    control: Mutex<libp2p_stream::Control>,
    commands: mpsc::Sender<SwarmCommand>,
    inbound_tx: mpsc::Sender<Libp2pInbound>,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<Libp2pInbound>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Libp2pBackend {
    /// Builds the swarm and spawns its driver on the current tokio runtime.
    pub fn spawn(config: Libp2pConfig) -> Result<Self, TransportError> {
        let keypair = config.keypair.unwrap_or_else(Keypair::generate_ed25519);
        let local_peer_id = keypair.public().to_peer_id();

        let behaviour = libp2p_stream::Behaviour::new();
        let control = behaviour.new_control();

        let swarm = SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_tcp(
                tcp::Config::default(),
                noise::Config::new,
                yamux::Config::default,
            )
            .map_err(|e| TransportError::Setup(e.to_string()))?
            .with_behaviour(|_| behaviour)
            .map_err(|e| TransportError::Setup(e.to_string()))?
            .with_swarm_config(|c| c.with_idle_connection_timeout(config.idle_connection_timeout))
            .build();

        let (commands, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);

        let driver = tokio::spawn(run_swarm(swarm, command_rx));
        info!(target: "transport::libp2p", peer = %local_peer_id, "Swarm started");

        Ok(Self {
            local_peer_id,
            control: Mutex::new(control),
            commands,
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            tasks: Mutex::new(vec![driver]),
        })
    }

    /// Starts listening on `addr` and returns the bound address.
    pub async fn listen_on(&self, addr: Multiaddr) -> Result<Multiaddr, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.command(SwarmCommand::ListenOn { addr, reply }).await?;
        rx.await.map_err(|_| TransportError::TransportClosed)?
    }

    /// Connects to `addr` and returns the remote peer id once the connection is up.
    pub async fn dial(&self, addr: Multiaddr) -> Result<PeerId, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.command(SwarmCommand::Dial { addr, reply }).await?;
        rx.await.map_err(|_| TransportError::TransportClosed)?
    }

    async fn command(&self, command: SwarmCommand) -> Result<(), TransportError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| TransportError::TransportClosed)
    }
}

impl Drop for Libp2pBackend {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

fn stream_protocol(protocol: &ProtocolName) -> Result<StreamProtocol, TransportError> {
    StreamProtocol::try_from_owned(protocol.to_string())
        .map_err(|_| TransportError::UnsupportedProtocol(protocol.clone()))
}

#[async_trait]
impl TransportBackend for Libp2pBackend {
    type Substream = libp2p::Stream;

    fn name(&self) -> &'static str {
        "libp2p"
    }

    fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    async fn listen(&self, protocol: ProtocolName) -> Result<(), TransportError> {
        let mut incoming = self
            .control
            .lock()
            .accept(stream_protocol(&protocol)?)
            .map_err(|_| TransportError::AlreadyListening(protocol.clone()))?;

        let tx = self.inbound_tx.clone();
        let name = protocol.clone();
        let forwarder = tokio::spawn(async move {
            while let Some((peer, substream)) = incoming.next().await {
                trace!(target: "transport::libp2p", %peer, protocol = %name, "Inbound substream");
                let inbound = InboundSubstream {
                    peer,
                    protocol: name.clone(),
                    substream,
                };
                if tx.send(inbound).await.is_err() {
                    break;
                }
            }
        });
        self.tasks.lock().push(forwarder);

        debug!(target: "transport::libp2p", %protocol, "Listening");
        Ok(())
    }

    async fn open(
        &self,
        peer: PeerId,
        protocol: &ProtocolName,
    ) -> Result<Self::Substream, TransportError> {
        let stream_protocol = stream_protocol(protocol)?;
        let mut control = self.control.lock().clone();

        control
            .open_stream(peer, stream_protocol)
            .await
            .map_err(|error| match error {
                OpenStreamError::UnsupportedProtocol(_) => {
                    TransportError::UnsupportedProtocol(protocol.clone())
                }
                OpenStreamError::Io(e) => TransportError::Unreachable(format!("{peer}: {e}")),
                other => TransportError::Unreachable(format!("{peer}: {other}")),
            })
    }

    async fn accept(&self) -> Result<InboundSubstream<Self::Substream>, TransportError> {
        self.inbound_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::TransportClosed)
    }
}

async fn run_swarm(
    mut swarm: Swarm<libp2p_stream::Behaviour>,
    mut commands: mpsc::Receiver<SwarmCommand>,
) {
    let local_peer_id = *swarm.local_peer_id();
    let mut pending_listens: HashMap<ListenerId, oneshot::Sender<Result<Multiaddr, TransportError>>> =
        HashMap::new();
    let mut pending_dials: HashMap<ConnectionId, oneshot::Sender<Result<PeerId, TransportError>>> =
        HashMap::new();

    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else { break };
                match command {
                    SwarmCommand::ListenOn { addr, reply } => match swarm.listen_on(addr) {
                        Ok(id) => {
                            pending_listens.insert(id, reply);
                        }
                        Err(e) => {
                            let _ = reply.send(Err(TransportError::Setup(e.to_string())));
                        }
                    },
                    SwarmCommand::Dial { addr, reply } => {
                        let opts = DialOpts::unknown_peer_id().address(addr).build();
                        let id = opts.connection_id();
                        match swarm.dial(opts) {
                            Ok(()) => {
                                pending_dials.insert(id, reply);
                            }
                            Err(e) => {
                                let _ = reply.send(Err(TransportError::Unreachable(e.to_string())));
                            }
                        }
                    }
                }
            }
            event = swarm.select_next_some() => match event {
                SwarmEvent::NewListenAddr { listener_id, address } => {
                    info!(target: "transport::libp2p", peer = %local_peer_id, %address, "Listening on");
                    if let Some(reply) = pending_listens.remove(&listener_id) {
                        let _ = reply.send(Ok(address));
                    }
                }
                SwarmEvent::ConnectionEstablished { peer_id, connection_id, .. } => {
                    debug!(target: "transport::libp2p", peer = %peer_id, "Connection established");
                    if let Some(reply) = pending_dials.remove(&connection_id) {
                        let _ = reply.send(Ok(peer_id));
                    }
                }
                SwarmEvent::OutgoingConnectionError { connection_id, peer_id, error } => {
                    warn!(target: "transport::libp2p", ?peer_id, %error, "Outgoing connection failed");
                    if let Some(reply) = pending_dials.remove(&connection_id) {
                        let _ = reply.send(Err(TransportError::Unreachable(error.to_string())));
                    }
                }
                SwarmEvent::ListenerError { listener_id, error } => {
                    warn!(target: "transport::libp2p", %error, "Listener error");
                    if let Some(reply) = pending_listens.remove(&listener_id) {
                        let _ = reply.send(Err(TransportError::Setup(error.to_string())));
                    }
                }
                SwarmEvent::ConnectionClosed { peer_id, cause, .. } => {
                    debug!(target: "transport::libp2p", peer = %peer_id, ?cause, "Connection closed");
                }
                other => trace!(target: "transport::libp2p", event = ?other, "Swarm event"),
            }
        }
    }

    debug!(target: "transport::libp2p", peer = %local_peer_id, "Swarm stopped");
}
