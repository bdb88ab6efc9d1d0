//! Notification substreams between peers.
//!
//! A notification substream is a long-lived, one-protocol channel to a peer over
//! which either side sends discrete messages. Its life has three phases:
//!
//! 1. **Open**: a raw substream is opened or accepted through a
//!    [`TransportBackend`](vertex_net_transport::TransportBackend). Inbound
//!    substreams from banned peers are dropped here.
//! 2. **Handshake**: each side sends exactly one handshake message (see
//!    [`HandshakeEngine`]).
//! 3. **Notifications**: messages flow in both directions. Sending takes one unit
//!    of credit per message and credit returns only once the message is written,
//!    so a slow peer slows the sender instead of growing a backlog.
//!
//! [`NotificationService`] drives all three phases and hands out
//! [`SubstreamHandle`]s. [`PeerConnectionManager`] keeps at most one live
//! substream per (peer, protocol, direction).
//!
//! # Example
//!
//! ```ignore
//! let service = NotificationService::new(backend, reputations);
//! service.register_protocol(ProtocolConfig::new("/sup/tx/1")).await?;
//!
//! let mut substream = service.open(peer, &"/sup/tx/1".into(), b"hello".to_vec()).await?;
//! substream.send(notification).await?;
//! let reply = substream.receive().await?;
//! ```

mod config;
mod credit;
mod error;
mod handshake;
mod manager;
mod metrics;
mod service;
mod substream;

pub use config::{
    CLOSE_TIMEOUT, ConfigError, DEFAULT_MAX_HANDSHAKE_SIZE, DEFAULT_MAX_NOTIFICATION_SIZE,
    HANDSHAKE_TIMEOUT, HandshakePolicy, OPEN_TIMEOUT, ProtocolConfig,
};
pub use credit::{Credit, CreditPermit, CreditUnavailable};
pub use error::{ErrorKind, HandshakeError, NotificationError};
pub use handshake::{HandshakeEngine, HandshakeState, HandshakeValidator, ValidationResult};
pub use manager::{ManagerEvent, PeerConnectionManager, RejectReason};
pub use metrics::NotificationMetrics;
pub use service::NotificationService;
pub use substream::{
    NotificationReceiver, NotificationSender, SubstreamHandle, SubstreamId, SubstreamInfo,
    SubstreamKey, SubstreamState,
};
pub use vertex_net_peer_score::ReputationGate;
pub use vertex_net_transport::{Direction, PeerId, ProtocolName};
