//! Transport backend abstraction for notification substreams.
//!
//! A [`TransportBackend`] knows how to open and accept raw, bidirectional byte
//! substreams to remote peers for a named protocol. It does no framing and no
//! flow control; those live in the notification layer above.
//!
//! Two backends are provided:
//!
//! - [`memory::MemoryNetwork`]: in-process duplex pipes, used by tests and local
//!   benchmarks.
//! - [`swarm::Libp2pBackend`]: a TCP + Noise + Yamux libp2p swarm with substreams
//!   served by `libp2p-stream`.

mod backend;
mod error;
pub mod memory;
mod protocol;
pub mod swarm;

pub use backend::{InboundSubstream, TransportBackend};
pub use error::TransportError;
pub use libp2p::PeerId;
pub use protocol::{Direction, ProtocolName};
