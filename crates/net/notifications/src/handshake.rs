//! One-time handshake exchange at the start of every substream.
//!
//! Each side sends exactly one length-prefixed handshake message and reads
//! exactly one from the remote. The order depends on [`HandshakePolicy`]:
//!
//! - `DialerFirst`: the outbound side writes, then reads; the inbound side reads,
//!   validates, then writes.
//! - `Concurrent`: both sides write immediately, then read.
//!
//! Frames are read with [`read_frame`], which never consumes bytes past the end of
//! the handshake, so the stream can be handed to the notification framer intact.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use futures::{AsyncRead, AsyncWrite};
use tracing::{debug, trace};
use vertex_net_codec::{read_frame, write_frame};
use vertex_net_transport::{Direction, PeerId};

use crate::{HandshakeError, HandshakePolicy};

/// Progress of a handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    /// Outbound: our handshake is written, waiting for the remote's.
    SentLocal,
    /// Inbound: the remote's handshake is read, ours is still to be written.
    AwaitingLocal,
    Open,
    Failed,
}

/// Verdict on an inbound handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationResult {
    Accept,
    Reject,
}

/// Decides whether to accept a remote peer's handshake on an inbound substream.
pub trait HandshakeValidator: Send + Sync + 'static {
    fn validate(&self, peer: &PeerId, handshake: &[u8]) -> ValidationResult;
}

impl<F> HandshakeValidator for F
where
    F: Fn(&PeerId, &[u8]) -> ValidationResult + Send + Sync + 'static,
{
    fn validate(&self, peer: &PeerId, handshake: &[u8]) -> ValidationResult {
        self(peer, handshake)
    }
}

/// Runs the handshake for one substream.
pub struct HandshakeEngine {
    direction: Direction,
    policy: HandshakePolicy,
    max_size: usize,
    local: Bytes,
    validator: Option<Arc<dyn HandshakeValidator>>,
    state: HandshakeState,
}

impl HandshakeEngine {
    pub fn new(direction: Direction, policy: HandshakePolicy, max_size: usize, local: Bytes) -> Self {
        Self {
            direction,
            policy,
            max_size,
            local,
            validator: None,
            state: HandshakeState::Idle,
        }
    }

    /// Installs a validator. Only consulted on inbound substreams.
    pub fn with_validator(mut self, validator: Option<Arc<dyn HandshakeValidator>>) -> Self {
        self.validator = validator;
        self
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Exchanges handshakes over `io` and returns the remote's handshake.
    ///
    /// The whole exchange is bounded by `timeout`. On error the engine is left in
    /// [`HandshakeState::Failed`] and the substream must be dropped.
    pub async fn run<S>(
        &mut self,
        io: &mut S,
        peer: &PeerId,
        timeout: Duration,
    ) -> Result<Bytes, HandshakeError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if self.state != HandshakeState::Idle {
            return Err(HandshakeError::Malformed("handshake already ran".into()));
        }

        let result = match tokio::time::timeout(timeout, self.exchange(io, peer)).await {
            Ok(result) => result,
            Err(_) => Err(HandshakeError::Timeout),
        };

        match &result {
            Ok(remote) => {
                self.state = HandshakeState::Open;
                trace!(target: "notifications::handshake", %peer, direction = %self.direction, len = remote.len(), "Handshake complete");
            }
            Err(error) => {
                self.state = HandshakeState::Failed;
                debug!(target: "notifications::handshake", %peer, direction = %self.direction, %error, "Handshake failed");
            }
        }
        result
    }

    async fn exchange<S>(&mut self, io: &mut S, peer: &PeerId) -> Result<Bytes, HandshakeError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match (self.policy, self.direction) {
            (HandshakePolicy::DialerFirst, Direction::Outbound) => {
                self.send_local(io).await?;
                self.read_remote(io).await
            }
            (HandshakePolicy::DialerFirst, Direction::Inbound) => {
                let remote = self.read_remote(io).await?;
                self.validate(peer, &remote)?;
                self.send_local(io).await?;
                Ok(remote)
            }
            (HandshakePolicy::Concurrent, _) => {
                self.send_local(io).await?;
                let remote = self.read_remote(io).await?;
                self.validate(peer, &remote)?;
                Ok(remote)
            }
        }
    }

    async fn send_local<S>(&mut self, io: &mut S) -> Result<(), HandshakeError>
    where
        S: AsyncWrite + Unpin,
    {
        write_frame(io, &self.local, self.max_size).await?;
        if self.state == HandshakeState::Idle {
            self.state = HandshakeState::SentLocal;
        }
        Ok(())
    }

    async fn read_remote<S>(&mut self, io: &mut S) -> Result<Bytes, HandshakeError>
    where
        S: AsyncRead + Unpin,
    {
        // The remote closing before sending anything is a refusal.
        let remote = read_frame(io, self.max_size)
            .await?
            .ok_or(HandshakeError::Rejected)?;
        if self.state == HandshakeState::Idle {
            self.state = HandshakeState::AwaitingLocal;
        }
        Ok(remote)
    }

    fn validate(&self, peer: &PeerId, remote: &[u8]) -> Result<(), HandshakeError> {
        if !self.direction.is_inbound() {
            return Ok(());
        }
        match self.validator.as_ref().map(|v| v.validate(peer, remote)) {
            Some(ValidationResult::Reject) => Err(HandshakeError::Rejected),
            Some(ValidationResult::Accept) | None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use futures::{AsyncReadExt, AsyncWriteExt};

    use self::pipe::duplex;

    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn engine(direction: Direction, policy: HandshakePolicy, local: &'static [u8]) -> HandshakeEngine {
        HandshakeEngine::new(direction, policy, 64, Bytes::from_static(local))
    }

    #[tokio::test]
    async fn test_dialer_first_round_trip() {
        let (mut a, mut b) = duplex();
        let peer = PeerId::random();

        let mut outbound = engine(Direction::Outbound, HandshakePolicy::DialerFirst, b"hello");
        let mut inbound = engine(Direction::Inbound, HandshakePolicy::DialerFirst, b"world");

        let (out, inb) = tokio::join!(
            outbound.run(&mut a, &peer, TIMEOUT),
            inbound.run(&mut b, &peer, TIMEOUT),
        );
        assert_eq!(out.unwrap(), &b"world"[..]);
        assert_eq!(inb.unwrap(), &b"hello"[..]);
        assert_eq!(outbound.state(), HandshakeState::Open);
        assert_eq!(inbound.state(), HandshakeState::Open);
    }

    #[tokio::test]
    async fn test_concurrent_round_trip() {
        let (mut a, mut b) = duplex();
        let peer = PeerId::random();

        let mut left = engine(Direction::Outbound, HandshakePolicy::Concurrent, b"left");
        let mut right = engine(Direction::Inbound, HandshakePolicy::Concurrent, b"right");

        let (l, r) = tokio::join!(
            left.run(&mut a, &peer, TIMEOUT),
            right.run(&mut b, &peer, TIMEOUT),
        );
        assert_eq!(l.unwrap(), &b"right"[..]);
        assert_eq!(r.unwrap(), &b"left"[..]);
    }

    #[tokio::test]
    async fn test_empty_handshakes() {
        let (mut a, mut b) = duplex();
        let peer = PeerId::random();

        let mut outbound = engine(Direction::Outbound, HandshakePolicy::DialerFirst, b"");
        let mut inbound = engine(Direction::Inbound, HandshakePolicy::DialerFirst, b"");

        let (out, inb) = tokio::join!(
            outbound.run(&mut a, &peer, TIMEOUT),
            inbound.run(&mut b, &peer, TIMEOUT),
        );
        assert!(out.unwrap().is_empty());
        assert!(inb.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_post_handshake_bytes_left_in_stream() {
        let (mut a, mut b) = duplex();
        let peer = PeerId::random();

        let mut outbound = engine(Direction::Outbound, HandshakePolicy::DialerFirst, b"hs");
        let remote = async {
            let mut hs = [0u8; 6];
            b.read_exact(&mut hs).await.unwrap();
            // reply and immediately follow with application bytes
            b.write_all(&[0, 0, 0, 2, b'o', b'k', 9, 9]).await.unwrap();
            b
        };

        let (result, _b) = tokio::join!(outbound.run(&mut a, &peer, TIMEOUT), remote);
        assert_eq!(result.unwrap(), &b"ok"[..]);

        let mut rest = [0u8; 2];
        a.read_exact(&mut rest).await.unwrap();
        assert_eq!(rest, [9, 9]);
    }

    #[tokio::test]
    async fn test_oversized_remote_handshake() {
        let (mut a, mut b) = duplex();
        let peer = PeerId::random();

        b.write_all(&[0, 0, 1, 0]).await.unwrap();
        let mut inbound = engine(Direction::Inbound, HandshakePolicy::DialerFirst, b"x");

        let err = inbound.run(&mut a, &peer, TIMEOUT).await.unwrap_err();
        assert_matches!(err, HandshakeError::Oversized { size: 256, max: 64 });
        assert_eq!(inbound.state(), HandshakeState::Failed);
    }

    #[tokio::test]
    async fn test_truncated_remote_handshake_is_malformed() {
        let (mut a, mut b) = duplex();
        let peer = PeerId::random();

        b.write_all(&[0, 0, 0, 8, 1, 2]).await.unwrap();
        b.close().await.unwrap();
        drop(b);

        let mut inbound = engine(Direction::Inbound, HandshakePolicy::DialerFirst, b"x");
        let err = inbound.run(&mut a, &peer, TIMEOUT).await.unwrap_err();
        assert_matches!(err, HandshakeError::Malformed(_));
    }

    #[tokio::test]
    async fn test_remote_closes_before_handshake_is_rejected() {
        let (mut a, b) = duplex();
        let peer = PeerId::random();
        drop(b);

        let mut inbound = engine(Direction::Inbound, HandshakePolicy::DialerFirst, b"x");
        let err = inbound.run(&mut a, &peer, TIMEOUT).await.unwrap_err();
        assert_matches!(err, HandshakeError::Rejected);
    }

    #[tokio::test]
    async fn test_silent_remote_times_out() {
        let (mut a, _b) = duplex();
        let peer = PeerId::random();

        let mut outbound = engine(Direction::Outbound, HandshakePolicy::DialerFirst, b"x");
        let err = outbound
            .run(&mut a, &peer, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_matches!(err, HandshakeError::Timeout);
        assert_eq!(outbound.state(), HandshakeState::Failed);
    }

    #[tokio::test]
    async fn test_validator_rejects_before_local_handshake_sent() {
        let (mut a, mut b) = duplex();
        let peer = PeerId::random();

        let validator: Arc<dyn HandshakeValidator> =
            Arc::new(|_: &PeerId, hs: &[u8]| match hs {
                b"friend" => ValidationResult::Accept,
                _ => ValidationResult::Reject,
            });
        let mut inbound = engine(Direction::Inbound, HandshakePolicy::DialerFirst, b"local")
            .with_validator(Some(validator));

        b.write_all(&[0, 0, 0, 3, b'f', b'o', b'e']).await.unwrap();
        let err = inbound.run(&mut a, &peer, TIMEOUT).await.unwrap_err();
        assert_matches!(err, HandshakeError::Rejected);

        drop(a);
        let mut rest = Vec::new();
        b.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    /// futures-io duplex pipe over `tokio::io::duplex`.
    mod pipe {
        use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};

        pub(super) fn duplex() -> (Compat<tokio::io::DuplexStream>, Compat<tokio::io::DuplexStream>) {
            let (a, b) = tokio::io::duplex(1024);
            (a.compat(), b.compat())
        }
    }
}
