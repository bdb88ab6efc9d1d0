//! Per-protocol configuration.

use std::{collections::HashSet, time::Duration};

use serde::{Deserialize, Serialize};
use vertex_net_codec::MAX_FRAME_SIZE;
use vertex_net_transport::ProtocolName;

/// Default upper bound on a handshake message.
pub const DEFAULT_MAX_HANDSHAKE_SIZE: usize = 1024;

/// Default upper bound on a single notification.
pub const DEFAULT_MAX_NOTIFICATION_SIZE: usize = 16 * 1024 * 1024;

/// Default time allowed for the whole handshake exchange.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Default time allowed for the transport to open a substream.
pub const OPEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time allowed to flush and close a substream gracefully.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Who writes their handshake first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakePolicy {
    /// The opener writes first; the acceptor reads, validates, then replies.
    #[default]
    DialerFirst,
    /// Both sides write immediately, then read.
    Concurrent,
}

/// Invalid protocol configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("protocol name must not be empty")]
    EmptyName,

    #[error("protocol name {0} is listed more than once")]
    DuplicateName(ProtocolName),

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("{field} of {size} bytes exceeds the frame limit of {max} bytes")]
    TooLarge {
        field: &'static str,
        size: usize,
        max: usize,
    },

    #[error("handshake of {size} bytes exceeds max_handshake_size of {max} bytes")]
    HandshakeTooLarge { size: usize, max: usize },
}

/// Configuration of one notification protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Main protocol name, tried first when opening.
    pub name: ProtocolName,
    /// Older names accepted inbound and tried in order outbound after `name`.
    pub fallback_names: Vec<ProtocolName>,
    pub max_handshake_size: usize,
    pub max_notification_size: usize,
    pub handshake_policy: HandshakePolicy,
    /// Handshake sent on inbound substreams. Replaceable at runtime.
    pub handshake: Vec<u8>,
    /// Notifications a sender may have in flight before waiting.
    pub credit_window: usize,
    /// Notifications buffered between the reader and the consumer.
    pub inbound_buffer: usize,
    pub handshake_timeout: Duration,
    pub open_timeout: Duration,
    pub close_timeout: Duration,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            name: ProtocolName::from(""),
            fallback_names: Vec::new(),
            max_handshake_size: DEFAULT_MAX_HANDSHAKE_SIZE,
            max_notification_size: DEFAULT_MAX_NOTIFICATION_SIZE,
            handshake_policy: HandshakePolicy::default(),
            handshake: Vec::new(),
            credit_window: 1,
            inbound_buffer: 1,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            open_timeout: OPEN_TIMEOUT,
            close_timeout: CLOSE_TIMEOUT,
        }
    }
}

impl ProtocolConfig {
    pub fn new(name: impl Into<ProtocolName>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_fallback_names(mut self, names: impl IntoIterator<Item = ProtocolName>) -> Self {
        self.fallback_names = names.into_iter().collect();
        self
    }

    pub fn with_max_handshake_size(mut self, size: usize) -> Self {
        self.max_handshake_size = size;
        self
    }

    pub fn with_max_notification_size(mut self, size: usize) -> Self {
        self.max_notification_size = size;
        self
    }

    pub fn with_handshake_policy(mut self, policy: HandshakePolicy) -> Self {
        self.handshake_policy = policy;
        self
    }

    pub fn with_handshake(mut self, handshake: impl Into<Vec<u8>>) -> Self {
        self.handshake = handshake.into();
        self
    }

    pub fn with_credit_window(mut self, window: usize) -> Self {
        self.credit_window = window;
        self
    }

    pub fn with_inbound_buffer(mut self, buffer: usize) -> Self {
        self.inbound_buffer = buffer;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Main name followed by the fallbacks, in negotiation order.
    pub fn names(&self) -> impl Iterator<Item = &ProtocolName> {
        std::iter::once(&self.name).chain(&self.fallback_names)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for name in self.names() {
            if name.as_str().is_empty() {
                return Err(ConfigError::EmptyName);
            }
            if !seen.insert(name) {
                return Err(ConfigError::DuplicateName(name.clone()));
            }
        }

        for (field, value) in [
            ("credit_window", self.credit_window),
            ("inbound_buffer", self.inbound_buffer),
            ("max_notification_size", self.max_notification_size),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }

        for (field, value) in [
            ("handshake_timeout", self.handshake_timeout),
            ("open_timeout", self.open_timeout),
            ("close_timeout", self.close_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Zero { field });
            }
        }

        for (field, size) in [
            ("max_handshake_size", self.max_handshake_size),
            ("max_notification_size", self.max_notification_size),
        ] {
            if size > MAX_FRAME_SIZE {
                return Err(ConfigError::TooLarge {
                    field,
                    size,
                    max: MAX_FRAME_SIZE,
                });
            }
        }

        self.check_handshake(&self.handshake)
    }

    pub(crate) fn check_handshake(&self, handshake: &[u8]) -> Result<(), ConfigError> {
        if handshake.len() > self.max_handshake_size {
            return Err(ConfigError::HandshakeTooLarge {
                size: handshake.len(),
                max: self.max_handshake_size,
            });
        }
        Ok(())
    }
}
