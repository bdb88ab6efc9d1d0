use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};

/// Name of a notification protocol, e.g. `/sup/block-announces/1`.
///
/// Cheap to clone; compared by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct ProtocolName(Arc<str>);

impl ProtocolName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProtocolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ProtocolName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ProtocolName {
    fn from(name: &str) -> Self {
        Self(Arc::from(name))
    }
}

impl From<String> for ProtocolName {
    fn from(name: String) -> Self {
        Self(Arc::from(name))
    }
}

impl From<ProtocolName> for String {
    fn from(name: ProtocolName) -> Self {
        name.0.as_ref().to_owned()
    }
}

/// Which side opened a substream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Opened by the remote peer.
    Inbound,
    /// Opened by us.
    Outbound,
}

impl Direction {
    pub fn is_inbound(self) -> bool {
        matches!(self, Self::Inbound)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
