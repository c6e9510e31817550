//! Provider metadata types usable across crates.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Typed key for identifying providers in quota and ranking configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProviderKey(pub &'static str);

impl ProviderKey {
    /// Construct a new typed provider key from a static name.
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    /// Returns the inner static string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        self.0
    }
}

impl From<ProviderKey> for &'static str {
    fn from(k: ProviderKey) -> Self {
        k.0
    }
}

impl fmt::Display for ProviderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Freshness rank of a data source. Lower discriminant ranks first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum DataPriority {
    /// Live or near-live data (streaming or real-time REST).
    #[default]
    Realtime = 1,
    /// Data delayed by the provider (typically 15 minutes or end of day).
    Delayed = 2,
}

impl DataPriority {
    /// Whether results at this rank carry a delayed freshness guarantee.
    #[must_use]
    pub const fn is_delayed(self) -> bool {
        matches!(self, Self::Delayed)
    }
}

impl fmt::Display for DataPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Realtime => f.write_str("realtime"),
            Self::Delayed => f.write_str("delayed"),
        }
    }
}

/// Connection state of a streaming provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No session and none requested.
    #[default]
    Idle,
    /// A connect attempt is in flight.
    Connecting,
    /// A session is open.
    Connected,
    /// Waiting out a reconnect delay.
    Backoff,
    /// The supervisor has been stopped.
    Stopped,
}

impl ConnectionState {
    /// Lowercase label used in status events.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Backoff => "backoff",
            Self::Stopped => "stopped",
        }
    }
}
