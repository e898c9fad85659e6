//! Common types for the FleetSync environment abstraction.

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Stable identifier of a driver.
///
/// The relay transports it as a plain JSON number, so it stays a bare integer
/// rather than a UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DriverId(pub u64);

impl DriverId {
    /// Returns the raw integer id.
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl From<u64> for DriverId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for DriverId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "D{}", self.0)
    }
}

/// Wall-clock timestamp in milliseconds since the Unix epoch.
///
/// Both producers stamp their events with this type so the store can order
/// writes without a shared clock object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// Creates a timestamp from raw milliseconds.
    pub const fn from_millis(ms: u64) -> Self {
        Self(ms)
    }

    /// Converts a `SystemTime` (clamping pre-epoch values to zero).
    pub fn from_system_time(time: SystemTime) -> Self {
        let ms = time
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self(ms)
    }

    /// Returns the raw milliseconds.
    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Time elapsed from `earlier` to `self`, zero if `earlier` is later.
    pub fn saturating_since(&self, earlier: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// A raw message delivered by the cross-context relay.
///
/// The payload is untrusted text; it is only turned into a typed event by the
/// validating parser in `fleetsync_core`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayFrame {
    /// Raw message body (expected to be JSON)
    pub payload: String,

    /// Free-form label of the posting context, informational only
    pub origin: Option<String>,
}

impl RelayFrame {
    /// Creates a frame with no origin label.
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            origin: None,
        }
    }

    /// Attaches an origin label.
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Returns the payload size in bytes.
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}
