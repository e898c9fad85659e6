//! Simulated relay with fault injection.
//!
//! Sits between the simulated tracking clients and the engine. Frames are
//! posted with the virtual time they were sent and released once their
//! delivery time has passed, which is where loss, delay, reordering and
//! corruption are injected.

use fleetsync_env::RelayFrame;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Fault profile of the relay.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayFaults {
    /// Probability a frame is silently lost (0.0 - 1.0)
    pub loss_rate: f64,

    /// Probability a frame is held back long enough to be overtaken
    pub reorder_rate: f64,

    /// Probability a frame's payload is mangled in transit
    pub corrupt_rate: f64,

    /// Upper bound of the uniform delivery delay in milliseconds
    pub max_delay_ms: u64,
}

impl Default for RelayFaults {
    fn default() -> Self {
        Self {
            loss_rate: 0.0,
            reorder_rate: 0.0,
            corrupt_rate: 0.0,
            max_delay_ms: 0,
        }
    }
}

impl RelayFaults {
    /// A relay that delivers everything immediately and intact.
    pub fn none() -> Self {
        Self::default()
    }

    fn clamped(self) -> Self {
        Self {
            loss_rate: self.loss_rate.clamp(0.0, 1.0),
            reorder_rate: self.reorder_rate.clamp(0.0, 1.0),
            corrupt_rate: self.corrupt_rate.clamp(0.0, 1.0),
            max_delay_ms: self.max_delay_ms,
        }
    }
}

/// Relay counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SimRelayStats {
    pub posted: u64,
    pub dropped: u64,
    pub corrupted: u64,
    pub reordered: u64,
    pub delivered: u64,
}

#[derive(Debug)]
struct InFlight {
    deliver_at: Duration,
    seq: u64,
    frame: RelayFrame,
}

/// In-process relay driven by the virtual clock.
pub struct SimRelay {
    faults: RelayFaults,
    rng: ChaCha8Rng,
    in_flight: Vec<InFlight>,
    next_seq: u64,
    stats: SimRelayStats,
}

impl SimRelay {
    /// Creates a relay drawing its faults from `rng`.
    pub fn new(faults: RelayFaults, rng: ChaCha8Rng) -> Self {
        Self {
            faults: faults.clamped(),
            rng,
            in_flight: Vec::new(),
            next_seq: 0,
            stats: SimRelayStats::default(),
        }
    }

    /// Changes the fault profile for frames posted from now on.
    pub fn set_faults(&mut self, faults: RelayFaults) {
        self.faults = faults.clamped();
    }

    pub fn faults(&self) -> RelayFaults {
        self.faults
    }

    /// Posts a frame at virtual time `now`.
    pub fn post(&mut self, mut frame: RelayFrame, now: Duration) {
        self.stats.posted += 1;

        if self.rng.gen_bool(self.faults.loss_rate) {
            self.stats.dropped += 1;
            debug!(origin = ?frame.origin, "relay frame lost");
            return;
        }

        if self.rng.gen_bool(self.faults.corrupt_rate) {
            frame.payload = self.corrupt(&frame.payload);
            self.stats.corrupted += 1;
        }

        let mut delay_ms = if self.faults.max_delay_ms > 0 {
            self.rng.gen_range(0..=self.faults.max_delay_ms)
        } else {
            0
        };
        if self.rng.gen_bool(self.faults.reorder_rate) {
            // Held past the delay window so later frames overtake it
            delay_ms += self.faults.max_delay_ms.max(1_000) * 2;
            self.stats.reordered += 1;
        }

        self.in_flight.push(InFlight {
            deliver_at: now + Duration::from_millis(delay_ms),
            seq: self.next_seq,
            frame,
        });
        self.next_seq += 1;
    }

    /// Posts a raw payload.
    pub fn post_payload(&mut self, payload: impl Into<String>, now: Duration) {
        self.post(RelayFrame::new(payload), now);
    }

    /// Removes and returns every frame due at `now`, in delivery order.
    pub fn deliver_due(&mut self, now: Duration) -> Vec<RelayFrame> {
        let (mut due, pending): (Vec<InFlight>, Vec<InFlight>) = self
            .in_flight
            .drain(..)
            .partition(|f| f.deliver_at <= now);
        self.in_flight = pending;

        due.sort_by_key(|f| (f.deliver_at, f.seq));
        self.stats.delivered += due.len() as u64;
        due.into_iter().map(|f| f.frame).collect()
    }

    /// Frames posted but not yet delivered.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn stats(&self) -> SimRelayStats {
        self.stats
    }

    fn corrupt(&mut self, payload: &str) -> String {
        match self.rng.gen_range(0..5) {
            // Truncated mid-object
            0 => payload.chars().take(payload.len() / 2).collect(),
            // Wrong message type
            1 => payload.replacen("DRIVER_LOCATION_UPDATE", "DRIVER_STATUS_UPDATE", 1),
            // Id sent as a string
            2 => payload.replacen("\"driverId\":", "\"driverId\":\"x\",\"_was\":", 1),
            // Latitude out of range
            3 => payload.replacen("\"lat\":", "\"lat\":1e3,\"_lat\":", 1),
            // Not JSON at all
            _ => "[object Object]".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetsync_core::fleet_relay::{parse_relay_message, LocationUpdate, RelayLocation};
    use rand::SeedableRng;

    fn payload() -> String {
        LocationUpdate {
            driver_id: 1,
            location: RelayLocation {
                lat: 25.2,
                lng: 55.27,
                timestamp: 1,
                accuracy: 5.0,
                speed: None,
                heading: None,
            },
            vehicle_id: "DXB-A-12345".to_string(),
            driver_name: "Ahmed".to_string(),
        }
        .to_message_json()
    }

    fn relay(faults: RelayFaults) -> SimRelay {
        SimRelay::new(faults, ChaCha8Rng::seed_from_u64(7))
    }

    #[test]
    fn test_clean_relay_delivers_in_order() {
        let mut relay = relay(RelayFaults::none());
        relay.post_payload("a", Duration::ZERO);
        relay.post_payload("b", Duration::ZERO);

        let frames = relay.deliver_due(Duration::ZERO);
        let payloads: Vec<&str> = frames.iter().map(|f| f.payload.as_str()).collect();
        assert_eq!(payloads, vec!["a", "b"]);
        assert_eq!(relay.in_flight(), 0);
    }

    #[test]
    fn test_delay_holds_frames() {
        let mut relay = relay(RelayFaults {
            max_delay_ms: 500,
            reorder_rate: 1.0,
            ..RelayFaults::none()
        });
        relay.post_payload("a", Duration::ZERO);

        assert!(relay.deliver_due(Duration::from_millis(500)).is_empty());
        assert_eq!(relay.deliver_due(Duration::from_secs(10)).len(), 1);
        assert_eq!(relay.stats().reordered, 1);
    }

    #[test]
    fn test_total_loss() {
        let mut relay = relay(RelayFaults {
            loss_rate: 1.0,
            ..RelayFaults::none()
        });
        for _ in 0..10 {
            relay.post_payload(payload(), Duration::ZERO);
        }
        assert!(relay.deliver_due(Duration::from_secs(1)).is_empty());
        assert_eq!(relay.stats().dropped, 10);
    }

    #[test]
    fn test_corrupted_frames_never_parse() {
        let mut relay = relay(RelayFaults {
            corrupt_rate: 1.0,
            ..RelayFaults::none()
        });
        for _ in 0..50 {
            relay.post_payload(payload(), Duration::ZERO);
        }
        for frame in relay.deliver_due(Duration::ZERO) {
            assert!(parse_relay_message(&frame.payload).is_err(), "{}", frame.payload);
        }
        assert_eq!(relay.stats().corrupted, 50);
    }
}
