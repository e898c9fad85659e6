//! The "RELAY" Engine - Validating Boundary for Live Device Events
//!
//! The mobile tracking client runs in a separate context and posts
//! `DRIVER_LOCATION_UPDATE` messages through the relay. Nothing about those
//! messages is trusted until it has been through [`parse_relay_message`]:
//!
//! ```text
//! raw text ──► envelope {type, data} ──► typed LocationUpdate ──► range checks
//!                  │                           │                       │
//!             NotJson / UnknownType      InvalidPayload            OutOfRange
//! ```
//!
//! A frame that fails any stage is dropped whole: nothing is written to the
//! store and nothing is propagated to the caller beyond a counter.
//!
//! The sender is not authenticated. Anything that can post to the relay can
//! move any driver; hosts must only bridge same-origin contexts into it.

use crate::config::TimestampPolicy;
use crate::fleet_store::{DriverStore, LatLng, LocationEvent, MergeOutcome};
use fleetsync_env::{DriverId, RelayFrame, Timestamp};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Message type tag for location updates.
pub const DRIVER_LOCATION_UPDATE: &str = "DRIVER_LOCATION_UPDATE";

// ============================================================================
// WIRE FORMAT
// ============================================================================

/// Outer `{type, data}` envelope; `data` is kept raw until the type is known.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    data: serde_json::Value,
}

/// Device sample inside a location update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayLocation {
    pub lat: f64,
    pub lng: f64,

    /// Producer clock, milliseconds since the Unix epoch
    pub timestamp: u64,

    /// Horizontal accuracy in meters
    pub accuracy: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
}

/// Payload of a `DRIVER_LOCATION_UPDATE` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationUpdate {
    pub driver_id: u64,
    pub location: RelayLocation,
    pub vehicle_id: String,
    pub driver_name: String,
}

/// A validated relay message.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    DriverLocationUpdate(LocationUpdate),
}

impl LocationUpdate {
    /// Serialize as a complete relay message (`{type, data}`).
    pub fn to_message_json(&self) -> String {
        serde_json::json!({
            "type": DRIVER_LOCATION_UPDATE,
            "data": self,
        })
        .to_string()
    }

    /// Range checks that serde cannot express.
    fn validate(&self) -> Result<(), ParseError> {
        let loc = &self.location;

        if !loc.lat.is_finite() || !(-90.0..=90.0).contains(&loc.lat) {
            return Err(ParseError::OutOfRange { field: "location.lat", value: loc.lat });
        }
        if !loc.lng.is_finite() || !(-180.0..=180.0).contains(&loc.lng) {
            return Err(ParseError::OutOfRange { field: "location.lng", value: loc.lng });
        }
        if !loc.accuracy.is_finite() || loc.accuracy < 0.0 {
            return Err(ParseError::OutOfRange { field: "location.accuracy", value: loc.accuracy });
        }
        if let Some(speed) = loc.speed {
            if !speed.is_finite() || speed < 0.0 {
                return Err(ParseError::OutOfRange { field: "location.speed", value: speed });
            }
        }
        if let Some(heading) = loc.heading {
            if !heading.is_finite() || !(0.0..=360.0).contains(&heading) {
                return Err(ParseError::OutOfRange { field: "location.heading", value: heading });
            }
        }

        Ok(())
    }

    /// Normalize into a live store event ordered by `timestamp`.
    pub fn into_event(self, timestamp: Timestamp, received_at: Timestamp) -> LocationEvent {
        let loc = self.location;
        LocationEvent::live(
            DriverId(self.driver_id),
            LatLng::new(loc.lat, loc.lng),
            timestamp,
        )
        .received_at(received_at)
        .with_motion(loc.speed, loc.heading)
        .with_accuracy(Some(loc.accuracy))
        .with_labels(self.driver_name, self.vehicle_id)
    }
}

// ============================================================================
// PARSING
// ============================================================================

/// Parse and validate a raw relay payload.
pub fn parse_relay_message(payload: &str) -> Result<RelayMessage, ParseError> {
    let envelope: Envelope =
        serde_json::from_str(payload).map_err(|e| ParseError::NotJson(e.to_string()))?;

    if envelope.kind != DRIVER_LOCATION_UPDATE {
        return Err(ParseError::UnknownType(envelope.kind));
    }

    let update: LocationUpdate = serde_json::from_value(envelope.data)
        .map_err(|e| ParseError::InvalidPayload(e.to_string()))?;
    update.validate()?;

    Ok(RelayMessage::DriverLocationUpdate(update))
}

// ============================================================================
// LISTENER
// ============================================================================

/// What happened to one relay frame.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayOutcome {
    /// Frame rejected at the boundary; the store was not touched.
    Ignored(ParseError),
    /// Frame parsed and offered to the store.
    Merged {
        driver_id: DriverId,
        outcome: MergeOutcome,
    },
}

impl RelayOutcome {
    /// True if the store changed.
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Merged { outcome, .. } if outcome.is_applied())
    }
}

/// Frame counters kept by the listener.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    pub frames: u64,
    pub malformed: u64,
    pub merged: u64,
}

/// Receives relay frames, validates them and forwards live events.
#[derive(Debug, Default)]
pub struct RelayListener {
    policy: TimestampPolicy,
    stats: RelayStats,
}

impl RelayListener {
    pub fn new(policy: TimestampPolicy) -> Self {
        Self {
            policy,
            stats: RelayStats::default(),
        }
    }

    /// Handle one frame received at `received_at` (engine clock).
    pub fn handle_frame(
        &mut self,
        frame: &RelayFrame,
        received_at: Timestamp,
        store: &mut DriverStore,
    ) -> RelayOutcome {
        self.stats.frames += 1;

        let update = match parse_relay_message(&frame.payload) {
            Ok(RelayMessage::DriverLocationUpdate(update)) => update,
            Err(err) => {
                self.stats.malformed += 1;
                debug!(
                    origin = frame.origin.as_deref().unwrap_or("-"),
                    bytes = frame.size(),
                    error = %err,
                    "relay frame ignored"
                );
                return RelayOutcome::Ignored(err);
            }
        };

        let ordering = match self.policy {
            TimestampPolicy::Ingestion => received_at,
            TimestampPolicy::Producer => Timestamp(update.location.timestamp),
        };

        let driver_id = DriverId(update.driver_id);
        let outcome = store.upsert(update.into_event(ordering, received_at));
        self.stats.merged += 1;

        RelayOutcome::Merged { driver_id, outcome }
    }

    pub fn stats(&self) -> RelayStats {
        self.stats
    }

    pub fn policy(&self) -> TimestampPolicy {
        self.policy
    }
}

// ============================================================================
// ERRORS
// ============================================================================

/// Reasons a relay payload is rejected.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("Payload is not a {{type, data}} JSON object: {0}")]
    NotJson(String),

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Field {field} out of range: {value}")]
    OutOfRange { field: &'static str, value: f64 },
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet_store::{DriverStatus, LocationSource};
    use serde_json::json;

    fn sample_update() -> LocationUpdate {
        LocationUpdate {
            driver_id: 1,
            location: RelayLocation {
                lat: 25.21,
                lng: 55.28,
                timestamp: 1_704_067_200_150,
                accuracy: 12.0,
                speed: Some(8.5),
                heading: Some(90.0),
            },
            vehicle_id: "DXB-A-12345".to_string(),
            driver_name: "Ahmed Al-Rashid".to_string(),
        }
    }

    fn frame(value: serde_json::Value) -> RelayFrame {
        RelayFrame::new(value.to_string())
    }

    #[test]
    fn test_parse_valid_message() {
        let update = sample_update();
        let parsed = parse_relay_message(&update.to_message_json()).unwrap();
        assert_eq!(parsed, RelayMessage::DriverLocationUpdate(update));
    }

    #[test]
    fn test_optional_fields_may_be_absent_or_null() {
        let raw = json!({
            "type": "DRIVER_LOCATION_UPDATE",
            "data": {
                "driverId": 3,
                "location": { "lat": 25.2, "lng": 55.27, "timestamp": 5, "accuracy": 20.0, "speed": null },
                "vehicleId": "DXB-C-11111",
                "driverName": "Omar Khalil",
                "battery": 80
            }
        });
        let RelayMessage::DriverLocationUpdate(update) = parse_relay_message(&raw.to_string()).unwrap();
        assert_eq!(update.location.speed, None);
        assert_eq!(update.location.heading, None);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(parse_relay_message("not json"), Err(ParseError::NotJson(_))));
        assert!(matches!(parse_relay_message("[1,2,3]"), Err(ParseError::NotJson(_))));
        assert!(matches!(parse_relay_message(r#"{"type":"X"}"#), Err(ParseError::NotJson(_))));
    }

    #[test]
    fn test_rejects_unknown_type() {
        let raw = json!({ "type": "BATTERY_LEVEL", "data": { "level": 80 } });
        assert_eq!(
            parse_relay_message(&raw.to_string()),
            Err(ParseError::UnknownType("BATTERY_LEVEL".to_string()))
        );
    }

    #[test]
    fn test_rejects_mistyped_fields() {
        // driverId missing (client without a session)
        let raw = json!({
            "type": "DRIVER_LOCATION_UPDATE",
            "data": {
                "location": { "lat": 25.2, "lng": 55.27, "timestamp": 5, "accuracy": 20.0 },
                "vehicleId": "DXB-A-12345",
                "driverName": "Ahmed"
            }
        });
        assert!(matches!(parse_relay_message(&raw.to_string()), Err(ParseError::InvalidPayload(_))));

        // lat as string
        let raw = json!({
            "type": "DRIVER_LOCATION_UPDATE",
            "data": {
                "driverId": 1,
                "location": { "lat": "25.2", "lng": 55.27, "timestamp": 5, "accuracy": 20.0 },
                "vehicleId": "DXB-A-12345",
                "driverName": "Ahmed"
            }
        });
        assert!(matches!(parse_relay_message(&raw.to_string()), Err(ParseError::InvalidPayload(_))));
    }

    #[test]
    fn test_rejects_out_of_range_values() {
        let mut update = sample_update();
        update.location.lat = 123.0;
        assert!(matches!(
            parse_relay_message(&update.to_message_json()),
            Err(ParseError::OutOfRange { field: "location.lat", .. })
        ));

        let mut update = sample_update();
        update.location.heading = Some(400.0);
        assert!(matches!(
            parse_relay_message(&update.to_message_json()),
            Err(ParseError::OutOfRange { field: "location.heading", .. })
        ));

        let mut update = sample_update();
        update.location.accuracy = -1.0;
        assert!(matches!(
            parse_relay_message(&update.to_message_json()),
            Err(ParseError::OutOfRange { field: "location.accuracy", .. })
        ));
    }

    #[test]
    fn test_listener_synthesizes_live_record() {
        let mut store = DriverStore::with_defaults();
        let mut listener = RelayListener::new(TimestampPolicy::Ingestion);

        let outcome = listener.handle_frame(
            &RelayFrame::new(sample_update().to_message_json()),
            Timestamp(9_000),
            &mut store,
        );

        assert_eq!(
            outcome,
            RelayOutcome::Merged { driver_id: DriverId(1), outcome: MergeOutcome::Created }
        );
        let record = store.get(DriverId(1)).unwrap();
        assert_eq!(record.source, LocationSource::Live);
        assert_eq!(record.status, DriverStatus::Active);
        assert_eq!(record.last_update, Timestamp(9_000));
        assert_eq!(record.accuracy, Some(12.0));
        assert_eq!(record.vehicle_id, "DXB-A-12345");
    }

    #[test]
    fn test_listener_producer_clock_orders_events() {
        let mut store = DriverStore::with_defaults();
        let mut listener = RelayListener::new(TimestampPolicy::Producer);

        let mut newer = sample_update();
        newer.location.timestamp = 2_000;
        let mut older = sample_update();
        older.location.timestamp = 1_000;
        older.location.lat = 25.0;

        listener.handle_frame(&RelayFrame::new(newer.to_message_json()), Timestamp(50), &mut store);
        let outcome =
            listener.handle_frame(&RelayFrame::new(older.to_message_json()), Timestamp(60), &mut store);

        assert!(!outcome.is_applied());
        assert_eq!(store.get(DriverId(1)).unwrap().position.lat, 25.21);
        assert_eq!(store.get(DriverId(1)).unwrap().last_update, Timestamp(2_000));
    }

    #[test]
    fn test_listener_ignores_malformed_without_touching_store() {
        let mut store = DriverStore::with_defaults();
        let mut listener = RelayListener::default();

        let outcome = listener.handle_frame(
            &frame(json!({ "type": "DRIVER_LOCATION_UPDATE", "data": { "driverId": 1 } })),
            Timestamp(1),
            &mut store,
        );

        assert!(matches!(outcome, RelayOutcome::Ignored(ParseError::InvalidPayload(_))));
        assert!(store.is_empty());
        assert_eq!(listener.stats(), RelayStats { frames: 1, malformed: 1, merged: 0 });
    }
}
