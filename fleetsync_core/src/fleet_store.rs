//! The "STORE" Engine - Canonical Per-Driver State
//!
//! Solves the "Two Writers, No Clock" problem. Two producers write into the
//! store without coordinating:
//! - the simulated motion generator (synthetic ticks)
//! - the live relay (real device positions)
//!
//! Every write goes through [`DriverStore::upsert`], which enforces:
//! 1. **One record per driver** (keyed map, no duplicates)
//! 2. **Last-writer-by-time**: an event older than the stored record is dropped
//! 3. **Live precedence**: once a driver is live, simulated writes bounce
//!
//! Reads are either a borrow of a single record or a point-in-time snapshot,
//! so nothing outside the store can mutate records in place.

use fleetsync_env::{DriverId, Timestamp};
use geo::{HaversineDistance, Point};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

// ============================================================================
// POSITION & ENUMS
// ============================================================================

/// A WGS84 position in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

impl LatLng {
    pub const fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Converts to a `geo` point (x = longitude, y = latitude).
    #[inline]
    pub fn to_point(self) -> Point<f64> {
        Point::new(self.lng, self.lat)
    }

    /// Builds a position from a `geo` point.
    #[inline]
    pub fn from_point(point: Point<f64>) -> Self {
        Self::new(point.y(), point.x())
    }

    /// Great-circle distance to `other` in meters.
    pub fn distance_m(&self, other: &LatLng) -> f64 {
        self.to_point().haversine_distance(&other.to_point())
    }

    /// True if both coordinates are finite and inside the WGS84 ranges.
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

impl std::fmt::Display for LatLng {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:.6}, {:.6})", self.lat, self.lng)
    }
}

/// Operational status of a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverStatus {
    #[default]
    Active,
    Offline,
}

impl std::fmt::Display for DriverStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

/// Provenance of the most recent accepted write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationSource {
    /// Synthetic position from the motion generator.
    Simulated,
    /// Position reported by a real device through the relay.
    Live,
}

impl std::fmt::Display for LocationSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Simulated => write!(f, "simulated"),
            Self::Live => write!(f, "live"),
        }
    }
}

/// Informational driver fields carried alongside a location.
///
/// Not used by the merge logic; only copied onto the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverProfile {
    pub performance_score: u32,
    pub earnings: f64,
    pub trips: u32,
    /// "Requires attention" flag shown on the marker
    pub red_flag: bool,
}

// ============================================================================
// LOCATION EVENT (Input)
// ============================================================================

/// A normalized location write, produced by either the generator or the relay.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationEvent {
    pub driver_id: DriverId,
    pub position: LatLng,

    /// Ordering timestamp (last-writer-by-time)
    pub timestamp: Timestamp,

    /// Ingestion clock when the event entered the engine
    pub received_at: Timestamp,

    pub source: LocationSource,

    /// Speed in m/s
    pub speed: Option<f64>,

    /// Heading in degrees [0, 360)
    pub heading: Option<f64>,

    /// Horizontal accuracy in meters
    pub accuracy: Option<f64>,

    pub driver_name: Option<String>,
    pub vehicle_id: Option<String>,
    pub status: Option<DriverStatus>,
    pub profile: Option<DriverProfile>,
}

impl LocationEvent {
    fn bare(driver_id: DriverId, position: LatLng, timestamp: Timestamp, source: LocationSource) -> Self {
        Self {
            driver_id,
            position,
            timestamp,
            received_at: timestamp,
            source,
            speed: None,
            heading: None,
            accuracy: None,
            driver_name: None,
            vehicle_id: None,
            status: None,
            profile: None,
        }
    }

    /// Creates a generator event.
    pub fn simulated(driver_id: DriverId, position: LatLng, timestamp: Timestamp) -> Self {
        Self::bare(driver_id, position, timestamp, LocationSource::Simulated)
    }

    /// Creates a relay event. A reporting device is, by definition, active.
    pub fn live(driver_id: DriverId, position: LatLng, timestamp: Timestamp) -> Self {
        let mut event = Self::bare(driver_id, position, timestamp, LocationSource::Live);
        event.status = Some(DriverStatus::Active);
        event
    }

    pub fn with_motion(mut self, speed: Option<f64>, heading: Option<f64>) -> Self {
        self.speed = speed;
        self.heading = heading;
        self
    }

    pub fn with_accuracy(mut self, accuracy: Option<f64>) -> Self {
        self.accuracy = accuracy;
        self
    }

    pub fn with_labels(mut self, driver_name: impl Into<String>, vehicle_id: impl Into<String>) -> Self {
        self.driver_name = Some(driver_name.into());
        self.vehicle_id = Some(vehicle_id.into());
        self
    }

    pub fn with_status(mut self, status: DriverStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_profile(mut self, profile: DriverProfile) -> Self {
        self.profile = Some(profile);
        self
    }

    /// Overrides the ingestion clock (defaults to `timestamp`).
    pub fn received_at(mut self, received_at: Timestamp) -> Self {
        self.received_at = received_at;
        self
    }
}

// ============================================================================
// DRIVER LOCATION RECORD (Internal State)
// ============================================================================

/// Canonical per-driver location/status entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverLocationRecord {
    pub driver_id: DriverId,
    pub driver_name: String,
    pub vehicle_id: String,
    pub position: LatLng,
    pub speed: Option<f64>,
    pub heading: Option<f64>,
    pub accuracy: Option<f64>,
    pub status: DriverStatus,
    pub source: LocationSource,

    /// Timestamp of the most recent accepted write
    pub last_update: Timestamp,

    /// Ingestion clock of the most recent accepted write (staleness input)
    pub received_at: Timestamp,

    pub performance_score: u32,
    pub earnings: f64,
    pub trips: u32,
    pub red_flag: bool,

    /// Accumulated great-circle distance over accepted moves
    pub distance_m: f64,
}

/// Labels and profile of a driver the host knows before any location arrives.
#[derive(Debug, Clone, PartialEq)]
pub struct KnownDriver {
    pub driver_name: String,
    pub vehicle_id: String,
    pub status: DriverStatus,
    pub profile: DriverProfile,
}

/// Defaults used when a record has to be synthesized from a sparse event.
///
/// Known drivers fill whatever the first event leaves out, whichever
/// producer that event came from.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordDefaults {
    pub performance_score: u32,
    pub known: BTreeMap<DriverId, KnownDriver>,
}

impl Default for RecordDefaults {
    fn default() -> Self {
        Self {
            performance_score: 80,
            known: BTreeMap::new(),
        }
    }
}

impl DriverLocationRecord {
    /// Synthesize a full record from the first event seen for a driver.
    pub fn from_event(event: LocationEvent, defaults: &RecordDefaults) -> Self {
        let known = defaults.known.get(&event.driver_id);
        let profile = event
            .profile
            .or_else(|| known.map(|k| k.profile.clone()))
            .unwrap_or(DriverProfile {
                performance_score: defaults.performance_score,
                earnings: 0.0,
                trips: 0,
                red_flag: false,
            });

        Self {
            driver_id: event.driver_id,
            driver_name: event
                .driver_name
                .or_else(|| known.map(|k| k.driver_name.clone()))
                .unwrap_or_else(|| format!("Driver {}", event.driver_id.get())),
            vehicle_id: event
                .vehicle_id
                .or_else(|| known.map(|k| k.vehicle_id.clone()))
                .unwrap_or_default(),
            position: event.position,
            speed: event.speed,
            heading: event.heading,
            accuracy: event.accuracy,
            status: event.status.or_else(|| known.map(|k| k.status)).unwrap_or_default(),
            source: event.source,
            last_update: event.timestamp,
            received_at: event.received_at,
            performance_score: profile.performance_score,
            earnings: profile.earnings,
            trips: profile.trips,
            red_flag: profile.red_flag,
            distance_m: 0.0,
        }
    }

    /// Apply an accepted event in place.
    fn apply(&mut self, event: LocationEvent) {
        if event.position != self.position {
            self.distance_m += self.position.distance_m(&event.position);
        }

        self.position = event.position;
        self.speed = event.speed;
        self.heading = event.heading;
        self.accuracy = event.accuracy;
        self.source = event.source;
        self.last_update = event.timestamp;
        self.received_at = self.received_at.max(event.received_at);

        if let Some(name) = event.driver_name {
            self.driver_name = name;
        }
        if let Some(vehicle) = event.vehicle_id {
            self.vehicle_id = vehicle;
        }
        if let Some(status) = event.status {
            self.status = status;
        }
        if let Some(profile) = event.profile {
            self.performance_score = profile.performance_score;
            self.earnings = profile.earnings;
            self.trips = profile.trips;
            self.red_flag = profile.red_flag;
        }
    }

    #[inline]
    pub fn is_live(&self) -> bool {
        self.source == LocationSource::Live
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.status == DriverStatus::Active
    }
}

// ============================================================================
// MERGE OUTCOME
// ============================================================================

/// Result of a single [`DriverStore::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// First event for this driver; a record was synthesized.
    Created,
    /// Existing record updated in place.
    Updated,
    /// Event older than the stored record; dropped.
    Stale { stored: Timestamp, incoming: Timestamp },
    /// Simulated event for a live driver; dropped.
    LiveLocked,
}

impl MergeOutcome {
    /// Whether the store changed.
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Created | Self::Updated)
    }
}

// ============================================================================
// DRIVER STORE (The Engine)
// ============================================================================

/// Authoritative `driverId → DriverLocationRecord` mapping.
///
/// Ordered by driver id so snapshots and reconciliation passes are
/// deterministic.
#[derive(Debug, Clone, Default)]
pub struct DriverStore {
    records: BTreeMap<DriverId, DriverLocationRecord>,
    defaults: RecordDefaults,
}

impl DriverStore {
    /// Create an empty store with the given synthesis defaults.
    pub fn new(defaults: RecordDefaults) -> Self {
        Self {
            records: BTreeMap::new(),
            defaults,
        }
    }

    /// Create an empty store with default synthesis values.
    pub fn with_defaults() -> Self {
        Self::new(RecordDefaults::default())
    }

    /// Merge a normalized event into the store.
    pub fn upsert(&mut self, event: LocationEvent) -> MergeOutcome {
        let Some(record) = self.records.get_mut(&event.driver_id) else {
            let record = DriverLocationRecord::from_event(event, &self.defaults);
            debug!(driver = %record.driver_id, source = %record.source, "record created");
            self.records.insert(record.driver_id, record);
            return MergeOutcome::Created;
        };

        if event.timestamp < record.last_update {
            debug!(
                driver = %event.driver_id,
                stored = %record.last_update,
                incoming = %event.timestamp,
                "out-of-order event dropped"
            );
            return MergeOutcome::Stale {
                stored: record.last_update,
                incoming: event.timestamp,
            };
        }

        if event.source == LocationSource::Simulated && record.is_live() {
            debug!(driver = %event.driver_id, "simulated event dropped, driver is live");
            return MergeOutcome::LiveLocked;
        }

        record.apply(event);
        MergeOutcome::Updated
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    /// Get a record by driver id.
    pub fn get(&self, id: DriverId) -> Option<&DriverLocationRecord> {
        self.records.get(&id)
    }

    /// Point-in-time snapshot of every record, ordered by driver id.
    pub fn all(&self) -> Vec<DriverLocationRecord> {
        self.records.values().cloned().collect()
    }

    /// Borrowing iterator over records, ordered by driver id.
    pub fn records(&self) -> impl Iterator<Item = &DriverLocationRecord> + '_ {
        self.records.values()
    }

    /// Known driver ids, ordered.
    pub fn ids(&self) -> impl Iterator<Item = DriverId> + '_ {
        self.records.keys().copied()
    }

    pub fn contains(&self, id: DriverId) -> bool {
        self.records.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of drivers whose latest write came from a real device.
    pub fn live_count(&self) -> usize {
        self.records.values().filter(|r| r.is_live()).count()
    }
}

// ============================================================================
// TESTS
// ============================================================================
