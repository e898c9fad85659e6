//! Engine configuration.
//!
//! Every struct has a `Default` that reproduces the demo dashboard (Dubai
//! bounding box, 3 s generator tick, six-driver roster) and derives serde so
//! a host can load overrides from JSON.

use crate::fleet_store::{DriverLocationRecord, DriverProfile, DriverStatus, KnownDriver, LatLng, RecordDefaults};
use fleetsync_env::{DriverId, Timestamp};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// ============================================================================
// GEOGRAPHIC BOUNDS
// ============================================================================

/// Axis-aligned bounding box for simulated movement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoBounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl Default for GeoBounds {
    fn default() -> Self {
        // Central Dubai, around the dashboard's map centre (25.2048, 55.2708)
        Self {
            min_lat: 25.15,
            max_lat: 25.26,
            min_lng: 55.20,
            max_lng: 55.34,
        }
    }
}

impl GeoBounds {
    pub fn new(min_lat: f64, max_lat: f64, min_lng: f64, max_lng: f64) -> Self {
        Self {
            min_lat,
            max_lat,
            min_lng,
            max_lng,
        }
    }

    /// Inclusive containment test.
    pub fn contains(&self, position: &LatLng) -> bool {
        (self.min_lat..=self.max_lat).contains(&position.lat)
            && (self.min_lng..=self.max_lng).contains(&position.lng)
    }

    /// Clamp a position onto the box. Non-finite coordinates fall back to the
    /// box centre.
    pub fn clamp(&self, position: LatLng) -> LatLng {
        let center = self.center();
        let lat = if position.lat.is_finite() { position.lat } else { center.lat };
        let lng = if position.lng.is_finite() { position.lng } else { center.lng };
        // max-then-min never panics; inverted bounds resolve to the upper edge
        LatLng::new(
            lat.max(self.min_lat).min(self.max_lat),
            lng.max(self.min_lng).min(self.max_lng),
        )
    }

    pub fn center(&self) -> LatLng {
        LatLng::new(
            (self.min_lat + self.max_lat) / 2.0,
            (self.min_lng + self.max_lng) / 2.0,
        )
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let finite = [self.min_lat, self.max_lat, self.min_lng, self.max_lng]
            .iter()
            .all(|v| v.is_finite());
        if !finite || self.min_lat > self.max_lat || self.min_lng > self.max_lng {
            return Err(ConfigError::InvalidBounds(*self));
        }
        if !LatLng::new(self.min_lat, self.min_lng).is_valid()
            || !LatLng::new(self.max_lat, self.max_lng).is_valid()
        {
            return Err(ConfigError::InvalidBounds(*self));
        }
        Ok(())
    }
}

// ============================================================================
// MOTION / STALENESS / TIMESTAMPS
// ============================================================================

/// Speed range for the random walk, in meters per second.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    pub min_speed_mps: f64,
    pub max_speed_mps: f64,
}

impl MotionConfig {
    /// Speeds must be finite, non-negative and ordered.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.min_speed_mps.is_finite()
            || !self.max_speed_mps.is_finite()
            || self.min_speed_mps < 0.0
            || self.min_speed_mps > self.max_speed_mps
        {
            return Err(ConfigError::InvalidSpeedRange {
                min: self.min_speed_mps,
                max: self.max_speed_mps,
            });
        }
        Ok(())
    }
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            min_speed_mps: 2.0,  // ~7 km/h, crawling traffic
            max_speed_mps: 15.0, // 54 km/h
        }
    }
}

/// What the engine does with drivers whose feed stopped advancing.
///
/// The default never acts on staleness: markers stay put with their last
/// known status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StalenessPolicy {
    /// Age after which a record counts as stale. `None` disables detection.
    pub threshold_ms: Option<u64>,

    /// Remove stale markers instead of greying them out.
    pub evict: bool,
}

impl StalenessPolicy {
    /// Grey out records older than `threshold`, keep their markers.
    pub fn badge_after(threshold: Duration) -> Self {
        Self {
            threshold_ms: Some(threshold.as_millis() as u64),
            evict: false,
        }
    }

    /// Remove markers of records older than `threshold`.
    pub fn evict_after(threshold: Duration) -> Self {
        Self {
            threshold_ms: Some(threshold.as_millis() as u64),
            evict: true,
        }
    }

    /// True if a record last written at `received_at` is stale at `now`.
    pub fn is_stale(&self, received_at: Timestamp, now: Timestamp) -> bool {
        match self.threshold_ms {
            Some(threshold) => now.saturating_since(received_at) > Duration::from_millis(threshold),
            None => false,
        }
    }

    /// Staleness of a record. Only live feeds can go stale: simulated
    /// drivers hold still while the generator is paused or they are offline.
    pub fn is_record_stale(&self, record: &DriverLocationRecord, now: Timestamp) -> bool {
        record.is_live() && self.is_stale(record.received_at, now)
    }
}

/// Which clock orders relay events in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampPolicy {
    /// Stamp with the engine clock at receipt.
    #[default]
    Ingestion,
    /// Use the `location.timestamp` reported by the device.
    Producer,
}

// ============================================================================
// ROSTER
// ============================================================================

/// A driver known to the dashboard before any location is observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub id: DriverId,
    pub name: String,
    pub vehicle_id: String,
    pub position: LatLng,
    #[serde(default)]
    pub status: DriverStatus,
    #[serde(default = "default_performance_score")]
    pub performance_score: u32,
    #[serde(default)]
    pub trips: u32,
    #[serde(default)]
    pub earnings: f64,
    #[serde(default)]
    pub red_flag: bool,
}

fn default_performance_score() -> u32 {
    80
}

impl RosterEntry {
    pub fn profile(&self) -> DriverProfile {
        DriverProfile {
            performance_score: self.performance_score,
            earnings: self.earnings,
            trips: self.trips,
            red_flag: self.red_flag,
        }
    }

    pub fn known(&self) -> KnownDriver {
        KnownDriver {
            driver_name: self.name.clone(),
            vehicle_id: self.vehicle_id.clone(),
            status: self.status,
            profile: self.profile(),
        }
    }
}

/// The six demo drivers shown on the fleet map.
pub fn default_roster() -> Vec<RosterEntry> {
    let entry = |id: u64,
                 name: &str,
                 vehicle: &str,
                 lat: f64,
                 lng: f64,
                 status: DriverStatus,
                 score: u32,
                 trips: u32,
                 earnings: f64,
                 red_flag: bool| RosterEntry {
        id: DriverId(id),
        name: name.to_string(),
        vehicle_id: vehicle.to_string(),
        position: LatLng::new(lat, lng),
        status,
        performance_score: score,
        trips,
        earnings,
        red_flag,
    };

    use DriverStatus::{Active, Offline};
    vec![
        entry(1, "Ahmed Al-Rashid", "DXB-A-12345", 25.2048, 55.2708, Active, 92, 24, 1250.0, false),
        entry(2, "Mohammed Hassan", "DXB-B-67890", 25.1972, 55.2744, Active, 88, 18, 980.0, true),
        entry(3, "Omar Khalil", "DXB-C-11111", 25.2084, 55.2719, Active, 95, 31, 1680.0, false),
        entry(4, "Yusuf Ahmad", "DXB-D-22222", 25.2011, 55.2762, Offline, 78, 15, 820.0, false),
        entry(5, "Khalid Saeed", "DXB-E-33333", 25.2103, 55.2681, Active, 90, 22, 1150.0, false),
        entry(6, "Hassan Ali", "DXB-F-44444", 25.1995, 55.2790, Active, 85, 19, 1020.0, true),
    ]
}

// ============================================================================
// FLEET CONFIG
// ============================================================================

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Generator/reconciler tick interval (default: 3000 ms)
    pub tick_interval_ms: u64,

    /// Bounding box for simulated positions
    pub bounds: GeoBounds,

    pub motion: MotionConfig,

    pub staleness: StalenessPolicy,

    pub timestamp_policy: TimestampPolicy,

    /// Score given to drivers first seen through the relay
    pub default_performance_score: u32,

    /// Drivers the generator places on the first tick
    pub roster: Vec<RosterEntry>,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 3_000,
            bounds: GeoBounds::default(),
            motion: MotionConfig::default(),
            staleness: StalenessPolicy::default(),
            timestamp_policy: TimestampPolicy::default(),
            default_performance_score: default_performance_score(),
            roster: default_roster(),
        }
    }
}

impl FleetConfig {
    /// Generator tick interval.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Synthesis defaults for the store: the configured score plus every
    /// roster driver, so a relay fix that beats the first tick keeps the
    /// roster profile.
    pub fn record_defaults(&self) -> RecordDefaults {
        RecordDefaults {
            performance_score: self.default_performance_score,
            known: self.roster.iter().map(|entry| (entry.id, entry.known())).collect(),
        }
    }

    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::ZeroTickInterval);
        }

        self.bounds.validate()?;
        self.motion.validate()?;

        let mut seen = std::collections::BTreeSet::new();
        for entry in &self.roster {
            if !seen.insert(entry.id) {
                return Err(ConfigError::DuplicateRosterId(entry.id));
            }
        }

        Ok(())
    }
}

// ============================================================================
// ERRORS
// ============================================================================

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Tick interval must be greater than zero")]
    ZeroTickInterval,

    #[error("Invalid bounding box: {0:?}")]
    InvalidBounds(GeoBounds),

    #[error("Invalid speed range: {min}..{max} m/s")]
    InvalidSpeedRange { min: f64, max: f64 },

    #[error("Duplicate roster driver id: {0}")]
    DuplicateRosterId(DriverId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = FleetConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.tick_interval(), Duration::from_secs(3));
        assert_eq!(config.roster.len(), 6);
    }

    #[test]
    fn test_default_roster_is_inside_bounds() {
        let bounds = GeoBounds::default();
        for entry in default_roster() {
            assert!(bounds.contains(&entry.position), "{} outside bounds", entry.name);
        }
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = FleetConfig::from_json_str(r#"{ "tick_interval_ms": 500 }"#).unwrap();
        assert_eq!(config.tick_interval_ms, 500);
        assert_eq!(config.bounds, GeoBounds::default());
        assert_eq!(config.timestamp_policy, TimestampPolicy::Ingestion);
    }

    #[test]
    fn test_json_policies() {
        let config = FleetConfig::from_json_str(
            r#"{
                "timestamp_policy": "producer",
                "staleness": { "threshold_ms": 30000, "evict": true },
                "roster": []
            }"#,
        )
        .unwrap();
        assert_eq!(config.timestamp_policy, TimestampPolicy::Producer);
        assert_eq!(config.staleness, StalenessPolicy::evict_after(Duration::from_secs(30)));
        assert!(config.roster.is_empty());
    }

    #[test]
    fn test_inverted_bounds_rejected() {
        let config = FleetConfig {
            bounds: GeoBounds::new(25.3, 25.1, 55.2, 55.3),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidBounds(_))));
    }

    #[test]
    fn test_inverted_speed_range_rejected() {
        let config = FleetConfig {
            motion: MotionConfig {
                min_speed_mps: 10.0,
                max_speed_mps: 1.0,
            },
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidSpeedRange { .. })
        ));
    }

    #[test]
    fn test_zero_tick_rejected() {
        let err = FleetConfig::from_json_str(r#"{ "tick_interval_ms": 0 }"#).unwrap_err();
        assert!(matches!(err, ConfigError::ZeroTickInterval));
    }

    #[test]
    fn test_duplicate_roster_rejected() {
        let mut config = FleetConfig::default();
        config.roster.push(config.roster[0].clone());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateRosterId(DriverId(1)))
        ));
    }

    #[test]
    fn test_clamp_onto_bounds() {
        let bounds = GeoBounds::default();
        let clamped = bounds.clamp(LatLng::new(30.0, 50.0));
        assert_eq!(clamped, LatLng::new(25.26, 55.20));
        assert!(bounds.contains(&clamped));

        let inverted = GeoBounds::new(25.3, 25.1, 55.4, 55.2);
        assert_eq!(inverted.clamp(LatLng::new(25.2, 55.3)), LatLng::new(25.1, 55.2));
    }

    #[test]
    fn test_staleness_threshold() {
        let policy = StalenessPolicy::badge_after(Duration::from_secs(10));
        assert!(!policy.is_stale(Timestamp(0), Timestamp(10_000)));
        assert!(policy.is_stale(Timestamp(0), Timestamp(10_001)));
        assert!(!StalenessPolicy::default().is_stale(Timestamp(0), Timestamp(u64::MAX)));
    }

    #[test]
    fn test_only_live_records_go_stale() {
        use crate::fleet_store::{DriverStore, LocationEvent};

        let policy = StalenessPolicy::evict_after(Duration::from_secs(10));
        let mut store = DriverStore::with_defaults();
        let position = LatLng::new(25.2, 55.27);
        store.upsert(LocationEvent::simulated(DriverId(1), position, Timestamp(0)));
        store.upsert(LocationEvent::live(DriverId(2), position, Timestamp(0)));

        let later = Timestamp(60_000);
        assert!(!policy.is_record_stale(store.get(DriverId(1)).unwrap(), later));
        assert!(policy.is_record_stale(store.get(DriverId(2)).unwrap(), later));
    }

    #[test]
    fn test_record_defaults_cover_roster() {
        let config = FleetConfig::default();
        let defaults = config.record_defaults();

        assert_eq!(defaults.performance_score, 80);
        assert_eq!(defaults.known.len(), 6);
        let hassan = &defaults.known[&DriverId(2)];
        assert_eq!(hassan.driver_name, "Mohammed Hassan");
        assert!(hassan.profile.red_flag);
        assert_eq!(defaults.known[&DriverId(4)].status, DriverStatus::Offline);
    }
}
