//! The "MOTION" Engine - Bounded Simulated Movement
//!
//! Keeps drivers without a real device moving on the map. On every tick the
//! generator:
//! 1. Places roster drivers that have no record yet (first observation)
//! 2. Asks the [`MotionModel`] for a displacement for every eligible driver
//!    (active, not live)
//! 3. Projects the displacement along the great circle and clamps the result
//!    into the configured bounding box
//!
//! The generator never writes to the store itself; it returns events and the
//! runtime upserts them, so live precedence is enforced in one place.

use crate::config::{ConfigError, FleetConfig, GeoBounds, MotionConfig, RosterEntry};
use crate::fleet_store::{DriverLocationRecord, DriverStore, LatLng, LocationEvent};
use fleetsync_env::Timestamp;
use geo::HaversineDestination;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Uniform};
use std::f64::consts::TAU;
use std::time::Duration;
use tracing::{debug, info};

// ============================================================================
// DISPLACEMENT
// ============================================================================

/// One step of movement proposed by a motion model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Displacement {
    /// Direction of travel in radians, clockwise from north, in [0, 2π)
    pub heading_rad: f64,

    /// Speed over ground in m/s
    pub speed_mps: f64,

    /// Distance covered during the tick in meters
    pub distance_m: f64,
}

impl Displacement {
    /// A displacement that leaves the driver where it is.
    pub const fn none() -> Self {
        Self {
            heading_rad: 0.0,
            speed_mps: 0.0,
            distance_m: 0.0,
        }
    }

    /// Heading in compass degrees [0, 360).
    #[inline]
    pub fn bearing_deg(&self) -> f64 {
        self.heading_rad.to_degrees()
    }

    /// Destination reached from `from` (unclamped).
    pub fn apply(&self, from: LatLng) -> LatLng {
        if self.distance_m <= 0.0 {
            return from;
        }
        let destination = from
            .to_point()
            .haversine_destination(self.bearing_deg(), self.distance_m);
        LatLng::from_point(destination)
    }
}

// ============================================================================
// MOTION MODELS
// ============================================================================

/// Pluggable movement law for simulated drivers.
pub trait MotionModel: Send {
    /// Propose the movement of `record` over `dt`.
    fn displace(&mut self, record: &DriverLocationRecord, dt: Duration) -> Displacement;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Uniform random heading, uniform random speed.
///
/// All randomness comes from a `ChaCha8Rng`, so a seeded walk is fully
/// reproducible.
pub struct RandomWalk {
    rng: ChaCha8Rng,
    speed: Uniform<f64>,
}

impl RandomWalk {
    /// Create a walk drawing from `rng`. Rejects an invalid speed range.
    pub fn new(rng: ChaCha8Rng, config: &MotionConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            rng,
            speed: Uniform::new_inclusive(config.min_speed_mps, config.max_speed_mps),
        })
    }

    /// Create a deterministic walk from a seed.
    pub fn seeded(seed: u64, config: &MotionConfig) -> Result<Self, ConfigError> {
        Self::new(ChaCha8Rng::seed_from_u64(seed), config)
    }
}

impl MotionModel for RandomWalk {
    fn displace(&mut self, _record: &DriverLocationRecord, dt: Duration) -> Displacement {
        let heading_rad = self.rng.gen_range(0.0..TAU);
        let speed_mps = self.speed.sample(&mut self.rng);

        Displacement {
            heading_rad,
            speed_mps,
            distance_m: speed_mps * dt.as_secs_f64(),
        }
    }

    fn name(&self) -> &'static str {
        "random_walk"
    }
}

/// Never moves anyone. Useful when only placement matters.
#[derive(Debug, Default, Clone, Copy)]
pub struct Stationary;

impl MotionModel for Stationary {
    fn displace(&mut self, _record: &DriverLocationRecord, _dt: Duration) -> Displacement {
        Displacement::none()
    }

    fn name(&self) -> &'static str {
        "stationary"
    }
}

// ============================================================================
// MOTION GENERATOR
// ============================================================================

/// Periodic producer of simulated location events.
pub struct MotionGenerator {
    model: Box<dyn MotionModel>,
    bounds: GeoBounds,
    roster: Vec<RosterEntry>,
    interval: Duration,
    paused: bool,
    ticks: u64,
}

impl MotionGenerator {
    /// Create a running generator. Rejects inverted or non-finite bounds.
    pub fn new(model: Box<dyn MotionModel>, config: &FleetConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::from_validated(model, config))
    }

    /// Build from a config that already passed [`FleetConfig::validate`].
    pub(crate) fn from_validated(model: Box<dyn MotionModel>, config: &FleetConfig) -> Self {
        Self {
            model,
            bounds: config.bounds,
            roster: config.roster.clone(),
            interval: config.tick_interval(),
            paused: false,
            ticks: 0,
        }
    }

    /// A driver is moved only while active and not reporting live.
    pub fn is_eligible(record: &DriverLocationRecord) -> bool {
        record.is_active() && !record.is_live()
    }

    /// Produce this tick's events. Returns nothing while paused.
    pub fn tick(&mut self, store: &DriverStore, now: Timestamp) -> Vec<LocationEvent> {
        if self.paused {
            return Vec::new();
        }
        self.ticks += 1;

        let mut events = Vec::new();

        // First observation of roster drivers: place them where the roster says
        for entry in &self.roster {
            if store.contains(entry.id) {
                continue;
            }
            let position = self.bounds.clamp(entry.position);
            events.push(
                LocationEvent::simulated(entry.id, position, now)
                    .with_labels(entry.name.clone(), entry.vehicle_id.clone())
                    .with_status(entry.status)
                    .with_profile(entry.profile()),
            );
        }

        let placed = events.len();

        for record in store.all() {
            if !Self::is_eligible(&record) {
                continue;
            }
            let step = self.model.displace(&record, self.interval);
            let position = self.bounds.clamp(step.apply(record.position));

            events.push(
                LocationEvent::simulated(record.driver_id, position, now)
                    .with_motion(Some(step.speed_mps), Some(step.bearing_deg())),
            );
        }

        debug!(
            tick = self.ticks,
            placed,
            moved = events.len() - placed,
            model = self.model.name(),
            "generator tick"
        );

        events
    }

    /// Stop producing events. Returns true if the state changed.
    pub fn pause(&mut self) -> bool {
        if self.paused {
            return false;
        }
        self.paused = true;
        info!(ticks = self.ticks, "simulated tracking paused");
        true
    }

    /// Resume producing events. Returns true if the state changed.
    pub fn resume(&mut self) -> bool {
        if !self.paused {
            return false;
        }
        self.paused = false;
        info!(ticks = self.ticks, "simulated tracking resumed");
        true
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Number of ticks that produced events.
    pub fn tick_count(&self) -> u64 {
        self.ticks
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn bounds(&self) -> &GeoBounds {
        &self.bounds
    }

    pub fn model_name(&self) -> &'static str {
        self.model.name()
    }
}

// ============================================================================
// TESTS
// ============================================================================
