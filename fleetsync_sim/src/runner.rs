//! Scenario runner - executes fault scenarios against the engine.

use crate::device::GeolocationError;
use crate::exporter::SimEvent;
use crate::relay::RelayFaults;
use crate::scenarios::ScenarioId;
use crate::world::{SimConfig, SimWorld};

use fleetsync_core::{FleetConfig, LocationSource, StalenessPolicy, TimestampPolicy};
use fleetsync_env::{DriverId, FleetContext};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, error, info};

/// Results from running a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Total steps executed
    pub total_ticks: u64,

    /// Final simulation time in seconds
    pub final_time_secs: f64,

    /// Number of drivers in the store at end
    pub final_driver_count: usize,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScenarioMetrics {
    pub relay_posted: u64,
    pub relay_dropped: u64,
    pub relay_corrupted: u64,
    pub relay_reordered: u64,

    /// Frames the engine ignored as malformed
    pub malformed_ignored: u64,

    pub merges_applied: u64,

    /// Out-of-order and live-locked events
    pub merges_rejected: u64,

    pub marker_ops: u64,
    pub surface_failures: u64,
    pub producer_faults: u64,
    pub oracle_checks: u64,
}

impl ScenarioMetrics {
    fn collect(world: &SimWorld) -> Self {
        let relay = world.relay().stats();
        let engine = world.engine().metrics();
        Self {
            relay_posted: relay.posted,
            relay_dropped: relay.dropped,
            relay_corrupted: relay.corrupted,
            relay_reordered: relay.reordered,
            malformed_ignored: engine.relay.malformed,
            merges_applied: engine.simulated.applied() + engine.live.applied(),
            merges_rejected: engine.rejected_merges(),
            marker_ops: engine.markers.ops(),
            surface_failures: world.engine().surface().failures(),
            producer_faults: engine.producer_faults,
            oracle_checks: world.oracle().checks(),
        }
    }
}

type Check = Result<(), String>;

/// Fixes cross the relay as JSON text; allow for float formatting.
const POSITION_TOLERANCE_M: f64 = 0.01;

fn ensure(condition: bool, message: impl FnOnce() -> String) -> Check {
    if condition {
        Ok(())
    } else {
        Err(message())
    }
}

/// Runs fault scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Roster size
    num_drivers: usize,

    /// Duration in seconds, raised where a scenario needs more
    max_duration_secs: f64,

    /// Base engine configuration
    fleet: FleetConfig,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64, num_drivers: usize) -> Self {
        Self {
            seed,
            num_drivers,
            max_duration_secs: 60.0,
            fleet: FleetConfig::default(),
        }
    }

    /// Sets the duration.
    pub fn with_duration(mut self, secs: f64) -> Self {
        self.max_duration_secs = secs;
        self
    }

    /// Sets the base engine configuration.
    pub fn with_fleet_config(mut self, fleet: FleetConfig) -> Self {
        self.fleet = fleet;
        self
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        self.execute(scenario, None)
    }

    /// Runs a scenario and writes its frames to `path` as JSON.
    pub fn run_with_export(&self, scenario: ScenarioId, path: &str) -> ScenarioResult {
        self.execute(scenario, Some(path))
    }

    fn execute(&self, scenario: ScenarioId, export_path: Option<&str>) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);
        debug!("  {}", scenario.description());

        let mut world = match SimWorld::new(self.configure(scenario)) {
            Ok(world) => world,
            Err(e) => {
                return ScenarioResult {
                    scenario,
                    seed: self.seed,
                    passed: false,
                    total_ticks: 0,
                    final_time_secs: 0.0,
                    final_driver_count: 0,
                    failure_reason: Some(format!("Invalid configuration: {e}")),
                    metrics: ScenarioMetrics::default(),
                };
            }
        };
        if export_path.is_some() {
            // Two frames per second at the default step
            world = world.with_export(scenario.name(), 4);
        }

        let outcome = match scenario {
            ScenarioId::LiveTakeover => self.run_live_takeover(&mut world),
            ScenarioId::OutOfOrder => self.run_out_of_order(&mut world),
            ScenarioId::MalformedFlood => self.run_malformed_flood(&mut world),
            ScenarioId::PauseResume => self.run_pause_resume(&mut world),
            ScenarioId::SurfaceFaults => self.run_surface_faults(&mut world),
            ScenarioId::StaleFeed => self.run_stale_feed(&mut world),
            ScenarioId::FleetScale => self.run_fleet_scale(&mut world),
        };
        let failure_reason = outcome.err();
        let passed = failure_reason.is_none();

        if let (Some(path), Some(mut export)) = (export_path, world.take_export()) {
            export.finalize(passed, failure_reason.clone());
            match export.write_to_file(path) {
                Ok(()) => info!("Exported {} frames to {}", export.frames.len(), path),
                Err(e) => error!("Failed to write export: {:?}", e),
            }
        }

        ScenarioResult {
            scenario,
            seed: self.seed,
            passed,
            total_ticks: world.step_count(),
            final_time_secs: world.time(),
            final_driver_count: world.engine().store().len(),
            failure_reason,
            metrics: ScenarioMetrics::collect(&world),
        }
    }

    fn configure(&self, scenario: ScenarioId) -> SimConfig {
        let base = SimConfig {
            seed: self.seed,
            drivers: self.num_drivers,
            live_devices: self.num_drivers.min(2),
            fleet: self.fleet.clone(),
            ..Default::default()
        };

        match scenario {
            ScenarioId::LiveTakeover => SimConfig {
                live_devices: self.num_drivers.min(3),
                live_after_secs: 10.0,
                ..base
            },
            ScenarioId::OutOfOrder => SimConfig {
                relay: RelayFaults {
                    max_delay_ms: 1_500,
                    reorder_rate: 0.3,
                    ..RelayFaults::none()
                },
                fleet: FleetConfig {
                    timestamp_policy: TimestampPolicy::Producer,
                    ..base.fleet.clone()
                },
                ..base
            },
            ScenarioId::MalformedFlood => SimConfig {
                relay: RelayFaults {
                    corrupt_rate: 0.4,
                    ..RelayFaults::none()
                },
                ..base
            },
            ScenarioId::PauseResume => base,
            ScenarioId::SurfaceFaults => SimConfig {
                surface_failure_rate: 0.3,
                ..base
            },
            ScenarioId::StaleFeed => SimConfig {
                fleet: FleetConfig {
                    staleness: StalenessPolicy::evict_after(Duration::from_secs(10)),
                    ..base.fleet.clone()
                },
                ..base
            },
            ScenarioId::FleetScale => SimConfig {
                drivers: self.num_drivers.max(200),
                live_devices: 40,
                relay: RelayFaults {
                    loss_rate: 0.1,
                    max_delay_ms: 500,
                    ..RelayFaults::none()
                },
                ..base
            },
        }
    }

    fn duration(&self, minimum: f64) -> f64 {
        self.max_duration_secs.max(minimum)
    }

    /// FS-001: generator hands drivers over to their phones.
    fn run_live_takeover(&self, world: &mut SimWorld) -> Check {
        let total = self.duration(20.0);

        world.run_for(9.0).map_err(|v| v.to_string())?;
        ensure(world.engine().store().live_count() == 0, || {
            "Drivers went live before any phone posted".to_string()
        })?;

        world.run_for(total - 9.0).map_err(|v| v.to_string())?;

        let store = world.engine().store();
        for device in world.devices() {
            let id = device.driver_id();
            let record = store.get(id).ok_or_else(|| format!("{id} missing from store"))?;
            ensure(record.is_live(), || format!("{id} never went live"))?;
            ensure(record.position.distance_m(&device.position()) < POSITION_TOLERANCE_M, || {
                format!("{id} stored at {}, phone at {}", record.position, device.position())
            })?;
        }
        ensure(store.live_count() == world.devices().len(), || {
            format!("{} live drivers, {} phones", store.live_count(), world.devices().len())
        })?;

        // Detail panel for a live driver
        if let Some(id) = world.devices().first().map(|d| d.driver_id()) {
            ensure(world.click(id), || format!("{id} marker has no click handler"))?;
            world.step().map_err(|v| v.to_string())?;
            let detail = world
                .engine()
                .selected_detail()
                .ok_or_else(|| format!("Clicking {id} selected nothing"))?;
            ensure(detail.provenance == "Live GPS", || {
                format!("{id} detail shows {}", detail.provenance)
            })?;
            ensure(detail.accuracy_label.is_some(), || format!("{id} detail lacks accuracy"))?;
        }

        world.converge().map_err(|v| v.to_string())
    }

    /// FS-002: with producer timestamps, late fixes never win.
    fn run_out_of_order(&self, world: &mut SimWorld) -> Check {
        world.run_for(self.duration(20.0)).map_err(|v| v.to_string())?;
        world.flush_relay().map_err(|v| v.to_string())?;

        let metrics = *world.engine().metrics();
        let reordered = world.relay().stats().reordered;
        // Only a phone's final fix can be reordered without being overtaken
        if reordered > world.devices().len() as u64 {
            ensure(metrics.live.stale > 0, || {
                format!("{reordered} reordered frames but no stale merges")
            })?;
        }

        let store = world.engine().store();
        for device in world.devices() {
            let id = device.driver_id();
            let record = store.get(id).ok_or_else(|| format!("{id} missing from store"))?;
            ensure(record.position.distance_m(&device.position()) < POSITION_TOLERANCE_M, || {
                format!("{id} kept an older fix: {} vs {}", record.position, device.position())
            })?;
        }

        world.converge().map_err(|v| v.to_string())
    }

    /// FS-003: corrupted frames are dropped without side effects.
    fn run_malformed_flood(&self, world: &mut SimWorld) -> Check {
        let junk = [
            "null",
            "{}",
            "{\"type\":\"DRIVER_LOCATION_UPDATE\"}",
            "{\"type\":\"DRIVER_LOCATION_UPDATE\",\"data\":{\"driverId\":-1}}",
            "{\"type\":\"PING\",\"data\":{}}",
        ];
        let now = world.context.now();
        for payload in junk {
            world.relay_mut().post_payload(payload, now);
        }
        world.log_event(SimEvent::info(format!("{} junk frames injected", junk.len())));

        world.run_for(self.duration(20.0)).map_err(|v| v.to_string())?;
        world.flush_relay().map_err(|v| v.to_string())?;

        let relay = world.relay().stats();
        let engine = *world.engine().metrics();
        let expected = relay.corrupted + junk.len() as u64;
        ensure(engine.relay.malformed == expected, || {
            format!("{} frames ignored, expected {expected}", engine.relay.malformed)
        })?;
        ensure(engine.relay.frames == relay.delivered, || {
            format!("Engine saw {} frames, relay delivered {}", engine.relay.frames, relay.delivered)
        })?;
        let roster = world.config.drivers;
        ensure(world.engine().store().len() == roster, || {
            format!("{} drivers in store, roster has {roster}", world.engine().store().len())
        })?;

        world.converge().map_err(|v| v.to_string())
    }

    /// FS-004: pausing freezes simulated drivers only.
    fn run_pause_resume(&self, world: &mut SimWorld) -> Check {
        let total = self.duration(30.0);
        let lead = total / 3.0;

        world.run_for(lead).map_err(|v| v.to_string())?;
        world.engine_mut().pause_tracking();
        world.log_event(SimEvent::info("tracking paused"));

        let frozen: BTreeMap<DriverId, _> = world
            .engine()
            .store()
            .records()
            .filter(|r| r.source == LocationSource::Simulated)
            .map(|r| (r.driver_id, (r.position, r.last_update)))
            .collect();
        let live_before: BTreeMap<DriverId, _> = world
            .engine()
            .store()
            .records()
            .filter(|r| r.is_live())
            .map(|r| (r.driver_id, r.last_update))
            .collect();

        world.run_for(15.0).map_err(|v| v.to_string())?;

        for (id, (position, last_update)) in &frozen {
            let record = world
                .engine()
                .store()
                .get(*id)
                .ok_or_else(|| format!("{id} vanished while paused"))?;
            ensure(record.position == *position && record.last_update == *last_update, || {
                format!("{id} moved while tracking was paused")
            })?;
        }
        for (id, before) in &live_before {
            let after = world.engine().store().get(*id).map(|r| r.last_update);
            ensure(after > Some(*before), || format!("Live {id} stopped updating while paused"))?;
        }
        ensure(world.engine().status().paused, || "Engine not paused".to_string())?;

        world.engine_mut().resume_tracking();
        world.log_event(SimEvent::info("tracking resumed"));
        world.run_for((total - lead - 15.0).max(6.0)).map_err(|v| v.to_string())?;

        let moved = frozen.iter().any(|(id, (position, _))| {
            world
                .engine()
                .store()
                .get(*id)
                .map_or(false, |r| r.position != *position)
        });
        let movable = frozen.keys().any(|id| {
            world.engine().store().get(*id).map_or(false, |r| r.is_active())
        });
        ensure(moved || !movable, || "Nothing moved after resume".to_string())?;

        world.converge().map_err(|v| v.to_string())
    }

    /// FS-005: failed marker operations are retried until the map matches.
    fn run_surface_faults(&self, world: &mut SimWorld) -> Check {
        world.run_for(self.duration(20.0)).map_err(|v| v.to_string())?;

        let failed = world.engine().metrics().markers.failed;
        ensure(failed == 0 || world.engine().surface().failures() >= failed, || {
            "Marker failures not reported by the surface".to_string()
        })?;

        world.flush_relay().map_err(|v| v.to_string())?;
        world.converge().map_err(|v| v.to_string())
    }

    /// FS-006: a phone loses geolocation and its marker ages out.
    fn run_stale_feed(&self, world: &mut SimWorld) -> Check {
        let Some(id) = world.devices().first().map(|d| d.driver_id()) else {
            return world.run_for(self.duration(20.0)).map_err(|v| v.to_string());
        };

        world.run_for(5.0).map_err(|v| v.to_string())?;
        if let Some(device) = world.device_mut(id) {
            device.fail(GeolocationError::PermissionDenied);
        }
        world.run_for(2.0).map_err(|v| v.to_string())?;

        let faults = world.engine().status().producer_faults;
        ensure(
            faults
                .iter()
                .any(|f| f.driver == Some(id) && f.message == "GPS Error: User denied Geolocation"),
            || format!("{id} geolocation failure not surfaced"),
        )?;

        world.run_for(12.0).map_err(|v| v.to_string())?;
        let engine = world.engine();
        ensure(!engine.marker_sync().has_marker(id), || format!("Stale {id} still on the map"))?;
        ensure(
            engine
                .store()
                .records()
                .filter(|r| !r.is_live())
                .all(|r| engine.marker_sync().has_marker(r.driver_id)),
            || "Simulated driver evicted as stale".to_string(),
        )?;
        ensure(engine.store().get(id).map_or(false, |r| r.is_live()), || {
            format!("Stale {id} lost its record")
        })?;
        world.converge().map_err(|v| v.to_string())?;

        if let Some(device) = world.device_mut(id) {
            device.restart();
        }
        world.log_event(SimEvent::info(format!("{id} tracking restarted")));
        world.run_for(self.duration(25.0) - 19.0).map_err(|v| v.to_string())?;

        let status = world.engine().status();
        ensure(world.engine().marker_sync().has_marker(id), || format!("{id} not back on the map"))?;
        ensure(status.producer_faults.iter().all(|f| f.driver != Some(id)), || {
            format!("{id} fault not cleared by fresh fixes")
        })?;

        world.converge().map_err(|v| v.to_string())
    }

    /// FS-007: a large fleet over a lossy relay still converges.
    fn run_fleet_scale(&self, world: &mut SimWorld) -> Check {
        world.run_for(self.duration(20.0)).map_err(|v| v.to_string())?;
        world.flush_relay().map_err(|v| v.to_string())?;

        let drivers = world.config.drivers;
        let status = world.engine().status();
        ensure(status.drivers == drivers, || format!("{} of {drivers} drivers in store", status.drivers))?;
        ensure(status.live_drivers <= world.devices().len(), || {
            format!("{} live drivers from {} phones", status.live_drivers, world.devices().len())
        })?;

        world.converge().map_err(|v| v.to_string())
    }
}
