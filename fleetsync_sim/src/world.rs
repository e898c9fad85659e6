//! SimWorld - The simulation harness container.
//!
//! Owns one engine on a virtual clock plus everything around it: the phones
//! posting live fixes, the relay between them and the engine, and the oracle
//! watching from outside. [`SimWorld::step`] advances the whole world by one
//! fixed step in a fixed order, so a seed replays exactly.

use crate::context::SimContext;
use crate::device::SimulatedDevice;
use crate::exporter::{DriverFrame, SimEvent, SimExport, SimFrame};
use crate::oracle::{InvariantOracle, Violation};
use crate::relay::{RelayFaults, SimRelay};
use crate::surface::FlakySurface;

use fleetsync_core::config::default_roster;
use fleetsync_core::{ConfigError, DriverStatus, FleetConfig, FleetEngine, GeoBounds, LatLng, RosterEntry};
use fleetsync_env::{DriverId, FleetContext};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// The engine as the simulator runs it.
pub type SimEngine = FleetEngine<SimContext, FlakySurface>;

// RNG stream extensions, one per subsystem
const RELAY_STREAM: u64 = 1;
const SURFACE_STREAM: u64 = 2;
const ROSTER_STREAM: u64 = 3;
const DEVICE_STREAM_BASE: u64 = 0x1000;

/// Configuration for a simulation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Master seed for determinism
    pub seed: u64,

    /// Roster size. The first six are the built-in Dubai drivers, the rest
    /// are generated inside the bounding box.
    pub drivers: usize,

    /// How many roster drivers carry a phone posting live fixes
    pub live_devices: usize,

    /// Phones start posting after this much virtual time
    pub live_after_secs: f64,

    /// Virtual time advanced per step
    pub step_ms: u64,

    /// Interval between fixes from each phone
    pub device_interval_ms: u64,

    pub relay: RelayFaults,

    /// Probability a single marker operation fails
    pub surface_failure_rate: f64,

    /// Engine configuration. Its roster is replaced by the generated one.
    pub fleet: FleetConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            drivers: 6,
            live_devices: 2,
            live_after_secs: 0.0,
            step_ms: 500,
            device_interval_ms: 1_000,
            relay: RelayFaults::none(),
            surface_failure_rate: 0.0,
            fleet: FleetConfig::default(),
        }
    }
}

/// Built-in roster, extended with generated drivers up to `count`.
pub fn build_roster(count: usize, bounds: &GeoBounds, rng: &mut ChaCha8Rng) -> Vec<RosterEntry> {
    let mut roster: Vec<RosterEntry> = default_roster().into_iter().take(count).collect();

    for id in (roster.len() as u64 + 1)..=(count as u64) {
        let position = LatLng::new(
            rng.gen_range(bounds.min_lat..=bounds.max_lat),
            rng.gen_range(bounds.min_lng..=bounds.max_lng),
        );
        let status = if rng.gen_bool(0.1) {
            DriverStatus::Offline
        } else {
            DriverStatus::Active
        };
        roster.push(RosterEntry {
            id: DriverId(id),
            name: format!("Driver {id}"),
            vehicle_id: format!("DXB-S-{id:05}"),
            position,
            status,
            performance_score: rng.gen_range(60..=99),
            trips: rng.gen_range(0..400),
            earnings: (rng.gen_range(0.0..20_000.0f64) * 100.0).round() / 100.0,
            red_flag: rng.gen_bool(0.05),
        });
    }

    roster
}

/// Periodic frame capture.
struct Recorder {
    export: SimExport,
    every_steps: u64,
    pending: Vec<SimEvent>,
}

/// The SimWorld - container for the entire simulation.
pub struct SimWorld {
    /// Configuration
    pub config: SimConfig,

    /// Shared simulation context (virtual clock)
    pub context: Arc<SimContext>,

    engine: SimEngine,
    relay: SimRelay,
    devices: Vec<SimulatedDevice>,
    oracle: InvariantOracle,

    next_tick: Duration,
    next_fix: Duration,
    steps: u64,
    recorder: Option<Recorder>,
}

impl SimWorld {
    /// Creates a new SimWorld with the given configuration.
    pub fn new(config: SimConfig) -> Result<Self, ConfigError> {
        let context = SimContext::shared(config.seed);

        let mut fleet = config.fleet.clone();
        let mut roster_rng = context.derive_rng(ROSTER_STREAM);
        fleet.roster = build_roster(config.drivers, &fleet.bounds, &mut roster_rng);

        let devices = fleet
            .roster
            .iter()
            .take(config.live_devices)
            .map(|entry| {
                SimulatedDevice::new(
                    entry.id,
                    entry.name.clone(),
                    entry.vehicle_id.clone(),
                    entry.position,
                    context.derive_rng(DEVICE_STREAM_BASE + entry.id.get()),
                )
            })
            .collect();

        let oracle = InvariantOracle::new(fleet.bounds);
        let relay = SimRelay::new(config.relay, context.derive_rng(RELAY_STREAM));
        let surface = FlakySurface::new(config.surface_failure_rate, context.derive_rng(SURFACE_STREAM));
        let engine = FleetEngine::new(context.clone(), fleet, surface)?;

        Ok(Self {
            config,
            context,
            engine,
            relay,
            devices,
            oracle,
            next_tick: Duration::ZERO,
            next_fix: Duration::ZERO,
            steps: 0,
            recorder: None,
        })
    }

    /// Capture a frame every `every_steps` steps.
    pub fn with_export(mut self, scenario: &str, every_steps: u64) -> Self {
        self.recorder = Some(Recorder {
            export: SimExport::new(scenario, self.config.seed),
            every_steps: every_steps.max(1),
            pending: Vec::new(),
        });
        self
    }

    /// Advances the world by one step.
    ///
    /// Order within a step: phones post fixes, the relay delivers what is
    /// due, the engine ticks if its interval elapsed, queued clicks are
    /// applied, the oracle checks, then the clock moves.
    pub fn step(&mut self) -> Result<(), Violation> {
        let now = self.context.now();

        if now >= self.next_fix {
            self.post_fixes(now);
            self.next_fix += Duration::from_millis(self.config.device_interval_ms.max(1));
        }

        for frame in self.relay.deliver_due(now) {
            self.engine.on_relay_frame(&frame);
        }

        if now >= self.next_tick {
            self.engine.on_tick();
            self.next_tick += self.engine.config().tick_interval();
        }

        self.engine.drain_clicks();
        self.oracle.observe(&self.engine)?;
        self.record_frame();

        self.context.advance_time(Duration::from_millis(self.config.step_ms.max(1)));
        self.steps += 1;
        Ok(())
    }

    fn post_fixes(&mut self, now: Duration) {
        if now.as_secs_f64() < self.config.live_after_secs {
            return;
        }

        let dt = Duration::from_millis(self.config.device_interval_ms);
        let clock = self.context.timestamp();
        let mut errors = Vec::new();

        for device in &mut self.devices {
            match device.fix_frame(dt, clock) {
                Ok(Some(frame)) => self.relay.post(frame, now),
                Ok(None) => {}
                Err(err) => errors.push((device.driver_id(), err)),
            }
        }

        for (id, err) in errors {
            self.engine.report_producer_error(Some(id), err.to_string());
            self.log_event(SimEvent::warn(format!("{id}: {err}")));
        }
    }

    fn record_frame(&mut self) {
        let Some(recorder) = self.recorder.as_mut() else {
            return;
        };
        if self.steps % recorder.every_steps != 0 {
            return;
        }

        let sync = self.engine.marker_sync();
        let drivers = self
            .engine
            .store()
            .records()
            .map(|r| DriverFrame::new(r, sync.has_marker(r.driver_id)))
            .collect();

        recorder.export.add_frame(SimFrame {
            time_sec: self.context.now().as_secs_f64(),
            drivers,
            markers: sync.marker_count(),
            events: std::mem::take(&mut recorder.pending),
        });
    }

    /// Note an event in the export, if one is being recorded.
    pub fn log_event(&mut self, event: SimEvent) {
        debug!(t = self.time(), event = %event.message, "sim event");
        if let Some(recorder) = self.recorder.as_mut() {
            recorder.pending.push(event);
        }
    }

    /// Steps until `secs` of virtual time have passed.
    pub fn run_for(&mut self, secs: f64) -> Result<(), Violation> {
        let Some(end) = Duration::try_from_secs_f64(secs.max(0.0))
            .ok()
            .and_then(|length| self.context.now().checked_add(length))
        else {
            warn!(secs, "run length out of range, not stepping");
            return Ok(());
        };
        while self.context.now() < end {
            self.step()?;
        }
        Ok(())
    }

    /// Delivers every frame still in flight, regardless of its delay.
    pub fn flush_relay(&mut self) -> Result<(), Violation> {
        for frame in self.relay.deliver_due(Duration::MAX) {
            self.engine.on_relay_frame(&frame);
        }
        self.oracle.observe(&self.engine)
    }

    /// Heals the surface and runs the end-of-run checks.
    pub fn converge(&mut self) -> Result<(), Violation> {
        self.engine.surface_mut().heal();
        self.oracle.check_converged(&mut self.engine)
    }

    /// Clicks a rendered marker. Returns false if it has no click handler.
    pub fn click(&self, id: DriverId) -> bool {
        self.engine.surface().inner().click(id)
    }

    /// Finished export, if one was recorded.
    pub fn take_export(&mut self) -> Option<SimExport> {
        self.recorder.take().map(|r| r.export)
    }

    pub fn engine(&self) -> &SimEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut SimEngine {
        &mut self.engine
    }

    pub fn relay(&self) -> &SimRelay {
        &self.relay
    }

    pub fn relay_mut(&mut self) -> &mut SimRelay {
        &mut self.relay
    }

    pub fn devices(&self) -> &[SimulatedDevice] {
        &self.devices
    }

    pub fn device_mut(&mut self, id: DriverId) -> Option<&mut SimulatedDevice> {
        self.devices.iter_mut().find(|d| d.driver_id() == id)
    }

    pub fn oracle(&self) -> &InvariantOracle {
        &self.oracle
    }

    /// Returns the current simulation time in seconds.
    pub fn time(&self) -> f64 {
        self.context.now().as_secs_f64()
    }

    /// Returns the number of steps taken.
    pub fn step_count(&self) -> u64 {
        self.steps
    }
}
