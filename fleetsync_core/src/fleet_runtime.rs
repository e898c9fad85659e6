//! Fleet Runtime - Single-writer engine around the store.
//!
//! Wires the producers, the store and the reconciler to the environment
//! context. One task owns everything; the timer, the relay and host commands
//! are serialized through `tokio::select!`, so the store needs no lock.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        FleetEngine                           │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │             Context: FleetContext                      │  │
//! │  │  • timestamp() → ingestion clock, tick timestamps      │  │
//! │  │  • sleep()     → generator tick                        │  │
//! │  │  • derive_rng()→ motion model randomness               │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! │                                                              │
//! │  timer ──► MotionGenerator ──┐                               │
//! │                              ├──► DriverStore ──► MarkerSync ──► MapSurface
//! │  relay ──► RelayListener ────┘                         ▲     │
//! │                                                        │     │
//! │  commands (click, remove, pause, queries) ─────────────┘     │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every store mutation is followed by a synchronous reconciliation pass, so
//! marker latency is bounded by event latency, not by the tick.
//!
//! # Usage
//!
//! ```ignore
//! use fleetsync_core::{FleetConfig, FleetEngine, InMemorySurface};
//! use fleetsync_env::{channel_relay, TokioContext};
//! use std::sync::Arc;
//!
//! let (sender, relay) = channel_relay();
//! let engine = FleetEngine::new(TokioContext::shared(), FleetConfig::default(), InMemorySurface::new())?;
//! let handle = engine.spawn(Arc::new(relay));
//!
//! sender.post(payload_from_tracking_client)?;
//! let status = handle.status().await?;
//! ```

use crate::config::{ConfigError, FleetConfig};
use crate::fleet_motion::{MotionGenerator, MotionModel, RandomWalk};
use crate::fleet_relay::{RelayListener, RelayOutcome};
use crate::fleet_store::{DriverLocationRecord, DriverStore, LocationEvent, LocationSource, MergeOutcome};
use crate::fleet_sync::{MarkerSync, SyncReport};
use crate::metrics::EngineMetrics;
use crate::selection::{DriverDetail, Selection, SelectionListener};
use crate::surface::{ClickCallback, MapSurface};
use fleetsync_env::{DriverId, FleetContext, RelayFrame, RelayTransport, Timestamp};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Seed extension for the motion model's RNG stream.
const MOTION_RNG_STREAM: u64 = 0x6d6f_7469_6f6e;

// ============================================================================
// STATUS
// ============================================================================

/// A geolocation failure reported by a tracking client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProducerFault {
    /// `None` when the failure is not tied to a driver session
    pub driver: Option<DriverId>,
    pub message: String,
}

/// Point-in-time engine summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FleetStatus {
    pub now: Timestamp,
    pub drivers: usize,
    pub live_drivers: usize,
    pub markers: usize,
    pub paused: bool,
    pub selected: Option<DriverId>,
    pub producer_faults: Vec<ProducerFault>,
    pub metrics: EngineMetrics,
}

// ============================================================================
// FLEET ENGINE
// ============================================================================

/// The fleet location engine.
///
/// Generic over the context and the rendering surface, so the same engine
/// runs against tokio and a real map, or a virtual clock and a headless
/// surface.
pub struct FleetEngine<Ctx, S>
where
    Ctx: FleetContext,
    S: MapSurface,
{
    ctx: Arc<Ctx>,
    config: FleetConfig,
    store: DriverStore,
    generator: MotionGenerator,
    listener: RelayListener,
    sync: MarkerSync,
    selection: Selection,
    surface: S,

    /// Marker clicks posted by surface callbacks
    clicks: mpsc::UnboundedReceiver<DriverId>,

    driver_faults: BTreeMap<DriverId, String>,
    global_fault: Option<String>,
    metrics: EngineMetrics,
}

impl<Ctx, S> FleetEngine<Ctx, S>
where
    Ctx: FleetContext,
    S: MapSurface,
{
    /// Create an engine with the random-walk motion model.
    ///
    /// The walk draws from `ctx.derive_rng`, so a seeded context replays the
    /// same movement.
    pub fn new(ctx: Arc<Ctx>, config: FleetConfig, surface: S) -> Result<Self, ConfigError> {
        config.validate()?;

        let model = RandomWalk::new(ctx.derive_rng(MOTION_RNG_STREAM), &config.motion)?;
        let generator = MotionGenerator::new(Box::new(model), &config)?;

        let (click_tx, clicks) = mpsc::unbounded_channel();
        let on_click: ClickCallback = Arc::new(move |id| {
            // Receiver gone means the engine stopped; nothing to select
            let _ = click_tx.send(id);
        });

        info!(
            tick_ms = config.tick_interval_ms,
            roster = config.roster.len(),
            seed = ctx.seed(),
            "fleet engine created"
        );

        Ok(Self {
            store: DriverStore::new(config.record_defaults()),
            generator,
            listener: RelayListener::new(config.timestamp_policy),
            sync: MarkerSync::new(config.staleness).with_click_handler(on_click),
            selection: Selection::new(),
            surface,
            clicks,
            driver_faults: BTreeMap::new(),
            global_fault: None,
            metrics: EngineMetrics::default(),
            ctx,
            config,
        })
    }

    /// Replace the motion model.
    pub fn with_motion_model(mut self, model: Box<dyn MotionModel>) -> Self {
        self.generator = MotionGenerator::from_validated(model, &self.config);
        self
    }

    fn now(&self) -> Timestamp {
        self.ctx.timestamp()
    }

    // ========================================================================
    // PRODUCERS
    // ========================================================================

    /// Generator tick followed by a reconciliation pass.
    ///
    /// While tracking is paused the generator emits nothing and only the
    /// reconciliation pass runs.
    pub fn on_tick(&mut self) -> SyncReport {
        let now = self.now();
        self.metrics.ticks += 1;

        for event in self.generator.tick(&self.store, now) {
            let outcome = self.store.upsert(event);
            self.metrics.record_simulated(&outcome);
        }

        self.reconcile()
    }

    /// Handle one relay frame. Malformed frames are dropped without error.
    pub fn on_relay_frame(&mut self, frame: &RelayFrame) -> RelayOutcome {
        let received_at = self.now();
        let outcome = self.listener.handle_frame(frame, received_at, &mut self.store);
        self.metrics.record_relay(&outcome, self.listener.stats());

        if let RelayOutcome::Merged { driver_id, outcome: merge } = &outcome {
            if merge.is_applied() {
                self.clear_faults(*driver_id);
                self.reconcile();
            }
        }

        outcome
    }

    /// Merge an already-normalized event, then reconcile.
    pub fn ingest(&mut self, event: LocationEvent) -> MergeOutcome {
        let driver_id = event.driver_id;
        let source = event.source;
        let outcome = self.store.upsert(event);

        match source {
            LocationSource::Simulated => self.metrics.record_simulated(&outcome),
            LocationSource::Live => self.metrics.live.record(&outcome),
        }

        if outcome.is_applied() {
            if source == LocationSource::Live {
                self.clear_faults(driver_id);
            }
            self.reconcile();
        }
        outcome
    }

    /// One reconciliation pass against the current store.
    pub fn reconcile(&mut self) -> SyncReport {
        let now = self.now();
        let report = self.sync.reconcile(&self.store, &mut self.surface, now);
        self.metrics.record_sync(&report);
        report
    }

    // ========================================================================
    // UI COMMANDS
    // ========================================================================

    /// A marker was clicked. Returns true if the selection changed.
    pub fn on_marker_click(&mut self, id: DriverId) -> bool {
        debug!(driver = %id, "marker clicked");
        self.selection.select(id)
    }

    /// Apply clicks queued by surface callbacks. Returns how many were handled.
    pub fn drain_clicks(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(id) = self.clicks.try_recv() {
            self.on_marker_click(id);
            handled += 1;
        }
        handled
    }

    pub fn clear_selection(&mut self) -> bool {
        self.selection.clear()
    }

    /// Register the `onDriverSelected` callback.
    pub fn on_driver_selected(&mut self, listener: SelectionListener) {
        self.selection.set_listener(listener);
    }

    /// Tear down a driver's marker. The record stays in the store.
    pub fn remove_driver(&mut self, id: DriverId) -> SyncReport {
        if self.sync.dismiss(id) {
            info!(driver = %id, "driver removed from map");
        }
        if self.selection.selected() == Some(id) {
            self.selection.clear();
        }
        self.reconcile()
    }

    /// Put a removed driver back on the map.
    pub fn restore_driver(&mut self, id: DriverId) -> SyncReport {
        if self.sync.restore(id) {
            info!(driver = %id, "driver restored to map");
        }
        self.reconcile()
    }

    pub fn pause_tracking(&mut self) -> bool {
        self.generator.pause()
    }

    pub fn resume_tracking(&mut self) -> bool {
        self.generator.resume()
    }

    /// Record a geolocation failure from a tracking client. It stays visible
    /// until the next accepted live event for that driver; nothing is retried.
    pub fn report_producer_error(&mut self, driver: Option<DriverId>, message: impl Into<String>) {
        let message = message.into();
        warn!(driver = ?driver, error = %message, "tracking client reported a location error");
        self.metrics.producer_faults += 1;

        match driver {
            Some(id) => {
                self.driver_faults.insert(id, message);
            }
            None => self.global_fault = Some(message),
        }
    }

    fn clear_faults(&mut self, id: DriverId) {
        self.driver_faults.remove(&id);
        self.global_fault = None;
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    /// Detail panel for the selected driver, resolved against the store now.
    pub fn selected_detail(&self) -> Option<DriverDetail> {
        let detail = self
            .selection
            .resolve(&self.store, &self.config.staleness, self.now())?;
        let fault = self
            .driver_faults
            .get(&detail.driver_id)
            .or(self.global_fault.as_ref())
            .cloned();
        Some(detail.with_fault(fault))
    }

    /// Point-in-time copy of every record.
    pub fn snapshot(&self) -> Vec<DriverLocationRecord> {
        self.store.all()
    }

    pub fn status(&self) -> FleetStatus {
        let mut producer_faults: Vec<ProducerFault> = self
            .driver_faults
            .iter()
            .map(|(id, message)| ProducerFault {
                driver: Some(*id),
                message: message.clone(),
            })
            .collect();
        if let Some(message) = &self.global_fault {
            producer_faults.push(ProducerFault {
                driver: None,
                message: message.clone(),
            });
        }

        FleetStatus {
            now: self.now(),
            drivers: self.store.len(),
            live_drivers: self.store.live_count(),
            markers: self.sync.marker_count(),
            paused: self.generator.is_paused(),
            selected: self.selection.selected(),
            producer_faults,
            metrics: self.metrics,
        }
    }

    pub fn store(&self) -> &DriverStore {
        &self.store
    }

    pub fn marker_sync(&self) -> &MarkerSync {
        &self.sync
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn surface_mut(&mut self) -> &mut S {
        &mut self.surface
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn context(&self) -> &Arc<Ctx> {
        &self.ctx
    }

    pub fn is_paused(&self) -> bool {
        self.generator.is_paused()
    }

    pub fn selected(&self) -> Option<DriverId> {
        self.selection.selected()
    }

    // ========================================================================
    // ACTOR LOOP
    // ========================================================================

    /// Apply one host command. Returns false on shutdown.
    pub fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Click(id) => {
                self.on_marker_click(id);
            }
            Command::ClearSelection => {
                self.clear_selection();
            }
            Command::RemoveDriver(id) => {
                self.remove_driver(id);
            }
            Command::RestoreDriver(id) => {
                self.restore_driver(id);
            }
            Command::Pause => {
                self.pause_tracking();
            }
            Command::Resume => {
                self.resume_tracking();
            }
            Command::ProducerError { driver, message } => {
                self.report_producer_error(driver, message);
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::Status(reply) => {
                let _ = reply.send(self.status());
            }
            Command::SelectedDetail(reply) => {
                let _ = reply.send(self.selected_detail());
            }
            Command::Shutdown => return false,
        }
        true
    }

    /// Drive the engine until shutdown or until every handle is dropped.
    pub async fn run<R>(&mut self, relay: &R, mut commands: mpsc::UnboundedReceiver<Command>)
    where
        R: RelayTransport + ?Sized,
    {
        let ctx = self.ctx.clone();
        let interval = self.config.tick_interval();
        let mut next_tick = ctx.now() + interval;
        let mut relay_open = true;

        info!(relay = relay.label(), "fleet engine running");

        loop {
            let wait = next_tick.saturating_sub(ctx.now());

            tokio::select! {
                _ = ctx.sleep(wait) => {
                    self.on_tick();
                    next_tick += interval;
                    // Fell behind (host suspended, slow surface): skip missed ticks
                    let now = ctx.now();
                    if next_tick <= now {
                        next_tick = now + interval;
                    }
                }
                frame = relay.recv(), if relay_open => match frame {
                    Some(frame) => {
                        self.on_relay_frame(&frame);
                    }
                    None => {
                        info!(relay = relay.label(), "relay closed, continuing with simulated data");
                        relay_open = false;
                    }
                },
                Some(id) = self.clicks.recv() => {
                    self.on_marker_click(id);
                }
                command = commands.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command) {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }

        info!(ticks = self.metrics.ticks, "fleet engine stopped");
    }
}

impl<Ctx, S> FleetEngine<Ctx, S>
where
    Ctx: FleetContext,
    S: MapSurface + 'static,
{
    /// Move the engine onto its own task and return a handle to it.
    pub fn spawn<R>(mut self, relay: Arc<R>) -> FleetHandle
    where
        R: RelayTransport,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = self.ctx.clone();
        ctx.spawn("fleet-engine", async move {
            self.run(relay.as_ref(), rx).await;
        });
        FleetHandle { tx }
    }
}

// ============================================================================
// COMMANDS & HANDLE
// ============================================================================

/// Requests sent to a running engine.
#[derive(Debug)]
pub enum Command {
    Click(DriverId),
    ClearSelection,
    RemoveDriver(DriverId),
    RestoreDriver(DriverId),
    Pause,
    Resume,
    ProducerError {
        driver: Option<DriverId>,
        message: String,
    },
    Snapshot(oneshot::Sender<Vec<DriverLocationRecord>>),
    Status(oneshot::Sender<FleetStatus>),
    SelectedDetail(oneshot::Sender<Option<DriverDetail>>),
    Shutdown,
}

/// Cloneable handle to a spawned engine.
#[derive(Debug, Clone)]
pub struct FleetHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl FleetHandle {
    /// Build a handle around an existing command channel.
    pub fn from_sender(tx: mpsc::UnboundedSender<Command>) -> Self {
        Self { tx }
    }

    pub fn send(&self, command: Command) -> Result<(), HandleError> {
        self.tx.send(command).map_err(|_| HandleError::EngineStopped)
    }

    pub fn click(&self, id: DriverId) -> Result<(), HandleError> {
        self.send(Command::Click(id))
    }

    pub fn clear_selection(&self) -> Result<(), HandleError> {
        self.send(Command::ClearSelection)
    }

    pub fn remove_driver(&self, id: DriverId) -> Result<(), HandleError> {
        self.send(Command::RemoveDriver(id))
    }

    pub fn restore_driver(&self, id: DriverId) -> Result<(), HandleError> {
        self.send(Command::RestoreDriver(id))
    }

    pub fn pause(&self) -> Result<(), HandleError> {
        self.send(Command::Pause)
    }

    pub fn resume(&self) -> Result<(), HandleError> {
        self.send(Command::Resume)
    }

    pub fn report_producer_error(
        &self,
        driver: Option<DriverId>,
        message: impl Into<String>,
    ) -> Result<(), HandleError> {
        self.send(Command::ProducerError {
            driver,
            message: message.into(),
        })
    }

    pub async fn snapshot(&self) -> Result<Vec<DriverLocationRecord>, HandleError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot(reply))?;
        rx.await.map_err(|_| HandleError::EngineStopped)
    }

    pub async fn status(&self) -> Result<FleetStatus, HandleError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Status(reply))?;
        rx.await.map_err(|_| HandleError::EngineStopped)
    }

    pub async fn selected_detail(&self) -> Result<Option<DriverDetail>, HandleError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SelectedDetail(reply))?;
        rx.await.map_err(|_| HandleError::EngineStopped)
    }

    pub fn shutdown(&self) -> Result<(), HandleError> {
        self.send(Command::Shutdown)
    }
}

/// Errors returned by [`FleetHandle`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandleError {
    #[error("Fleet engine is no longer running")]
    EngineStopped,
}

// ============================================================================
// TESTS
// ============================================================================
