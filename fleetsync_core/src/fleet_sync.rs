//! The "SYNC" Engine - Marker Reconciliation
//!
//! Makes the rendered map match the driver store. The reconciler remembers
//! what it last pushed to the surface for every driver and diffs each record
//! against that memory:
//!
//! | store           | rendered         | operation                      |
//! |-----------------|------------------|--------------------------------|
//! | record          | none             | create + register click        |
//! | moved record    | marker           | move                           |
//! | changed fields  | marker           | update content                 |
//! | dismissed/evict | marker           | remove                         |
//! | unchanged       | marker           | nothing                        |
//!
//! Because the diff is against the last *successful* push, a pass over an
//! unchanged store issues no operations, and a driver whose operation failed
//! is naturally retried on the next pass.

use crate::config::StalenessPolicy;
use crate::fleet_store::{DriverLocationRecord, DriverStore, LatLng};
use crate::surface::{format_earnings, ClickCallback, MapSurface, MarkerContent, SurfaceError};
use fleetsync_env::{DriverId, Timestamp};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

impl MarkerContent {
    /// Derive marker content from a record. The stored source decides the
    /// provenance shown.
    pub fn from_record(record: &DriverLocationRecord, stale: bool) -> Self {
        let status_label = if stale {
            "stale".to_string()
        } else {
            record.status.to_string()
        };

        Self {
            title: record.driver_name.clone(),
            vehicle_id: record.vehicle_id.clone(),
            color: Self::color_for(record.status, record.red_flag, stale),
            status_label,
            source: record.source,
            trips: record.trips,
            earnings_label: format_earnings(record.earnings),
            attention: record.red_flag,
            stale,
        }
    }
}

// ============================================================================
// SYNC REPORT
// ============================================================================

/// Operations issued by one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub created: usize,
    pub moved: usize,
    pub updated: usize,
    pub removed: usize,
    /// Operations the surface rejected; retried next pass
    pub failed: usize,
}

impl SyncReport {
    /// Successful marker operations.
    pub fn ops(&self) -> usize {
        self.created + self.moved + self.updated + self.removed
    }

    /// True if the pass changed nothing and nothing failed.
    pub fn is_noop(&self) -> bool {
        self.ops() == 0 && self.failed == 0
    }
}

// ============================================================================
// MARKER SYNC
// ============================================================================

/// Last state successfully pushed to the surface for one driver.
#[derive(Debug, Clone)]
struct SyncedMarker {
    position: LatLng,
    content: MarkerContent,
    click_registered: bool,
}

/// Reconciler between the driver store and a [`MapSurface`].
pub struct MarkerSync {
    markers: BTreeMap<DriverId, SyncedMarker>,
    dismissed: BTreeSet<DriverId>,
    staleness: StalenessPolicy,
    on_click: Option<ClickCallback>,
    passes: u64,
}

impl MarkerSync {
    pub fn new(staleness: StalenessPolicy) -> Self {
        Self {
            markers: BTreeMap::new(),
            dismissed: BTreeSet::new(),
            staleness,
            on_click: None,
            passes: 0,
        }
    }

    /// Register `callback` on every marker this reconciler creates.
    pub fn with_click_handler(mut self, callback: ClickCallback) -> Self {
        self.on_click = Some(callback);
        self
    }

    /// Run one pass. Surface failures are logged and counted; they never
    /// abort the pass.
    pub fn reconcile<S>(&mut self, store: &DriverStore, surface: &mut S, now: Timestamp) -> SyncReport
    where
        S: MapSurface + ?Sized,
    {
        self.passes += 1;
        let mut report = SyncReport::default();

        for record in store.records() {
            let id = record.driver_id;
            let stale = self.staleness.is_record_stale(record, now);

            if self.dismissed.contains(&id) || (stale && self.staleness.evict) {
                self.remove(id, surface, &mut report);
                continue;
            }

            let content = MarkerContent::from_record(record, stale);

            match self.markers.get_mut(&id) {
                None => {
                    if let Err(err) = surface.create_marker(id, record.position, &content) {
                        surface_failed("create", id, &err, &mut report);
                        continue;
                    }
                    info!(driver = %id, position = %record.position, source = %record.source, "marker created");
                    report.created += 1;
                    self.markers.insert(
                        id,
                        SyncedMarker {
                            position: record.position,
                            content,
                            click_registered: false,
                        },
                    );
                }
                Some(marker) => {
                    if marker.position != record.position {
                        match surface.move_marker(id, record.position) {
                            Ok(()) => {
                                marker.position = record.position;
                                report.moved += 1;
                            }
                            Err(err) => surface_failed("move", id, &err, &mut report),
                        }
                    }
                    if marker.content != content {
                        match surface.update_marker_content(id, &content) {
                            Ok(()) => {
                                marker.content = content;
                                report.updated += 1;
                            }
                            Err(err) => surface_failed("update", id, &err, &mut report),
                        }
                    }
                }
            }

            self.register_click(id, surface, &mut report);
        }

        // Markers with no record behind them
        let orphans: Vec<DriverId> = self
            .markers
            .keys()
            .copied()
            .filter(|id| !store.contains(*id))
            .collect();
        for id in orphans {
            self.remove(id, surface, &mut report);
        }

        if !report.is_noop() {
            debug!(
                pass = self.passes,
                created = report.created,
                moved = report.moved,
                updated = report.updated,
                removed = report.removed,
                failed = report.failed,
                "reconciliation pass"
            );
        }

        report
    }

    fn register_click<S>(&mut self, id: DriverId, surface: &mut S, report: &mut SyncReport)
    where
        S: MapSurface + ?Sized,
    {
        let (Some(callback), Some(marker)) = (self.on_click.as_ref(), self.markers.get_mut(&id)) else {
            return;
        };
        if marker.click_registered {
            return;
        }
        match surface.on_marker_click(id, callback.clone()) {
            Ok(()) => marker.click_registered = true,
            Err(err) => surface_failed("register click", id, &err, report),
        }
    }

    fn remove<S>(&mut self, id: DriverId, surface: &mut S, report: &mut SyncReport)
    where
        S: MapSurface + ?Sized,
    {
        if !self.markers.contains_key(&id) {
            return;
        }
        match surface.remove_marker(id) {
            // Already gone on the surface side; forget it too
            Ok(()) | Err(SurfaceError::UnknownMarker(_)) => {
                self.markers.remove(&id);
                report.removed += 1;
                info!(driver = %id, "marker removed");
            }
            Err(err) => surface_failed("remove", id, &err, report),
        }
    }

    // ========================================================================
    // EXPLICIT REMOVAL
    // ========================================================================

    /// Hide a driver's marker. The store record is kept. Returns false if the
    /// driver was already dismissed.
    pub fn dismiss(&mut self, id: DriverId) -> bool {
        self.dismissed.insert(id)
    }

    /// Allow a dismissed driver back on the map from the next pass.
    pub fn restore(&mut self, id: DriverId) -> bool {
        self.dismissed.remove(&id)
    }

    pub fn is_dismissed(&self, id: DriverId) -> bool {
        self.dismissed.contains(&id)
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    /// Number of markers currently rendered.
    pub fn marker_count(&self) -> usize {
        self.markers.len()
    }

    pub fn has_marker(&self, id: DriverId) -> bool {
        self.markers.contains_key(&id)
    }

    /// Position last pushed to the surface for `id`.
    pub fn rendered_position(&self, id: DriverId) -> Option<LatLng> {
        self.markers.get(&id).map(|m| m.position)
    }

    /// Content last pushed to the surface for `id`.
    pub fn rendered_content(&self, id: DriverId) -> Option<&MarkerContent> {
        self.markers.get(&id).map(|m| &m.content)
    }

    pub fn staleness(&self) -> &StalenessPolicy {
        &self.staleness
    }

    pub fn pass_count(&self) -> u64 {
        self.passes
    }
}

fn surface_failed(op: &str, id: DriverId, err: &SurfaceError, report: &mut SyncReport) {
    warn!(driver = %id, op, error = %err, "surface operation failed, will retry");
    report.failed += 1;
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet_store::{DriverProfile, LocationEvent, LocationSource};
    use crate::surface::{InMemorySurface, MarkerColor, MarkerOp};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn d(id: u64) -> DriverId {
        DriverId(id)
    }

    fn sim(id: u64, t: u64, lat: f64, lng: f64) -> LocationEvent {
        LocationEvent::simulated(d(id), LatLng::new(lat, lng), Timestamp(t))
    }

    fn live(id: u64, t: u64, lat: f64, lng: f64) -> LocationEvent {
        LocationEvent::live(d(id), LatLng::new(lat, lng), Timestamp(t))
    }

    /// Wraps an in-memory surface and rejects operations for one driver.
    struct Flaky {
        inner: InMemorySurface,
        broken: Option<DriverId>,
    }

    impl Flaky {
        fn check(&self, id: DriverId) -> Result<(), SurfaceError> {
            match self.broken {
                Some(b) if b == id => Err(SurfaceError::Rejected {
                    id,
                    reason: "boom".to_string(),
                }),
                _ => Ok(()),
            }
        }
    }

    impl MapSurface for Flaky {
        fn create_marker(&mut self, id: DriverId, p: LatLng, c: &MarkerContent) -> Result<(), SurfaceError> {
            self.check(id)?;
            self.inner.create_marker(id, p, c)
        }
        fn move_marker(&mut self, id: DriverId, p: LatLng) -> Result<(), SurfaceError> {
            self.check(id)?;
            self.inner.move_marker(id, p)
        }
        fn update_marker_content(&mut self, id: DriverId, c: &MarkerContent) -> Result<(), SurfaceError> {
            self.check(id)?;
            self.inner.update_marker_content(id, c)
        }
        fn remove_marker(&mut self, id: DriverId) -> Result<(), SurfaceError> {
            self.check(id)?;
            self.inner.remove_marker(id)
        }
        fn on_marker_click(&mut self, id: DriverId, cb: ClickCallback) -> Result<(), SurfaceError> {
            self.check(id)?;
            self.inner.on_marker_click(id, cb)
        }
    }

    #[test]
    fn test_live_takeover_example() {
        let mut store = DriverStore::with_defaults();
        let mut surface = InMemorySurface::new();
        let mut sync = MarkerSync::new(StalenessPolicy::default());

        // Simulated at t=100 creates the marker
        store.upsert(sim(1, 100, 25.20, 55.27));
        let report = sync.reconcile(&store, &mut surface, Timestamp(100));
        assert_eq!(report.created, 1);
        assert_eq!(surface.marker(d(1)).unwrap().position, LatLng::new(25.20, 55.27));

        // Relay at t=150 flips the source and moves the marker
        store.upsert(LocationEvent::live(d(1), LatLng::new(25.21, 55.28), Timestamp(150)));
        let report = sync.reconcile(&store, &mut surface, Timestamp(150));
        assert_eq!(report.moved, 1);
        assert_eq!(report.updated, 1);
        assert_eq!(surface.marker(d(1)).unwrap().content.source, LocationSource::Live);

        // Simulated t=200 is rejected, marker stays
        assert!(!store.upsert(sim(1, 200, 25.22, 55.29)).is_applied());
        let report = sync.reconcile(&store, &mut surface, Timestamp(200));
        assert!(report.is_noop());
        assert_eq!(surface.marker(d(1)).unwrap().position, LatLng::new(25.21, 55.28));
    }

    #[test]
    fn test_unchanged_store_issues_no_ops() {
        let mut store = DriverStore::with_defaults();
        let mut surface = InMemorySurface::new();
        let mut sync = MarkerSync::new(StalenessPolicy::default())
            .with_click_handler(Arc::new(|_| {}));

        for id in 1..=5 {
            store.upsert(sim(id, 10, 25.2, 55.27 + id as f64 * 0.001));
        }
        sync.reconcile(&store, &mut surface, Timestamp(10));
        surface.take_ops();

        for _ in 0..3 {
            assert!(sync.reconcile(&store, &mut surface, Timestamp(10)).is_noop());
        }
        assert!(surface.ops().is_empty());
    }

    #[test]
    fn test_create_registers_click_once() {
        let mut store = DriverStore::with_defaults();
        let mut surface = InMemorySurface::new();
        let clicks = Arc::new(Mutex::new(Vec::new()));
        let sink = clicks.clone();
        let mut sync = MarkerSync::new(StalenessPolicy::default())
            .with_click_handler(Arc::new(move |id| sink.lock().unwrap().push(id)));

        store.upsert(sim(2, 1, 25.2, 55.27));
        sync.reconcile(&store, &mut surface, Timestamp(1));
        sync.reconcile(&store, &mut surface, Timestamp(2));

        let registrations = surface
            .ops()
            .iter()
            .filter(|op| matches!(op, MarkerOp::RegisterClick { .. }))
            .count();
        assert_eq!(registrations, 1);

        assert!(surface.click(d(2)));
        assert_eq!(*clicks.lock().unwrap(), vec![d(2)]);
    }

    #[test]
    fn test_content_change_without_move() {
        let mut store = DriverStore::with_defaults();
        let mut surface = InMemorySurface::new();
        let mut sync = MarkerSync::new(StalenessPolicy::default());

        store.upsert(sim(1, 1, 25.2, 55.27));
        sync.reconcile(&store, &mut surface, Timestamp(1));

        store.upsert(sim(1, 2, 25.2, 55.27).with_profile(DriverProfile {
            performance_score: 70,
            earnings: 10.0,
            trips: 1,
            red_flag: true,
        }));
        let report = sync.reconcile(&store, &mut surface, Timestamp(2));

        assert_eq!(report, SyncReport { updated: 1, ..Default::default() });
        assert_eq!(surface.marker(d(1)).unwrap().content.color, MarkerColor::Red);
    }

    #[test]
    fn test_marker_count_tracks_distinct_drivers() {
        let mut store = DriverStore::with_defaults();
        let mut surface = InMemorySurface::new();
        let mut sync = MarkerSync::new(StalenessPolicy::default());

        for (t, id) in [3u64, 1, 3, 2, 1, 3].into_iter().enumerate() {
            store.upsert(sim(id, t as u64, 25.2, 55.27 + t as f64 * 0.001));
            sync.reconcile(&store, &mut surface, Timestamp(t as u64));
        }

        assert_eq!(sync.marker_count(), 3);
        assert_eq!(surface.len(), 3);
    }

    #[test]
    fn test_dismiss_and_restore() {
        let mut store = DriverStore::with_defaults();
        let mut surface = InMemorySurface::new();
        let mut sync = MarkerSync::new(StalenessPolicy::default());

        store.upsert(sim(1, 1, 25.2, 55.27));
        sync.reconcile(&store, &mut surface, Timestamp(1));

        assert!(sync.dismiss(d(1)));
        assert!(!sync.dismiss(d(1)));
        let report = sync.reconcile(&store, &mut surface, Timestamp(2));
        assert_eq!(report.removed, 1);
        assert!(surface.is_empty());
        assert!(store.contains(d(1)));

        // Updates while dismissed do not bring it back
        store.upsert(sim(1, 3, 25.21, 55.27));
        assert!(sync.reconcile(&store, &mut surface, Timestamp(3)).is_noop());

        assert!(sync.restore(d(1)));
        let report = sync.reconcile(&store, &mut surface, Timestamp(4));
        assert_eq!(report.created, 1);
        assert_eq!(surface.marker(d(1)).unwrap().position, LatLng::new(25.21, 55.27));
    }

    #[test]
    fn test_surface_failure_is_isolated_and_retried() {
        let mut store = DriverStore::with_defaults();
        let mut surface = Flaky {
            inner: InMemorySurface::new(),
            broken: Some(d(2)),
        };
        let mut sync = MarkerSync::new(StalenessPolicy::default());

        for id in 1..=3 {
            store.upsert(sim(id, 1, 25.2, 55.27));
        }
        let report = sync.reconcile(&store, &mut surface, Timestamp(1));
        assert_eq!(report.created, 2);
        assert_eq!(report.failed, 1);
        assert!(!sync.has_marker(d(2)));

        surface.broken = None;
        let report = sync.reconcile(&store, &mut surface, Timestamp(2));
        assert_eq!(report, SyncReport { created: 1, ..Default::default() });
        assert_eq!(surface.inner.len(), 3);
    }

    #[test]
    fn test_failed_move_is_retried() {
        let mut store = DriverStore::with_defaults();
        let mut surface = Flaky {
            inner: InMemorySurface::new(),
            broken: None,
        };
        let mut sync = MarkerSync::new(StalenessPolicy::default());

        store.upsert(sim(1, 1, 25.2, 55.27));
        sync.reconcile(&store, &mut surface, Timestamp(1));

        store.upsert(sim(1, 2, 25.21, 55.27));
        surface.broken = Some(d(1));
        assert_eq!(sync.reconcile(&store, &mut surface, Timestamp(2)).failed, 1);
        assert_eq!(sync.rendered_position(d(1)), Some(LatLng::new(25.2, 55.27)));

        surface.broken = None;
        assert_eq!(sync.reconcile(&store, &mut surface, Timestamp(3)).moved, 1);
        assert_eq!(surface.inner.marker(d(1)).unwrap().position, LatLng::new(25.21, 55.27));
    }

    #[test]
    fn test_stale_badge_greys_marker() {
        let mut store = DriverStore::with_defaults();
        let mut surface = InMemorySurface::new();
        let mut sync = MarkerSync::new(StalenessPolicy::badge_after(Duration::from_secs(10)));

        store.upsert(live(1, 0, 25.2, 55.27));
        sync.reconcile(&store, &mut surface, Timestamp(0));
        assert_eq!(surface.marker(d(1)).unwrap().content.color, MarkerColor::Green);

        let report = sync.reconcile(&store, &mut surface, Timestamp(20_000));
        assert_eq!(report.updated, 1);
        let content = &surface.marker(d(1)).unwrap().content;
        assert!(content.stale);
        assert_eq!(content.status_label, "stale");
        assert_eq!(content.color, MarkerColor::Grey);
    }

    #[test]
    fn test_stale_evict_removes_then_recreates() {
        let mut store = DriverStore::with_defaults();
        let mut surface = InMemorySurface::new();
        let mut sync = MarkerSync::new(StalenessPolicy::evict_after(Duration::from_secs(10)));

        store.upsert(live(1, 0, 25.2, 55.27));
        sync.reconcile(&store, &mut surface, Timestamp(0));

        assert_eq!(sync.reconcile(&store, &mut surface, Timestamp(11_000)).removed, 1);
        assert!(surface.is_empty());
        assert!(store.contains(d(1)));

        store.upsert(live(1, 12_000, 25.21, 55.27));
        assert_eq!(sync.reconcile(&store, &mut surface, Timestamp(12_000)).created, 1);
    }

    #[test]
    fn test_simulated_records_never_go_stale() {
        let mut store = DriverStore::with_defaults();
        let mut surface = InMemorySurface::new();
        let mut sync = MarkerSync::new(StalenessPolicy::evict_after(Duration::from_secs(10)));

        // A paused generator or an offline driver stops writing, the marker stays
        store.upsert(sim(1, 0, 25.2, 55.27));
        store.upsert(live(2, 0, 25.21, 55.28));
        sync.reconcile(&store, &mut surface, Timestamp(0));

        let report = sync.reconcile(&store, &mut surface, Timestamp(60_000));
        assert_eq!(report.removed, 1);
        assert!(surface.marker(d(1)).is_some());
        assert!(surface.marker(d(2)).is_none());
    }

    #[test]
    fn test_orphan_marker_is_swept() {
        let mut store = DriverStore::with_defaults();
        let mut surface = InMemorySurface::new();
        let mut sync = MarkerSync::new(StalenessPolicy::default());

        store.upsert(sim(1, 1, 25.2, 55.27));
        sync.reconcile(&store, &mut surface, Timestamp(1));

        // Reconciling against a different store leaves driver 1 without a record
        let empty = DriverStore::with_defaults();
        assert_eq!(sync.reconcile(&empty, &mut surface, Timestamp(2)).removed, 1);
        assert_eq!(sync.marker_count(), 0);
    }
}
