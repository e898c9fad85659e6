//! Invariant oracle for simulation.
//!
//! Watches the engine from outside after every step and remembers what it has
//! seen, so it can check properties that span time:
//! - timestamps never go backwards per driver
//! - a driver that went live stays live
//! - simulated positions stay inside the bounding box
//! - the map never shows a marker without a record
//!
//! [`InvariantOracle::check_converged`] adds the end-of-run checks that only
//! hold once the surface is healthy: marker count, marker positions and
//! idempotent reconciliation.

use crate::world::SimEngine;
use fleetsync_core::{GeoBounds, LatLng};
use fleetsync_env::{DriverId, FleetContext, Timestamp};
use std::collections::{BTreeMap, BTreeSet};

/// A broken invariant.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Violation {
    #[error("Driver {driver}: lastUpdate went backwards ({stored} -> {observed})")]
    TimeWentBackwards {
        driver: DriverId,
        stored: Timestamp,
        observed: Timestamp,
    },

    #[error("Driver {0} lost its live source")]
    LiveLost(DriverId),

    #[error("Driver {driver}: simulated position {position} outside bounds")]
    OutOfBounds { driver: DriverId, position: LatLng },

    #[error("Marker for driver {0} has no record")]
    OrphanMarker(DriverId),

    #[error("Expected {expected} markers, found {actual}")]
    MarkerCount { expected: usize, actual: usize },

    #[error("Marker for driver {driver} at {rendered}, record at {stored}")]
    MarkerMismatch {
        driver: DriverId,
        rendered: LatLng,
        stored: LatLng,
    },

    #[error("Reconciling an unchanged store issued {0} operations")]
    NotIdempotent(usize),
}

/// The oracle - remembers past observations and checks invariants.
pub struct InvariantOracle {
    bounds: GeoBounds,
    last_update: BTreeMap<DriverId, Timestamp>,
    live: BTreeSet<DriverId>,
    checks: u64,
}

impl InvariantOracle {
    pub fn new(bounds: GeoBounds) -> Self {
        Self {
            bounds,
            last_update: BTreeMap::new(),
            live: BTreeSet::new(),
            checks: 0,
        }
    }

    /// Checks that hold after every step, even with a failing surface.
    pub fn observe(&mut self, engine: &SimEngine) -> Result<(), Violation> {
        self.checks += 1;
        let store = engine.store();

        for record in store.records() {
            let id = record.driver_id;

            if let Some(&stored) = self.last_update.get(&id) {
                if record.last_update < stored {
                    return Err(Violation::TimeWentBackwards {
                        driver: id,
                        stored,
                        observed: record.last_update,
                    });
                }
            }
            self.last_update.insert(id, record.last_update);

            if record.is_live() {
                self.live.insert(id);
            } else if self.live.contains(&id) {
                return Err(Violation::LiveLost(id));
            } else if !self.bounds.contains(&record.position) {
                return Err(Violation::OutOfBounds {
                    driver: id,
                    position: record.position,
                });
            }
        }

        for id in engine.surface().inner().marker_ids() {
            if !store.contains(id) {
                return Err(Violation::OrphanMarker(id));
            }
        }

        Ok(())
    }

    /// End-of-run checks. The surface must have been healed first.
    ///
    /// Runs one pass to flush retries, then requires the map to match the
    /// store exactly and a further pass to be a no-op.
    pub fn check_converged(&mut self, engine: &mut SimEngine) -> Result<(), Violation> {
        self.checks += 1;
        engine.reconcile();

        let now = engine.context().timestamp();
        let staleness = engine.config().staleness;
        let sync = engine.marker_sync();
        let expected: Vec<(DriverId, LatLng)> = engine
            .store()
            .records()
            .filter(|r| !sync.is_dismissed(r.driver_id))
            .filter(|r| !(staleness.evict && staleness.is_record_stale(r, now)))
            .map(|r| (r.driver_id, r.position))
            .collect();

        let surface = engine.surface().inner();
        let count_mismatch = Violation::MarkerCount {
            expected: expected.len(),
            actual: surface.len(),
        };
        if surface.len() != expected.len() {
            return Err(count_mismatch);
        }
        for (id, stored) in expected {
            let rendered = surface
                .marker(id)
                .map(|m| m.position)
                .ok_or_else(|| count_mismatch.clone())?;
            if rendered != stored {
                return Err(Violation::MarkerMismatch {
                    driver: id,
                    rendered,
                    stored,
                });
            }
        }

        let report = engine.reconcile();
        if !report.is_noop() {
            return Err(Violation::NotIdempotent(report.ops() + report.failed));
        }

        Ok(())
    }

    /// Drivers observed with a live source so far.
    pub fn live_drivers(&self) -> &BTreeSet<DriverId> {
        &self.live
    }

    /// Distinct drivers observed so far.
    pub fn drivers_seen(&self) -> usize {
        self.last_update.len()
    }

    pub fn checks(&self) -> u64 {
        self.checks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SimContext;
    use crate::surface::FlakySurface;
    use fleetsync_core::{FleetConfig, FleetEngine, LocationEvent};

    fn engine() -> SimEngine {
        let ctx = SimContext::shared(5);
        let surface = FlakySurface::reliable(ctx.derive_rng(1));
        FleetEngine::new(ctx, FleetConfig::default(), surface).unwrap()
    }

    #[test]
    fn test_healthy_engine_passes() {
        let mut engine = engine();
        let mut oracle = InvariantOracle::new(engine.config().bounds);

        for _ in 0..5 {
            engine.context().advance_time(std::time::Duration::from_secs(3));
            engine.on_tick();
            oracle.observe(&engine).unwrap();
        }
        oracle.check_converged(&mut engine).unwrap();
        assert_eq!(oracle.drivers_seen(), 6);
    }

    #[test]
    fn test_detects_out_of_bounds_simulated_write() {
        let mut engine = engine();
        let mut oracle = InvariantOracle::new(engine.config().bounds);

        engine.ingest(LocationEvent::simulated(DriverId(50), LatLng::new(10.0, 10.0), Timestamp(1)));
        assert!(matches!(oracle.observe(&engine), Err(Violation::OutOfBounds { .. })));
    }

    #[test]
    fn test_live_write_outside_bounds_is_fine() {
        let mut engine = engine();
        let mut oracle = InvariantOracle::new(engine.config().bounds);

        engine.ingest(LocationEvent::live(DriverId(50), LatLng::new(10.0, 10.0), Timestamp(1)));
        oracle.observe(&engine).unwrap();
        assert!(oracle.live_drivers().contains(&DriverId(50)));
    }

    #[test]
    fn test_detects_unflushed_surface() {
        let mut engine = engine();
        let mut oracle = InvariantOracle::new(engine.config().bounds);

        engine.surface_mut().break_marker(DriverId(3));
        engine.on_tick();
        oracle.observe(&engine).unwrap();

        // Still broken: the flush pass cannot create driver 3
        assert!(matches!(
            oracle.check_converged(&mut engine),
            Err(Violation::MarkerCount { expected: 6, actual: 5 })
        ));

        engine.surface_mut().heal();
        oracle.check_converged(&mut engine).unwrap();
    }
}
