//! Map surface with injectable failures.

use fleetsync_core::{ClickCallback, InMemorySurface, LatLng, MapSurface, MarkerContent, SurfaceError};
use fleetsync_env::DriverId;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeSet;

/// Wraps an [`InMemorySurface`] and rejects a share of operations, like a
/// map widget that throws while tiles are reloading.
pub struct FlakySurface {
    inner: InMemorySurface,
    rng: ChaCha8Rng,
    failure_rate: f64,
    broken: BTreeSet<DriverId>,
    failures: u64,
}

impl FlakySurface {
    pub fn new(failure_rate: f64, rng: ChaCha8Rng) -> Self {
        Self {
            inner: InMemorySurface::new(),
            rng,
            failure_rate: failure_rate.clamp(0.0, 1.0),
            broken: BTreeSet::new(),
            failures: 0,
        }
    }

    /// A surface that never fails.
    pub fn reliable(rng: ChaCha8Rng) -> Self {
        Self::new(0.0, rng)
    }

    pub fn set_failure_rate(&mut self, rate: f64) {
        self.failure_rate = rate.clamp(0.0, 1.0);
    }

    /// Reject every operation on `id` until healed.
    pub fn break_marker(&mut self, id: DriverId) {
        self.broken.insert(id);
    }

    /// Stop injecting failures.
    pub fn heal(&mut self) {
        self.failure_rate = 0.0;
        self.broken.clear();
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }

    pub fn inner(&self) -> &InMemorySurface {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut InMemorySurface {
        &mut self.inner
    }

    fn roll(&mut self, id: DriverId, op: &str) -> Result<(), SurfaceError> {
        let fail = self.broken.contains(&id) || self.rng.gen_bool(self.failure_rate);
        if fail {
            self.failures += 1;
            return Err(SurfaceError::Rejected {
                id,
                reason: format!("{op} failed"),
            });
        }
        Ok(())
    }
}

impl MapSurface for FlakySurface {
    fn create_marker(&mut self, id: DriverId, position: LatLng, content: &MarkerContent) -> Result<(), SurfaceError> {
        self.roll(id, "create")?;
        self.inner.create_marker(id, position, content)
    }

    fn move_marker(&mut self, id: DriverId, position: LatLng) -> Result<(), SurfaceError> {
        self.roll(id, "move")?;
        self.inner.move_marker(id, position)
    }

    fn update_marker_content(&mut self, id: DriverId, content: &MarkerContent) -> Result<(), SurfaceError> {
        self.roll(id, "update")?;
        self.inner.update_marker_content(id, content)
    }

    fn remove_marker(&mut self, id: DriverId) -> Result<(), SurfaceError> {
        self.roll(id, "remove")?;
        self.inner.remove_marker(id)
    }

    fn on_marker_click(&mut self, id: DriverId, callback: ClickCallback) -> Result<(), SurfaceError> {
        self.roll(id, "register click")?;
        self.inner.on_marker_click(id, callback)
    }
}
