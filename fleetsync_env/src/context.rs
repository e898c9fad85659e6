//! Core environment context trait for the FleetSync engine.

use async_trait::async_trait;
use rand_chacha::ChaCha8Rng;
use std::future::Future;
use std::time::{Duration, SystemTime};

use crate::types::Timestamp;

/// The central interface for Environment Interaction.
///
/// This trait abstracts the "real world" so that the fleet engine can run
/// in both production (tokio) and simulation (virtual clock) environments.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time`, OS entropy
/// - **Simulation**: `SimContext` - virtual clock, `ChaCha8Rng(seed)`
///
/// # Determinism
///
/// For simulation runs, all methods that would normally introduce
/// non-determinism (time, randomness) are controlled by the implementation.
#[async_trait]
pub trait FleetContext: Send + Sync + 'static {
    /// Returns the current monotonic time since context creation.
    ///
    /// Used for tick scheduling. In simulation, this is the virtual clock time.
    fn now(&self) -> Duration;

    /// Returns the wall-clock time used to stamp ingested events.
    ///
    /// In simulation, this is derived from virtual clock + epoch offset.
    fn system_time(&self) -> SystemTime;

    /// Returns `system_time()` as a millisecond [`Timestamp`].
    fn timestamp(&self) -> Timestamp {
        Timestamp::from_system_time(self.system_time())
    }

    /// Suspends execution for the given duration.
    ///
    /// In production: wraps `tokio::time::sleep`
    /// In simulation: advances virtual clock
    async fn sleep(&self, duration: Duration);

    /// Spawns a background task.
    fn spawn<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static;

    /// Derives a random number generator from a seed extension.
    ///
    /// The motion generator draws all of its randomness from here. Simulation
    /// contexts combine the global seed with `seed_extension` so the same
    /// seed replays the same fleet movement; production returns fresh entropy.
    fn derive_rng(&self, seed_extension: u64) -> ChaCha8Rng;

    /// Returns the context's seed (for logging/debugging).
    ///
    /// In production, returns 0 (not seeded).
    fn seed(&self) -> u64;
}
