//! FleetSync Core - Live Fleet Location Synchronization
//!
//! Merges two unsynchronized producers of driver positions into one
//! canonical state and keeps a rendered map consistent with it:
//! 1. **Two Writers, No Clock**: simulated ticks and live device updates meet
//!    in a last-writer-by-time store where live data always wins
//! 2. **Flicker-Free Map**: a diffing reconciler issues only the marker
//!    operations needed to make the map match the store
//! 3. **Untrusted Relay**: live messages pass a validating parser; anything
//!    malformed is dropped, never half-applied

pub mod config;
pub mod fleet_motion;
pub mod fleet_relay;
pub mod fleet_runtime;
pub mod fleet_store;
pub mod fleet_sync;
pub mod metrics;
pub mod selection;
pub mod surface;

// Re-export key types for convenience
pub use config::{ConfigError, FleetConfig, GeoBounds, MotionConfig, RosterEntry, StalenessPolicy, TimestampPolicy};
pub use fleet_motion::{Displacement, MotionGenerator, MotionModel, RandomWalk, Stationary};
pub use fleet_relay::{parse_relay_message, LocationUpdate, ParseError, RelayListener, RelayLocation, RelayMessage, RelayOutcome};
pub use fleet_runtime::{Command, FleetEngine, FleetHandle, FleetStatus, HandleError, ProducerFault};
pub use fleet_store::{DriverLocationRecord, DriverStatus, DriverStore, KnownDriver, LatLng, LocationEvent, LocationSource, MergeOutcome, RecordDefaults};
pub use fleet_sync::{MarkerSync, SyncReport};
pub use metrics::EngineMetrics;
pub use selection::{DriverDetail, Selection};
pub use surface::{ClickCallback, InMemorySurface, MapSurface, MarkerColor, MarkerContent, MarkerOp, SurfaceError};
