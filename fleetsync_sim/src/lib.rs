//! FleetSync Deterministic Simulation Testing (DST) Harness
//!
//! Runs the fleet engine against a virtual clock with every source of
//! non-determinism under control:
//! - **Time**: virtual clock advanced in fixed steps by the world
//! - **Relay**: in-process queue with loss, delay, reordering and corruption
//! - **Map**: surface that rejects a configurable share of marker operations
//! - **Randomness**: every stream derived from a single 64-bit seed
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         SimWorld                            │
//! │  ┌──────────────────────────────────────────────────────┐   │
//! │  │ SimContext (virtual clock + seeded RNG streams)      │   │
//! │  └──────────────────────────────────────────────────────┘   │
//! │                                                             │
//! │  ┌──────────┐   fixes   ┌──────────┐  frames  ┌──────────┐  │
//! │  │ Devices  │──────────►│ SimRelay │─────────►│  Engine  │  │
//! │  └──────────┘           └──────────┘          └────┬─────┘  │
//! │                                                    │        │
//! │                                          ┌─────────▼──────┐ │
//! │                                          │  FlakySurface  │ │
//! │                                          └────────────────┘ │
//! │  ┌──────────────────────────────────┐                       │
//! │  │       InvariantOracle            │  observes after       │
//! │  │  (ordering, stickiness, map)     │  every step           │
//! │  └──────────────────────────────────┘                       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use fleetsync_sim::{SimConfig, SimWorld};
//!
//! let mut world = SimWorld::new(SimConfig { seed: 42, drivers: 20, ..Default::default() })?;
//! world.run_for(60.0)?;
//! world.converge()?;
//! ```

mod context;
mod device;
mod exporter;
mod oracle;
mod relay;
mod runner;
mod surface;
mod world;
pub mod scenarios;

pub use context::SimContext;
pub use device::{DeviceState, GeolocationError, SimulatedDevice};
pub use exporter::{DriverFrame, SimEvent, SimExport, SimFrame};
pub use oracle::{InvariantOracle, Violation};
pub use relay::{RelayFaults, SimRelay, SimRelayStats};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
pub use surface::FlakySurface;
pub use world::{build_roster, SimConfig, SimEngine, SimWorld};
