//! FleetSync Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" abstraction allowing the FleetSync engine
//! to run in both **Production** (tokio) and **Simulation** (virtual clock)
//! environments.
//!
//! # Core Concept: The Reactor Pattern
//!
//! Everything the engine cannot control is intercepted here:
//! - Time (`now()`, `system_time()`, `sleep()`)
//! - The cross-context relay (`recv()`)
//! - Randomness (`derive_rng()`) for the simulated motion generator
//!
//! Deriving all entropy from a single 64-bit seed makes every simulated
//! fleet run reproducible from its seed number.
//!
//! # Example
//!
//! ```ignore
//! use fleetsync_env::{FleetContext, RelayTransport};
//!
//! async fn engine_loop<Ctx: FleetContext, Relay: RelayTransport>(
//!     ctx: &Ctx,
//!     relay: &Relay,
//! ) {
//!     loop {
//!         tokio::select! {
//!             frame = relay.recv() => handle_frame(frame),
//!             _ = ctx.sleep(Duration::from_secs(3)) => tick(),
//!         }
//!     }
//! }
//! ```

mod context;
mod relay;
mod types;
mod error;
mod tokio_impl;

pub use context::FleetContext;
pub use relay::{channel_relay, ChannelRelay, RelaySender, RelayTransport};
pub use types::{DriverId, RelayFrame, Timestamp};
pub use error::EnvError;
pub use tokio_impl::TokioContext;
