//! vsm-core: Pure protocol + rules library for the VSM tracker gateway.
//!
//! No async, no network. Device state, almanac compression and chunking,
//! downlink frame encoding and the rule decisions live here; the
//! `vsm-server` crate wires them to the solver, network server and store.

pub mod almanac;
pub mod chunk;
pub mod codec;
pub mod config;
pub mod frame;
pub mod rules;
pub mod solve;
pub mod state;
pub mod types;
pub mod update;

// Re-export commonly used types at crate root
pub use almanac::{Almanac, AlmanacView};
pub use frame::{Downlink, FrameTag};
pub use solve::{SolveKind, SolveRequest, SolveResponse};
pub use state::{DeviceState, GnssState, Merge, VsmState};
pub use types::*;
pub use update::Update;
