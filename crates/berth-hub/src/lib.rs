//! berth-hub: the hub daemon
//!
//! Owns session records and their state machine, decides admission against
//! per-worker concurrency limits, spawns agent processes on the local PTY
//! or remote SSH backends, and fans their output out to any number of
//! realtime viewers.

pub mod backend;
pub mod realtime;
pub mod runtime;
pub mod session;
pub mod state;
pub mod worker;
pub mod workspace;

pub use backend::{HubBackend, SessionBackend, SpawnMode};
pub use state::HubState;
