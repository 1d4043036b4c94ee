//! Realtime fan-out
//!
//! WebSocket upgrade handling, per-session client registries, and the
//! fan-out of process output and lifecycle events to connected viewers.

mod events;
mod gateway;
mod ws;

pub use events::{ChannelKind, ClientFrame, HubEvent, ServerFrame, SessionSnapshot};
pub use gateway::Gateway;
pub use ws::router;
