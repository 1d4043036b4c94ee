//! berth-pty: Process contract and local PTY backend
//!
//! Defines the narrow interface the hub depends on for any running
//! interactive process ([`process::Process`]), the output classifier that
//! scrapes resume tokens and idle markers out of the byte stream, and the
//! local backend that spawns the agent CLI under a pseudo-terminal.

pub mod classify;
pub mod local;
pub mod process;

pub use classify::{AgentOutputClassifier, Classification, IdleSignal, OutputClassifier};
pub use local::{LocalSpawner, SpawnSpec};
pub use process::{BackendKind, Process, ProcessEvent, ProcessHandle};
