//! Worker management

mod registry;

pub use registry::{WorkerRegistry, WorkerUpdate};
