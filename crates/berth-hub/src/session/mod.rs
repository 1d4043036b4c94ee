//! Session lifecycle
//!
//! The orchestrator owns the state machine; the admission controller owns
//! the per-worker capacity math; the shell manager owns each session's
//! optional secondary shell.

mod admission;
mod orchestrator;
mod shell;

pub use admission::AdmissionController;
pub use orchestrator::{CreateSessionRequest, CreatedSession, SessionOrchestrator};
pub use shell::{ShellManager, ShellStatus};
