//! Realtime event and frame types

use serde::{Deserialize, Serialize};

use berth_core::model::Session;
use berth_core::types::{SessionId, SessionStatus, WorkerId};

/// Which realtime channel a client is attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// The agent process's terminal
    AgentTerminal,
    /// The secondary shell's terminal
    ShellTerminal,
}

/// Hub-wide lifecycle events, broadcast to every events subscriber
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubEvent {
    /// A session transitioned to active
    SessionActivated {
        session_id: SessionId,
        pid: u32,
    },
    /// A session's process exited cleanly
    SessionCompleted {
        session_id: SessionId,
        resume_token: Option<String>,
    },
    /// A session's process exited abnormally or was lost
    SessionFailed {
        session_id: SessionId,
    },
    /// The agent's idle state changed
    NeedsInputChanged {
        session_id: SessionId,
        needs_input: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        pattern: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        idle_seconds: Option<u64>,
    },
    /// A worker's queue composition changed (promotion, new entry)
    QueueChanged {
        worker_id: WorkerId,
    },
}

/// Status snapshot sent to a client attaching mid-stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub title: String,
    pub pid: Option<u32>,
    pub needs_input: bool,
}

impl From<&Session> for SessionSnapshot {
    fn from(session: &Session) -> Self {
        Self {
            session_id: session.id.clone(),
            status: session.status,
            title: session.title.clone(),
            pid: session.pid,
            needs_input: session.needs_input,
        }
    }
}

/// Frames sent to a connected client
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Status snapshot; always the first frame on the agent channel
    SessionStatus { session: SessionSnapshot },
    /// Terminal output (base64 so binary-safe inside JSON)
    Output { data: String },
    /// Lifecycle event relevant to the attached session
    Event { event: HubEvent },
    /// The shell process ended
    ShellExited { code: i32 },
    /// Request-level error; the connection stays usable
    Error { message: String },
}

impl ServerFrame {
    /// Output frame from raw terminal bytes
    pub fn output(data: &[u8]) -> Self {
        use base64::Engine as _;
        ServerFrame::Output {
            data: base64::engine::general_purpose::STANDARD.encode(data),
        }
    }
}

/// Frames accepted from a connected client
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Keyboard input for the attached process
    Input { data: String },
    /// Terminal resize
    Resize { cols: u16, rows: u16 },
    /// Kill the attached session's process
    Kill,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_frame_parses() {
        let frame: ClientFrame = serde_json::from_str(r#"{"type":"input","data":"ls\n"}"#).unwrap();
        assert!(matches!(frame, ClientFrame::Input { .. }));

        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"resize","cols":120,"rows":40}"#).unwrap();
        assert!(matches!(frame, ClientFrame::Resize { cols: 120, rows: 40 }));
    }

    #[test]
    fn test_output_frame_is_base64() {
        let frame = ServerFrame::output(b"hi\x1b[0m");
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"output\""));
        assert!(!json.contains("\x1b"));
    }
}
