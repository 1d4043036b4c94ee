//! Terminal-output scraping
//!
//! The wrapped CLI announces two things in its output stream that the hub
//! cares about: the session identifier it will accept for a later resume,
//! and the idle prompt that means it is waiting for the human. Both are
//! scraped from terminal output and therefore brittle; the heuristics live
//! behind [`OutputClassifier`] so they can be swapped without touching
//! process management.

/// Result of classifying one output chunk
#[derive(Debug, Default, Clone)]
pub struct Classification {
    /// Resume token announced in this chunk, if any
    pub resume_token: Option<String>,
    /// Idle marker detected in this chunk, if any
    pub idle: Option<IdleSignal>,
}

/// An idle-prompt detection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdleSignal {
    /// The marker text that matched
    pub pattern: String,
}

/// Classifies process output chunks.
///
/// Implementations may keep state across chunks (markers can be split at
/// chunk boundaries), so one classifier instance serves one process.
pub trait OutputClassifier: Send {
    /// Classify the next output chunk
    fn classify(&mut self, chunk: &[u8]) -> Classification;
}

/// How much stripped text is retained across chunks to catch markers that
/// straddle a chunk boundary.
const CARRY_TAIL_CHARS: usize = 256;

/// Default classifier for the agent CLI's output format.
///
/// Detects a UUID following a session marker ("session" in any casing
/// within the same line region) and any of the configured idle markers.
/// ANSI escape sequences are stripped before matching.
pub struct AgentOutputClassifier {
    /// Markers whose appearance means the agent is idle at its prompt
    idle_markers: Vec<String>,
    /// Stripped text carried over from the previous chunk
    tail: String,
    /// Offset into `tail` already scanned for idle markers (avoids
    /// re-reporting the same prompt on every subsequent chunk)
    idle_scanned: usize,
}

impl AgentOutputClassifier {
    /// Create a classifier with the default marker set
    pub fn new() -> Self {
        Self::with_idle_markers(vec!["? for shortcuts".to_string()])
    }

    /// Create a classifier with custom idle markers
    pub fn with_idle_markers(idle_markers: Vec<String>) -> Self {
        Self {
            idle_markers,
            tail: String::new(),
            idle_scanned: 0,
        }
    }
}

impl Default for AgentOutputClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputClassifier for AgentOutputClassifier {
    fn classify(&mut self, chunk: &[u8]) -> Classification {
        let stripped = strip_ansi(chunk);
        if stripped.is_empty() {
            return Classification::default();
        }

        self.tail.push_str(&stripped);

        let resume_token = find_session_uuid(&self.tail);

        let mut idle = None;
        for marker in &self.idle_markers {
            if let Some(at) = find_from(&self.tail, marker, self.idle_scanned) {
                idle = Some(IdleSignal {
                    pattern: marker.clone(),
                });
                self.idle_scanned = at + marker.len();
                break;
            }
        }

        // Keep only the carry tail; rebase the idle scan offset with it.
        if self.tail.len() > CARRY_TAIL_CHARS {
            let cut = floor_char_boundary(&self.tail, self.tail.len() - CARRY_TAIL_CHARS);
            self.tail.drain(..cut);
            self.idle_scanned = self.idle_scanned.saturating_sub(cut);
        }

        Classification {
            resume_token,
            idle,
        }
    }
}

fn find_from(haystack: &str, needle: &str, from: usize) -> Option<usize> {
    let from = from.min(haystack.len());
    let from = floor_char_boundary(haystack, from);
    haystack[from..].find(needle).map(|i| from + i)
}

fn floor_char_boundary(s: &str, mut at: usize) -> usize {
    while at > 0 && !s.is_char_boundary(at) {
        at -= 1;
    }
    at
}

/// Strip ANSI escape sequences (CSI and OSC) and other control bytes,
/// keeping newlines so line-oriented markers survive.
fn strip_ansi(chunk: &[u8]) -> String {
    enum S {
        Plain,
        Esc,
        Csi,
        Osc,
    }
    let mut state = S::Plain;
    let mut out = Vec::with_capacity(chunk.len());

    for &b in chunk {
        match state {
            S::Plain => match b {
                0x1b => state = S::Esc,
                b'\r' => {}
                0x00..=0x08 | 0x0b..=0x1f | 0x7f => {}
                _ => out.push(b),
            },
            S::Esc => match b {
                b'[' => state = S::Csi,
                b']' => state = S::Osc,
                _ => state = S::Plain,
            },
            S::Csi => {
                // Final byte of a CSI sequence is 0x40..=0x7e
                if (0x40..=0x7e).contains(&b) {
                    state = S::Plain;
                }
            }
            S::Osc => {
                // OSC terminates on BEL or ST (ESC \); treating the ESC
                // as a fresh escape handles both.
                if b == 0x07 {
                    state = S::Plain;
                } else if b == 0x1b {
                    state = S::Esc;
                }
            }
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}

/// Find a UUID that appears after a "session" marker in the text.
fn find_session_uuid(text: &str) -> Option<String> {
    let lower = text.to_lowercase();
    let mut search_from = 0;
    while let Some(at) = lower[search_from..].find("session") {
        let marker_end = search_from + at + "session".len();
        // Look for a UUID within a short window after the marker
        let window_end = (marker_end + 64).min(text.len());
        let window_end = floor_char_boundary(text, window_end);
        if let Some(uuid) = find_uuid(&text[marker_end..window_end]) {
            return Some(uuid);
        }
        search_from = marker_end;
    }
    None
}

/// Find the first UUID (8-4-4-4-12 lowercase/uppercase hex) in the text
fn find_uuid(text: &str) -> Option<String> {
    const GROUPS: [usize; 5] = [8, 4, 4, 4, 12];
    let bytes = text.as_bytes();

    'outer: for start in 0..bytes.len() {
        let mut pos = start;
        for (i, &len) in GROUPS.iter().enumerate() {
            if pos + len > bytes.len() {
                continue 'outer;
            }
            if !bytes[pos..pos + len].iter().all(u8::is_ascii_hexdigit) {
                continue 'outer;
            }
            pos += len;
            if i < GROUPS.len() - 1 {
                if pos >= bytes.len() || bytes[pos] != b'-' {
                    continue 'outer;
                }
                pos += 1;
            }
        }
        return Some(text[start..pos].to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finds_session_uuid() {
        let mut c = AgentOutputClassifier::new();
        let out = c.classify(b"Session ID: 123e4567-e89b-12d3-a456-426614174000\n");
        assert_eq!(
            out.resume_token.as_deref(),
            Some("123e4567-e89b-12d3-a456-426614174000")
        );
    }

    #[test]
    fn test_uuid_split_across_chunks() {
        let mut c = AgentOutputClassifier::new();
        let first = c.classify(b"session 123e4567-e89b-12d3");
        assert!(first.resume_token.is_none());
        let second = c.classify(b"-a456-426614174000 done\n");
        assert_eq!(
            second.resume_token.as_deref(),
            Some("123e4567-e89b-12d3-a456-426614174000")
        );
    }

    #[test]
    fn test_uuid_without_marker_ignored() {
        let mut c = AgentOutputClassifier::new();
        let out = c.classify(b"blob 123e4567-e89b-12d3-a456-426614174000\n");
        assert!(out.resume_token.is_none());
    }

    #[test]
    fn test_idle_marker_detected_once() {
        let mut c = AgentOutputClassifier::new();
        let out = c.classify(b"\x1b[2m? for shortcuts\x1b[0m");
        assert_eq!(
            out.idle.map(|s| s.pattern),
            Some("? for shortcuts".to_string())
        );
        // Same prompt region is not re-reported
        let again = c.classify(b"");
        assert!(again.idle.is_none());
    }

    #[test]
    fn test_ansi_stripping() {
        assert_eq!(strip_ansi(b"\x1b[31mred\x1b[0m text"), "red text");
        assert_eq!(strip_ansi(b"\x1b]0;title\x07body"), "body");
        assert_eq!(strip_ansi(b"line\r\n"), "line\n");
    }
}
