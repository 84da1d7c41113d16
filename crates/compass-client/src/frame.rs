//! Decoder for the chat event stream.
//!
//! Bytes arrive in arbitrary chunks; a chunk may end mid-line or even in
//! the middle of a UTF-8 sequence. Complete lines are parsed as SSE fields
//! and each blank line dispatches the `data:` accumulated since the last one.

use tracing::{debug, warn};
use uuid::Uuid;

use compass_core::types::{SignalFlags, TagKind, Usage};
use compass_core::wire::WireFrame;

/// One decoded event, as the session consumes it.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Token(String),
    Signal(TagKind),
    Done {
        message_id: Uuid,
        usage: Usage,
        flags: SignalFlags,
    },
    Error {
        message: String,
        retryable: bool,
    },
}

impl ClientEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ClientEvent::Done { .. } | ClientEvent::Error { .. })
    }

    /// Frames this client does not understand map to `None`.
    pub fn from_frame(frame: WireFrame) -> Option<Self> {
        match frame {
            WireFrame::Token { content } => Some(ClientEvent::Token(content)),
            WireFrame::Signal { name } => match TagKind::from_signal_name(&name) {
                Some(tag) => Some(ClientEvent::Signal(tag)),
                None => {
                    debug!(name = %name, "Ignoring unknown signal");
                    None
                }
            },
            WireFrame::Done {
                message_id,
                usage,
                memory_signal,
                pattern_signal,
                profile_signal,
            } => Some(ClientEvent::Done {
                message_id,
                usage,
                flags: SignalFlags {
                    memory: memory_signal,
                    pattern: pattern_signal,
                    profile: profile_signal,
                },
            }),
            WireFrame::Error { message, retryable } => {
                Some(ClientEvent::Error { message, retryable })
            }
            WireFrame::Unknown => None,
        }
    }
}

/// Incremental SSE decoder.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    bytes: Vec<u8>,
    data: Vec<String>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk and return every event it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<ClientEvent> {
        self.bytes.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.bytes.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.bytes.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);
            self.handle_line(line, &mut events);
        }
        events
    }

    /// Dispatch whatever is left once the connection has closed.
    pub fn finish(&mut self) -> Vec<ClientEvent> {
        let mut events = Vec::new();
        if !self.bytes.is_empty() {
            let rest = std::mem::take(&mut self.bytes);
            let line = String::from_utf8_lossy(&rest);
            self.handle_line(line.trim_end_matches('\r'), &mut events);
        }
        self.dispatch(&mut events);
        events
    }

    fn handle_line(&mut self, line: &str, events: &mut Vec<ClientEvent>) {
        if line.is_empty() {
            self.dispatch(events);
            return;
        }
        if line.starts_with(':') {
            // Comment, used for keep-alives.
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        if field == "data" {
            self.data.push(value.to_string());
        }
    }

    fn dispatch(&mut self, events: &mut Vec<ClientEvent>) {
        if self.data.is_empty() {
            return;
        }
        let payload = self.data.join("\n");
        self.data.clear();
        match serde_json::from_str::<WireFrame>(&payload) {
            Ok(frame) => events.extend(ClientEvent::from_frame(frame)),
            Err(e) => warn!(error = %e, "Skipping malformed frame"),
        }
    }
}
