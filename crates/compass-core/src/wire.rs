//! JSON frames carried in `data:` lines of the chat event stream.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{SignalFlags, StreamErrorKind, StreamEvent, TagKind, Usage};

/// One frame of the streaming response, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireFrame {
    Token {
        content: String,
    },
    /// A tag completed in the output so far; `name` is the signal name.
    Signal {
        name: String,
    },
    Done {
        message_id: Uuid,
        usage: Usage,
        memory_signal: bool,
        pattern_signal: bool,
        profile_signal: bool,
    },
    Error {
        message: String,
        #[serde(default)]
        retryable: bool,
    },
    /// Any frame type this build does not know. Never serialized.
    #[serde(other)]
    Unknown,
}

impl WireFrame {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WireFrame::Done { .. } | WireFrame::Error { .. })
    }

    /// Flags carried by a `done` frame.
    pub fn flags(&self) -> Option<SignalFlags> {
        match self {
            WireFrame::Done {
                memory_signal,
                pattern_signal,
                profile_signal,
                ..
            } => Some(SignalFlags {
                memory: *memory_signal,
                pattern: *pattern_signal,
                profile: *profile_signal,
            }),
            _ => None,
        }
    }

    /// The tag a `signal` frame refers to, if it is one we know.
    pub fn signal_tag(&self) -> Option<TagKind> {
        match self {
            WireFrame::Signal { name } => TagKind::from_signal_name(name),
            _ => None,
        }
    }
}

impl From<StreamEvent> for WireFrame {
    fn from(event: StreamEvent) -> Self {
        match event {
            StreamEvent::Token(content) => WireFrame::Token { content },
            StreamEvent::SignalFlag(tag) => WireFrame::Signal {
                name: tag.signal_name().to_string(),
            },
            StreamEvent::Completion {
                turn_id,
                usage,
                flags,
            } => WireFrame::Done {
                message_id: turn_id,
                usage,
                memory_signal: flags.memory,
                pattern_signal: flags.pattern,
                profile_signal: flags.profile,
            },
            StreamEvent::Error { kind, message } => WireFrame::Error {
                message,
                retryable: matches!(
                    kind,
                    StreamErrorKind::ModelInvocation | StreamErrorKind::StreamInterruption
                ),
            },
        }
    }
}
