//! Client-side conversation session.
//!
//! Each `send` (or `retry`) spawns one stream task and returns the receiver
//! for that stream's updates. Starting a new stream aborts the previous task
//! first, so two streams never write into the same display. Updates from a
//! superseded stream cannot reach the new receiver, and the session state
//! is only touched by the current stream.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use compass_core::config::ClientConfig;
use compass_core::tags::TagScanner;
use compass_core::types::{
    ConversationTurn, Role, SignalFlags, StreamErrorKind, TagKind, Usage,
};

use crate::buffer::TokenBuffer;
use crate::error::ClientError;
use crate::frame::{ClientEvent, FrameDecoder};
use crate::transport::{ChatTransport, OutgoingMessage};

/// Client stream lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Receiving,
    Finalizing,
    Interrupted,
}

/// What the display layer receives for one stream.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    State(SessionState),
    /// Display text to append, markers already hidden.
    Text(String),
    Signal(TagKind),
    Completed {
        message_id: Uuid,
        usage: Usage,
        flags: SignalFlags,
        /// The full reply as stored by the server.
        text: String,
    },
    Interrupted {
        /// Reply text shown before the failure.
        partial: String,
        message: String,
        retryable: bool,
    },
}

impl SessionUpdate {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionUpdate::Completed { .. } | SessionUpdate::Interrupted { .. }
        )
    }
}

#[derive(Debug)]
struct Shared {
    state: SessionState,
    history: Vec<ConversationTurn>,
    partial: String,
    /// Identifies the current stream; stale tasks compare against it.
    epoch: u64,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One conversation as seen by the client.
pub struct ChatSession {
    transport: Arc<dyn ChatTransport>,
    conversation_id: Uuid,
    window: Duration,
    shared: Arc<Mutex<Shared>>,
    task: Option<JoinHandle<()>>,
    last_message: Option<String>,
}

impl ChatSession {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        conversation_id: Uuid,
        config: &ClientConfig,
    ) -> Self {
        Self::with_history(transport, conversation_id, config, Vec::new())
    }

    /// Reopen an existing conversation with its stored turns.
    pub async fn resume(
        transport: Arc<dyn ChatTransport>,
        conversation_id: Uuid,
        config: &ClientConfig,
    ) -> Result<Self, ClientError> {
        let history = transport.history(conversation_id).await?;
        info!(conversation_id = %conversation_id, turns = history.len(), "Conversation resumed");
        Ok(Self::with_history(transport, conversation_id, config, history))
    }

    fn with_history(
        transport: Arc<dyn ChatTransport>,
        conversation_id: Uuid,
        config: &ClientConfig,
        history: Vec<ConversationTurn>,
    ) -> Self {
        Self {
            transport,
            conversation_id,
            window: Duration::from_millis(config.buffer_window_ms),
            shared: Arc::new(Mutex::new(Shared {
                state: SessionState::Idle,
                history,
                partial: String::new(),
                epoch: 0,
            })),
            task: None,
            last_message: None,
        }
    }

    pub fn conversation_id(&self) -> Uuid {
        self.conversation_id
    }

    pub fn state(&self) -> SessionState {
        lock(&self.shared).state
    }

    pub fn history(&self) -> Vec<ConversationTurn> {
        lock(&self.shared).history.clone()
    }

    /// Text kept from the last interrupted reply.
    pub fn partial(&self) -> String {
        lock(&self.shared).partial.clone()
    }

    /// Send a new user message, cancelling any reply still streaming.
    pub fn send(&mut self, message: &str) -> Result<mpsc::UnboundedReceiver<SessionUpdate>, ClientError> {
        let message = message.trim();
        if message.is_empty() {
            return Err(ClientError::EmptyMessage);
        }
        self.cancel();
        lock(&self.shared)
            .history
            .push(ConversationTurn::new(self.conversation_id, Role::User, message));
        self.last_message = Some(message.to_string());
        Ok(self.start_stream(message.to_string()))
    }

    /// Re-issue the last user message after an interruption.
    ///
    /// The user turn is not added to history again; the server reuses its
    /// stored copy as well.
    pub fn retry(&mut self) -> Result<mpsc::UnboundedReceiver<SessionUpdate>, ClientError> {
        if self.state() != SessionState::Interrupted {
            return Err(ClientError::NothingToRetry);
        }
        let message = self.last_message.clone().ok_or(ClientError::NothingToRetry)?;
        self.cancel();
        debug!(conversation_id = %self.conversation_id, "Retrying last message");
        Ok(self.start_stream(message))
    }

    /// Abort the in-flight stream, if any.
    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let mut shared = lock(&self.shared);
            shared.epoch += 1;
            if matches!(shared.state, SessionState::Connecting | SessionState::Receiving) {
                shared.state = SessionState::Idle;
            }
            debug!(conversation_id = %self.conversation_id, "Stream cancelled");
        }
    }

    fn start_stream(&mut self, message: String) -> mpsc::UnboundedReceiver<SessionUpdate> {
        let (tx, rx) = mpsc::unbounded_channel();
        let epoch = {
            let mut shared = lock(&self.shared);
            shared.epoch += 1;
            shared.partial.clear();
            shared.state = SessionState::Connecting;
            shared.epoch
        };
        let _ = tx.send(SessionUpdate::State(SessionState::Connecting));

        let run = StreamRun {
            transport: Arc::clone(&self.transport),
            shared: Arc::clone(&self.shared),
            epoch,
            tx: tx.clone(),
            buffer: TokenBuffer::with_sink(self.window, tx, SessionUpdate::Text),
            scanner: TagScanner::new(),
            outgoing: OutgoingMessage {
                user_message: message,
                conversation_id: self.conversation_id,
            },
        };
        self.task = Some(tokio::spawn(run.run()));
        rx
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// State owned by one stream task.
struct StreamRun {
    transport: Arc<dyn ChatTransport>,
    shared: Arc<Mutex<Shared>>,
    epoch: u64,
    tx: mpsc::UnboundedSender<SessionUpdate>,
    buffer: TokenBuffer<SessionUpdate>,
    scanner: TagScanner,
    outgoing: OutgoingMessage,
}

impl StreamRun {
    async fn run(mut self) {
        let mut stream = match self.transport.open(&self.outgoing).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(
                    conversation_id = %self.outgoing.conversation_id,
                    error = %e,
                    "Failed to open chat stream"
                );
                let retryable = e.is_retryable();
                self.interrupt(StreamErrorKind::ModelInvocation.user_message().to_string(), retryable);
                return;
            }
        };
        self.transition(SessionState::Receiving);

        let mut decoder = FrameDecoder::new();
        while let Some(chunk) = stream.next().await {
            let events = match chunk {
                Ok(bytes) => decoder.push(&bytes),
                Err(e) => {
                    warn!(error = %e, "Chat stream read failed");
                    break;
                }
            };
            for event in events {
                if self.handle(event) {
                    return;
                }
            }
        }
        for event in decoder.finish() {
            if self.handle(event) {
                return;
            }
        }

        // Connection closed without `done` or `error`.
        warn!(conversation_id = %self.outgoing.conversation_id, "Chat stream ended without a terminal frame");
        self.interrupt(
            StreamErrorKind::StreamInterruption.user_message().to_string(),
            true,
        );
    }

    /// Apply one event. Returns true once the stream is finished.
    fn handle(&mut self, event: ClientEvent) -> bool {
        match event {
            ClientEvent::Token(text) => {
                let step = self.scanner.push(&text);
                self.buffer.add(&step.visible);
                false
            }
            ClientEvent::Signal(tag) => {
                self.buffer.flush();
                let _ = self.tx.send(SessionUpdate::Signal(tag));
                false
            }
            ClientEvent::Done {
                message_id,
                usage,
                flags,
            } => {
                self.drain_scanner();
                let text = self.scanner.visible().trim().to_string();
                let turn = ConversationTurn {
                    id: message_id,
                    ..ConversationTurn::new(self.outgoing.conversation_id, Role::Assistant, text.clone())
                };
                let current = self.with_current(|shared| {
                    shared.state = SessionState::Finalizing;
                    shared.history.push(turn);
                });
                if current {
                    let _ = self.tx.send(SessionUpdate::State(SessionState::Finalizing));
                    let _ = self.tx.send(SessionUpdate::Completed {
                        message_id,
                        usage,
                        flags,
                        text,
                    });
                }
                true
            }
            ClientEvent::Error { message, retryable } => {
                self.interrupt(message, retryable);
                true
            }
        }
    }

    /// Release withheld text and push everything still buffered to the display.
    fn drain_scanner(&mut self) {
        let step = self.scanner.finish();
        self.buffer.add(&step.visible);
        self.buffer.flush();
    }

    fn interrupt(&mut self, message: String, retryable: bool) {
        self.drain_scanner();
        let partial = self.scanner.visible().to_string();
        let current = self.with_current(|shared| {
            shared.state = SessionState::Interrupted;
            shared.partial = partial.clone();
        });
        if current {
            let _ = self.tx.send(SessionUpdate::State(SessionState::Interrupted));
            let _ = self.tx.send(SessionUpdate::Interrupted {
                partial,
                message,
                retryable,
            });
        }
    }

    fn transition(&self, state: SessionState) {
        if self.with_current(|shared| shared.state = state) {
            let _ = self.tx.send(SessionUpdate::State(state));
        }
    }

    /// Run `f` if this stream is still the session's current one.
    fn with_current(&self, f: impl FnOnce(&mut Shared)) -> bool {
        let mut shared = lock(&self.shared);
        if shared.epoch != self.epoch {
            return false;
        }
        f(&mut shared);
        true
    }
}
