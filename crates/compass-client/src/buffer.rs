//! Token buffer that batches incoming text into paced display updates.
//!
//! The first `add` after a flush arms a timer for one window; when it fires,
//! everything added in the meantime is emitted as a single update. Later
//! adds do not push the timer back, so no text waits longer than one window
//! even while tokens keep arriving. `flush`
//! emits immediately and cancels the timer. `reset` drops pending text
//! without emitting it.
//!
//! `add` spawns the timer on the current tokio runtime.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

#[derive(Debug, Default)]
struct BufferState {
    pending: String,
    timer: Option<JoinHandle<()>>,
    /// Bumped by `flush` and `reset`; a timer from an older generation is stale.
    generation: u64,
    flushes: u64,
}

fn lock(state: &Mutex<BufferState>) -> MutexGuard<'_, BufferState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Sink<T> {
    tx: mpsc::UnboundedSender<T>,
    wrap: fn(String) -> T,
}

impl<T> Clone for Sink<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            wrap: self.wrap,
        }
    }
}

impl<T> Sink<T> {
    /// Emit the pending text, if any. Caller holds the lock.
    fn emit(&self, state: &mut BufferState) {
        if state.pending.is_empty() {
            return;
        }
        let text = std::mem::take(&mut state.pending);
        state.flushes += 1;
        trace!(chars = text.len(), flushes = state.flushes, "Token buffer flushed");
        let _ = self.tx.send((self.wrap)(text));
    }
}

/// Batches token text into display updates of type `T`.
pub struct TokenBuffer<T = String> {
    window: Duration,
    state: Arc<Mutex<BufferState>>,
    sink: Sink<T>,
}

impl TokenBuffer<String> {
    /// A buffer emitting plain text on the returned receiver.
    pub fn new(window: Duration) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::with_sink(window, tx, |text| text), rx)
    }
}

impl<T: Send + 'static> TokenBuffer<T> {
    /// A buffer emitting `wrap(text)` into an existing channel, so display
    /// updates stay ordered with whatever else the caller sends there.
    pub fn with_sink(window: Duration, tx: mpsc::UnboundedSender<T>, wrap: fn(String) -> T) -> Self {
        Self {
            window,
            state: Arc::new(Mutex::new(BufferState::default())),
            sink: Sink { tx, wrap },
        }
    }

    pub fn add(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        let mut state = lock(&self.state);
        state.pending.push_str(text);
        if state.timer.is_some() {
            return;
        }

        let generation = state.generation;
        let window = self.window;
        let shared = Arc::clone(&self.state);
        let sink = self.sink.clone();
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let mut state = lock(&shared);
            if state.generation != generation {
                return;
            }
            state.timer = None;
            sink.emit(&mut state);
        }));
    }

    /// Emit pending text now and cancel the timer.
    pub fn flush(&self) {
        let mut state = lock(&self.state);
        Self::cancel_timer(&mut state);
        self.sink.emit(&mut state);
    }

    /// Drop pending text and cancel the timer.
    pub fn reset(&self) {
        let mut state = lock(&self.state);
        Self::cancel_timer(&mut state);
        state.pending.clear();
    }

    fn cancel_timer(state: &mut BufferState) {
        state.generation += 1;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
    }

    pub fn pending_len(&self) -> usize {
        lock(&self.state).pending.len()
    }

    /// Number of display updates emitted so far.
    pub fn flush_count(&self) -> u64 {
        lock(&self.state).flushes
    }
}

impl<T> Drop for TokenBuffer<T> {
    fn drop(&mut self) {
        if let Some(timer) = lock(&self.state).timer.take() {
            timer.abort();
        }
    }
}
