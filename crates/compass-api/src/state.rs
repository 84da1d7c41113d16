//! Application state shared across all route handlers.

use std::sync::Arc;
use std::time::Instant;

use compass_chat::ChatPipeline;
use compass_core::config::CompassConfig;
use compass_insight::{DeadLetterLog, RefreshQueue};

use crate::auth::Authenticator;

/// Shared application state.
///
/// All fields are cheap to clone; handlers receive a copy per request.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<CompassConfig>,
    /// Server-side conversation pipeline.
    pub pipeline: Arc<ChatPipeline>,
    pub authenticator: Arc<dyn Authenticator>,
    /// Used only to report queue depth on `/health`.
    pub refresh_queue: RefreshQueue,
    /// Background jobs that failed, for observability.
    pub dead_letters: DeadLetterLog,
    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        config: CompassConfig,
        pipeline: ChatPipeline,
        authenticator: Arc<dyn Authenticator>,
        refresh_queue: RefreshQueue,
        dead_letters: DeadLetterLog,
    ) -> Self {
        Self {
            config: Arc::new(config),
            pipeline: Arc::new(pipeline),
            authenticator,
            refresh_queue,
            dead_letters,
            start_time: Instant::now(),
        }
    }
}
