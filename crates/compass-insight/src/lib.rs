//! Compass Insight crate - background analyses and their caches.
//!
//! Provides:
//! - Cross-domain synthesis of recurring themes
//! - Style preference analysis
//! - Extractive conversation summaries
//! - Session-pattern summaries for long-running users
//! - Surfacing cooldowns and refresh staleness rules
//! - A deduplicating refresh queue with a dead-letter log

pub mod cache;
pub mod error;
pub mod limiter;
pub mod patterns;
pub mod queue;
pub mod style;
pub mod summarizer;
pub mod synthesis;

pub use cache::SynthesisCache;
pub use error::InsightError;
pub use limiter::{normalize_theme, RefreshPolicy, SurfacingLimiter};
pub use patterns::{SessionPatternAnalyzer, SessionPatterns};
pub use queue::{
    AnalysisRunner, DeadLetter, DeadLetterLog, RefreshHandler, RefreshJob, RefreshQueue,
    RefreshReceiver, RefreshWorker, WorkerShutdown,
};
pub use style::StyleAnalyzer;
pub use summarizer::{ConversationSummary, SummarizationService};
pub use synthesis::SynthesisAnalyzer;
