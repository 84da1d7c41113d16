//! Compass Storage crate - SQLite persistence for conversations and analyses.
//!
//! Provides a WAL-mode SQLite database with migrations, repositories for
//! conversations, turns, profiles, memories and pattern observations, and
//! stores for synthesis records, surfacing history and style preferences.

pub mod analysis;
pub mod db;
pub mod migrations;
pub mod repository;

pub use analysis::{StyleRepository, SurfacingEntry, SynthesisRepository, SynthesisRun};
pub use db::Database;
pub use repository::{
    ConversationRepository, ConversationRow, MemoryRepository, PatternObservation,
    PatternRepository, ProfileRepository, TurnRepository,
};
