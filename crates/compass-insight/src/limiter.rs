//! Surfacing cooldowns and refresh staleness rules.
//!
//! Pure decision functions over already-loaded state; the caller decides
//! what to load and what to do with the answer.

use uuid::Uuid;

use compass_core::config::SynthesisConfig;
use compass_core::types::{StylePreferences, Timestamp};
use compass_storage::{SurfacingEntry, SynthesisRun};

/// Gates how often synthesis results may be shown to a user.
#[derive(Debug, Clone, Copy)]
pub struct SurfacingLimiter {
    cooldown_conversations: usize,
}

impl SurfacingLimiter {
    pub fn new(cooldown_conversations: usize) -> Self {
        Self {
            cooldown_conversations,
        }
    }

    pub fn from_config(config: &SynthesisConfig) -> Self {
        Self::new(config.cooldown_conversations)
    }

    /// Number of earlier conversations a theme stays on cooldown for.
    pub fn cooldown(&self) -> usize {
        self.cooldown_conversations
    }

    /// Whether `theme` may surface in `current`.
    ///
    /// `prior` lists the user's earlier conversations, newest first. False
    /// when anything already surfaced in `current`, or when the same theme
    /// surfaced in any of the last `cooldown` entries of `prior`.
    pub fn can_surface(
        &self,
        current: Uuid,
        prior: &[Uuid],
        history: &[SurfacingEntry],
        theme: &str,
    ) -> bool {
        if history.iter().any(|e| e.conversation_id == current) {
            return false;
        }
        let window: Vec<&Uuid> = prior
            .iter()
            .filter(|id| **id != current)
            .take(self.cooldown_conversations)
            .collect();
        !history.iter().any(|e| {
            window.contains(&&e.conversation_id) && same_theme(&e.theme, theme)
        })
    }
}

/// Decides when cached analyses must be recomputed.
#[derive(Debug, Clone, Copy)]
pub struct RefreshPolicy {
    refresh_after_conversations: u32,
    refresh_max_age_secs: i64,
    style_refresh_after_sessions: u32,
}

impl RefreshPolicy {
    pub fn from_config(config: &SynthesisConfig) -> Self {
        Self {
            refresh_after_conversations: config.refresh_after_conversations,
            refresh_max_age_secs: i64::try_from(config.refresh_max_age_hours)
                .unwrap_or(i64::MAX / 3600)
                .saturating_mul(3600),
            style_refresh_after_sessions: config.style_refresh_after_sessions,
        }
    }

    /// Pattern cache: stale when never computed, when enough new
    /// conversations happened since, or when it is too old.
    pub fn synthesis_stale(
        &self,
        last_run: Option<&SynthesisRun>,
        conversation_count: u32,
        now: Timestamp,
    ) -> bool {
        match last_run {
            None => true,
            Some(run) => {
                conversation_count.saturating_sub(run.conversation_count)
                    >= self.refresh_after_conversations
                    || now.0.saturating_sub(run.computed_at.0) >= self.refresh_max_age_secs
            }
        }
    }

    /// Style cache: stale when never analyzed or enough sessions passed.
    pub fn style_stale(&self, prefs: Option<&StylePreferences>, session_count: u32) -> bool {
        match prefs {
            None => true,
            Some(p) => {
                session_count.saturating_sub(p.analyzed_at_sessions)
                    >= self.style_refresh_after_sessions
            }
        }
    }
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self::from_config(&SynthesisConfig::default())
    }
}

/// Case- and whitespace-insensitive theme comparison.
pub fn normalize_theme(theme: &str) -> String {
    theme
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_matches(|c: char| c.is_ascii_punctuation())
        .to_lowercase()
}

fn same_theme(a: &str, b: &str) -> bool {
    normalize_theme(a) == normalize_theme(b)
}
