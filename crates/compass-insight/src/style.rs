//! Style preference analysis from the user's own messages.

use compass_core::types::{StylePreferences, Timestamp, Tone, Verbosity};

/// Phrases that signal the user wants less cushioning.
const DIRECT_MARKERS: &[&str] = &[
    "just tell me",
    "be direct",
    "be honest",
    "bottom line",
    "get to the point",
    "tl;dr",
    "tldr",
    "straight answer",
    "no fluff",
    "skip the",
];

/// Derives verbosity, tone, and question preference from message history.
#[derive(Debug, Clone, Copy)]
pub struct StyleAnalyzer {
    brief_below_words: f64,
    detailed_above_words: f64,
}

impl Default for StyleAnalyzer {
    fn default() -> Self {
        Self {
            brief_below_words: 12.0,
            detailed_above_words: 60.0,
        }
    }
}

impl StyleAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Analyze `messages` (the user's turns, any order) as of `session_count`.
    pub fn analyze(&self, messages: &[String], session_count: u32) -> StylePreferences {
        let non_empty: Vec<&str> = messages
            .iter()
            .map(|m| m.trim())
            .filter(|m| !m.is_empty())
            .collect();

        if non_empty.is_empty() {
            return StylePreferences {
                verbosity: Verbosity::default(),
                tone: Tone::default(),
                prefers_questions: false,
                analyzed_at_sessions: session_count,
                analyzed_at: Timestamp::now(),
            };
        }

        let total_words: usize = non_empty.iter().map(|m| m.split_whitespace().count()).sum();
        let avg_words = total_words as f64 / non_empty.len() as f64;
        let verbosity = if avg_words < self.brief_below_words {
            Verbosity::Brief
        } else if avg_words > self.detailed_above_words {
            Verbosity::Detailed
        } else {
            Verbosity::Balanced
        };

        let direct = non_empty
            .iter()
            .filter(|m| {
                let lower = m.to_lowercase();
                DIRECT_MARKERS.iter().any(|marker| lower.contains(marker))
            })
            .count();
        let tone = if direct * 5 >= non_empty.len() && direct > 0 {
            Tone::Direct
        } else {
            Tone::Warm
        };

        let questions = non_empty.iter().filter(|m| m.contains('?')).count();
        let prefers_questions = questions * 10 >= non_empty.len() * 3;

        StylePreferences {
            verbosity,
            tone,
            prefers_questions,
            analyzed_at_sessions: session_count,
            analyzed_at: Timestamp::now(),
        }
    }
}
