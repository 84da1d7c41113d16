//! Session-level patterns for long-running users.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use compass_core::types::Domain;
use compass_storage::PatternObservation;

use crate::limiter::normalize_theme;

/// What a returning user tends to bring up, across sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionPatterns {
    pub session_count: u32,
    /// Most discussed domains with their conversation counts.
    pub top_domains: Vec<(Domain, u32)>,
    /// Themes flagged in more than one conversation.
    pub recurring_themes: Vec<String>,
}

impl SessionPatterns {
    /// Plain-text rendering for the instruction stack.
    pub fn render(&self) -> String {
        let mut out = format!("The user has had {} sessions.", self.session_count);
        if !self.top_domains.is_empty() {
            let domains: Vec<String> = self
                .top_domains
                .iter()
                .map(|(d, n)| format!("{} ({})", d.as_str().replace('_', " "), n))
                .collect();
            out.push_str(&format!(" Most discussed areas: {}.", domains.join(", ")));
        }
        if !self.recurring_themes.is_empty() {
            out.push_str(&format!(
                " Recurring themes: {}.",
                self.recurring_themes.join(", ")
            ));
        }
        out
    }
}

/// Builds [`SessionPatterns`] once a user has enough history.
#[derive(Debug, Clone, Copy)]
pub struct SessionPatternAnalyzer {
    min_sessions: u32,
    max_items: usize,
}

impl SessionPatternAnalyzer {
    pub fn new(min_sessions: u32) -> Self {
        Self {
            min_sessions,
            max_items: 3,
        }
    }

    /// Whether a user with `session_count` sessions gets a summary at all.
    pub fn applies(&self, session_count: u32) -> bool {
        session_count >= self.min_sessions
    }

    /// `None` below the session threshold.
    pub fn analyze(
        &self,
        session_count: u32,
        domain_histogram: &[(Domain, u32)],
        observations: &[PatternObservation],
    ) -> Option<SessionPatterns> {
        if !self.applies(session_count) {
            return None;
        }

        let mut conversations_per_theme: BTreeMap<String, (String, Vec<uuid::Uuid>)> =
            BTreeMap::new();
        for observation in observations {
            let key = normalize_theme(&observation.theme);
            if key.is_empty() {
                continue;
            }
            let entry = conversations_per_theme
                .entry(key)
                .or_insert_with(|| (observation.theme.trim().to_string(), Vec::new()));
            if !entry.1.contains(&observation.conversation_id) {
                entry.1.push(observation.conversation_id);
            }
        }

        let mut recurring: Vec<(String, usize)> = conversations_per_theme
            .into_values()
            .filter(|(_, conversations)| conversations.len() > 1)
            .map(|(theme, conversations)| (theme, conversations.len()))
            .collect();
        recurring.sort_by(|a, b| b.1.cmp(&a.1));

        Some(SessionPatterns {
            session_count,
            top_domains: domain_histogram.iter().take(self.max_items).copied().collect(),
            recurring_themes: recurring
                .into_iter()
                .take(self.max_items)
                .map(|(theme, _)| theme)
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use compass_core::types::Timestamp;
    use uuid::Uuid;

    fn obs(conversation_id: Uuid, theme: &str) -> PatternObservation {
        PatternObservation {
            conversation_id,
            theme: theme.to_string(),
            domain: None,
            created_at: Timestamp::now(),
        }
    }

    #[test]
    fn test_below_threshold_is_absent() {
        let analyzer = SessionPatternAnalyzer::new(5);
        assert!(analyzer.analyze(4, &[(Domain::Career, 4)], &[]).is_none());
    }

    #[test]
    fn test_recurring_themes_need_two_conversations() {
        let analyzer = SessionPatternAnalyzer::new(5);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let observations = vec![
            obs(a, "self-doubt"),
            obs(a, "self-doubt"),
            obs(a, "overwork"),
            obs(b, "overwork"),
        ];
        let patterns = analyzer
            .analyze(6, &[(Domain::Career, 4), (Domain::Health, 2)], &observations)
            .unwrap();
        assert_eq!(patterns.recurring_themes, vec!["overwork"]);
        assert_eq!(patterns.top_domains[0], (Domain::Career, 4));
    }

    #[test]
    fn test_render_mentions_counts() {
        let patterns = SessionPatterns {
            session_count: 7,
            top_domains: vec![(Domain::PersonalGrowth, 3)],
            recurring_themes: vec!["overwork".to_string()],
        };
        let text = patterns.render();
        assert!(text.contains("7 sessions"));
        assert!(text.contains("personal growth (3)"));
        assert!(text.contains("overwork"));
    }
}
