//! Extractive summaries of finished conversations.
//!
//! The summary of an earlier conversation is what the context loader shows
//! the model as "prior sessions".

use std::collections::{HashMap, HashSet};

use compass_core::types::{ConversationTurn, Role};

use crate::error::InsightError;

/// Short title plus the most informative sentences the user wrote.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationSummary {
    pub title: String,
    pub highlights: Vec<String>,
}

impl ConversationSummary {
    /// Single-line form stored with the conversation.
    pub fn render(&self) -> String {
        if self.highlights.is_empty() {
            return self.title.clone();
        }
        format!("{}: {}", self.title, self.highlights.join(" "))
    }
}

/// Service for generating extractive summaries of conversations.
pub struct SummarizationService {
    max_highlights: usize,
    min_turns: usize,
}

impl SummarizationService {
    /// Create a new summarization service.
    ///
    /// - `max_highlights`: maximum number of sentences kept
    /// - `min_turns`: minimum turns required to generate a summary
    pub fn new(max_highlights: usize, min_turns: usize) -> Self {
        Self {
            max_highlights,
            min_turns,
        }
    }

    /// Summarize a conversation from its turns.
    ///
    /// Only user turns contribute sentences; the assistant's wording is
    /// not what the user will want recalled.
    pub fn summarize(&self, turns: &[ConversationTurn]) -> Result<ConversationSummary, InsightError> {
        if turns.len() < self.min_turns {
            return Err(InsightError::InsufficientData(format!(
                "Need at least {} turns, got {}",
                self.min_turns,
                turns.len()
            )));
        }

        let mut sentences: Vec<(usize, &str)> = Vec::new();
        for turn in turns.iter().filter(|t| t.role == Role::User) {
            for sent in split_sentences(&turn.text) {
                let trimmed = sent.trim();
                if trimmed.len() > 10 {
                    sentences.push((sentences.len(), trimmed));
                }
            }
        }

        if sentences.is_empty() {
            return Err(InsightError::InsufficientData(
                "No substantive user sentences".to_string(),
            ));
        }

        let mut ranked = rank_sentences(&sentences, self.max_highlights);
        ranked.sort_by_key(|(position, _)| *position);

        Ok(ConversationSummary {
            title: generate_title(&sentences),
            highlights: ranked.into_iter().map(|(_, s)| s.to_string()).collect(),
        })
    }
}

impl Default for SummarizationService {
    fn default() -> Self {
        Self::new(3, 2)
    }
}

/// Simple sentence splitter on `.` `!` `?` followed by whitespace.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut result = Vec::new();
    let mut start = 0;
    let bytes = text.as_bytes();
    for (i, c) in text.char_indices() {
        if (c == '.' || c == '!' || c == '?') && i + 1 < text.len() {
            let next = bytes.get(i + 1).copied().unwrap_or(0);
            if next == b' ' || next == b'\n' {
                result.push(&text[start..=i]);
                start = i + 1;
            }
        }
    }
    if start < text.len() {
        result.push(&text[start..]);
    }
    result
}

/// Rank sentences by a TF-IDF-like score (unique terms * sqrt(total terms)),
/// returning the top `top_k` with their original positions.
fn rank_sentences<'a>(sentences: &[(usize, &'a str)], top_k: usize) -> Vec<(usize, &'a str)> {
    let mut scored: Vec<(f64, usize, &str)> = sentences
        .iter()
        .map(|(position, sent)| {
            let words: Vec<&str> = sent.split_whitespace().collect();
            let unique: HashSet<&str> = words.iter().copied().collect();
            let score = (unique.len() as f64) * (words.len() as f64).sqrt();
            (score, *position, *sent)
        })
        .collect();

    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    scored
        .into_iter()
        .take(top_k)
        .map(|(_, position, s)| (position, s))
        .collect()
}

/// Generate a title from the most frequent meaningful bigram.
fn generate_title(sentences: &[(usize, &str)]) -> String {
    let stopwords = [
        "the", "a", "an", "is", "was", "are", "were", "to", "of", "in", "for", "on", "with",
        "and", "or", "but", "not", "it", "this", "that", "i've", "been", "have", "just", "about",
        "really", "feel", "like",
    ];
    let mut bigram_counts: HashMap<(String, String), (usize, usize)> = HashMap::new();

    for (_, sent) in sentences {
        let words: Vec<String> = sent
            .split_whitespace()
            .map(|w| {
                w.to_lowercase()
                    .trim_matches(|c: char| !c.is_alphanumeric())
                    .to_string()
            })
            .filter(|w| w.len() > 2 && !stopwords.contains(&w.as_str()))
            .collect();
        for pair in words.windows(2) {
            let next_rank = bigram_counts.len();
            let entry = bigram_counts
                .entry((pair[0].clone(), pair[1].clone()))
                .or_insert((0, next_rank));
            entry.0 += 1;
        }
    }

    // Ties go to the bigram seen first.
    bigram_counts
        .iter()
        .max_by(|a, b| a.1 .0.cmp(&b.1 .0).then(b.1 .1.cmp(&a.1 .1)))
        .map(|((w1, w2), _)| format!("{} {}", capitalize(w1), capitalize(w2)))
        .unwrap_or_else(|| "Check-in".to_string())
}

fn capitalize(s: &str) -> String {
    let mut c = s.chars();
    match c.next() {
        None => String::new(),
        Some(f) => f.to_uppercase().collect::<String>() + c.as_str(),
    }
}
