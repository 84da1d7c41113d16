//! Keyword-based life-domain classifier.
//!
//! Scores each domain by how many of its patterns match the message.
//! Fast enough to run on every request without a model call.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use compass_core::types::Domain;

/// Classification of one user message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainSignal {
    pub primary: Domain,
    /// Share of all pattern hits that went to `primary`.
    pub confidence: f64,
    /// Every domain with at least one hit, strongest first.
    pub candidates: Vec<(Domain, u32)>,
    /// True when two domains are (nearly) tied and the model should ask.
    pub ambiguous: bool,
}

// =============================================================================
// Compiled regex sets (compiled once, reused across calls)
// =============================================================================

static DOMAIN_PATTERNS: LazyLock<Vec<(Domain, Vec<Regex>)>> = LazyLock::new(|| {
    let mk = |pats: &[&str]| -> Vec<Regex> {
        pats.iter()
            .map(|p| Regex::new(p).expect("Invalid domain regex"))
            .collect()
    };

    vec![
        (
            Domain::Career,
            mk(&[
                r"(?i)\bpromot(?:ion|ed|e)\b",
                r"(?i)\b(?:job|career|work|workplace|office)\b",
                r"(?i)\b(?:boss|manager|coworkers?|colleagues?|team\s?lead)\b",
                r"(?i)\b(?:interview|resume|cv|hired|fired|laid\s+off|layoffs?)\b",
                r"(?i)\b(?:performance\s+review|raise|salary\s+negotiation)\b",
            ]),
        ),
        (
            Domain::Relationships,
            mk(&[
                r"(?i)\b(?:partner|boyfriend|girlfriend|husband|wife|spouse)\b",
                r"(?i)\b(?:dating|date|breakup|broke\s+up|divorce|marriage)\b",
                r"(?i)\b(?:friends?|friendship)\b",
                r"(?i)\b(?:lonely|loneliness)\b",
            ]),
        ),
        (
            Domain::Health,
            mk(&[
                r"(?i)\b(?:sleep|insomnia|tired|exhausted|fatigue)\b",
                r"(?i)\b(?:exercise|workout|gym|running|diet|weight)\b",
                r"(?i)\b(?:doctor|therapy|therapist|anxiety|stress|burn(?:ed|t)?\s?out)\b",
                r"(?i)\b(?:sick|illness|pain|injury|diagnos(?:is|ed))\b",
            ]),
        ),
        (
            Domain::Finance,
            mk(&[
                r"(?i)\b(?:money|budget|savings?|debt|loan|mortgage|rent)\b",
                r"(?i)\b(?:invest(?:ing|ment)?|retirement|401k|stocks?)\b",
                r"(?i)\b(?:bills?|expenses?|afford|paycheck|income)\b",
            ]),
        ),
        (
            Domain::Family,
            mk(&[
                r"(?i)\b(?:mom|mother|dad|father|parents?)\b",
                r"(?i)\b(?:sister|brother|siblings?|kids?|children|son|daughter)\b",
                r"(?i)\b(?:family|grandparents?|in-laws?|relatives)\b",
            ]),
        ),
        (
            Domain::PersonalGrowth,
            mk(&[
                r"(?i)\b(?:habits?|goals?|discipline|motivation|procrastinat\w*)\b",
                r"(?i)\b(?:confidence|self[-\s]?worth|self[-\s]?esteem|purpose)\b",
                r"(?i)\b(?:learn(?:ing)?|grow(?:th)?|journal(?:ing)?|meditat\w*)\b",
            ]),
        ),
    ]
});

/// Ratio of runner-up to leader at or above which a message is ambiguous.
const AMBIGUITY_RATIO: f64 = 0.75;

/// Classifies user messages into life domains.
#[derive(Debug, Clone, Copy, Default)]
pub struct DomainClassifier;

impl DomainClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Classify `message`, or `None` when no domain pattern matches.
    pub fn classify(&self, message: &str) -> Option<DomainSignal> {
        let mut candidates: Vec<(Domain, u32)> = DOMAIN_PATTERNS
            .iter()
            .map(|(domain, patterns)| {
                let hits = patterns.iter().filter(|re| re.is_match(message)).count() as u32;
                (*domain, hits)
            })
            .filter(|(_, hits)| *hits > 0)
            .collect();

        // Stable sort keeps declaration order among ties.
        candidates.sort_by(|a, b| b.1.cmp(&a.1));

        let (primary, top) = *candidates.first()?;
        let total: u32 = candidates.iter().map(|(_, hits)| hits).sum();
        let ambiguous = candidates
            .get(1)
            .is_some_and(|(_, runner_up)| f64::from(*runner_up) >= f64::from(top) * AMBIGUITY_RATIO);

        Some(DomainSignal {
            primary,
            confidence: f64::from(top) / f64::from(total),
            candidates,
            ambiguous,
        })
    }
}
