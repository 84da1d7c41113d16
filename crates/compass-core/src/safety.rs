//! Crisis detection for incoming user messages.
//!
//! Scans a single utterance for language indicating risk of self-harm or
//! acute distress. Detection is deliberately phrase-based and local so it
//! can run on the hot path without a network call.

use serde::{Deserialize, Serialize};

use crate::config::SafetyConfig;

/// How urgent a detected crisis signal is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrisisSeverity {
    /// Hopelessness or distress without explicit intent.
    Elevated,
    /// Explicit mention of self-harm, suicide, or immediate danger.
    Acute,
}

/// Result of scanning one message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrisisSignal {
    pub detected: bool,
    pub severity: Option<CrisisSeverity>,
    /// Phrases that triggered detection, in normalized form.
    pub matched: Vec<String>,
}

impl CrisisSignal {
    pub fn none() -> Self {
        Self {
            detected: false,
            severity: None,
            matched: Vec::new(),
        }
    }
}

const ACUTE_PHRASES: &[&str] = &[
    "kill myself",
    "killing myself",
    "end my life",
    "ending my life",
    "take my own life",
    "suicide",
    "suicidal",
    "want to die",
    "wanna die",
    "hurt myself",
    "hurting myself",
    "self harm",
    "self-harm",
    "cut myself",
    "cutting myself",
    "overdose",
    "better off dead",
    "not be here anymore",
    "no reason to live",
];

const ELEVATED_PHRASES: &[&str] = &[
    "hopeless",
    "can't go on",
    "cant go on",
    "can't do this anymore",
    "cant do this anymore",
    "no way out",
    "nobody would care",
    "everyone would be better off",
    "give up on everything",
    "unsafe at home",
    "he hits me",
    "she hits me",
    "being abused",
];

/// Figures of speech that contain an alarming word but are benign.
const BENIGN_IDIOMS: &[&str] = &[
    "killing it",
    "dying to",
    "to die for",
    "dead tired",
    "dead serious",
];

/// Phrase-based crisis detector.
pub struct CrisisDetector {
    config: SafetyConfig,
}

impl CrisisDetector {
    /// Create a new detector with the given configuration.
    pub fn new(config: SafetyConfig) -> Self {
        Self { config }
    }

    /// Scan `message` and report any crisis language.
    ///
    /// Benign idioms are removed before matching so "killing it at work"
    /// does not trigger, while "I want to kill myself" always does.
    pub fn detect(&self, message: &str) -> CrisisSignal {
        if !self.config.crisis_detection {
            return CrisisSignal::none();
        }

        let mut text = normalize(message);
        for idiom in BENIGN_IDIOMS {
            text = text.replace(idiom, " ");
        }

        let mut matched = Vec::new();
        let mut severity = None;

        for phrase in ACUTE_PHRASES {
            if contains_phrase(&text, phrase) {
                matched.push(phrase.to_string());
                severity = Some(CrisisSeverity::Acute);
            }
        }

        let extra = self.config.extra_crisis_phrases.iter().map(|p| normalize(p));
        for phrase in ELEVATED_PHRASES.iter().map(|p| p.to_string()).chain(extra) {
            if !phrase.is_empty() && contains_phrase(&text, &phrase) {
                matched.push(phrase);
                severity = severity.or(Some(CrisisSeverity::Elevated));
            }
        }

        CrisisSignal {
            detected: !matched.is_empty(),
            severity,
            matched,
        }
    }
}

/// Lowercase, unify apostrophes, and collapse whitespace.
fn normalize(text: &str) -> String {
    let lowered = text.to_lowercase().replace(['\u{2019}', '\u{2018}'], "'");
    lowered.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Match `phrase` on word boundaries, allowing a plain `d`/`s`/`ed` suffix.
fn contains_phrase(text: &str, phrase: &str) -> bool {
    let mut search_from = 0;
    while let Some(offset) = text[search_from..].find(phrase) {
        let start = search_from + offset;
        let end = start + phrase.len();
        let before_ok = text[..start]
            .chars()
            .next_back()
            .is_none_or(|c| !c.is_alphanumeric());
        let rest = &text[end..];
        let rest = ["ed", "d", "s"]
            .iter()
            .find_map(|suffix| {
                rest.strip_prefix(suffix)
                    .filter(|r| r.chars().next().is_none_or(|c| !c.is_alphanumeric()))
            })
            .unwrap_or(rest);
        let after_ok = rest.chars().next().is_none_or(|c| !c.is_alphanumeric());
        if before_ok && after_ok {
            return true;
        }
        search_from = start + 1;
        while !text.is_char_boundary(search_from) {
            search_from += 1;
        }
    }
    false
}
