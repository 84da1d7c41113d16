//! Instruction library loaded once at startup.
//!
//! The library is process-wide immutable state. [`init`] loads it from an
//! optional override file, falling back to the embedded default and, if
//! even that is unusable, to a minimal hard-coded safe set. It is never
//! re-read per request.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::ChatError;

const EMBEDDED_LIBRARY: &str = include_str!("../prompts/default.toml");

static LIBRARY: OnceLock<PromptLibrary> = OnceLock::new();

/// Per-preference style guidance lines. Empty strings are skipped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StyleGuidance {
    pub brief: String,
    pub balanced: String,
    pub detailed: String,
    pub warm: String,
    pub direct: String,
    pub questions: String,
}

/// Every static instruction block the composer can use.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptLibrary {
    pub base: String,
    pub guardrails: String,
    pub crisis_continuity: String,
    pub crisis_override: String,
    /// `{domains}` is replaced with the competing domains.
    pub clarification: String,
    pub user_context_intro: String,
    pub memory_tag: String,
    pub prior_sessions_intro: String,
    pub pattern_tag: String,
    /// `{theme}`, `{domains}` and `{evidence}` are filled from the record.
    pub synthesis: String,
    pub session_patterns_intro: String,
    pub profile_tag: String,
    /// `{sessions_since}` and `{profile}` are filled from discovery context.
    pub discovery_followup: String,
    /// Keyed by `Domain::as_str()`.
    pub domains: BTreeMap<String, String>,
    pub style: StyleGuidance,
}

impl PromptLibrary {
    /// Parse and validate a library from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ChatError> {
        let library: PromptLibrary =
            toml::from_str(content).map_err(|e| ChatError::Prompt(e.to_string()))?;
        library.validate()?;
        Ok(library)
    }

    /// Load from `path`, or the embedded default when `path` is `None`.
    ///
    /// Never fails: an unusable override falls back to the embedded
    /// library, and an unusable embedded library to [`PromptLibrary::fallback`].
    pub fn load(path: Option<&Path>) -> Self {
        if let Some(path) = path {
            match std::fs::read_to_string(path)
                .map_err(|e| ChatError::Prompt(e.to_string()))
                .and_then(|content| Self::from_toml_str(&content))
            {
                Ok(library) => {
                    info!("Prompt library loaded from {}", path.display());
                    return library;
                }
                Err(e) => warn!(
                    "Failed to load prompt library from {}: {}. Using built-in library.",
                    path.display(),
                    e
                ),
            }
        }

        match Self::from_toml_str(EMBEDDED_LIBRARY) {
            Ok(library) => library,
            Err(e) => {
                error!("Built-in prompt library is unusable: {}. Using safe fallback.", e);
                Self::fallback()
            }
        }
    }

    /// Minimal instruction set used when no library can be loaded.
    pub fn fallback() -> Self {
        Self {
            base: "You are Compass, a supportive life coach. Listen carefully, reflect \
                   what you hear, and ask one helpful question at a time."
                .to_string(),
            guardrails: "Be kind and non-judgmental. You are not a medical, legal, or \
                         financial professional and never claim to be."
                .to_string(),
            crisis_continuity: "If the user has mentioned being unsafe earlier in this \
                                conversation, keep checking in on how they are doing."
                .to_string(),
            crisis_override: "The user may be in crisis. Respond with care, ask whether \
                              they are safe right now, and encourage them to contact \
                              local emergency services or the 988 Suicide & Crisis \
                              Lifeline."
                .to_string(),
            memory_tag: "When you refer to something the user told you before, add \
                         [MEMORY: short description] after it."
                .to_string(),
            ..Self::default()
        }
    }

    /// The blocks that must never be empty.
    fn validate(&self) -> Result<(), ChatError> {
        let required = [
            ("base", &self.base),
            ("guardrails", &self.guardrails),
            ("crisis_continuity", &self.crisis_continuity),
            ("crisis_override", &self.crisis_override),
        ];
        for (name, text) in required {
            if text.trim().is_empty() {
                return Err(ChatError::Prompt(format!("{} is missing or empty", name)));
            }
        }
        Ok(())
    }

    pub fn domain_guidance(&self, domain: &str) -> Option<&str> {
        self.domains
            .get(domain)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
    }
}

/// Install the process-wide library. Only the first call has any effect.
pub fn init(path: Option<&Path>) -> &'static PromptLibrary {
    LIBRARY.get_or_init(|| PromptLibrary::load(path))
}

/// The process-wide library, loading the built-in one if [`init`] was never called.
pub fn global() -> &'static PromptLibrary {
    LIBRARY.get_or_init(|| PromptLibrary::load(None))
}

/// Replace each `{key}` in `template` with its value.
pub fn fill(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = template.trim().to_string();
    for (key, value) in values {
        out = out.replace(&format!("{{{}}}", key), value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_embedded_library_is_valid() {
        let library = PromptLibrary::from_toml_str(EMBEDDED_LIBRARY).unwrap();
        assert!(library.crisis_override.contains("988"));
        assert!(library.domain_guidance("career").is_some());
        assert!(library.domain_guidance("personal_growth").is_some());
        assert!(library.profile_tag.contains("[PROFILE]"));
        assert!(library.style.balanced.is_empty());
    }

    #[test]
    fn test_missing_required_block_rejected() {
        let err = PromptLibrary::from_toml_str("base = \"hi\"\nguardrails = \"be kind\"\n")
            .unwrap_err();
        assert!(err.to_string().contains("crisis_continuity"));
    }

    #[test]
    fn test_malformed_override_falls_back_to_embedded() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"base = [unclosed").unwrap();
        let library = PromptLibrary::load(Some(file.path()));
        assert_eq!(library, PromptLibrary::from_toml_str(EMBEDDED_LIBRARY).unwrap());
    }

    #[test]
    fn test_override_file_used_when_valid() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(
            b"base = \"custom base\"\nguardrails = \"g\"\ncrisis_continuity = \"c\"\ncrisis_override = \"o\"\n",
        )
        .unwrap();
        let library = PromptLibrary::load(Some(file.path()));
        assert_eq!(library.base, "custom base");
        assert!(library.domains.is_empty());
    }

    #[test]
    fn test_fallback_passes_validation() {
        assert!(PromptLibrary::fallback().validate().is_ok());
    }

    #[test]
    fn test_fill_placeholders() {
        let text = fill(" Theme: {theme} in {domains}. ", &[("theme", "overwork"), ("domains", "career, health")]);
        assert_eq!(text, "Theme: overwork in career, health.");
    }
}
