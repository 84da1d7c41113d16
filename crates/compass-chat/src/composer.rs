//! Prompt composition.
//!
//! Builds the instruction stack in a fixed precedence order. Foundational
//! blocks come first and are always present; situational blocks are added
//! only when their signal is present. Composition cannot fail.

use std::sync::LazyLock;

use compass_core::types::{SynthesisRecord, TagKind, Tone, UserProfile, Verbosity};

use crate::prompts::{fill, PromptLibrary};
use crate::signals::{DiscoveryContext, SignalSet, UserContext};

static FALLBACK: LazyLock<PromptLibrary> = LazyLock::new(PromptLibrary::fallback);

/// `text`, or the safe fallback when it is blank.
fn or_fallback<'a>(text: &'a str, fallback: &'a str) -> &'a str {
    if text.trim().is_empty() {
        fallback
    } else {
        text
    }
}

/// Precedence slots, in composition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PromptSlot {
    Base = 1,
    Guardrails,
    CrisisContinuity,
    CrisisOverride,
    Domain,
    Style,
    Clarification,
    UserContext,
    MemoryTag,
    PriorSessions,
    PatternTag,
    Synthesis,
    SessionPatterns,
    Discovery,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PromptBlock {
    pub slot: PromptSlot,
    pub text: String,
}

/// The instruction stack for one request. Never persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComposedPrompt {
    pub blocks: Vec<PromptBlock>,
    /// Tags the model is allowed to emit for this request.
    pub active_tags: Vec<TagKind>,
    /// Theme of the synthesis included in this prompt, if any.
    pub surfaced_theme: Option<String>,
}

impl ComposedPrompt {
    /// Add a block unless it is empty or its slot is already filled.
    fn push(&mut self, slot: PromptSlot, text: impl Into<String>) {
        let text = text.into();
        let text = text.trim();
        if text.is_empty() || self.contains(slot) {
            return;
        }
        self.blocks.push(PromptBlock {
            slot,
            text: text.to_string(),
        });
    }

    fn activate(&mut self, tag: TagKind) {
        if !self.active_tags.contains(&tag) {
            self.active_tags.push(tag);
        }
    }

    pub fn contains(&self, slot: PromptSlot) -> bool {
        self.blocks.iter().any(|b| b.slot == slot)
    }

    pub fn block(&self, slot: PromptSlot) -> Option<&str> {
        self.blocks
            .iter()
            .find(|b| b.slot == slot)
            .map(|b| b.text.as_str())
    }

    /// The system instruction text sent to the model.
    pub fn render(&self) -> String {
        self.blocks
            .iter()
            .map(|b| b.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Compose the instruction stack for one request.
///
/// `crisis_detected` adds the override block at its own slot; it replaces
/// nothing and every other block is composed as usual.
pub fn compose(library: &PromptLibrary, signals: &SignalSet, crisis_detected: bool) -> ComposedPrompt {
    let mut prompt = ComposedPrompt::default();

    prompt.push(PromptSlot::Base, or_fallback(&library.base, &FALLBACK.base));
    prompt.push(
        PromptSlot::Guardrails,
        or_fallback(&library.guardrails, &FALLBACK.guardrails),
    );
    prompt.push(
        PromptSlot::CrisisContinuity,
        or_fallback(&library.crisis_continuity, &FALLBACK.crisis_continuity),
    );

    if crisis_detected {
        prompt.push(
            PromptSlot::CrisisOverride,
            or_fallback(&library.crisis_override, &FALLBACK.crisis_override),
        );
    }

    if let Some(domain) = &signals.domain {
        if let Some(guidance) = library.domain_guidance(domain.primary.as_str()) {
            prompt.push(PromptSlot::Domain, guidance);
        }
    }

    if let Some(style) = &signals.style {
        let verbosity = match style.verbosity {
            Verbosity::Brief => &library.style.brief,
            Verbosity::Balanced => &library.style.balanced,
            Verbosity::Detailed => &library.style.detailed,
        };
        let tone = match style.tone {
            Tone::Warm => &library.style.warm,
            Tone::Direct => &library.style.direct,
        };
        let mut lines = vec![verbosity.trim(), tone.trim()];
        if style.prefers_questions {
            lines.push(library.style.questions.trim());
        }
        lines.retain(|l| !l.is_empty());
        prompt.push(PromptSlot::Style, lines.join(" "));
    }

    if let Some(domain) = signals.domain.as_ref().filter(|d| d.ambiguous) {
        let names: Vec<String> = domain
            .candidates
            .iter()
            .take(2)
            .map(|(d, _)| d.as_str().replace('_', " "))
            .collect();
        prompt.push(
            PromptSlot::Clarification,
            fill(&library.clarification, &[("domains", names.join(" and ").as_str())]),
        );
    }

    if let Some(context) = &signals.context {
        if let Some(section) = render_user_context(context) {
            prompt.push(
                PromptSlot::UserContext,
                format!("{}\n{}", library.user_context_intro.trim(), section),
            );
        }
    }

    prompt.push(
        PromptSlot::MemoryTag,
        or_fallback(&library.memory_tag, &FALLBACK.memory_tag),
    );
    prompt.activate(TagKind::Memory);

    if let Some(context) = &signals.context {
        if !context.prior_session_summaries.is_empty() {
            prompt.push(
                PromptSlot::PriorSessions,
                format!(
                    "{}\n{}",
                    library.prior_sessions_intro.trim(),
                    bullets(&context.prior_session_summaries)
                ),
            );
        }
        if context.has_history() && !library.pattern_tag.trim().is_empty() {
            prompt.push(PromptSlot::PatternTag, library.pattern_tag.as_str());
            prompt.activate(TagKind::Pattern);
        }
    }

    if let Some(record) = signals.synthesis.as_ref().filter(|r| r.is_eligible()) {
        let text = render_synthesis(&library.synthesis, record);
        if !text.is_empty() {
            prompt.push(PromptSlot::Synthesis, text);
            prompt.surfaced_theme = Some(record.theme.clone());
        }
    }

    if let Some(patterns) = &signals.session_patterns {
        prompt.push(
            PromptSlot::SessionPatterns,
            format!("{} {}", library.session_patterns_intro.trim(), patterns.render()),
        );
    }

    match &signals.discovery {
        Some(DiscoveryContext::InProgress) => {
            if !library.profile_tag.trim().is_empty() {
                prompt.push(PromptSlot::Discovery, library.profile_tag.as_str());
                prompt.activate(TagKind::Profile);
            }
        }
        Some(DiscoveryContext::Recent {
            profile,
            sessions_since,
        }) => {
            let sessions = sessions_since.to_string();
            let described = describe_profile(profile);
            prompt.push(
                PromptSlot::Discovery,
                fill(
                    &library.discovery_followup,
                    &[
                        ("sessions_since", sessions.as_str()),
                        ("profile", described.as_str()),
                    ],
                ),
            );
        }
        None => {}
    }

    prompt
}

fn bullets(items: &[String]) -> String {
    items
        .iter()
        .map(|item| format!("- {}", item.trim()))
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_user_context(context: &UserContext) -> Option<String> {
    let mut lines = Vec::new();
    if let Some(profile) = &context.profile {
        if let Some(name) = &profile.display_name {
            lines.push(format!("- Name: {}", name));
        }
        if !profile.values.is_empty() {
            lines.push(format!("- Values: {}", profile.values.join(", ")));
        }
        if !profile.challenges.is_empty() {
            lines.push(format!("- Challenges: {}", profile.challenges.join(", ")));
        }
        if let Some(style) = &profile.communication_style {
            lines.push(format!("- Communication style: {}", style));
        }
    }
    if !context.goals.is_empty() {
        lines.push(format!("- Goals: {}", context.goals.join(", ")));
    }
    if !context.recent_memories.is_empty() {
        lines.push(format!(
            "- Things they have mentioned before: {}",
            context.recent_memories.join("; ")
        ));
    }
    (!lines.is_empty()).then(|| lines.join("\n"))
}

fn render_synthesis(template: &str, record: &SynthesisRecord) -> String {
    let domains: Vec<String> = record
        .domains
        .iter()
        .map(|d| d.as_str().replace('_', " "))
        .collect();
    let evidence = if record.evidence.is_empty() {
        "recurring mentions across conversations".to_string()
    } else {
        record.evidence.join("; ")
    };
    fill(
        template,
        &[
            ("theme", record.theme.as_str()),
            ("domains", domains.join(", ").as_str()),
            ("evidence", evidence.as_str()),
        ],
    )
}

fn describe_profile(profile: &UserProfile) -> String {
    let mut parts = Vec::new();
    if let Some(name) = &profile.display_name {
        parts.push(format!("name {}", name));
    }
    if !profile.goals.is_empty() {
        parts.push(format!("goals {}", profile.goals.join(", ")));
    }
    if !profile.values.is_empty() {
        parts.push(format!("values {}", profile.values.join(", ")));
    }
    if !profile.challenges.is_empty() {
        parts.push(format!("challenges {}", profile.challenges.join(", ")));
    }
    if parts.is_empty() {
        "nothing specific yet".to_string()
    } else {
        parts.join("; ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::DomainClassifier;
    use compass_core::safety::{CrisisSeverity, CrisisSignal};
    use compass_core::types::{Confidence, Domain, StylePreferences, Timestamp, UserId};
    use compass_insight::SessionPatterns;

    fn library() -> PromptLibrary {
        PromptLibrary::load(None)
    }

    fn record(confidence: f64) -> SynthesisRecord {
        SynthesisRecord {
            user_id: UserId::new("u1"),
            theme: "avoiding conflict".to_string(),
            domains: vec![Domain::Career, Domain::Family],
            confidence: Confidence::new(confidence),
            evidence: vec!["skipped the review".to_string()],
            last_surfaced_at: None,
            surface_count: 0,
            computed_at: Timestamp::now(),
        }
    }

    fn full_signals() -> SignalSet {
        SignalSet {
            context: Some(UserContext {
                profile: Some(UserProfile {
                    display_name: Some("Sam".to_string()),
                    ..UserProfile::default()
                }),
                goals: vec!["get promoted".to_string()],
                recent_memories: vec!["marathon training".to_string()],
                prior_session_summaries: vec!["Talked about the manager.".to_string()],
                session_count: 6,
            }),
            domain: DomainClassifier::new().classify("my boss and my sister"),
            crisis: Some(CrisisSignal {
                detected: true,
                severity: Some(CrisisSeverity::Elevated),
                matched: vec!["hopeless".to_string()],
            }),
            synthesis: Some(record(0.9)),
            session_patterns: Some(SessionPatterns {
                session_count: 6,
                top_domains: vec![(Domain::Career, 4)],
                recurring_themes: vec!["overwork".to_string()],
            }),
            style: Some(StylePreferences {
                verbosity: Verbosity::Brief,
                tone: Tone::Direct,
                prefers_questions: true,
                analyzed_at_sessions: 5,
                analyzed_at: Timestamp::now(),
            }),
            discovery: Some(DiscoveryContext::Recent {
                profile: UserProfile {
                    goals: vec!["get promoted".to_string()],
                    ..UserProfile::default()
                },
                sessions_since: 1,
            }),
        }
    }

    fn assert_well_ordered(prompt: &ComposedPrompt) {
        assert!(!prompt.blocks.is_empty());
        assert!(!prompt.render().trim().is_empty());
        for pair in prompt.blocks.windows(2) {
            assert!(pair[0].slot < pair[1].slot, "{:?} before {:?}", pair[0].slot, pair[1].slot);
        }
    }

    #[test]
    fn test_empty_signals_still_compose() {
        let prompt = compose(&library(), &SignalSet::default(), false);
        assert_well_ordered(&prompt);
        let slots: Vec<PromptSlot> = prompt.blocks.iter().map(|b| b.slot).collect();
        assert_eq!(
            slots,
            vec![
                PromptSlot::Base,
                PromptSlot::Guardrails,
                PromptSlot::CrisisContinuity,
                PromptSlot::MemoryTag
            ]
        );
        assert_eq!(prompt.active_tags, vec![TagKind::Memory]);
    }

    #[test]
    fn test_every_signal_subset_is_well_ordered() {
        let full = full_signals();
        for mask in 0u32..128 {
            let signals = SignalSet {
                context: (mask & 1 != 0).then(|| full.context.clone()).flatten(),
                domain: (mask & 2 != 0).then(|| full.domain.clone()).flatten(),
                crisis: (mask & 4 != 0).then(|| full.crisis.clone()).flatten(),
                synthesis: (mask & 8 != 0).then(|| full.synthesis.clone()).flatten(),
                session_patterns: (mask & 16 != 0).then(|| full.session_patterns.clone()).flatten(),
                style: (mask & 32 != 0).then(|| full.style.clone()).flatten(),
                discovery: (mask & 64 != 0).then(|| full.discovery.clone()).flatten(),
            };
            let prompt = compose(&library(), &signals, signals.crisis_detected());
            assert_well_ordered(&prompt);
            assert!(prompt.contains(PromptSlot::CrisisContinuity));
            assert_eq!(prompt.contains(PromptSlot::CrisisOverride), mask & 4 != 0);
        }
    }

    #[test]
    fn test_all_signals_fill_every_slot() {
        let prompt = compose(&library(), &full_signals(), true);
        assert_eq!(prompt.blocks.len(), 14);
        assert_eq!(prompt.surfaced_theme.as_deref(), Some("avoiding conflict"));
        assert!(prompt.block(PromptSlot::Clarification).unwrap().contains("career and family"));
        assert!(prompt.block(PromptSlot::UserContext).unwrap().contains("Sam"));
        assert!(prompt.active_tags.contains(&TagKind::Pattern));
        assert!(!prompt.active_tags.contains(&TagKind::Profile));
    }

    #[test]
    fn test_promotion_case_gets_career_block_without_crisis() {
        let signals = SignalSet {
            domain: DomainClassifier::new().classify("I've been stuck on my promotion case for weeks"),
            ..SignalSet::default()
        };
        let lib = library();
        let prompt = compose(&lib, &signals, false);
        assert_eq!(prompt.block(PromptSlot::Domain), lib.domain_guidance("career"));
        assert!(!prompt.contains(PromptSlot::CrisisOverride));
        assert!(!prompt.contains(PromptSlot::Clarification));
    }

    #[test]
    fn test_low_confidence_synthesis_never_included() {
        let signals = SignalSet {
            synthesis: Some(record(0.6)),
            ..SignalSet::default()
        };
        let prompt = compose(&library(), &signals, false);
        assert!(!prompt.contains(PromptSlot::Synthesis));
        assert!(prompt.surfaced_theme.is_none());
        assert!(!prompt.render().contains("avoiding conflict"));
    }

    #[test]
    fn test_discovery_in_progress_activates_profile_tag() {
        let signals = SignalSet {
            discovery: Some(DiscoveryContext::InProgress),
            ..SignalSet::default()
        };
        let prompt = compose(&library(), &signals, false);
        assert!(prompt.active_tags.contains(&TagKind::Profile));
        assert!(prompt.block(PromptSlot::Discovery).unwrap().contains("[PROFILE]"));
    }

    #[test]
    fn test_first_session_has_no_pattern_tag() {
        let signals = SignalSet {
            context: Some(UserContext {
                goals: vec!["sleep more".to_string()],
                session_count: 1,
                ..UserContext::default()
            }),
            ..SignalSet::default()
        };
        let prompt = compose(&library(), &signals, false);
        assert!(prompt.contains(PromptSlot::UserContext));
        assert!(!prompt.contains(PromptSlot::PatternTag));
        assert_eq!(prompt.active_tags, vec![TagKind::Memory]);
    }

    #[test]
    fn test_empty_library_uses_fallback_foundation() {
        let prompt = compose(&PromptLibrary::default(), &SignalSet::default(), true);
        assert!(prompt.contains(PromptSlot::Base));
        assert!(prompt.contains(PromptSlot::CrisisContinuity));
        assert!(prompt.contains(PromptSlot::CrisisOverride));
        assert!(prompt.contains(PromptSlot::MemoryTag));
        assert!(!prompt.render().is_empty());
    }
}
