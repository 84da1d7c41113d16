use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Enums
// =============================================================================

/// Author of a conversation turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "system" => Some(Role::System),
            _ => None,
        }
    }
}

/// Life domain a user utterance is about.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Career,
    Relationships,
    Health,
    Finance,
    Family,
    PersonalGrowth,
}

impl Domain {
    pub const ALL: [Domain; 6] = [
        Domain::Career,
        Domain::Relationships,
        Domain::Health,
        Domain::Finance,
        Domain::Family,
        Domain::PersonalGrowth,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Career => "career",
            Domain::Relationships => "relationships",
            Domain::Health => "health",
            Domain::Finance => "finance",
            Domain::Family => "family",
            Domain::PersonalGrowth => "personal_growth",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let normalized = value.trim().to_lowercase().replace([' ', '-'], "_");
        Domain::ALL
            .into_iter()
            .find(|d| d.as_str() == normalized)
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shape of an inline extraction marker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TagShape {
    /// `[NAME: payload]` on a single line.
    Inline,
    /// `[NAME]...[/NAME]`, payload may span lines.
    Block,
}

/// Reserved marker the model may emit inside its own output.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagKind {
    /// Reference to a remembered detail from earlier sessions.
    Memory,
    /// A recurring theme noticed by the model.
    Pattern,
    /// End-of-discovery structured profile.
    Profile,
}

impl TagKind {
    pub const ALL: [TagKind; 3] = [TagKind::Memory, TagKind::Pattern, TagKind::Profile];

    /// Marker name as it appears between brackets.
    pub fn marker(&self) -> &'static str {
        match self {
            TagKind::Memory => "MEMORY",
            TagKind::Pattern => "PATTERN",
            TagKind::Profile => "PROFILE",
        }
    }

    pub fn shape(&self) -> TagShape {
        match self {
            TagKind::Memory | TagKind::Pattern => TagShape::Inline,
            TagKind::Profile => TagShape::Block,
        }
    }

    /// Lowercase name used for in-band signal frames.
    pub fn signal_name(&self) -> &'static str {
        match self {
            TagKind::Memory => "memory",
            TagKind::Pattern => "pattern",
            TagKind::Profile => "profile",
        }
    }

    pub fn from_signal_name(name: &str) -> Option<Self> {
        TagKind::ALL.into_iter().find(|t| t.signal_name() == name)
    }
}

/// Classification of a user-visible stream failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamErrorKind {
    /// Generation failed before any token was produced.
    ModelInvocation,
    /// Generation stopped after some tokens were already sent.
    StreamInterruption,
}

impl StreamErrorKind {
    /// Warm, first-person copy shown to the user instead of the technical cause.
    pub fn user_message(&self) -> &'static str {
        match self {
            StreamErrorKind::ModelInvocation => {
                "I'm sorry, I couldn't gather my thoughts just now. Could you try sending that again?"
            }
            StreamErrorKind::StreamInterruption => {
                "I'm sorry, I lost my train of thought partway through. Tap retry and I'll pick it back up."
            }
        }
    }
}

// =============================================================================
// Newtype Wrappers
// =============================================================================

/// Authenticated user identifier, as issued by the auth collaborator.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unix timestamp in seconds since epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn now() -> Self {
        Self(Utc::now().timestamp())
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp())
    }

    pub fn to_datetime(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.0, 0).unwrap_or_default()
    }
}

/// Synthesis confidence. Range: 0.0 to 1.0.
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Confidence(pub f64);

impl Confidence {
    pub fn new(value: f64) -> Self {
        Self(value.clamp(0.0, 1.0))
    }
}

// =============================================================================
// Conversation
// =============================================================================

/// A single immutable turn in a conversation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub role: Role,
    pub text: String,
    pub created_at: Timestamp,
}

impl ConversationTurn {
    pub fn new(conversation_id: Uuid, role: Role, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            role,
            text: text.into(),
            created_at: Timestamp::now(),
        }
    }
}

/// Token accounting reported on stream completion.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    /// Rough estimate (four characters per token) for backends that report no usage.
    pub fn estimate(prompt: &str, completion: &str) -> Self {
        let count = |s: &str| s.chars().count().div_ceil(4) as u32;
        Self::new(count(prompt), count(completion))
    }
}

/// Payload pulled out of an extraction marker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExtractedSignal {
    pub tag: TagKind,
    pub raw_payload: String,
    /// False when the marker never closed and the payload is a best-effort salvage.
    pub validated: bool,
}

/// Which tag kinds completed during one stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalFlags {
    pub memory: bool,
    pub pattern: bool,
    pub profile: bool,
}

impl SignalFlags {
    pub fn set(&mut self, tag: TagKind) {
        match tag {
            TagKind::Memory => self.memory = true,
            TagKind::Pattern => self.pattern = true,
            TagKind::Profile => self.profile = true,
        }
    }

    pub fn contains(&self, tag: TagKind) -> bool {
        match tag {
            TagKind::Memory => self.memory,
            TagKind::Pattern => self.pattern,
            TagKind::Profile => self.profile,
        }
    }

    pub fn from_signals(signals: &[ExtractedSignal]) -> Self {
        let mut flags = Self::default();
        for signal in signals.iter().filter(|s| s.validated) {
            flags.set(signal.tag);
        }
        flags
    }
}

/// Event produced by the server pipeline for one stream.
///
/// Zero or more `Token`/`SignalFlag` events, then exactly one terminal
/// `Completion` or `Error`.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    Token(String),
    SignalFlag(TagKind),
    Completion {
        turn_id: Uuid,
        usage: Usage,
        flags: SignalFlags,
    },
    Error {
        kind: StreamErrorKind,
        message: String,
    },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Completion { .. } | StreamEvent::Error { .. })
    }

    /// Build an error event carrying the user-facing copy for `kind`.
    pub fn error(kind: StreamErrorKind) -> Self {
        StreamEvent::Error {
            kind,
            message: kind.user_message().to_string(),
        }
    }
}

// =============================================================================
// User profile, style, synthesis
// =============================================================================

/// Durable profile for a user, partially filled by discovery.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub display_name: Option<String>,
    #[serde(default)]
    pub goals: Vec<String>,
    #[serde(default)]
    pub values: Vec<String>,
    #[serde(default)]
    pub challenges: Vec<String>,
    pub communication_style: Option<String>,
    pub discovery_completed_at: Option<Timestamp>,
}

impl UserProfile {
    pub fn is_empty(&self) -> bool {
        self.display_name.is_none()
            && self.goals.is_empty()
            && self.values.is_empty()
            && self.challenges.is_empty()
            && self.communication_style.is_none()
    }

    /// Overlay `other` onto `self`; fields absent in `other` are kept.
    pub fn merge(&mut self, other: UserProfile) {
        if other.display_name.is_some() {
            self.display_name = other.display_name;
        }
        if !other.goals.is_empty() {
            self.goals = other.goals;
        }
        if !other.values.is_empty() {
            self.values = other.values;
        }
        if !other.challenges.is_empty() {
            self.challenges = other.challenges;
        }
        if other.communication_style.is_some() {
            self.communication_style = other.communication_style;
        }
        if other.discovery_completed_at.is_some() {
            self.discovery_completed_at = other.discovery_completed_at;
        }
    }
}

/// Preferred response length.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verbosity {
    Brief,
    #[default]
    Balanced,
    Detailed,
}

/// Preferred register.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tone {
    #[default]
    Warm,
    Direct,
}

/// Learned style preferences, refreshed by background analysis.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StylePreferences {
    pub verbosity: Verbosity,
    pub tone: Tone,
    pub prefers_questions: bool,
    /// Session count at the time of the analysis.
    pub analyzed_at_sessions: u32,
    pub analyzed_at: Timestamp,
}

/// A cross-domain behavioral pattern found by background analysis.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SynthesisRecord {
    pub user_id: UserId,
    pub theme: String,
    pub domains: Vec<Domain>,
    pub confidence: Confidence,
    pub evidence: Vec<String>,
    pub last_surfaced_at: Option<Timestamp>,
    pub surface_count: u32,
    pub computed_at: Timestamp,
}

impl SynthesisRecord {
    /// Confidence floor for surfacing.
    pub const MIN_CONFIDENCE: f64 = 0.85;
    /// Distinct domains required for surfacing.
    pub const MIN_DOMAINS: usize = 2;

    pub fn is_eligible(&self) -> bool {
        self.confidence.0 >= Self::MIN_CONFIDENCE && self.domains.len() >= Self::MIN_DOMAINS
    }
}
