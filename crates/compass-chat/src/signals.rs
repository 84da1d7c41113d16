//! Signal provider interface and the per-request signal set.
//!
//! Each provider answers one question about the current request. Providers
//! are independent: they run concurrently, each under its own deadline,
//! and a provider that fails or overruns simply contributes nothing.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use compass_core::safety::CrisisSignal;
use compass_core::types::{StylePreferences, SynthesisRecord, UserId, UserProfile};
use compass_insight::SessionPatterns;

use crate::classifier::DomainSignal;
use crate::error::ChatError;

/// Inputs shared by every provider for one request.
#[derive(Debug, Clone)]
pub struct SignalRequest {
    pub user: UserId,
    pub conversation_id: Uuid,
    pub message: String,
}

/// A read-only source of context for prompt composition.
#[async_trait]
pub trait SignalProvider: Send + Sync {
    type Output: Send;

    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// `Ok(None)` means the signal does not apply to this request.
    async fn fetch(&self, request: &SignalRequest) -> Result<Option<Self::Output>, ChatError>;
}

/// Run one provider under `deadline`; errors and overruns become `None`.
pub async fn fetch_bounded<P: SignalProvider + ?Sized>(
    provider: &P,
    request: &SignalRequest,
    deadline: Duration,
) -> Option<P::Output> {
    match tokio::time::timeout(deadline, provider.fetch(request)).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            warn!(
                provider = provider.name(),
                user_id = %request.user,
                error = %e,
                "Signal provider failed, treating as absent"
            );
            None
        }
        Err(_) => {
            warn!(
                provider = provider.name(),
                user_id = %request.user,
                timeout_ms = deadline.as_millis() as u64,
                "Signal provider timed out, treating as absent"
            );
            None
        }
    }
}

/// What the context loader knows about the user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserContext {
    pub profile: Option<UserProfile>,
    pub goals: Vec<String>,
    pub recent_memories: Vec<String>,
    pub prior_session_summaries: Vec<String>,
    /// Conversations so far, the current one included.
    pub session_count: u32,
}

impl UserContext {
    /// Whether the user has talked to us before this conversation.
    pub fn has_history(&self) -> bool {
        self.session_count > 1
    }
}

/// Where the user is relative to the discovery (onboarding) conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DiscoveryContext {
    /// Discovery has not produced a profile yet.
    InProgress,
    /// Discovery finished `sessions_since` conversations ago.
    Recent {
        profile: UserProfile,
        sessions_since: u32,
    },
}

/// Every provider's answer for one request. `None` means absent.
#[derive(Debug, Clone, Default)]
pub struct SignalSet {
    pub context: Option<UserContext>,
    pub domain: Option<DomainSignal>,
    pub crisis: Option<CrisisSignal>,
    pub synthesis: Option<SynthesisRecord>,
    pub session_patterns: Option<SessionPatterns>,
    pub style: Option<StylePreferences>,
    pub discovery: Option<DiscoveryContext>,
}

impl SignalSet {
    pub fn crisis_detected(&self) -> bool {
        self.crisis.as_ref().is_some_and(|c| c.detected)
    }

    /// Names of the providers that answered, for logging.
    pub fn present(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.context.is_some() {
            names.push("context");
        }
        if self.domain.is_some() {
            names.push("domain");
        }
        if self.crisis_detected() {
            names.push("crisis");
        }
        if self.synthesis.is_some() {
            names.push("synthesis");
        }
        if self.session_patterns.is_some() {
            names.push("session_patterns");
        }
        if self.style.is_some() {
            names.push("style");
        }
        if self.discovery.is_some() {
            names.push("discovery");
        }
        names
    }
}
