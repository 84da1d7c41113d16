//! Concrete signal providers and the concurrent fan-out over them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use compass_core::config::CompassConfig;
use compass_core::safety::{CrisisDetector, CrisisSignal};
use compass_core::types::{StylePreferences, SynthesisRecord};
use compass_insight::{SessionPatternAnalyzer, SessionPatterns, SynthesisCache};
use compass_storage::{
    ConversationRepository, Database, MemoryRepository, PatternRepository, ProfileRepository,
};

use crate::classifier::{DomainClassifier, DomainSignal};
use crate::error::ChatError;
use crate::signals::{
    fetch_bounded, DiscoveryContext, SignalProvider, SignalRequest, SignalSet, UserContext,
};

/// Prior-session summaries included in the user context.
const SUMMARY_LIMIT: usize = 3;

/// Memory payloads included in the user context.
const MEMORY_LIMIT: usize = 5;

/// Run database work off the async runtime.
async fn blocking<T, F>(provider: &'static str, f: F) -> Result<T, ChatError>
where
    F: FnOnce() -> Result<T, ChatError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ChatError::Provider {
            provider,
            message: e.to_string(),
        })?
}

// =============================================================================
// Context loader
// =============================================================================

pub struct ContextLoader {
    db: Arc<Database>,
}

impl ContextLoader {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SignalProvider for ContextLoader {
    type Output = UserContext;

    fn name(&self) -> &'static str {
        "context"
    }

    async fn fetch(&self, request: &SignalRequest) -> Result<Option<UserContext>, ChatError> {
        let db = Arc::clone(&self.db);
        let user = request.user.clone();
        let conversation_id = request.conversation_id;

        blocking(self.name(), move || {
            let profile = ProfileRepository::new(Arc::clone(&db)).get(&user)?;
            let recent_memories = MemoryRepository::new(Arc::clone(&db)).recent(&user, MEMORY_LIMIT)?;
            let conversations = ConversationRepository::new(db);
            let prior_session_summaries =
                conversations.recent_summaries(&user, conversation_id, SUMMARY_LIMIT)?;
            let session_count = conversations.count_for_user(&user)?;

            let goals = profile
                .as_ref()
                .map(|p| p.goals.clone())
                .unwrap_or_default();
            let context = UserContext {
                profile: profile.filter(|p| !p.is_empty()),
                goals,
                recent_memories,
                prior_session_summaries,
                session_count,
            };

            let has_data = context.profile.is_some()
                || !context.recent_memories.is_empty()
                || !context.prior_session_summaries.is_empty()
                || context.has_history();
            Ok(has_data.then_some(context))
        })
        .await
    }
}

// =============================================================================
// Domain classifier
// =============================================================================

pub struct DomainProvider {
    classifier: DomainClassifier,
}

impl DomainProvider {
    pub fn new() -> Self {
        Self {
            classifier: DomainClassifier::new(),
        }
    }
}

impl Default for DomainProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SignalProvider for DomainProvider {
    type Output = DomainSignal;

    fn name(&self) -> &'static str {
        "domain"
    }

    async fn fetch(&self, request: &SignalRequest) -> Result<Option<DomainSignal>, ChatError> {
        Ok(self.classifier.classify(&request.message))
    }
}

// =============================================================================
// Crisis detector
// =============================================================================

pub struct CrisisProvider {
    detector: CrisisDetector,
}

impl CrisisProvider {
    pub fn new(detector: CrisisDetector) -> Self {
        Self { detector }
    }
}

#[async_trait]
impl SignalProvider for CrisisProvider {
    type Output = CrisisSignal;

    fn name(&self) -> &'static str {
        "crisis"
    }

    async fn fetch(&self, request: &SignalRequest) -> Result<Option<CrisisSignal>, ChatError> {
        let signal = self.detector.detect(&request.message);
        Ok(signal.detected.then_some(signal))
    }
}

// =============================================================================
// Cached analyses
// =============================================================================

/// Reads the best surfacing candidate from the synthesis cache.
pub struct SynthesisProvider {
    cache: Arc<SynthesisCache>,
}

impl SynthesisProvider {
    pub fn new(cache: Arc<SynthesisCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl SignalProvider for SynthesisProvider {
    type Output = SynthesisRecord;

    fn name(&self) -> &'static str {
        "synthesis"
    }

    async fn fetch(&self, request: &SignalRequest) -> Result<Option<SynthesisRecord>, ChatError> {
        let cache = Arc::clone(&self.cache);
        let user = request.user.clone();
        let conversation_id = request.conversation_id;
        blocking(self.name(), move || {
            Ok(cache.surfacing_candidate(&user, conversation_id)?)
        })
        .await
    }
}

/// Reads cached style preferences.
pub struct StyleProvider {
    cache: Arc<SynthesisCache>,
}

impl StyleProvider {
    pub fn new(cache: Arc<SynthesisCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl SignalProvider for StyleProvider {
    type Output = StylePreferences;

    fn name(&self) -> &'static str {
        "style"
    }

    async fn fetch(&self, request: &SignalRequest) -> Result<Option<StylePreferences>, ChatError> {
        let cache = Arc::clone(&self.cache);
        let user = request.user.clone();
        blocking(self.name(), move || Ok(cache.style(&user)?)).await
    }
}

pub struct SessionPatternProvider {
    db: Arc<Database>,
    analyzer: SessionPatternAnalyzer,
}

impl SessionPatternProvider {
    pub fn new(db: Arc<Database>, min_sessions: u32) -> Self {
        Self {
            db,
            analyzer: SessionPatternAnalyzer::new(min_sessions),
        }
    }
}

#[async_trait]
impl SignalProvider for SessionPatternProvider {
    type Output = SessionPatterns;

    fn name(&self) -> &'static str {
        "session_patterns"
    }

    async fn fetch(&self, request: &SignalRequest) -> Result<Option<SessionPatterns>, ChatError> {
        let db = Arc::clone(&self.db);
        let user = request.user.clone();
        let analyzer = self.analyzer;
        blocking(self.name(), move || {
            let conversations = ConversationRepository::new(Arc::clone(&db));
            let session_count = conversations.count_for_user(&user)?;
            if !analyzer.applies(session_count) {
                return Ok(None);
            }
            let histogram = conversations.domain_histogram(&user)?;
            let observations = PatternRepository::new(db).list_for_user(&user)?;
            Ok(analyzer.analyze(session_count, &histogram, &observations))
        })
        .await
    }
}

// =============================================================================
// Discovery profile loader
// =============================================================================

pub struct DiscoveryProvider {
    db: Arc<Database>,
    followup_sessions: u32,
}

impl DiscoveryProvider {
    pub fn new(db: Arc<Database>, followup_sessions: u32) -> Self {
        Self {
            db,
            followup_sessions,
        }
    }
}

#[async_trait]
impl SignalProvider for DiscoveryProvider {
    type Output = DiscoveryContext;

    fn name(&self) -> &'static str {
        "discovery"
    }

    async fn fetch(&self, request: &SignalRequest) -> Result<Option<DiscoveryContext>, ChatError> {
        let db = Arc::clone(&self.db);
        let user = request.user.clone();
        let followup_sessions = self.followup_sessions;
        blocking(self.name(), move || {
            let profile = ProfileRepository::new(Arc::clone(&db)).get(&user)?;
            let Some((profile, completed_at)) = profile
                .and_then(|p| p.discovery_completed_at.map(|at| (p, at)))
            else {
                return Ok(Some(DiscoveryContext::InProgress));
            };

            let sessions_since =
                ConversationRepository::new(db).count_started_after(&user, completed_at)?;
            if sessions_since == 0 || sessions_since > followup_sessions {
                return Ok(None);
            }
            Ok(Some(DiscoveryContext::Recent {
                profile,
                sessions_since,
            }))
        })
        .await
    }
}

// =============================================================================
// Fan-out
// =============================================================================

/// Every provider, fetched concurrently under one per-provider deadline.
pub struct SignalProviders {
    pub context: ContextLoader,
    pub domain: DomainProvider,
    pub crisis: CrisisProvider,
    pub synthesis: SynthesisProvider,
    pub session_patterns: SessionPatternProvider,
    pub style: StyleProvider,
    pub discovery: DiscoveryProvider,
    timeout: Duration,
}

impl SignalProviders {
    pub fn from_config(
        db: Arc<Database>,
        cache: Arc<SynthesisCache>,
        config: &CompassConfig,
    ) -> Self {
        Self {
            context: ContextLoader::new(Arc::clone(&db)),
            domain: DomainProvider::new(),
            crisis: CrisisProvider::new(CrisisDetector::new(config.safety.clone())),
            synthesis: SynthesisProvider::new(Arc::clone(&cache)),
            session_patterns: SessionPatternProvider::new(
                Arc::clone(&db),
                config.synthesis.session_pattern_min_sessions,
            ),
            style: StyleProvider::new(cache),
            discovery: DiscoveryProvider::new(db, config.synthesis.discovery_followup_sessions),
            timeout: Duration::from_millis(config.pipeline.provider_timeout_ms),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Fetch every signal. Returns once each provider has answered or timed out.
    pub async fn gather(&self, request: &SignalRequest) -> SignalSet {
        let deadline = self.timeout;
        let (context, domain, crisis, synthesis, session_patterns, style, discovery) = tokio::join!(
            fetch_bounded(&self.context, request, deadline),
            fetch_bounded(&self.domain, request, deadline),
            fetch_bounded(&self.crisis, request, deadline),
            fetch_bounded(&self.synthesis, request, deadline),
            fetch_bounded(&self.session_patterns, request, deadline),
            fetch_bounded(&self.style, request, deadline),
            fetch_bounded(&self.discovery, request, deadline),
        );

        let signals = SignalSet {
            context,
            domain,
            crisis,
            synthesis,
            session_patterns,
            style,
            discovery,
        };
        debug!(
            user_id = %request.user,
            conversation_id = %request.conversation_id,
            present = ?signals.present(),
            "Signals gathered"
        );
        signals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use compass_core::types::{Domain, Timestamp, UserId, UserProfile};
    use compass_insight::RefreshQueue;
    use uuid::Uuid;

    struct Fixture {
        db: Arc<Database>,
        providers: SignalProviders,
        _receiver: compass_insight::RefreshReceiver,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(Database::in_memory().unwrap());
        let config = CompassConfig::default();
        let (queue, receiver) = RefreshQueue::channel();
        let cache = Arc::new(SynthesisCache::new(
            Arc::clone(&db),
            &config.synthesis,
            queue,
        ));
        Fixture {
            providers: SignalProviders::from_config(Arc::clone(&db), cache, &config),
            db,
            _receiver: receiver,
        }
    }

    fn start(db: &Arc<Database>, user: &UserId) -> Uuid {
        let id = Uuid::new_v4();
        ConversationRepository::new(Arc::clone(db))
            .touch(user, id)
            .unwrap();
        id
    }

    fn request(user: &UserId, conversation_id: Uuid, message: &str) -> SignalRequest {
        SignalRequest {
            user: user.clone(),
            conversation_id,
            message: message.to_string(),
        }
    }

    #[tokio::test]
    async fn test_new_user_gets_discovery_and_no_context() {
        let f = fixture();
        let user = UserId::new("new");
        let conv = start(&f.db, &user);
        let signals = f
            .providers
            .gather(&request(&user, conv, "I've been stuck on my promotion case for weeks"))
            .await;

        assert!(signals.context.is_none());
        assert_eq!(signals.discovery, Some(DiscoveryContext::InProgress));
        assert_eq!(signals.domain.as_ref().unwrap().primary, Domain::Career);
        assert!(!signals.crisis_detected());
        assert!(signals.synthesis.is_none());
        assert!(signals.session_patterns.is_none());
    }

    #[tokio::test]
    async fn test_crisis_signal_present_only_when_detected() {
        let f = fixture();
        let user = UserId::new("u1");
        let conv = start(&f.db, &user);
        let signals = f
            .providers
            .gather(&request(&user, conv, "I feel hopeless"))
            .await;
        assert!(signals.crisis_detected());

        let signals = f.providers.gather(&request(&user, conv, "thanks")).await;
        assert!(signals.crisis.is_none());
    }

    #[tokio::test]
    async fn test_context_and_discovery_followup_after_profile() {
        let f = fixture();
        let user = UserId::new("u1");
        start(&f.db, &user);
        ProfileRepository::new(Arc::clone(&f.db))
            .upsert_merge(
                &user,
                UserProfile {
                    display_name: Some("Sam".to_string()),
                    goals: vec!["get promoted".to_string()],
                    discovery_completed_at: Some(Timestamp(Timestamp::now().0 - 10)),
                    ..UserProfile::default()
                },
            )
            .unwrap();
        MemoryRepository::new(Arc::clone(&f.db))
            .save(&user, Uuid::new_v4(), "marathon training")
            .unwrap();

        let conv = start(&f.db, &user);
        let signals = f.providers.gather(&request(&user, conv, "hello")).await;

        let context = signals.context.unwrap();
        assert_eq!(context.goals, vec!["get promoted"]);
        assert_eq!(context.recent_memories, vec!["marathon training"]);
        assert_eq!(context.session_count, 2);
        match signals.discovery {
            Some(DiscoveryContext::Recent { sessions_since, .. }) => assert_eq!(sessions_since, 2),
            other => panic!("unexpected discovery context: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_session_patterns_need_five_sessions() {
        let f = fixture();
        let user = UserId::new("u1");
        start(&f.db, &user);
        let patterns = PatternRepository::new(Arc::clone(&f.db));
        let mut last = None;
        for _ in 0..3 {
            let conv = start(&f.db, &user);
            patterns.record(&user, conv, "overwork", Some(Domain::Career)).unwrap();
            last = Some(conv);
        }
        let signals = f
            .providers
            .gather(&request(&user, last.unwrap(), "hi"))
            .await;
        assert!(signals.session_patterns.is_none());

        let conv = start(&f.db, &user);
        let signals = f.providers.gather(&request(&user, conv, "hi")).await;
        let summary = signals.session_patterns.unwrap();
        assert_eq!(summary.session_count, 5);
        assert_eq!(summary.recurring_themes, vec!["overwork"]);
    }
}
