//! Read side of the synthesis and style caches.
//!
//! Request-path callers read whatever is cached and, when the cache is
//! stale, enqueue a refresh without waiting for it.

use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use compass_core::config::SynthesisConfig;
use compass_core::types::{StylePreferences, SynthesisRecord, Timestamp, UserId};
use compass_storage::{ConversationRepository, Database, StyleRepository, SynthesisRepository};

use crate::error::InsightError;
use crate::limiter::{RefreshPolicy, SurfacingLimiter};
use crate::queue::{RefreshJob, RefreshQueue};

/// Cached analyses plus the rules for surfacing and refreshing them.
pub struct SynthesisCache {
    conversations: ConversationRepository,
    synthesis: SynthesisRepository,
    style: StyleRepository,
    limiter: SurfacingLimiter,
    policy: RefreshPolicy,
    queue: RefreshQueue,
}

impl SynthesisCache {
    pub fn new(db: Arc<Database>, config: &SynthesisConfig, queue: RefreshQueue) -> Self {
        Self {
            conversations: ConversationRepository::new(Arc::clone(&db)),
            synthesis: SynthesisRepository::new(Arc::clone(&db)),
            style: StyleRepository::new(db),
            limiter: SurfacingLimiter::from_config(config),
            policy: RefreshPolicy::from_config(config),
            queue,
        }
    }

    /// The best eligible synthesis that may surface in `conversation_id`.
    ///
    /// Schedules a background rebuild when the cache is stale, but always
    /// answers from what is stored now.
    pub fn surfacing_candidate(
        &self,
        user: &UserId,
        conversation_id: Uuid,
    ) -> Result<Option<SynthesisRecord>, InsightError> {
        let conversation_count = self.conversations.count_for_user(user)?;
        let last_run = self.synthesis.last_run(user)?;
        if self
            .policy
            .synthesis_stale(last_run.as_ref(), conversation_count, Timestamp::now())
        {
            self.queue.enqueue(RefreshJob::Synthesis { user: user.clone() });
        }

        let eligible: Vec<SynthesisRecord> = self
            .synthesis
            .list(user)?
            .into_iter()
            .filter(SynthesisRecord::is_eligible)
            .collect();
        if eligible.is_empty() {
            return Ok(None);
        }

        let prior = self
            .conversations
            .recent_ids(user, self.limiter.cooldown() + 1)?;
        let mut window = prior.clone();
        window.push(conversation_id);
        let history = self.synthesis.surfacing_history(user, &window)?;

        for record in eligible {
            if self
                .limiter
                .can_surface(conversation_id, &prior, &history, &record.theme)
            {
                return Ok(Some(record));
            }
            debug!(
                user_id = %user,
                conversation_id = %conversation_id,
                theme = %record.theme,
                "Synthesis suppressed by surfacing cooldown"
            );
        }
        Ok(None)
    }

    /// Persist that `theme` surfaced in `conversation_id`.
    pub fn record_surfaced(
        &self,
        user: &UserId,
        conversation_id: Uuid,
        theme: &str,
    ) -> Result<(), InsightError> {
        self.synthesis.mark_surfaced(user, conversation_id, theme)?;
        Ok(())
    }

    /// Cached style preferences; schedules re-analysis when stale.
    pub fn style(&self, user: &UserId) -> Result<Option<StylePreferences>, InsightError> {
        let session_count = self.conversations.count_for_user(user)?;
        let prefs = self.style.get(user)?;
        if self.policy.style_stale(prefs.as_ref(), session_count) {
            self.queue.enqueue(RefreshJob::Style { user: user.clone() });
        }
        Ok(prefs)
    }
}
