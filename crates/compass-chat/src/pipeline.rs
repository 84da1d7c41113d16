//! Server-side conversation pipeline.
//!
//! One call to [`ChatPipeline::start`] handles one user utterance: the user
//! turn is recorded, signals are gathered concurrently, the prompt is
//! composed and the model output is relayed as [`StreamEvent`]s. The stream
//! always ends with exactly one `Completion` or `Error`, unless the receiver
//! is dropped first, in which case generation is cancelled.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use compass_core::config::{CompassConfig, ModelConfig, PipelineConfig};
use compass_core::error::CompassError;
use compass_core::tags::TagScanner;
use compass_core::types::{
    ConversationTurn, Domain, ExtractedSignal, Role, StreamErrorKind, StreamEvent,
    TagKind, Usage, UserId,
};
use compass_insight::{RefreshJob, RefreshQueue, SynthesisCache};
use compass_storage::{
    ConversationRepository, Database, MemoryRepository, PatternRepository, ProfileRepository,
    TurnRepository,
};

use crate::composer::compose;
use crate::error::ChatError;
use crate::llm::{ChunkReceiver, ModelBackend, ModelChunk, ModelMessage, ModelRequest};
use crate::profile::parse_profile;
use crate::prompts::{self, PromptLibrary};
use crate::providers::SignalProviders;
use crate::signals::SignalRequest;

/// Server stream lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Requesting,
    Streaming,
    Completed,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Completed | PipelineState::Failed)
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_advance_to(&self, next: PipelineState) -> bool {
        use PipelineState::*;
        matches!(
            (*self, next),
            (Idle, Requesting)
                | (Requesting, Streaming)
                | (Requesting, Failed)
                | (Streaming, Completed)
                | (Streaming, Failed)
        )
    }
}

/// Tracks and logs state transitions for one stream.
struct StateTracker {
    state: PipelineState,
    conversation_id: Uuid,
}

impl StateTracker {
    fn new(conversation_id: Uuid) -> Self {
        Self {
            state: PipelineState::Idle,
            conversation_id,
        }
    }

    fn advance(&mut self, next: PipelineState) {
        if !self.state.can_advance_to(next) {
            warn!(
                conversation_id = %self.conversation_id,
                from = ?self.state,
                to = ?next,
                "Unexpected pipeline state transition"
            );
        }
        debug!(conversation_id = %self.conversation_id, from = ?self.state, to = ?next, "Pipeline state");
        self.state = next;
    }
}

/// Coordinates signal gathering, composition and model streaming.
pub struct ChatPipeline {
    db: Arc<Database>,
    providers: SignalProviders,
    cache: Arc<SynthesisCache>,
    queue: RefreshQueue,
    backend: Arc<dyn ModelBackend>,
    prompts: &'static PromptLibrary,
    pipeline: PipelineConfig,
    model: ModelConfig,
}

/// What the request path learned before streaming starts.
struct Prepared {
    history: Vec<ConversationTurn>,
    reused_user_turn: bool,
}

impl ChatPipeline {
    pub fn new(
        db: Arc<Database>,
        cache: Arc<SynthesisCache>,
        queue: RefreshQueue,
        backend: Arc<dyn ModelBackend>,
        config: &CompassConfig,
    ) -> Self {
        Self {
            providers: SignalProviders::from_config(Arc::clone(&db), Arc::clone(&cache), config),
            db,
            cache,
            queue,
            backend,
            prompts: prompts::global(),
            pipeline: config.pipeline.clone(),
            model: config.model.clone(),
        }
    }

    /// Use a specific prompt library instead of the process-wide one.
    pub fn with_prompts(mut self, prompts: &'static PromptLibrary) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    fn validate(&self, message: &str) -> Result<(), ChatError> {
        if message.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        if message.chars().count() > self.pipeline.max_message_length {
            return Err(ChatError::MessageTooLong(self.pipeline.max_message_length));
        }
        Ok(())
    }

    /// Handle one user utterance and return its event stream.
    ///
    /// Errors returned here happen before anything is streamed (invalid
    /// input, unknown conversation, storage failure). Model failures are
    /// reported in-band as `StreamEvent::Error`.
    pub async fn start(
        &self,
        user: &UserId,
        conversation_id: Uuid,
        message: &str,
    ) -> Result<mpsc::Receiver<StreamEvent>, ChatError> {
        self.validate(message)?;
        let message = message.trim().to_string();

        let prepared = self.prepare(user, conversation_id, &message).await?;
        info!(
            user_id = %user,
            conversation_id = %conversation_id,
            retry = prepared.reused_user_turn,
            "Chat request accepted"
        );

        let request = SignalRequest {
            user: user.clone(),
            conversation_id,
            message,
        };
        let signals = self.providers.gather(&request).await;
        let domain = signals.domain.as_ref().map(|d| d.primary);
        let composed = compose(self.prompts, &signals, signals.crisis_detected());
        if signals.crisis_detected() {
            warn!(
                user_id = %user,
                conversation_id = %conversation_id,
                severity = ?signals.crisis.as_ref().and_then(|c| c.severity),
                "Crisis language detected, override block active"
            );
        }
        self.record_side_effects(conversation_id, domain).await;

        let model_request = ModelRequest {
            system: composed.render(),
            messages: prepared
                .history
                .iter()
                .filter(|t| t.role != Role::System)
                .map(|t| ModelMessage::new(t.role, t.text.clone()))
                .collect(),
            temperature: self.model.temperature,
            max_tokens: self.model.max_tokens,
        };

        let (tx, rx) = mpsc::channel(self.pipeline.event_buffer.max(1));
        let task = StreamTask {
            db: Arc::clone(&self.db),
            cache: Arc::clone(&self.cache),
            queue: self.queue.clone(),
            backend: Arc::clone(&self.backend),
            user: user.clone(),
            conversation_id,
            domain,
            surfaced_theme: composed.surfaced_theme.clone(),
            request: model_request,
        };
        tokio::spawn(task.run(tx));
        Ok(rx)
    }

    /// Record the user turn, reusing it when this is a retry.
    async fn prepare(
        &self,
        user: &UserId,
        conversation_id: Uuid,
        message: &str,
    ) -> Result<Prepared, ChatError> {
        let db = Arc::clone(&self.db);
        let user = user.clone();
        let message = message.to_string();
        let history_turns = self.pipeline.history_turns;

        tokio::task::spawn_blocking(move || {
            let conversations = ConversationRepository::new(Arc::clone(&db));
            match conversations.touch(&user, conversation_id) {
                Ok(_) => {}
                Err(CompassError::NotFound(_)) => {
                    return Err(ChatError::ConversationNotFound(conversation_id))
                }
                Err(e) => return Err(e.into()),
            }

            let turns = TurnRepository::new(db);
            let reused_user_turn = turns
                .last(conversation_id)?
                .is_some_and(|last| last.role == Role::User && last.text == message);
            if !reused_user_turn {
                turns.append(
                    &user,
                    &ConversationTurn::new(conversation_id, Role::User, message),
                )?;
            }

            Ok(Prepared {
                history: turns.recent(conversation_id, history_turns.max(1))?,
                reused_user_turn,
            })
        })
        .await
        .map_err(|e| ChatError::Storage(e.to_string()))?
    }

    /// Best-effort writes that follow composition. Failures are logged only.
    async fn record_side_effects(&self, conversation_id: Uuid, domain: Option<Domain>) {
        let Some(domain) = domain else {
            return;
        };
        let db = Arc::clone(&self.db);

        let result = tokio::task::spawn_blocking(move || -> Result<(), ChatError> {
            ConversationRepository::new(db).set_primary_domain(conversation_id, domain)?;
            Ok(())
        })
        .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(conversation_id = %conversation_id, error = %e, "Failed to record request metadata"),
            Err(e) => warn!(conversation_id = %conversation_id, error = %e, "Request metadata task failed"),
        }
    }

    /// Every turn of a conversation owned by `user`.
    pub async fn history(
        &self,
        user: &UserId,
        conversation_id: Uuid,
    ) -> Result<Vec<ConversationTurn>, ChatError> {
        let db = Arc::clone(&self.db);
        let user = user.clone();
        tokio::task::spawn_blocking(move || {
            let owned = ConversationRepository::new(Arc::clone(&db))
                .find_by_id(conversation_id)?
                .is_some_and(|row| row.user_id == user);
            if !owned {
                return Err(ChatError::ConversationNotFound(conversation_id));
            }
            Ok(TurnRepository::new(db).list(conversation_id)?)
        })
        .await
        .map_err(|e| ChatError::Storage(e.to_string()))?
    }
}

/// Everything the detached streaming task owns.
struct StreamTask {
    db: Arc<Database>,
    cache: Arc<SynthesisCache>,
    queue: RefreshQueue,
    backend: Arc<dyn ModelBackend>,
    user: UserId,
    conversation_id: Uuid,
    domain: Option<Domain>,
    /// Synthesis theme in this prompt; logged as surfaced only once the reply completes.
    surfaced_theme: Option<String>,
    request: ModelRequest,
}

impl StreamTask {
    async fn run(self, tx: mpsc::Sender<StreamEvent>) {
        let mut state = StateTracker::new(self.conversation_id);
        state.advance(PipelineState::Requesting);

        let started = tokio::select! {
            biased;
            _ = tx.closed() => {
                info!(conversation_id = %self.conversation_id, "Request cancelled before generation started");
                return;
            }
            started = self.backend.stream(self.request.clone()) => started,
        };
        let chunks = match started {
            Ok(chunks) => chunks,
            Err(e) => {
                error!(
                    conversation_id = %self.conversation_id,
                    backend = self.backend.name(),
                    error = %e,
                    "Model invocation failed"
                );
                state.advance(PipelineState::Failed);
                let _ = tx.send(StreamEvent::error(StreamErrorKind::ModelInvocation)).await;
                return;
            }
        };
        state.advance(PipelineState::Streaming);

        let Some(relayed) = self.relay(chunks, &tx).await else {
            return;
        };
        let (mut scanner, usage) = match relayed {
            Ok(done) => done,
            Err(kind) => {
                state.advance(PipelineState::Failed);
                let _ = tx.send(StreamEvent::error(kind)).await;
                return;
            }
        };
        scanner.finish();

        if scanner.raw().trim().is_empty() {
            warn!(conversation_id = %self.conversation_id, "Model produced no output");
            state.advance(PipelineState::Failed);
            let _ = tx.send(StreamEvent::error(StreamErrorKind::ModelInvocation)).await;
            return;
        }

        let usage = usage.unwrap_or_else(|| {
            let prompt: String = std::iter::once(self.request.system.as_str())
                .chain(self.request.messages.iter().map(|m| m.content.as_str()))
                .collect();
            Usage::estimate(&prompt, scanner.raw())
        });
        let flags = scanner.flags();

        match self.persist(&scanner).await {
            Ok(turn_id) => {
                state.advance(PipelineState::Completed);
                info!(
                    conversation_id = %self.conversation_id,
                    turn_id = %turn_id,
                    completion_tokens = usage.completion_tokens,
                    memory = flags.memory,
                    pattern = flags.pattern,
                    profile = flags.profile,
                    "Stream completed"
                );
                self.record_surfaced().await;
                self.queue.enqueue(RefreshJob::Summary {
                    user: self.user.clone(),
                    conversation_id: self.conversation_id,
                });
                let _ = tx
                    .send(StreamEvent::Completion {
                        turn_id,
                        usage,
                        flags,
                    })
                    .await;
            }
            Err(e) => {
                error!(conversation_id = %self.conversation_id, error = %e, "Failed to persist assistant turn");
                state.advance(PipelineState::Failed);
                let _ = tx
                    .send(StreamEvent::error(StreamErrorKind::StreamInterruption))
                    .await;
            }
        }
    }

    /// Log the synthesis theme as surfaced. Failures are logged only.
    async fn record_surfaced(&self) {
        let Some(theme) = self.surfaced_theme.clone() else {
            return;
        };
        let cache = Arc::clone(&self.cache);
        let user = self.user.clone();
        let conversation_id = self.conversation_id;

        let result = tokio::task::spawn_blocking(move || {
            cache.record_surfaced(&user, conversation_id, &theme)?;
            info!(user_id = %user, conversation_id = %conversation_id, theme = %theme, "Synthesis surfaced");
            Ok::<(), ChatError>(())
        })
        .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(conversation_id = %self.conversation_id, error = %e, "Failed to record surfaced synthesis"),
            Err(e) => warn!(conversation_id = %self.conversation_id, error = %e, "Surfacing record task failed"),
        }
    }

    /// Forward model output until it ends.
    ///
    /// `None` means the receiver went away and the stream was cancelled.
    /// `Some(Err(kind))` is an upstream failure to report.
    async fn relay(
        &self,
        mut chunks: ChunkReceiver,
        tx: &mpsc::Sender<StreamEvent>,
    ) -> Option<Result<(TagScanner, Option<Usage>), StreamErrorKind>> {
        let mut scanner = TagScanner::new();
        let mut usage = None;
        let mut sent_tokens = false;

        loop {
            let next = tokio::select! {
                biased;
                _ = tx.closed() => {
                    info!(conversation_id = %self.conversation_id, "Client disconnected, cancelling generation");
                    return None;
                }
                next = chunks.recv() => next,
            };

            match next {
                Some(Ok(ModelChunk::Delta(text))) => {
                    let step = scanner.push(&text);
                    if tx.send(StreamEvent::Token(text)).await.is_err() {
                        return None;
                    }
                    sent_tokens = true;
                    for tag in step.completed {
                        if tx.send(StreamEvent::SignalFlag(tag)).await.is_err() {
                            return None;
                        }
                    }
                }
                Some(Ok(ModelChunk::Usage(reported))) => usage = Some(reported),
                Some(Err(e)) => {
                    let kind = if sent_tokens {
                        StreamErrorKind::StreamInterruption
                    } else {
                        StreamErrorKind::ModelInvocation
                    };
                    warn!(
                        conversation_id = %self.conversation_id,
                        error = %e,
                        kind = ?kind,
                        partial_chars = scanner.raw().len(),
                        "Model stream failed"
                    );
                    return Some(Err(kind));
                }
                None => return Some(Ok((scanner, usage))),
            }
        }
    }

    /// Write the assistant turn, then the extracted payloads.
    ///
    /// Only the turn write can fail the stream; payload writes are logged.
    async fn persist(&self, scanner: &TagScanner) -> Result<Uuid, ChatError> {
        let db = Arc::clone(&self.db);
        let user = self.user.clone();
        let conversation_id = self.conversation_id;
        let domain = self.domain;
        let text = scanner.visible().trim().to_string();
        let signals = scanner.signals().to_vec();

        tokio::task::spawn_blocking(move || {
            let turn = ConversationTurn::new(conversation_id, Role::Assistant, text);
            TurnRepository::new(Arc::clone(&db)).append(&user, &turn)?;

            for signal in &signals {
                if let Err(e) = write_signal(&db, &user, conversation_id, domain, signal) {
                    warn!(
                        conversation_id = %conversation_id,
                        tag = signal.tag.signal_name(),
                        error = %e,
                        "Failed to persist extracted signal"
                    );
                }
            }
            Ok(turn.id)
        })
        .await
        .map_err(|e| ChatError::Storage(e.to_string()))?
    }
}

/// Persist one extracted payload.
fn write_signal(
    db: &Arc<Database>,
    user: &UserId,
    conversation_id: Uuid,
    turn_domain: Option<Domain>,
    signal: &ExtractedSignal,
) -> Result<(), ChatError> {
    match signal.tag {
        TagKind::Memory if signal.validated => {
            MemoryRepository::new(Arc::clone(db)).save(user, conversation_id, &signal.raw_payload)?;
        }
        TagKind::Pattern if signal.validated => {
            let (theme, domain) = match signal.raw_payload.split_once('|') {
                Some((theme, domain)) => (theme.trim(), Domain::parse(domain.trim()).or(turn_domain)),
                None => (signal.raw_payload.trim(), turn_domain),
            };
            if !theme.is_empty() {
                PatternRepository::new(Arc::clone(db)).record(user, conversation_id, theme, domain)?;
            }
        }
        TagKind::Profile if !signal.raw_payload.is_empty() => {
            let parsed = parse_profile(&signal.raw_payload);
            if !parsed.is_clean() || !signal.validated {
                warn!(
                    user_id = %user,
                    complete = signal.validated,
                    problems = ?parsed.problems,
                    "Profile payload only partially parsed"
                );
            }
            if !parsed.profile.is_empty() {
                ProfileRepository::new(Arc::clone(db)).upsert_merge(user, parsed.profile)?;
            }
        }
        _ => debug!(tag = signal.tag.signal_name(), "Skipping incomplete signal"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use compass_core::types::{Confidence, SynthesisRecord, Timestamp};
    use compass_insight::RefreshReceiver;
    use compass_storage::SynthesisRepository;

    use crate::llm::ScriptedBackend;

    struct Fixture {
        db: Arc<Database>,
        queue: RefreshQueue,
        _receiver: RefreshReceiver,
    }

    impl Fixture {
        fn new() -> Self {
            let (queue, receiver) = RefreshQueue::channel();
            Self {
                db: Arc::new(Database::in_memory().unwrap()),
                queue,
                _receiver: receiver,
            }
        }

        fn pipeline(&self, backend: ScriptedBackend) -> ChatPipeline {
            self.pipeline_with(Arc::new(backend))
        }

        fn pipeline_with(&self, backend: Arc<dyn ModelBackend>) -> ChatPipeline {
            let config = CompassConfig::default();
            let cache = Arc::new(SynthesisCache::new(
                Arc::clone(&self.db),
                &config.synthesis,
                self.queue.clone(),
            ));
            ChatPipeline::new(
                Arc::clone(&self.db),
                cache,
                self.queue.clone(),
                backend,
                &config,
            )
        }
    }

    async fn collect(mut rx: mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    fn tokens(events: &[StreamEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Token(t) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_promotion_case_end_to_end() {
        let f = Fixture::new();
        let backend = ScriptedBackend::new([
            "That sounds draining. ",
            "What would progress look like? [MEM",
            "ORY: promotion ",
            "case]",
        ])
        .with_usage(Usage::new(120, 14));
        let pipeline = f.pipeline(backend);
        let user = UserId::new("u1");
        let conv = Uuid::new_v4();

        let rx = pipeline
            .start(&user, conv, "I've been stuck on my promotion case for weeks")
            .await
            .unwrap();
        let events = collect(rx).await;

        let flag_count = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::SignalFlag(TagKind::Memory)))
            .count();
        assert_eq!(flag_count, 1);
        assert_eq!(
            tokens(&events),
            "That sounds draining. What would progress look like? [MEMORY: promotion case]"
        );

        let (turn_id, usage, flags) = match events.last().unwrap() {
            StreamEvent::Completion {
                turn_id,
                usage,
                flags,
            } => (*turn_id, *usage, *flags),
            other => panic!("expected completion, got {:?}", other),
        };
        assert!(flags.memory);
        assert!(!flags.pattern);
        assert_eq!(usage.total_tokens, 134);
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);

        let turns = TurnRepository::new(Arc::clone(&f.db)).list(conv).unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[1].id, turn_id);
        assert_eq!(
            turns[1].text,
            "That sounds draining. What would progress look like?"
        );
        assert_eq!(
            MemoryRepository::new(Arc::clone(&f.db))
                .recent(&user, 5)
                .unwrap(),
            vec!["promotion case"]
        );
        let row = ConversationRepository::new(Arc::clone(&f.db))
            .find_by_id(conv)
            .unwrap()
            .unwrap();
        assert_eq!(row.primary_domain, Some(Domain::Career));
    }

    /// Records every request and answers with a fixed reply.
    struct RecordingBackend {
        requests: std::sync::Mutex<Vec<ModelRequest>>,
    }

    #[async_trait::async_trait]
    impl ModelBackend for RecordingBackend {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn stream(&self, request: ModelRequest) -> Result<ChunkReceiver, crate::error::ModelError> {
            self.requests.lock().unwrap().push(request.clone());
            ScriptedBackend::new(["I'm here with you."]).stream(request).await
        }
    }

    #[tokio::test]
    async fn test_crisis_block_only_on_the_crisis_turn() {
        let f = Fixture::new();
        let backend = Arc::new(RecordingBackend {
            requests: std::sync::Mutex::new(Vec::new()),
        });
        let config = CompassConfig::default();
        let cache = Arc::new(SynthesisCache::new(
            Arc::clone(&f.db),
            &config.synthesis,
            f.queue.clone(),
        ));
        let pipeline = ChatPipeline::new(
            Arc::clone(&f.db),
            cache,
            f.queue.clone(),
            Arc::clone(&backend) as Arc<dyn ModelBackend>,
            &config,
        );
        let user = UserId::new("u1");
        let conv = Uuid::new_v4();

        collect(pipeline.start(&user, conv, "Everything feels hopeless").await.unwrap()).await;
        collect(pipeline.start(&user, conv, "Thanks, that helped a bit").await.unwrap()).await;
        collect(pipeline.start(&user, Uuid::new_v4(), "Back again").await.unwrap()).await;

        let library = prompts::global();
        let requests = backend.requests.lock().unwrap();
        assert_eq!(requests.len(), 3);
        assert!(requests[0].system.contains(library.crisis_override.trim()));
        for request in &requests[1..] {
            assert!(!request.system.contains(library.crisis_override.trim()));
            assert!(request.system.contains(library.crisis_continuity.trim()));
        }
        assert_eq!(requests[1].messages.len(), 3);
        assert_eq!(requests[1].messages[2].content, "Thanks, that helped a bit");
    }

    #[tokio::test]
    async fn test_invalid_messages_rejected_before_streaming() {
        let f = Fixture::new();
        let pipeline = f.pipeline(ScriptedBackend::new(["hi"]));
        let user = UserId::new("u1");
        assert!(matches!(
            pipeline.start(&user, Uuid::new_v4(), "   ").await,
            Err(ChatError::EmptyMessage)
        ));
        let long = "a".repeat(4001);
        assert!(matches!(
            pipeline.start(&user, Uuid::new_v4(), &long).await,
            Err(ChatError::MessageTooLong(4000))
        ));
    }

    #[tokio::test]
    async fn test_foreign_conversation_not_found() {
        let f = Fixture::new();
        let pipeline = f.pipeline(ScriptedBackend::new(["hi"]));
        let conv = Uuid::new_v4();
        collect(pipeline.start(&UserId::new("owner"), conv, "hello").await.unwrap()).await;

        let result = pipeline.start(&UserId::new("intruder"), conv, "hello").await;
        assert!(matches!(result, Err(ChatError::ConversationNotFound(id)) if id == conv));
        assert!(matches!(
            pipeline.history(&UserId::new("intruder"), conv).await,
            Err(ChatError::ConversationNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_invocation_failure_persists_nothing() {
        let f = Fixture::new();
        let pipeline = f.pipeline(ScriptedBackend::failing_on_start());
        let user = UserId::new("u1");
        let conv = Uuid::new_v4();

        let events = collect(pipeline.start(&user, conv, "hello").await.unwrap()).await;
        assert_eq!(events, vec![StreamEvent::error(StreamErrorKind::ModelInvocation)]);

        let turns = pipeline.history(&user, conv).await.unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].role, Role::User);
    }

    #[tokio::test]
    async fn test_interruption_then_retry_does_not_duplicate_user_turn() {
        let f = Fixture::new();
        let user = UserId::new("u1");
        let conv = Uuid::new_v4();

        let broken = f.pipeline(ScriptedBackend::new(["Let me ", "think ", "about"]).failing_after(2));
        let events = collect(broken.start(&user, conv, "help me plan").await.unwrap()).await;
        assert_eq!(tokens(&events), "Let me think ");
        assert!(matches!(
            events.last(),
            Some(StreamEvent::Error {
                kind: StreamErrorKind::StreamInterruption,
                ..
            })
        ));

        let healthy = f.pipeline(ScriptedBackend::new(["Sure, let's plan."]));
        let events = collect(healthy.start(&user, conv, "help me plan").await.unwrap()).await;
        assert!(matches!(events.last(), Some(StreamEvent::Completion { .. })));

        let turns = healthy.history(&user, conv).await.unwrap();
        let roles: Vec<Role> = turns.iter().map(|t| t.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant]);
    }

    #[tokio::test]
    async fn test_pattern_and_profile_payloads_persisted() {
        let f = Fixture::new();
        let user = UserId::new("u1");
        let conv = Uuid::new_v4();
        let pipeline = f.pipeline(ScriptedBackend::new([
            "Thanks, Sam. [PATTERN: overwork | health]\n[PROFILE]\n{\"name\": \"Sam\",",
            " \"goals\": [\"get promoted\"]}\n[/PROFILE]",
        ]));

        let events = collect(pipeline.start(&user, conv, "my manager keeps piling on work").await.unwrap()).await;
        let flags: Vec<TagKind> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::SignalFlag(tag) => Some(*tag),
                _ => None,
            })
            .collect();
        assert_eq!(flags, vec![TagKind::Pattern, TagKind::Profile]);

        let observations = PatternRepository::new(Arc::clone(&f.db))
            .list_for_user(&user)
            .unwrap();
        assert_eq!(observations[0].theme, "overwork");
        assert_eq!(observations[0].domain, Some(Domain::Health));

        let profile = ProfileRepository::new(Arc::clone(&f.db))
            .get(&user)
            .unwrap()
            .unwrap();
        assert_eq!(profile.display_name.as_deref(), Some("Sam"));
        assert!(profile.discovery_completed_at.is_some());
    }

    #[tokio::test]
    async fn test_truncated_profile_persists_parsed_fields() {
        let f = Fixture::new();
        let user = UserId::new("u1");
        let pipeline = f.pipeline(ScriptedBackend::new([
            "Lovely to meet you.\n[PROFILE]\nname: Ari\ngoals: sleep better, run",
        ]));
        let events = collect(pipeline.start(&user, Uuid::new_v4(), "hi").await.unwrap()).await;

        match events.last() {
            Some(StreamEvent::Completion { flags, .. }) => assert!(!flags.profile),
            other => panic!("expected completion, got {:?}", other),
        }
        let profile = ProfileRepository::new(Arc::clone(&f.db))
            .get(&user)
            .unwrap()
            .unwrap();
        assert_eq!(profile.display_name.as_deref(), Some("Ari"));
        assert_eq!(profile.goals, vec!["sleep better", "run"]);
    }

    #[tokio::test]
    async fn test_low_confidence_synthesis_never_reaches_model() {
        let f = Fixture::new();
        let user = UserId::new("u1");
        SynthesisRepository::new(Arc::clone(&f.db))
            .store_run(
                &user,
                &[SynthesisRecord {
                    user_id: user.clone(),
                    theme: "avoiding conflict".to_string(),
                    domains: vec![Domain::Career, Domain::Family],
                    confidence: Confidence::new(0.6),
                    evidence: vec![],
                    last_surfaced_at: None,
                    surface_count: 0,
                    computed_at: Timestamp::now(),
                }],
                0,
            )
            .unwrap();

        for _ in 0..6 {
            let backend = ScriptedBackend::offline_echo();
            let pipeline = f.pipeline(backend);
            let conv = Uuid::new_v4();
            let events = collect(pipeline.start(&user, conv, "my boss and my mom").await.unwrap()).await;
            assert!(matches!(events.last(), Some(StreamEvent::Completion { .. })));
            let history = SynthesisRepository::new(Arc::clone(&f.db))
                .surfacing_history(&user, &[conv])
                .unwrap();
            assert!(history.is_empty());
        }
    }

    #[tokio::test]
    async fn test_failed_generation_does_not_use_up_surfacing() {
        let f = Fixture::new();
        let user = UserId::new("u1");
        let theme = "saying yes to everything";
        SynthesisRepository::new(Arc::clone(&f.db))
            .store_run(
                &user,
                &[SynthesisRecord {
                    user_id: user.clone(),
                    theme: theme.to_string(),
                    domains: vec![Domain::Career, Domain::Family],
                    confidence: Confidence::new(0.95),
                    evidence: vec![],
                    last_surfaced_at: None,
                    surface_count: 0,
                    computed_at: Timestamp::now(),
                }],
                0,
            )
            .unwrap();
        let conv = Uuid::new_v4();
        let surfaced = || {
            SynthesisRepository::new(Arc::clone(&f.db))
                .surfacing_history(&user, &[conv])
                .unwrap()
                .len()
        };

        let failing = f.pipeline(ScriptedBackend::failing_on_start());
        let events = collect(failing.start(&user, conv, "my boss and my mom").await.unwrap()).await;
        assert_eq!(events, vec![StreamEvent::error(StreamErrorKind::ModelInvocation)]);
        assert_eq!(surfaced(), 0);

        let backend = Arc::new(RecordingBackend {
            requests: std::sync::Mutex::new(Vec::new()),
        });
        let retry = f.pipeline_with(Arc::clone(&backend) as Arc<dyn ModelBackend>);
        let events = collect(retry.start(&user, conv, "my boss and my mom").await.unwrap()).await;
        assert!(matches!(events.last(), Some(StreamEvent::Completion { .. })));

        assert!(backend.requests.lock().unwrap()[0].system.contains(theme));
        assert_eq!(surfaced(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_receiver_cancels_generation() {
        let f = Fixture::new();
        let user = UserId::new("u1");
        let conv = Uuid::new_v4();
        let pipeline = f.pipeline(
            ScriptedBackend::new(["one ", "two ", "three ", "four "])
                .with_delay(Duration::from_millis(100)),
        );

        let mut rx = pipeline.start(&user, conv, "hello").await.unwrap();
        assert_eq!(rx.recv().await, Some(StreamEvent::Token("one ".to_string())));
        drop(rx);
        tokio::time::sleep(Duration::from_secs(1)).await;

        let turns = pipeline.history(&user, conv).await.unwrap();
        assert_eq!(turns.len(), 1, "cancelled stream must not persist an assistant turn");
    }

    #[test]
    fn test_state_transitions() {
        use PipelineState::*;
        assert!(Idle.can_advance_to(Requesting));
        assert!(Requesting.can_advance_to(Failed));
        assert!(Streaming.can_advance_to(Completed));
        assert!(!Idle.can_advance_to(Streaming));
        assert!(!Completed.can_advance_to(Streaming));
        assert!(Completed.is_terminal() && Failed.is_terminal());
    }
}
