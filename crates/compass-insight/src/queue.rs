//! Background refresh queue.
//!
//! Request handlers enqueue refresh jobs without waiting; a single worker
//! task drains the queue and runs the analyses. A job that is already
//! pending is not queued twice. Failures are written to the dead-letter
//! log and otherwise ignored.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use compass_core::types::{Timestamp, UserId};
use compass_storage::{
    ConversationRepository, Database, PatternRepository, StyleRepository, SynthesisRepository,
    TurnRepository,
};

use crate::error::InsightError;
use crate::style::StyleAnalyzer;
use crate::summarizer::SummarizationService;
use crate::synthesis::SynthesisAnalyzer;

/// Capacity of the job channel. Jobs beyond this are dropped.
const QUEUE_CAPACITY: usize = 256;

/// Entries kept in the dead-letter log.
pub const DEAD_LETTER_CAPACITY: usize = 100;

/// User messages considered by style analysis.
const STYLE_SAMPLE: usize = 50;

/// A unit of background analysis.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RefreshJob {
    /// Rebuild cross-domain synthesis records.
    Synthesis { user: UserId },
    /// Re-analyze style preferences.
    Style { user: UserId },
    /// Summarize a conversation for future context.
    Summary { user: UserId, conversation_id: Uuid },
}

impl RefreshJob {
    pub fn kind(&self) -> &'static str {
        match self {
            RefreshJob::Synthesis { .. } => "synthesis",
            RefreshJob::Style { .. } => "style",
            RefreshJob::Summary { .. } => "summary",
        }
    }

    pub fn user(&self) -> &UserId {
        match self {
            RefreshJob::Synthesis { user }
            | RefreshJob::Style { user }
            | RefreshJob::Summary { user, .. } => user,
        }
    }
}

impl fmt::Display for RefreshJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} for {}", self.kind(), self.user())
    }
}

type PendingSet = Arc<Mutex<HashSet<RefreshJob>>>;

fn lock_pending(pending: &PendingSet) -> MutexGuard<'_, HashSet<RefreshJob>> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Producer side of the refresh queue. Cheap to clone.
#[derive(Clone)]
pub struct RefreshQueue {
    tx: mpsc::Sender<RefreshJob>,
    pending: PendingSet,
}

impl RefreshQueue {
    /// Create a queue and the receiver half handed to [`RefreshWorker::new`].
    pub fn channel() -> (Self, RefreshReceiver) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let pending: PendingSet = Arc::new(Mutex::new(HashSet::new()));
        (
            Self {
                tx,
                pending: Arc::clone(&pending),
            },
            RefreshReceiver { rx, pending },
        )
    }

    /// Enqueue `job` without waiting.
    ///
    /// Returns `false` when an identical job is already pending, or when
    /// the queue is full or closed.
    pub fn enqueue(&self, job: RefreshJob) -> bool {
        {
            let mut pending = lock_pending(&self.pending);
            if !pending.insert(job.clone()) {
                debug!(job = %job, "Refresh already pending");
                return false;
            }
        }

        match self.tx.try_send(job.clone()) {
            Ok(()) => {
                debug!(job = %job, "Refresh enqueued");
                true
            }
            Err(e) => {
                lock_pending(&self.pending).remove(&job);
                warn!(job = %job, error = %e, "Failed to enqueue refresh");
                false
            }
        }
    }

    /// Number of jobs waiting to run.
    pub fn pending(&self) -> usize {
        lock_pending(&self.pending).len()
    }
}

/// Consumer side of the refresh queue.
pub struct RefreshReceiver {
    rx: mpsc::Receiver<RefreshJob>,
    pending: PendingSet,
}

/// A job that failed, kept for inspection.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub job: RefreshJob,
    pub error: String,
    pub failed_at: Timestamp,
}

/// Bounded in-memory log of failed jobs.
#[derive(Debug, Clone, Default)]
pub struct DeadLetterLog {
    entries: Arc<Mutex<VecDeque<DeadLetter>>>,
}

impl DeadLetterLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, job: RefreshJob, error: &InsightError) {
        warn!(
            target: "compass::dead_letter",
            job = %job,
            error = %error,
            "Background refresh failed"
        );
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if entries.len() == DEAD_LETTER_CAPACITY {
            entries.pop_front();
        }
        entries.push_back(DeadLetter {
            job,
            error: error.to_string(),
            failed_at: Timestamp::now(),
        });
    }

    /// Oldest first.
    pub fn entries(&self) -> Vec<DeadLetter> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .map(|entries| entries.len())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Runs one refresh job.
///
/// Handlers do blocking storage work; the worker calls them on the
/// blocking thread pool.
pub trait RefreshHandler: Send + Sync + 'static {
    fn handle(&self, job: &RefreshJob) -> Result<(), InsightError>;
}

/// Stops a running [`RefreshWorker`].
#[derive(Clone)]
pub struct WorkerShutdown(Arc<Notify>);

impl WorkerShutdown {
    /// Signal the worker to stop after the job in progress.
    pub fn shutdown(&self) {
        self.0.notify_one();
    }
}

/// Background task draining the refresh queue.
pub struct RefreshWorker<H> {
    receiver: RefreshReceiver,
    handler: Arc<H>,
    dead_letters: DeadLetterLog,
    shutdown: Arc<Notify>,
}

impl<H: RefreshHandler> RefreshWorker<H> {
    pub fn new(receiver: RefreshReceiver, handler: H, dead_letters: DeadLetterLog) -> Self {
        Self {
            receiver,
            handler: Arc::new(handler),
            dead_letters,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn shutdown_handle(&self) -> WorkerShutdown {
        WorkerShutdown(Arc::clone(&self.shutdown))
    }

    /// Process jobs until shutdown is signalled or every producer is gone.
    pub async fn run(mut self) {
        info!("Refresh worker started");
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.notified() => break,
                job = self.receiver.rx.recv() => match job {
                    Some(job) => self.process(job).await,
                    None => break,
                },
            }
        }
        info!("Refresh worker stopped");
    }

    async fn process(&self, job: RefreshJob) {
        lock_pending(&self.receiver.pending).remove(&job);
        let handler = Arc::clone(&self.handler);
        let running = job.clone();
        let result = tokio::task::spawn_blocking(move || handler.handle(&running))
            .await
            .unwrap_or_else(|e| Err(InsightError::Analysis(format!("refresh task failed: {}", e))));
        match result {
            Ok(()) => debug!(job = %job, "Refresh completed"),
            Err(e) => self.dead_letters.record(job, &e),
        }
    }
}

/// Runs synthesis, style, and summary jobs against the database.
pub struct AnalysisRunner {
    conversations: ConversationRepository,
    turns: TurnRepository,
    patterns: PatternRepository,
    synthesis: SynthesisRepository,
    style: StyleRepository,
    synthesis_analyzer: SynthesisAnalyzer,
    style_analyzer: StyleAnalyzer,
    summarizer: SummarizationService,
}

impl AnalysisRunner {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            conversations: ConversationRepository::new(Arc::clone(&db)),
            turns: TurnRepository::new(Arc::clone(&db)),
            patterns: PatternRepository::new(Arc::clone(&db)),
            synthesis: SynthesisRepository::new(Arc::clone(&db)),
            style: StyleRepository::new(db),
            synthesis_analyzer: SynthesisAnalyzer::new(),
            style_analyzer: StyleAnalyzer::new(),
            summarizer: SummarizationService::default(),
        }
    }

    fn refresh_synthesis(&self, user: &UserId) -> Result<(), InsightError> {
        let observations = self.patterns.list_for_user(user)?;
        let conversation_count = self.conversations.count_for_user(user)?;
        let records = self.synthesis_analyzer.analyze(user, &observations);
        self.synthesis.store_run(user, &records, conversation_count)?;
        info!(
            user_id = %user,
            records = records.len(),
            eligible = records.iter().filter(|r| r.is_eligible()).count(),
            "Synthesis refreshed"
        );
        Ok(())
    }

    fn refresh_style(&self, user: &UserId) -> Result<(), InsightError> {
        let messages = self.turns.user_texts(user, STYLE_SAMPLE)?;
        let session_count = self.conversations.count_for_user(user)?;
        let prefs = self.style_analyzer.analyze(&messages, session_count);
        self.style.upsert(user, &prefs)?;
        info!(
            user_id = %user,
            verbosity = ?prefs.verbosity,
            tone = ?prefs.tone,
            "Style preferences refreshed"
        );
        Ok(())
    }

    fn refresh_summary(&self, conversation_id: Uuid) -> Result<(), InsightError> {
        let turns = self.turns.list(conversation_id)?;
        match self.summarizer.summarize(&turns) {
            Ok(summary) => {
                self.conversations
                    .set_summary(conversation_id, &summary.render())?;
                debug!(conversation_id = %conversation_id, "Conversation summarized");
                Ok(())
            }
            Err(InsightError::InsufficientData(reason)) => {
                debug!(conversation_id = %conversation_id, reason = %reason, "Summary skipped");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

impl RefreshHandler for AnalysisRunner {
    fn handle(&self, job: &RefreshJob) -> Result<(), InsightError> {
        match job {
            RefreshJob::Synthesis { user } => self.refresh_synthesis(user),
            RefreshJob::Style { user } => self.refresh_style(user),
            RefreshJob::Summary {
                conversation_id, ..
            } => self.refresh_summary(*conversation_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use compass_core::types::{ConversationTurn, Domain, Role};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingHandler {
        handled: Arc<AtomicUsize>,
        fail: bool,
    }

    impl RefreshHandler for CountingHandler {
        fn handle(&self, _job: &RefreshJob) -> Result<(), InsightError> {
            self.handled.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(InsightError::Analysis("model unavailable".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn synthesis_job(user: &str) -> RefreshJob {
        RefreshJob::Synthesis {
            user: UserId::new(user),
        }
    }

    #[tokio::test]
    async fn test_pending_jobs_are_deduplicated() {
        let (queue, _receiver) = RefreshQueue::channel();
        assert!(queue.enqueue(synthesis_job("u1")));
        assert!(!queue.enqueue(synthesis_job("u1")));
        assert!(queue.enqueue(synthesis_job("u2")));
        assert!(queue.enqueue(RefreshJob::Style {
            user: UserId::new("u1")
        }));
        assert_eq!(queue.pending(), 3);
    }

    #[tokio::test]
    async fn test_enqueue_after_worker_gone_fails() {
        let (queue, receiver) = RefreshQueue::channel();
        drop(receiver);
        assert!(!queue.enqueue(synthesis_job("u1")));
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn test_worker_drains_queue_and_stops_when_producers_drop() {
        let (queue, receiver) = RefreshQueue::channel();
        let handled = Arc::new(AtomicUsize::new(0));
        let worker = RefreshWorker::new(
            receiver,
            CountingHandler {
                handled: Arc::clone(&handled),
                fail: false,
            },
            DeadLetterLog::new(),
        );

        queue.enqueue(synthesis_job("u1"));
        queue.enqueue(synthesis_job("u2"));
        let probe = queue.clone();
        drop(queue);
        drop(probe);

        tokio::time::timeout(Duration::from_secs(2), worker.run())
            .await
            .expect("worker should stop once the queue is closed");
        assert_eq!(handled.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failures_go_to_dead_letter_log() {
        let (queue, receiver) = RefreshQueue::channel();
        let dead_letters = DeadLetterLog::new();
        let worker = RefreshWorker::new(
            receiver,
            CountingHandler {
                handled: Arc::new(AtomicUsize::new(0)),
                fail: true,
            },
            dead_letters.clone(),
        );

        queue.enqueue(synthesis_job("u1"));
        drop(queue);
        worker.run().await;

        let entries = dead_letters.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].job, synthesis_job("u1"));
        assert!(entries[0].error.contains("model unavailable"));
    }

    /// Blocks until the async side sends a go-ahead.
    struct WaitingHandler {
        go: Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl RefreshHandler for WaitingHandler {
        fn handle(&self, _job: &RefreshJob) -> Result<(), InsightError> {
            self.go
                .lock()
                .unwrap()
                .recv_timeout(Duration::from_secs(2))
                .map_err(|_| InsightError::Analysis("runtime was blocked".to_string()))
        }
    }

    #[tokio::test]
    async fn test_handler_does_not_block_runtime() {
        // Single-threaded runtime: the sender task only runs if the handler
        // is off the runtime thread.
        let (go_tx, go_rx) = std::sync::mpsc::channel();
        let (queue, receiver) = RefreshQueue::channel();
        let dead_letters = DeadLetterLog::new();
        let worker = RefreshWorker::new(
            receiver,
            WaitingHandler {
                go: Mutex::new(go_rx),
            },
            dead_letters.clone(),
        );

        queue.enqueue(synthesis_job("u1"));
        drop(queue);
        let sender = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = go_tx.send(());
        });
        worker.run().await;
        sender.await.unwrap();

        assert!(dead_letters.is_empty(), "{:?}", dead_letters.entries());
    }

    struct PanickingHandler;

    impl RefreshHandler for PanickingHandler {
        fn handle(&self, _job: &RefreshJob) -> Result<(), InsightError> {
            panic!("analysis bug");
        }
    }

    #[tokio::test]
    async fn test_panicking_handler_goes_to_dead_letter_log() {
        let (queue, receiver) = RefreshQueue::channel();
        let dead_letters = DeadLetterLog::new();
        let worker = RefreshWorker::new(receiver, PanickingHandler, dead_letters.clone());

        queue.enqueue(synthesis_job("u1"));
        queue.enqueue(synthesis_job("u2"));
        drop(queue);
        worker.run().await;

        let entries = dead_letters.entries();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].error.contains("refresh task failed"));
    }

    #[tokio::test]
    async fn test_shutdown_before_run_returns_promptly() {
        let (_queue, receiver) = RefreshQueue::channel();
        let worker = RefreshWorker::new(
            receiver,
            CountingHandler {
                handled: Arc::new(AtomicUsize::new(0)),
                fail: false,
            },
            DeadLetterLog::new(),
        );
        worker.shutdown_handle().shutdown();

        tokio::time::timeout(Duration::from_secs(2), worker.run())
            .await
            .expect("worker should shut down within timeout");
    }

    #[test]
    fn test_dead_letter_log_is_bounded() {
        let log = DeadLetterLog::new();
        for i in 0..(DEAD_LETTER_CAPACITY + 5) {
            log.record(
                synthesis_job(&format!("u{}", i)),
                &InsightError::Analysis("boom".to_string()),
            );
        }
        let entries = log.entries();
        assert_eq!(entries.len(), DEAD_LETTER_CAPACITY);
        assert_eq!(entries[0].job, synthesis_job("u5"));
    }

    #[test]
    fn test_analysis_runner_end_to_end() {
        let db = Arc::new(Database::in_memory().unwrap());
        let user = UserId::new("u1");
        let conversations = ConversationRepository::new(Arc::clone(&db));
        let turns = TurnRepository::new(Arc::clone(&db));
        let patterns = PatternRepository::new(Arc::clone(&db));

        let mut last = Uuid::nil();
        for domain in [Domain::Career, Domain::Family, Domain::Career] {
            let conv = Uuid::new_v4();
            conversations.touch(&user, conv).unwrap();
            patterns
                .record(&user, conv, "avoiding conflict", Some(domain))
                .unwrap();
            turns
                .append(&user, &ConversationTurn::new(conv, Role::User, "Just tell me how to handle my manager. He never listens to me."))
                .unwrap();
            turns
                .append(&user, &ConversationTurn::new(conv, Role::Assistant, "Let's think it through."))
                .unwrap();
            last = conv;
        }

        let runner = AnalysisRunner::new(Arc::clone(&db));
        runner.handle(&synthesis_job("u1")).unwrap();
        runner
            .handle(&RefreshJob::Style { user: user.clone() })
            .unwrap();
        runner
            .handle(&RefreshJob::Summary {
                user: user.clone(),
                conversation_id: last,
            })
            .unwrap();

        let synthesis = SynthesisRepository::new(Arc::clone(&db));
        let records = synthesis.list(&user).unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].is_eligible());
        assert_eq!(synthesis.last_run(&user).unwrap().unwrap().conversation_count, 3);

        let style = StyleRepository::new(Arc::clone(&db)).get(&user).unwrap().unwrap();
        assert_eq!(style.analyzed_at_sessions, 3);

        let summary = conversations.find_by_id(last).unwrap().unwrap().summary;
        assert!(summary.is_some());
    }
}
