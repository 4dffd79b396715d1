//! Long-polling ingestion loop.
//!
//! `Starting -> Polling -> Processing -> (Polling | Backoff) -> ... -> Stopped`
//!
//! - Updates reach the processor one at a time, in stream order.
//! - The processor stages its domain writes in a [`WriteSet`]. After each
//!   hand-off one transaction applies them, touches the actor's session and
//!   advances the cursor to that update's id. A failed hand-off commits no
//!   domain writes, only the session and cursor.
//! - Poll transport failures back off (exponential, capped, honouring remote
//!   `retry_after`) and never escape the loop.
//! - Cancellation stops new polls; an in-flight batch is drained first, then
//!   the store is closed.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::{
    cursor::CursorStore,
    dispatch::Dispatcher,
    domain::{services, Cursor},
    errors::Error,
    messaging::types::Update,
    report::{FailureReport, Reporter},
    store::{StateStore, StoreTx, WriteSet},
    Result,
};

/// Long-poll endpoint of the platform's update stream.
#[async_trait]
pub trait UpdateSource: Send + Sync {
    /// Fetch updates with id `>= offset`, waiting up to `timeout` server-side.
    async fn poll(&self, offset: i64, timeout: Duration, limit: u8) -> Result<Vec<Update>>;
}

/// Business logic invoked once per update.
///
/// Side effects on the state store are returned as staged writes rather than
/// committed directly; the loop commits them with the session and cursor.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, update: &Update) -> Result<WriteSet>;
}

/// Persist one handled update inside `tx`: the actor's session, the staged
/// domain writes and the cursor advance.
pub fn commit_update(
    tx: &StoreTx<'_>,
    cursors: &CursorStore,
    update: &Update,
    writes: WriteSet,
    now: DateTime<Utc>,
) -> Result<()> {
    if let Some(actor) = update.actor() {
        tx.touch_session(actor, now)?;
    }
    writes.apply(tx)?;
    cursors.advance_in(tx, Cursor::from(update.id))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IngestConfig {
    /// Server-side long-poll wait.
    pub poll_timeout: Duration,
    pub poll_limit: u8,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Attempts per update for transient processor failures (min 1).
    pub processor_max_attempts: u32,
    pub processor_retry_delay: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(30),
            poll_limit: 100,
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(60),
            processor_max_attempts: 1,
            processor_retry_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    Starting,
    Polling,
    Processing,
    Backoff,
    Stopped,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub polls: u64,
    pub poll_failures: u64,
    pub updates_handled: u64,
    pub processor_failures: u64,
    pub store_failures: u64,
    pub cursor: Cursor,
}

enum Step {
    Poll,
    Process(Vec<Update>),
    Backoff(Duration),
    Stop,
}

#[derive(Debug)]
struct Backoff {
    base: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            next: base,
        }
    }

    fn next_delay(&mut self, hint: Option<Duration>) -> Duration {
        let delay = self.next;
        self.next = self.next.saturating_mul(2).min(self.max);
        match hint {
            Some(h) => delay.max(h),
            None => delay,
        }
    }

    fn reset(&mut self) {
        self.next = self.base;
    }
}

pub struct IngestionLoop {
    source: Arc<dyn UpdateSource>,
    processor: Arc<dyn Processor>,
    dispatcher: Arc<Dispatcher>,
    store: StateStore,
    cursors: CursorStore,
    reporter: Reporter,
    cfg: IngestConfig,
    service: String,
    cursor: Cursor,
    summary: IngestSummary,
    state: watch::Sender<LoopState>,
}

impl IngestionLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Arc<dyn UpdateSource>,
        processor: Arc<dyn Processor>,
        dispatcher: Arc<Dispatcher>,
        store: StateStore,
        cursors: CursorStore,
        reporter: Reporter,
        cfg: IngestConfig,
    ) -> Self {
        let (state, _) = watch::channel(LoopState::Starting);
        Self {
            source,
            processor,
            dispatcher,
            store,
            cursors,
            reporter,
            cfg,
            service: services::PLATFORM_INGEST.to_string(),
            cursor: Cursor::ZERO,
            summary: IngestSummary::default(),
            state,
        }
    }

    /// Observe state transitions (for status output and tests).
    pub fn subscribe(&self) -> watch::Receiver<LoopState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: LoopState) {
        self.state.send_replace(next);
    }

    /// Run until `cancel` fires. Returns what the loop did.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<IngestSummary> {
        self.set_state(LoopState::Starting);
        self.cursor = match self.cursors.load().await {
            Ok(c) => c,
            Err(e) => {
                self.reporter.report(FailureReport::store(None, &e));
                self.finish();
                return Err(e);
            }
        };
        self.summary.cursor = self.cursor;
        tracing::info!(
            stream = self.cursors.stream(),
            cursor = self.cursor.0,
            "ingestion starting"
        );

        let mut backoff = Backoff::new(self.cfg.backoff_base, self.cfg.backoff_max);
        let mut step = Step::Poll;
        loop {
            step = match step {
                Step::Poll => {
                    self.set_state(LoopState::Polling);
                    self.poll(&cancel, &mut backoff).await
                }
                Step::Process(batch) => {
                    self.set_state(LoopState::Processing);
                    self.process_batch(batch, &mut backoff).await
                }
                Step::Backoff(delay) => {
                    self.set_state(LoopState::Backoff);
                    tracing::debug!(delay_ms = delay.as_millis() as u64, "backing off");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => Step::Stop,
                        _ = sleep(delay) => Step::Poll,
                    }
                }
                Step::Stop => break,
            };
        }

        self.finish();
        Ok(self.summary)
    }

    async fn poll(&mut self, cancel: &CancellationToken, backoff: &mut Backoff) -> Step {
        if cancel.is_cancelled() {
            return Step::Stop;
        }

        let offset = self.cursor.next_offset();
        let (timeout, limit) = (self.cfg.poll_timeout, self.cfg.poll_limit);
        let source = self.source.clone();
        let dispatcher = self.dispatcher.clone();
        let service = self.service.clone();

        let polled = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Step::Stop,
            res = dispatcher.call(&service, || source.poll(offset, timeout, limit)) => res,
        };
        self.summary.polls += 1;

        match polled {
            Ok(updates) => {
                backoff.reset();
                if updates.is_empty() {
                    Step::Poll
                } else {
                    tracing::debug!(offset, count = updates.len(), "received updates");
                    Step::Process(updates)
                }
            }
            Err(err) => {
                self.summary.poll_failures += 1;
                self.reporter.report(FailureReport::poll(&err, offset));
                Step::Backoff(backoff.next_delay(err.retry_after))
            }
        }
    }

    async fn process_batch(&mut self, batch: Vec<Update>, backoff: &mut Backoff) -> Step {
        for update in batch {
            if self.cursor.covers(update.id) {
                tracing::debug!(update_id = update.id.0, cursor = self.cursor.0, "skipping stale update");
                continue;
            }

            let writes = self.hand_off(&update).await;

            if let Err(e) = self.commit(&update, writes).await {
                // The rest of the batch is re-requested from the persisted cursor.
                self.summary.store_failures += 1;
                self.reporter.report(FailureReport::store(Some(update.id), &e));
                return Step::Backoff(backoff.next_delay(None));
            }
        }
        Step::Poll
    }

    /// Hand one update to the processor; failures are reported, never raised.
    /// Writes staged by failed attempts are dropped.
    async fn hand_off(&mut self, update: &Update) -> WriteSet {
        let max_attempts = self.cfg.processor_max_attempts.max(1);
        let mut attempt = 1u32;
        let writes = loop {
            match self.invoke(update).await {
                Ok(writes) => break writes,
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    tracing::debug!(update_id = update.id.0, attempt, error = %e, "retrying update");
                    sleep(self.cfg.processor_retry_delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    self.summary.processor_failures += 1;
                    self.reporter
                        .report(FailureReport::processor(update.id, &e, attempt));
                    break WriteSet::new();
                }
            }
        };
        self.summary.updates_handled += 1;
        writes
    }

    /// Run the processor on its own task so a panic is contained like an error.
    async fn invoke(&self, update: &Update) -> Result<WriteSet> {
        let processor = self.processor.clone();
        let update = update.clone();
        tokio::spawn(async move { processor.process(&update).await })
            .await
            .map_err(|e| Error::External(format!("processor task failed: {e}")))?
    }

    async fn commit(&mut self, update: &Update, writes: WriteSet) -> Result<()> {
        let next = Cursor::from(update.id);
        let cursors = self.cursors.clone();
        let committed = update.clone();
        let now = Utc::now();

        self.store
            .transact(move |tx| commit_update(tx, &cursors, &committed, writes, now))
            .await?;

        self.cursor = next;
        self.summary.cursor = next;
        Ok(())
    }

    fn finish(&mut self) {
        self.set_state(LoopState::Stopped);
        if let Err(e) = self.store.close() {
            self.reporter.report(FailureReport::store(None, &e));
        }
        tracing::info!(
            cursor = self.cursor.0,
            polls = self.summary.polls,
            handed_off = self.summary.updates_handled,
            processor_failures = self.summary.processor_failures,
            "ingestion stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        domain::{ActorId, ChatId, UpdateId, UserId},
        errors::TransportFailure,
        messaging::types::{IncomingUpdate, TextMessage},
        ratelimit::{RateLimit, RateLimiter},
        report::{FailureScope, MemorySink},
        store::NewLogEntry,
    };
    use std::collections::{HashMap, VecDeque};
    use std::path::PathBuf;
    use std::sync::Mutex;
    use tokio::time::Instant;

    type Script = VecDeque<Result<Vec<Update>>>;

    /// Replays a fixed script of poll results, then cancels the loop.
    struct ScriptedSource {
        script: Mutex<Script>,
        polls: Mutex<Vec<(i64, Instant)>>,
        cancel: CancellationToken,
    }

    impl ScriptedSource {
        fn new(script: Script, cancel: CancellationToken) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script),
                polls: Mutex::new(Vec::new()),
                cancel,
            })
        }

        fn offsets(&self) -> Vec<i64> {
            self.polls.lock().unwrap().iter().map(|(o, _)| *o).collect()
        }

        fn times(&self) -> Vec<Instant> {
            self.polls.lock().unwrap().iter().map(|(_, t)| *t).collect()
        }
    }

    #[async_trait]
    impl UpdateSource for ScriptedSource {
        async fn poll(&self, offset: i64, _timeout: Duration, _limit: u8) -> Result<Vec<Update>> {
            self.polls.lock().unwrap().push((offset, Instant::now()));
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(res) => res,
                None => {
                    self.cancel.cancel();
                    Ok(Vec::new())
                }
            }
        }
    }

    #[derive(Clone, Copy)]
    enum Fail {
        Permanent,
        TransientOnce,
        Panic,
        /// The staged write fails on the first delivery, so the commit does.
        CommitOnce,
    }

    #[derive(Default)]
    struct RecordingProcessor {
        seen: Mutex<Vec<i64>>,
        fail: HashMap<i64, Fail>,
        cancel_on: Option<(i64, CancellationToken)>,
    }

    impl RecordingProcessor {
        fn seen(&self) -> Vec<i64> {
            self.seen.lock().unwrap().clone()
        }
    }

    /// Stages one `handled` log entry per update, tagged with its id.
    fn stage_handled(update: &Update, broken: bool) -> WriteSet {
        let mut writes = WriteSet::new();
        let entry = NewLogEntry {
            actor: update.actor(),
            action: "handled".to_string(),
            detail: serde_json::json!({ "update_id": update.id.0 }),
        };
        writes.push(move |tx| {
            tx.append_log(&entry, Utc::now())?;
            if broken {
                return Err(Error::Store("disk I/O error".to_string()));
            }
            Ok(())
        });
        writes
    }

    #[async_trait]
    impl Processor for RecordingProcessor {
        async fn process(&self, update: &Update) -> Result<WriteSet> {
            let id = update.id.0;
            let attempts = {
                let mut seen = self.seen.lock().unwrap();
                seen.push(id);
                seen.iter().filter(|s| **s == id).count()
            };
            if let Some((at, token)) = &self.cancel_on {
                if *at == id {
                    token.cancel();
                }
            }
            match self.fail.get(&id) {
                Some(Fail::Permanent) => Err(Error::External(format!("cannot handle {id}"))),
                Some(Fail::TransientOnce) if attempts == 1 => {
                    Err(TransportFailure::Timeout.into())
                }
                Some(Fail::Panic) => panic!("processor blew up on {id}"),
                Some(Fail::CommitOnce) => Ok(stage_handled(update, attempts == 1)),
                _ => Ok(stage_handled(update, false)),
            }
        }
    }

    fn text(id: i64, user: i64) -> Update {
        Update {
            id: UpdateId(id),
            kind: IncomingUpdate::Text(TextMessage {
                chat_id: ChatId(user),
                user_id: Some(UserId(user)),
                username: None,
                text: format!("message {id}"),
            }),
        }
    }

    fn batch(ids: &[i64]) -> Result<Vec<Update>> {
        Ok(ids.iter().map(|id| text(*id, 1)).collect())
    }

    fn conn_err() -> Result<Vec<Update>> {
        Err(TransportFailure::Connection("reset by peer".to_string()).into())
    }

    struct Rig {
        _dir: tempfile::TempDir,
        path: PathBuf,
        sink: Arc<MemorySink>,
    }

    impl Rig {
        fn new() -> Self {
            let dir = tempfile::TempDir::new().unwrap();
            let path = dir.path().join("state.db");
            Self {
                _dir: dir,
                path,
                sink: Arc::new(MemorySink::default()),
            }
        }

        fn build(
            &self,
            source: Arc<dyn UpdateSource>,
            processor: Arc<dyn Processor>,
            cfg: IngestConfig,
        ) -> (IngestionLoop, StateStore) {
            let store = StateStore::open(&self.path).unwrap();
            let dispatcher = Arc::new(Dispatcher::new(RateLimiter::new().with_service(
                services::PLATFORM_INGEST,
                RateLimit::new(1000, Duration::from_secs(1)),
            )));
            let cursors = CursorStore::new(store.clone(), crate::cursor::UPDATES_STREAM);
            let lp = IngestionLoop::new(
                source,
                processor,
                dispatcher,
                store.clone(),
                cursors,
                Reporter::new().with_sink(self.sink.clone()),
                cfg,
            );
            (lp, store)
        }

        fn reopen(&self) -> StateStore {
            StateStore::open(&self.path).unwrap()
        }

        /// Update ids whose staged writes were committed for `actor`, in order.
        fn handled_ids(&self, actor: ActorId) -> Vec<i64> {
            self.reopen()
                .with_transaction(|tx| tx.log_entries(actor))
                .unwrap()
                .iter()
                .filter_map(|e| e.detail["update_id"].as_i64())
                .collect()
        }

        fn persisted_cursor(&self) -> Option<Cursor> {
            self.reopen()
                .with_transaction(|tx| tx.cursor(crate::cursor::UPDATES_STREAM))
                .unwrap()
        }
    }

    #[tokio::test]
    async fn cursor_follows_last_update_and_next_poll_asks_past_it() {
        let rig = Rig::new();
        let cancel = CancellationToken::new();
        let source = ScriptedSource::new(VecDeque::from(vec![batch(&[41, 42, 43])]), cancel.clone());
        let processor = Arc::new(RecordingProcessor::default());
        let (lp, _) = rig.build(source.clone(), processor.clone(), IngestConfig::default());

        let summary = lp.run(cancel).await.unwrap();

        assert_eq!(processor.seen(), vec![41, 42, 43]);
        assert_eq!(source.offsets(), vec![1, 44]);
        assert_eq!(summary.cursor, Cursor(43));
        assert_eq!(summary.updates_handled, 3);
        assert_eq!(rig.persisted_cursor(), Some(Cursor(43)));
    }

    #[tokio::test]
    async fn failing_update_is_reported_once_and_skipped() {
        let rig = Rig::new();
        let cancel = CancellationToken::new();
        let source = ScriptedSource::new(VecDeque::from(vec![batch(&[41, 42, 43])]), cancel.clone());
        let processor = Arc::new(RecordingProcessor {
            fail: HashMap::from([(42, Fail::Permanent)]),
            ..Default::default()
        });
        let (lp, _) = rig.build(source.clone(), processor.clone(), IngestConfig::default());

        let summary = lp.run(cancel).await.unwrap();

        assert_eq!(processor.seen(), vec![41, 42, 43]);
        assert_eq!(source.offsets(), vec![1, 44]);
        assert_eq!(summary.processor_failures, 1);
        assert_eq!(rig.persisted_cursor(), Some(Cursor(43)));
        assert_eq!(rig.handled_ids(ActorId(1)), vec![41, 43]);

        let reports = rig.sink.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].scope, FailureScope::Processor);
        assert_eq!(reports[0].update_id, Some(42));
    }

    #[tokio::test]
    async fn processor_panic_is_contained() {
        let rig = Rig::new();
        let cancel = CancellationToken::new();
        let source = ScriptedSource::new(VecDeque::from(vec![batch(&[1, 2])]), cancel.clone());
        let processor = Arc::new(RecordingProcessor {
            fail: HashMap::from([(1, Fail::Panic)]),
            ..Default::default()
        });
        let (lp, _) = rig.build(source.clone(), processor.clone(), IngestConfig::default());

        let summary = lp.run(cancel).await.unwrap();
        assert_eq!(processor.seen(), vec![1, 2]);
        assert_eq!(summary.cursor, Cursor(2));
        assert_eq!(rig.sink.reports().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_within_budget() {
        let rig = Rig::new();
        let cancel = CancellationToken::new();
        let source = ScriptedSource::new(VecDeque::from(vec![batch(&[7, 8])]), cancel.clone());
        let processor = Arc::new(RecordingProcessor {
            fail: HashMap::from([(7, Fail::TransientOnce), (8, Fail::Permanent)]),
            ..Default::default()
        });
        let cfg = IngestConfig {
            processor_max_attempts: 3,
            ..IngestConfig::default()
        };
        let (lp, _) = rig.build(source.clone(), processor.clone(), cfg);

        let summary = lp.run(cancel).await.unwrap();

        // 7 succeeds on its second attempt; 8 fails permanently and is not retried.
        assert_eq!(processor.seen(), vec![7, 7, 8]);
        assert_eq!(summary.processor_failures, 1);
        let reports = rig.sink.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].update_id, Some(8));
        assert_eq!(reports[0].attempts, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn poll_failures_back_off_and_reset_after_success() {
        let rig = Rig::new();
        let cancel = CancellationToken::new();
        let rate_limited: Result<Vec<Update>> = Err(TransportFailure::RateLimited {
            retry_after: Some(Duration::from_secs(30)),
        }
        .into());
        let source = ScriptedSource::new(
            VecDeque::from(vec![
                conn_err(),
                conn_err(),
                rate_limited,
                batch(&[5]),
                conn_err(),
            ]),
            cancel.clone(),
        );
        let processor = Arc::new(RecordingProcessor::default());
        let (lp, _) = rig.build(source.clone(), processor.clone(), IngestConfig::default());

        let summary = lp.run(cancel).await.unwrap();
        assert_eq!(summary.poll_failures, 4);
        assert_eq!(summary.polls, 6);
        assert_eq!(processor.seen(), vec![5]);

        let times = source.times();
        let gaps: Vec<Duration> = times.windows(2).map(|w| w[1] - w[0]).collect();
        let secs = Duration::from_secs;
        assert_eq!(gaps.len(), 5);
        assert!(gaps[0] >= secs(5) && gaps[0] < secs(6), "{gaps:?}");
        assert!(gaps[1] >= secs(10) && gaps[1] < secs(11), "{gaps:?}");
        // Remote hint beats the 20s exponential step.
        assert!(gaps[2] >= secs(30) && gaps[2] < secs(31), "{gaps:?}");
        // Success resets the delay: next poll is immediate, next failure waits base.
        assert!(gaps[3] < secs(1), "{gaps:?}");
        assert!(gaps[4] >= secs(5) && gaps[4] < secs(6), "{gaps:?}");
    }

    #[tokio::test]
    async fn cancellation_drains_batch_and_closes_store() {
        let rig = Rig::new();
        let cancel = CancellationToken::new();
        let source = ScriptedSource::new(
            VecDeque::from(vec![batch(&[1, 2, 3]), batch(&[4])]),
            cancel.clone(),
        );
        let processor = Arc::new(RecordingProcessor {
            cancel_on: Some((2, cancel.clone())),
            ..Default::default()
        });
        let (lp, store) = rig.build(source.clone(), processor.clone(), IngestConfig::default());
        let state = lp.subscribe();

        let summary = lp.run(cancel).await.unwrap();

        assert_eq!(processor.seen(), vec![1, 2, 3]);
        assert_eq!(source.offsets(), vec![1]);
        assert_eq!(summary.cursor, Cursor(3));
        assert_eq!(*state.borrow(), LoopState::Stopped);
        assert!(store.is_closed());
        assert_eq!(rig.persisted_cursor(), Some(Cursor(3)));
    }

    #[tokio::test]
    async fn restart_resumes_from_persisted_cursor_and_skips_stale() {
        let rig = Rig::new();

        let cancel = CancellationToken::new();
        let source = ScriptedSource::new(VecDeque::from(vec![batch(&[10, 11])]), cancel.clone());
        let first = Arc::new(RecordingProcessor::default());
        let (lp, _) = rig.build(source, first.clone(), IngestConfig::default());
        lp.run(cancel).await.unwrap();

        // Platform re-delivers 11 alongside 12 after the restart.
        let cancel = CancellationToken::new();
        let source = ScriptedSource::new(VecDeque::from(vec![batch(&[11, 12])]), cancel.clone());
        let second = Arc::new(RecordingProcessor::default());
        let (lp, _) = rig.build(source.clone(), second.clone(), IngestConfig::default());
        let summary = lp.run(cancel).await.unwrap();

        assert_eq!(source.offsets(), vec![12, 13]);
        assert_eq!(second.seen(), vec![12]);
        assert_eq!(summary.cursor, Cursor(12));
    }

    #[tokio::test]
    async fn sessions_are_touched_with_each_commit() {
        let rig = Rig::new();
        let cancel = CancellationToken::new();
        let source = ScriptedSource::new(
            VecDeque::from(vec![Ok(vec![text(1, 100), text(2, 100), text(3, 200)])]),
            cancel.clone(),
        );
        let processor = Arc::new(RecordingProcessor::default());
        let (lp, _) = rig.build(source, processor, IngestConfig::default());
        lp.run(cancel).await.unwrap();

        let store = rig.reopen();
        let (a, b, n) = store
            .with_transaction(|tx| {
                Ok((
                    tx.session(ActorId(100))?,
                    tx.session(ActorId(200))?,
                    tx.session_count()?,
                ))
            })
            .unwrap();
        assert_eq!(a.unwrap().interaction_count, 2);
        assert_eq!(b.unwrap().interaction_count, 1);
        assert_eq!(n, 2);
    }

    #[tokio::test]
    async fn staged_writes_commit_with_session_and_cursor() {
        let rig = Rig::new();
        let cancel = CancellationToken::new();
        let source = ScriptedSource::new(
            VecDeque::from(vec![Ok(vec![text(1, 100), text(2, 200)])]),
            cancel.clone(),
        );
        let processor = Arc::new(RecordingProcessor::default());
        let (lp, _) = rig.build(source, processor, IngestConfig::default());
        lp.run(cancel).await.unwrap();

        assert_eq!(rig.handled_ids(ActorId(100)), vec![1]);
        assert_eq!(rig.handled_ids(ActorId(200)), vec![2]);
        let session = rig
            .reopen()
            .with_transaction(|tx| tx.session(ActorId(200)))
            .unwrap();
        assert_eq!(session.unwrap().interaction_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_commit_backs_off_and_redelivers_from_persisted_cursor() {
        let rig = Rig::new();
        let cancel = CancellationToken::new();
        let source = ScriptedSource::new(
            VecDeque::from(vec![batch(&[1, 2, 3]), batch(&[2, 3])]),
            cancel.clone(),
        );
        let processor = Arc::new(RecordingProcessor {
            fail: HashMap::from([(2, Fail::CommitOnce)]),
            ..Default::default()
        });
        let (lp, _) = rig.build(source.clone(), processor.clone(), IngestConfig::default());
        let state = lp.subscribe();

        let summary = lp.run(cancel).await.unwrap();

        // 3 is never handed off from the first batch; 2 is redelivered.
        assert_eq!(processor.seen(), vec![1, 2, 2, 3]);
        assert_eq!(source.offsets(), vec![1, 2, 4]);
        let times = source.times();
        assert!(times[1] - times[0] >= Duration::from_secs(5));

        assert_eq!(summary.store_failures, 1);
        assert_eq!(summary.processor_failures, 0);
        assert_eq!(summary.cursor, Cursor(3));
        assert_eq!(*state.borrow(), LoopState::Stopped);

        let reports = rig.sink.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].scope, FailureScope::Store);
        assert_eq!(reports[0].update_id, Some(2));

        // The rolled-back attempt left neither its log entry nor a session bump.
        assert_eq!(rig.persisted_cursor(), Some(Cursor(3)));
        assert_eq!(rig.handled_ids(ActorId(1)), vec![1, 2, 3]);
        let session = rig
            .reopen()
            .with_transaction(|tx| tx.session(ActorId(1)))
            .unwrap();
        assert_eq!(session.unwrap().interaction_count, 3);
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let mut b = Backoff::new(Duration::from_secs(5), Duration::from_secs(12));
        assert_eq!(b.next_delay(None), Duration::from_secs(5));
        assert_eq!(b.next_delay(None), Duration::from_secs(10));
        assert_eq!(b.next_delay(None), Duration::from_secs(12));
        assert_eq!(b.next_delay(None), Duration::from_secs(12));
        b.reset();
        assert_eq!(b.next_delay(Some(Duration::from_secs(1))), Duration::from_secs(5));
    }
}
