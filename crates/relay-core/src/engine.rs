use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    cursor::{CursorStore, UPDATES_STREAM},
    dispatch::Dispatcher,
    ingest::{IngestConfig, IngestSummary, IngestionLoop, Processor, UpdateSource},
    messaging::{dispatched::DispatchedMessenger, port::MessagingPort},
    ratelimit::RateLimiter,
    report::{JsonlSink, Reporter},
    store::StateStore,
    Result,
};

/// Owner of the process-wide engine state: the dispatcher (and its rate
/// windows), the state store, the update cursor and the failure reporter.
///
/// Built once at startup and shared by `Arc`; nothing here is global.
#[derive(Debug)]
pub struct DispatchEngine {
    dispatcher: Arc<Dispatcher>,
    store: StateStore,
    cursors: CursorStore,
    reporter: Reporter,
    ingest: IngestConfig,
}

impl DispatchEngine {
    pub fn new(
        limiter: RateLimiter,
        store: StateStore,
        reporter: Reporter,
        ingest: IngestConfig,
    ) -> Self {
        let cursors = CursorStore::new(store.clone(), UPDATES_STREAM);
        Self {
            dispatcher: Arc::new(Dispatcher::new(limiter)),
            store,
            cursors,
            reporter,
            ingest,
        }
    }

    /// Open the state database and wire the tracing + JSONL failure sinks.
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let store = StateStore::open(&cfg.state_db_path)?;
        let reporter =
            Reporter::tracing().with_sink(Arc::new(JsonlSink::new(cfg.failure_log_path.clone())));
        tracing::info!(
            db = %cfg.state_db_path.display(),
            failures = %cfg.failure_log_path.display(),
            "engine ready"
        );
        Ok(Self::new(
            cfg.rate_limiter(),
            store,
            reporter,
            cfg.ingest_config(),
        ))
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn cursors(&self) -> &CursorStore {
        &self.cursors
    }

    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    pub fn ingest_config(&self) -> &IngestConfig {
        &self.ingest
    }

    /// Wrap a raw messenger so every outbound call is throttled and reported.
    pub fn messenger(&self, inner: Arc<dyn MessagingPort>) -> DispatchedMessenger {
        DispatchedMessenger::new(inner, self.dispatcher.clone(), self.reporter.clone())
    }

    pub fn ingestion_loop(
        &self,
        source: Arc<dyn UpdateSource>,
        processor: Arc<dyn Processor>,
    ) -> IngestionLoop {
        IngestionLoop::new(
            source,
            processor,
            self.dispatcher.clone(),
            self.store.clone(),
            self.cursors.clone(),
            self.reporter.clone(),
            self.ingest.clone(),
        )
    }

    /// Run the ingestion loop until `cancel` fires; the store is closed on return.
    pub async fn run(
        &self,
        source: Arc<dyn UpdateSource>,
        processor: Arc<dyn Processor>,
        cancel: CancellationToken,
    ) -> Result<IngestSummary> {
        self.ingestion_loop(source, processor).run(cancel).await
    }
}
