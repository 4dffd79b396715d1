//! Single reporting path for every caught failure.
//!
//! The ingestion loop, the dispatched messenger and the processor never log
//! failures ad hoc: they build a [`FailureReport`] and hand it to the shared
//! [`Reporter`], which fans it out to its sinks (tracing, JSON lines on disk).

use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::Serialize;

use crate::{
    domain::{ChatId, UpdateId},
    errors::{DispatchError, Error, FailureKind},
    Result,
};

const REPORT_MAX_TEXT: usize = 500;

/// Where in the engine a failure was caught.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureScope {
    /// The processor failed on one update.
    Processor,
    /// The long-poll transport call failed.
    Poll,
    /// An outbound reply/platform call failed.
    Outbound,
    /// A store transaction failed and was rolled back.
    Store,
}

#[derive(Clone, Debug, Serialize)]
pub struct FailureReport {
    pub timestamp: String,
    pub scope: FailureScope,
    pub kind: FailureKind,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    /// Full outbound payload, kept so the call can be replayed by hand.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,

    pub error: String,
}

impl FailureReport {
    fn base(scope: FailureScope, kind: FailureKind, error: String) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            scope,
            kind,
            service: None,
            update_id: None,
            target: None,
            operation: None,
            payload: None,
            attempts: None,
            retry_after_ms: None,
            error,
        }
    }

    pub fn processor(update_id: UpdateId, err: &Error, attempts: u32) -> Self {
        Self {
            update_id: Some(update_id.0),
            attempts: Some(attempts),
            ..Self::base(FailureScope::Processor, err.kind(), err.to_string())
        }
    }

    pub fn poll(err: &DispatchError, offset: i64) -> Self {
        Self {
            service: Some(err.service.clone()),
            update_id: Some(offset),
            retry_after_ms: err.retry_after.map(|d| d.as_millis() as u64),
            ..Self::base(FailureScope::Poll, err.kind, err.message.clone())
        }
    }

    pub fn outbound(err: &DispatchError, target: ChatId, operation: &str, payload: &str) -> Self {
        Self {
            service: Some(err.service.clone()),
            target: Some(target.0),
            operation: Some(operation.to_string()),
            payload: Some(payload.to_string()),
            retry_after_ms: err.retry_after.map(|d| d.as_millis() as u64),
            ..Self::base(FailureScope::Outbound, err.kind, err.message.clone())
        }
    }

    pub fn store(update_id: Option<UpdateId>, err: &Error) -> Self {
        Self {
            update_id: update_id.map(|u| u.0),
            ..Self::base(FailureScope::Store, err.kind(), err.to_string())
        }
    }
}

/// Destination for failure reports.
pub trait FailureSink: Send + Sync {
    fn record(&self, report: &FailureReport);
}

/// Emits reports as structured `tracing` events.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl FailureSink for TracingSink {
    fn record(&self, r: &FailureReport) {
        let error = truncate_text(&r.error, REPORT_MAX_TEXT);
        match r.kind {
            FailureKind::Transient => tracing::warn!(
                scope = ?r.scope,
                kind = %r.kind,
                service = r.service.as_deref(),
                update_id = r.update_id,
                target = r.target,
                operation = r.operation.as_deref(),
                attempts = r.attempts,
                error = %error,
                "transient failure"
            ),
            FailureKind::Permanent => tracing::error!(
                scope = ?r.scope,
                kind = %r.kind,
                service = r.service.as_deref(),
                update_id = r.update_id,
                target = r.target,
                operation = r.operation.as_deref(),
                attempts = r.attempts,
                error = %error,
                "permanent failure"
            ),
        }
    }
}

/// Appends one JSON object per report to a file (replay log).
#[derive(Clone, Debug)]
pub struct JsonlSink {
    path: PathBuf,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, report: &FailureReport) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let line = serde_json::to_string(report)?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}

impl FailureSink for JsonlSink {
    fn record(&self, report: &FailureReport) {
        if let Err(e) = self.append(report) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to append failure report");
        }
    }
}

/// Shared fan-out over the configured sinks.
#[derive(Clone, Default)]
pub struct Reporter {
    sinks: Vec<Arc<dyn FailureSink>>,
}

impl Reporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reporter with the tracing sink only.
    pub fn tracing() -> Self {
        Self::new().with_sink(Arc::new(TracingSink))
    }

    pub fn with_sink(mut self, sink: Arc<dyn FailureSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn report(&self, report: FailureReport) {
        for sink in &self.sinks {
            sink.record(&report);
        }
    }
}

impl std::fmt::Debug for Reporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reporter")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

pub fn truncate_text(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        return s.to_string();
    }
    let mut out = s.chars().take(max_len).collect::<String>();
    out.push_str("...");
    out
}

/// Sink that keeps reports in memory; used by tests across the workspace.
#[derive(Default)]
pub struct MemorySink {
    reports: std::sync::Mutex<Vec<FailureReport>>,
}

impl MemorySink {
    pub fn reports(&self) -> Vec<FailureReport> {
        self.reports
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl FailureSink for MemorySink {
    fn record(&self, report: &FailureReport) {
        self.reports
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(report.clone());
    }
}
