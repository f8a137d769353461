//! Traces and spans describing agent runs, dispatched to pluggable
//! processors.
//!
//! A [`Trace`] covers one run. [`Span`]s cover the steps inside it (agent
//! turns, model calls, tool calls, handoffs, guardrails). Both are handles:
//! they report to their [`TraceProvider`] when started and finished, and
//! finish themselves on drop so error paths are covered.

pub mod exporter;
pub mod processor;

use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::usage::Usage;

pub use exporter::{
    BackendExporterConfig, BackendSpanExporter, ConsoleSpanExporter, ReqwestTransport,
    TraceExporter, TraceTransport,
};
pub use processor::{BatchProcessorConfig, BatchTraceProcessor, TraceQueue};

pub fn gen_trace_id() -> String {
    format!("trace_{}", Uuid::new_v4().simple())
}

pub fn gen_span_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("span_{}", &hex[..24])
}

pub fn gen_group_id() -> String {
    format!("group_{}", &Uuid::new_v4().simple().to_string()[..24])
}

/// Typed payload of a span.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SpanData {
    Agent {
        name: String,
        handoffs: Vec<String>,
        tools: Vec<String>,
        output_type: Option<String>,
    },
    Function {
        name: String,
        input: Option<String>,
        output: Option<String>,
    },
    Generation {
        model: Option<String>,
        input: Option<Value>,
        output: Option<Value>,
        usage: Option<Usage>,
    },
    Response {
        response_id: Option<String>,
    },
    Handoff {
        from_agent: Option<String>,
        to_agent: Option<String>,
    },
    Guardrail {
        name: String,
        triggered: bool,
    },
    Custom {
        name: String,
        data: Value,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SpanError {
    pub message: String,
    pub data: Option<Value>,
}

impl SpanError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            data: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TraceRecord {
    pub id: String,
    pub workflow_name: String,
    pub group_id: Option<String>,
    pub metadata: Option<Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SpanRecord {
    pub id: String,
    pub trace_id: String,
    pub parent_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub span_data: SpanData,
    pub error: Option<SpanError>,
}

/// One record handed to an exporter.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "object")]
pub enum ExportItem {
    #[serde(rename = "trace")]
    Trace(TraceRecord),
    #[serde(rename = "trace.span")]
    Span(SpanRecord),
}

/// Receives trace and span lifecycle events. Called synchronously from the
/// run, so implementations must not block.
pub trait TracingProcessor: Send + Sync {
    fn on_trace_start(&self, trace: &TraceRecord);

    fn on_trace_end(&self, trace: &TraceRecord);

    fn on_span_start(&self, span: &SpanRecord);

    fn on_span_end(&self, span: &SpanRecord);

    fn force_flush(&self);

    fn shutdown(&self);
}

/// Creates traces and fans their events out to registered processors.
#[derive(Default)]
pub struct TraceProvider {
    processors: RwLock<Vec<Arc<dyn TracingProcessor>>>,
}

impl std::fmt::Debug for TraceProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceProvider")
            .field("processors", &self.processors().len())
            .finish()
    }
}

static GLOBAL_PROVIDER: OnceLock<Arc<TraceProvider>> = OnceLock::new();

impl TraceProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_processor(self, processor: Arc<dyn TracingProcessor>) -> Self {
        self.add_processor(processor);
        self
    }

    /// Process-wide provider exporting to the tracing backend configured in
    /// the environment. Created on first use.
    pub fn global() -> Arc<TraceProvider> {
        Arc::clone(GLOBAL_PROVIDER.get_or_init(|| {
            let provider = TraceProvider::new();
            match BackendSpanExporter::from_env() {
                Ok(exporter) => provider.add_processor(Arc::new(BatchTraceProcessor::new(
                    Arc::new(exporter),
                    BatchProcessorConfig::default(),
                ))),
                Err(err) => warn!(error = %err, "trace exporter unavailable, tracing is a no-op"),
            }
            Arc::new(provider)
        }))
    }

    pub fn add_processor(&self, processor: Arc<dyn TracingProcessor>) {
        self.processors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(processor);
    }

    pub fn set_processors(&self, processors: Vec<Arc<dyn TracingProcessor>>) {
        *self
            .processors
            .write()
            .unwrap_or_else(PoisonError::into_inner) = processors;
    }

    fn processors(&self) -> Vec<Arc<dyn TracingProcessor>> {
        self.processors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn create_trace(
        self: &Arc<Self>,
        workflow_name: impl Into<String>,
        trace_id: Option<String>,
        group_id: Option<String>,
        metadata: Option<Value>,
    ) -> Trace {
        Trace {
            inner: Some(TraceInner {
                provider: Arc::clone(self),
                record: TraceRecord {
                    id: trace_id.unwrap_or_else(gen_trace_id),
                    workflow_name: workflow_name.into(),
                    group_id,
                    metadata,
                },
                started: false,
                finished: false,
            }),
        }
    }

    pub fn force_flush(&self) {
        for processor in self.processors() {
            processor.force_flush();
        }
    }

    pub fn shutdown(&self) {
        for processor in self.processors() {
            processor.shutdown();
        }
    }
}

struct TraceInner {
    provider: Arc<TraceProvider>,
    record: TraceRecord,
    started: bool,
    finished: bool,
}

/// Root of one workflow execution. A default `Trace` records nothing.
#[derive(Default)]
pub struct Trace {
    inner: Option<TraceInner>,
}

impl std::fmt::Debug for Trace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trace")
            .field("trace_id", &self.trace_id())
            .finish()
    }
}

impl Trace {
    pub fn noop() -> Self {
        Self::default()
    }

    pub fn trace_id(&self) -> Option<&str> {
        self.inner.as_ref().map(|inner| inner.record.id.as_str())
    }

    pub fn start(&mut self) {
        let Some(inner) = self.inner.as_mut() else {
            return;
        };
        if inner.started {
            return;
        }
        inner.started = true;
        for processor in inner.provider.processors() {
            processor.on_trace_start(&inner.record);
        }
    }

    pub fn finish(&mut self) {
        let Some(inner) = self.inner.as_mut() else {
            return;
        };
        if !inner.started || inner.finished {
            return;
        }
        inner.finished = true;
        for processor in inner.provider.processors() {
            processor.on_trace_end(&inner.record);
        }
    }

    /// A span directly under this trace.
    pub fn span(&self, data: SpanData) -> Span {
        match &self.inner {
            Some(inner) => Span::new(Arc::clone(&inner.provider), &inner.record.id, None, data),
            None => Span::noop(),
        }
    }
}

impl Drop for Trace {
    fn drop(&mut self) {
        self.finish();
    }
}

struct SpanInner {
    provider: Arc<TraceProvider>,
    record: SpanRecord,
    started: bool,
    finished: bool,
}

/// One step inside a trace. A default `Span` records nothing.
#[derive(Default)]
pub struct Span {
    inner: Option<SpanInner>,
}

impl std::fmt::Debug for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Span")
            .field("span_id", &self.span_id())
            .finish()
    }
}

impl Span {
    fn new(
        provider: Arc<TraceProvider>,
        trace_id: &str,
        parent_id: Option<String>,
        span_data: SpanData,
    ) -> Self {
        Self {
            inner: Some(SpanInner {
                provider,
                record: SpanRecord {
                    id: gen_span_id(),
                    trace_id: trace_id.to_string(),
                    parent_id,
                    started_at: None,
                    ended_at: None,
                    span_data,
                    error: None,
                },
                started: false,
                finished: false,
            }),
        }
    }

    pub fn noop() -> Self {
        Self::default()
    }

    pub fn span_id(&self) -> Option<&str> {
        self.inner.as_ref().map(|inner| inner.record.id.as_str())
    }

    pub fn child(&self, data: SpanData) -> Span {
        match &self.inner {
            Some(inner) => Span::new(
                Arc::clone(&inner.provider),
                &inner.record.trace_id,
                Some(inner.record.id.clone()),
                data,
            ),
            None => Span::noop(),
        }
    }

    /// Starts the span and returns it, for chaining after creation.
    pub fn started(mut self) -> Self {
        self.start();
        self
    }

    pub fn start(&mut self) {
        let Some(inner) = self.inner.as_mut() else {
            return;
        };
        if inner.started {
            return;
        }
        inner.started = true;
        inner.record.started_at = Some(Utc::now());
        for processor in inner.provider.processors() {
            processor.on_span_start(&inner.record);
        }
    }

    pub fn finish(&mut self) {
        let Some(inner) = self.inner.as_mut() else {
            return;
        };
        if !inner.started || inner.finished {
            return;
        }
        inner.finished = true;
        inner.record.ended_at = Some(Utc::now());
        for processor in inner.provider.processors() {
            processor.on_span_end(&inner.record);
        }
    }

    pub fn set_error(&mut self, error: SpanError) {
        if let Some(inner) = self.inner.as_mut() {
            inner.record.error = Some(error);
        }
    }

    /// Payload access for filling in results before the span finishes.
    pub fn data_mut(&mut self) -> Option<&mut SpanData> {
        match self.inner.as_mut() {
            Some(inner) if !inner.finished => Some(&mut inner.record.span_data),
            _ => None,
        }
    }
}

impl Drop for Span {
    fn drop(&mut self) {
        self.finish();
    }
}
