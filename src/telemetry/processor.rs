//! Background batching of trace records.
//!
//! Producers push into a bounded [`TraceQueue`] and never block; a dedicated
//! worker thread drains it in batches and hands them to a [`TraceExporter`].

use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, error};

use super::exporter::TraceExporter;
use super::{ExportItem, SpanRecord, TraceRecord, TracingProcessor};

#[derive(Debug, Clone)]
pub struct BatchProcessorConfig {
    pub max_queue_size: usize,
    pub max_batch_size: usize,
    /// Longest time an item waits in the queue before export.
    pub schedule_delay: Duration,
    /// Queue fill ratio that wakes the worker early.
    pub export_trigger_ratio: f64,
}

impl Default for BatchProcessorConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 8192,
            max_batch_size: 128,
            schedule_delay: Duration::from_secs(5),
            export_trigger_ratio: 0.7,
        }
    }
}

impl BatchProcessorConfig {
    fn trigger_size(&self) -> usize {
        let size = (self.max_queue_size as f64 * self.export_trigger_ratio) as usize;
        size.max(1)
    }
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<ExportItem>,
    flush_waiters: Vec<mpsc::Sender<()>>,
    shutdown: bool,
}

/// Bounded multi-producer queue shared with the export worker.
pub struct TraceQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    wakeup: Condvar,
}

impl std::fmt::Debug for TraceQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceQueue")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

impl TraceQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(QueueState::default()),
            wakeup: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueues `item`, or drops it and returns `false` when full.
    pub fn push(&self, item: ExportItem) -> bool {
        let mut state = self.lock();
        if state.items.len() >= self.capacity {
            return false;
        }
        state.items.push_back(item);
        true
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes up to `max` items from the front.
    pub fn drain_batch(&self, max: usize) -> Vec<ExportItem> {
        let mut state = self.lock();
        let take = state.items.len().min(max);
        state.items.drain(..take).collect()
    }

    fn notify(&self) {
        self.wakeup.notify_all();
    }
}

struct Job {
    flush_waiters: Vec<mpsc::Sender<()>>,
    stop: bool,
}

/// [`TracingProcessor`] that exports trace starts and finished spans in
/// batches from a background thread.
///
/// The worker wakes when the queue passes the trigger size, when
/// `schedule_delay` elapses, on [`force_flush`](TracingProcessor::force_flush)
/// and on shutdown. Each wakeup drains the whole queue in batches of at most
/// `max_batch_size`.
pub struct BatchTraceProcessor {
    queue: Arc<TraceQueue>,
    config: BatchProcessorConfig,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for BatchTraceProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchTraceProcessor")
            .field("queue", &self.queue)
            .field("config", &self.config)
            .finish()
    }
}

impl BatchTraceProcessor {
    pub fn new(exporter: Arc<dyn TraceExporter>, config: BatchProcessorConfig) -> Self {
        let queue = Arc::new(TraceQueue::new(config.max_queue_size));
        let worker_queue = Arc::clone(&queue);
        let worker_config = config.clone();
        let spawned = std::thread::Builder::new()
            .name("trace-export".to_string())
            .spawn(move || run_worker(worker_queue, exporter, worker_config));

        let worker = match spawned {
            Ok(handle) => Some(handle),
            Err(err) => {
                error!(error = %err, "failed to start trace export worker, traces will be dropped");
                queue.lock().shutdown = true;
                None
            }
        };

        Self {
            queue,
            config,
            worker: Mutex::new(worker),
        }
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    fn enqueue(&self, item: ExportItem) {
        if !self.queue.push(item) {
            debug!("trace queue full, dropping record");
            return;
        }
        if self.queue.len() >= self.config.trigger_size() {
            self.queue.notify();
        }
    }
}

impl TracingProcessor for BatchTraceProcessor {
    fn on_trace_start(&self, trace: &TraceRecord) {
        self.enqueue(ExportItem::Trace(trace.clone()));
    }

    fn on_trace_end(&self, _trace: &TraceRecord) {}

    fn on_span_start(&self, _span: &SpanRecord) {}

    fn on_span_end(&self, span: &SpanRecord) {
        self.enqueue(ExportItem::Span(span.clone()));
    }

    /// Blocks until every item queued before the call has been exported.
    fn force_flush(&self) {
        let (tx, rx) = mpsc::channel();
        {
            let mut state = self.queue.lock();
            if state.shutdown {
                return;
            }
            state.flush_waiters.push(tx);
        }
        self.queue.notify();
        // The worker drops waiters it cannot serve, which ends the wait.
        let _ = rx.recv();
    }

    fn shutdown(&self) {
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            return;
        };

        self.queue.lock().shutdown = true;
        self.queue.notify();
        if handle.join().is_err() {
            error!("trace export worker panicked");
        }
    }
}

impl Drop for BatchTraceProcessor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(queue: Arc<TraceQueue>, exporter: Arc<dyn TraceExporter>, config: BatchProcessorConfig) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(error = %err, "failed to build trace export runtime");
            let mut state = queue.lock();
            state.shutdown = true;
            state.flush_waiters.clear();
            return;
        }
    };

    loop {
        let job = wait_for_job(&queue, &config);

        loop {
            let batch = queue.drain_batch(config.max_batch_size.max(1));
            if batch.is_empty() {
                break;
            }
            debug!(count = batch.len(), "exporting trace batch");
            runtime.block_on(exporter.export(batch));
        }

        for waiter in job.flush_waiters {
            let _ = waiter.send(());
        }
        if job.stop {
            break;
        }
    }
}

fn wait_for_job(queue: &TraceQueue, config: &BatchProcessorConfig) -> Job {
    let deadline = Instant::now() + config.schedule_delay;
    let trigger = config.trigger_size();
    let mut state = queue.lock();

    loop {
        if state.shutdown || !state.flush_waiters.is_empty() {
            return Job {
                flush_waiters: std::mem::take(&mut state.flush_waiters),
                stop: state.shutdown,
            };
        }

        let now = Instant::now();
        if state.items.len() >= trigger || now >= deadline {
            return Job {
                flush_waiters: Vec::new(),
                stop: false,
            };
        }

        state = queue
            .wakeup
            .wait_timeout(state, deadline - now)
            .unwrap_or_else(PoisonError::into_inner)
            .0;
    }
}
