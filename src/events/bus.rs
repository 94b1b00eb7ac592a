//! In-process broadcast of execution events to pluggable sinks.
//!
//! The engine appends events to durable storage for correctness; the bus
//! exists so hosts can watch executions live (dashboards, SSE bridges,
//! test assertions) without polling the log. Delivery is best-effort:
//! a full or disconnected bus never fails the execution.

use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tokio::task;

use super::EventRecord;

/// Receives every event broadcast on the bus.
pub trait EventSink: Send + Sync {
    fn handle(&self, record: &EventRecord);
}

/// Logs events through `tracing` at info level.
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn handle(&self, record: &EventRecord) {
        tracing::info!(
            target: "rillflow::events",
            execution_id = %record.execution_id,
            seq = record.seq,
            event = record.event.label(),
            node_id = record.event.node_id().unwrap_or(""),
            "execution event"
        );
    }
}

/// Buffers events in memory; used by tests and diagnostics.
#[derive(Clone, Debug, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<EventRecord>>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn drain(&self) -> Vec<EventRecord> {
        std::mem::take(&mut self.records.lock().expect("memory sink poisoned"))
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<EventRecord> {
        self.records.lock().expect("memory sink poisoned").clone()
    }
}

impl EventSink for MemorySink {
    fn handle(&self, record: &EventRecord) {
        self.records
            .lock()
            .expect("memory sink poisoned")
            .push(record.clone());
    }
}

/// Cloneable producer handle; sending never blocks.
#[derive(Clone, Debug)]
pub struct EventEmitter {
    tx: flume::Sender<EventRecord>,
}

impl EventEmitter {
    pub fn emit(&self, record: EventRecord) {
        // Dropped receivers just mean nobody is listening.
        let _ = self.tx.send(record);
    }
}

struct ListenerState {
    shutdown_tx: oneshot::Sender<()>,
    handle: task::JoinHandle<()>,
}

/// Fans events out from producers to every registered sink.
pub struct EventBus {
    sinks: Arc<Mutex<Vec<Box<dyn EventSink>>>>,
    channel: (flume::Sender<EventRecord>, flume::Receiver<EventRecord>),
    listener: Mutex<Option<ListenerState>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_sink(TracingSink)
    }
}

impl EventBus {
    #[must_use]
    pub fn with_sink<T: EventSink + 'static>(sink: T) -> Self {
        Self::with_sinks(vec![Box::new(sink)])
    }

    #[must_use]
    pub fn with_sinks(sinks: Vec<Box<dyn EventSink>>) -> Self {
        Self {
            sinks: Arc::new(Mutex::new(sinks)),
            channel: flume::unbounded(),
            listener: Mutex::new(None),
        }
    }

    /// Register an additional sink (e.g. a per-request stream).
    pub fn add_sink<T: EventSink + 'static>(&self, sink: T) {
        self.sinks
            .lock()
            .expect("sink registry poisoned")
            .push(Box::new(sink));
    }

    #[must_use]
    pub fn emitter(&self) -> EventEmitter {
        EventEmitter {
            tx: self.channel.0.clone(),
        }
    }

    /// Spawn the background fan-out task. Idempotent.
    pub fn listen(&self) {
        let mut guard = self.listener.lock().expect("listener poisoned");
        if guard.is_some() {
            return;
        }
        let rx = self.channel.1.clone();
        let sinks = self.sinks.clone();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let handle = task::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    recv = rx.recv_async() => match recv {
                        Err(_) => break,
                        Ok(record) => {
                            let sinks = sinks.lock().expect("sink registry poisoned");
                            for sink in sinks.iter() {
                                sink.handle(&record);
                            }
                        }
                    }
                }
            }
        });
        *guard = Some(ListenerState {
            shutdown_tx,
            handle,
        });
    }

    /// Stop the fan-out task after draining in-flight sends.
    pub async fn shutdown(&self) {
        let state = self.listener.lock().expect("listener poisoned").take();
        if let Some(state) = state {
            let _ = state.shutdown_tx.send(());
            let _ = state.handle.await;
        }
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.listener.lock() {
            if let Some(state) = guard.take() {
                let _ = state.shutdown_tx.send(());
                state.handle.abort();
            }
        }
    }
}
