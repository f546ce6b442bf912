use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::jobs::model::{Event, EventType, NewEvent};
use crate::jobs::store::ItemStore;

/// External consumer of job events (notifications, audit shipping).
///
/// Delivery is best effort: a failing or slow sink is logged and skipped,
/// it never holds up the job that produced the event.
#[async_trait]
pub trait EventSink: Send + Sync {
    fn name(&self) -> &str;

    async fn emit(&self, event: &Event) -> anyhow::Result<()>;
}

const DELIVERY_QUEUE: usize = 1024;

/// Append-only job event trail. Persists through the store, then hands the
/// event to one background delivery task per sink.
#[derive(Clone)]
pub struct EventLog {
    store: Arc<dyn ItemStore>,
    sinks: Vec<Arc<dyn EventSink>>,
    sink_timeout: Duration,
    queue_capacity: usize,
    // started on first append, so building a log needs no runtime
    delivery: Arc<OnceLock<Vec<Delivery>>>,
}

struct Delivery {
    sink: Arc<dyn EventSink>,
    tx: mpsc::Sender<Event>,
}

impl EventLog {
    pub fn new(store: Arc<dyn ItemStore>) -> Self {
        Self {
            store,
            sinks: Vec::new(),
            sink_timeout: Duration::from_secs(5),
            queue_capacity: DELIVERY_QUEUE,
            delivery: Arc::new(OnceLock::new()),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self.delivery = Arc::new(OnceLock::new());
        self
    }

    pub fn with_sink_timeout(mut self, dur: Duration) -> Self {
        self.sink_timeout = dur;
        self.delivery = Arc::new(OnceLock::new());
        self
    }

    /// Events buffered per sink before new ones are dropped.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self.delivery = Arc::new(OnceLock::new());
        self
    }

    /// Persists the event and returns once it is stored. Sink delivery happens
    /// afterwards on background tasks.
    pub async fn append(
        &self,
        job_id: Uuid,
        event_type: EventType,
        payload: Value,
        actor: Option<&str>,
    ) -> anyhow::Result<Event> {
        let event = self
            .store
            .append_event(NewEvent {
                job_id,
                event_type,
                payload,
                actor: actor.map(str::to_string),
            })
            .await?;

        tracing::debug!(
            job_id = %job_id,
            event = event_type.as_str(),
            "job event appended"
        );

        if !self.sinks.is_empty() {
            self.deliver(&event);
        }

        Ok(event)
    }

    pub async fn list(&self, job_id: Uuid) -> anyhow::Result<Vec<Event>> {
        self.store.list_events(job_id).await
    }

    fn deliver(&self, event: &Event) {
        let queues = self.delivery.get_or_init(|| self.start_delivery());
        for queue in queues {
            match queue.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => tracing::warn!(
                    sink = queue.sink.name(),
                    job_id = %event.job_id,
                    event = event.event_type.as_str(),
                    "event sink backlog full; event dropped"
                ),
                Err(mpsc::error::TrySendError::Closed(_)) => tracing::warn!(
                    sink = queue.sink.name(),
                    job_id = %event.job_id,
                    event = event.event_type.as_str(),
                    "event sink delivery stopped; event dropped"
                ),
            }
        }
    }

    fn start_delivery(&self) -> Vec<Delivery> {
        self.sinks
            .iter()
            .map(|sink| {
                let (tx, rx) = mpsc::channel(self.queue_capacity);
                tokio::spawn(drain(sink.clone(), rx, self.sink_timeout));
                Delivery {
                    sink: sink.clone(),
                    tx,
                }
            })
            .collect()
    }
}

/// Runs until every `EventLog` clone feeding it is dropped.
async fn drain(sink: Arc<dyn EventSink>, mut rx: mpsc::Receiver<Event>, timeout: Duration) {
    while let Some(event) = rx.recv().await {
        match tokio::time::timeout(timeout, sink.emit(&event)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::warn!(
                sink = sink.name(),
                job_id = %event.job_id,
                event = event.event_type.as_str(),
                error = %err,
                "event sink delivery failed"
            ),
            Err(_) => tracing::warn!(
                sink = sink.name(),
                job_id = %event.job_id,
                event = event.event_type.as_str(),
                timeout_ms = timeout.as_millis() as u64,
                "event sink timed out"
            ),
        }
    }
}

/// In-process fan-out over a tokio broadcast channel.
#[derive(Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<Event>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl EventSink for BroadcastSink {
    fn name(&self) -> &str {
        "broadcast"
    }

    async fn emit(&self, event: &Event) -> anyhow::Result<()> {
        // no subscribers is not an error
        let _ = self.tx.send(event.clone());
        Ok(())
    }
}
