use std::{collections::HashMap, sync::Arc};

use futures_util::{Stream, StreamExt, stream};
use redwave_process::{InstanceId, LogLine, StatusChange};
use tokio::sync::{
    RwLock, broadcast,
    broadcast::error::RecvError,
};

const DEFAULT_CAPACITY: usize = 1024;

/// Fan-out of status changes (one global topic) and log lines (one topic per
/// instance).
///
/// Delivery is at-most-once to receivers connected at publish time. Sending
/// never waits on a receiver; a receiver that falls more than `capacity`
/// events behind observes `RecvError::Lagged` and skips ahead.
#[derive(Clone, Debug)]
pub struct EventBus {
    inner: Arc<EventBusInner>,
}

#[derive(Debug)]
struct EventBusInner {
    capacity: usize,
    status_tx: broadcast::Sender<StatusChange>,
    log_topics: RwLock<HashMap<InstanceId, LogTopic>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (status_tx, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(EventBusInner {
                capacity,
                status_tx,
                log_topics: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Returns the number of receivers reached.
    pub fn publish_status(&self, change: StatusChange) -> usize {
        let receivers = self.inner.status_tx.receiver_count();
        if receivers == 0 {
            tracing::trace!(id = %change.id, status = %change.status, "no status subscribers");
            return 0;
        }
        self.inner.status_tx.send(change).unwrap_or(0)
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusChange> {
        self.inner.status_tx.subscribe()
    }

    /// Creates (or returns) the log topic of an instance.
    pub async fn open_log_topic(&self, id: &InstanceId) -> LogTopic {
        if let Some(topic) = self.inner.log_topics.read().await.get(id) {
            return topic.clone();
        }
        let mut topics = self.inner.log_topics.write().await;
        topics
            .entry(id.clone())
            .or_insert_with(|| LogTopic::new(self.inner.capacity))
            .clone()
    }
}

/// Publishing handle for a single instance's log topic.
#[derive(Clone, Debug)]
pub struct LogTopic {
    tx: broadcast::Sender<LogLine>,
}

impl LogTopic {
    fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, line: LogLine) -> usize {
        if self.tx.receiver_count() == 0 {
            return 0;
        }
        self.tx.send(line).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogLine> {
        self.tx.subscribe()
    }
}

/// Log history captured at subscribe time plus the live feed that follows
/// it without gap or overlap.
#[derive(Debug)]
pub struct LogSubscription {
    pub history: Vec<LogLine>,
    pub live: broadcast::Receiver<LogLine>,
}

impl LogSubscription {
    /// History first, then live lines until the topic closes. Lagged ranges
    /// are skipped.
    pub fn into_stream(self) -> impl Stream<Item = LogLine> + Send + 'static {
        let live = stream::unfold(self.live, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(line) => return Some((line, rx)),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "log subscriber lagged");
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        });
        stream::iter(self.history).chain(live)
    }
}

/// Status changes as a stream; lagged ranges are skipped.
pub fn status_stream(
    rx: broadcast::Receiver<StatusChange>,
) -> impl Stream<Item = StatusChange> + Send + 'static {
    stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(change) => return Some((change, rx)),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "status subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    })
}
