use std::sync::Arc;
use tokio::sync::broadcast;

use crate::services::event::{BlockEvent, Chain};
use crate::services::metrics::RelayMetrics;

/// Default per-subscriber buffer before old events are dropped
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 1024;

/// Item seen by a subscriber: either a block event or a marker telling the
/// consumer how many events its buffer dropped while it lagged
#[derive(Debug, Clone)]
pub enum StreamItem {
    Event(BlockEvent),
    Lagged(u64),
}

/// Fan-out bus for processed block events.
///
/// Slow consumers never block the pipeline: their buffers drop oldest-first
/// and the gap surfaces as a `Lagged` marker, not as an error.
pub struct EventBus {
    tx: broadcast::Sender<BlockEvent>,
    metrics: Option<Arc<RelayMetrics>>,
}

impl EventBus {
    pub fn new(buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer.max(1));
        Self { tx, metrics: None }
    }

    pub fn with_metrics(mut self, metrics: Arc<RelayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Publish one event; returns the number of live subscribers
    pub fn publish(&self, event: BlockEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Lazily consumed, cancellable stream of events, optionally filtered
    /// to one chain
    pub fn subscribe(&self, chain_filter: Option<Chain>) -> BlockStream {
        BlockStream {
            rx: self.tx.subscribe(),
            chain_filter,
            metrics: self.metrics.clone(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_BUFFER)
    }
}

pub struct BlockStream {
    rx: broadcast::Receiver<BlockEvent>,
    chain_filter: Option<Chain>,
    metrics: Option<Arc<RelayMetrics>>,
}

impl BlockStream {
    /// Next item; `None` once the bus shuts down and the buffer drains
    pub async fn next(&mut self) -> Option<StreamItem> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if let Some(filter) = self.chain_filter {
                        if event.chain != filter {
                            continue;
                        }
                    }
                    return Some(StreamItem::Event(event));
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    let label = self
                        .chain_filter
                        .map(|c| c.as_str())
                        .unwrap_or("all");
                    if let Some(metrics) = &self.metrics {
                        metrics
                            .subscriber_lagged_total
                            .with_label_values(&[label])
                            .inc_by(n as f64);
                    }
                    tracing::warn!(dropped = n, filter = label, "Subscriber lagged");
                    return Some(StreamItem::Lagged(n));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Adapt into a `futures::Stream` for combinator-style consumers
    pub fn into_stream(self) -> impl futures::Stream<Item = StreamItem> {
        futures::stream::unfold(self, |mut stream| async move {
            stream.next().await.map(|item| (item, stream))
        })
    }
}
