use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::services::event::BlockEvent;
use crate::services::metrics::RelayMetrics;

/// Queue occupancy fraction above which the backpressure signal raises
const BACKPRESSURE_WATERMARK: f64 = 0.9;

/// Event plus its per-chain emission ticket
#[derive(Debug)]
pub struct QueuedEvent {
    pub event: BlockEvent,
    pub seq: u64,
}

/// Bounded FIFO between adapters and the worker pool.
///
/// Producers never block: a full queue drops the event and the caller counts
/// it. Depth is tracked explicitly so the 90% watermark can raise the
/// backpressure signal.
pub struct IngestionQueue {
    tx: mpsc::Sender<QueuedEvent>,
    depth: Arc<AtomicUsize>,
    capacity: usize,
    metrics: Option<Arc<RelayMetrics>>,
}

/// Consumer half; shared by workers behind an async mutex
pub struct QueueConsumer {
    rx: tokio::sync::Mutex<mpsc::Receiver<QueuedEvent>>,
    depth: Arc<AtomicUsize>,
    metrics: Option<Arc<RelayMetrics>>,
}

pub fn ingestion_queue(
    capacity: usize,
    metrics: Option<Arc<RelayMetrics>>,
) -> (IngestionQueue, Arc<QueueConsumer>) {
    let capacity = capacity.max(1);
    let (tx, rx) = mpsc::channel(capacity);
    let depth = Arc::new(AtomicUsize::new(0));
    (
        IngestionQueue {
            tx,
            depth: depth.clone(),
            capacity,
            metrics: metrics.clone(),
        },
        Arc::new(QueueConsumer {
            rx: tokio::sync::Mutex::new(rx),
            depth,
            metrics,
        }),
    )
}

impl IngestionQueue {
    /// Non-blocking enqueue; `false` means the event was dropped at the
    /// full boundary
    pub fn try_enqueue(&self, item: QueuedEvent) -> bool {
        match self.tx.try_send(item) {
            Ok(()) => {
                let depth = self.depth.fetch_add(1, Ordering::SeqCst) + 1;
                if let Some(metrics) = &self.metrics {
                    metrics.queue_depth.set(depth as f64);
                    metrics
                        .backpressure_active
                        .set(if self.is_backpressured(depth) { 1.0 } else { 0.0 });
                }
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) | Err(mpsc::error::TrySendError::Closed(_)) => {
                false
            }
        }
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// True while queue length exceeds the 90% watermark
    pub fn backpressure_active(&self) -> bool {
        self.is_backpressured(self.depth())
    }

    fn is_backpressured(&self, depth: usize) -> bool {
        depth as f64 > self.capacity as f64 * BACKPRESSURE_WATERMARK
    }
}

impl Clone for IngestionQueue {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            depth: self.depth.clone(),
            capacity: self.capacity,
            metrics: self.metrics.clone(),
        }
    }
}

impl QueueConsumer {
    /// Dequeue the next event; `None` once all producers are gone and the
    /// queue has drained
    pub async fn dequeue(&self) -> Option<QueuedEvent> {
        let item = self.rx.lock().await.recv().await;
        if item.is_some() {
            let depth = self.depth.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
            if let Some(metrics) = &self.metrics {
                metrics.queue_depth.set(depth as f64);
            }
        }
        item
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::event::{BlockHash, Chain};

    fn item(byte: u8, seq: u64) -> QueuedEvent {
        QueuedEvent {
            event: BlockEvent::new(Chain::Ethereum, BlockHash::new(vec![byte; 32]), 1, "t"),
            seq,
        }
    }

    #[tokio::test]
    async fn test_overflow_drops_instead_of_blocking() {
        let (queue, _consumer) = ingestion_queue(100, None);
        let mut accepted = 0;
        let mut dropped = 0;
        for i in 0..150u64 {
            if queue.try_enqueue(item((i % 256) as u8, i)) {
                accepted += 1;
            } else {
                dropped += 1;
            }
        }
        assert_eq!(accepted, 100);
        assert_eq!(dropped, 50);
        assert_eq!(queue.depth(), 100);
    }

    #[tokio::test]
    async fn test_fifo_order_preserved() {
        let (queue, consumer) = ingestion_queue(10, None);
        for i in 0..10u64 {
            assert!(queue.try_enqueue(item(i as u8, i)));
        }
        for i in 0..10u64 {
            let next = consumer.dequeue().await.unwrap();
            assert_eq!(next.seq, i);
        }
    }

    #[tokio::test]
    async fn test_backpressure_watermark() {
        let (queue, consumer) = ingestion_queue(10, None);
        for i in 0..9u64 {
            queue.try_enqueue(item(i as u8, i));
        }
        assert!(!queue.backpressure_active());
        queue.try_enqueue(item(9, 9));
        assert!(queue.backpressure_active());

        consumer.dequeue().await.unwrap();
        assert!(!queue.backpressure_active());
    }

    #[tokio::test]
    async fn test_dequeue_none_after_producers_drop() {
        let (queue, consumer) = ingestion_queue(10, None);
        queue.try_enqueue(item(1, 0));
        drop(queue);
        assert!(consumer.dequeue().await.is_some());
        assert!(consumer.dequeue().await.is_none());
    }
}
