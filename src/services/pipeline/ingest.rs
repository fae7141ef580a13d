use std::sync::Arc;
use std::time::Duration;

use crate::services::dedup::{DedupeOutcome, Deduplicator};
use crate::services::emit::EventBus;
use crate::services::event::{BlockEvent, EmitResult};
use crate::services::metrics::RelayMetrics;
use crate::services::pipeline::queue::{IngestionQueue, QueuedEvent};
use crate::services::pipeline::sequencer::SharedSequencer;

/// Cooperative pause applied by adapters while the queue is backpressured
const BACKPRESSURE_PAUSE: Duration = Duration::from_millis(50);

/// Pipeline admission handle given to chain adapters.
///
/// Admission is where deduplication happens: only `FirstSeen` events take an
/// emission ticket and enter the queue, so every queued event is unique
/// within the adaptive window.
#[derive(Clone)]
pub struct Ingestor {
    queue: IngestionQueue,
    dedup: Arc<Deduplicator>,
    sequencer: SharedSequencer,
    bus: Arc<EventBus>,
    metrics: Option<Arc<RelayMetrics>>,
}

impl Ingestor {
    pub fn new(
        queue: IngestionQueue,
        dedup: Arc<Deduplicator>,
        sequencer: SharedSequencer,
        bus: Arc<EventBus>,
        metrics: Option<Arc<RelayMetrics>>,
    ) -> Self {
        Self {
            queue,
            dedup,
            sequencer,
            bus,
            metrics,
        }
    }

    /// Push one candidate event into the pipeline
    pub fn submit(&self, event: BlockEvent) -> EmitResult {
        let chain = event.chain;

        if self.dedup.check_and_record(&event) == DedupeOutcome::Duplicate {
            if let Some(metrics) = &self.metrics {
                metrics
                    .duplicates_total
                    .with_label_values(&[chain.as_str()])
                    .inc();
            }
            return EmitResult::DroppedDuplicate;
        }

        if let Some(metrics) = &self.metrics {
            if event.is_header_only {
                metrics
                    .header_only_events_total
                    .with_label_values(&[chain.as_str()])
                    .inc();
            }
        }

        let ticket = self.sequencer.assign(chain);
        if self.queue.try_enqueue(QueuedEvent { event, seq: ticket }) {
            if let Some(metrics) = &self.metrics {
                metrics
                    .blocks_ingested_total
                    .with_label_values(&[chain.as_str()])
                    .inc();
            }
            EmitResult::Accepted
        } else {
            // Drop and count; the ticket is abandoned so later events are
            // not held behind the gap
            self.sequencer.abandon(chain, ticket, &self.bus);
            if let Some(metrics) = &self.metrics {
                metrics
                    .dropped_backpressure_total
                    .with_label_values(&[chain.as_str()])
                    .inc();
            }
            tracing::warn!(chain = %chain, "Event dropped: ingestion queue full");
            EmitResult::DroppedBackpressure
        }
    }

    pub fn backpressure_active(&self) -> bool {
        self.queue.backpressure_active()
    }

    /// 50 ms cooperative sleep while the backpressure signal is raised
    pub async fn cooperative_backoff(&self) {
        if self.queue.backpressure_active() {
            tokio::time::sleep(BACKPRESSURE_PAUSE).await;
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.depth()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::relay_config::DedupConfig;
    use crate::services::event::{BlockHash, Chain};
    use crate::services::pipeline::queue::ingestion_queue;
    use crate::services::pipeline::sequencer::EmissionSequencer;

    fn ingestor(capacity: usize) -> Ingestor {
        let (queue, consumer) = ingestion_queue(capacity, None);
        // Keep the receiver half alive for the ingestor's lifetime; otherwise
        // the channel closes immediately and every submit() fails.
        std::mem::forget(consumer);
        Ingestor::new(
            queue,
            Arc::new(Deduplicator::new(DedupConfig::default())),
            Arc::new(EmissionSequencer::new()),
            Arc::new(EventBus::new(16)),
            None,
        )
    }

    fn event(byte: u8) -> BlockEvent {
        BlockEvent::new(Chain::Ethereum, BlockHash::new(vec![byte; 32]), 1, "t")
    }

    #[tokio::test]
    async fn test_duplicate_rejected_at_admission() {
        let ingestor = ingestor(10);
        assert_eq!(ingestor.submit(event(1)), EmitResult::Accepted);
        assert_eq!(ingestor.submit(event(1)), EmitResult::DroppedDuplicate);
    }

    #[tokio::test]
    async fn test_overflow_reports_backpressure() {
        let ingestor = ingestor(2);
        assert_eq!(ingestor.submit(event(1)), EmitResult::Accepted);
        assert_eq!(ingestor.submit(event(2)), EmitResult::Accepted);
        assert_eq!(ingestor.submit(event(3)), EmitResult::DroppedBackpressure);
    }
}
