use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::relay_config::CircuitConfig;
use crate::services::cache::BlockCache;
use crate::services::dedup::Deduplicator;
use crate::services::emit::EventBus;
use crate::services::event::{BlockEvent, BlockStatus, Chain};
use crate::services::metrics::RelayMetrics;
use crate::services::pipeline::queue::{QueueConsumer, QueuedEvent};
use crate::services::pipeline::sequencer::SharedSequencer;
use crate::services::resilience::{BreakerError, CircuitBreaker, RetryPolicy};

/// Per-stage soft deadlines
const VALIDATE_DEADLINE: Duration = Duration::from_millis(10);
const ENRICH_DEADLINE: Duration = Duration::from_millis(500);
const CACHE_WRITE_DEADLINE: Duration = Duration::from_millis(50);
const TOTAL_DEADLINE: Duration = Duration::from_secs(2);

/// Bounded holding area for events awaiting a retry slot
const RETRY_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
enum StageError {
    #[error("{stage} stage exceeded its deadline")]
    Deadline { stage: &'static str },
    #[error("Cache write failed: {0}")]
    CacheWrite(String),
}

struct RetryItem {
    item: QueuedEvent,
    attempt: u32,
}

/// Shared collaborators threaded into every worker
pub struct PipelineContext {
    pub dedup: Arc<Deduplicator>,
    pub cache: Arc<BlockCache>,
    pub bus: Arc<EventBus>,
    pub sequencer: SharedSequencer,
    pub metrics: Option<Arc<RelayMetrics>>,
    pub retry_policy: RetryPolicy,
    breakers: HashMap<Chain, Arc<CircuitBreaker>>,
}

impl PipelineContext {
    pub fn new(
        dedup: Arc<Deduplicator>,
        cache: Arc<BlockCache>,
        bus: Arc<EventBus>,
        sequencer: SharedSequencer,
        circuit: &CircuitConfig,
        metrics: Option<Arc<RelayMetrics>>,
    ) -> Self {
        let breakers = Chain::ALL
            .iter()
            .map(|chain| {
                (
                    *chain,
                    Arc::new(CircuitBreaker::new(
                        format!("pipeline:{}", chain),
                        circuit.breaker_config(),
                    )),
                )
            })
            .collect();
        Self {
            dedup,
            cache,
            bus,
            sequencer,
            metrics,
            retry_policy: RetryPolicy::pipeline(),
            breakers,
        }
    }

    fn breaker(&self, chain: Chain) -> &Arc<CircuitBreaker> {
        // Chain::ALL seeds every variant, so the lookup cannot miss
        &self.breakers[&chain]
    }

    fn observe_stage(&self, chain: Chain, stage: &str, elapsed: Duration) {
        if let Some(metrics) = &self.metrics {
            metrics
                .pipeline_stage_duration_seconds
                .with_label_values(&[chain.as_str(), stage])
                .observe(elapsed.as_secs_f64());
        }
    }
}

/// Fixed pool of workers draining the ingestion queue.
///
/// Workers run the `validate -> enrich -> cache-write -> emit` pipeline,
/// with the post-validation stages wrapped in the chain's circuit breaker.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(ctx: Arc<PipelineContext>, consumer: Arc<QueueConsumer>, workers: usize) -> Self {
        let (retry_tx, retry_rx) = mpsc::channel::<RetryItem>(RETRY_QUEUE_CAPACITY);
        let retry_rx = Arc::new(tokio::sync::Mutex::new(retry_rx));

        let handles = (0..workers.max(1))
            .map(|worker_id| {
                let ctx = ctx.clone();
                let consumer = consumer.clone();
                let retry_tx = retry_tx.clone();
                let retry_rx = retry_rx.clone();
                tokio::spawn(async move {
                    worker_loop(worker_id, ctx, consumer, retry_tx, retry_rx).await;
                })
            })
            .collect();

        Self { handles }
    }

    /// Wait for the pool to finish draining; used on shutdown under the
    /// grace deadline
    pub async fn join(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    ctx: Arc<PipelineContext>,
    consumer: Arc<QueueConsumer>,
    retry_tx: mpsc::Sender<RetryItem>,
    retry_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<RetryItem>>>,
) {
    tracing::debug!(worker = worker_id, "Pipeline worker started");
    loop {
        // Retries jump the line so their emission tickets resolve quickly
        tokio::select! {
            biased;
            retry = async { retry_rx.lock().await.recv().await } => {
                match retry {
                    Some(retry) => process_event(&ctx, retry.item, retry.attempt, &retry_tx).await,
                    None => break,
                }
            }
            item = consumer.dequeue() => {
                match item {
                    Some(item) => process_event(&ctx, item, 0, &retry_tx).await,
                    None => break,
                }
            }
        }
    }
    tracing::debug!(worker = worker_id, "Pipeline worker drained and stopped");
}

async fn process_event(
    ctx: &Arc<PipelineContext>,
    queued: QueuedEvent,
    attempt: u32,
    retry_tx: &mpsc::Sender<RetryItem>,
) {
    let QueuedEvent { mut event, seq } = queued;
    let chain = event.chain;
    let started = Instant::now();

    // Advisory claim: a replay of the same hash admitted after TTL expiry
    // must not run concurrently with an in-flight predecessor
    let _work_guard = match ctx.dedup.try_begin_work(chain, &event.hash) {
        Some(guard) => guard,
        None => {
            if let Some(metrics) = &ctx.metrics {
                metrics
                    .duplicates_total
                    .with_label_values(&[chain.as_str()])
                    .inc();
            }
            ctx.sequencer.abandon(chain, seq, &ctx.bus);
            return;
        }
    };

    // Validate stage
    let validate_started = Instant::now();
    let validation = event.validate();
    let validate_elapsed = validate_started.elapsed();
    ctx.observe_stage(chain, "validate", validate_elapsed);
    if validate_elapsed > VALIDATE_DEADLINE {
        tracing::debug!(chain = %chain, elapsed_ms = validate_elapsed.as_millis() as u64, "Validate stage over deadline");
    }
    if let Err(err) = validation {
        let _ = event.advance_status(BlockStatus::Processing);
        let _ = event.advance_status(BlockStatus::Failed);
        tracing::warn!(
            chain = %chain,
            hash = %event.hash,
            source = %event.source_id,
            error = %err,
            "Event failed validation"
        );
        if let Some(metrics) = &ctx.metrics {
            metrics
                .validation_failures_total
                .with_label_values(&[chain.as_str(), validation_reason(&err)])
                .inc();
        }
        ctx.sequencer.abandon(chain, seq, &ctx.bus);
        return;
    }

    let _ = event.advance_status(BlockStatus::Processing);

    // enrich -> cache-write under the chain breaker and the total deadline
    let breaker = ctx.breaker(chain).clone();
    let remaining = TOTAL_DEADLINE.saturating_sub(started.elapsed());
    let staged = tokio::time::timeout(
        remaining,
        breaker.call(|| run_stages(ctx, &mut event)),
    )
    .await;

    let outcome = match staged {
        Ok(Ok(())) => Ok(()),
        Ok(Err(BreakerError::CircuitOpen)) => Err("circuit open".to_string()),
        Ok(Err(BreakerError::Inner(err))) => Err(err.to_string()),
        Err(_) => Err("total deadline exceeded".to_string()),
    };

    match outcome {
        Ok(()) => {
            let _ = event.advance_status(BlockStatus::Processed);
            if let Some(metrics) = &ctx.metrics {
                metrics
                    .blocks_emitted_total
                    .with_label_values(&[chain.as_str()])
                    .inc();
            }
            tracing::debug!(
                chain = %chain,
                hash = %event.hash,
                source = %event.source_id,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Block processed"
            );
            // Emit stage: hand to the sequencer, which publishes in
            // dedup-acceptance order
            ctx.sequencer.emit(chain, seq, event, &ctx.bus);
        }
        Err(reason) => {
            if ctx.retry_policy.should_retry(attempt + 1) {
                schedule_retry(ctx, QueuedEvent { event, seq }, attempt + 1, reason, retry_tx);
            } else {
                let _ = event.advance_status(BlockStatus::Failed);
                tracing::warn!(
                    chain = %chain,
                    hash = %event.hash,
                    attempts = attempt + 1,
                    reason = %reason,
                    "Event failed after retries"
                );
                if let Some(metrics) = &ctx.metrics {
                    metrics
                        .pipeline_failures_total
                        .with_label_values(&[chain.as_str()])
                        .inc();
                }
                ctx.sequencer.abandon(chain, seq, &ctx.bus);
            }
        }
    }
}

/// enrich then cache-write, each under its own soft deadline
async fn run_stages(ctx: &Arc<PipelineContext>, event: &mut BlockEvent) -> Result<(), StageError> {
    let chain = event.chain;

    let enrich_started = Instant::now();
    tokio::time::timeout(ENRICH_DEADLINE, enrich(event))
        .await
        .map_err(|_| StageError::Deadline { stage: "enrich" })?;
    ctx.observe_stage(chain, "enrich", enrich_started.elapsed());

    let write_started = Instant::now();
    tokio::time::timeout(CACHE_WRITE_DEADLINE, async {
        ctx.cache
            .insert_block(event)
            .map_err(|e| StageError::CacheWrite(e.to_string()))
    })
    .await
    .map_err(|_| StageError::Deadline { stage: "cache-write" })??;
    ctx.observe_stage(chain, "cache_write", write_started.elapsed());

    Ok(())
}

/// Fill in what admission could not know. Header-only events keep their
/// flag: the full block refreshes the cache when it arrives, it is not
/// re-emitted.
async fn enrich(event: &mut BlockEvent) {
    if event.size_bytes.is_none() && !event.is_header_only {
        let estimate = serde_json::to_vec(event).map(|v| v.len() as u64).unwrap_or(0);
        event.size_bytes = Some(estimate);
    }
}

fn schedule_retry(
    ctx: &Arc<PipelineContext>,
    item: QueuedEvent,
    attempt: u32,
    reason: String,
    retry_tx: &mpsc::Sender<RetryItem>,
) {
    let chain = item.event.chain;
    let delay = ctx.retry_policy.delay_for(attempt - 1);
    tracing::debug!(
        chain = %chain,
        hash = %item.event.hash,
        attempt,
        delay_ms = delay.as_millis() as u64,
        reason = %reason,
        "Scheduling pipeline retry"
    );
    if let Some(metrics) = &ctx.metrics {
        metrics
            .pipeline_retries_total
            .with_label_values(&[chain.as_str()])
            .inc();
    }

    let retry_tx = retry_tx.clone();
    let ctx = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let seq = item.seq;
        if retry_tx.try_send(RetryItem { item, attempt }).is_err() {
            // Bounded boundary: drop and count, never block
            if let Some(metrics) = &ctx.metrics {
                metrics
                    .pipeline_failures_total
                    .with_label_values(&[chain.as_str()])
                    .inc();
            }
            tracing::warn!(chain = %chain, "Retry queue full; event dropped");
            ctx.sequencer.abandon(chain, seq, &ctx.bus);
        }
    });
}

fn validation_reason(err: &crate::services::event::ValidationError) -> &'static str {
    use crate::services::event::ValidationError::*;
    match err {
        EmptyHash => "empty_hash",
        HashLength { .. } => "hash_length",
        ClockSkew { .. } => "clock_skew",
        IllegalStatusTransition { .. } => "status_transition",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::relay_config::{CacheConfig, DedupConfig};
    use crate::services::emit::StreamItem;
    use crate::services::event::BlockHash;
    use crate::services::pipeline::ingest::Ingestor;
    use crate::services::pipeline::queue::ingestion_queue;
    use crate::services::pipeline::sequencer::EmissionSequencer;

    fn build_pipeline(
        queue_capacity: usize,
    ) -> (Ingestor, Arc<PipelineContext>, Arc<crate::services::pipeline::queue::QueueConsumer>) {
        let (queue, consumer) = ingestion_queue(queue_capacity, None);
        let dedup = Arc::new(Deduplicator::new(DedupConfig::default()));
        let cache = Arc::new(BlockCache::new(
            CacheConfig::default(),
            CircuitConfig::default(),
        ));
        let bus = Arc::new(EventBus::new(1024));
        let sequencer = Arc::new(EmissionSequencer::new());
        let ctx = Arc::new(PipelineContext::new(
            dedup.clone(),
            cache,
            bus.clone(),
            sequencer.clone(),
            &CircuitConfig::default(),
            None,
        ));
        let ingestor = Ingestor::new(queue, dedup, sequencer, bus, None);
        (ingestor, ctx, consumer)
    }

    fn event(byte: u8, height: u64) -> BlockEvent {
        BlockEvent::new(Chain::Ethereum, BlockHash::new(vec![byte; 32]), height, "src")
    }

    #[tokio::test]
    async fn test_happy_path_emits_processed_event() {
        let (ingestor, ctx, consumer) = build_pipeline(16);
        let mut stream = ctx.bus.subscribe(None);

        ingestor.submit(event(1, 100));
        let pool = WorkerPool::start(ctx.clone(), consumer, 2);

        match stream.next().await {
            Some(StreamItem::Event(e)) => {
                assert_eq!(e.height, 100);
                assert_eq!(e.status, BlockStatus::Processed);
            }
            _ => panic!("expected processed event"),
        }
        // Cache carries the block under both keys
        assert!(ctx
            .cache
            .get(&BlockCache::hash_key(Chain::Ethereum, &BlockHash::new(vec![1; 32])))
            .is_some());
        assert!(ctx
            .cache
            .get(&BlockCache::height_key(Chain::Ethereum, 100))
            .is_some());

        drop(ingestor);
        pool.join().await;
    }

    #[tokio::test]
    async fn test_paused_workers_then_fifo_drain() {
        let (ingestor, ctx, consumer) = build_pipeline(100);
        let mut stream = ctx.bus.subscribe(None);

        // Workers paused: fill beyond capacity
        let mut accepted = 0;
        let mut dropped = 0;
        for i in 0..150u32 {
            let mut hash = vec![0u8; 32];
            hash[0] = (i >> 8) as u8;
            hash[1] = (i & 0xff) as u8;
            let e = BlockEvent::new(Chain::Ethereum, BlockHash::new(hash), i as u64 + 1, "src");
            match ingestor.submit(e) {
                crate::services::event::EmitResult::Accepted => accepted += 1,
                crate::services::event::EmitResult::DroppedBackpressure => dropped += 1,
                other => panic!("unexpected result: {:?}", other),
            }
        }
        assert_eq!(accepted, 100);
        assert_eq!(dropped, 50);

        // Unpause: the 100 accepted drain in admission order
        let pool = WorkerPool::start(ctx.clone(), consumer, 4);
        let mut heights = Vec::new();
        for _ in 0..100 {
            match stream.next().await {
                Some(StreamItem::Event(e)) => heights.push(e.height),
                other => panic!("stream ended early: {:?}", other.is_some()),
            }
        }
        let mut sorted = heights.clone();
        sorted.sort_unstable();
        assert_eq!(heights, sorted, "emission order must match admission order");

        drop(ingestor);
        pool.join().await;
    }

    #[tokio::test]
    async fn test_validation_failure_not_emitted() {
        let (ingestor, ctx, consumer) = build_pipeline(16);
        let mut stream = ctx.bus.subscribe(None);

        // Clock-skew violation: block time 10 minutes ahead of detection
        let mut bad = event(7, 7);
        bad.timestamp = bad.detected_at + chrono::Duration::seconds(600);
        ingestor.submit(bad);
        ingestor.submit(event(8, 8));

        let pool = WorkerPool::start(ctx.clone(), consumer, 1);
        match stream.next().await {
            // The invalid event is skipped; the next valid one arrives
            Some(StreamItem::Event(e)) => assert_eq!(e.height, 8),
            _ => panic!("expected the valid event"),
        }

        drop(ingestor);
        pool.join().await;
    }

    #[tokio::test]
    async fn test_workers_drain_and_exit_on_close() {
        let (ingestor, ctx, consumer) = build_pipeline(16);
        for i in 0..5u8 {
            ingestor.submit(event(i, i as u64 + 1));
        }
        let pool = WorkerPool::start(ctx, consumer, 2);
        drop(ingestor);
        // join returns because the queue closed once producers dropped
        tokio::time::timeout(Duration::from_secs(5), pool.join())
            .await
            .expect("workers should drain and stop");
    }
}
