#![allow(dead_code)]

use std::sync::Arc;

use block_relay::config::{CacheConfig, CircuitConfig, DedupConfig};
use block_relay::services::cache::BlockCache;
use block_relay::services::dedup::Deduplicator;
use block_relay::services::emit::EventBus;
use block_relay::services::event::{BlockEvent, BlockHash, Chain};
use block_relay::services::pipeline::{
    ingestion_queue, EmissionSequencer, Ingestor, PipelineContext, QueueConsumer,
};

/// In-process pipeline harness: admission handle, worker context and the
/// queue consumer, with workers left unstarted so tests control draining.
pub struct PipelineHarness {
    pub ingestor: Ingestor,
    pub ctx: Arc<PipelineContext>,
    pub consumer: Arc<QueueConsumer>,
    pub bus: Arc<EventBus>,
    pub dedup: Arc<Deduplicator>,
    pub cache: Arc<BlockCache>,
}

pub fn pipeline_harness(queue_capacity: usize) -> PipelineHarness {
    let (queue, consumer) = ingestion_queue(queue_capacity, None);
    let dedup = Arc::new(Deduplicator::new(DedupConfig::default()));
    let cache = Arc::new(BlockCache::new(
        CacheConfig::default(),
        CircuitConfig::default(),
    ));
    let bus = Arc::new(EventBus::new(4096));
    let sequencer = Arc::new(EmissionSequencer::new());

    let ctx = Arc::new(PipelineContext::new(
        dedup.clone(),
        cache.clone(),
        bus.clone(),
        sequencer.clone(),
        &CircuitConfig::default(),
        None,
    ));
    let ingestor = Ingestor::new(queue, dedup.clone(), sequencer, bus.clone(), None);

    PipelineHarness {
        ingestor,
        ctx,
        consumer,
        bus,
        dedup,
        cache,
    }
}

/// Synthetic block event with a recognizable hash byte
pub fn block_event(chain: Chain, hash_byte: u8, height: u64, source: &str) -> BlockEvent {
    BlockEvent::new(chain, BlockHash::new(vec![hash_byte; 32]), height, source)
}

/// Unique 32-byte hash derived from an index
pub fn indexed_hash(index: u32) -> BlockHash {
    let mut bytes = vec![0u8; 32];
    bytes[0] = (index >> 24) as u8;
    bytes[1] = (index >> 16) as u8;
    bytes[2] = (index >> 8) as u8;
    bytes[3] = index as u8;
    BlockHash::new(bytes)
}
