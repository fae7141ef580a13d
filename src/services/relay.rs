use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::relay_config::RelayConfig;
use crate::services::adapter::{
    AdapterContext, BitcoinAdapter, ChainAdapter, EthereumAdapter, SolanaAdapter,
};
use crate::services::cache::{BlockCache, BlockFetcher};
use crate::services::dedup::Deduplicator;
use crate::services::emit::{BlockStream, EventBus, DEFAULT_SUBSCRIBER_BUFFER};
use crate::services::endpoint::{ConnectionManager, EndpointRegistry, HealthChecker};
use crate::services::event::Chain;
use crate::services::metrics::RelayMetrics;
use crate::services::persist::StateStore;
use crate::services::pipeline::{
    ingestion_queue, EmissionSequencer, Ingestor, PipelineContext, QueueConsumer, WorkerPool,
};

/// How long startup waits for every requested chain to show one healthy
/// endpoint before giving up with exit code 2
const STARTUP_GRACE: Duration = Duration::from_secs(60);
const STARTUP_RECHECK: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("No healthy endpoints for chain {0} after startup grace")]
    NoHealthyEndpoints(Chain),
    #[error("Relay already shut down")]
    AlreadyStopped,
}

struct RelayRuntime {
    started: bool,
    ingestor: Option<Ingestor>,
    consumer: Option<Arc<QueueConsumer>>,
    workers: Option<WorkerPool>,
    tasks: Vec<JoinHandle<()>>,
}

/// Owns the component lifecycle.
///
/// Startup order: registry and health checker first, then cache, deduper,
/// workers, adapters. Shutdown reverses it: adapters stop accepting events,
/// the queue drains under a grace deadline, workers finish, the cache
/// flushes metrics, then everything else exits.
pub struct Relay {
    config: RelayConfig,
    metrics: Arc<RelayMetrics>,
    pub manager: Arc<ConnectionManager>,
    pub dedup: Arc<Deduplicator>,
    pub cache: Arc<BlockCache>,
    bus: Arc<EventBus>,
    pipeline: Arc<PipelineContext>,
    worker_count: usize,
    shutdown_tx: broadcast::Sender<()>,
    state_store: Option<StateStore>,
    startup_grace: Duration,
    runtime: tokio::sync::Mutex<RelayRuntime>,
    stopped: AtomicBool,
}

impl Relay {
    pub fn new(
        mut config: RelayConfig,
        metrics: Arc<RelayMetrics>,
        state_store: Option<StateStore>,
    ) -> Self {
        // Tier supplies capacity defaults unless the config pinned them
        if config.cache.max_entries.is_none() {
            config.cache.max_entries = Some(config.tier.cache_max_entries());
        }
        if config.dedup.max_size.is_none() {
            config.dedup.max_size = Some(config.tier.dedup_max_size());
        }
        let registry = Arc::new(EndpointRegistry::from_config(&config));
        let manager = Arc::new(
            ConnectionManager::new(registry, config.health.clone())
                .with_relay_metrics(metrics.clone()),
        );
        let dedup = Arc::new(Deduplicator::new(config.dedup.clone()).with_metrics(metrics.clone()));
        let cache = Arc::new(
            BlockCache::new(config.cache.clone(), config.circuit.clone())
                .with_metrics(metrics.clone()),
        );
        let bus = Arc::new(EventBus::new(DEFAULT_SUBSCRIBER_BUFFER).with_metrics(metrics.clone()));
        let sequencer = Arc::new(EmissionSequencer::new());
        let (shutdown_tx, _) = broadcast::channel(8);

        let (queue, consumer) = ingestion_queue(config.max_queue_depth(), Some(metrics.clone()));
        let ingestor = Ingestor::new(
            queue,
            dedup.clone(),
            sequencer.clone(),
            bus.clone(),
            Some(metrics.clone()),
        );

        let workers = config.worker_count();
        let pipeline_ctx = Arc::new(PipelineContext::new(
            dedup.clone(),
            cache.clone(),
            bus.clone(),
            sequencer,
            &config.circuit,
            Some(metrics.clone()),
        ));

        Self {
            runtime: tokio::sync::Mutex::new(RelayRuntime {
                started: false,
                ingestor: Some(ingestor),
                consumer: Some(consumer),
                workers: None,
                tasks: Vec::new(),
            }),
            pipeline: pipeline_ctx,
            worker_count: workers,
            config,
            metrics,
            manager,
            dedup,
            cache,
            bus,
            shutdown_tx,
            state_store,
            startup_grace: STARTUP_GRACE,
            stopped: AtomicBool::new(false),
        }
    }

    /// Override the startup health grace; used by tests
    pub fn with_startup_grace(mut self, grace: Duration) -> Self {
        self.startup_grace = grace;
        self
    }

    /// Bring the relay up. Fails when any requested chain still has no
    /// healthy endpoint after the startup grace.
    pub async fn start(&self) -> Result<(), StartupError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(StartupError::AlreadyStopped);
        }
        let mut runtime = self.runtime.lock().await;
        if runtime.started {
            return Ok(());
        }

        // Health checker first: everything downstream selects through it
        let checker = Arc::new(HealthChecker::new(
            self.manager.clone(),
            self.config.health.clone(),
        ));
        runtime.tasks.push(tokio::spawn(
            checker.clone().run(self.shutdown_tx.subscribe()),
        ));

        let gate_started = Instant::now();
        loop {
            checker.probe_all().await;
            let unhealthy_chain = self
                .config
                .chains
                .iter()
                .find(|chain| !self.manager.has_proven_endpoint(**chain));
            match unhealthy_chain {
                None => break,
                Some(chain) if gate_started.elapsed() > self.startup_grace => {
                    return Err(StartupError::NoHealthyEndpoints(*chain));
                }
                Some(chain) => {
                    tracing::warn!(chain = %chain, "Waiting for a healthy endpoint");
                    tokio::time::sleep(STARTUP_RECHECK).await;
                }
            }
        }

        if let Some(store) = &self.state_store {
            store.load_endpoint_state(&self.manager);
            store.load_processed(&self.dedup);
        }

        runtime.tasks.push(tokio::spawn(
            self.dedup.clone().run_sweeper(self.shutdown_tx.subscribe()),
        ));

        let consumer = runtime
            .consumer
            .take()
            .ok_or(StartupError::AlreadyStopped)?;
        runtime.workers = Some(WorkerPool::start(
            self.pipeline.clone(),
            consumer,
            self.worker_count,
        ));

        let ingestor = runtime
            .ingestor
            .clone()
            .ok_or(StartupError::AlreadyStopped)?;
        for chain in &self.config.chains {
            let adapter = self.adapter_for(*chain);
            let ctx = AdapterContext {
                manager: self.manager.clone(),
                ingestor: ingestor.clone(),
                shutdown: self.shutdown_tx.clone(),
            };
            tracing::info!(chain = %chain, adapter = adapter.name(), "Starting chain adapter");
            runtime.tasks.push(tokio::spawn(adapter.run(ctx)));
        }

        runtime.started = true;
        tracing::info!(
            chains = self.config.chains.len(),
            workers = self.worker_count,
            queue_depth = self.config.max_queue_depth(),
            tier = ?self.config.tier,
            "Relay started"
        );
        Ok(())
    }

    fn adapter_for(&self, chain: Chain) -> Arc<dyn ChainAdapter> {
        match chain {
            Chain::Bitcoin => Arc::new(BitcoinAdapter::new(self.config.tier.max_peers())),
            Chain::Ethereum => Arc::new(EthereumAdapter::new()),
            Chain::Solana => Arc::new(SolanaAdapter::new()),
        }
    }

    /// Downstream subscription: events arrive in per-chain acceptance order,
    /// with lagged markers on slow consumers
    pub fn subscribe(&self, chain_filter: Option<Chain>) -> BlockStream {
        self.bus.subscribe(chain_filter)
    }

    pub fn metrics(&self) -> &Arc<RelayMetrics> {
        &self.metrics
    }

    /// Read-through block access for the serving layer
    pub fn fetcher(&self) -> BlockFetcher {
        BlockFetcher::new(self.cache.clone(), self.manager.clone())
    }

    /// Graceful, idempotent shutdown
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Relay shutting down");

        // Adapters stop accepting new events
        let _ = self.shutdown_tx.send(());

        let mut runtime = self.runtime.lock().await;
        // Drop our producer handle so the queue closes once adapters exit
        runtime.ingestor = None;

        if let Some(workers) = runtime.workers.take() {
            let grace = self.config.pipeline.shutdown_grace();
            if tokio::time::timeout(grace, workers.join()).await.is_err() {
                tracing::warn!(grace_secs = grace.as_secs(), "Queue drain exceeded grace; abandoning");
            }
        }

        self.dedup.close();
        if let Some(store) = &self.state_store {
            if let Err(err) = store.save_processed(&self.dedup) {
                tracing::warn!(error = %err, "Could not persist processed hashes");
            }
            if let Err(err) = store.save_endpoint_state(&self.manager) {
                tracing::warn!(error = %err, "Could not persist endpoint state");
            }
        }
        self.cache.flush_metrics();

        for task in runtime.tasks.drain(..) {
            task.abort();
        }
        tracing::info!("Relay stopped");
    }
}
