use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

/// Central metrics registry for the relay.
///
/// Built once in `main` and injected into the components that record into
/// it; nothing here is a global.
pub struct RelayMetrics {
    registry: Registry,

    // Ingest metrics
    pub blocks_ingested_total: CounterVec,
    pub blocks_emitted_total: CounterVec,
    pub duplicates_total: CounterVec,
    pub dropped_backpressure_total: CounterVec,
    pub validation_failures_total: CounterVec,
    pub header_only_events_total: CounterVec,

    // Pipeline metrics
    pub queue_depth: Gauge,
    pub backpressure_active: Gauge,
    pub pipeline_stage_duration_seconds: HistogramVec,
    pub pipeline_retries_total: CounterVec,
    pub pipeline_failures_total: CounterVec,

    // Endpoint metrics
    pub endpoint_health_score: GaugeVec,
    pub endpoint_healthy: GaugeVec,
    pub endpoint_requests_total: CounterVec,

    // Dedup metrics
    pub dedup_records: Gauge,
    pub dedup_evictions_total: CounterVec,
    pub dedup_adaptive_ttl_seconds: GaugeVec,
    pub dedup_duplicate_rate: GaugeVec,

    // Circuit breaker state (0=closed, 1=half-open, 2=open)
    pub circuit_breaker_state: GaugeVec,

    // Cache metrics
    pub cache_operations_total: CounterVec,
    pub cache_entries: Gauge,
    pub cache_bytes: Gauge,
    pub cache_evictions_total: CounterVec,
    pub cache_single_flight_joins_total: Gauge,

    // Subscriber metrics
    pub subscriber_lagged_total: CounterVec,
}

impl RelayMetrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let blocks_ingested_total = CounterVec::new(
            Opts::new("relay_blocks_ingested_total", "Block events accepted into the pipeline")
                .namespace("relay"),
            &["chain"],
        )?;
        registry.register(Box::new(blocks_ingested_total.clone()))?;

        let blocks_emitted_total = CounterVec::new(
            Opts::new("relay_blocks_emitted_total", "Block events emitted downstream")
                .namespace("relay"),
            &["chain"],
        )?;
        registry.register(Box::new(blocks_emitted_total.clone()))?;

        let duplicates_total = CounterVec::new(
            Opts::new("relay_duplicates_total", "Block events suppressed as duplicates")
                .namespace("relay"),
            &["chain"],
        )?;
        registry.register(Box::new(duplicates_total.clone()))?;

        let dropped_backpressure_total = CounterVec::new(
            Opts::new("relay_dropped_backpressure_total", "Events dropped at the full ingest queue")
                .namespace("relay"),
            &["chain"],
        )?;
        registry.register(Box::new(dropped_backpressure_total.clone()))?;

        let validation_failures_total = CounterVec::new(
            Opts::new("relay_validation_failures_total", "Events rejected by validation")
                .namespace("relay"),
            &["chain", "reason"],
        )?;
        registry.register(Box::new(validation_failures_total.clone()))?;

        let header_only_events_total = CounterVec::new(
            Opts::new("relay_header_only_events_total", "Header-first fast path announcements")
                .namespace("relay"),
            &["chain"],
        )?;
        registry.register(Box::new(header_only_events_total.clone()))?;

        let queue_depth = Gauge::new("relay_queue_depth", "Current ingestion queue length")?;
        registry.register(Box::new(queue_depth.clone()))?;

        let backpressure_active = Gauge::new(
            "relay_backpressure_active",
            "1 while the ingest queue is above its high watermark",
        )?;
        registry.register(Box::new(backpressure_active.clone()))?;

        let pipeline_stage_duration_seconds = HistogramVec::new(
            HistogramOpts::new("relay_pipeline_stage_duration_seconds", "Worker stage duration")
                .namespace("relay")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0]),
            &["chain", "stage"],
        )?;
        registry.register(Box::new(pipeline_stage_duration_seconds.clone()))?;

        let pipeline_retries_total = CounterVec::new(
            Opts::new("relay_pipeline_retries_total", "Events re-queued after a failed attempt")
                .namespace("relay"),
            &["chain"],
        )?;
        registry.register(Box::new(pipeline_retries_total.clone()))?;

        let pipeline_failures_total = CounterVec::new(
            Opts::new("relay_pipeline_failures_total", "Events that exhausted processing attempts")
                .namespace("relay"),
            &["chain"],
        )?;
        registry.register(Box::new(pipeline_failures_total.clone()))?;

        let endpoint_health_score = GaugeVec::new(
            Opts::new("relay_endpoint_health_score", "Endpoint selection score")
                .namespace("relay"),
            &["chain", "endpoint"],
        )?;
        registry.register(Box::new(endpoint_health_score.clone()))?;

        let endpoint_healthy = GaugeVec::new(
            Opts::new("relay_endpoint_healthy", "1 when the endpoint is healthy")
                .namespace("relay"),
            &["chain", "endpoint"],
        )?;
        registry.register(Box::new(endpoint_healthy.clone()))?;

        let endpoint_requests_total = CounterVec::new(
            Opts::new("relay_endpoint_requests_total", "Upstream request outcomes")
                .namespace("relay"),
            &["chain", "endpoint", "status"],
        )?;
        registry.register(Box::new(endpoint_requests_total.clone()))?;

        let dedup_records = Gauge::new("relay_dedup_records", "Records in the dedup table")?;
        registry.register(Box::new(dedup_records.clone()))?;

        let dedup_evictions_total = CounterVec::new(
            Opts::new("relay_dedup_evictions_total", "Dedup records evicted")
                .namespace("relay"),
            &["reason"],
        )?;
        registry.register(Box::new(dedup_evictions_total.clone()))?;

        let dedup_adaptive_ttl_seconds = GaugeVec::new(
            Opts::new("relay_dedup_adaptive_ttl_seconds", "Current adaptive retention window")
                .namespace("relay"),
            &["chain"],
        )?;
        registry.register(Box::new(dedup_adaptive_ttl_seconds.clone()))?;

        let dedup_duplicate_rate = GaugeVec::new(
            Opts::new("relay_dedup_duplicate_rate", "Observed duplicate rate per chain")
                .namespace("relay"),
            &["chain"],
        )?;
        registry.register(Box::new(dedup_duplicate_rate.clone()))?;

        let circuit_breaker_state = GaugeVec::new(
            Opts::new(
                "relay_circuit_breaker_state",
                "Circuit breaker state (0=closed, 1=half-open, 2=open)",
            )
            .namespace("relay"),
            &["breaker"],
        )?;
        registry.register(Box::new(circuit_breaker_state.clone()))?;

        let cache_operations_total = CounterVec::new(
            Opts::new("relay_cache_operations_total", "Block cache operations")
                .namespace("relay"),
            &["operation", "result"],
        )?;
        registry.register(Box::new(cache_operations_total.clone()))?;

        let cache_entries = Gauge::new("relay_cache_entries", "Entries in the block cache")?;
        registry.register(Box::new(cache_entries.clone()))?;

        let cache_bytes = Gauge::new("relay_cache_bytes", "Bytes held by the block cache")?;
        registry.register(Box::new(cache_bytes.clone()))?;

        let cache_evictions_total = CounterVec::new(
            Opts::new("relay_cache_evictions_total", "Block cache evictions")
                .namespace("relay"),
            &["reason"],
        )?;
        registry.register(Box::new(cache_evictions_total.clone()))?;

        let cache_single_flight_joins_total = Gauge::new(
            "relay_cache_single_flight_joins_total",
            "Callers that joined an in-flight cache fill",
        )?;
        registry.register(Box::new(cache_single_flight_joins_total.clone()))?;

        let subscriber_lagged_total = CounterVec::new(
            Opts::new("relay_subscriber_lagged_total", "Events dropped on slow subscriber buffers")
                .namespace("relay"),
            &["chain_filter"],
        )?;
        registry.register(Box::new(subscriber_lagged_total.clone()))?;

        Ok(Arc::new(Self {
            registry,
            blocks_ingested_total,
            blocks_emitted_total,
            duplicates_total,
            dropped_backpressure_total,
            validation_failures_total,
            header_only_events_total,
            queue_depth,
            backpressure_active,
            pipeline_stage_duration_seconds,
            pipeline_retries_total,
            pipeline_failures_total,
            endpoint_health_score,
            endpoint_healthy,
            endpoint_requests_total,
            dedup_records,
            dedup_evictions_total,
            dedup_adaptive_ttl_seconds,
            dedup_duplicate_rate,
            circuit_breaker_state,
            cache_operations_total,
            cache_entries,
            cache_bytes,
            cache_evictions_total,
            cache_single_flight_joins_total,
            subscriber_lagged_total,
        }))
    }

    /// Export metrics in Prometheus text format
    pub fn export(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
