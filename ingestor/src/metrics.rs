use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_messages_total",
        "Total uplinks received from MQTT"
    ))
    .unwrap();
    pub static ref DECODE_ERRORS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_decode_errors_total",
        "Total uplinks dropped because the payload could not be decoded"
    ))
    .unwrap();
    pub static ref REJECTED_MESSAGES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            "ingestor_rejected_messages_total",
            "Total uplinks dropped by validation"
        ),
        &["reason"]
    )
    .unwrap();
    pub static ref UNAUTHORIZED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_unauthorized_total",
        "Total uplinks dropped from devices missing from the allowlist"
    ))
    .unwrap();
    pub static ref HEARTBEATS_SKIPPED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_heartbeats_skipped_total",
        "Total heartbeats not persisted because no last reading was cached"
    ))
    .unwrap();
    pub static ref POINTS_ENQUEUED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            "ingestor_points_enqueued_total",
            "Total points handed to the writer, by measurement"
        ),
        &["measurement"]
    )
    .unwrap();
    pub static ref DIFFERENCE_SOURCE_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            "ingestor_difference_source_total",
            "Where the previous reading for a difference came from"
        ),
        &["source"]
    )
    .unwrap();
    pub static ref STORE_FAILURES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            "ingestor_store_failures_total",
            "Total failed store operations"
        ),
        &["operation", "kind"]
    )
    .unwrap();
    pub static ref CACHE_FAILURES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            "ingestor_cache_failures_total",
            "Total failed cache operations"
        ),
        &["operation", "kind"]
    )
    .unwrap();
    pub static ref POINTS_DROPPED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_points_dropped_total",
        "Total points lost to failed writes"
    ))
    .unwrap();
    pub static ref WRITE_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "ingestor_write_latency_seconds",
            "Time taken to write a batch of points"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
    pub static ref BATCH_SIZE: Gauge = Gauge::with_opts(Opts::new(
        "ingestor_batch_size",
        "Current batch size being processed"
    ))
    .unwrap();
    pub static ref CHANNEL_FULL_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_channel_full_total",
        "Total number of times the write queue was full (backpressure events)"
    ))
    .unwrap();
}

pub fn init_metrics() {
    REGISTRY.register(Box::new(MESSAGES_TOTAL.clone())).unwrap();
    REGISTRY
        .register(Box::new(DECODE_ERRORS_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(REJECTED_MESSAGES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(UNAUTHORIZED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(HEARTBEATS_SKIPPED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(POINTS_ENQUEUED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(DIFFERENCE_SOURCE_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(STORE_FAILURES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(CACHE_FAILURES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(POINTS_DROPPED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(WRITE_LATENCY_SECONDS.clone()))
        .unwrap();
    REGISTRY.register(Box::new(BATCH_SIZE.clone())).unwrap();
    REGISTRY
        .register(Box::new(CHANNEL_FULL_TOTAL.clone()))
        .unwrap();
}

/// Label value for failure counters.
pub fn failure_kind(transient: bool) -> &'static str {
    if transient {
        "transient"
    } else {
        "permanent"
    }
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}
