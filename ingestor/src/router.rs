//! Uplink routing and reading differences.
//!
//! Each validated uplink is authorized, sorted into the reading, error or
//! heartbeat path, and turned into exactly one point (or none for a skipped
//! heartbeat). Reading uplinks also carry the difference against the previous
//! reading, looked up in this order:
//!
//! 1. the last-value cache entry for the device
//! 2. the newest reading in the store, from any device
//! 3. zero
//!
//! The cache is updated with the new reading after the point is queued, so the
//! lookup always sees the previous value. A per-device lock spans the whole
//! read, queue, write sequence.

use crate::cache::{last_reading_key, LastValueCache};
use crate::codec::Rejection;
use crate::config::HeartbeatPolicy;
use crate::errors::{Error, Result};
use crate::metrics::{
    failure_kind, CACHE_FAILURES_TOTAL, DIFFERENCE_SOURCE_TOTAL, HEARTBEATS_SKIPPED_TOTAL,
    STORE_FAILURES_TOTAL, UNAUTHORIZED_TOTAL,
};
use crate::model::{Category, Difference, Field, Fields, Measurement, Point, Tags, ValidatedReport};
use crate::registry::DeviceRegistry;
use crate::store::TimeSeriesStore;
use crate::writer::PointSink;
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Where the previous reading used for a difference came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DifferenceSource {
    Cache,
    Store,
    Zero,
}

impl DifferenceSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DifferenceSource::Cache => "cache",
            DifferenceSource::Store => "store",
            DifferenceSource::Zero => "zero",
        }
    }
}

/// What the router did with an uplink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Unauthorized,
    Reading {
        difference: Difference,
        source: DifferenceSource,
    },
    Error,
    StillHere,
    RepeatedReading {
        reading: i64,
    },
    HeartbeatSkipped,
}

pub struct Router {
    registry: Arc<dyn DeviceRegistry>,
    cache: Arc<dyn LastValueCache>,
    store: Arc<dyn TimeSeriesStore>,
    sink: PointSink,
    heartbeat_policy: HeartbeatPolicy,
    op_timeout: Duration,
    device_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Router {
    pub fn new(
        registry: Arc<dyn DeviceRegistry>,
        cache: Arc<dyn LastValueCache>,
        store: Arc<dyn TimeSeriesStore>,
        sink: PointSink,
        heartbeat_policy: HeartbeatPolicy,
        op_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            cache,
            store,
            sink,
            heartbeat_policy,
            op_timeout,
            device_locks: DashMap::new(),
        }
    }

    /// Route one validated uplink. Store and cache failures are absorbed;
    /// only a closed write queue is returned as an error.
    pub async fn on_uplink(&self, device_id: &str, report: ValidatedReport) -> Result<Route> {
        if !self.registry.is_authorized(device_id) {
            UNAUTHORIZED_TOTAL.inc();
            debug!(device = device_id, "Dropping uplink from unauthorized device");
            return Ok(Route::Unauthorized);
        }

        let tags = Tags {
            device: device_id.to_string(),
            payload_type: report.payload_type(),
            display_type: report.display_type(),
        };

        match report.display_type().category() {
            Category::Reading => self.handle_reading(tags, report).await,
            Category::Error => self.handle_error(tags, report).await,
            Category::Heartbeat => self.handle_heartbeat(tags, report).await,
        }
    }

    async fn handle_reading(&self, tags: Tags, report: ValidatedReport) -> Result<Route> {
        let reading = report
            .reading()
            .map(i64::from)
            .ok_or(Error::Rejected(Rejection::MissingReading))?;
        let key = last_reading_key(&tags.device);

        let lock = self.device_lock(&tags.device);
        let _guard = lock.lock().await;

        let cached = self.cached_reading(&key).await;
        let (difference, source) = match difference_from(cached, reading, DifferenceSource::Cache) {
            Some(difference) => (difference, DifferenceSource::Cache),
            None => {
                let stored = self.stored_reading().await;
                match difference_from(stored, reading, DifferenceSource::Store) {
                    Some(difference) => (difference, DifferenceSource::Store),
                    None => (Difference::zero(), DifferenceSource::Zero),
                }
            }
        };
        DIFFERENCE_SOURCE_TOTAL
            .with_label_values(&[source.as_str()])
            .inc();

        debug!(
            device = %tags.device,
            reading,
            difference = difference.val,
            source = source.as_str(),
            "Routing reading"
        );

        let point = Point::now(
            tags,
            Fields::Reading {
                reading,
                power: i64::from(report.power()),
                difference: Some(difference),
            },
        );
        let enqueued = self.sink.enqueue(point).await;

        // Updated even if the point could not be queued
        self.remember_reading(&key, reading).await;

        enqueued?;
        Ok(Route::Reading { difference, source })
    }

    async fn handle_error(&self, tags: Tags, report: ValidatedReport) -> Result<Route> {
        info!(device = %tags.device, display_type = %tags.display_type, "Device reported an error");

        let point = Point::now(
            tags,
            Fields::Error {
                power: i64::from(report.power()),
            },
        );
        self.sink.enqueue(point).await?;

        Ok(Route::Error)
    }

    async fn handle_heartbeat(&self, tags: Tags, report: ValidatedReport) -> Result<Route> {
        let power = i64::from(report.power());

        match self.heartbeat_policy {
            HeartbeatPolicy::StillHere => {
                self.sink
                    .enqueue(Point::now(tags, Fields::StillHere { power }))
                    .await?;
                Ok(Route::StillHere)
            }
            HeartbeatPolicy::RepeatLastReading => {
                let key = last_reading_key(&tags.device);
                let lock = self.device_lock(&tags.device);
                let _guard = lock.lock().await;

                let Some(reading) = self.cached_reading(&key).await else {
                    HEARTBEATS_SKIPPED_TOTAL.inc();
                    info!(device = %tags.device, "No cached reading, skipping heartbeat");
                    return Ok(Route::HeartbeatSkipped);
                };

                let point = Point::now(
                    tags,
                    Fields::Reading {
                        reading,
                        power,
                        difference: None,
                    },
                );
                self.sink.enqueue(point).await?;

                Ok(Route::RepeatedReading { reading })
            }
        }
    }

    fn device_lock(&self, device_id: &str) -> Arc<Mutex<()>> {
        self.device_locks
            .entry(device_id.to_string())
            .or_default()
            .clone()
    }

    async fn cached_reading(&self, key: &str) -> Option<i64> {
        match self.bounded("cache get", self.cache.get(key)).await {
            Ok(Some(value)) => match value.parse::<i64>() {
                Ok(previous) => Some(previous),
                Err(e) => {
                    warn!(key, value = %value, "Ignoring unparsable cached reading: {}", e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                record_failure(&CACHE_FAILURES_TOTAL, "get", &e);
                warn!(key, "Cache lookup failed, falling back to store: {}", e);
                None
            }
        }
    }

    async fn stored_reading(&self) -> Option<i64> {
        // Device-unscoped on purpose until the intended scope is confirmed
        let query = self.store.last_value(Measurement::Readings, Field::Reading);
        match self.bounded("store last value", query).await {
            Ok(value) => value,
            Err(e) => {
                record_failure(&STORE_FAILURES_TOTAL, "last_value", &e);
                warn!("Last value query failed, using zero difference: {}", e);
                None
            }
        }
    }

    async fn remember_reading(&self, key: &str, reading: i64) {
        if let Err(e) = self
            .bounded("cache set", self.cache.set(key, reading.to_string()))
            .await
        {
            record_failure(&CACHE_FAILURES_TOTAL, "set", &e);
            warn!(key, reading, "Failed to update last reading: {}", e);
        }
    }

    async fn bounded<T, F>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match timeout(self.op_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(operation)),
        }
    }
}

/// Difference against a looked-up previous reading. An unusable previous
/// value counts as a miss so the next source is tried.
fn difference_from(
    previous: Option<i64>,
    reading: i64,
    source: DifferenceSource,
) -> Option<Difference> {
    let previous = previous?;
    let difference = Difference::between(previous, reading);
    if difference.is_none() {
        warn!(
            previous,
            reading,
            source = source.as_str(),
            "Ignoring previous reading that overflows the difference"
        );
    }
    difference
}

fn record_failure(counter: &prometheus::CounterVec, operation: &str, error: &Error) {
    counter
        .with_label_values(&[operation, failure_kind(error.is_transient())])
        .inc();
}
