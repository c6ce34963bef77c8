//! Outbound write queue.
//!
//! The router hands finished points to a [`PointSink`] and moves on; a single
//! writer task drains the queue in batches. Each batch gets one write attempt.
//! A failed batch is logged, counted and dropped.

use crate::errors::{Error, Result};
use crate::metrics::{
    failure_kind, BATCH_SIZE, CHANNEL_FULL_TOTAL, POINTS_DROPPED_TOTAL, POINTS_ENQUEUED_TOTAL,
    STORE_FAILURES_TOTAL, WRITE_LATENCY_SECONDS,
};
use crate::model::Point;
use crate::store::TimeSeriesStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct PointSink {
    tx: mpsc::Sender<Point>,
}

/// Bounded queue between the router and the writer task.
pub fn channel(capacity: usize) -> (PointSink, mpsc::Receiver<Point>) {
    let (tx, rx) = mpsc::channel(capacity);
    (PointSink { tx }, rx)
}

impl PointSink {
    /// Queue a point for writing. Waits only when the queue is full.
    pub async fn enqueue(&self, point: Point) -> Result<()> {
        let measurement = point.measurement();
        debug!(
            measurement = measurement.as_str(),
            tags = ?point.tag_map(),
            fields = ?point.field_map(),
            "Queueing point"
        );

        match self.tx.try_send(point) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(point)) => {
                CHANNEL_FULL_TOTAL.inc();
                debug!("Write queue full, waiting for capacity");
                self.tx.send(point).await.map_err(|_| Error::ChannelSend)?;
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                error!("Write queue closed, cannot persist point");
                return Err(Error::ChannelSend);
            }
        }

        POINTS_ENQUEUED_TOTAL
            .with_label_values(&[measurement.as_str()])
            .inc();
        Ok(())
    }
}

pub async fn run_writer(
    mut rx: mpsc::Receiver<Point>,
    store: Arc<dyn TimeSeriesStore>,
    max_batch: usize,
    max_wait_ms: u64,
    write_timeout: Duration,
) {
    info!(
        "Starting writer with max_batch={}, max_wait_ms={}",
        max_batch, max_wait_ms
    );

    let mut buffer: Vec<Point> = Vec::with_capacity(max_batch);
    let mut ticker = interval(Duration::from_millis(max_wait_ms.max(1)));

    loop {
        tokio::select! {
            point = rx.recv() => {
                match point {
                    Some(p) => {
                        buffer.push(p);

                        if buffer.len() >= max_batch {
                            flush_batch(store.as_ref(), &mut buffer, write_timeout).await;
                        }
                    }
                    None => {
                        info!("Write queue closed, flushing remaining batch");
                        flush_batch(store.as_ref(), &mut buffer, write_timeout).await;
                        break;
                    }
                }
            }

            _ = ticker.tick() => {
                if !buffer.is_empty() {
                    flush_batch(store.as_ref(), &mut buffer, write_timeout).await;
                }
            }
        }
    }

    info!("Writer stopped");
}

async fn flush_batch(store: &dyn TimeSeriesStore, buffer: &mut Vec<Point>, write_timeout: Duration) {
    let batch_len = buffer.len();
    if batch_len == 0 {
        return;
    }

    debug!("Flushing batch of {} points", batch_len);
    BATCH_SIZE.set(batch_len as f64);

    let start = Instant::now();
    let outcome = match timeout(write_timeout, store.write_points(buffer.as_slice())).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout("store write")),
    };

    match outcome {
        Ok(()) => {
            let elapsed = start.elapsed().as_secs_f64();
            WRITE_LATENCY_SECONDS.observe(elapsed);
            debug!("Batch written in {:.3}s", elapsed);
        }
        Err(e) => {
            let transient = e.is_transient();
            STORE_FAILURES_TOTAL
                .with_label_values(&["write", failure_kind(transient)])
                .inc();
            POINTS_DROPPED_TOTAL.inc_by(batch_len as f64);
            if transient {
                warn!("Dropping {} points after transient write failure: {}", batch_len, e);
            } else {
                error!("Dropping {} points after write failure: {}", batch_len, e);
            }
        }
    }

    buffer.clear();
    BATCH_SIZE.set(0.0);
}
