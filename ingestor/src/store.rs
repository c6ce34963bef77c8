use crate::errors::{Error, Result};
use crate::model::{Field, Fields, Measurement, Point};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use std::time::Duration;
use tracing::{debug, info};

/// Time-series persistence: point writes and a single last-value query.
#[async_trait]
pub trait TimeSeriesStore: Send + Sync {
    async fn write_points(&self, points: &[Point]) -> Result<()>;

    /// Most recent non-null `field` of `measurement` across every device and tag set.
    async fn last_value(&self, measurement: Measurement, field: Field) -> Result<Option<i64>>;
}

pub async fn make_pool(database_url: &str) -> Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;

    info!("Database connection established");
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations completed");

    Ok(pool)
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TimeSeriesStore for PgStore {
    async fn write_points(&self, points: &[Point]) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for measurement in [Measurement::Readings, Measurement::Errors, Measurement::StillHeres] {
            let group: Vec<&Point> = points
                .iter()
                .filter(|p| p.measurement() == measurement)
                .collect();
            if group.is_empty() {
                continue;
            }

            debug!("Inserting {} points into {}", group.len(), measurement.as_str());
            match measurement {
                Measurement::Readings => insert_readings(&mut tx, &group).await?,
                Measurement::Errors | Measurement::StillHeres => {
                    insert_power_only(&mut tx, measurement, &group).await?
                }
            }
        }
        tx.commit().await?;

        Ok(())
    }

    async fn last_value(&self, measurement: Measurement, field: Field) -> Result<Option<i64>> {
        if !measurement.has_field(field) {
            return Err(Error::UnknownField {
                measurement: measurement.as_str(),
                field: field.as_str(),
            });
        }

        // Not filtered by device: the newest value from any device wins.
        let query = format!(
            "SELECT {field} FROM {table} WHERE {field} IS NOT NULL ORDER BY ts DESC LIMIT 1",
            field = field.as_str(),
            table = measurement.as_str(),
        );

        let value = sqlx::query_scalar::<_, i64>(&query)
            .fetch_optional(&self.pool)
            .await?;

        Ok(value)
    }
}

struct TagColumns {
    timestamps: Vec<DateTime<Utc>>,
    devices: Vec<String>,
    types: Vec<i32>,
    display_types: Vec<&'static str>,
}

impl TagColumns {
    fn from_points(points: &[&Point]) -> Self {
        Self {
            timestamps: points.iter().map(|p| p.timestamp).collect(),
            devices: points.iter().map(|p| p.tags.device.clone()).collect(),
            types: points.iter().map(|p| p.tags.payload_type).collect(),
            display_types: points.iter().map(|p| p.tags.display_type.as_str()).collect(),
        }
    }
}

async fn insert_readings(tx: &mut Transaction<'_, Postgres>, points: &[&Point]) -> Result<()> {
    let tags = TagColumns::from_points(points);
    let mut readings = Vec::with_capacity(points.len());
    let mut powers = Vec::with_capacity(points.len());
    let mut diff_vals: Vec<Option<i64>> = Vec::with_capacity(points.len());
    let mut diff_pcts: Vec<Option<i64>> = Vec::with_capacity(points.len());

    for point in points {
        if let Fields::Reading {
            reading,
            power,
            difference,
        } = point.fields
        {
            readings.push(reading);
            powers.push(power);
            diff_vals.push(difference.map(|d| d.val));
            diff_pcts.push(difference.map(|d| d.pct));
        }
    }

    let query = r#"
        INSERT INTO readings (ts, device, "type", display_type, reading, power, prev_difference_val, prev_difference_pct)
        SELECT * FROM UNNEST($1::timestamptz[], $2::text[], $3::int4[], $4::text[], $5::int8[], $6::int8[], $7::int8[], $8::int8[])
        "#;

    sqlx::query(query)
        .bind(&tags.timestamps)
        .bind(&tags.devices)
        .bind(&tags.types)
        .bind(&tags.display_types)
        .bind(&readings)
        .bind(&powers)
        .bind(&diff_vals)
        .bind(&diff_pcts)
        .execute(&mut **tx)
        .await?;

    Ok(())
}

async fn insert_power_only(
    tx: &mut Transaction<'_, Postgres>,
    measurement: Measurement,
    points: &[&Point],
) -> Result<()> {
    let tags = TagColumns::from_points(points);
    let powers: Vec<i64> = points
        .iter()
        .filter_map(|p| match p.fields {
            Fields::Error { power } | Fields::StillHere { power } => Some(power),
            Fields::Reading { .. } => None,
        })
        .collect();

    let query = format!(
        r#"
        INSERT INTO {} (ts, device, "type", display_type, power)
        SELECT * FROM UNNEST($1::timestamptz[], $2::text[], $3::int4[], $4::text[], $5::int8[])
        "#,
        measurement.as_str()
    );

    sqlx::query(&query)
        .bind(&tags.timestamps)
        .bind(&tags.devices)
        .bind(&tags.types)
        .bind(&tags.display_types)
        .bind(&powers)
        .execute(&mut **tx)
        .await?;

    Ok(())
}

#[cfg(test)]
pub(crate) mod fakes {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// In-memory store that records writes and answers `last_value` from a
    /// preset history. Each call can be made to fail or stall.
    #[derive(Default)]
    pub struct RecordingStore {
        pub points: Mutex<Vec<Point>>,
        pub history: Mutex<Option<i64>>,
        pub fail_writes: AtomicBool,
        pub fail_queries: AtomicBool,
        pub write_delay: Option<Duration>,
        pub query_delay: Option<Duration>,
        pub write_calls: AtomicUsize,
        pub query_calls: AtomicUsize,
    }

    impl RecordingStore {
        pub fn with_history(value: i64) -> Self {
            let store = Self::default();
            *store.history.lock().unwrap() = Some(value);
            store
        }

        pub fn points(&self) -> Vec<Point> {
            self.points.lock().unwrap().clone()
        }

        pub fn calls(&self) -> usize {
            self.write_calls.load(Ordering::SeqCst) + self.query_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TimeSeriesStore for RecordingStore {
        async fn write_points(&self, points: &[Point]) -> Result<()> {
            self.write_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.write_delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(Error::Database(sqlx::Error::PoolTimedOut));
            }
            self.points.lock().unwrap().extend_from_slice(points);
            Ok(())
        }

        async fn last_value(&self, measurement: Measurement, field: Field) -> Result<Option<i64>> {
            self.query_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.query_delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_queries.load(Ordering::SeqCst) {
                return Err(Error::Database(sqlx::Error::PoolClosed));
            }
            if !measurement.has_field(field) {
                return Err(Error::UnknownField {
                    measurement: measurement.as_str(),
                    field: field.as_str(),
                });
            }
            Ok(*self.history.lock().unwrap())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Difference, DisplayType, Tags};

    fn point(device: &str, fields: Fields) -> Point {
        let (payload_type, display_type) = match fields {
            Fields::Reading { .. } => (1, DisplayType::Reading),
            Fields::Error { .. } => (3, DisplayType::MicrocontrollerError),
            Fields::StillHere { .. } => (0, DisplayType::StillHere),
        };
        Point::now(
            Tags {
                device: device.to_string(),
                payload_type,
                display_type,
            },
            fields,
        )
    }

    #[test]
    fn test_tag_columns() {
        let a = point("dev-1", Fields::Error { power: 10 });
        let b = point("dev-2", Fields::StillHere { power: 20 });
        let columns = TagColumns::from_points(&[&a, &b]);

        assert_eq!(columns.devices, vec!["dev-1", "dev-2"]);
        assert_eq!(columns.types, vec![3, 0]);
        assert_eq!(columns.display_types, vec!["Microcontroller Error", "Still Here"]);
        assert_eq!(columns.timestamps.len(), 2);
    }

    #[tokio::test]
    async fn test_pg_store_write_and_last_value() {
        // Requires a running Postgres; skipped otherwise
        let Ok(url) = std::env::var("DATABASE_URL") else {
            return;
        };

        let store = PgStore::new(make_pool(&url).await.unwrap());
        let points = vec![
            point(
                "store-test-dev",
                Fields::Reading {
                    reading: 1234,
                    power: 50,
                    difference: Some(Difference::zero()),
                },
            ),
            point("store-test-dev", Fields::Error { power: 40 }),
            point("store-test-dev", Fields::StillHere { power: 30 }),
        ];

        store.write_points(&points).await.unwrap();

        let last = store
            .last_value(Measurement::Readings, Field::Reading)
            .await
            .unwrap();
        assert_eq!(last, Some(1234));
        assert!(matches!(
            store.last_value(Measurement::Errors, Field::Reading).await,
            Err(Error::UnknownField { .. })
        ));
    }
}
