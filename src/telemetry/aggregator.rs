//! Latency aggregator (C9): rolls up raw per-monitor latency samples
//! streamed by polling servers into fixed-width time buckets, on a timer
//! aligned to `resamplePeriod` boundaries.

use crate::customers::CustomerId;
use crate::database::{ConnectionMultiplexer, DatabaseError};
use parking_lot::RwLock;
use sqlx::Row;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Errors raised by the aggregator. Every tick logs and continues rather
/// than propagating: a failed tick must not take down the background
/// task, since the next tick retries the same work.
#[derive(Error, Debug)]
pub enum AggregatorError {
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Tunable aggregation parameters, reloadable at runtime via `configure`.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// How old a raw sample may get, in seconds, before it is rolled up.
    pub input_table_maximum_age: u64,
    /// Bucket width, in seconds, and the tick cadence.
    pub resample_period: u64,
    /// How long a rolled-up bucket is retained before being expunged.
    pub expunge_period: u64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            input_table_maximum_age: 300,
            resample_period: 60,
            expunge_period: 7 * 24 * 3600,
        }
    }
}

/// One raw latency sample as streamed by a polling server.
#[derive(Debug, Clone, Copy)]
pub struct RawSample {
    pub monitor_id: u32,
    pub server_id: u32,
    pub timestamp: u32,
    pub latency_microseconds: u32,
}

/// One rolled-up latency bucket as read back from `latency_aggregates`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregateBucket {
    pub monitor_id: u32,
    pub server_id: u32,
    pub bucket_start: u32,
    pub count: u64,
    pub mean: f64,
    pub variance_sum: f64,
    pub min: u32,
    pub max: u32,
}

/// A single-sample Welford accumulator: `count`, running `mean`, and the
/// running sum of squared deviations (`variance_sum`, i.e. M2).
#[derive(Debug, Clone, Copy)]
struct WelfordAccumulator {
    count: u64,
    mean: f64,
    variance_sum: f64,
    min: u32,
    max: u32,
}

impl WelfordAccumulator {
    fn singleton(value: u32) -> Self {
        Self {
            count: 1,
            mean: value as f64,
            variance_sum: 0.0,
            min: value,
            max: value,
        }
    }

    /// Parallel-variance combination of two independent accumulators.
    fn combine(self, other: Self) -> Self {
        if self.count == 0 {
            return other;
        }
        if other.count == 0 {
            return self;
        }

        let count = self.count + other.count;
        let delta = other.mean - self.mean;
        let mean = self.mean + delta * (other.count as f64 / count as f64);
        let variance_sum = self.variance_sum
            + other.variance_sum
            + delta * delta * (self.count as f64 * other.count as f64 / count as f64);

        Self {
            count,
            mean,
            variance_sum,
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }
}

/// A single merged summary across a range of buckets, for `/latency/statistics`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencySummary {
    pub count: u64,
    pub mean: f64,
    pub variance_sum: f64,
    pub min: u32,
    pub max: u32,
}

/// Merge a set of buckets (already returned by [`LatencyAggregator::query`])
/// into one summary via the same parallel-variance combine used by the
/// rollup pass. `None` if `buckets` is empty.
pub fn summarize(buckets: &[AggregateBucket]) -> Option<LatencySummary> {
    buckets
        .iter()
        .map(|bucket| WelfordAccumulator {
            count: bucket.count,
            mean: bucket.mean,
            variance_sum: bucket.variance_sum,
            min: bucket.min,
            max: bucket.max,
        })
        .reduce(WelfordAccumulator::combine)
        .map(|accumulator| LatencySummary {
            count: accumulator.count,
            mean: accumulator.mean,
            variance_sum: accumulator.variance_sum,
            min: accumulator.min,
            max: accumulator.max,
        })
}

fn now_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is after the epoch")
        .as_secs()
}

/// Seconds until the next `resample_period`-aligned wall-clock boundary.
pub fn seconds_to_next_interval(resample_period: u64, now: u64) -> u64 {
    if resample_period == 0 {
        return 0;
    }
    (resample_period - (now % resample_period)) % resample_period
}

/// Background latency rollup task, backed by `latency_raw` (input) and
/// `latency_aggregates` (output).
pub struct LatencyAggregator {
    mux: Arc<ConnectionMultiplexer>,
    config: RwLock<AggregatorConfig>,
}

impl LatencyAggregator {
    pub fn new(mux: Arc<ConnectionMultiplexer>, config: AggregatorConfig) -> Self {
        Self {
            mux,
            config: RwLock::new(config),
        }
    }

    pub fn configure(&self, config: AggregatorConfig) {
        *self.config.write() = config;
    }

    fn config(&self) -> AggregatorConfig {
        self.config.read().clone()
    }

    /// Record a batch of raw samples from a polling server. Each sample is
    /// stored as a singleton accumulator (`count = 1`); the rollup pass
    /// treats every input row the same way whether it started as a raw
    /// sample or as a previously-merged batch, so there is no separate
    /// "already aggregated" code path (see `DESIGN.md`).
    pub async fn record(&self, samples: &[RawSample], thread_id: u32) -> Result<(), AggregatorError> {
        if samples.is_empty() {
            return Ok(());
        }

        let mut handle = self.mux.acquire(thread_id).await?;
        let mut tx = sqlx::Connection::begin(handle.connection())
            .await
            .map_err(DatabaseError::from)?;

        for sample in samples {
            sqlx::query(
                "INSERT INTO latency_raw \
                 (monitor_id, server_id, timestamp, count, mean, variance_sum, min_latency, max_latency) \
                 VALUES (?, ?, ?, 1, ?, 0.0, ?, ?)",
            )
            .bind(sample.monitor_id as i64)
            .bind(sample.server_id as i64)
            .bind(sample.timestamp as i64)
            .bind(sample.latency_microseconds as f64)
            .bind(sample.latency_microseconds as i64)
            .bind(sample.latency_microseconds as i64)
            .execute(&mut *tx)
            .await
            .map_err(DatabaseError::from)?;
        }

        tx.commit().await.map_err(DatabaseError::from)?;
        handle.release().await?;
        Ok(())
    }

    /// Run one rollup pass: scan expired input rows, merge into output
    /// buckets, delete consumed input, expunge stale output.
    pub async fn run_once(&self, thread_id: u32) -> Result<(), AggregatorError> {
        let config = self.config();
        let now = now_seconds();
        let cutoff = now.saturating_sub(config.input_table_maximum_age);

        let mut handle = self.mux.acquire(thread_id).await?;

        let rows = sqlx::query(
            "SELECT rowid, monitor_id, server_id, timestamp, count, mean, variance_sum, min_latency, max_latency \
             FROM latency_raw WHERE timestamp < ?",
        )
        .bind(cutoff as i64)
        .fetch_all(handle.connection())
        .await
        .map_err(DatabaseError::from)?;

        if rows.is_empty() {
            handle.release().await?;
            self.expunge(thread_id, now, config.expunge_period).await?;
            return Ok(());
        }

        let mut buckets: HashMap<(u32, u32, u32), WelfordAccumulator> = HashMap::new();
        let mut consumed_rowids = Vec::with_capacity(rows.len());

        for row in &rows {
            let rowid: i64 = row.try_get("rowid").map_err(DatabaseError::from)?;
            let monitor_id: i64 = row.try_get("monitor_id").map_err(DatabaseError::from)?;
            let server_id: i64 = row.try_get("server_id").map_err(DatabaseError::from)?;
            let timestamp: i64 = row.try_get("timestamp").map_err(DatabaseError::from)?;
            let count: i64 = row.try_get("count").map_err(DatabaseError::from)?;
            let mean: f64 = row.try_get("mean").map_err(DatabaseError::from)?;
            let variance_sum: f64 = row.try_get("variance_sum").map_err(DatabaseError::from)?;
            let min_latency: i64 = row.try_get("min_latency").map_err(DatabaseError::from)?;
            let max_latency: i64 = row.try_get("max_latency").map_err(DatabaseError::from)?;

            let bucket_start = (timestamp as u64 / config.resample_period) * config.resample_period;
            let key = (monitor_id as u32, server_id as u32, bucket_start as u32);

            let sample_accumulator = WelfordAccumulator {
                count: count as u64,
                mean,
                variance_sum,
                min: min_latency as u32,
                max: max_latency as u32,
            };

            buckets
                .entry(key)
                .and_modify(|accumulator| *accumulator = accumulator.combine(sample_accumulator))
                .or_insert(sample_accumulator);

            consumed_rowids.push(rowid);
        }

        for ((monitor_id, server_id, bucket_start), accumulator) in &buckets {
            self.upsert_bucket(handle.connection(), *monitor_id, *server_id, *bucket_start, accumulator)
                .await?;
        }

        for rowid in consumed_rowids {
            sqlx::query("DELETE FROM latency_raw WHERE rowid = ?")
                .bind(rowid)
                .execute(handle.connection())
                .await
                .map_err(DatabaseError::from)?;
        }

        handle.release().await?;
        self.expunge(thread_id, now, config.expunge_period).await?;
        Ok(())
    }

    async fn upsert_bucket(
        &self,
        conn: &mut sqlx::sqlite::SqliteConnection,
        monitor_id: u32,
        server_id: u32,
        bucket_start: u32,
        accumulator: &WelfordAccumulator,
    ) -> Result<(), AggregatorError> {
        let existing = sqlx::query(
            "SELECT count, mean, variance_sum, min_latency, max_latency FROM latency_aggregates \
             WHERE monitor_id = ? AND server_id = ? AND bucket_start = ?",
        )
        .bind(monitor_id as i64)
        .bind(server_id as i64)
        .bind(bucket_start as i64)
        .fetch_optional(&mut *conn)
        .await
        .map_err(DatabaseError::from)?;

        let merged = match existing {
            Some(row) => {
                let existing_accumulator = WelfordAccumulator {
                    count: row.try_get::<i64, _>("count").map_err(DatabaseError::from)? as u64,
                    mean: row.try_get("mean").map_err(DatabaseError::from)?,
                    variance_sum: row.try_get("variance_sum").map_err(DatabaseError::from)?,
                    min: row.try_get::<i64, _>("min_latency").map_err(DatabaseError::from)? as u32,
                    max: row.try_get::<i64, _>("max_latency").map_err(DatabaseError::from)? as u32,
                };
                existing_accumulator.combine(*accumulator)
            }
            None => *accumulator,
        };

        sqlx::query(
            "INSERT INTO latency_aggregates \
             (monitor_id, server_id, bucket_start, count, mean, variance_sum, min_latency, max_latency) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(monitor_id, server_id, bucket_start) DO UPDATE SET \
             count = excluded.count, mean = excluded.mean, variance_sum = excluded.variance_sum, \
             min_latency = excluded.min_latency, max_latency = excluded.max_latency",
        )
        .bind(monitor_id as i64)
        .bind(server_id as i64)
        .bind(bucket_start as i64)
        .bind(merged.count as i64)
        .bind(merged.mean)
        .bind(merged.variance_sum)
        .bind(merged.min as i64)
        .bind(merged.max as i64)
        .execute(&mut *conn)
        .await
        .map_err(DatabaseError::from)?;

        Ok(())
    }

    async fn expunge(&self, thread_id: u32, now: u64, expunge_period: u64) -> Result<(), AggregatorError> {
        let cutoff = now.saturating_sub(expunge_period);
        let mut handle = self.mux.acquire(thread_id).await?;
        sqlx::query("DELETE FROM latency_aggregates WHERE bucket_start < ?")
            .bind(cutoff as i64)
            .execute(handle.connection())
            .await
            .map_err(DatabaseError::from)?;
        handle.release().await?;
        Ok(())
    }

    /// Remove every row for the given customers' monitors from both
    /// tables. The monitor-to-customer join is left to the caller, which
    /// passes the already-resolved monitor ids; `customer_ids` is accepted
    /// for logging context only.
    pub async fn delete_by_customer_id(
        &self,
        customer_ids: &[CustomerId],
        monitor_ids: &[u32],
        thread_id: u32,
    ) -> Result<(), AggregatorError> {
        if monitor_ids.is_empty() {
            return Ok(());
        }

        let placeholders = std::iter::repeat("?").take(monitor_ids.len()).collect::<Vec<_>>().join(", ");
        let mut handle = self.mux.acquire(thread_id).await?;

        for table in ["latency_raw", "latency_aggregates"] {
            let query_text = format!("DELETE FROM {table} WHERE monitor_id IN ({placeholders})");
            let mut query = sqlx::query(&query_text);
            for &monitor_id in monitor_ids {
                query = query.bind(monitor_id as i64);
            }
            query.execute(handle.connection()).await.map_err(DatabaseError::from)?;
        }

        handle.release().await?;
        tracing::info!(?customer_ids, monitor_count = monitor_ids.len(), "purged latency rows");
        Ok(())
    }

    /// Read back rolled-up buckets for one monitor, optionally restricted to
    /// a server and a `[since, until)` window of bucket starts.
    pub async fn query(
        &self,
        monitor_id: u32,
        server_id: Option<u32>,
        since: Option<u32>,
        until: Option<u32>,
        thread_id: u32,
    ) -> Result<Vec<AggregateBucket>, AggregatorError> {
        let mut handle = self.mux.acquire(thread_id).await?;
        let rows = sqlx::query(
            "SELECT monitor_id, server_id, bucket_start, count, mean, variance_sum, min_latency, max_latency \
             FROM latency_aggregates WHERE monitor_id = ?1 \
             AND (?2 IS NULL OR server_id = ?2) \
             AND (?3 IS NULL OR bucket_start >= ?3) \
             AND (?4 IS NULL OR bucket_start < ?4) \
             ORDER BY bucket_start ASC",
        )
        .bind(monitor_id as i64)
        .bind(server_id.map(|id| id as i64))
        .bind(since.map(|s| s as i64))
        .bind(until.map(|u| u as i64))
        .fetch_all(handle.connection())
        .await
        .map_err(DatabaseError::from)?;
        handle.release().await?;

        let mut buckets = Vec::with_capacity(rows.len());
        for row in rows {
            buckets.push(AggregateBucket {
                monitor_id: row.try_get::<i64, _>("monitor_id").map_err(DatabaseError::from)? as u32,
                server_id: row.try_get::<i64, _>("server_id").map_err(DatabaseError::from)? as u32,
                bucket_start: row.try_get::<i64, _>("bucket_start").map_err(DatabaseError::from)? as u32,
                count: row.try_get::<i64, _>("count").map_err(DatabaseError::from)? as u64,
                mean: row.try_get("mean").map_err(DatabaseError::from)?,
                variance_sum: row.try_get("variance_sum").map_err(DatabaseError::from)?,
                min: row.try_get::<i64, _>("min_latency").map_err(DatabaseError::from)? as u32,
                max: row.try_get::<i64, _>("max_latency").map_err(DatabaseError::from)? as u32,
            });
        }
        Ok(buckets)
    }

    /// Spawn the periodic rollup task, aligned to the next `resamplePeriod`
    /// wall-clock boundary.
    pub fn spawn(self: Arc<Self>, thread_id: u32) {
        tokio::spawn(async move {
            let resample_period = self.config().resample_period.max(1);
            let initial_delay = seconds_to_next_interval(resample_period, now_seconds());
            tokio::time::sleep(Duration::from_secs(initial_delay)).await;

            let mut ticker = tokio::time::interval(Duration::from_secs(self.config().resample_period.max(1)));
            loop {
                ticker.tick().await;
                if let Err(error) = self.run_once(thread_id).await {
                    tracing::error!(%error, "latency aggregation tick failed");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DatabaseConfig;

    async fn fresh_aggregator() -> LatencyAggregator {
        let mux = Arc::new(
            ConnectionMultiplexer::new(DatabaseConfig {
                database_name: ":memory:".to_string(),
                ..Default::default()
            })
            .await
            .unwrap(),
        );
        let mut handle = mux.acquire(0).await.unwrap();
        sqlx::query(
            "CREATE TABLE latency_raw ( \
                rowid INTEGER PRIMARY KEY AUTOINCREMENT, \
                monitor_id INTEGER NOT NULL, \
                server_id INTEGER NOT NULL, \
                timestamp INTEGER NOT NULL, \
                count INTEGER NOT NULL, \
                mean REAL NOT NULL, \
                variance_sum REAL NOT NULL, \
                min_latency INTEGER NOT NULL, \
                max_latency INTEGER NOT NULL \
            )",
        )
        .execute(handle.connection())
        .await
        .unwrap();
        sqlx::query(
            "CREATE TABLE latency_aggregates ( \
                monitor_id INTEGER NOT NULL, \
                server_id INTEGER NOT NULL, \
                bucket_start INTEGER NOT NULL, \
                count INTEGER NOT NULL, \
                mean REAL NOT NULL, \
                variance_sum REAL NOT NULL, \
                min_latency INTEGER NOT NULL, \
                max_latency INTEGER NOT NULL, \
                PRIMARY KEY (monitor_id, server_id, bucket_start) \
            )",
        )
        .execute(handle.connection())
        .await
        .unwrap();
        handle.release().await.unwrap();

        LatencyAggregator::new(
            mux,
            AggregatorConfig {
                input_table_maximum_age: 0,
                resample_period: 60,
                expunge_period: 3600,
            },
        )
    }

    #[test]
    fn seconds_to_next_interval_lands_on_boundaries() {
        assert_eq!(seconds_to_next_interval(60, 120), 0);
        assert_eq!(seconds_to_next_interval(60, 125), 55);
        assert_eq!(seconds_to_next_interval(60, 119), 1);
    }

    #[test]
    fn welford_combine_matches_naive_mean_and_variance() {
        let values = [100u32, 200, 300, 400];
        let combined = values
            .iter()
            .map(|&v| WelfordAccumulator::singleton(v))
            .fold(WelfordAccumulator { count: 0, mean: 0.0, variance_sum: 0.0, min: 0, max: 0 }, |a, b| {
                a.combine(b)
            });

        assert_eq!(combined.count, 4);
        assert!((combined.mean - 250.0).abs() < 1e-9);
        // population variance = mean((x-mean)^2) = 12500; variance_sum = sum of squared deviations
        assert!((combined.variance_sum - 50000.0).abs() < 1e-6);
        assert_eq!(combined.min, 100);
        assert_eq!(combined.max, 400);
    }

    #[tokio::test]
    async fn run_once_rolls_up_expired_samples_into_a_bucket() {
        let aggregator = fresh_aggregator().await;
        let now = now_seconds() as u32;
        let bucket_start = (now as u64 / 60 * 60) as u32;

        aggregator
            .record(
                &[
                    RawSample { monitor_id: 1, server_id: 9, timestamp: bucket_start, latency_microseconds: 1000 },
                    RawSample { monitor_id: 1, server_id: 9, timestamp: bucket_start + 5, latency_microseconds: 3000 },
                ],
                0,
            )
            .await
            .unwrap();

        aggregator.run_once(0).await.unwrap();

        let mut handle = aggregator.mux.acquire(0).await.unwrap();
        let remaining_raw: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM latency_raw")
            .fetch_one(handle.connection())
            .await
            .unwrap();
        assert_eq!(remaining_raw, 0);

        let row = sqlx::query("SELECT count, mean FROM latency_aggregates WHERE monitor_id = 1 AND server_id = 9")
            .fetch_one(handle.connection())
            .await
            .unwrap();
        let count: i64 = row.try_get("count").unwrap();
        let mean: f64 = row.try_get("mean").unwrap();
        handle.release().await.unwrap();

        assert_eq!(count, 2);
        assert!((mean - 2000.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn query_and_summarize_round_trip_a_rolled_up_bucket() {
        let aggregator = fresh_aggregator().await;
        let now = now_seconds() as u32;
        let bucket_start = (now as u64 / 60 * 60) as u32;

        aggregator
            .record(&[RawSample { monitor_id: 1, server_id: 9, timestamp: bucket_start, latency_microseconds: 1000 }], 0)
            .await
            .unwrap();
        aggregator.run_once(0).await.unwrap();

        let buckets = aggregator.query(1, Some(9), None, None, 0).await.unwrap();
        assert_eq!(buckets.len(), 1);
        let summary = summarize(&buckets).unwrap();
        assert_eq!(summary.count, 1);
        assert!((summary.mean - 1000.0).abs() < 1e-9);
    }
}
