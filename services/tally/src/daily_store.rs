use crate::config::DatabaseConfig;
use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Durable per-date totals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct DailyRecord {
    /// Local calendar date (unique)
    pub date: NaiveDate,
    /// Fresh items counted on this date
    pub fresh_count: i64,
    /// Rotten items counted on this date
    pub rotten_count: i64,
}

/// Errors from the daily record store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("count overflow for {date}")]
    CountOverflow { date: NaiveDate },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        // Connection-level failures clear up on their own; everything else is a query fault
        match &e {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Self::Unavailable(e.to_string())
            }
            _ => Self::Database(e),
        }
    }
}

/// Date-keyed store of daily totals.
///
/// `upsert_add` must be atomic: either both deltas land or nothing changes.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DailyRecordStore: Send + Sync {
    /// Record for a single date, if one exists
    async fn get(&self, date: NaiveDate) -> Result<Option<DailyRecord>, StoreError>;

    /// Create the record for `date` with the deltas, or add them to the existing one
    async fn upsert_add(
        &self,
        date: NaiveDate,
        fresh_delta: u64,
        rotten_delta: u64,
    ) -> Result<DailyRecord, StoreError>;

    /// Records with `start <= date <= end`, ascending by date
    async fn range(&self, start: NaiveDate, end: NaiveDate)
        -> Result<Vec<DailyRecord>, StoreError>;

    /// Cheap connectivity check for readiness probes
    async fn ping(&self) -> Result<(), StoreError>;
}

fn to_db_count(date: NaiveDate, delta: u64) -> Result<i64, StoreError> {
    i64::try_from(delta).map_err(|_| StoreError::CountOverflow { date })
}

/// PostgreSQL-backed daily record store
pub struct PgDailyRecordStore {
    pool: PgPool,
}

impl PgDailyRecordStore {
    /// Create a new store with connection pool
    pub async fn new(config: &DatabaseConfig) -> anyhow::Result<Self> {
        use anyhow::Context;

        let options = config.connect_options()?;
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect_with(options)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations").run(&self.pool).await?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Get the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl DailyRecordStore for PgDailyRecordStore {
    #[instrument(skip(self))]
    async fn get(&self, date: NaiveDate) -> Result<Option<DailyRecord>, StoreError> {
        let record = sqlx::query_as::<_, DailyRecord>(
            r#"
            SELECT date, fresh_count, rotten_count
            FROM daily_counts
            WHERE date = $1
            "#,
        )
        .bind(date)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    #[instrument(skip(self))]
    async fn upsert_add(
        &self,
        date: NaiveDate,
        fresh_delta: u64,
        rotten_delta: u64,
    ) -> Result<DailyRecord, StoreError> {
        let fresh = to_db_count(date, fresh_delta)?;
        let rotten = to_db_count(date, rotten_delta)?;

        // Single statement, so concurrent writers for the same date serialize on the row
        let record = sqlx::query_as::<_, DailyRecord>(
            r#"
            INSERT INTO daily_counts (date, fresh_count, rotten_count)
            VALUES ($1, $2, $3)
            ON CONFLICT (date) DO UPDATE SET
                fresh_count = daily_counts.fresh_count + EXCLUDED.fresh_count,
                rotten_count = daily_counts.rotten_count + EXCLUDED.rotten_count,
                updated_at = NOW()
            RETURNING date, fresh_count, rotten_count
            "#,
        )
        .bind(date)
        .bind(fresh)
        .bind(rotten)
        .fetch_one(&self.pool)
        .await?;

        debug!(
            date = %record.date,
            fresh_count = record.fresh_count,
            rotten_count = record.rotten_count,
            "Daily record updated"
        );

        Ok(record)
    }

    #[instrument(skip(self))]
    async fn range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyRecord>, StoreError> {
        let records = sqlx::query_as::<_, DailyRecord>(
            r#"
            SELECT date, fresh_count, rotten_count
            FROM daily_counts
            WHERE date BETWEEN $1 AND $2
            ORDER BY date ASC
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// In-process store with the same semantics, for tests and embedding
#[derive(Debug, Default)]
pub struct MemoryDailyRecordStore {
    records: Mutex<BTreeMap<NaiveDate, DailyRecord>>,
}

impl MemoryDailyRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl DailyRecordStore for MemoryDailyRecordStore {
    async fn get(&self, date: NaiveDate) -> Result<Option<DailyRecord>, StoreError> {
        Ok(self.records.lock().get(&date).copied())
    }

    async fn upsert_add(
        &self,
        date: NaiveDate,
        fresh_delta: u64,
        rotten_delta: u64,
    ) -> Result<DailyRecord, StoreError> {
        let fresh = to_db_count(date, fresh_delta)?;
        let rotten = to_db_count(date, rotten_delta)?;

        let mut records = self.records.lock();
        let current = records.get(&date).copied().unwrap_or(DailyRecord {
            date,
            fresh_count: 0,
            rotten_count: 0,
        });

        // Compute both sums before writing anything
        let updated = DailyRecord {
            date,
            fresh_count: current
                .fresh_count
                .checked_add(fresh)
                .ok_or(StoreError::CountOverflow { date })?,
            rotten_count: current
                .rotten_count
                .checked_add(rotten)
                .ok_or(StoreError::CountOverflow { date })?,
        };
        records.insert(date, updated);

        Ok(updated)
    }

    async fn range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyRecord>, StoreError> {
        if start > end {
            return Ok(Vec::new());
        }
        Ok(self
            .records
            .lock()
            .range(start..=end)
            .map(|(_, record)| *record)
            .collect())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[tokio::test]
    async fn test_upsert_add_creates_then_increments() {
        let store = MemoryDailyRecordStore::new();
        let day = date(2024, 6, 1);

        assert_eq!(store.get(day).await.unwrap(), None);

        let created = store.upsert_add(day, 3, 1).await.unwrap();
        assert_eq!((created.fresh_count, created.rotten_count), (3, 1));

        let updated = store.upsert_add(day, 2, 0).await.unwrap();
        assert_eq!((updated.fresh_count, updated.rotten_count), (5, 1));
        assert_eq!(store.get(day).await.unwrap(), Some(updated));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_connection_errors_classify_as_unavailable() {
        assert!(matches!(
            StoreError::from(sqlx::Error::PoolTimedOut),
            StoreError::Unavailable(_)
        ));
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(matches!(
            StoreError::from(sqlx::Error::Io(io)),
            StoreError::Unavailable(_)
        ));
        assert!(matches!(
            StoreError::from(sqlx::Error::RowNotFound),
            StoreError::Database(_)
        ));
    }

    #[tokio::test]
    async fn test_zero_delta_upsert_creates_empty_record() {
        let store = MemoryDailyRecordStore::new();
        let day = date(2024, 6, 1);

        let record = store.upsert_add(day, 0, 0).await.unwrap();
        assert_eq!((record.fresh_count, record.rotten_count), (0, 0));
        assert!(!store.is_empty());
    }

    #[tokio::test]
    async fn test_range_is_inclusive_and_sorted() {
        let store = MemoryDailyRecordStore::new();
        for (day, fresh) in [(5, 50), (1, 10), (3, 30), (7, 70)] {
            store.upsert_add(date(2024, 6, day), fresh, 0).await.unwrap();
        }

        let records = store.range(date(2024, 6, 1), date(2024, 6, 5)).await.unwrap();
        let days: Vec<_> = records.iter().map(|r| r.date).collect();
        assert_eq!(days, vec![date(2024, 6, 1), date(2024, 6, 3), date(2024, 6, 5)]);

        assert!(store
            .range(date(2024, 6, 5), date(2024, 6, 1))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_overflow_leaves_record_unchanged() {
        let store = MemoryDailyRecordStore::new();
        let day = date(2024, 6, 1);
        store.upsert_add(day, 1, i64::MAX as u64).await.unwrap();

        let result = store.upsert_add(day, 5, 1).await;
        assert!(matches!(result, Err(StoreError::CountOverflow { .. })));

        let stored = store.get(day).await.unwrap().unwrap();
        assert_eq!((stored.fresh_count, stored.rotten_count), (1, i64::MAX));
    }

    #[tokio::test]
    async fn test_delta_beyond_column_range_is_rejected() {
        let store = MemoryDailyRecordStore::new();
        let result = store.upsert_add(date(2024, 6, 1), u64::MAX, 0).await;
        assert!(matches!(result, Err(StoreError::CountOverflow { .. })));
        assert!(store.is_empty());
    }

    /// Requires a reachable PostgreSQL at `TALLY_TEST_DATABASE_URL`
    #[tokio::test]
    #[ignore]
    async fn test_postgres_upsert_and_range() {
        let url = std::env::var("TALLY_TEST_DATABASE_URL").unwrap();
        let config = DatabaseConfig {
            url: Some(url),
            ..Default::default()
        };
        let store = PgDailyRecordStore::new(&config).await.unwrap();
        store.run_migrations().await.unwrap();

        let day = date(1999, 12, 31);
        sqlx::query("DELETE FROM daily_counts WHERE date = $1")
            .bind(day)
            .execute(store.pool())
            .await
            .unwrap();

        store.upsert_add(day, 4, 2).await.unwrap();
        let record = store.upsert_add(day, 1, 1).await.unwrap();
        assert_eq!((record.fresh_count, record.rotten_count), (5, 3));

        let records = store.range(day, day).await.unwrap();
        assert_eq!(records, vec![record]);
        store.ping().await.unwrap();
    }
}
