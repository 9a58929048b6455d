use crate::clock::Calendar;
use crate::daily_store::{DailyRecord, DailyRecordStore, StoreError};
use chrono::{Days, NaiveDate};
use serde::Serialize;
use std::sync::Arc;
use tracing::instrument;

/// Earliest date a PostgreSQL `DATE` column can hold (4713 BC)
fn earliest_storable_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(-4712, 1, 1).unwrap_or(NaiveDate::MIN)
}

/// Committed totals for one day
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Totals {
    pub fresh: i64,
    pub rotten: i64,
}

/// Read-only views over committed daily records.
///
/// Pending accumulator counts are never included; they show up after the
/// next successful reconciliation.
pub struct TallyQueries {
    store: Arc<dyn DailyRecordStore>,
    calendar: Calendar,
}

impl TallyQueries {
    pub fn new(store: Arc<dyn DailyRecordStore>, calendar: Calendar) -> Self {
        Self { store, calendar }
    }

    /// Today's committed totals, zero when no record exists yet
    pub async fn get_today_totals(&self) -> Result<Totals, StoreError> {
        let today = self.calendar.today();
        Ok(self
            .store
            .get(today)
            .await?
            .map(|record| Totals {
                fresh: record.fresh_count,
                rotten: record.rotten_count,
            })
            .unwrap_or_default())
    }

    /// Records from `today - window_days` through today, oldest first.
    /// Days without a record are omitted. Windows reaching past the earliest
    /// storable date start there instead.
    #[instrument(skip(self))]
    pub async fn get_history(&self, window_days: u32) -> Result<Vec<DailyRecord>, StoreError> {
        let end = self.calendar.today();
        let floor = earliest_storable_date();
        let start = end
            .checked_sub_days(Days::new(u64::from(window_days)))
            .map_or(floor, |start| start.max(floor));

        self.store.range(start, end).await
    }
}
