//! Counter accumulation and reconciliation.
//!
//! Ingested counts land in an in-memory [`Accumulator`] and are folded into
//! the daily record for the current local date right away. The accumulator
//! lock is held across the whole add-then-persist sequence, so concurrent
//! ingestions are serialized and a reconciliation never observes a half
//! applied increment.
//!
//! A failed reconciliation keeps the backlog in memory. The next call, from
//! another ingestion or the background flush, retries with the backlog plus
//! anything added since.

use crate::clock::Calendar;
use crate::daily_store::{DailyRecord, DailyRecordStore, StoreError};
use chrono::NaiveDate;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Upper bound for pending counts, matching the BIGINT columns they land in
const MAX_PENDING: u64 = i64::MAX as u64;

/// Errors returned to callers of [`Reconciler::ingest`]
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IngestError {
    #[error("pending {category} count would exceed {max}")]
    CountOverflow { category: &'static str, max: u64 },
}

/// Counts observed since the last successful reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accumulator {
    pub fresh: u64,
    pub rotten: u64,
    /// Local date of the last successful reconciliation
    pub last_reset_date: NaiveDate,
}

impl Accumulator {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            fresh: 0,
            rotten: 0,
            last_reset_date: today,
        }
    }

    /// Add both deltas, or neither
    fn add(&mut self, fresh: u64, rotten: u64) -> Result<(), IngestError> {
        let fresh = checked_pending(self.fresh, fresh, "fresh")?;
        let rotten = checked_pending(self.rotten, rotten, "rotten")?;
        self.fresh = fresh;
        self.rotten = rotten;
        Ok(())
    }

    fn reset(&mut self, today: NaiveDate) {
        self.fresh = 0;
        self.rotten = 0;
        self.last_reset_date = today;
    }

    pub fn pending(&self) -> u64 {
        self.fresh.saturating_add(self.rotten)
    }

    pub fn is_empty(&self) -> bool {
        self.fresh == 0 && self.rotten == 0
    }
}

fn checked_pending(current: u64, delta: u64, category: &'static str) -> Result<u64, IngestError> {
    current
        .checked_add(delta)
        .filter(|total| *total <= MAX_PENDING)
        .ok_or(IngestError::CountOverflow {
            category,
            max: MAX_PENDING,
        })
}

/// Result of an ingestion. The counts are accepted either way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReceipt {
    /// Today's record after the fold, when reconciliation succeeded
    pub record: Option<DailyRecord>,
}

impl IngestReceipt {
    pub fn persisted(&self) -> bool {
        self.record.is_some()
    }
}

/// Owns the accumulator and folds it into the daily record store
pub struct Reconciler {
    store: Arc<dyn DailyRecordStore>,
    calendar: Calendar,
    accumulator: Mutex<Accumulator>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn DailyRecordStore>, calendar: Calendar) -> Self {
        let accumulator = Accumulator::new(calendar.today());
        Self {
            store,
            calendar,
            accumulator: Mutex::new(accumulator),
        }
    }

    /// Add counts and reconcile immediately.
    ///
    /// Storage failures do not fail the ingestion: the counts stay pending
    /// and the receipt reports them as not yet persisted.
    #[instrument(skip(self))]
    pub async fn ingest(&self, fresh: u64, rotten: u64) -> Result<IngestReceipt, IngestError> {
        let mut acc = self.accumulator.lock().await;
        acc.add(fresh, rotten)?;

        metrics::counter!("tally.ingest.events").increment(1);

        let record = self.reconcile_locked(&mut acc).await.ok();
        Ok(IngestReceipt { record })
    }

    /// Fold pending counts into today's record, creating it if needed.
    ///
    /// On failure the pending counts are left untouched and the error is
    /// returned after being logged.
    #[instrument(skip(self))]
    pub async fn reconcile(&self) -> Result<DailyRecord, StoreError> {
        let mut acc = self.accumulator.lock().await;
        self.reconcile_locked(&mut acc).await
    }

    /// Reconcile only if there is a backlog or the local date has moved on.
    ///
    /// Returns `Ok(None)` when there was nothing to do.
    #[instrument(skip(self))]
    pub async fn flush(&self) -> Result<Option<DailyRecord>, StoreError> {
        let mut acc = self.accumulator.lock().await;
        if acc.is_empty() && acc.last_reset_date == self.calendar.today() {
            return Ok(None);
        }
        self.reconcile_locked(&mut acc).await.map(Some)
    }

    /// Copy of the current accumulator state
    pub async fn snapshot(&self) -> Accumulator {
        *self.accumulator.lock().await
    }

    async fn reconcile_locked(&self, acc: &mut Accumulator) -> Result<DailyRecord, StoreError> {
        let today = self.calendar.today();

        match self.store.upsert_add(today, acc.fresh, acc.rotten).await {
            Ok(record) => {
                if today != acc.last_reset_date {
                    info!(
                        previous = %acc.last_reset_date,
                        today = %today,
                        "Tally day rolled over"
                    );
                }

                debug!(
                    date = %today,
                    flushed_fresh = acc.fresh,
                    flushed_rotten = acc.rotten,
                    fresh_count = record.fresh_count,
                    rotten_count = record.rotten_count,
                    "Reconciled pending counts"
                );

                acc.reset(today);
                metrics::counter!("tally.reconcile.success").increment(1);
                metrics::gauge!("tally.accumulator.pending").set(0.0);
                Ok(record)
            }
            Err(e) => {
                error!(
                    error = %e,
                    date = %today,
                    pending_fresh = acc.fresh,
                    pending_rotten = acc.rotten,
                    "Failed to reconcile counts, keeping them pending"
                );

                metrics::counter!("tally.reconcile.failure").increment(1);
                metrics::gauge!("tally.accumulator.pending").set(acc.pending() as f64);
                Err(e)
            }
        }
    }
}

/// Periodically flush the accumulator until `shutdown` is cancelled
pub async fn run_flush_loop(
    reconciler: Arc<Reconciler>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    info!(interval_secs = interval.as_secs(), "Background flush started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                // Failures are already logged inside the reconciler
                if let Ok(Some(record)) = reconciler.flush().await {
                    debug!(date = %record.date, "Background flush committed");
                }
            }
        }
    }

    info!("Background flush stopped");
}

/// Last attempt to persist pending counts before the process exits
pub async fn final_flush(reconciler: &Reconciler) {
    let acc = reconciler.snapshot().await;
    if acc.is_empty() {
        return;
    }

    match reconciler.reconcile().await {
        Ok(record) => info!(date = %record.date, "Flushed pending counts on shutdown"),
        Err(e) => warn!(
            error = %e,
            lost_fresh = acc.fresh,
            lost_rotten = acc.rotten,
            "Pending counts could not be persisted before shutdown"
        ),
    }
}
