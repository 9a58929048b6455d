//! Tally Service
//!
//! Counts fresh and rotten items reported by an upstream detector, keeps a
//! durable total per local calendar day, and serves the most recent upload
//! from the detection camera.
//!
//! ## Features
//!
//! - **Cheap Ingestion**: counts are absorbed by an in-memory accumulator and
//!   folded into today's record on every event
//! - **Lossless Reconciliation**: a single lock covers add-then-persist; a
//!   failed write keeps the backlog for the next attempt
//! - **Implicit Rollover**: "today" is recomputed in the configured timezone
//!   on every reconciliation
//! - **Latest-Image Slot**: uploads are atomically published into a scratch
//!   directory that disappears with the process
//!
//! ## Architecture
//!
//! ```text
//!  POST /ingest            ┌──────────────┐  upsert_add   ┌──────────────┐
//! ───────────────────────▶ │ Reconciler   │──────────────▶│ PostgreSQL   │
//!                          │ (Accumulator)│               │ daily_counts │
//!                          └──────────────┘               └──────────────┘
//!                                 ▲                              │
//!                       flush tick│                              │ get / range
//!                                 │                              ▼
//!                          ┌──────────────┐               ┌──────────────┐
//!                          │ Flush Loop   │               │ Tally        │
//!                          └──────────────┘               │ Queries      │
//!                                                         └──────────────┘
//!  POST /upload-image      ┌──────────────┐                      │
//! ───────────────────────▶ │ Image Slot   │              GET /count, /history
//!  GET /latest-image ◀──── │ Cache        │
//!                          └──────────────┘
//! ```

pub mod api;
pub mod clock;
pub mod config;
pub mod daily_store;
pub mod error;
pub mod image_cache;
pub mod queries;
pub mod reconciler;

pub use api::{create_router, serve_until_shutdown, start_api_server, AppState};
pub use clock::{Calendar, Clock, ManualClock, SystemClock};
pub use config::Config;
pub use daily_store::{
    DailyRecord, DailyRecordStore, MemoryDailyRecordStore, PgDailyRecordStore, StoreError,
};
pub use error::ApiError;
pub use image_cache::{ImageCacheError, ImageMeta, ImageSlotCache, LatestImage};
pub use queries::{TallyQueries, Totals};
pub use reconciler::{Accumulator, IngestError, IngestReceipt, Reconciler};
