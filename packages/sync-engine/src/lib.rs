//! Crawl-sync engine for tracked serial content.
//!
//! Periodically crawls external chapter sources (a REST-paginated API source
//! and an HTML-paginated scraping source) on behalf of many independently
//! tracked targets, and reconciles what it finds into Postgres without
//! duplicating chapters or clobbering reader-owned state.

pub mod cursor;
pub mod error;
pub mod float;
pub mod limiter;
pub mod reconcile;
pub mod sources;
pub mod storage;
pub mod sync;
pub mod types;

// Re-exports for clean API
pub use cursor::{Cursor, LinkCursor, OffsetCursor, OffsetPage};
pub use error::SyncError;
pub use limiter::{Limiter, SyncLimiters};
pub use reconcile::{reconcile, Reconciliation};
pub use sources::{ChapterSource, MangadexSource, SourceRegistry, SourceSearch, WebtoonSource};
pub use storage::{
    MemoryStore, PostgresStore, Store, StoreTx, TargetFilter, TargetPatch, UpdateFilter,
    UpdatePatch,
};
pub use sync::{sync_all, SyncOptions, TargetOutcome, TargetSummary};
pub use types::*;
