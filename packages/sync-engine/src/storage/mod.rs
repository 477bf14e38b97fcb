//! Persistence sink contract.
//!
//! The store is an explicitly constructed, dependency-injected handle passed
//! into the orchestrator and reconciler; there is no global instance. Two
//! implementations: [`PostgresStore`] (sqlx) and [`MemoryStore`] (tests and
//! local development).

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::types::{
    ChapterUpdate, CoverImage, CrawlTarget, CrawlTargetId, NewChapterUpdate, NewCrawlTarget,
    UpdateId, UserId,
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

/// Filter for reading crawl targets.
#[derive(Debug, Clone, Default)]
pub struct TargetFilter {
    pub crawl_target_id: Option<CrawlTargetId>,
    pub user_id: Option<UserId>,
    /// Cover bytes are projected out of reads unless requested; the
    /// signature column is always read so callers can detect change without
    /// hauling image data around.
    pub with_cover: bool,
}

/// Filter for reading chapter updates.
#[derive(Debug, Clone, Default)]
pub struct UpdateFilter {
    pub crawl_target_id: Option<CrawlTargetId>,
    pub user_id: Option<UserId>,
    pub chapter: Option<f64>,
}

/// Partial update of a crawl target's crawl-status fields. The adapter kind,
/// URL and ownership are immutable through this path.
#[derive(Debug, Clone, Default)]
pub struct TargetPatch {
    pub last_crawled_on: Option<DateTime<Utc>>,
    pub crawl_success: Option<bool>,
    /// Setting a cover also rewrites its format and signature columns.
    pub cover: Option<CoverImage>,
}

impl TargetPatch {
    pub fn is_empty(&self) -> bool {
        self.last_crawled_on.is_none() && self.crawl_success.is_none() && self.cover.is_none()
    }
}

/// Partial update of a chapter update row. Only source-of-truth drift fields
/// are eligible; `is_read`, `chapter` and `date_created` have no entry here
/// by construction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdatePatch {
    pub crawled_on: Option<DateTime<Utc>>,
    /// `Some(None)` clears the stored name.
    pub chapter_name: Option<Option<String>>,
    pub read_at: Option<String>,
}

impl UpdatePatch {
    pub fn is_empty(&self) -> bool {
        self.crawled_on.is_none() && self.chapter_name.is_none() && self.read_at.is_none()
    }
}

/// An open transaction against the store.
///
/// Dropped without [`StoreTx::commit`], a transaction rolls back (both
/// implementations guarantee this); explicit [`StoreTx::rollback`] exists for
/// error paths that want the outcome logged.
#[async_trait]
pub trait StoreTx: Send {
    /// Takes the exclusive lock that serializes reconciliation system-wide.
    async fn lock_updates(&mut self) -> anyhow::Result<()>;

    async fn updates_for_target(
        &mut self,
        crawl_target_id: CrawlTargetId,
    ) -> anyhow::Result<Vec<ChapterUpdate>>;

    async fn insert_update(&mut self, update: &NewChapterUpdate) -> anyhow::Result<ChapterUpdate>;

    /// Applies a non-empty patch; `None` when the row no longer exists.
    async fn patch_update(
        &mut self,
        update_id: UpdateId,
        patch: &UpdatePatch,
    ) -> anyhow::Result<Option<ChapterUpdate>>;

    async fn commit(self: Box<Self>) -> anyhow::Result<()>;

    async fn rollback(self: Box<Self>) -> anyhow::Result<()>;
}

/// The persistence sink used by the reconciler and orchestrator.
#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> anyhow::Result<Box<dyn StoreTx>>;

    async fn list_targets(&self, filter: &TargetFilter) -> anyhow::Result<Vec<CrawlTarget>>;

    async fn get_target(
        &self,
        crawl_target_id: CrawlTargetId,
        user_id: Option<UserId>,
    ) -> anyhow::Result<Option<CrawlTarget>>;

    async fn insert_target(&self, target: &NewCrawlTarget) -> anyhow::Result<CrawlTarget>;

    /// Applies a non-empty patch; `None` when the target does not exist.
    async fn update_target(
        &self,
        crawl_target_id: CrawlTargetId,
        patch: &TargetPatch,
    ) -> anyhow::Result<Option<CrawlTarget>>;

    async fn list_updates(&self, filter: &UpdateFilter) -> anyhow::Result<Vec<ChapterUpdate>>;

    /// Flips the reader-owned read flag, optionally scoped to an owner.
    /// `None` when no matching row exists (or the owner does not match).
    async fn set_update_read(
        &self,
        update_id: UpdateId,
        is_read: bool,
        user_id: Option<UserId>,
    ) -> anyhow::Result<Option<ChapterUpdate>>;
}
