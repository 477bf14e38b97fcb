//! In-memory store with the same transactional surface as Postgres.
//!
//! The single tokio mutex plays the role of the exclusive table lock: an open
//! transaction owns the whole store, so reconciliation interleavings behave
//! exactly as they do under `LOCK TABLE`.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{Store, StoreTx, TargetFilter, TargetPatch, UpdateFilter, UpdatePatch};
use crate::types::{
    ChapterUpdate, CrawlTarget, CrawlTargetId, NewChapterUpdate, NewCrawlTarget, UpdateId, UserId,
};

#[derive(Debug, Clone)]
struct Inner {
    targets: Vec<CrawlTarget>,
    updates: Vec<ChapterUpdate>,
    next_target_id: i32,
    next_update_id: i32,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            updates: Vec::new(),
            next_target_id: 1,
            next_update_id: 1,
        }
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn target_matches(target: &CrawlTarget, filter: &TargetFilter) -> bool {
    filter
        .crawl_target_id
        .map_or(true, |id| target.crawl_target_id == id)
        && filter.user_id.map_or(true, |uid| target.user_id == uid)
}

fn project_target(target: &CrawlTarget, with_cover: bool) -> CrawlTarget {
    let mut projected = target.clone();
    if !with_cover {
        projected.cover = None;
    }
    projected
}

fn apply_target_patch(target: &mut CrawlTarget, patch: &TargetPatch) {
    if let Some(last_crawled_on) = patch.last_crawled_on {
        target.last_crawled_on = Some(last_crawled_on);
    }
    if let Some(crawl_success) = patch.crawl_success {
        target.crawl_success = Some(crawl_success);
    }
    if let Some(cover) = &patch.cover {
        target.cover_signature = Some(cover.signature());
        target.cover = Some(cover.clone());
    }
}

fn insert_update_row(inner: &mut Inner, update: &NewChapterUpdate) -> ChapterUpdate {
    let row = ChapterUpdate {
        update_id: UpdateId(inner.next_update_id),
        crawl_target_id: update.crawl_target_id,
        crawled_on: update.crawled_on,
        chapter: update.chapter,
        chapter_name: update.chapter_name.clone(),
        is_read: update.is_read,
        read_at: update.read_at.clone(),
        date_created: update.date_created,
    };
    inner.next_update_id += 1;
    inner.updates.push(row.clone());
    row
}

fn patch_update_row(
    inner: &mut Inner,
    update_id: UpdateId,
    patch: &UpdatePatch,
) -> Option<ChapterUpdate> {
    let row = inner
        .updates
        .iter_mut()
        .find(|update| update.update_id == update_id)?;
    if let Some(crawled_on) = patch.crawled_on {
        row.crawled_on = crawled_on;
    }
    if let Some(chapter_name) = &patch.chapter_name {
        row.chapter_name = chapter_name.clone();
    }
    if let Some(read_at) = &patch.read_at {
        row.read_at = read_at.clone();
    }
    Some(row.clone())
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> anyhow::Result<Box<dyn StoreTx>> {
        let guard = self.inner.clone().lock_owned().await;
        let snapshot = guard.clone();
        Ok(Box::new(MemoryTx {
            guard,
            snapshot,
            committed: false,
        }))
    }

    async fn list_targets(&self, filter: &TargetFilter) -> anyhow::Result<Vec<CrawlTarget>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .targets
            .iter()
            .filter(|target| target_matches(target, filter))
            .map(|target| project_target(target, filter.with_cover))
            .collect())
    }

    async fn get_target(
        &self,
        crawl_target_id: CrawlTargetId,
        user_id: Option<UserId>,
    ) -> anyhow::Result<Option<CrawlTarget>> {
        let targets = self
            .list_targets(&TargetFilter {
                crawl_target_id: Some(crawl_target_id),
                user_id,
                with_cover: false,
            })
            .await?;
        Ok(targets.into_iter().next())
    }

    async fn insert_target(&self, target: &NewCrawlTarget) -> anyhow::Result<CrawlTarget> {
        let mut inner = self.inner.lock().await;
        let row = CrawlTarget {
            crawl_target_id: CrawlTargetId(inner.next_target_id),
            name: target.name.clone(),
            url: target.url.clone(),
            kind: target.kind,
            last_crawled_on: target.last_crawled_on,
            crawl_success: target.crawl_success,
            user_id: target.user_id,
            cover_signature: target.cover.as_ref().map(|cover| cover.signature()),
            cover: target.cover.clone(),
            favourite: target.favourite,
        };
        inner.next_target_id += 1;
        inner.targets.push(row.clone());
        Ok(row)
    }

    async fn update_target(
        &self,
        crawl_target_id: CrawlTargetId,
        patch: &TargetPatch,
    ) -> anyhow::Result<Option<CrawlTarget>> {
        anyhow::ensure!(!patch.is_empty(), "must update at least one property");

        let mut inner = self.inner.lock().await;
        let Some(target) = inner
            .targets
            .iter_mut()
            .find(|target| target.crawl_target_id == crawl_target_id)
        else {
            return Ok(None);
        };
        apply_target_patch(target, patch);
        Ok(Some(target.clone()))
    }

    async fn list_updates(&self, filter: &UpdateFilter) -> anyhow::Result<Vec<ChapterUpdate>> {
        let inner = self.inner.lock().await;
        let owner_targets: Option<Vec<CrawlTargetId>> = filter.user_id.map(|user_id| {
            inner
                .targets
                .iter()
                .filter(|target| target.user_id == user_id)
                .map(|target| target.crawl_target_id)
                .collect()
        });

        Ok(inner
            .updates
            .iter()
            .filter(|update| {
                filter
                    .crawl_target_id
                    .map_or(true, |id| update.crawl_target_id == id)
                    && owner_targets
                        .as_ref()
                        .map_or(true, |ids| ids.contains(&update.crawl_target_id))
                    && filter.chapter.map_or(true, |chapter| update.chapter == chapter)
            })
            .cloned()
            .collect())
    }

    async fn set_update_read(
        &self,
        update_id: UpdateId,
        is_read: bool,
        user_id: Option<UserId>,
    ) -> anyhow::Result<Option<ChapterUpdate>> {
        let mut inner = self.inner.lock().await;
        let owner_targets: Option<Vec<CrawlTargetId>> = user_id.map(|user_id| {
            inner
                .targets
                .iter()
                .filter(|target| target.user_id == user_id)
                .map(|target| target.crawl_target_id)
                .collect()
        });

        let Some(row) = inner.updates.iter_mut().find(|update| {
            update.update_id == update_id
                && owner_targets
                    .as_ref()
                    .map_or(true, |ids| ids.contains(&update.crawl_target_id))
        }) else {
            return Ok(None);
        };
        row.is_read = is_read;
        Ok(Some(row.clone()))
    }
}

pub struct MemoryTx {
    guard: OwnedMutexGuard<Inner>,
    snapshot: Inner,
    committed: bool,
}

/// A transaction dropped without commit restores the snapshot, matching the
/// Postgres transaction's rollback-on-drop. This also covers cancellation,
/// e.g. a timeout dropping a reconciliation mid-flight.
impl Drop for MemoryTx {
    fn drop(&mut self) {
        if !self.committed {
            *self.guard = std::mem::take(&mut self.snapshot);
        }
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn lock_updates(&mut self) -> anyhow::Result<()> {
        // The owned mutex guard is already exclusive over the whole store.
        Ok(())
    }

    async fn updates_for_target(
        &mut self,
        crawl_target_id: CrawlTargetId,
    ) -> anyhow::Result<Vec<ChapterUpdate>> {
        Ok(self
            .guard
            .updates
            .iter()
            .filter(|update| update.crawl_target_id == crawl_target_id)
            .cloned()
            .collect())
    }

    async fn insert_update(&mut self, update: &NewChapterUpdate) -> anyhow::Result<ChapterUpdate> {
        Ok(insert_update_row(&mut self.guard, update))
    }

    async fn patch_update(
        &mut self,
        update_id: UpdateId,
        patch: &UpdatePatch,
    ) -> anyhow::Result<Option<ChapterUpdate>> {
        anyhow::ensure!(!patch.is_empty(), "must update at least one property");
        Ok(patch_update_row(&mut self.guard, update_id, patch))
    }

    async fn commit(mut self: Box<Self>) -> anyhow::Result<()> {
        self.committed = true;
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> anyhow::Result<()> {
        *self.guard = std::mem::take(&mut self.snapshot);
        self.committed = true;
        Ok(())
    }
}
