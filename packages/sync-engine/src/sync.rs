//! Sync orchestration.
//!
//! One pass fans out over the selected crawl targets, drains each target's
//! chapter cursor through the shared limiters, reconciles every observation,
//! and writes the target's crawl status back. Targets are isolated: one
//! failing target never cancels its siblings.

use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::limiter::SyncLimiters;
use crate::reconcile::{reconcile, Reconciliation};
use crate::sources::SourceRegistry;
use crate::storage::{Store, TargetFilter, TargetPatch};
use crate::types::{CoverImage, CrawlTarget, CrawlTargetId, UserId};

/// Budget for one reconciliation transaction, lock wait included.
const TRANSACTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Selection and behavior of one sync pass.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Sync a single target instead of everything.
    pub crawl_target_id: Option<CrawlTargetId>,
    /// Restrict the pass (and single-target lookups) to one owner.
    pub user_id: Option<UserId>,
    /// Stop after the first page of each cursor. New chapters appear at the
    /// head of every feed, so one page is enough for steady-state syncs; a
    /// full drain is for backfilling newly added targets.
    pub only_latest: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            crawl_target_id: None,
            user_id: None,
            only_latest: true,
        }
    }
}

/// Per-target tally of what one pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TargetSummary {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub cover_refreshed: bool,
}

/// The settled result of syncing one target, fulfilled or rejected.
#[derive(Debug)]
pub struct TargetOutcome {
    pub crawl_target_id: CrawlTargetId,
    pub name: String,
    pub result: Result<TargetSummary, SyncError>,
}

async fn select_targets(
    store: &dyn Store,
    options: &SyncOptions,
) -> Result<Vec<CrawlTarget>, SyncError> {
    match options.crawl_target_id {
        Some(crawl_target_id) => {
            let target = store
                .get_target(crawl_target_id, options.user_id)
                .await?
                .ok_or(SyncError::TargetNotFound {
                    crawl_target_id: crawl_target_id.0,
                    user_id: options.user_id.map(|user_id| user_id.0),
                })?;
            Ok(vec![target])
        }
        None => Ok(store
            .list_targets(&TargetFilter {
                user_id: options.user_id,
                ..TargetFilter::default()
            })
            .await?),
    }
}

/// Best-effort cover fetch. A failure here is logged and swallowed: cover
/// art is cosmetic and must not fail the chapter sync. Returns the image
/// only when it differs from what the target already carries; nothing is
/// written here — the cover rides along in the success write so a target
/// whose drain fails keeps its old cover.
async fn fetch_changed_cover(
    source: &dyn crate::sources::ChapterSource,
    limiters: &SyncLimiters,
    target: &CrawlTarget,
) -> Option<CoverImage> {
    let cover = match limiters
        .for_kind(target.kind)
        .run(source.latest_cover(target))
        .await
    {
        Ok(Some(cover)) => cover,
        Ok(None) => return None,
        Err(error) => {
            warn!(
                crawl_target_id = %target.crawl_target_id,
                name = %target.name,
                error = %error,
                "cover fetch failed"
            );
            return None;
        }
    };

    if target.cover_signature.as_deref() == Some(cover.signature().as_slice()) {
        debug!(crawl_target_id = %target.crawl_target_id, "cover unchanged");
        return None;
    }

    debug!(
        crawl_target_id = %target.crawl_target_id,
        signature = %cover.signature_hex(),
        "cover changed"
    );
    Some(cover)
}

async fn sync_target(
    store: &dyn Store,
    registry: &SourceRegistry,
    limiters: &SyncLimiters,
    target: &CrawlTarget,
    only_latest: bool,
) -> Result<TargetSummary, SyncError> {
    let source = registry.resolve(target)?;
    let source_limiter = limiters.for_kind(target.kind);

    let mut summary = TargetSummary::default();
    let cover = fetch_changed_cover(source.as_ref(), limiters, target).await;

    let mut cursor = source.chapter_cursor(target)?;
    while cursor.has_next() {
        let page = source_limiter.run(cursor.next()).await?;
        debug!(
            crawl_target_id = %target.crawl_target_id,
            records = page.len(),
            "reconciling page"
        );

        let settled = join_all(page.iter().map(|observed| {
            limiters.store.run(async {
                match timeout(TRANSACTION_TIMEOUT, reconcile(store, observed)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(SyncError::Reconciliation(anyhow::anyhow!(
                        "transaction exceeded {}s",
                        TRANSACTION_TIMEOUT.as_secs()
                    ))),
                }
            })
        }))
        .await;

        for outcome in settled {
            match outcome? {
                Reconciliation::Inserted(_) => summary.inserted += 1,
                Reconciliation::Patched(_) => summary.updated += 1,
                Reconciliation::Unchanged(_) => summary.unchanged += 1,
            }
        }

        if only_latest {
            break;
        }
    }

    summary.cover_refreshed = cover.is_some();
    let status = TargetPatch {
        last_crawled_on: Some(Utc::now()),
        crawl_success: Some(true),
        cover,
    };
    store.update_target(target.crawl_target_id, &status).await?;

    info!(
        crawl_target_id = %target.crawl_target_id,
        name = %target.name,
        inserted = summary.inserted,
        updated = summary.updated,
        unchanged = summary.unchanged,
        "target synced"
    );
    Ok(summary)
}

/// Records that a crawl ran and failed. Best effort: when even this write
/// fails, the original failure still wins.
async fn mark_failed(store: &dyn Store, crawl_target_id: CrawlTargetId) {
    let status = TargetPatch {
        last_crawled_on: Some(Utc::now()),
        crawl_success: Some(false),
        cover: None,
    };
    if let Err(error) = store.update_target(crawl_target_id, &status).await {
        warn!(
            crawl_target_id = %crawl_target_id,
            error = %error,
            "failed to record crawl failure"
        );
    }
}

/// Runs one sync pass and returns a settled outcome per selected target.
///
/// The returned error covers selection and task plumbing only; per-target
/// failures are carried inside their [`TargetOutcome`].
pub async fn sync_all(
    store: &Arc<dyn Store>,
    registry: &SourceRegistry,
    limiters: &SyncLimiters,
    options: &SyncOptions,
) -> Result<Vec<TargetOutcome>, SyncError> {
    let targets = select_targets(store.as_ref(), options).await?;
    info!(targets = targets.len(), "starting sync pass");

    let mut tasks = JoinSet::new();
    for target in targets {
        let store = store.clone();
        let registry = registry.clone();
        let limiters = limiters.clone();
        let only_latest = options.only_latest;
        tasks.spawn(async move {
            let crawl_target_id = target.crawl_target_id;
            let name = target.name.clone();
            let result =
                sync_target(store.as_ref(), &registry, &limiters, &target, only_latest).await;

            if let Err(error) = &result {
                warn!(
                    crawl_target_id = %crawl_target_id,
                    name = %name,
                    error = %error,
                    "target sync failed"
                );
                mark_failed(store.as_ref(), crawl_target_id).await;
            }

            TargetOutcome {
                crawl_target_id,
                name,
                result,
            }
        });
    }

    let mut outcomes = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        outcomes.push(joined.map_err(|error| SyncError::Storage(error.into()))?);
    }
    outcomes.sort_by_key(|outcome| outcome.crawl_target_id.0);
    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::Cursor;
    use crate::sources::{ChapterSource, SourceSearch};
    use crate::storage::{MemoryStore, UpdateFilter};
    use crate::types::{ImageFormat, NewChapterUpdate, NewCrawlTarget, SourceKind};
    use async_trait::async_trait;
    use std::collections::VecDeque;

    /// A source whose cursor serves scripted pages of chapter numbers, or
    /// fails its first fetch.
    struct ScriptedSource {
        kind: SourceKind,
        pages: Vec<Vec<f64>>,
        fail_fetch: bool,
        cover: Option<CoverImage>,
    }

    impl ScriptedSource {
        fn pages(kind: SourceKind, pages: Vec<Vec<f64>>) -> Self {
            Self {
                kind,
                pages,
                fail_fetch: false,
                cover: None,
            }
        }

        fn failing(kind: SourceKind) -> Self {
            Self {
                kind,
                pages: vec![],
                fail_fetch: true,
                cover: None,
            }
        }

        fn with_cover(mut self, cover: CoverImage) -> Self {
            self.cover = Some(cover);
            self
        }
    }

    struct ScriptedCursor {
        pages: VecDeque<Vec<NewChapterUpdate>>,
        fail_fetch: bool,
    }

    #[async_trait]
    impl Cursor<NewChapterUpdate> for ScriptedCursor {
        fn has_next(&self) -> bool {
            self.fail_fetch || !self.pages.is_empty()
        }

        async fn next(&mut self) -> Result<Vec<NewChapterUpdate>, SyncError> {
            if self.fail_fetch {
                return Err(SyncError::Source {
                    url: "scripted".to_string(),
                    source: anyhow::anyhow!("connection refused"),
                });
            }
            self.pages
                .pop_front()
                .ok_or_else(|| SyncError::ExhaustedCursor {
                    endpoint: "scripted".to_string(),
                })
        }
    }

    #[async_trait]
    impl ChapterSource for ScriptedSource {
        fn kind(&self) -> SourceKind {
            self.kind
        }

        fn chapter_cursor(
            &self,
            target: &CrawlTarget,
        ) -> Result<Box<dyn Cursor<NewChapterUpdate>>, SyncError> {
            let now = Utc::now();
            let pages = self
                .pages
                .iter()
                .map(|page| {
                    page.iter()
                        .map(|chapter| NewChapterUpdate {
                            crawl_target_id: target.crawl_target_id,
                            crawled_on: now,
                            chapter: *chapter,
                            chapter_name: None,
                            is_read: false,
                            read_at: format!("https://example.com/chapter/{chapter}"),
                            date_created: now,
                        })
                        .collect()
                })
                .collect();
            Ok(Box::new(ScriptedCursor {
                pages,
                fail_fetch: self.fail_fetch,
            }))
        }

        async fn latest_cover(
            &self,
            _target: &CrawlTarget,
        ) -> Result<Option<CoverImage>, SyncError> {
            Ok(self.cover.clone())
        }

        fn search_cursor(
            &self,
            _search: &SourceSearch,
        ) -> Result<Box<dyn Cursor<NewCrawlTarget>>, SyncError> {
            unimplemented!("not exercised")
        }
    }

    async fn add_target(store: &MemoryStore, name: &str, kind: SourceKind) -> CrawlTarget {
        store
            .insert_target(&NewCrawlTarget {
                name: name.to_string(),
                url: format!("https://example.com/{name}"),
                kind,
                last_crawled_on: None,
                crawl_success: None,
                user_id: UserId(1),
                cover: None,
                favourite: false,
            })
            .await
            .unwrap()
    }

    fn registry_of(sources: Vec<Arc<dyn ChapterSource>>) -> SourceRegistry {
        let mut registry = SourceRegistry::new();
        for source in sources {
            registry.register(source);
        }
        registry
    }

    #[tokio::test]
    async fn one_failing_target_does_not_cancel_the_others() {
        let store = MemoryStore::new();
        let ok_a = add_target(&store, "alpha", SourceKind::Mangadex).await;
        let bad = add_target(&store, "broken", SourceKind::Webtoon).await;
        let ok_b = add_target(&store, "beta", SourceKind::Mangadex).await;

        let registry = registry_of(vec![
            Arc::new(ScriptedSource::pages(SourceKind::Mangadex, vec![vec![1.0, 2.0]])),
            Arc::new(ScriptedSource::failing(SourceKind::Webtoon)),
        ]);

        let store: Arc<dyn Store> = Arc::new(store);
        let outcomes = sync_all(
            &store,
            &registry,
            &SyncLimiters::default(),
            &SyncOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(outcomes.len(), 3);
        let by_id = |id: CrawlTargetId| {
            outcomes
                .iter()
                .find(|outcome| outcome.crawl_target_id == id)
                .unwrap()
        };
        assert!(by_id(ok_a.crawl_target_id).result.is_ok());
        assert!(by_id(ok_b.crawl_target_id).result.is_ok());
        assert!(by_id(bad.crawl_target_id).result.is_err());

        // Both healthy targets actually reconciled their pages.
        let updates = store
            .list_updates(&UpdateFilter {
                crawl_target_id: Some(ok_a.crawl_target_id),
                ..UpdateFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(updates.len(), 2);
    }

    #[tokio::test]
    async fn crawl_status_is_written_back_on_both_outcomes() {
        let store = MemoryStore::new();
        let healthy = add_target(&store, "alpha", SourceKind::Mangadex).await;
        let broken = add_target(&store, "broken", SourceKind::Webtoon).await;

        let registry = registry_of(vec![
            Arc::new(ScriptedSource::pages(SourceKind::Mangadex, vec![vec![1.0]])),
            Arc::new(ScriptedSource::failing(SourceKind::Webtoon)),
        ]);

        let shared: Arc<dyn Store> = Arc::new(store.clone());
        sync_all(
            &shared,
            &registry,
            &SyncLimiters::default(),
            &SyncOptions::default(),
        )
        .await
        .unwrap();

        let healthy = store
            .get_target(healthy.crawl_target_id, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(healthy.crawl_success, Some(true));
        assert!(healthy.last_crawled_on.is_some());

        let broken = store
            .get_target(broken.crawl_target_id, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(broken.crawl_success, Some(false));
        assert!(broken.last_crawled_on.is_some());
        // The failure write-back touches status fields only.
        assert!(broken.cover_signature.is_none());
    }

    #[tokio::test]
    async fn only_latest_stops_after_the_first_page() {
        let store = MemoryStore::new();
        add_target(&store, "alpha", SourceKind::Mangadex).await;

        let registry = registry_of(vec![Arc::new(ScriptedSource::pages(
            SourceKind::Mangadex,
            vec![vec![3.0, 2.0], vec![1.0]],
        ))]);

        let shared: Arc<dyn Store> = Arc::new(store.clone());
        let outcomes = sync_all(
            &shared,
            &registry,
            &SyncLimiters::default(),
            &SyncOptions::default(),
        )
        .await
        .unwrap();
        let summary = outcomes[0].result.as_ref().unwrap();
        assert_eq!(summary.inserted, 2);

        let updates = store.list_updates(&UpdateFilter::default()).await.unwrap();
        assert_eq!(updates.len(), 2);
    }

    #[tokio::test]
    async fn full_drain_reconciles_every_page() {
        let store = MemoryStore::new();
        add_target(&store, "alpha", SourceKind::Mangadex).await;

        let registry = registry_of(vec![Arc::new(ScriptedSource::pages(
            SourceKind::Mangadex,
            vec![vec![3.0, 2.0], vec![1.0]],
        ))]);

        let shared: Arc<dyn Store> = Arc::new(store.clone());
        let outcomes = sync_all(
            &shared,
            &registry,
            &SyncLimiters::default(),
            &SyncOptions {
                only_latest: false,
                ..SyncOptions::default()
            },
        )
        .await
        .unwrap();
        let summary = outcomes[0].result.as_ref().unwrap();
        assert_eq!(summary.inserted, 3);
    }

    #[tokio::test]
    async fn new_cover_is_stored_and_unchanged_cover_is_skipped() {
        let store = MemoryStore::new();
        let target = add_target(&store, "alpha", SourceKind::Mangadex).await;

        let cover = CoverImage {
            format: ImageFormat::Png,
            bytes: vec![9, 9, 9],
        };
        let registry = registry_of(vec![Arc::new(
            ScriptedSource::pages(SourceKind::Mangadex, vec![vec![1.0]]).with_cover(cover.clone()),
        )]);

        let shared: Arc<dyn Store> = Arc::new(store.clone());
        let outcomes = sync_all(
            &shared,
            &registry,
            &SyncLimiters::default(),
            &SyncOptions::default(),
        )
        .await
        .unwrap();
        assert!(outcomes[0].result.as_ref().unwrap().cover_refreshed);

        let stored = store
            .get_target(target.crawl_target_id, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.cover_signature, Some(cover.signature()));

        // Second pass sees the same bytes and leaves the row alone.
        let outcomes = sync_all(
            &shared,
            &registry,
            &SyncLimiters::default(),
            &SyncOptions::default(),
        )
        .await
        .unwrap();
        assert!(!outcomes[0].result.as_ref().unwrap().cover_refreshed);
    }

    #[tokio::test]
    async fn failed_drain_does_not_persist_a_fetched_cover() {
        let store = MemoryStore::new();
        let target = add_target(&store, "broken", SourceKind::Webtoon).await;

        // The cover fetch succeeds, but the chapter drain then fails.
        let registry = registry_of(vec![Arc::new(
            ScriptedSource::failing(SourceKind::Webtoon).with_cover(CoverImage {
                format: ImageFormat::Jpeg,
                bytes: vec![7, 7, 7],
            }),
        )]);

        let shared: Arc<dyn Store> = Arc::new(store.clone());
        let outcomes = sync_all(
            &shared,
            &registry,
            &SyncLimiters::default(),
            &SyncOptions::default(),
        )
        .await
        .unwrap();
        assert!(outcomes[0].result.is_err());

        let stored = store
            .get_target(target.crawl_target_id, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.crawl_success, Some(false));
        assert!(stored.cover_signature.is_none());
    }

    #[tokio::test]
    async fn single_target_mode_requires_an_existing_target() {
        let store = MemoryStore::new();
        let registry = registry_of(vec![]);

        let shared: Arc<dyn Store> = Arc::new(store);
        let result = sync_all(
            &shared,
            &registry,
            &SyncLimiters::default(),
            &SyncOptions {
                crawl_target_id: Some(CrawlTargetId(404)),
                ..SyncOptions::default()
            },
        )
        .await;
        assert!(matches!(result, Err(SyncError::TargetNotFound { .. })));
    }

    #[tokio::test]
    async fn single_target_mode_is_scoped_to_the_owner() {
        let store = MemoryStore::new();
        let target = add_target(&store, "alpha", SourceKind::Mangadex).await;
        let registry = registry_of(vec![Arc::new(ScriptedSource::pages(
            SourceKind::Mangadex,
            vec![vec![1.0]],
        ))]);

        let shared: Arc<dyn Store> = Arc::new(store);
        let result = sync_all(
            &shared,
            &registry,
            &SyncLimiters::default(),
            &SyncOptions {
                crawl_target_id: Some(target.crawl_target_id),
                user_id: Some(UserId(999)),
                ..SyncOptions::default()
            },
        )
        .await;
        assert!(matches!(result, Err(SyncError::TargetNotFound { .. })));
    }
}
