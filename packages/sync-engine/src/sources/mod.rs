//! Source adapters.
//!
//! Each adapter knows how to turn a crawl target into a cursor of chapter
//! observations, fetch the target's current cover art, and search its site
//! for new targets. The registry maps a target's [`SourceKind`] to the
//! adapter that handles it.

use anyhow::Context;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::cursor::Cursor;
use crate::error::SyncError;
use crate::types::{CoverImage, CrawlTarget, NewChapterUpdate, NewCrawlTarget, SourceKind, UserId};

pub mod mangadex;
pub mod webtoon;

pub use mangadex::MangadexSource;
pub use webtoon::WebtoonSource;

/// A search against one source's public catalogue. Results materialize as
/// unsaved crawl targets owned by `user_id`.
#[derive(Debug, Clone)]
pub struct SourceSearch {
    pub query: String,
    pub user_id: UserId,
    /// Page size override for offset-paginated sources.
    pub limit: Option<u32>,
    /// Starting offset for offset-paginated sources.
    pub offset: Option<u32>,
}

impl SourceSearch {
    pub fn new(query: impl Into<String>, user_id: UserId) -> Self {
        Self {
            query: query.into(),
            user_id,
            limit: None,
            offset: None,
        }
    }
}

/// One external content source the engine can crawl.
#[async_trait]
pub trait ChapterSource: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// A cursor over the target's chapter feed, newest first.
    fn chapter_cursor(
        &self,
        target: &CrawlTarget,
    ) -> Result<Box<dyn Cursor<NewChapterUpdate>>, SyncError>;

    /// The target's current cover art, if the source exposes one.
    async fn latest_cover(&self, target: &CrawlTarget) -> Result<Option<CoverImage>, SyncError>;

    /// A cursor over catalogue search results for `search.query`.
    fn search_cursor(
        &self,
        search: &SourceSearch,
    ) -> Result<Box<dyn Cursor<NewCrawlTarget>>, SyncError>;
}

/// Browser-like User-Agent; some sources refuse obvious bot clients.
const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Builds the HTTP client shared by all adapters: 30s request budget,
/// bounded redirects.
pub fn build_http_client() -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .user_agent(USER_AGENT)
        .redirect(reqwest::redirect::Policy::limited(5))
        .build()
        .context("failed to create HTTP client")
}

/// Maps source kinds to adapters.
#[derive(Clone, Default)]
pub struct SourceRegistry {
    sources: Vec<Arc<dyn ChapterSource>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with both built-in adapters over a shared HTTP client.
    pub fn with_defaults() -> anyhow::Result<Self> {
        let client = build_http_client()?;
        let mut registry = Self::new();
        registry.register(Arc::new(MangadexSource::new(client.clone())));
        registry.register(Arc::new(WebtoonSource::new(client)));
        Ok(registry)
    }

    /// Later registrations shadow earlier ones for the same kind.
    pub fn register(&mut self, source: Arc<dyn ChapterSource>) {
        self.sources.insert(0, source);
    }

    pub fn get(&self, kind: SourceKind) -> Option<&Arc<dyn ChapterSource>> {
        self.sources.iter().find(|source| source.kind() == kind)
    }

    /// The adapter for `target`, or [`SyncError::UnknownAdapter`].
    pub fn resolve(&self, target: &CrawlTarget) -> Result<&Arc<dyn ChapterSource>, SyncError> {
        self.get(target.kind).ok_or_else(|| SyncError::UnknownAdapter {
            kind: target.kind.to_string(),
            target: target.name.clone(),
        })
    }

    /// Runs one page of catalogue search against `kind`.
    pub async fn search(
        &self,
        kind: SourceKind,
        search: &SourceSearch,
    ) -> Result<Vec<NewCrawlTarget>, SyncError> {
        let source = self.get(kind).ok_or_else(|| SyncError::UnknownAdapter {
            kind: kind.to_string(),
            target: search.query.clone(),
        })?;
        let mut cursor = source.search_cursor(search)?;
        cursor.next().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    struct StubSource(SourceKind);

    #[async_trait]
    impl ChapterSource for StubSource {
        fn kind(&self) -> SourceKind {
            self.0
        }

        fn chapter_cursor(
            &self,
            _target: &CrawlTarget,
        ) -> Result<Box<dyn Cursor<NewChapterUpdate>>, SyncError> {
            unimplemented!("not exercised")
        }

        async fn latest_cover(
            &self,
            _target: &CrawlTarget,
        ) -> Result<Option<CoverImage>, SyncError> {
            Ok(None)
        }

        fn search_cursor(
            &self,
            _search: &SourceSearch,
        ) -> Result<Box<dyn Cursor<NewCrawlTarget>>, SyncError> {
            unimplemented!("not exercised")
        }
    }

    fn target(kind: SourceKind) -> CrawlTarget {
        CrawlTarget {
            crawl_target_id: crate::types::CrawlTargetId(1),
            name: "some series".to_string(),
            url: "https://example.com".to_string(),
            kind,
            last_crawled_on: Some(Utc::now()),
            crawl_success: Some(true),
            user_id: UserId(1),
            cover: None,
            cover_signature: None,
            favourite: false,
        }
    }

    #[test]
    fn resolve_finds_registered_adapter() {
        let mut registry = SourceRegistry::new();
        registry.register(Arc::new(StubSource(SourceKind::Mangadex)));

        assert!(registry.resolve(&target(SourceKind::Mangadex)).is_ok());
        assert!(matches!(
            registry.resolve(&target(SourceKind::Webtoon)),
            Err(SyncError::UnknownAdapter { .. })
        ));
    }

    #[test]
    fn later_registrations_shadow_earlier_ones() {
        let mut registry = SourceRegistry::new();
        let first: Arc<dyn ChapterSource> = Arc::new(StubSource(SourceKind::Webtoon));
        let second: Arc<dyn ChapterSource> = Arc::new(StubSource(SourceKind::Webtoon));
        registry.register(first.clone());
        registry.register(second.clone());

        let resolved = registry.get(SourceKind::Webtoon).unwrap();
        assert!(Arc::ptr_eq(resolved, &second));
        assert!(!Arc::ptr_eq(resolved, &first));
    }
}
