//! MangaDex adapter: offset-paginated REST API.

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use serde::Deserialize;
use std::collections::HashMap;
use url::Url;

use crate::cursor::{Cursor, OffsetCursor, OffsetPage};
use crate::error::SyncError;
use crate::float::scale_round;
use crate::reconcile::CHAPTER_SCALE;
use crate::sources::{ChapterSource, SourceSearch};
use crate::types::{
    CoverImage, CrawlTarget, CrawlTargetId, ImageFormat, NewChapterUpdate, NewCrawlTarget,
    SourceKind,
};

pub const MANGADEX_API_BASE: &str = "https://api.mangadex.org";
pub const MANGADEX_BASE: &str = "https://mangadex.org";
pub const MANGADEX_UPLOADS_BASE: &str = "https://uploads.mangadex.org";

/// Page size for the chapter feed; the API caps feed requests at 100.
const FEED_PAGE_LIMIT: u32 = 100;
const SEARCH_PAGE_LIMIT: u32 = 10;

pub struct MangadexSource {
    client: reqwest::Client,
    api_base: String,
    site_base: String,
    uploads_base: String,
}

impl MangadexSource {
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_bases(client, MANGADEX_API_BASE, MANGADEX_BASE, MANGADEX_UPLOADS_BASE)
    }

    /// Overridable bases, mainly for pointing tests at a local server.
    pub fn with_bases(
        client: reqwest::Client,
        api_base: impl Into<String>,
        site_base: impl Into<String>,
        uploads_base: impl Into<String>,
    ) -> Self {
        Self {
            client,
            api_base: api_base.into(),
            site_base: site_base.into(),
            uploads_base: uploads_base.into(),
        }
    }
}

/// Extracts the manga UUID from a canonical title URL
/// (`https://mangadex.org/title/{id}/slug`).
fn manga_id_from_url(url: &str) -> anyhow::Result<String> {
    let parsed = Url::parse(url).with_context(|| format!("invalid target url {url}"))?;
    let mut segments = parsed
        .path_segments()
        .context("target url has no path")?;
    segments
        .find(|segment| *segment == "title")
        .with_context(|| format!("no /title/ segment in {url}"))?;
    let id = segments
        .next()
        .filter(|id| !id.is_empty())
        .with_context(|| format!("no manga id after /title/ in {url}"))?;
    Ok(id.to_string())
}

#[derive(Debug, Deserialize)]
struct FeedResponse {
    data: Vec<FeedChapter>,
    total: u64,
}

#[derive(Debug, Deserialize)]
struct FeedChapter {
    id: String,
    attributes: FeedChapterAttributes,
}

#[derive(Debug, Deserialize)]
struct FeedChapterAttributes {
    title: Option<String>,
    /// The API serves chapter numbers as strings; null for oneshots.
    chapter: Option<String>,
}

/// Maps one feed record to an observation. The chapter number is normalized
/// to one decimal place on the way in so stored values compare cleanly.
fn chapter_update_from_feed(
    site_base: &str,
    crawl_target_id: CrawlTargetId,
    record: FeedChapter,
) -> anyhow::Result<NewChapterUpdate> {
    let raw = record
        .attributes
        .chapter
        .context("feed record has no chapter number")?;
    let chapter: f64 = raw
        .parse()
        .with_context(|| format!("unparseable chapter number {raw:?}"))?;

    let now = Utc::now();
    Ok(NewChapterUpdate {
        crawl_target_id,
        crawled_on: now,
        chapter: scale_round(chapter, CHAPTER_SCALE),
        chapter_name: record.attributes.title.filter(|title| !title.is_empty()),
        is_read: false,
        read_at: format!("{site_base}/chapter/{}", record.id),
        date_created: now,
    })
}

#[derive(Debug, Deserialize)]
struct CoverResponse {
    data: Vec<CoverRecord>,
}

#[derive(Debug, Deserialize)]
struct CoverRecord {
    attributes: CoverAttributes,
}

#[derive(Debug, Deserialize)]
struct CoverAttributes {
    #[serde(rename = "fileName")]
    file_name: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    data: Vec<SearchRecord>,
    total: u64,
}

#[derive(Debug, Deserialize)]
struct SearchRecord {
    id: String,
    attributes: SearchAttributes,
}

#[derive(Debug, Deserialize)]
struct SearchAttributes {
    /// Localized titles keyed by language code.
    title: HashMap<String, String>,
}

fn target_from_search(
    site_base: &str,
    search: &SourceSearch,
    record: SearchRecord,
) -> anyhow::Result<NewCrawlTarget> {
    let name = record
        .attributes
        .title
        .get("en")
        .cloned()
        .or_else(|| record.attributes.title.values().next().cloned())
        .with_context(|| format!("manga {} has no title", record.id))?;

    Ok(NewCrawlTarget {
        name,
        url: format!("{site_base}/title/{}", record.id),
        kind: SourceKind::Mangadex,
        last_crawled_on: None,
        crawl_success: None,
        user_id: search.user_id,
        cover: None,
        favourite: false,
    })
}

#[async_trait]
impl ChapterSource for MangadexSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Mangadex
    }

    fn chapter_cursor(
        &self,
        target: &CrawlTarget,
    ) -> Result<Box<dyn Cursor<NewChapterUpdate>>, SyncError> {
        let manga_id = manga_id_from_url(&target.url).map_err(|error| SyncError::InvalidTarget {
            target: target.name.clone(),
            reason: error.to_string(),
        })?;
        let endpoint = format!("{}/manga/{manga_id}/feed", self.api_base);

        let client = self.client.clone();
        let fetch_endpoint = endpoint.clone();
        let fetch = Box::new(move |limit: u32, offset: u32| {
            let client = client.clone();
            let endpoint = fetch_endpoint.clone();
            async move {
                let response: FeedResponse = client
                    .get(&endpoint)
                    .query(&[("limit", limit.to_string()), ("offset", offset.to_string())])
                    .query(&[("translatedLanguage[]", "en"), ("order[chapter]", "desc")])
                    .send()
                    .await
                    .context("feed request failed")?
                    .error_for_status()
                    .context("feed request rejected")?
                    .json()
                    .await
                    .context("malformed feed response")?;

                // Oneshots carry no chapter number; they are not updates we
                // can reconcile. The reported total still drives pagination.
                let records = response
                    .data
                    .into_iter()
                    .filter(|record| record.attributes.chapter.is_some())
                    .collect();
                Ok(OffsetPage {
                    records,
                    total: response.total,
                })
            }
            .boxed()
        });

        let site_base = self.site_base.clone();
        let crawl_target_id = target.crawl_target_id;
        let transform = Box::new(move |record: FeedChapter| {
            chapter_update_from_feed(&site_base, crawl_target_id, record)
        });

        Ok(Box::new(OffsetCursor::new(
            endpoint,
            FEED_PAGE_LIMIT,
            0,
            fetch,
            transform,
        )))
    }

    async fn latest_cover(&self, target: &CrawlTarget) -> Result<Option<CoverImage>, SyncError> {
        let manga_id = manga_id_from_url(&target.url).map_err(|error| SyncError::InvalidTarget {
            target: target.name.clone(),
            reason: error.to_string(),
        })?;
        let endpoint = format!("{}/cover", self.api_base);

        let covers: CoverResponse = self
            .client
            .get(&endpoint)
            .query(&[("manga[]", manga_id.as_str()), ("order[volume]", "desc")])
            .query(&[("limit", "1")])
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|error| SyncError::Source {
                url: endpoint.clone(),
                source: error.into(),
            })?
            .json()
            .await
            .map_err(|error| SyncError::Source {
                url: endpoint.clone(),
                source: error.into(),
            })?;

        let Some(cover) = covers.data.into_iter().next() else {
            return Ok(None);
        };

        let file_name = cover.attributes.file_name;
        let Some(format) = file_name
            .rsplit('.')
            .next()
            .and_then(ImageFormat::from_extension)
        else {
            // Unstorable encoding; leave the existing cover alone.
            return Ok(None);
        };

        let file_url = format!("{}/covers/{manga_id}/{file_name}", self.uploads_base);
        let bytes = self
            .client
            .get(&file_url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(anyhow::Error::from)
            .map_err(|source| SyncError::Source {
                url: file_url.clone(),
                source,
            })?
            .bytes()
            .await
            .map_err(anyhow::Error::from)
            .map_err(|source| SyncError::Source {
                url: file_url.clone(),
                source,
            })?;

        Ok(Some(CoverImage {
            format,
            bytes: bytes.to_vec(),
        }))
    }

    fn search_cursor(
        &self,
        search: &SourceSearch,
    ) -> Result<Box<dyn Cursor<NewCrawlTarget>>, SyncError> {
        let endpoint = format!("{}/manga", self.api_base);

        let client = self.client.clone();
        let fetch_endpoint = endpoint.clone();
        let query = search.query.clone();
        let fetch = Box::new(move |limit: u32, offset: u32| {
            let client = client.clone();
            let endpoint = fetch_endpoint.clone();
            let query = query.clone();
            async move {
                let response: SearchResponse = client
                    .get(&endpoint)
                    .query(&[
                        ("title", query),
                        ("limit", limit.to_string()),
                        ("offset", offset.to_string()),
                    ])
                    .send()
                    .await
                    .context("search request failed")?
                    .error_for_status()
                    .context("search request rejected")?
                    .json()
                    .await
                    .context("malformed search response")?;

                Ok(OffsetPage {
                    records: response.data,
                    total: response.total,
                })
            }
            .boxed()
        });

        let limit = search.limit.unwrap_or(SEARCH_PAGE_LIMIT);
        let offset = search.offset.unwrap_or(0);

        let site_base = self.site_base.clone();
        let search = search.clone();
        let transform = Box::new(move |record: SearchRecord| {
            target_from_search(&site_base, &search, record)
        });

        Ok(Box::new(OffsetCursor::new(
            endpoint, limit, offset, fetch, transform,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_manga_id_from_title_url() {
        let id = manga_id_from_url(
            "https://mangadex.org/title/32d76d19-8a05-4db0-9fc2-e0b0648fe9d0/solo-leveling",
        )
        .unwrap();
        assert_eq!(id, "32d76d19-8a05-4db0-9fc2-e0b0648fe9d0");

        // Slug is optional.
        let id =
            manga_id_from_url("https://mangadex.org/title/32d76d19-8a05-4db0-9fc2-e0b0648fe9d0")
                .unwrap();
        assert_eq!(id, "32d76d19-8a05-4db0-9fc2-e0b0648fe9d0");
    }

    #[test]
    fn rejects_urls_without_title_segment() {
        assert!(manga_id_from_url("https://mangadex.org/chapter/abc").is_err());
        assert!(manga_id_from_url("https://mangadex.org/title/").is_err());
        assert!(manga_id_from_url("not a url").is_err());
    }

    #[test]
    fn feed_record_becomes_observation() {
        let record: FeedChapter = serde_json::from_str(
            r#"{
                "id": "0e8eb4a2-1b5d-4f5c-9666-93b4b4f1a3f0",
                "attributes": { "title": "The Calm", "chapter": "41" }
            }"#,
        )
        .unwrap();

        let update =
            chapter_update_from_feed("https://mangadex.org", CrawlTargetId(3), record).unwrap();
        assert_eq!(update.crawl_target_id, CrawlTargetId(3));
        assert_eq!(update.chapter, 41.0);
        assert_eq!(update.chapter_name.as_deref(), Some("The Calm"));
        assert_eq!(
            update.read_at,
            "https://mangadex.org/chapter/0e8eb4a2-1b5d-4f5c-9666-93b4b4f1a3f0"
        );
        assert!(!update.is_read);
    }

    #[test]
    fn chapter_numbers_are_normalized_to_one_decimal() {
        let record: FeedChapter = serde_json::from_str(
            r#"{ "id": "x", "attributes": { "title": null, "chapter": "12.04" } }"#,
        )
        .unwrap();
        let update =
            chapter_update_from_feed("https://mangadex.org", CrawlTargetId(1), record).unwrap();
        assert_eq!(update.chapter, 12.0);
        assert_eq!(update.chapter_name, None);
    }

    #[test]
    fn feed_record_without_chapter_number_is_an_error() {
        let record: FeedChapter =
            serde_json::from_str(r#"{ "id": "x", "attributes": { "title": "Oneshot", "chapter": null } }"#)
                .unwrap();
        assert!(chapter_update_from_feed("https://mangadex.org", CrawlTargetId(1), record).is_err());
    }

    #[test]
    fn search_record_materializes_a_target() {
        let record: SearchRecord = serde_json::from_str(
            r#"{
                "id": "32d76d19-8a05-4db0-9fc2-e0b0648fe9d0",
                "attributes": { "title": { "en": "Solo Farming In The Tower" } }
            }"#,
        )
        .unwrap();
        let search = SourceSearch::new("solo farming", crate::types::UserId(9));

        let target = target_from_search("https://mangadex.org", &search, record).unwrap();
        assert_eq!(target.name, "Solo Farming In The Tower");
        assert_eq!(
            target.url,
            "https://mangadex.org/title/32d76d19-8a05-4db0-9fc2-e0b0648fe9d0"
        );
        assert_eq!(target.kind, SourceKind::Mangadex);
        assert_eq!(target.user_id, crate::types::UserId(9));
        assert!(target.last_crawled_on.is_none());
    }

    #[test]
    fn search_title_falls_back_to_any_language() {
        let record: SearchRecord = serde_json::from_str(
            r#"{ "id": "x", "attributes": { "title": { "ja": "ソロ農業" } } }"#,
        )
        .unwrap();
        let search = SourceSearch::new("solo", crate::types::UserId(1));
        let target = target_from_search("https://mangadex.org", &search, record).unwrap();
        assert_eq!(target.name, "ソロ農業");
    }
}
