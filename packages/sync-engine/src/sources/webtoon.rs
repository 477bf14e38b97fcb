//! Webtoon adapter: link-paginated HTML scraping.
//!
//! `scraper::Html` is not `Send`, so parsing is confined to synchronous
//! helpers over `&str`; only strings cross await points.

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use reqwest::header::REFERER;
use scraper::{Html, Selector};
use url::Url;

use crate::cursor::{Cursor, LinkCursor};
use crate::error::SyncError;
use crate::sources::{ChapterSource, SourceSearch};
use crate::types::{
    CoverImage, CrawlTarget, CrawlTargetId, ImageFormat, NewChapterUpdate, NewCrawlTarget,
    SourceKind,
};

pub const WEBTOON_BASE: &str = "https://www.webtoons.com";

pub struct WebtoonSource {
    client: reqwest::Client,
    base: String,
}

impl WebtoonSource {
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_base(client, WEBTOON_BASE)
    }

    pub fn with_base(client: reqwest::Client, base: impl Into<String>) -> Self {
        Self {
            client,
            base: base.into(),
        }
    }
}

fn sel(selectors: &str) -> anyhow::Result<Selector> {
    Selector::parse(selectors).map_err(|error| anyhow::anyhow!("invalid selector: {error}"))
}

/// Normalizes a stored target URL into the first episode-list page.
///
/// The `title_no` query parameter is what identifies the series; without it
/// the site serves an error page, so its absence makes the target unsyncable.
fn episode_list_url(target_url: &str) -> anyhow::Result<String> {
    let mut url = Url::parse(target_url).with_context(|| format!("invalid target url {target_url}"))?;

    let title_no = url
        .query_pairs()
        .find(|(key, _)| key == "title_no")
        .map(|(_, value)| value.to_string())
        .with_context(|| format!("no title_no parameter in {target_url}"))?;

    url.query_pairs_mut()
        .clear()
        .append_pair("title_no", &title_no)
        .append_pair("page", "1");
    Ok(url.to_string())
}

#[derive(Debug, Clone, PartialEq)]
struct EpisodeItem {
    chapter: f64,
    name: Option<String>,
    href: String,
}

/// Extracts episode rows from an episode-list page. Rows whose episode badge
/// does not parse as a number are skipped.
fn parse_episode_items(html: &str) -> anyhow::Result<Vec<EpisodeItem>> {
    let document = Html::parse_document(html);
    let item_selector = sel("._episodeItem")?;
    let badge_selector = sel(".tx")?;
    let name_selector = sel(".subj > span")?;
    let link_selector = sel("a")?;

    let mut items = Vec::new();
    for element in document.select(&item_selector) {
        let Some(badge) = element.select(&badge_selector).next() else {
            continue;
        };
        let badge_text: String = badge.text().collect();
        let Ok(chapter) = badge_text.trim().trim_start_matches('#').parse::<f64>() else {
            continue;
        };

        let name = element.select(&name_selector).next().map(|name| {
            name.text().collect::<String>().trim().to_string()
        });

        let href = element
            .select(&link_selector)
            .next()
            .and_then(|anchor| anchor.value().attr("href"))
            .context("episode row has no link")?
            .to_string();

        items.push(EpisodeItem {
            chapter,
            name: name.filter(|name| !name.is_empty()),
            href,
        });
    }
    Ok(items)
}

/// Finds the next-page link. The pager marks the current page with an
/// `href="#"` anchor; its immediate sibling points at the next page. Returns
/// `None` on the last page.
fn parse_next_link(html: &str, base: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let selector = sel(".paginate > [href='#'] + a").ok()?;
    let href = document
        .select(&selector)
        .next()?
        .value()
        .attr("href")?
        .to_string();

    if href.starts_with("http") {
        Some(href)
    } else {
        Some(format!("{base}{href}"))
    }
}

/// The series cover, published as the page's OpenGraph image.
fn parse_cover_url(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let selector = sel(r#"meta[property="og:image"]"#).ok()?;
    document
        .select(&selector)
        .next()?
        .value()
        .attr("content")
        .map(str::to_string)
}

fn observation_from_item(crawl_target_id: CrawlTargetId, item: EpisodeItem) -> NewChapterUpdate {
    let now = Utc::now();
    NewChapterUpdate {
        crawl_target_id,
        crawled_on: now,
        chapter: item.chapter,
        chapter_name: item.name,
        is_read: false,
        read_at: item.href,
        date_created: now,
    }
}

#[derive(Debug, Clone, PartialEq)]
struct SearchCard {
    name: String,
    href: String,
}

/// Extracts result cards from a search page.
fn parse_search_cards(html: &str, base: &str) -> anyhow::Result<Vec<SearchCard>> {
    let document = Html::parse_document(html);
    let card_selector = sel(".card_lst > li")?;
    let name_selector = sel(".info > p.subj")?;
    let link_selector = sel("a.card_item")?;

    let mut cards = Vec::new();
    for card in document.select(&card_selector) {
        let Some(name) = card.select(&name_selector).next() else {
            continue;
        };
        let name: String = name.text().collect::<String>().trim().to_string();

        let Some(href) = card
            .select(&link_selector)
            .next()
            .and_then(|anchor| anchor.value().attr("href"))
        else {
            continue;
        };

        let href = if href.starts_with("http") {
            href.to_string()
        } else {
            format!("{base}{href}")
        };
        cards.push(SearchCard { name, href });
    }
    Ok(cards)
}

async fn fetch_page(client: &reqwest::Client, url: &str) -> anyhow::Result<String> {
    client
        .get(url)
        .send()
        .await
        .with_context(|| format!("request to {url} failed"))?
        .error_for_status()
        .with_context(|| format!("request to {url} rejected"))?
        .text()
        .await
        .with_context(|| format!("failed to read body from {url}"))
}

#[async_trait]
impl ChapterSource for WebtoonSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Webtoon
    }

    fn chapter_cursor(
        &self,
        target: &CrawlTarget,
    ) -> Result<Box<dyn Cursor<NewChapterUpdate>>, SyncError> {
        let start = episode_list_url(&target.url).map_err(|error| SyncError::InvalidTarget {
            target: target.name.clone(),
            reason: error.to_string(),
        })?;

        let client = self.client.clone();
        let fetch = Box::new(move |url: String| {
            let client = client.clone();
            async move { fetch_page(&client, &url).await }.boxed()
        });

        let base = self.base.clone();
        let next_link = Box::new(move |html: &str| parse_next_link(html, &base));

        let crawl_target_id = target.crawl_target_id;
        let transform = Box::new(move |html: &str| {
            let items = parse_episode_items(html)?;
            Ok(items
                .into_iter()
                .map(|item| observation_from_item(crawl_target_id, item))
                .collect())
        });

        Ok(Box::new(LinkCursor::new(start, fetch, next_link, transform)))
    }

    async fn latest_cover(&self, target: &CrawlTarget) -> Result<Option<CoverImage>, SyncError> {
        let page_url = episode_list_url(&target.url).map_err(|error| SyncError::InvalidTarget {
            target: target.name.clone(),
            reason: error.to_string(),
        })?;

        let html = fetch_page(&self.client, &page_url)
            .await
            .map_err(|source| SyncError::Source {
                url: page_url.clone(),
                source,
            })?;

        let Some(cover_url) = parse_cover_url(&html) else {
            return Ok(None);
        };

        // The image CDN refuses requests without a site referer.
        let response = self
            .client
            .get(&cover_url)
            .header(REFERER, self.base.as_str())
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(anyhow::Error::from)
            .map_err(|source| SyncError::Source {
                url: cover_url.clone(),
                source,
            })?;

        let format = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .and_then(ImageFormat::from_content_type)
            .or_else(|| {
                cover_url
                    .rsplit('.')
                    .next()
                    .and_then(ImageFormat::from_extension)
            });
        let Some(format) = format else {
            return Ok(None);
        };

        let bytes = response
            .bytes()
            .await
            .map_err(anyhow::Error::from)
            .map_err(|source| SyncError::Source {
                url: cover_url.clone(),
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
        let mut start = Url::parse(&self.base)
            .and_then(|base| base.join("/en/search"))
            .map_err(|error| SyncError::InvalidTarget {
                target: search.query.clone(),
                reason: error.to_string(),
            })?;
        start
            .query_pairs_mut()
            .append_pair("keyword", &search.query);

        let client = self.client.clone();
        let fetch = Box::new(move |url: String| {
            let client = client.clone();
            async move { fetch_page(&client, &url).await }.boxed()
        });

        let base = self.base.clone();
        let next_link = Box::new(move |html: &str| parse_next_link(html, &base));

        let card_base = self.base.clone();
        let user_id = search.user_id;
        let transform = Box::new(move |html: &str| {
            let cards = parse_search_cards(html, &card_base)?;
            Ok(cards
                .into_iter()
                .map(|card| NewCrawlTarget {
                    name: card.name,
                    url: card.href,
                    kind: SourceKind::Webtoon,
                    last_crawled_on: None,
                    crawl_success: None,
                    user_id,
                    cover: None,
                    favourite: false,
                })
                .collect())
        });

        Ok(Box::new(LinkCursor::new(
            start.to_string(),
            fetch,
            next_link,
            transform,
        )))
    }
}
