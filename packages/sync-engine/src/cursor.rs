//! Source-agnostic pagination cursors.
//!
//! One uniform consumption loop drives two structurally different retrieval
//! strategies: offset/limit API pagination ([`OffsetCursor`]) and
//! link-following HTML pagination ([`LinkCursor`]). End-of-data is decided by
//! the source's "more" signal (remaining count, or absence of a next-page
//! link), never by how many records a page transformed to.

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::error::SyncError;

/// A stateful pagination object over one external source's result stream.
#[async_trait]
pub trait Cursor<T>: Send {
    /// Whether another page may be fetched. Always true before the first
    /// fetch (the source hasn't told us otherwise yet).
    fn has_next(&self) -> bool;

    /// Fetches exactly one page, advances the cursor position and recomputes
    /// [`Cursor::has_next`]. Fails with [`SyncError::ExhaustedCursor`] when
    /// called on a drained cursor.
    async fn next(&mut self) -> Result<Vec<T>, SyncError>;
}

/// One page of an offset-paginated response.
pub struct OffsetPage<D> {
    pub records: Vec<D>,
    /// Total records available at the source, as reported by this page.
    pub total: u64,
}

type OffsetFetchFn<D> =
    Box<dyn Fn(u32, u32) -> BoxFuture<'static, anyhow::Result<OffsetPage<D>>> + Send + Sync>;
type RecordTransformFn<D, T> = Box<dyn Fn(D) -> anyhow::Result<T> + Send + Sync>;

/// Cursor over an offset/limit paginated API.
///
/// After each fetch, `remaining = total - (offset + limit)`; the cursor is
/// drained once `remaining` reaches zero.
pub struct OffsetCursor<D, T> {
    endpoint: String,
    limit: u32,
    offset: u32,
    remaining: Option<i64>,
    fetch: OffsetFetchFn<D>,
    transform: RecordTransformFn<D, T>,
}

impl<D, T> OffsetCursor<D, T> {
    /// `endpoint` identifies the source in errors and logs.
    pub fn new(
        endpoint: impl Into<String>,
        limit: u32,
        offset: u32,
        fetch: OffsetFetchFn<D>,
        transform: RecordTransformFn<D, T>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            limit,
            offset,
            remaining: None,
            fetch,
            transform,
        }
    }
}

#[async_trait]
impl<D: Send + 'static, T: Send> Cursor<T> for OffsetCursor<D, T> {
    fn has_next(&self) -> bool {
        // Unknown until the first fetch reports a total.
        self.remaining.map_or(true, |remaining| remaining > 0)
    }

    async fn next(&mut self) -> Result<Vec<T>, SyncError> {
        if !self.has_next() {
            return Err(SyncError::ExhaustedCursor {
                endpoint: self.endpoint.clone(),
            });
        }

        let page = (self.fetch)(self.limit, self.offset)
            .await
            .map_err(|source| SyncError::Source {
                url: self.endpoint.clone(),
                source,
            })?;

        self.offset += self.limit;
        self.remaining = Some(page.total as i64 - self.offset as i64);

        page.records
            .into_iter()
            .map(|record| {
                (self.transform)(record).map_err(|source| SyncError::Source {
                    url: self.endpoint.clone(),
                    source,
                })
            })
            .collect()
    }
}

type HtmlFetchFn =
    Box<dyn Fn(String) -> BoxFuture<'static, anyhow::Result<String>> + Send + Sync>;
type NextLinkFn = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;
type PageTransformFn<T> = Box<dyn Fn(&str) -> anyhow::Result<Vec<T>> + Send + Sync>;

/// Cursor over link-paginated HTML pages.
///
/// Every fetched page is scanned for a next-page link (which becomes the new
/// position) and for zero-or-more records via the page transform. Unlike
/// [`OffsetCursor`], reading a page and extracting its items are conflated.
pub struct LinkCursor<T> {
    url: Option<String>,
    last_url: String,
    fetch: HtmlFetchFn,
    next_link: NextLinkFn,
    transform: PageTransformFn<T>,
}

impl<T> LinkCursor<T> {
    pub fn new(
        url: impl Into<String>,
        fetch: HtmlFetchFn,
        next_link: NextLinkFn,
        transform: PageTransformFn<T>,
    ) -> Self {
        let url = url.into();
        Self {
            last_url: url.clone(),
            url: Some(url),
            fetch,
            next_link,
            transform,
        }
    }
}

#[async_trait]
impl<T: Send> Cursor<T> for LinkCursor<T> {
    fn has_next(&self) -> bool {
        self.url.is_some()
    }

    async fn next(&mut self) -> Result<Vec<T>, SyncError> {
        let url = self.url.clone().ok_or_else(|| SyncError::ExhaustedCursor {
            endpoint: self.last_url.clone(),
        })?;

        let html = (self.fetch)(url.clone())
            .await
            .map_err(|source| SyncError::Source {
                url: url.clone(),
                source,
            })?;

        // Point towards the next page of data, if the page links one.
        self.url = (self.next_link)(&html);
        self.last_url = url.clone();

        (self.transform)(&html).map_err(|source| SyncError::Source { url, source })
    }
}
