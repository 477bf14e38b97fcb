use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Unique identifier for a crawl target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CrawlTargetId(pub i32);

impl fmt::Display for CrawlTargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Unique identifier for a chapter update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UpdateId(pub i32);

impl fmt::Display for UpdateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of the user who owns a crawl target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub i32);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Which source adapter handles a crawl target. Immutable after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// REST API source with offset/limit pagination
    Mangadex,
    /// HTML source paginated by next-page links
    Webtoon,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Mangadex => "mangadex",
            SourceKind::Webtoon => "webtoon",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "mangadex" => Some(SourceKind::Mangadex),
            "webtoon" => Some(SourceKind::Webtoon),
            _ => None,
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encoding of a stored cover image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Jpeg,
}

impl ImageFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpeg",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "png" => Some(ImageFormat::Png),
            "jpeg" => Some(ImageFormat::Jpeg),
            _ => None,
        }
    }

    /// Infers a format from a file extension (`"png"`, `"jpg"`, ...).
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "png" => Some(ImageFormat::Png),
            "jpg" | "jpeg" => Some(ImageFormat::Jpeg),
            _ => None,
        }
    }

    /// Infers a format from an HTTP content type.
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        match content_type.split(';').next().unwrap_or("").trim() {
            "image/png" => Some(ImageFormat::Png),
            "image/jpeg" | "image/jpg" => Some(ImageFormat::Jpeg),
            _ => None,
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cover art fetched from a source, stored alongside its crawl target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverImage {
    pub format: ImageFormat,
    pub bytes: Vec<u8>,
}

impl CoverImage {
    /// Content signature over the raw bytes, used for change detection.
    pub fn signature(&self) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(&self.bytes);
        hasher.finalize().to_vec()
    }

    pub fn signature_hex(&self) -> String {
        hex::encode(self.signature())
    }
}

/// A tracked source of content.
///
/// The reconciler and orchestrator only ever mutate `last_crawled_on`,
/// `crawl_success` and the cover fields; everything else is owned by the
/// creating caller.
#[derive(Debug, Clone)]
pub struct CrawlTarget {
    pub crawl_target_id: CrawlTargetId,
    pub name: String,
    pub url: String,
    pub kind: SourceKind,
    /// `None` means "never crawled".
    pub last_crawled_on: Option<DateTime<Utc>>,
    pub crawl_success: Option<bool>,
    pub user_id: UserId,
    /// Projected out of reads unless explicitly requested.
    pub cover: Option<CoverImage>,
    pub cover_signature: Option<Vec<u8>>,
    pub favourite: bool,
}

/// A crawl target that has not been persisted yet, as produced by an
/// explicit add or by source-search materialization.
#[derive(Debug, Clone)]
pub struct NewCrawlTarget {
    pub name: String,
    pub url: String,
    pub kind: SourceKind,
    pub last_crawled_on: Option<DateTime<Utc>>,
    pub crawl_success: Option<bool>,
    pub user_id: UserId,
    pub cover: Option<CoverImage>,
    pub favourite: bool,
}

/// One observed installment (chapter) of a crawl target's content.
///
/// `(crawl_target_id, chapter)` is the natural key under tolerant equality
/// at one decimal place; see [`crate::float::scale_equals`].
#[derive(Debug, Clone, PartialEq)]
pub struct ChapterUpdate {
    pub update_id: UpdateId,
    pub crawl_target_id: CrawlTargetId,
    /// When this observation was made by a crawl.
    pub crawled_on: DateTime<Utc>,
    /// Chapter number; may be fractional (half-chapters).
    pub chapter: f64,
    pub chapter_name: Option<String>,
    /// Reader-owned; never touched by reconciliation.
    pub is_read: bool,
    /// Link to read the chapter.
    pub read_at: String,
    /// When this row was first persisted; never touched by reconciliation.
    pub date_created: DateTime<Utc>,
}

/// A chapter observation produced by a source adapter, before persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct NewChapterUpdate {
    pub crawl_target_id: CrawlTargetId,
    pub crawled_on: DateTime<Utc>,
    pub chapter: f64,
    pub chapter_name: Option<String>,
    pub is_read: bool,
    pub read_at: String,
    pub date_created: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_kind_round_trips() {
        for kind in [SourceKind::Mangadex, SourceKind::Webtoon] {
            assert_eq!(SourceKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(SourceKind::parse("tapas"), None);
    }

    #[test]
    fn image_format_from_extension() {
        assert_eq!(ImageFormat::from_extension("PNG"), Some(ImageFormat::Png));
        assert_eq!(ImageFormat::from_extension("jpg"), Some(ImageFormat::Jpeg));
        assert_eq!(ImageFormat::from_extension("jpeg"), Some(ImageFormat::Jpeg));
        assert_eq!(ImageFormat::from_extension("webp"), None);
    }

    #[test]
    fn image_format_from_content_type() {
        assert_eq!(
            ImageFormat::from_content_type("image/jpeg; charset=binary"),
            Some(ImageFormat::Jpeg)
        );
        assert_eq!(ImageFormat::from_content_type("image/png"), Some(ImageFormat::Png));
        assert_eq!(ImageFormat::from_content_type("text/html"), None);
    }

    #[test]
    fn cover_signature_tracks_content() {
        let a = CoverImage {
            format: ImageFormat::Png,
            bytes: vec![1, 2, 3],
        };
        let b = CoverImage {
            format: ImageFormat::Png,
            bytes: vec![1, 2, 3],
        };
        let c = CoverImage {
            format: ImageFormat::Png,
            bytes: vec![4, 5, 6],
        };
        assert_eq!(a.signature(), b.signature());
        assert_ne!(a.signature(), c.signature());
    }
}
