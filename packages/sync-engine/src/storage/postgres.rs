use anyhow::Context;
use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};

use super::{Store, StoreTx, TargetFilter, TargetPatch, UpdateFilter, UpdatePatch};
use crate::types::{
    ChapterUpdate, CoverImage, CrawlTarget, CrawlTargetId, ImageFormat, NewChapterUpdate,
    NewCrawlTarget, SourceKind, UpdateId, UserId,
};

const TARGET_COLUMNS: &str =
    "crawl_target_id, name, url, adapter, last_crawled_on, crawl_success, user_id, \
     cover_signature, favourite";
const TARGET_COLUMNS_WITH_COVER: &str =
    "crawl_target_id, name, url, adapter, last_crawled_on, crawl_success, user_id, \
     cover_signature, favourite, cover_image, cover_format";
const UPDATE_COLUMNS: &str =
    "update_id, crawl_target_id, crawled_on, chapter, chapter_name, is_read, read_at, \
     date_created";

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn target_from_row(row: &PgRow, with_cover: bool) -> anyhow::Result<CrawlTarget> {
    let adapter: String = row.get("adapter");
    let kind = SourceKind::parse(&adapter)
        .with_context(|| format!("unknown adapter '{adapter}' in crawl_target row"))?;

    let cover = if with_cover {
        let bytes: Option<Vec<u8>> = row.get("cover_image");
        let format: Option<String> = row.get("cover_format");
        match (bytes, format) {
            (Some(bytes), Some(format)) => Some(CoverImage {
                format: ImageFormat::parse(&format)
                    .with_context(|| format!("unknown cover format '{format}'"))?,
                bytes,
            }),
            _ => None,
        }
    } else {
        None
    };

    Ok(CrawlTarget {
        crawl_target_id: CrawlTargetId(row.get("crawl_target_id")),
        name: row.get("name"),
        url: row.get("url"),
        kind,
        last_crawled_on: row.get("last_crawled_on"),
        crawl_success: row.get("crawl_success"),
        user_id: UserId(row.get("user_id")),
        cover,
        cover_signature: row.get("cover_signature"),
        favourite: row.get("favourite"),
    })
}

fn update_from_row(row: &PgRow) -> ChapterUpdate {
    ChapterUpdate {
        update_id: UpdateId(row.get("update_id")),
        crawl_target_id: CrawlTargetId(row.get("crawl_target_id")),
        crawled_on: row.get("crawled_on"),
        chapter: row.get("chapter"),
        chapter_name: row.get("chapter_name"),
        is_read: row.get("is_read"),
        read_at: row.get("read_at"),
        date_created: row.get("date_created"),
    }
}

/// Builds the `UPDATE chapter_update SET ... WHERE update_id = $n RETURNING`
/// statement for a partial update. Columns come from a typed mapping, never
/// from caller-supplied strings.
fn build_update_patch<'a>(
    update_id: UpdateId,
    patch: &'a UpdatePatch,
) -> QueryBuilder<'a, Postgres> {
    let mut qb = QueryBuilder::new("UPDATE chapter_update SET ");
    let mut set = qb.separated(", ");
    if let Some(crawled_on) = patch.crawled_on {
        set.push("crawled_on = ").push_bind_unseparated(crawled_on);
    }
    if let Some(chapter_name) = &patch.chapter_name {
        set.push("chapter_name = ")
            .push_bind_unseparated(chapter_name.clone());
    }
    if let Some(read_at) = &patch.read_at {
        set.push("read_at = ").push_bind_unseparated(read_at.clone());
    }
    qb.push(" WHERE update_id = ").push_bind(update_id.0);
    qb.push(" RETURNING ");
    qb.push(UPDATE_COLUMNS);
    qb
}

fn build_target_patch<'a>(
    crawl_target_id: CrawlTargetId,
    patch: &'a TargetPatch,
) -> QueryBuilder<'a, Postgres> {
    let mut qb = QueryBuilder::new("UPDATE crawl_target SET ");
    let mut set = qb.separated(", ");
    if let Some(last_crawled_on) = patch.last_crawled_on {
        set.push("last_crawled_on = ")
            .push_bind_unseparated(last_crawled_on);
    }
    if let Some(crawl_success) = patch.crawl_success {
        set.push("crawl_success = ")
            .push_bind_unseparated(crawl_success);
    }
    if let Some(cover) = &patch.cover {
        set.push("cover_image = ")
            .push_bind_unseparated(cover.bytes.clone());
        set.push("cover_format = ")
            .push_bind_unseparated(cover.format.as_str());
        set.push("cover_signature = ")
            .push_bind_unseparated(cover.signature());
    }
    qb.push(" WHERE crawl_target_id = ").push_bind(crawl_target_id.0);
    qb.push(" RETURNING ");
    qb.push(TARGET_COLUMNS_WITH_COVER);
    qb
}

#[async_trait]
impl Store for PostgresStore {
    async fn begin(&self) -> anyhow::Result<Box<dyn StoreTx>> {
        let tx = self
            .pool
            .begin()
            .await
            .context("failed to open store transaction")?;
        Ok(Box::new(PostgresTx { tx }))
    }

    async fn list_targets(&self, filter: &TargetFilter) -> anyhow::Result<Vec<CrawlTarget>> {
        let mut qb = QueryBuilder::new("SELECT ");
        qb.push(if filter.with_cover {
            TARGET_COLUMNS_WITH_COVER
        } else {
            TARGET_COLUMNS
        });
        qb.push(" FROM crawl_target");

        let mut has_where = false;
        if let Some(user_id) = filter.user_id {
            qb.push(" WHERE user_id = ").push_bind(user_id.0);
            has_where = true;
        }
        if let Some(crawl_target_id) = filter.crawl_target_id {
            qb.push(if has_where { " AND " } else { " WHERE " });
            qb.push("crawl_target_id = ").push_bind(crawl_target_id.0);
        }
        qb.push(" ORDER BY crawl_target_id");

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .context("failed to list crawl targets")?;
        rows.iter()
            .map(|row| target_from_row(row, filter.with_cover))
            .collect()
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
        let (cover_image, cover_format, cover_signature) = match &target.cover {
            Some(cover) => (
                Some(cover.bytes.clone()),
                Some(cover.format.as_str()),
                Some(cover.signature()),
            ),
            None => (None, None, None),
        };

        let row = sqlx::query(
            r#"
            INSERT INTO crawl_target (
                name, url, adapter, last_crawled_on, crawl_success, user_id,
                cover_image, cover_format, cover_signature, favourite
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING crawl_target_id, name, url, adapter, last_crawled_on, crawl_success,
                      user_id, cover_signature, favourite, cover_image, cover_format
            "#,
        )
        .bind(&target.name)
        .bind(&target.url)
        .bind(target.kind.as_str())
        .bind(target.last_crawled_on)
        .bind(target.crawl_success)
        .bind(target.user_id.0)
        .bind(cover_image)
        .bind(cover_format)
        .bind(cover_signature)
        .bind(target.favourite)
        .fetch_one(&self.pool)
        .await
        .context("failed to insert crawl target")?;

        target_from_row(&row, true)
    }

    async fn update_target(
        &self,
        crawl_target_id: CrawlTargetId,
        patch: &TargetPatch,
    ) -> anyhow::Result<Option<CrawlTarget>> {
        anyhow::ensure!(!patch.is_empty(), "must update at least one property");

        let mut qb = build_target_patch(crawl_target_id, patch);
        let row = qb
            .build()
            .fetch_optional(&self.pool)
            .await
            .context("failed to update crawl target")?;
        row.map(|row| target_from_row(&row, true)).transpose()
    }

    async fn list_updates(&self, filter: &UpdateFilter) -> anyhow::Result<Vec<ChapterUpdate>> {
        let mut qb = QueryBuilder::new(
            "SELECT update_id, chapter_update.crawl_target_id, crawled_on, chapter, \
             chapter_name, is_read, read_at, date_created FROM chapter_update",
        );
        if filter.user_id.is_some() {
            qb.push(" INNER JOIN crawl_target USING (crawl_target_id)");
        }

        let mut has_where = false;
        if let Some(user_id) = filter.user_id {
            qb.push(" WHERE user_id = ").push_bind(user_id.0);
            has_where = true;
        }
        if let Some(crawl_target_id) = filter.crawl_target_id {
            qb.push(if has_where { " AND " } else { " WHERE " });
            qb.push("chapter_update.crawl_target_id = ")
                .push_bind(crawl_target_id.0);
            has_where = true;
        }
        if let Some(chapter) = filter.chapter {
            qb.push(if has_where { " AND " } else { " WHERE " });
            qb.push("chapter = ").push_bind(chapter);
        }
        qb.push(" ORDER BY update_id");

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .context("failed to list chapter updates")?;
        Ok(rows.iter().map(update_from_row).collect())
    }

    async fn set_update_read(
        &self,
        update_id: UpdateId,
        is_read: bool,
        user_id: Option<UserId>,
    ) -> anyhow::Result<Option<ChapterUpdate>> {
        let row = match user_id {
            Some(user_id) => {
                sqlx::query(
                    r#"
                    UPDATE chapter_update cu
                    SET is_read = $1
                    FROM crawl_target ct
                    WHERE cu.update_id = $2
                      AND cu.crawl_target_id = ct.crawl_target_id
                      AND ct.user_id = $3
                    RETURNING cu.update_id, cu.crawl_target_id, cu.crawled_on, cu.chapter,
                              cu.chapter_name, cu.is_read, cu.read_at, cu.date_created
                    "#,
                )
                .bind(is_read)
                .bind(update_id.0)
                .bind(user_id.0)
                .fetch_optional(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    r#"
                    UPDATE chapter_update
                    SET is_read = $1
                    WHERE update_id = $2
                    RETURNING update_id, crawl_target_id, crawled_on, chapter,
                              chapter_name, is_read, read_at, date_created
                    "#,
                )
                .bind(is_read)
                .bind(update_id.0)
                .fetch_optional(&self.pool)
                .await
            }
        }
        .context("failed to set read flag")?;

        Ok(row.map(|row| update_from_row(&row)))
    }
}

pub struct PostgresTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTx for PostgresTx {
    async fn lock_updates(&mut self) -> anyhow::Result<()> {
        // Coarse by design: serializes every concurrent reconciliation
        // system-wide so no interleaving can duplicate a chapter.
        sqlx::query("LOCK TABLE chapter_update IN ACCESS EXCLUSIVE MODE")
            .execute(&mut *self.tx)
            .await
            .context("failed to lock chapter_update")?;
        Ok(())
    }

    async fn updates_for_target(
        &mut self,
        crawl_target_id: CrawlTargetId,
    ) -> anyhow::Result<Vec<ChapterUpdate>> {
        let rows = sqlx::query(&format!(
            "SELECT {UPDATE_COLUMNS} FROM chapter_update WHERE crawl_target_id = $1"
        ))
        .bind(crawl_target_id.0)
        .fetch_all(&mut *self.tx)
        .await
        .context("failed to read chapter updates in transaction")?;
        Ok(rows.iter().map(update_from_row).collect())
    }

    async fn insert_update(&mut self, update: &NewChapterUpdate) -> anyhow::Result<ChapterUpdate> {
        let row = sqlx::query(
            r#"
            INSERT INTO chapter_update (
                crawl_target_id, crawled_on, chapter, chapter_name, is_read, read_at,
                date_created
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING update_id, crawl_target_id, crawled_on, chapter, chapter_name,
                      is_read, read_at, date_created
            "#,
        )
        .bind(update.crawl_target_id.0)
        .bind(update.crawled_on)
        .bind(update.chapter)
        .bind(&update.chapter_name)
        .bind(update.is_read)
        .bind(&update.read_at)
        .bind(update.date_created)
        .fetch_one(&mut *self.tx)
        .await
        .context("failed to insert chapter update")?;
        Ok(update_from_row(&row))
    }

    async fn patch_update(
        &mut self,
        update_id: UpdateId,
        patch: &UpdatePatch,
    ) -> anyhow::Result<Option<ChapterUpdate>> {
        anyhow::ensure!(!patch.is_empty(), "must update at least one property");

        let mut qb = build_update_patch(update_id, patch);
        let row = qb
            .build()
            .fetch_optional(&mut *self.tx)
            .await
            .context("failed to patch chapter update")?;
        Ok(row.map(|row| update_from_row(&row)))
    }

    async fn commit(self: Box<Self>) -> anyhow::Result<()> {
        self.tx.commit().await.context("failed to commit transaction")
    }

    async fn rollback(self: Box<Self>) -> anyhow::Result<()> {
        self.tx
            .rollback()
            .await
            .context("failed to roll back transaction")
    }
}
