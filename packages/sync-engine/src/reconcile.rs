//! Reconciliation of observed chapter records into stored state.
//!
//! Each observed record is matched against the stored updates of its target
//! using tolerant chapter equality, then either inserted, patched with the
//! minimal drift diff, or left alone. The whole decision runs inside one
//! exclusive transaction so concurrent syncs cannot double-insert.

use tracing::warn;

use crate::error::SyncError;
use crate::float::scale_equals;
use crate::storage::{Store, StoreTx, UpdatePatch};
use crate::types::{ChapterUpdate, NewChapterUpdate, UpdateId};

/// Chapter numbers are compared at one decimal place; finer precision is
/// presentation noise from the sources, not distinct chapters.
pub const CHAPTER_SCALE: u32 = 1;

/// What reconciliation decided for one observed record.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcilePlan {
    Insert,
    Patch {
        update_id: UpdateId,
        patch: UpdatePatch,
    },
    Noop {
        update_id: UpdateId,
    },
}

/// How one observed record was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    Inserted(UpdateId),
    Patched(UpdateId),
    Unchanged(UpdateId),
}

/// True when `existing` and `observed` describe the same chapter of the same
/// target.
fn is_related(existing: &ChapterUpdate, observed: &NewChapterUpdate) -> bool {
    existing.crawl_target_id == observed.crawl_target_id
        && scale_equals(existing.chapter, observed.chapter, CHAPTER_SCALE)
}

/// The minimal patch taking `existing` to `observed`. Only the fields the
/// source is authoritative for are eligible; `is_read`, `chapter` and
/// `date_created` belong to the stored row and are never touched.
fn diff(existing: &ChapterUpdate, observed: &NewChapterUpdate) -> UpdatePatch {
    let mut patch = UpdatePatch::default();
    if existing.crawled_on != observed.crawled_on {
        patch.crawled_on = Some(observed.crawled_on);
    }
    if existing.chapter_name != observed.chapter_name {
        patch.chapter_name = Some(observed.chapter_name.clone());
    }
    if existing.read_at != observed.read_at {
        patch.read_at = Some(observed.read_at.clone());
    }
    patch
}

/// Pure reconciliation decision over the target's stored updates.
pub fn plan(existing: &[ChapterUpdate], observed: &NewChapterUpdate) -> ReconcilePlan {
    match existing.iter().find(|update| is_related(update, observed)) {
        None => ReconcilePlan::Insert,
        Some(update) => {
            let patch = diff(update, observed);
            if patch.is_empty() {
                ReconcilePlan::Noop {
                    update_id: update.update_id,
                }
            } else {
                ReconcilePlan::Patch {
                    update_id: update.update_id,
                    patch,
                }
            }
        }
    }
}

async fn drive(
    tx: &mut dyn StoreTx,
    observed: &NewChapterUpdate,
) -> anyhow::Result<Reconciliation> {
    tx.lock_updates().await?;
    let existing = tx.updates_for_target(observed.crawl_target_id).await?;

    match plan(&existing, observed) {
        ReconcilePlan::Insert => {
            let row = tx.insert_update(observed).await?;
            Ok(Reconciliation::Inserted(row.update_id))
        }
        ReconcilePlan::Patch { update_id, patch } => {
            tx.patch_update(update_id, &patch)
                .await?
                .ok_or_else(|| anyhow::anyhow!("chapter update {update_id} vanished mid-patch"))?;
            Ok(Reconciliation::Patched(update_id))
        }
        ReconcilePlan::Noop { update_id } => Ok(Reconciliation::Unchanged(update_id)),
    }
}

/// Reconciles one observed record inside its own exclusive transaction.
///
/// On any failure the transaction is rolled back and the store is untouched;
/// a clean no-op decision still commits (committing an empty transaction is
/// harmless and keeps the control flow uniform).
pub async fn reconcile(
    store: &dyn Store,
    observed: &NewChapterUpdate,
) -> Result<Reconciliation, SyncError> {
    let mut tx = store.begin().await?;

    match drive(tx.as_mut(), observed).await {
        Ok(outcome) => {
            tx.commit().await.map_err(SyncError::Reconciliation)?;
            Ok(outcome)
        }
        Err(error) => {
            if let Err(rollback_error) = tx.rollback().await {
                warn!(
                    crawl_target_id = %observed.crawl_target_id,
                    error = %rollback_error,
                    "rollback failed after reconciliation error"
                );
            }
            Err(SyncError::Reconciliation(error))
        }
    }
}
