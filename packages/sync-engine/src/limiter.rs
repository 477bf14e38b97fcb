//! Shared concurrency gates.
//!
//! A sync pass schedules work against these limiters but does not own them;
//! they are process-scoped and shared across every concurrent sync.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::types::SourceKind;

/// A concurrency ceiling over one resource class (a source, or the store).
#[derive(Clone)]
pub struct Limiter {
    semaphore: Arc<Semaphore>,
}

impl Limiter {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
        }
    }

    /// Runs `fut` once a permit is available, holding the permit for the
    /// duration of the future.
    pub async fn run<F, T>(&self, fut: F) -> T
    where
        F: Future<Output = T>,
    {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .expect("limiter semaphore closed");
        fut.await
    }
}

/// The three independent gates shared across one sync pass: one per source
/// kind (bounding outbound requests) and one for the store (bounding open
/// transactions).
#[derive(Clone)]
pub struct SyncLimiters {
    pub mangadex: Limiter,
    pub webtoon: Limiter,
    pub store: Limiter,
}

impl SyncLimiters {
    pub fn new(mangadex: usize, webtoon: usize, store: usize) -> Self {
        Self {
            mangadex: Limiter::new(mangadex),
            webtoon: Limiter::new(webtoon),
            store: Limiter::new(store),
        }
    }

    pub fn for_kind(&self, kind: SourceKind) -> &Limiter {
        match kind {
            SourceKind::Mangadex => &self.mangadex,
            SourceKind::Webtoon => &self.webtoon,
        }
    }
}

impl Default for SyncLimiters {
    fn default() -> Self {
        // One outbound request per source at a time; the store tolerates far
        // more concurrent transactions.
        Self::new(1, 1, 50)
    }
}
