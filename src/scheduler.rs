use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::PipelineError;
use crate::feed::ContentFetcher;
use crate::store::PostStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchReport {
    pub fetched: usize,
    pub inserted: usize,
}

/// Drives the initial full fetch and the periodic watermark-bounded fetches.
pub struct FetchScheduler {
    fetcher: Arc<ContentFetcher>,
    store: Arc<PostStore>,
    interval: Duration,
    connect_retry: Duration,
}

impl FetchScheduler {
    pub fn new(
        fetcher: Arc<ContentFetcher>,
        store: Arc<PostStore>,
        interval: Duration,
        connect_retry: Duration,
    ) -> Self {
        Self {
            fetcher,
            store,
            interval,
            connect_retry,
        }
    }

    /// Fetch everything newer than `since` and insert it. Duplicates are skipped.
    pub async fn run_cycle(&self, since: Option<DateTime<Utc>>) -> Result<FetchReport, PipelineError> {
        let posts = self.fetcher.fetch(since).await?;
        let mut report = FetchReport {
            fetched: posts.len(),
            inserted: 0,
        };

        for post in &posts {
            match self.store.insert(post) {
                Ok(true) => report.inserted += 1,
                Ok(false) => {}
                Err(e) => {
                    return Err(PipelineError::from_store(
                        e.context(format!("insert activity {}", post.activity_id)),
                    ));
                }
            }
        }

        tracing::info!(
            "Fetch cycle: {} fetched, {} new (since {:?})",
            report.fetched,
            report.inserted,
            since
        );
        Ok(report)
    }

    /// Verify upstream access, retrying once after `connect_retry`. Returns
    /// whether access was confirmed; callers keep running either way.
    pub async fn verify_with_retry(&self) -> bool {
        match self.fetcher.verify_connection().await {
            Ok(()) => return true,
            Err(e) => {
                tracing::warn!(
                    "{}; retrying in {}s",
                    e,
                    self.connect_retry.as_secs()
                );
            }
        }

        tokio::time::sleep(self.connect_retry).await;
        match self.fetcher.verify_connection().await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("{}; continuing, fetch cycles will keep retrying", e);
                false
            }
        }
    }

    async fn cycle_from_watermark(&self) {
        let since = match self.store.latest_timestamp() {
            Ok(since) => since,
            Err(e) => {
                tracing::error!("Failed to read fetch watermark: {:#}", e);
                return;
            }
        };
        if let Err(e) = self.run_cycle(Some(since)).await {
            tracing::error!("Fetch cycle skipped: {}", e);
        }
    }

    pub async fn run(self: Arc<Self>) {
        self.verify_with_retry().await;

        tracing::info!("Fetching all posts on first run");
        if let Err(e) = self.run_cycle(None).await {
            tracing::error!("Initial fetch failed: {}", e);
        }

        loop {
            tokio::time::sleep(self.interval).await;
            self.cycle_from_watermark().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::testing::StaticFeed;
    use serde_json::json;
    use std::sync::atomic::Ordering;

    fn item(id: i64, date: &str) -> serde_json::Value {
        json!({
            "id": id,
            "user_id": 311,
            "name": "Dilaur",
            "date": date,
            "content_stripped": format!("Abenteuer {} Basic Cut", id)
        })
    }

    fn scheduler(feed: Arc<StaticFeed>, store: Arc<PostStore>) -> FetchScheduler {
        FetchScheduler::new(
            Arc::new(ContentFetcher::new(feed, 100)),
            store,
            Duration::from_secs(3600),
            Duration::from_millis(10),
        )
    }

    #[tokio::test]
    async fn cycle_inserts_new_posts_once() {
        let feed = Arc::new(StaticFeed::new(vec![vec![
            item(1, "2024-03-01T08:00:00"),
            item(2, "2024-03-02T08:00:00"),
        ]]));
        let store = Arc::new(PostStore::in_memory().expect("store"));
        let scheduler = scheduler(feed, store.clone());

        let first = scheduler.run_cycle(None).await.expect("cycle");
        assert_eq!(first, FetchReport { fetched: 2, inserted: 2 });
        let second = scheduler.run_cycle(None).await.expect("cycle");
        assert_eq!(second, FetchReport { fetched: 2, inserted: 0 });
        assert_eq!(store.unprocessed_count().unwrap(), 2);
    }

    #[tokio::test]
    async fn watermark_cycle_sends_latest_timestamp() {
        let feed = Arc::new(StaticFeed::new(vec![vec![item(1, "2024-03-01T08:00:00")]]));
        let store = Arc::new(PostStore::in_memory().expect("store"));
        let scheduler = scheduler(feed.clone(), store.clone());

        scheduler.run_cycle(None).await.expect("cycle");
        scheduler.cycle_from_watermark().await;

        let requested = feed.requested.lock().unwrap().clone();
        let watermark = store.latest_timestamp().unwrap();
        assert!(requested.iter().any(|(_, after)| *after == Some(watermark)));
        assert_eq!(store.unprocessed_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn upstream_failure_skips_cycle_without_writes() {
        let mut feed = StaticFeed::new(vec![vec![item(1, "2024-03-01T08:00:00")]]);
        feed.fail_on_page = Some(1);
        let store = Arc::new(PostStore::in_memory().expect("store"));
        let scheduler = scheduler(Arc::new(feed), store.clone());

        let err = scheduler.run_cycle(None).await.unwrap_err();
        assert!(matches!(err, PipelineError::UpstreamUnavailable(_)));
        assert_eq!(store.unprocessed_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn verification_retries_once() {
        let feed = Arc::new(StaticFeed::new(vec![]));
        feed.verify_failures.store(1, Ordering::SeqCst);
        let store = Arc::new(PostStore::in_memory().expect("store"));
        let scheduler = scheduler(feed.clone(), store);

        assert!(scheduler.verify_with_retry().await);
        assert_eq!(feed.verify_calls.load(Ordering::SeqCst), 2);

        feed.verify_failures.store(5, Ordering::SeqCst);
        assert!(!scheduler.verify_with_retry().await);
        assert_eq!(feed.verify_calls.load(Ordering::SeqCst), 4);
    }
}
