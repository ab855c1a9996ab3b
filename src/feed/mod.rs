//! Content Fetcher: pages the upstream activity feed and turns each item
//! into a typed [`FetchedPost`].

pub mod client;
pub mod normalize;
pub mod wire;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::PipelineError;
use crate::models::FetchedPost;
use wire::RawActivity;

// Upper bound on pages per cycle in case upstream ignores the page parameter.
const MAX_PAGES_PER_FETCH: u32 = 500;

/// A paginated source of raw activity items.
#[async_trait]
pub trait ActivitySource: Send + Sync {
    /// One page; an empty page marks the end of the feed.
    async fn fetch_page(
        &self,
        page: u32,
        per_page: u32,
        after: Option<DateTime<Utc>>,
    ) -> Result<Vec<RawActivity>>;

    /// Cheap authenticated round trip used at startup.
    async fn verify(&self) -> Result<()> {
        Ok(())
    }
}

pub struct ContentFetcher {
    source: Arc<dyn ActivitySource>,
    page_size: u32,
}

impl ContentFetcher {
    pub fn new(source: Arc<dyn ActivitySource>, page_size: u32) -> Self {
        Self {
            source,
            page_size: page_size.max(1),
        }
    }

    pub async fn verify_connection(&self) -> Result<(), PipelineError> {
        self.source
            .verify()
            .await
            .map_err(|e| PipelineError::UpstreamUnavailable(format!("{:#}", e)))
    }

    /// All posts newer than `since` (everything when `None`), oldest first.
    /// Any page failure fails the whole fetch; nothing is returned partially.
    pub async fn fetch(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<FetchedPost>, PipelineError> {
        let mut posts = Vec::new();
        let mut page = 1;

        loop {
            let items = self
                .source
                .fetch_page(page, self.page_size, since)
                .await
                .map_err(|e| {
                    PipelineError::UpstreamUnavailable(format!("page {}: {:#}", page, e))
                })?;
            if items.is_empty() {
                break;
            }

            for raw in items {
                let activity_id = raw.id;
                match normalize::normalize_activity(raw) {
                    Ok(post) => {
                        if since.map_or(true, |watermark| post.observed_at > watermark) {
                            posts.push(post);
                        } else {
                            tracing::debug!(
                                "Skipping activity {} observed at {} (not after watermark)",
                                activity_id,
                                post.observed_at
                            );
                        }
                    }
                    Err(reason) => {
                        tracing::warn!("Dropping activity {}: {:?}", activity_id, reason);
                    }
                }
            }

            if page >= MAX_PAGES_PER_FETCH {
                tracing::warn!("Stopping fetch after {} pages", MAX_PAGES_PER_FETCH);
                break;
            }
            page += 1;
        }

        posts.sort_by_key(|post| post.observed_at);
        Ok(posts)
    }
}
