use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, StatusCode};
use serde_json::Value;

use super::wire::RawActivity;
use super::ActivitySource;
use crate::auth::TokenProvider;

/// REST client for the BuddyBoss activity endpoint.
pub struct ActivityClient {
    base_url: String,
    tokens: Arc<dyn TokenProvider>,
    client: Client,
}

impl ActivityClient {
    pub fn new(base_url: String, tokens: Arc<dyn TokenProvider>, client: Client) -> Self {
        Self {
            base_url,
            tokens,
            client,
        }
    }

    async fn get_activity(
        &self,
        token: &str,
        query: &[(&str, String)],
    ) -> Result<reqwest::Response> {
        let url = format!("{}/activity", self.base_url);
        self.client
            .get(&url)
            .bearer_auth(token)
            .query(query)
            .send()
            .await
            .context("Failed to send activity request")
    }

    /// One authenticated GET; an expired token is refreshed and the request retried once.
    async fn get_with_refresh(&self, query: &[(&str, String)]) -> Result<reqwest::Response> {
        let token = self
            .tokens
            .current_token()
            .await
            .context("Failed to obtain upstream token")?;
        let response = self.get_activity(&token, query).await?;

        if matches!(
            response.status(),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
        ) {
            tracing::info!("Upstream rejected token ({}), refreshing", response.status());
            let token = self
                .tokens
                .refresh()
                .await
                .context("Failed to refresh upstream token")?;
            return self.get_activity(&token, query).await;
        }

        Ok(response)
    }
}

#[async_trait]
impl ActivitySource for ActivityClient {
    async fn fetch_page(
        &self,
        page: u32,
        per_page: u32,
        after: Option<DateTime<Utc>>,
    ) -> Result<Vec<RawActivity>> {
        let mut query = vec![("per_page", per_page.to_string()), ("page", page.to_string())];
        if let Some(after) = after {
            query.push(("after", after.to_rfc3339_opts(SecondsFormat::Secs, true)));
        }

        let response = self.get_with_refresh(&query).await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Activity page {} returned error {}: {}", page, status, body);
        }

        let items: Vec<Value> = response
            .json()
            .await
            .with_context(|| format!("Failed to parse activity page {}", page))?;

        Ok(items
            .into_iter()
            .filter_map(|item| match serde_json::from_value::<RawActivity>(item) {
                Ok(raw) => Some(raw),
                Err(e) => {
                    tracing::warn!("Skipping unreadable activity item on page {}: {}", page, e);
                    None
                }
            })
            .collect())
    }

    async fn verify(&self) -> Result<()> {
        let query = [("per_page", "1".to_string()), ("page", "1".to_string())];
        let response = self.get_with_refresh(&query).await?;
        if !response.status().is_success() {
            anyhow::bail!("Upstream verification returned {}", response.status());
        }
        Ok(())
    }
}
