use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Supplies the bearer credential for the upstream content platform.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Cached token, obtained on first use.
    async fn current_token(&self) -> Result<String>;

    /// Discard the cached token and authenticate again.
    async fn refresh(&self) -> Result<String>;
}

#[derive(Debug, Serialize)]
struct JwtAuthorizeRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct JwtAuthorizeResponse {
    #[serde(default)]
    token: Option<String>,
}

/// Username/password exchange against the BuddyBoss `jwt-authorize` endpoint.
pub struct JwtTokenProvider {
    base_url: String,
    username: String,
    password: String,
    client: Client,
    cached: RwLock<Option<String>>,
}

impl JwtTokenProvider {
    pub fn new(base_url: String, username: String, password: String, client: Client) -> Self {
        Self {
            base_url,
            username,
            password,
            client,
            cached: RwLock::new(None),
        }
    }

    async fn authorize(&self) -> Result<String> {
        let url = format!("{}/jwt-authorize", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&JwtAuthorizeRequest {
                username: &self.username,
                password: &self.password,
            })
            .send()
            .await
            .context("Failed to send JWT authorize request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("JWT authorize returned error {}: {}", status, body);
        }

        let parsed: JwtAuthorizeResponse = response
            .json()
            .await
            .context("Failed to parse JWT authorize response")?;

        parsed
            .token
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("JWT authorize response carried no token"))
    }
}

#[async_trait]
impl TokenProvider for JwtTokenProvider {
    async fn current_token(&self) -> Result<String> {
        if let Some(token) = self.cached.read().await.clone() {
            return Ok(token);
        }
        self.refresh().await
    }

    async fn refresh(&self) -> Result<String> {
        let mut guard = self.cached.write().await;
        *guard = None;
        let token = self.authorize().await?;
        tracing::info!("Obtained upstream JWT token");
        *guard = Some(token.clone());
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorize_response_tolerates_missing_token() {
        let parsed: JwtAuthorizeResponse =
            serde_json::from_str(r#"{"message":"invalid credentials"}"#).unwrap();
        assert!(parsed.token.is_none());

        let parsed: JwtAuthorizeResponse = serde_json::from_str(r#"{"token":"abc"}"#).unwrap();
        assert_eq!(parsed.token.as_deref(), Some("abc"));
    }
}
