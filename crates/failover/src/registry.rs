//! Webhook endpoint registration.
//!
//! When the controller fails over, the provider's webhook must be repointed
//! at the newly active relay. The [`WebhookEndpointRegistry`] trait is the
//! seam; the production implementation drives the GitHub repository hooks
//! API.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

const GITHUB_API_URL: &str = "https://api.github.com";

/// Repoints the provider's webhook at a relay instance.
#[async_trait]
pub trait WebhookEndpointRegistry: Send + Sync {
    /// Point the webhook at `url`. Must only return `Ok` once the provider
    /// has confirmed the change.
    async fn set_target(&self, url: &str) -> Result<()>;
}

/// GitHub webhook configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    pub content_type: String,
    #[serde(default)]
    pub insecure_ssl: String,
}

/// GitHub webhook as returned by the hooks API.
#[derive(Debug, Clone, Deserialize)]
pub struct Webhook {
    pub id: u64,
    pub active: bool,
    pub events: Vec<String>,
    pub config: WebhookConfig,
}

#[derive(Debug, Serialize)]
struct HookRequest {
    name: String,
    active: bool,
    events: Vec<String>,
    config: WebhookConfig,
}

/// GitHub-backed registry for a single `owner/repo` hook.
#[derive(Debug, Clone)]
pub struct GitHubWebhookRegistry {
    client: reqwest::Client,
    token: String,
    owner: String,
    repo: String,
    api_url: String,
    events: Vec<String>,
}

impl GitHubWebhookRegistry {
    /// Create a registry client for one repository.
    ///
    /// # Errors
    ///
    /// Returns an error if the repo is not `owner/name` or the HTTP client
    /// cannot be created.
    pub fn new(token: &str, repo: &str) -> Result<Self> {
        let (owner, name) = repo
            .split_once('/')
            .ok_or_else(|| anyhow!("invalid repository format (expected owner/repo): {repo}"))?;

        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/vnd.github+json"),
        );
        headers.insert(
            "X-GitHub-Api-Version",
            HeaderValue::from_static("2022-11-28"),
        );
        headers.insert(USER_AGENT, HeaderValue::from_static("deploy-failover/1.0"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            token: token.to_string(),
            owner: owner.to_string(),
            repo: name.to_string(),
            api_url: GITHUB_API_URL.to_string(),
            events: vec!["ping".to_string(), "workflow_run".to_string()],
        })
    }

    /// Point the client at a different API base. Test hook.
    #[must_use]
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    async fn list_webhooks(&self) -> Result<Vec<Webhook>> {
        let url = format!(
            "{}/repos/{}/{}/hooks",
            self.api_url, self.owner, self.repo
        );

        let response = self
            .client
            .get(&url)
            .header(AUTHORIZATION, format!("Bearer {}", self.token))
            .send()
            .await
            .context("Failed to send request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("GitHub API error: {status} - {body}"));
        }

        response
            .json()
            .await
            .context("Failed to parse webhook list response")
    }

    async fn update_webhook(&self, hook_id: u64, webhook_url: &str) -> Result<Webhook> {
        let url = format!(
            "{}/repos/{}/{}/hooks/{hook_id}",
            self.api_url, self.owner, self.repo
        );

        let request = HookRequest {
            name: "web".to_string(),
            active: true,
            events: self.events.clone(),
            config: WebhookConfig {
                url: webhook_url.to_string(),
                content_type: "json".to_string(),
                insecure_ssl: "0".to_string(),
            },
        };

        let response = self
            .client
            .patch(&url)
            .header(AUTHORIZATION, format!("Bearer {}", self.token))
            .json(&request)
            .send()
            .await
            .context("Failed to send update webhook request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("GitHub API error updating webhook: {status} - {body}"));
        }

        response
            .json()
            .await
            .context("Failed to parse update webhook response")
    }

    async fn create_webhook(&self, webhook_url: &str) -> Result<Webhook> {
        let url = format!(
            "{}/repos/{}/{}/hooks",
            self.api_url, self.owner, self.repo
        );

        let request = HookRequest {
            name: "web".to_string(),
            active: true,
            events: self.events.clone(),
            config: WebhookConfig {
                url: webhook_url.to_string(),
                content_type: "json".to_string(),
                insecure_ssl: "0".to_string(),
            },
        };

        let response = self
            .client
            .post(&url)
            .header(AUTHORIZATION, format!("Bearer {}", self.token))
            .json(&request)
            .send()
            .await
            .context("Failed to send create webhook request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("GitHub API error creating webhook: {status} - {body}"));
        }

        response
            .json()
            .await
            .context("Failed to parse create webhook response")
    }
}

#[async_trait]
impl WebhookEndpointRegistry for GitHubWebhookRegistry {
    /// Repoint the repository hook at `url`, creating it if absent.
    ///
    /// Idempotent: a hook that already targets `url` is left untouched.
    async fn set_target(&self, url: &str) -> Result<()> {
        debug!(owner = %self.owner, repo = %self.repo, target = %url, "Updating webhook target");

        let existing = self.list_webhooks().await?;

        if let Some(hook) = existing.iter().find(|h| h.config.url == url) {
            if hook.active {
                info!(hook_id = hook.id, target = %url, "Webhook already points at target");
                return Ok(());
            }
        }

        // The relay hook is whichever existing hook the controller manages;
        // identified by targeting the deploy path.
        if let Some(hook) = existing
            .iter()
            .find(|h| h.config.url.ends_with("/webhook/deploy"))
        {
            let updated = self.update_webhook(hook.id, url).await?;
            info!(hook_id = updated.id, target = %url, "Webhook repointed");
            return Ok(());
        }

        let created = self.create_webhook(url).await?;
        info!(hook_id = created.id, target = %url, "Webhook created");
        Ok(())
    }
}
