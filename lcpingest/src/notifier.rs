//! Registration of protected content with the LCP server.
//!
//! The [`ContentNotifier`] trait abstracts the call so the pipeline can be tested without a
//! running LCP server; [`LcpServerNotifier`] is the production implementation.

use crate::api::models::publications::PublicationRecord;
use crate::config::LcpServerConfig;
use crate::content_id::ContentId;
use crate::errors::{Error, Result};
use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use url::Url;

/// Status the LCP server acknowledged the registration with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotificationOutcome {
    pub status: u16,
}

#[async_trait]
pub trait ContentNotifier: Send + Sync {
    /// Register `record` under `content_id`.
    ///
    /// # Errors
    /// - [`Error::Notification`] when the server answers with anything but 2xx or 302
    /// - [`Error::NotificationTransport`] when the server cannot be reached or does not answer in time
    async fn notify(&self, content_id: &ContentId, record: &PublicationRecord) -> Result<NotificationOutcome>;
}

/// `PUT <base>/contents/<id>` with basic auth.
#[derive(Clone)]
pub struct LcpServerNotifier {
    client: reqwest::Client,
    base_url: Url,
    username: String,
    password: String,
}

impl LcpServerNotifier {
    pub fn new(base_url: Url, username: impl Into<String>, password: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        // Redirects are not followed: a 302 is an acknowledgement
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("Failed to create LCP server HTTP client")?;

        Ok(Self {
            client,
            base_url,
            username: username.into(),
            password: password.into(),
        })
    }

    pub fn from_config(config: &LcpServerConfig) -> anyhow::Result<Self> {
        let base_url = config.url.clone().context("lcp_server.url is not configured")?;
        Self::new(base_url, &config.username, &config.password, config.timeout)
    }

    /// The content id becomes a single, percent-encoded path segment.
    pub fn content_url(&self, content_id: &ContentId) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| Error::NotificationTransport {
                message: format!("{} cannot be used as a base URL", self.base_url),
            })?
            .pop_if_empty()
            .push("contents")
            .push(content_id.as_str());
        Ok(url)
    }
}

fn is_acknowledged(status: StatusCode) -> bool {
    status.is_success() || status == StatusCode::FOUND
}

#[async_trait]
impl ContentNotifier for LcpServerNotifier {
    #[tracing::instrument(skip(self, record), fields(content_id = %content_id))]
    async fn notify(&self, content_id: &ContentId, record: &PublicationRecord) -> Result<NotificationOutcome> {
        let url = self.content_url(content_id)?;
        tracing::debug!(url = %url, "Notifying LCP server");

        let response = self
            .client
            .put(url.clone())
            .basic_auth(&self.username, Some(&self.password))
            .json(record)
            .send()
            .await
            .map_err(|e| {
                let message = format!("{:#}", anyhow::Error::from(e));
                tracing::error!(url = %url, error = %message, "LCP server request failed");
                Error::NotificationTransport { message }
            })?;

        let status = response.status();
        if !is_acknowledged(status) {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = status.as_u16(), body = %body, "LCP server rejected content");
            return Err(Error::Notification { status: status.as_u16() });
        }

        tracing::info!(status = status.as_u16(), "LCP server acknowledged content");
        Ok(NotificationOutcome { status: status.as_u16() })
    }
}
