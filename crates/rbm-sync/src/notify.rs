//! Outbound push messages for alerts, reminders and staff notices.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use rbm_storage::{classify_reqwest_error, classify_status, BackoffPolicy, RetryDisposition};
use reqwest::StatusCode;
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SendError {
    #[error("push request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("push api answered {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("push sender is not configured")]
    NotConfigured,
}

impl SendError {
    pub fn is_retryable(&self) -> bool {
        match self {
            SendError::Request(err) => classify_reqwest_error(err) == RetryDisposition::Retryable,
            SendError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(|s| classify_status(s) == RetryDisposition::Retryable)
                .unwrap_or(false),
            SendError::NotConfigured => false,
        }
    }
}

/// Delivers one text message to one recipient id.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn push(&self, recipient: &str, text: &str) -> Result<(), SendError>;
}

/// Client for a LINE-style push endpoint: `{to, messages: [{type: "text", text}]}`.
#[derive(Debug, Clone)]
pub struct PushApiSender {
    client: reqwest::Client,
    url: String,
    token: String,
}

impl PushApiSender {
    pub fn new(url: impl Into<String>, token: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building push client")?;
        Ok(Self {
            client,
            url: url.into(),
            token: token.into(),
        })
    }
}

#[async_trait]
impl MessageSender for PushApiSender {
    async fn push(&self, recipient: &str, text: &str) -> Result<(), SendError> {
        if self.token.is_empty() {
            return Err(SendError::NotConfigured);
        }
        let body = json!({
            "to": recipient,
            "messages": [{ "type": "text", "text": text }],
        });
        let resp = self
            .client
            .post(&self.url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(SendError::HttpStatus {
            status: status.as_u16(),
            body,
        })
    }
}

/// Logs messages instead of sending them and keeps them for inspection.
#[derive(Debug, Default)]
pub struct DryRunSender {
    sent: Mutex<Vec<(String, String)>>,
}

impl DryRunSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl MessageSender for DryRunSender {
    async fn push(&self, recipient: &str, text: &str) -> Result<(), SendError> {
        let preview: String = text.chars().take(30).collect();
        info!(recipient, preview = %preview, "dry run, message not sent");
        self.sent.lock().await.push((recipient.to_string(), text.to_string()));
        Ok(())
    }
}

/// Retry policy used for every outbound message: three attempts in total.
pub fn message_backoff() -> BackoffPolicy {
    BackoffPolicy {
        max_retries: 2,
        base_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(8),
    }
}

/// Push with exponential backoff on retryable failures.
pub async fn send_with_retry(
    sender: &dyn MessageSender,
    recipient: &str,
    text: &str,
    policy: &BackoffPolicy,
) -> Result<(), SendError> {
    let mut attempt = 0usize;
    loop {
        match sender.push(recipient, text).await {
            Ok(()) => {
                debug!(recipient, attempt, "message delivered");
                return Ok(());
            }
            Err(err) if err.is_retryable() && attempt < policy.max_retries => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(recipient, attempt, error = %err, ?delay, "message send failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                warn!(recipient, attempt, error = %err, "message send failed");
                return Err(err);
            }
        }
    }
}

/// Fire-and-forget delivery: failures are logged and swallowed.
pub async fn send_best_effort(
    sender: &dyn MessageSender,
    recipient: &str,
    text: &str,
    policy: &BackoffPolicy,
) -> bool {
    send_with_retry(sender, recipient, text, policy).await.is_ok()
}
