use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::MatchingError;
use crate::models::MatchingGroup;

/// Errors that can occur when syncing a chat group
#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error("HTTP request failed: {0}")]
    RequestError(#[from] reqwest::Error),

    #[error("Chat service returned {status}: {body}")]
    ApiError { status: u16, body: String },
}

impl ProvisioningError {
    /// Network failures, 429 and 5xx are worth another attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            ProvisioningError::RequestError(_) => true,
            ProvisioningError::ApiError { status, .. } => *status == 429 || *status >= 500,
        }
    }
}

/// Desired membership of one chat group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionRequest {
    pub group_id: Uuid,
    pub event_id: String,
    pub member_user_ids: Vec<String>,
}

impl ProvisionRequest {
    pub fn for_group(event_id: &str, group: &MatchingGroup) -> Self {
        Self {
            group_id: group.id,
            event_id: event_id.to_string(),
            member_user_ids: group.active_member_ids(),
        }
    }
}

/// Downstream chat service; a sync call replaces the group's membership
#[async_trait]
pub trait ChatProvisioner: Send + Sync {
    async fn sync_group(&self, request: &ProvisionRequest) -> Result<(), ProvisioningError>;
}

/// Chat service client over HTTP
pub struct HttpChatProvisioner {
    endpoint: String,
    api_key: Option<String>,
    client: Client,
}

impl HttpChatProvisioner {
    pub fn new(
        endpoint: String,
        api_key: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self, ProvisioningError> {
        let client = Client::builder().timeout(request_timeout).build()?;

        Ok(Self {
            endpoint,
            api_key,
            client,
        })
    }
}

#[async_trait]
impl ChatProvisioner for HttpChatProvisioner {
    async fn sync_group(&self, request: &ProvisionRequest) -> Result<(), ProvisioningError> {
        let url = format!("{}/chat-groups/sync", self.endpoint.trim_end_matches('/'));

        tracing::debug!("Syncing chat group {} via {}", request.group_id, url);

        let mut builder = self.client.post(&url).json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProvisioningError::ApiError {
                status: status.as_u16(),
                body,
            });
        }

        Ok(())
    }
}

/// Used when no chat endpoint is configured
pub struct LoggingProvisioner;

#[async_trait]
impl ChatProvisioner for LoggingProvisioner {
    async fn sync_group(&self, request: &ProvisionRequest) -> Result<(), ProvisioningError> {
        tracing::info!(
            group_id = %request.group_id,
            event_id = %request.event_id,
            members = request.member_user_ids.len(),
            "Chat provisioning disabled, skipping sync"
        );
        Ok(())
    }
}

/// Retry policy with exponential backoff
///
/// Backoff doubles after each failed attempt and is capped at `max_backoff_ms`.
/// Non-retryable errors stop immediately.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_backoff_ms: u64, max_backoff_ms: u64) -> Self {
        Self {
            max_retries,
            initial_backoff_ms,
            max_backoff_ms: max_backoff_ms.max(initial_backoff_ms),
        }
    }

    /// Backoff before retry number `attempt` (0-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let ms = self.initial_backoff_ms.saturating_mul(factor);
        Duration::from_millis(ms.min(self.max_backoff_ms))
    }

    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> Result<T, ProvisioningError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProvisioningError>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.max_retries => {
                    let delay = self.backoff(attempt);
                    tracing::warn!(
                        "Provisioning attempt {} failed: {}; retrying in {:?}",
                        attempt + 1,
                        err,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Pushes group membership to the chat service off the request path
#[derive(Clone)]
pub struct ProvisioningDispatcher {
    provisioner: Arc<dyn ChatProvisioner>,
    retry: RetryPolicy,
}

impl ProvisioningDispatcher {
    pub fn new(provisioner: Arc<dyn ChatProvisioner>, retry: RetryPolicy) -> Self {
        Self { provisioner, retry }
    }

    pub fn disabled() -> Self {
        Self::new(Arc::new(LoggingProvisioner), RetryPolicy::default())
    }

    /// Spawn one sync task per group; failures never reach the caller
    ///
    /// The handles are returned so tests can wait for delivery.
    pub fn dispatch(&self, event_id: &str, groups: &[MatchingGroup]) -> Vec<JoinHandle<()>> {
        groups
            .iter()
            .map(|group| {
                let request = ProvisionRequest::for_group(event_id, group);
                let provisioner = Arc::clone(&self.provisioner);
                let retry = self.retry.clone();

                tokio::spawn(async move {
                    let result = retry
                        .execute(|| provisioner.sync_group(&request))
                        .await;

                    match result {
                        Ok(()) => tracing::debug!("Chat group {} synced", request.group_id),
                        Err(err) => {
                            let failure = MatchingError::ProvisioningFailed {
                                group_id: request.group_id,
                                reason: err.to_string(),
                            };
                            tracing::error!(event_id = %request.event_id, "{}", failure);
                        }
                    }
                })
            })
            .collect()
    }
}
