// Copyright 2025 Tokenlens (https://github.com/sochdb/tokenlens)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Conversation fetch client.
//!
//! Bearer-authenticated GET against the backend conversation endpoint
//! with a small fixed-backoff retry budget. A 401/403 refreshes the
//! session token at most once per call chain; a cancellation token lets
//! navigation abort in-flight work.

use crate::auth::SessionAuth;
use crate::error::{BackendError, BackendResult};
use crate::tree::ConversationTree;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Retry knobs for transient backend failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Fixed delay between attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

/// Client for the conversation-tree endpoint.
pub struct ChatBackendClient {
    http: reqwest::Client,
    base_url: String,
    auth: Arc<SessionAuth>,
    retry: RetryPolicy,
}

impl ChatBackendClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        let http = reqwest::Client::new();
        let auth = Arc::new(SessionAuth::new(http.clone(), base_url.clone()));
        Self {
            http,
            base_url,
            auth,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn auth(&self) -> &Arc<SessionAuth> {
        &self.auth
    }

    /// Fetch the full node tree for one conversation.
    pub async fn fetch_conversation(
        &self,
        conversation_id: &str,
        cancel: &CancellationToken,
    ) -> BackendResult<ConversationTree> {
        let mut refreshed = false;
        let mut last_error: Option<BackendError> = None;

        for attempt in 0..self.retry.max_attempts {
            if attempt > 0 {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(BackendError::Cancelled),
                    _ = tokio::time::sleep(self.retry.backoff) => {}
                }
            }

            // An unreachable token endpoint is terminal, not transient.
            let token = self.auth.bearer_token().await?;

            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(BackendError::Cancelled),
                result = self.fetch_once(conversation_id, &token) => result,
            };

            match result {
                Ok(tree) => {
                    debug!(
                        conversation = conversation_id,
                        nodes = tree.mapping.len(),
                        attempt,
                        "fetched conversation tree"
                    );
                    return Ok(tree);
                }
                Err(error) => {
                    if matches!(error, BackendError::Status(401) | BackendError::Status(403))
                        && !refreshed
                    {
                        refreshed = true;
                        self.auth.refresh().await?;
                    } else if !error.is_retryable() {
                        return Err(error);
                    }
                    warn!(
                        conversation = conversation_id,
                        attempt,
                        error = %error,
                        "conversation fetch failed"
                    );
                    last_error = Some(error);
                }
            }
        }

        Err(BackendError::Exhausted {
            attempts: self.retry.max_attempts,
            last: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown".into()),
        })
    }

    async fn fetch_once(
        &self,
        conversation_id: &str,
        token: &str,
    ) -> BackendResult<ConversationTree> {
        let url = format!("{}/backend-api/conversation/{}", self.base_url, conversation_id);
        let response = self.http.get(&url).bearer_auth(token).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::Status(status.as_u16()));
        }
        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_retry_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.backoff, Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let client = ChatBackendClient::new("http://unreachable.invalid");
        client.auth().prime("tok").await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        // The first select observes the cancelled token before the
        // request resolves against the unreachable host.
        let result = client.fetch_conversation("c1", &cancel).await;
        assert!(matches!(
            result,
            Err(BackendError::Cancelled) | Err(BackendError::Http(_))
        ));
    }
}
