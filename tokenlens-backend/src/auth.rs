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

//! Session authentication.
//!
//! The backend derives a bearer token from the host session. The token
//! is cached in memory for the process lifetime and refreshed
//! reactively when the backend answers 401/403, never proactively.

use crate::error::{BackendError, BackendResult};
use tokio::sync::RwLock;
use tracing::debug;

/// Bearer-token source backed by the host session endpoint.
pub struct SessionAuth {
    client: reqwest::Client,
    base_url: String,
    token: RwLock<Option<String>>,
}

impl SessionAuth {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            token: RwLock::new(None),
        }
    }

    /// The cached token, fetching it from the session endpoint on
    /// first use.
    pub async fn bearer_token(&self) -> BackendResult<String> {
        if let Some(token) = self.token.read().await.clone() {
            return Ok(token);
        }
        self.refresh().await
    }

    /// Drop the cached token and fetch a fresh one.
    pub async fn refresh(&self) -> BackendResult<String> {
        let mut guard = self.token.write().await;
        debug!("refreshing session token");
        let token = self.fetch_session_token().await?;
        *guard = Some(token.clone());
        Ok(token)
    }

    /// Seed the cache without hitting the network. Used when the host
    /// page already handed us a token, and by tests.
    pub async fn prime(&self, token: impl Into<String>) {
        *self.token.write().await = Some(token.into());
    }

    async fn fetch_session_token(&self) -> BackendResult<String> {
        let url = format!("{}/api/auth/session", self.base_url);
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::Auth(format!(
                "session endpoint returned {status}"
            )));
        }

        let body: serde_json::Value = response.json().await?;
        body.get("accessToken")
            .and_then(|t| t.as_str())
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .ok_or_else(|| BackendError::Auth("session response carried no access token".into()))
    }
}
