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

//! Backend error types

use thiserror::Error;

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Errors raised while talking to the conversation backend
#[derive(Debug, Error)]
pub enum BackendError {
    /// Session endpoint unreachable or returned no token
    #[error("no session token available: {0}")]
    Auth(String),

    /// Transport-level failure
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-2xx response from the backend
    #[error("unexpected status {0}")]
    Status(u16),

    /// In-flight request aborted by navigation
    #[error("request cancelled")]
    Cancelled,

    /// Retry budget used up
    #[error("all {attempts} fetch attempts failed, last error: {last}")]
    Exhausted { attempts: u32, last: String },
}

impl BackendError {
    /// Whether the fetch loop should try again after this error.
    ///
    /// 401/403 are retryable because the first occurrence triggers a
    /// token refresh; the refresh itself happens at most once per call
    /// chain.
    pub fn is_retryable(&self) -> bool {
        match self {
            BackendError::Http(_) => true,
            BackendError::Status(code) => {
                *code >= 500 || *code == 401 || *code == 403 || *code == 429
            }
            BackendError::Auth(_) | BackendError::Cancelled | BackendError::Exhausted { .. } => {
                false
            }
        }
    }
}
