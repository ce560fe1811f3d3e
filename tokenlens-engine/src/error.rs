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

//! Engine error types

use thiserror::Error;
use tokenlens_backend::BackendError;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur while computing a budget
#[derive(Debug, Error)]
pub enum EngineError {
    /// Backend fetch or auth failure
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// Configuration file problem
    #[error("configuration error: {0}")]
    Config(String),

    /// State persistence problem
    #[error("state store error: {0}")]
    Store(String),
}
