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

//! Tokenlens Backend
//!
//! Session auth, conversation-tree fetch, and normalization of the
//! backend's duck-typed node tree into the core conversation model.

pub mod auth;
pub mod client;
pub mod error;
pub mod normalize;
pub mod tree;

pub use auth::SessionAuth;
pub use client::{ChatBackendClient, RetryPolicy};
pub use error::{BackendError, BackendResult};
pub use normalize::normalize;
pub use tree::{ConversationTree, TreeNode};
