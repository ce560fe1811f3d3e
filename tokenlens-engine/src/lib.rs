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

//! Tokenlens Engine
//!
//! Caching, persisted user state, change detection and the budget
//! engine that glues fetch, normalize and allocate together.

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod scheduler;
pub mod store;

pub use cache::{CachedConversation, TreeCache, TreeCacheConfig, TreeCacheStats};
pub use config::EngineConfig;
pub use engine::BudgetEngine;
pub use error::{EngineError, EngineResult};
pub use fingerprint::{Fingerprint, FingerprintInputs};
pub use scheduler::{
    spawn, PageProbe, PageState, Recompute, SchedulerConfig, SchedulerHandle, TriggerReason,
};
pub use store::{ConversationPrefs, Settings, StateStore, StoreEvent, DEFAULT_TOKEN_LIMIT};
