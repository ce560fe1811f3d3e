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

//! Engine configuration.

use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration for one engine instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Host application origin.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Quiet period after a mutation burst before recomputing.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Time-to-live for cached conversation trees.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Maximum number of cached conversation trees.
    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: u64,

    /// Per-message role/formatting overhead in tokens.
    #[serde(default = "default_message_overhead")]
    pub message_overhead: usize,

    /// Element classes of our own injected UI; mutations below these
    /// never trigger a recompute.
    #[serde(default = "default_ignored_classes")]
    pub ignored_classes: Vec<String>,
}

fn default_base_url() -> String {
    "https://chatgpt.com".to_string()
}

fn default_debounce_ms() -> u64 {
    2_000
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_cache_max_entries() -> u64 {
    64
}

fn default_message_overhead() -> usize {
    tokenlens_core::DEFAULT_MESSAGE_OVERHEAD_TOKENS
}

fn default_ignored_classes() -> Vec<String> {
    vec![
        "tokenlens-panel".to_string(),
        "tokenlens-badge".to_string(),
        "tokenlens-modal".to_string(),
    ]
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            debounce_ms: default_debounce_ms(),
            cache_ttl_secs: default_cache_ttl_secs(),
            cache_max_entries: default_cache_max_entries(),
            message_overhead: default_message_overhead(),
            ignored_classes: default_ignored_classes(),
        }
    }
}

impl EngineConfig {
    /// Load from a TOML file; a missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("reading {}: {e}", path.display())))?;
        toml::from_str(&raw)
            .map_err(|e| EngineError::Config(format!("parsing {}: {e}", path.display())))
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}
