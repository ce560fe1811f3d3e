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

//! Persisted user state.
//!
//! Settings plus per-conversation selections (checked items, memory
//! flag) in one JSON document on disk. Selections deliberately live
//! outside the tree cache and carry no TTL. Every mutation broadcasts
//! a [`StoreEvent`] so the scheduler can react to storage changes.
//!
//! An unreadable or malformed state file falls back to defaults; it is
//! logged and never fatal.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Default context-window limit in tokens.
pub const DEFAULT_TOKEN_LIMIT: usize = 128_000;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Globally scoped settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_token_limit")]
    pub token_limit: usize,
    #[serde(default = "default_true")]
    pub scripting_enabled: bool,
    #[serde(default)]
    pub global_system_prompt: String,
}

fn default_token_limit() -> usize {
    DEFAULT_TOKEN_LIMIT
}

fn default_true() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            token_limit: default_token_limit(),
            scripting_enabled: true,
            global_system_prompt: String::new(),
        }
    }
}

/// Per-conversation user choices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationPrefs {
    /// Checked attachment/canvas ids. Sorted so the persisted file is
    /// stable across saves.
    #[serde(default)]
    pub checked_items: BTreeSet<String>,
    #[serde(default = "default_true")]
    pub memory_enabled: bool,
}

impl Default for ConversationPrefs {
    fn default() -> Self {
        Self {
            checked_items: BTreeSet::new(),
            memory_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PersistedState {
    #[serde(default)]
    settings: Settings,
    #[serde(default)]
    conversations: HashMap<String, ConversationPrefs>,
}

/// Change notification for watched keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    SettingsChanged,
    SelectionChanged { conversation_id: String },
    MemoryToggled { conversation_id: String },
}

/// Key-value style store with change notifications.
pub struct StateStore {
    path: Option<PathBuf>,
    state: RwLock<PersistedState>,
    events: broadcast::Sender<StoreEvent>,
}

impl StateStore {
    /// Volatile store, nothing written to disk.
    pub fn in_memory() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            path: None,
            state: RwLock::new(PersistedState::default()),
            events,
        }
    }

    /// Load from a JSON file. Missing or corrupt state is a miss, not
    /// an error: the store starts from defaults.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let state = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(state) => state,
                Err(error) => {
                    warn!(path = %path.display(), %error, "corrupt state file, starting fresh");
                    PersistedState::default()
                }
            },
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no state file yet");
                PersistedState::default()
            }
            Err(error) => {
                warn!(path = %path.display(), %error, "unreadable state file, starting fresh");
                PersistedState::default()
            }
        };
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            path: Some(path),
            state: RwLock::new(state),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub fn settings(&self) -> Settings {
        self.state.read().settings.clone()
    }

    pub fn update_settings(&self, mutate: impl FnOnce(&mut Settings)) {
        {
            let mut state = self.state.write();
            mutate(&mut state.settings);
            self.persist(&state);
        }
        let _ = self.events.send(StoreEvent::SettingsChanged);
    }

    /// Checked item ids for allocation (membership checks).
    pub fn checked_items(&self, conversation_id: &str) -> HashSet<String> {
        self.state
            .read()
            .conversations
            .get(conversation_id)
            .map(|prefs| prefs.checked_items.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Checked item ids sorted, for fingerprinting.
    pub fn checked_items_sorted(&self, conversation_id: &str) -> Vec<String> {
        self.state
            .read()
            .conversations
            .get(conversation_id)
            .map(|prefs| prefs.checked_items.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn set_checked(&self, conversation_id: &str, item_id: &str, checked: bool) {
        {
            let mut state = self.state.write();
            let prefs = state
                .conversations
                .entry(conversation_id.to_string())
                .or_default();
            let changed = if checked {
                prefs.checked_items.insert(item_id.to_string())
            } else {
                prefs.checked_items.remove(item_id)
            };
            if !changed {
                return;
            }
            self.persist(&state);
        }
        let _ = self.events.send(StoreEvent::SelectionChanged {
            conversation_id: conversation_id.to_string(),
        });
    }

    /// Memory defaults to on for conversations with no stored flag.
    pub fn memory_enabled(&self, conversation_id: &str) -> bool {
        self.state
            .read()
            .conversations
            .get(conversation_id)
            .map(|prefs| prefs.memory_enabled)
            .unwrap_or(true)
    }

    pub fn set_memory_enabled(&self, conversation_id: &str, enabled: bool) {
        {
            let mut state = self.state.write();
            let prefs = state
                .conversations
                .entry(conversation_id.to_string())
                .or_default();
            if prefs.memory_enabled == enabled {
                return;
            }
            prefs.memory_enabled = enabled;
            self.persist(&state);
        }
        let _ = self.events.send(StoreEvent::MemoryToggled {
            conversation_id: conversation_id.to_string(),
        });
    }

    fn persist(&self, state: &PersistedState) {
        let Some(path) = &self.path else { return };
        let serialized = match serde_json::to_string_pretty(state) {
            Ok(s) => s,
            Err(error) => {
                warn!(%error, "failed to serialize state");
                return;
            }
        };
        if let Err(error) = std::fs::write(path, serialized) {
            warn!(path = %path.display(), %error, "failed to persist state");
        }
    }
}
