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

//! Engine facade.
//!
//! Ties fetch, normalize, cache and allocate together behind one
//! entry point. One backend fetch is in flight at a time: starting a
//! new one cancels its predecessor through a shared token.

use crate::cache::{TreeCache, TreeCacheConfig, TreeCacheStats};
use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::scheduler::{PageState, Recompute};
use crate::store::StateStore;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokenlens_backend::{normalize, ChatBackendClient};
use tokenlens_core::{allocate, AllocationInput, BudgetBreakdown, NormalizedConversation, Tokenizer};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Budget computation engine for one content-script instance.
pub struct BudgetEngine {
    client: ChatBackendClient,
    tokenizer: Tokenizer,
    cache: TreeCache,
    store: Arc<StateStore>,
    inflight: Mutex<Option<CancellationToken>>,
}

impl BudgetEngine {
    pub fn new(config: &EngineConfig, store: Arc<StateStore>) -> Self {
        Self {
            client: ChatBackendClient::new(config.base_url.clone()),
            tokenizer: Tokenizer::with_message_overhead(config.message_overhead),
            cache: TreeCache::new(TreeCacheConfig {
                max_entries: config.cache_max_entries,
                ttl: config.cache_ttl(),
            }),
            store,
            inflight: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    pub fn cache_stats(&self) -> TreeCacheStats {
        self.cache.stats()
    }

    /// Seed the cache directly, bypassing the backend. Used by tests
    /// and by callers that already hold a fresh tree.
    pub fn prime_cache(&self, conversation: NormalizedConversation) {
        self.cache
            .insert(conversation.conversation_id.clone(), Arc::new(conversation));
    }

    /// Drop the cached tree for one conversation.
    pub fn invalidate(&self, conversation_id: &str) {
        self.cache.invalidate(conversation_id);
    }

    /// Cached normalized conversation, fetching and normalizing when
    /// the cache has nothing fresh.
    pub async fn get_or_fetch(
        &self,
        conversation_id: &str,
    ) -> EngineResult<Arc<NormalizedConversation>> {
        if let Some(entry) = self.cache.get(conversation_id) {
            return Ok(entry.conversation);
        }

        let cancel = self.begin_fetch();
        let tree = self.client.fetch_conversation(conversation_id, &cancel).await?;
        let normalized = Arc::new(normalize(conversation_id, &tree, &self.tokenizer));
        debug!(
            conversation = conversation_id,
            messages = normalized.messages.len(),
            canvases = normalized.canvases.len(),
            "normalized conversation"
        );
        self.cache.insert(conversation_id, normalized.clone());
        Ok(normalized)
    }

    /// Run one full accounting pass for the given page state.
    ///
    /// `Ok(None)` when there is no conversation or scripting is off.
    pub async fn compute(&self, page: &PageState) -> EngineResult<Option<BudgetBreakdown>> {
        let Some(conversation_id) = page.conversation_id.as_deref() else {
            return Ok(None);
        };
        let settings = self.store.settings();
        if !settings.scripting_enabled {
            return Ok(None);
        }

        let conversation = self.get_or_fetch(conversation_id).await?;
        let checked: HashSet<String> = self.store.checked_items(conversation_id);
        let breakdown = allocate(
            &AllocationInput {
                conversation: &conversation,
                limit: settings.token_limit,
                checked_items: &checked,
                prompt_text: &page.prompt_text,
                system_prompt_text: &settings.global_system_prompt,
                memory_enabled: self.store.memory_enabled(conversation_id),
            },
            &self.tokenizer,
        );
        Ok(Some(breakdown))
    }

    /// Cancel the previous in-flight fetch and install a fresh token.
    fn begin_fetch(&self) -> CancellationToken {
        let mut guard = self.inflight.lock();
        if let Some(previous) = guard.take() {
            previous.cancel();
        }
        let token = CancellationToken::new();
        *guard = Some(token.clone());
        token
    }
}

#[async_trait]
impl Recompute for BudgetEngine {
    async fn recompute(&self, page: &PageState) -> EngineResult<Option<BudgetBreakdown>> {
        self.compute(page).await
    }
}
