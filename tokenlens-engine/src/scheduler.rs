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

//! Change detection and scheduling.
//!
//! The original DOM mutation observer is redesigned here as an explicit
//! component: callers feed [`TriggerReason`]s in, the loop debounces
//! them, short-circuits on an unchanged fingerprint, and publishes
//! fresh [`BudgetBreakdown`]s through a watch channel. Navigation
//! bypasses the debounce and resets the fingerprint. Debounce is the
//! only backpressure; a new trigger simply restarts the timer.
//!
//! Every path through the loop catches and logs; nothing thrown by a
//! recompute can escape into the caller's event handling.

use crate::error::EngineResult;
use crate::fingerprint::{Fingerprint, FingerprintInputs};
use crate::store::{StateStore, StoreEvent};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokenlens_core::BudgetBreakdown;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

/// What woke the scheduler up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerReason {
    /// The page navigated to another conversation.
    Navigation,
    /// Something moved inside the conversation view.
    DomMutation,
    /// A watched storage key changed.
    StorageChange,
    /// Explicit request, e.g. a refresh button.
    Manual,
}

/// Snapshot of the page inputs the engine consumes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageState {
    /// Conversation id parsed from the page URL, if any.
    pub conversation_id: Option<String>,
    /// Current text of the prompt box, not yet sent.
    pub prompt_text: String,
    /// Rendered message turns, fingerprint input only.
    pub turn_count: usize,
}

/// Source of the current page snapshot.
pub trait PageProbe: Send + Sync {
    fn snapshot(&self) -> PageState;
}

/// The computation the scheduler drives.
///
/// `Ok(None)` is a legitimate blank state (no conversation, scripting
/// disabled); `Err` keeps the previously published breakdown in place.
#[async_trait]
pub trait Recompute: Send + Sync {
    async fn recompute(&self, page: &PageState) -> EngineResult<Option<BudgetBreakdown>>;
}

/// Scheduler knobs.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub debounce: Duration,
    /// Element classes of our own injected UI.
    pub ignored_classes: Vec<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(2),
            ignored_classes: vec![
                "tokenlens-panel".to_string(),
                "tokenlens-badge".to_string(),
                "tokenlens-modal".to_string(),
            ],
        }
    }
}

/// Handle to a running scheduler loop.
pub struct SchedulerHandle {
    triggers: mpsc::UnboundedSender<TriggerReason>,
    output: watch::Receiver<Option<BudgetBreakdown>>,
    ignored_classes: Vec<String>,
    task: tokio::task::JoinHandle<()>,
}

impl SchedulerHandle {
    /// Feed one trigger into the loop.
    pub fn on_trigger(&self, reason: TriggerReason) {
        let _ = self.triggers.send(reason);
    }

    /// Whether a mutation under an element with these classes came from
    /// our own UI and must not retrigger the loop.
    pub fn should_ignore_mutation(&self, element_classes: &[&str]) -> bool {
        element_classes
            .iter()
            .any(|class| self.ignored_classes.iter().any(|ignored| ignored == class))
    }

    /// Watch the published breakdowns.
    pub fn subscribe(&self) -> watch::Receiver<Option<BudgetBreakdown>> {
        self.output.clone()
    }

    /// The latest published breakdown.
    pub fn latest(&self) -> Option<BudgetBreakdown> {
        self.output.borrow().clone()
    }

    pub fn shutdown(self) {
        self.task.abort();
    }
}

/// Spawn the scheduling loop on the current runtime.
pub fn spawn(
    config: SchedulerConfig,
    probe: Arc<dyn PageProbe>,
    compute: Arc<dyn Recompute>,
    store: Arc<StateStore>,
) -> SchedulerHandle {
    let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
    let (output_tx, output_rx) = watch::channel(None);
    let ignored_classes = config.ignored_classes.clone();
    let store_events = store.subscribe();

    let worker = Worker {
        config,
        probe,
        compute,
        store,
        output: output_tx,
        last_fingerprint: None,
    };
    let task = tokio::spawn(worker.run(trigger_rx, store_events));

    SchedulerHandle {
        triggers: trigger_tx,
        output: output_rx,
        ignored_classes,
        task,
    }
}

struct Worker {
    config: SchedulerConfig,
    probe: Arc<dyn PageProbe>,
    compute: Arc<dyn Recompute>,
    store: Arc<StateStore>,
    output: watch::Sender<Option<BudgetBreakdown>>,
    last_fingerprint: Option<Fingerprint>,
}

impl Worker {
    async fn run(
        mut self,
        mut triggers: mpsc::UnboundedReceiver<TriggerReason>,
        mut store_events: broadcast::Receiver<StoreEvent>,
    ) {
        let mut deadline: Option<Instant> = None;
        let mut store_alive = true;

        loop {
            tokio::select! {
                maybe_trigger = triggers.recv() => {
                    match maybe_trigger {
                        None => break,
                        Some(TriggerReason::Navigation) => {
                            deadline = None;
                            self.last_fingerprint = None;
                            self.recompute().await;
                        }
                        Some(reason) => {
                            debug!(?reason, "debouncing recompute");
                            deadline = Some(Instant::now() + self.config.debounce);
                        }
                    }
                }
                event = store_events.recv(), if store_alive => {
                    match event {
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                            deadline = Some(Instant::now() + self.config.debounce);
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            store_alive = false;
                        }
                    }
                }
                _ = sleep_until_opt(deadline), if deadline.is_some() => {
                    deadline = None;
                    self.recompute().await;
                }
            }
        }
    }

    async fn recompute(&mut self) {
        let page = self.probe.snapshot();
        let settings = self.store.settings();
        let checked = page
            .conversation_id
            .as_deref()
            .map(|id| self.store.checked_items_sorted(id))
            .unwrap_or_default();
        let memory_enabled = page
            .conversation_id
            .as_deref()
            .map(|id| self.store.memory_enabled(id))
            .unwrap_or(true);

        let fingerprint = Fingerprint::compute(&FingerprintInputs {
            conversation_id: page.conversation_id.as_deref(),
            prompt_text: &page.prompt_text,
            turn_count: page.turn_count,
            checked_items: &checked,
            limit: settings.token_limit,
            memory_enabled,
        });
        if self.last_fingerprint == Some(fingerprint) {
            debug!("fingerprint unchanged, skipping recompute");
            return;
        }

        match self.compute.recompute(&page).await {
            Ok(result) => {
                // Stale guard: navigation may have happened while the
                // fetch was in flight.
                if self.probe.snapshot().conversation_id != page.conversation_id {
                    debug!("discarding stale breakdown after navigation");
                    return;
                }
                self.last_fingerprint = Some(fingerprint);
                self.output.send_replace(result);
            }
            Err(error) => {
                // Keep the previously published breakdown in place so
                // the UI does not flicker to empty.
                warn!(%error, "recompute failed");
            }
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticProbe {
        state: Mutex<PageState>,
    }

    impl StaticProbe {
        fn new(conversation_id: &str) -> Arc<Self> {
            Arc::new(Self {
                state: Mutex::new(PageState {
                    conversation_id: Some(conversation_id.to_string()),
                    prompt_text: String::new(),
                    turn_count: 0,
                }),
            })
        }

        fn set_prompt(&self, prompt: &str) {
            self.state.lock().prompt_text = prompt.to_string();
        }

        fn set_conversation(&self, id: &str) {
            self.state.lock().conversation_id = Some(id.to_string());
        }
    }

    impl PageProbe for StaticProbe {
        fn snapshot(&self) -> PageState {
            self.state.lock().clone()
        }
    }

    fn breakdown(limit: usize) -> BudgetBreakdown {
        BudgetBreakdown {
            limit,
            system_prompt: Default::default(),
            memory: Default::default(),
            instructions: Default::default(),
            tool_output: Default::default(),
            user_prompt: Default::default(),
            items: Vec::new(),
            effective_messages: Vec::new(),
            total_chat_tokens: 0,
            base_token_cost: 0,
            max_possible_tokens: 0,
        }
    }

    struct CountingCompute {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Recompute for CountingCompute {
        async fn recompute(&self, _page: &PageState) -> EngineResult<Option<BudgetBreakdown>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Some(breakdown(call)))
        }
    }

    struct FlakyCompute {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Recompute for FlakyCompute {
        async fn recompute(&self, _page: &PageState) -> EngineResult<Option<BudgetBreakdown>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call == 1 {
                Ok(Some(breakdown(1)))
            } else {
                Err(EngineError::Store("boom".into()))
            }
        }
    }

    /// Recompute that navigates mid-flight, simulating a fetch overtaken
    /// by the user switching conversations.
    struct NavigatingCompute {
        probe: Arc<StaticProbe>,
    }

    #[async_trait]
    impl Recompute for NavigatingCompute {
        async fn recompute(&self, _page: &PageState) -> EngineResult<Option<BudgetBreakdown>> {
            self.probe.set_conversation("other");
            Ok(Some(breakdown(42)))
        }
    }

    fn config(debounce: Duration) -> SchedulerConfig {
        SchedulerConfig {
            debounce,
            ..SchedulerConfig::default()
        }
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..1_000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(start_paused = true)]
    async fn test_identical_triggers_recompute_once() {
        let probe = StaticProbe::new("c1");
        let compute = Arc::new(CountingCompute {
            calls: AtomicUsize::new(0),
        });
        let store = Arc::new(StateStore::in_memory());
        let handle = spawn(
            config(Duration::from_millis(100)),
            probe.clone(),
            compute.clone(),
            store,
        );

        handle.on_trigger(TriggerReason::Manual);
        wait_for(|| compute.calls.load(Ordering::SeqCst) == 1).await;

        // Same page state, same settings: the fingerprint matches and
        // the second trigger is a no-op.
        handle.on_trigger(TriggerReason::Manual);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(compute.calls.load(Ordering::SeqCst), 1);

        // A prompt edit changes the fingerprint and recomputes.
        probe.set_prompt("typing");
        handle.on_trigger(TriggerReason::DomMutation);
        wait_for(|| compute.calls.load(Ordering::SeqCst) == 2).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_coalesces_into_one_recompute() {
        let probe = StaticProbe::new("c1");
        let compute = Arc::new(CountingCompute {
            calls: AtomicUsize::new(0),
        });
        let store = Arc::new(StateStore::in_memory());
        let handle = spawn(
            config(Duration::from_millis(200)),
            probe,
            compute.clone(),
            store,
        );

        for _ in 0..5 {
            handle.on_trigger(TriggerReason::DomMutation);
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(compute.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_navigation_bypasses_debounce() {
        let probe = StaticProbe::new("c1");
        let compute = Arc::new(CountingCompute {
            calls: AtomicUsize::new(0),
        });
        let store = Arc::new(StateStore::in_memory());
        // Debounce far longer than the waits below.
        let handle = spawn(config(Duration::from_secs(60)), probe, compute.clone(), store);

        handle.on_trigger(TriggerReason::Navigation);
        wait_for(|| compute.calls.load(Ordering::SeqCst) == 1).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_storage_change_triggers_recompute() {
        let probe = StaticProbe::new("c1");
        let compute = Arc::new(CountingCompute {
            calls: AtomicUsize::new(0),
        });
        let store = Arc::new(StateStore::in_memory());
        let handle = spawn(
            config(Duration::from_millis(100)),
            probe,
            compute.clone(),
            store.clone(),
        );

        store.set_checked("c1", "file-1", true);
        wait_for(|| compute.calls.load(Ordering::SeqCst) == 1).await;
        let _ = handle;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_keeps_previous_breakdown() {
        let probe = StaticProbe::new("c1");
        let compute = Arc::new(FlakyCompute {
            calls: AtomicUsize::new(0),
        });
        let store = Arc::new(StateStore::in_memory());
        let handle = spawn(
            config(Duration::from_millis(50)),
            probe.clone(),
            compute.clone(),
            store,
        );

        handle.on_trigger(TriggerReason::Manual);
        wait_for(|| compute.calls.load(Ordering::SeqCst) == 1).await;
        wait_for(|| handle.latest().is_some()).await;

        probe.set_prompt("changed");
        handle.on_trigger(TriggerReason::Manual);
        wait_for(|| compute.calls.load(Ordering::SeqCst) == 2).await;

        // The failed pass left the first result in place.
        assert_eq!(handle.latest().map(|b| b.limit), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_result_discarded_after_navigation() {
        let probe = StaticProbe::new("c1");
        let compute = Arc::new(NavigatingCompute {
            probe: probe.clone(),
        });
        let store = Arc::new(StateStore::in_memory());
        let handle = spawn(
            config(Duration::from_millis(50)),
            probe,
            compute,
            store,
        );

        handle.on_trigger(TriggerReason::Manual);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(handle.latest().is_none());
    }

    #[tokio::test]
    async fn test_should_ignore_own_ui_mutations() {
        let probe = StaticProbe::new("c1");
        let compute = Arc::new(CountingCompute {
            calls: AtomicUsize::new(0),
        });
        let store = Arc::new(StateStore::in_memory());
        let handle = spawn(SchedulerConfig::default(), probe, compute, store);

        assert!(handle.should_ignore_mutation(&["tokenlens-panel"]));
        assert!(handle.should_ignore_mutation(&["message", "tokenlens-badge"]));
        assert!(!handle.should_ignore_mutation(&["message", "markdown"]));
    }
}
