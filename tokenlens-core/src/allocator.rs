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

//! Budget allocation.
//!
//! Distributes a fixed context-window limit over the components of a
//! conversation with a fixed-priority waterfall: system prompt, memory,
//! custom instructions, tool output, the in-progress user prompt,
//! checked attachments and canvases, then chat history newest first.
//! Each stage consumes from what the earlier stages left over and can
//! be included whole, truncated to the remaining space, or excluded.
//!
//! The allocator is a pure function of its inputs. Item and message
//! token counts are resolved during normalization; only the scalar
//! text inputs (system prompt, prompt box) are counted here.

use crate::conversation::{BudgetItem, ItemKind, Message, NormalizedConversation};
use crate::tokenizer::Tokenizer;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// What one stage was charged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCost {
    /// Tokens actually charged against the limit.
    pub cost: usize,
    /// The true full size when the stage could not be charged in full.
    pub truncated_from: Option<usize>,
}

impl StageCost {
    fn zero() -> Self {
        Self::default()
    }

    /// Charge `full` tokens against the remaining budget.
    fn charge(remaining: &mut usize, full: usize) -> Self {
        if full == 0 {
            return Self::zero();
        }
        if *remaining == 0 {
            return Self {
                cost: 0,
                truncated_from: Some(full),
            };
        }
        if full <= *remaining {
            *remaining -= full;
            Self {
                cost: full,
                truncated_from: None,
            }
        } else {
            let cost = *remaining;
            *remaining = 0;
            Self {
                cost,
                truncated_from: Some(full),
            }
        }
    }

    /// True when the stage was charged less than its full size.
    pub fn is_truncated(&self) -> bool {
        self.truncated_from.is_some()
    }
}

/// Charged cost of one checked attachment or canvas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemCost {
    pub item_id: String,
    pub kind: ItemKind,
    pub label: String,
    pub cost: StageCost,
}

/// Inputs to one allocation pass.
#[derive(Debug)]
pub struct AllocationInput<'a> {
    pub conversation: &'a NormalizedConversation,
    /// The user-configured context window.
    pub limit: usize,
    /// Item ids (attachment id or textdoc id) the user has checked.
    pub checked_items: &'a HashSet<String>,
    /// Text currently sitting in the prompt box, not yet sent.
    pub prompt_text: &'a str,
    /// The user-configured global system prompt.
    pub system_prompt_text: &'a str,
    pub memory_enabled: bool,
}

/// Complete accounting snapshot for one conversation state.
///
/// Recomputed wholesale on every pass, never patched incrementally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetBreakdown {
    pub limit: usize,
    pub system_prompt: StageCost,
    pub memory: StageCost,
    pub instructions: StageCost,
    pub tool_output: StageCost,
    pub user_prompt: StageCost,
    pub items: Vec<ItemCost>,
    /// Included history, chronological; at most the earliest entry is
    /// truncated.
    pub effective_messages: Vec<Message>,
    pub total_chat_tokens: usize,
    /// Sum of the non-chat stages as charged.
    pub base_token_cost: usize,
    /// Naive sum of every contribution, ignoring the limit.
    pub max_possible_tokens: usize,
}

impl BudgetBreakdown {
    /// Everything charged against the limit; never exceeds it.
    pub fn grand_total(&self) -> usize {
        self.base_token_cost + self.total_chat_tokens
    }

    /// Remaining space under the limit after this pass.
    pub fn headroom(&self) -> usize {
        self.limit.saturating_sub(self.grand_total())
    }
}

/// Run the waterfall over a normalized conversation.
pub fn allocate(input: &AllocationInput<'_>, tokenizer: &Tokenizer) -> BudgetBreakdown {
    let conversation = input.conversation;
    let mut remaining = input.limit;

    let system_full = tokenizer.count(input.system_prompt_text);
    let system_prompt = StageCost::charge(&mut remaining, system_full);

    let memory_full = if input.memory_enabled {
        conversation
            .memory_text
            .as_deref()
            .map(|text| tokenizer.count(text))
            .unwrap_or(0)
    } else {
        0
    };
    let memory = StageCost::charge(&mut remaining, memory_full);

    let instructions_full = conversation
        .custom_instructions
        .as_ref()
        .map(|ci| tokenizer.count(&ci.profile) + tokenizer.count(&ci.instructions))
        .unwrap_or(0);
    let instructions = StageCost::charge(&mut remaining, instructions_full);

    let tool_output = StageCost::charge(&mut remaining, conversation.tool_output_tokens);

    let prompt_full = tokenizer.count_message(input.prompt_text);
    let user_prompt = StageCost::charge(&mut remaining, prompt_full);

    let checked: Vec<BudgetItem> = conversation
        .budget_items()
        .into_iter()
        .filter(|item| input.checked_items.contains(&item.id))
        .collect();
    let items: Vec<ItemCost> = checked
        .iter()
        .map(|item| ItemCost {
            item_id: item.id.clone(),
            kind: item.kind,
            label: item.label.clone(),
            cost: StageCost::charge(&mut remaining, item.token_count),
        })
        .collect();

    let base_token_cost = system_prompt.cost
        + memory.cost
        + instructions.cost
        + user_prompt.cost
        + tool_output.cost
        + items.iter().map(|i| i.cost.cost).sum::<usize>();

    let (effective_messages, total_chat_tokens) =
        fill_chat_history(&conversation.messages, remaining);

    let max_possible_tokens = system_full
        + memory_full
        + instructions_full
        + conversation.tool_output_tokens
        + prompt_full
        + checked.iter().map(|i| i.token_count).sum::<usize>()
        + conversation
            .messages
            .iter()
            .map(|m| m.token_count)
            .sum::<usize>();

    BudgetBreakdown {
        limit: input.limit,
        system_prompt,
        memory,
        instructions,
        tool_output,
        user_prompt,
        items,
        effective_messages,
        total_chat_tokens,
        base_token_cost,
        max_possible_tokens,
    }
}

/// Walk history newest to oldest, including whole messages while they
/// fit. The first message that no longer fits is truncated to exactly
/// the remaining space and the walk stops, so at most one message is
/// ever truncated and nothing older than it is included.
fn fill_chat_history(messages: &[Message], mut remaining: usize) -> (Vec<Message>, usize) {
    let mut included: Vec<Message> = Vec::new();
    let mut total = 0usize;

    for message in messages.iter().rev() {
        // Zero-token turns are neither in nor out.
        if message.token_count == 0 {
            continue;
        }
        if message.token_count <= remaining {
            remaining -= message.token_count;
            total += message.token_count;
            included.push(message.clone());
        } else {
            if remaining > 0 {
                let mut truncated = message.clone();
                truncated.is_truncated = true;
                truncated.truncated_token_count = Some(remaining);
                total += remaining;
                included.push(truncated);
            }
            break;
        }
    }

    included.reverse();
    (included, total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::{Attachment, CanvasDocument, CanvasRevision, Role};
    use proptest::prelude::*;

    fn message(id: &str, tokens: usize) -> Message {
        Message::new(id, Role::User, "x".repeat(tokens.max(1)), tokens)
    }

    fn conversation_with_messages(tokens: &[usize]) -> NormalizedConversation {
        let mut conversation = NormalizedConversation::empty("c1");
        for (i, t) in tokens.iter().enumerate() {
            conversation.messages.push(message(&format!("m{i}"), *t));
        }
        conversation
    }

    fn allocate_simple(
        conversation: &NormalizedConversation,
        limit: usize,
        checked: &HashSet<String>,
        prompt: &str,
        system: &str,
        memory_enabled: bool,
    ) -> BudgetBreakdown {
        let tokenizer = Tokenizer::new();
        allocate(
            &AllocationInput {
                conversation,
                limit,
                checked_items: checked,
                prompt_text: prompt,
                system_prompt_text: system,
                memory_enabled,
            },
            &tokenizer,
        )
    }

    #[test]
    fn test_chat_fill_truncates_at_most_one() {
        // Oldest to newest: 30 / 40 / 50, budget 75 for chat.
        let messages = vec![message("m0", 30), message("m1", 40), message("m2", 50)];
        let (included, total) = fill_chat_history(&messages, 75);

        assert_eq!(included.len(), 2);
        assert_eq!(included[1].id, "m2");
        assert!(!included[1].is_truncated);
        assert_eq!(included[0].id, "m1");
        assert!(included[0].is_truncated);
        assert_eq!(included[0].truncated_token_count, Some(25));
        assert_eq!(total, 75);
    }

    #[test]
    fn test_chat_fill_zero_budget_includes_nothing() {
        let messages = vec![message("m0", 10)];
        let (included, total) = fill_chat_history(&messages, 0);
        assert!(included.is_empty());
        assert_eq!(total, 0);
    }

    #[test]
    fn test_zero_token_messages_skipped() {
        let messages = vec![message("m0", 0), message("m1", 10), message("m2", 0)];
        let (included, total) = fill_chat_history(&messages, 100);
        assert_eq!(included.len(), 1);
        assert_eq!(included[0].id, "m1");
        assert_eq!(total, 10);
    }

    #[test]
    fn test_end_to_end_scenario_grand_total_equals_limit() {
        // limit 100, system prompt of 20 tokens, prompt "hi" (1 + 4),
        // history 30/40/50 oldest to newest, nothing checked.
        let conversation = conversation_with_messages(&[30, 40, 50]);
        let system = "a ".repeat(20);
        let breakdown =
            allocate_simple(&conversation, 100, &HashSet::new(), "hi", system.trim(), false);

        assert_eq!(breakdown.system_prompt.cost, 20);
        assert!(!breakdown.system_prompt.is_truncated());
        assert_eq!(breakdown.user_prompt.cost, 5);
        assert_eq!(breakdown.base_token_cost, 25);

        // 75 left for chat: 50 whole, 40 truncated to 25, 30 excluded.
        assert_eq!(breakdown.effective_messages.len(), 2);
        assert_eq!(breakdown.effective_messages[0].truncated_token_count, Some(25));
        assert!(breakdown.effective_messages[0].is_truncated);
        assert_eq!(breakdown.effective_messages[1].token_count, 50);
        assert_eq!(breakdown.total_chat_tokens, 75);
        assert_eq!(breakdown.grand_total(), 100);
    }

    #[test]
    fn test_oversized_attachment_truncated_to_limit() {
        let mut conversation = conversation_with_messages(&[30]);
        conversation.attachments.insert(
            "m0".into(),
            vec![Attachment {
                id: "file-1".into(),
                name: "big.pdf".into(),
                token_count: 500,
            }],
        );
        let checked: HashSet<String> = ["file-1".to_string()].into();
        let breakdown = allocate_simple(&conversation, 100, &checked, "", "", false);

        assert_eq!(breakdown.items.len(), 1);
        assert_eq!(breakdown.items[0].cost.cost, 100);
        assert_eq!(breakdown.items[0].cost.truncated_from, Some(500));
        assert!(breakdown.effective_messages.is_empty());
        assert_eq!(breakdown.grand_total(), 100);
    }

    #[test]
    fn test_unchecked_items_cost_nothing() {
        let mut conversation = conversation_with_messages(&[10]);
        conversation.attachments.insert(
            "m0".into(),
            vec![Attachment {
                id: "file-1".into(),
                name: "big.pdf".into(),
                token_count: 500,
            }],
        );
        let breakdown = allocate_simple(&conversation, 100, &HashSet::new(), "", "", false);
        assert!(breakdown.items.is_empty());
        assert_eq!(breakdown.total_chat_tokens, 10);
    }

    #[test]
    fn test_only_latest_canvas_version_charged() {
        let mut conversation = conversation_with_messages(&[]);
        conversation.canvases.push(CanvasDocument {
            textdoc_id: "doc-1".into(),
            revisions: vec![
                CanvasRevision {
                    version: 1,
                    title: "v1".into(),
                    content: String::new(),
                    token_count: 11,
                },
                CanvasRevision {
                    version: 2,
                    title: "v2".into(),
                    content: String::new(),
                    token_count: 22,
                },
                CanvasRevision {
                    version: 3,
                    title: "v3".into(),
                    content: String::new(),
                    token_count: 33,
                },
            ],
            charged_to: "m0".into(),
        });
        let checked: HashSet<String> = ["doc-1".to_string()].into();
        let breakdown = allocate_simple(&conversation, 1000, &checked, "", "", false);

        assert_eq!(breakdown.items.len(), 1);
        assert_eq!(breakdown.items[0].cost.cost, 33);
        assert_eq!(breakdown.grand_total(), 33);
    }

    #[test]
    fn test_memory_disabled_contributes_nothing() {
        let mut conversation = conversation_with_messages(&[]);
        conversation.memory_text = Some("remember the user likes short answers".into());

        let off = allocate_simple(&conversation, 100, &HashSet::new(), "", "", false);
        assert_eq!(off.memory.cost, 0);
        assert!(!off.memory.is_truncated());

        let on = allocate_simple(&conversation, 100, &HashSet::new(), "", "", true);
        assert!(on.memory.cost > 0);
    }

    #[test]
    fn test_truncated_stage_forces_later_stages_to_zero() {
        let mut conversation = conversation_with_messages(&[40]);
        conversation.tool_output_tokens = 10;
        let system = "a ".repeat(50);
        let breakdown =
            allocate_simple(&conversation, 30, &HashSet::new(), "hi", system.trim(), false);

        assert!(breakdown.system_prompt.is_truncated());
        assert_eq!(breakdown.system_prompt.cost, 30);
        assert_eq!(breakdown.tool_output.cost, 0);
        assert_eq!(breakdown.tool_output.truncated_from, Some(10));
        assert_eq!(breakdown.user_prompt.cost, 0);
        assert!(breakdown.effective_messages.is_empty());
        assert_eq!(breakdown.grand_total(), 30);
    }

    #[test]
    fn test_idempotent() {
        let mut conversation = conversation_with_messages(&[12, 34, 56]);
        conversation.tool_output_tokens = 7;
        let checked = HashSet::new();
        let a = allocate_simple(&conversation, 90, &checked, "draft reply", "be brief", true);
        let b = allocate_simple(&conversation, 90, &checked, "draft reply", "be brief", true);
        assert_eq!(a, b);
    }

    #[test]
    fn test_max_possible_ignores_limit() {
        let conversation = conversation_with_messages(&[30, 40, 50]);
        let breakdown = allocate_simple(&conversation, 10, &HashSet::new(), "", "", false);
        assert_eq!(breakdown.max_possible_tokens, 120);
        assert_eq!(breakdown.grand_total(), 10);
    }

    proptest! {
        #[test]
        fn prop_grand_total_never_exceeds_limit(
            limit in 0usize..5_000,
            tool_output in 0usize..2_000,
            message_tokens in proptest::collection::vec(0usize..800, 0..20),
        ) {
            let mut conversation = conversation_with_messages(&message_tokens);
            conversation.tool_output_tokens = tool_output;
            let breakdown =
                allocate_simple(&conversation, limit, &HashSet::new(), "hello there", "system", true);
            prop_assert!(breakdown.grand_total() <= limit);
        }

        #[test]
        fn prop_at_most_one_truncated_message_and_it_is_oldest(
            limit in 0usize..3_000,
            message_tokens in proptest::collection::vec(1usize..500, 0..20),
        ) {
            let conversation = conversation_with_messages(&message_tokens);
            let breakdown =
                allocate_simple(&conversation, limit, &HashSet::new(), "", "", false);
            let truncated: Vec<_> = breakdown
                .effective_messages
                .iter()
                .filter(|m| m.is_truncated)
                .collect();
            prop_assert!(truncated.len() <= 1);
            // Only the chronologically first included message may be cut.
            for later in breakdown.effective_messages.iter().skip(1) {
                prop_assert!(!later.is_truncated);
            }
        }

        #[test]
        fn prop_grand_total_is_min_of_naive_and_limit(
            limit in 0usize..4_000,
            message_tokens in proptest::collection::vec(0usize..400, 0..15),
        ) {
            let conversation = conversation_with_messages(&message_tokens);
            let breakdown =
                allocate_simple(&conversation, limit, &HashSet::new(), "", "", false);
            let naive: usize = message_tokens.iter().sum();
            prop_assert_eq!(
                breakdown.grand_total(),
                naive.min(limit)
            );
        }
    }
}
