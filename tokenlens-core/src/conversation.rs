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

//! Normalized conversation model.
//!
//! The backend returns a branchy node tree with duck-typed payloads;
//! the normalizer flattens the active branch into these types. Every
//! accounting pass materializes a fresh snapshot, nothing here is
//! mutated in place across passes.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Stable message identifier within one conversation.
pub type MessageId = String;

/// Author role of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

/// One user-visible turn of the conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub text: String,
    /// Resolved at normalize time, includes the per-message overhead.
    pub token_count: usize,
    pub is_truncated: bool,
    /// Charged size when truncated; always <= `token_count`.
    pub truncated_token_count: Option<usize>,
}

impl Message {
    pub fn new(id: impl Into<MessageId>, role: Role, text: impl Into<String>, token_count: usize) -> Self {
        Self {
            id: id.into(),
            role,
            text: text.into(),
            token_count,
            is_truncated: false,
            truncated_token_count: None,
        }
    }

    /// The cost this message actually contributes to a breakdown.
    pub fn charged_tokens(&self) -> usize {
        self.truncated_token_count.unwrap_or(self.token_count)
    }
}

/// A file attached to one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub name: String,
    /// Server-reported size, 0 when the backend omits it.
    pub token_count: usize,
}

/// One saved revision of a canvas document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanvasRevision {
    pub version: u64,
    pub title: String,
    pub content: String,
    pub token_count: usize,
}

/// A versioned canvas document created and edited by tool calls.
///
/// All revisions are retained for export use; only the latest one is
/// charged against the live budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanvasDocument {
    pub textdoc_id: String,
    /// Ascending by `version`.
    pub revisions: Vec<CanvasRevision>,
    /// The final user-visible assistant message this document is
    /// charged against (the tool-call node itself is hidden).
    pub charged_to: MessageId,
}

impl CanvasDocument {
    /// The revision that counts toward the live budget.
    pub fn latest(&self) -> Option<&CanvasRevision> {
        self.revisions.last()
    }

    /// Insert a revision keeping the ascending version order. A
    /// duplicate version replaces the earlier record.
    pub fn push_revision(&mut self, revision: CanvasRevision) {
        match self.revisions.binary_search_by_key(&revision.version, |r| r.version) {
            Ok(idx) => self.revisions[idx] = revision,
            Err(idx) => self.revisions.insert(idx, revision),
        }
    }
}

/// Profile and instructions text from the user's custom instructions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomInstructions {
    pub profile: String,
    pub instructions: String,
}

/// Kind of a checkable budget item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Attachment,
    Canvas,
}

/// A checkable item in the order the normalizer discovered it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetItem {
    pub id: String,
    pub kind: ItemKind,
    pub label: String,
    pub token_count: usize,
}

/// The flattened active branch of one conversation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizedConversation {
    pub conversation_id: String,
    /// Chronological, oldest first, user-visible turns only.
    pub messages: Vec<Message>,
    /// Attachments keyed by the message that carries them.
    pub attachments: HashMap<MessageId, Vec<Attachment>>,
    /// Canvas documents in first-seen order.
    pub canvases: Vec<CanvasDocument>,
    /// Hidden tool-role content aggregated across the whole tree,
    /// attributed to the first message of the traversal.
    pub tool_output_tokens: usize,
    pub custom_instructions: Option<CustomInstructions>,
    pub memory_text: Option<String>,
}

impl NormalizedConversation {
    /// The legitimate "no conversation" state, e.g. during navigation.
    pub fn empty(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
            && self.attachments.is_empty()
            && self.canvases.is_empty()
            && self.tool_output_tokens == 0
    }

    /// All checkable items in discovery order: attachments in message
    /// order, then canvas documents (latest revision) in first-seen
    /// order. Each attachment appears once even when referenced from
    /// several places.
    pub fn budget_items(&self) -> Vec<BudgetItem> {
        let mut items = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for message in &self.messages {
            if let Some(attachments) = self.attachments.get(&message.id) {
                for attachment in attachments {
                    if seen.insert(attachment.id.clone()) {
                        items.push(BudgetItem {
                            id: attachment.id.clone(),
                            kind: ItemKind::Attachment,
                            label: attachment.name.clone(),
                            token_count: attachment.token_count,
                        });
                    }
                }
            }
        }
        // Attachments on skipped messages still count as items; sorted
        // by message id so repeated passes agree on the order.
        let mut orphaned: Vec<(&MessageId, &Vec<Attachment>)> = self
            .attachments
            .iter()
            .filter(|(message_id, _)| !self.messages.iter().any(|m| m.id == **message_id))
            .collect();
        orphaned.sort_by(|a, b| a.0.cmp(b.0));
        for (_, attachments) in orphaned {
            for attachment in attachments {
                if seen.insert(attachment.id.clone()) {
                    items.push(BudgetItem {
                        id: attachment.id.clone(),
                        kind: ItemKind::Attachment,
                        label: attachment.name.clone(),
                        token_count: attachment.token_count,
                    });
                }
            }
        }
        for canvas in &self.canvases {
            if let Some(latest) = canvas.latest() {
                items.push(BudgetItem {
                    id: canvas.textdoc_id.clone(),
                    kind: ItemKind::Canvas,
                    label: latest.title.clone(),
                    token_count: latest.token_count,
                });
            }
        }
        items
    }
}
