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

//! Tokenlens Core
//!
//! Conversation data model, BPE token counting, and the context-window
//! budget allocator. Everything here is pure and I/O free.

pub mod allocator;
pub mod conversation;
pub mod tokenizer;

pub use allocator::{allocate, AllocationInput, BudgetBreakdown, ItemCost, StageCost};
pub use conversation::{
    Attachment, BudgetItem, CanvasDocument, CanvasRevision, CustomInstructions, ItemKind, Message,
    MessageId, NormalizedConversation, Role,
};
pub use tokenizer::{Tokenizer, DEFAULT_MESSAGE_OVERHEAD_TOKENS};
