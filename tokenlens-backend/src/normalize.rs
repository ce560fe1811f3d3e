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

//! Tree normalization.
//!
//! Converts the backend's duck-typed node tree into the typed
//! [`NormalizedConversation`] the allocator works on. Raw JSON payloads
//! are parsed into tagged node variants right here at the boundary;
//! nothing downstream ever touches the wire shapes.
//!
//! Parsing is best effort: a malformed node is logged and skipped, it
//! never aborts the pass.

use crate::tree::{ConversationTree, TreeNode};
use serde_json::Value;
use std::collections::HashSet;
use tokenlens_core::{
    Attachment, CanvasDocument, CanvasRevision, CustomInstructions, Message, MessageId,
    NormalizedConversation, Role, Tokenizer,
};
use tracing::{debug, warn};

/// Tool recipient that creates a canvas document.
const CANVAS_CREATE_RECIPIENT: &str = "canmore.create_textdoc";
/// Tool recipient that updates a canvas document.
const CANVAS_UPDATE_RECIPIENT: &str = "canmore.update_textdoc";

/// Who an assistant message is addressed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    /// The end user; the message shows up in the transcript.
    AllUsers,
    /// A tool; the message is internal plumbing.
    Tool(String),
}

/// Conversation-level payloads that ride on dedicated nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextPayload {
    Instructions(CustomInstructions),
    Memory(String),
}

/// A user turn.
#[derive(Debug, Clone)]
pub struct UserNode {
    pub message_id: MessageId,
    pub text: String,
    pub hidden: bool,
    pub attachments: Vec<Attachment>,
    pub context: Option<ContextPayload>,
}

/// An assistant turn, user visible or tool directed.
#[derive(Debug, Clone)]
pub struct AssistantNode {
    pub message_id: MessageId,
    pub text: String,
    pub hidden: bool,
    pub recipient: Recipient,
    pub attachments: Vec<Attachment>,
}

impl AssistantNode {
    /// Whether this turn belongs in the transcript.
    pub fn is_user_visible(&self) -> bool {
        self.recipient == Recipient::AllUsers && !self.hidden
    }

    /// Parse this node as a canvas create/update call, when it is one.
    pub fn canvas_call(&self) -> Option<CanvasCall> {
        let Recipient::Tool(tool) = &self.recipient else {
            return None;
        };
        let payload: Value = serde_json::from_str(&self.text).ok()?;
        match tool.as_str() {
            CANVAS_CREATE_RECIPIENT => Some(CanvasCall {
                title: payload
                    .get("name")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                content: payload.get("content")?.as_str()?.to_string(),
            }),
            CANVAS_UPDATE_RECIPIENT => {
                let updates = payload.get("updates")?.as_array()?;
                let content: Vec<&str> = updates
                    .iter()
                    .filter_map(|u| u.get("replacement").and_then(Value::as_str))
                    .collect();
                if content.is_empty() {
                    return None;
                }
                Some(CanvasCall {
                    title: None,
                    content: content.join("\n"),
                })
            }
            _ => None,
        }
    }
}

/// A hidden tool-role response.
#[derive(Debug, Clone)]
pub struct ToolNode {
    pub message_id: MessageId,
    pub text: String,
    pub canvas_pointer: Option<CanvasPointer>,
}

/// A system node; only its context payload matters.
#[derive(Debug, Clone)]
pub struct SystemNode {
    pub message_id: MessageId,
    pub context: Option<ContextPayload>,
}

/// Typed view of one raw tree node.
#[derive(Debug, Clone)]
pub enum ConversationNode {
    User(UserNode),
    Assistant(AssistantNode),
    ToolResponse(ToolNode),
    System(SystemNode),
}

/// New or updated canvas text extracted from a tool call.
#[derive(Debug, Clone)]
pub struct CanvasCall {
    pub title: Option<String>,
    pub content: String,
}

/// Structured part of a canvas tool response.
#[derive(Debug, Clone)]
pub struct CanvasPointer {
    pub textdoc_id: String,
    pub version: u64,
    pub title: Option<String>,
}

/// Parse one raw message payload into a typed node.
pub fn parse_message(node_id: &str, raw: &Value) -> Result<ConversationNode, String> {
    let role = raw
        .pointer("/author/role")
        .and_then(Value::as_str)
        .ok_or("missing author role")?;
    let message_id = raw
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or(node_id)
        .to_string();

    let metadata = raw.get("metadata");
    let hidden = metadata
        .and_then(|m| m.get("is_visually_hidden_from_conversation"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let recipient = match raw.get("recipient").and_then(Value::as_str) {
        None | Some("all") => Recipient::AllUsers,
        Some(tool) => Recipient::Tool(tool.to_string()),
    };

    let content = raw.get("content").unwrap_or(&Value::Null);
    let content_type = content
        .get("content_type")
        .and_then(Value::as_str)
        .unwrap_or("text");

    let context = match content_type {
        "user_editable_context" => Some(ContextPayload::Instructions(CustomInstructions {
            profile: string_field(content, "user_profile"),
            instructions: string_field(content, "user_instructions"),
        })),
        "model_editable_context" => {
            Some(ContextPayload::Memory(string_field(content, "model_set_context")))
        }
        _ => None,
    };
    let text = extract_text(content, content_type);
    let attachments = parse_attachments(metadata);

    match role {
        "user" => Ok(ConversationNode::User(UserNode {
            message_id,
            text,
            hidden,
            attachments,
            context,
        })),
        "assistant" => Ok(ConversationNode::Assistant(AssistantNode {
            message_id,
            text,
            hidden,
            recipient,
            attachments,
        })),
        "tool" => {
            let canvas_pointer = parse_canvas_pointer(&text);
            Ok(ConversationNode::ToolResponse(ToolNode {
                message_id,
                text,
                canvas_pointer,
            }))
        }
        "system" => Ok(ConversationNode::System(SystemNode {
            message_id,
            context,
        })),
        other => Err(format!("unknown author role {other:?}")),
    }
}

fn string_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn extract_text(content: &Value, content_type: &str) -> String {
    match content_type {
        "code" => string_field(content, "text"),
        // "text", "multimodal_text" and anything else with parts; image
        // parts are objects and carry no countable text.
        _ => content
            .get("parts")
            .and_then(Value::as_array)
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default(),
    }
}

fn parse_attachments(metadata: Option<&Value>) -> Vec<Attachment> {
    let Some(entries) = metadata
        .and_then(|m| m.get("attachments"))
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|entry| {
            let id = entry.get("id").and_then(Value::as_str)?;
            Some(Attachment {
                id: id.to_string(),
                name: entry
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or(id)
                    .to_string(),
                token_count: entry
                    .get("file_token_size")
                    .and_then(Value::as_u64)
                    .unwrap_or(0) as usize,
            })
        })
        .collect()
}

fn parse_canvas_pointer(text: &str) -> Option<CanvasPointer> {
    let payload: Value = serde_json::from_str(text).ok()?;
    Some(CanvasPointer {
        textdoc_id: payload.get("textdoc_id")?.as_str()?.to_string(),
        version: payload.get("version")?.as_u64()?,
        title: payload
            .get("name")
            .or_else(|| payload.get("title"))
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

/// Flatten a conversation tree into the normalized model.
pub fn normalize(
    conversation_id: &str,
    tree: &ConversationTree,
    tokenizer: &Tokenizer,
) -> NormalizedConversation {
    let mut out = NormalizedConversation::empty(conversation_id);
    if tree.root_id().is_none() {
        debug!(conversation = conversation_id, "conversation tree has no root");
        return out;
    }

    // Whole-tree pass: hidden tool output, custom instructions and
    // memory live on nodes that may sit off the active branch. Sorted
    // ids keep repeated passes deterministic.
    let mut node_ids: Vec<&String> = tree.mapping.keys().collect();
    node_ids.sort();
    for node_id in node_ids {
        let node = &tree.mapping[node_id];
        let Some(raw) = &node.message else { continue };
        match parse_message(&node.id, raw) {
            Ok(ConversationNode::ToolResponse(tool)) => {
                out.tool_output_tokens += tokenizer.count(&tool.text);
            }
            Ok(ConversationNode::System(system)) => apply_context(&mut out, system.context),
            Ok(ConversationNode::User(user)) => apply_context(&mut out, user.context),
            Ok(ConversationNode::Assistant(_)) => {}
            Err(reason) => {
                warn!(node = %node.id, reason = %reason, "skipping unparseable node");
            }
        }
    }

    // Active-branch pass: transcript messages, attachments, canvases.
    for node in tree.active_path() {
        let Some(raw) = &node.message else { continue };
        // Parse failures were already logged by the first pass.
        let Ok(parsed) = parse_message(&node.id, raw) else {
            continue;
        };
        match parsed {
            ConversationNode::User(user) => {
                record_attachments(&mut out, &user.message_id, user.attachments);
                if user.hidden || user.context.is_some() {
                    continue;
                }
                let token_count = tokenizer.count_message(&user.text);
                out.messages
                    .push(Message::new(user.message_id, Role::User, user.text, token_count));
            }
            ConversationNode::Assistant(assistant) => {
                record_attachments(&mut out, &assistant.message_id, assistant.attachments.clone());
                if let Some(call) = assistant.canvas_call() {
                    record_canvas(&mut out, tree, node, call, tokenizer);
                }
                if assistant.is_user_visible() {
                    let token_count = tokenizer.count_message(&assistant.text);
                    out.messages.push(Message::new(
                        assistant.message_id,
                        Role::Assistant,
                        assistant.text,
                        token_count,
                    ));
                }
            }
            ConversationNode::ToolResponse(_) | ConversationNode::System(_) => {}
        }
    }

    out
}

fn apply_context(out: &mut NormalizedConversation, context: Option<ContextPayload>) {
    match context {
        Some(ContextPayload::Instructions(instructions)) => {
            out.custom_instructions = Some(instructions);
        }
        Some(ContextPayload::Memory(memory)) => {
            if !memory.trim().is_empty() {
                out.memory_text = Some(memory);
            }
        }
        None => {}
    }
}

fn record_attachments(
    out: &mut NormalizedConversation,
    message_id: &str,
    attachments: Vec<Attachment>,
) {
    if attachments.is_empty() {
        return;
    }
    out.attachments
        .entry(message_id.to_string())
        .or_default()
        .extend(attachments);
}

/// Record one canvas revision: pair the call with its tool response,
/// then forward along the response's child chain to the next end-user
/// assistant message, which is what the document is charged against.
fn record_canvas(
    out: &mut NormalizedConversation,
    tree: &ConversationTree,
    call_node: &TreeNode,
    call: CanvasCall,
    tokenizer: &Tokenizer,
) {
    let Some((pointer, response_node)) = find_tool_response(tree, call_node) else {
        debug!(node = %call_node.id, "canvas call without a tool response");
        return;
    };
    let charged_to =
        find_charge_target(tree, response_node).unwrap_or_else(|| call_node.id.clone());

    let token_count = tokenizer.count(&call.content);
    let title = call
        .title
        .or(pointer.title)
        .unwrap_or_else(|| pointer.textdoc_id.clone());
    let revision = CanvasRevision {
        version: pointer.version,
        title,
        content: call.content,
        token_count,
    };

    match out
        .canvases
        .iter_mut()
        .find(|c| c.textdoc_id == pointer.textdoc_id)
    {
        Some(document) => {
            document.push_revision(revision);
            document.charged_to = charged_to;
        }
        None => out.canvases.push(CanvasDocument {
            textdoc_id: pointer.textdoc_id,
            revisions: vec![revision],
            charged_to,
        }),
    }
}

fn find_tool_response<'a>(
    tree: &'a ConversationTree,
    call_node: &TreeNode,
) -> Option<(CanvasPointer, &'a TreeNode)> {
    for child_id in &call_node.children {
        let Some(child) = tree.node(child_id) else { continue };
        let Some(raw) = &child.message else { continue };
        if let Ok(ConversationNode::ToolResponse(tool)) = parse_message(&child.id, raw) {
            if let Some(pointer) = tool.canvas_pointer {
                return Some((pointer, child));
            }
        }
    }
    None
}

/// Walk forward from a tool response until the next assistant message
/// addressed to the end user, skipping intermediate tool hops.
fn find_charge_target(tree: &ConversationTree, from: &TreeNode) -> Option<MessageId> {
    let mut visited = HashSet::new();
    let mut current = from;
    loop {
        if !visited.insert(current.id.clone()) {
            return None;
        }
        let next = tree.node(current.children.first()?)?;
        if let Some(raw) = &next.message {
            if let Ok(ConversationNode::Assistant(assistant)) = parse_message(&next.id, raw) {
                if assistant.is_user_visible() {
                    return Some(assistant.message_id);
                }
            }
        }
        current = next;
    }
}
