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

//! Wire representation of the backend conversation tree.
//!
//! The backend models a chat as a node tree with parent/child links so
//! regenerations fork into sibling branches. Message payloads are kept
//! as raw JSON here; the normalizer converts them into typed nodes at
//! the boundary.

use serde::Deserialize;
use std::collections::{HashMap, HashSet};

/// Well-known id of the synthetic root node, when the backend names it.
const ROOT_NODE_ID: &str = "client-created-root";

/// Full conversation tree response.
#[derive(Debug, Clone, Deserialize)]
pub struct ConversationTree {
    #[serde(default)]
    pub title: Option<String>,
    pub mapping: HashMap<String, TreeNode>,
    #[serde(default)]
    pub current_node: Option<String>,
}

/// One node of the tree.
#[derive(Debug, Clone, Deserialize)]
pub struct TreeNode {
    pub id: String,
    #[serde(default)]
    pub message: Option<serde_json::Value>,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub children: Vec<String>,
}

impl ConversationTree {
    /// The traversal root: the well-known root id when present,
    /// otherwise the parentless node with the smallest id so repeated
    /// walks stay deterministic. `None` means there is no conversation
    /// to account, which is a legitimate state during navigation.
    pub fn root_id(&self) -> Option<&str> {
        if self.mapping.contains_key(ROOT_NODE_ID) {
            return Some(ROOT_NODE_ID);
        }
        self.mapping
            .iter()
            .filter(|(_, node)| node.parent.is_none())
            .map(|(id, _)| id.as_str())
            .min()
    }

    /// The currently-active branch: from the root, always the first
    /// child. Regeneration siblings beyond `children[0]` are not part
    /// of the live conversation. Cycles in malformed trees terminate
    /// the walk instead of hanging it.
    pub fn active_path(&self) -> Vec<&TreeNode> {
        let mut path = Vec::new();
        let mut visited = HashSet::new();
        let Some(root_id) = self.root_id() else {
            return path;
        };
        let mut current = self.mapping.get(root_id);
        while let Some(node) = current {
            if !visited.insert(node.id.as_str()) {
                break;
            }
            path.push(node);
            current = node
                .children
                .first()
                .and_then(|child_id| self.mapping.get(child_id));
        }
        path
    }

    pub fn node(&self, id: &str) -> Option<&TreeNode> {
        self.mapping.get(id)
    }
}
