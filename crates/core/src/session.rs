//! Session tree — the branching conversation store.
//!
//! A session owns all its nodes in an id→node arena. A node's parent
//! pointer is a back-reference, never an ownership edge. The graph is
//! expected to be acyclic and connected to exactly one root
//! (`parent_id == None`), but traversal never trusts that: walking to the
//! root carries an explicit visited-set cycle guard.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::message::{Attachment, Role};

/// Node metadata. Compression nodes summarize a span of earlier nodes;
/// the ids they list are hidden from linearized history.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeMetadata {
    /// True if this node is a summary standing in for other nodes.
    #[serde(default)]
    pub is_compression_node: bool,

    /// Ids of the nodes this compression node supersedes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub compressed_node_ids: Vec<String>,
}

/// A single node in the session tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageNode {
    /// Unique node ID.
    pub id: String,

    /// Parent node ID. `None` only for the root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,

    /// Child node IDs (branches).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children_ids: Vec<String>,

    /// Sender role.
    pub role: Role,

    /// Message body (may carry rich markup).
    pub content: String,

    /// Disabled nodes are skipped during linearization.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Attachments on this node.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,

    /// Compression and other node metadata.
    #[serde(default)]
    pub metadata: NodeMetadata,
}

fn default_enabled() -> bool {
    true
}

impl MessageNode {
    /// Create an enabled node with no children.
    pub fn new(
        id: impl Into<String>,
        parent_id: Option<String>,
        role: Role,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            parent_id,
            children_ids: Vec::new(),
            role,
            content: content.into(),
            enabled: true,
            attachments: Vec::new(),
            metadata: NodeMetadata::default(),
        }
    }
}

/// A branching conversation session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Unique session ID.
    pub id: String,

    /// Optional title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    /// All nodes, keyed by id. The session exclusively owns its nodes.
    pub nodes: HashMap<String, MessageNode>,

    /// Tip of the currently viewed branch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_leaf_id: Option<String>,

    /// Wall-clock time of the last user activity, for idle-time macros.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl Session {
    /// Create an empty session with a root node.
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let root_id = format!("{id}-root");
        let mut nodes = HashMap::new();
        nodes.insert(
            root_id.clone(),
            MessageNode::new(root_id.clone(), None, Role::System, ""),
        );
        Self {
            id,
            title: None,
            nodes,
            active_leaf_id: Some(root_id),
            last_activity_at: None,
        }
    }

    /// Look up a node.
    pub fn node(&self, id: &str) -> Option<&MessageNode> {
        self.nodes.get(id)
    }

    /// Append a child node under `parent_id` and make it the active leaf.
    pub fn append(&mut self, mut node: MessageNode) -> Result<(), SessionError> {
        let parent_id = node
            .parent_id
            .clone()
            .ok_or_else(|| SessionError::NodeNotFound("<parent>".into()))?;
        let parent = self
            .nodes
            .get_mut(&parent_id)
            .ok_or_else(|| SessionError::NodeNotFound(parent_id.clone()))?;
        parent.children_ids.push(node.id.clone());
        node.children_ids.clear();
        self.active_leaf_id = Some(node.id.clone());
        self.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    /// Walk from `leaf_id` to the root via parent pointers, returning
    /// node ids leaf-first. The root node itself is included (callers
    /// exclude it from history). A visited set guards against cycles.
    pub fn path_to_root(&self, leaf_id: &str) -> Result<Vec<&MessageNode>, SessionError> {
        let mut path = Vec::new();
        let mut visited: HashSet<&str> = HashSet::new();
        let mut current = Some(leaf_id);

        while let Some(id) = current {
            if !visited.insert(id) {
                return Err(SessionError::CycleDetected(id.to_string()));
            }
            let node = self
                .nodes
                .get(id)
                .ok_or_else(|| SessionError::NodeNotFound(id.to_string()))?;
            path.push(node);
            current = node.parent_id.as_deref();
        }

        Ok(path)
    }

    /// Path from the active leaf to the root.
    pub fn active_path(&self) -> Result<Vec<&MessageNode>, SessionError> {
        let leaf = self
            .active_leaf_id
            .as_deref()
            .ok_or(SessionError::NoActiveLeaf)?;
        self.path_to_root(leaf)
    }
}
