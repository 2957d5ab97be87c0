use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::diff::Change;
use crate::group::GroupSeed;
use crate::tree::{Tree, TreeNode, ROOT_ID};

/// Request from a client to the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// Response from the daemon to a client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl Response {
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: u64, code: i32, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(ErrorInfo {
                code,
                message: message.into(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: i32,
    pub message: String,
}

pub const PARSE_ERROR: i32 = -32700;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const SERVER_ERROR: i32 = -32000;

/// Event from daemon to clients (no id, push-based)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event: String,
    pub data: Value,
}

// --- Method Parameters ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeIdParams {
    pub node_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoveParams {
    pub node_ids: Vec<String>,
    /// None = drop on the root
    pub target_parent_id: Option<String>,
    /// None = append after the last child
    pub target_index: Option<usize>,
}

impl MoveParams {
    pub fn target(&self) -> &str {
        self.target_parent_id.as_deref().unwrap_or(ROOT_ID)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsertParams {
    pub parent_id: Option<String>,
    #[serde(flatten)]
    pub seed: GroupSeed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenameParams {
    pub node_id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmParams {
    pub accepted: bool,
}

// --- Event Data ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmRequiredData {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertData {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeChangesData {
    /// JSON-encoded change list, as handed to the action callback
    pub changes_json: String,
}

// --- Results ---

/// Flattened view of a tree, nodes in display pre-order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeSnapshot {
    pub root: TreeNode,
    pub nodes: Vec<TreeNode>,
}

impl From<&Tree> for TreeSnapshot {
    fn from(tree: &Tree) -> Self {
        Self {
            root: tree.root().clone(),
            nodes: tree.iter().cloned().collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeListResult {
    pub changes: Vec<Change>,
}
