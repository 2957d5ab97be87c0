//! Per-node differences between two snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::group::is_pending_id;
use crate::tree::{Tree, TreeNode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
    Move,
}

/// One node's delta, also the unit sent to the record store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    pub id: String,
    pub parent_id: Option<String>,
    pub sort_no: i64,
    pub depth: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub kind: ChangeKind,
}

impl Change {
    /// Snapshot of `node` as a change of the given kind.
    pub fn of(node: &TreeNode, kind: ChangeKind) -> Self {
        Self {
            id: node.id.clone(),
            parent_id: node.data.parent_id.clone(),
            sort_no: node.data.sort_no,
            depth: node.data.depth,
            name: None,
            kind,
        }
    }

    /// True when the store has never seen this id.
    pub fn is_pending(&self) -> bool {
        self.kind == ChangeKind::Create || is_pending_id(&self.id)
    }
}

/// A change list stamped with the time it was produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeBatch {
    pub changes: Vec<Change>,
    pub timestamp: DateTime<Utc>,
}

impl ChangeBatch {
    pub fn now(changes: Vec<Change>) -> Self {
        Self {
            changes,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiffOptions {
    /// Also report name-only changes
    pub track_names: bool,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self { track_names: true }
    }
}

/// Changes that turn `previous` into `current`, in `current`'s display order.
///
/// Groups missing from `current` are not reported; deletion has its own flow.
pub fn diff(current: &Tree, previous: &Tree, options: DiffOptions) -> Vec<Change> {
    let mut changes = Vec::new();

    for node in current.iter() {
        let Some(before) = previous.get(&node.id) else {
            let mut change = Change::of(node, ChangeKind::Create);
            change.name = Some(node.data.name.clone());
            changes.push(change);
            continue;
        };

        let parent_changed = node.data.parent_id != before.data.parent_id;
        let structure_changed = parent_changed
            || node.data.sort_no != before.data.sort_no
            || node.data.depth != before.data.depth;
        let name_changed = options.track_names && node.data.name != before.data.name;

        if !structure_changed && !name_changed {
            continue;
        }

        let kind = if node.data.pending_create {
            ChangeKind::Create
        } else if parent_changed {
            ChangeKind::Move
        } else {
            ChangeKind::Update
        };
        let mut change = Change::of(node, kind);
        if name_changed || kind == ChangeKind::Create {
            change.name = Some(node.data.name.clone());
        }
        changes.push(change);
    }

    changes
}

/// True when every change is a creation or a pure rename, which the
/// commit path applies without asking for confirmation.
pub fn is_simple(changes: &[Change], previous: &Tree) -> bool {
    changes.iter().all(|change| match change.kind {
        ChangeKind::Create => true,
        ChangeKind::Update => {
            change.name.is_some()
                && previous.get(&change.id).is_some_and(|before| {
                    before.data.parent_id == change.parent_id
                        && before.data.sort_no == change.sort_no
                        && before.data.depth == change.depth
                })
        }
        ChangeKind::Move | ChangeKind::Delete => false,
    })
}
