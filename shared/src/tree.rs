//! Indexed group tree rooted under a synthetic root node.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

use crate::error::TreeError;
use crate::group::GroupRecord;

/// Reserved id of the synthetic root. Never collides with a store id.
pub const ROOT_ID: &str = "__group_root__";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeNode {
    pub id: String,
    pub data: GroupRecord,
    /// Child ids in display order
    pub children: Vec<String>,
    pub is_container: bool,
    pub movable: bool,
    pub renamable: bool,
}

impl TreeNode {
    pub(crate) fn from_record(record: GroupRecord) -> Self {
        Self {
            id: record.id.clone(),
            movable: record.enabled,
            renamable: true,
            is_container: true,
            children: Vec::new(),
            data: record,
        }
    }

    fn root() -> Self {
        let mut data = GroupRecord::new(ROOT_ID, "Root", None);
        data.depth = 0;
        Self {
            id: ROOT_ID.to_string(),
            data,
            children: Vec::new(),
            is_container: true,
            movable: false,
            renamable: false,
        }
    }

    pub fn is_root(&self) -> bool {
        self.id == ROOT_ID
    }
}

/// One snapshot of the group hierarchy.
///
/// Cloning is the snapshot mechanism: mutations in [`crate::mutation`] take
/// `&Tree` and hand back a new value, so an older snapshot stays valid for
/// diffing and rollback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tree {
    nodes: HashMap<String, TreeNode>,
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

impl Tree {
    /// A tree holding only the root.
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(ROOT_ID.to_string(), TreeNode::root());
        Self { nodes }
    }

    /// Build a tree from normalized records.
    ///
    /// Records without a known parent hang off the root. Children are ordered
    /// by `sort_no` (stable, so ties keep input order) and depths are derived
    /// from the resulting structure rather than taken from the source.
    pub fn build<I>(records: I) -> Self
    where
        I: IntoIterator<Item = GroupRecord>,
    {
        let mut tree = Tree::new();
        let mut order: Vec<String> = Vec::new();

        for record in records {
            if record.id.is_empty() || record.id == ROOT_ID {
                warn!("Skipping group with reserved or empty id {:?}", record.id);
                continue;
            }
            if tree.nodes.contains_key(&record.id) {
                warn!("Duplicate group id {}, keeping the first occurrence", record.id);
                continue;
            }
            order.push(record.id.clone());
            tree.nodes.insert(record.id.clone(), TreeNode::from_record(record));
        }

        for id in &order {
            let parent_key = match tree.nodes[id].data.parent_id.clone() {
                Some(parent)
                    if parent != *id && tree.nodes.contains_key(&parent) && parent != ROOT_ID =>
                {
                    parent
                }
                Some(parent) => {
                    if parent != ROOT_ID {
                        debug!("Group {} has unknown parent {}, attaching to root", id, parent);
                    }
                    if let Some(node) = tree.nodes.get_mut(id) {
                        node.data.parent_id = None;
                    }
                    ROOT_ID.to_string()
                }
                None => ROOT_ID.to_string(),
            };
            if let Some(parent) = tree.nodes.get_mut(&parent_key) {
                parent.children.push(id.clone());
            }
        }

        tree.break_source_cycles(&order);

        let sort_nos: HashMap<String, i64> = tree
            .nodes
            .iter()
            .map(|(id, node)| (id.clone(), node.data.sort_no))
            .collect();
        for node in tree.nodes.values_mut() {
            node.children
                .sort_by_key(|child| sort_nos.get(child).copied().unwrap_or(0));
        }

        let source_depths: HashMap<String, i64> = order
            .iter()
            .map(|id| (id.clone(), tree.nodes[id].data.depth))
            .collect();
        tree.recompute_subtree_depths(ROOT_ID);

        let drifted = source_depths
            .iter()
            .filter(|(id, depth)| **depth > 0 && tree.depth_of(id) != **depth)
            .count();
        if drifted > 0 {
            debug!("{} groups had a stored depth that did not match the hierarchy", drifted);
        }

        tree
    }

    /// Nodes whose parent chain loops back on itself are unreachable from
    /// the root. Re-home them under the root until everything is reachable.
    fn break_source_cycles(&mut self, order: &[String]) {
        let mut reachable: HashSet<String> = self
            .preorder(ROOT_ID)
            .into_iter()
            .map(String::from)
            .collect();

        for id in order {
            if reachable.contains(id) {
                continue;
            }
            warn!("Group {} is part of a parent cycle, attaching to root", id);

            let old_parent = self.nodes[id].data.parent_id.clone();
            if let Some(parent) = old_parent.and_then(|p| self.nodes.get_mut(&p)) {
                parent.children.retain(|child| child != id);
            }
            if let Some(node) = self.nodes.get_mut(id) {
                node.data.parent_id = None;
            }
            if let Some(root) = self.nodes.get_mut(ROOT_ID) {
                root.children.push(id.clone());
            }

            reachable.insert(id.clone());
            reachable.extend(self.preorder(id).into_iter().map(String::from));
        }
    }

    pub fn root(&self) -> &TreeNode {
        &self.nodes[ROOT_ID]
    }

    pub fn get(&self, id: &str) -> Option<&TreeNode> {
        self.nodes.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: &str) -> Option<&mut TreeNode> {
        self.nodes.get_mut(id)
    }

    pub(crate) fn insert_node(&mut self, node: TreeNode) {
        self.nodes.insert(node.id.clone(), node);
    }

    pub(crate) fn remove_entry(&mut self, id: &str) -> Option<TreeNode> {
        self.nodes.remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// Number of groups, root excluded.
    pub fn len(&self) -> usize {
        self.nodes.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn children(&self, id: &str) -> &[String] {
        self.nodes
            .get(id)
            .map(|node| node.children.as_slice())
            .unwrap_or(&[])
    }

    /// Key of the node holding `id` in its children (the root for top-level groups).
    pub fn parent_key(&self, id: &str) -> Option<String> {
        if id == ROOT_ID {
            return None;
        }
        self.nodes
            .get(id)
            .map(|node| node.data.parent_id.clone().unwrap_or_else(|| ROOT_ID.to_string()))
    }

    /// Depth of a node; the root sits at 0.
    pub fn depth_of(&self, id: &str) -> i64 {
        if id == ROOT_ID {
            return 0;
        }
        self.nodes.get(id).map(|node| node.data.depth).unwrap_or(0)
    }

    /// Ids below `from` in display pre-order, `from` itself excluded.
    pub fn preorder(&self, from: &str) -> Vec<&str> {
        let mut out = Vec::new();
        let mut stack: Vec<&str> = self
            .children(from)
            .iter()
            .rev()
            .map(String::as_str)
            .collect();

        while let Some(id) = stack.pop() {
            out.push(id);
            stack.extend(self.children(id).iter().rev().map(String::as_str));
        }
        out
    }

    /// Every group in display pre-order.
    pub fn iter(&self) -> impl Iterator<Item = &TreeNode> + '_ {
        self.preorder(ROOT_ID)
            .into_iter()
            .filter_map(move |id| self.nodes.get(id))
    }

    /// Flatten back into records, in display order.
    pub fn records(&self) -> Vec<GroupRecord> {
        self.iter().map(|node| node.data.clone()).collect()
    }

    /// True iff `ancestor` appears in the parent chain of `candidate`.
    ///
    /// A node is never its own descendant. A chain that runs into an unknown
    /// id ends the walk with `false`.
    pub fn is_descendant(&self, ancestor: &str, candidate: &str) -> bool {
        if ancestor == candidate {
            return false;
        }
        let Some(node) = self.nodes.get(candidate) else {
            return false;
        };
        if ancestor == ROOT_ID {
            return true;
        }

        let mut current = node.data.parent_id.as_deref();
        let mut steps = 0;
        while let Some(parent) = current {
            if parent == ancestor {
                return true;
            }
            if parent == ROOT_ID {
                break;
            }
            steps += 1;
            if steps > self.nodes.len() {
                warn!("Parent chain of {} does not terminate", candidate);
                return false;
            }
            current = self.nodes.get(parent).and_then(|p| p.data.parent_id.as_deref());
        }

        false
    }

    /// Check whether `node_ids` may be dropped into `target`.
    pub fn can_drop(&self, node_ids: &[String], target: &str) -> Result<(), TreeError> {
        if node_ids.is_empty() {
            return Err(TreeError::EmptyBatch);
        }
        if !self.nodes.contains_key(target) {
            return Err(TreeError::TargetNotFound(target.to_string()));
        }

        for id in node_ids {
            if id == ROOT_ID {
                return Err(TreeError::RootImmutable);
            }
            let node = self
                .nodes
                .get(id)
                .ok_or_else(|| TreeError::NodeNotFound(id.clone()))?;
            if id == target || self.is_descendant(id, target) {
                return Err(TreeError::Cycle {
                    node: id.clone(),
                    target: target.to_string(),
                });
            }
            if !node.movable {
                return Err(TreeError::NotMovable(id.clone()));
            }
        }

        Ok(())
    }

    /// Re-derive the depth of `id` from its parent and cascade to every
    /// descendant. Sort order is left alone.
    pub(crate) fn recompute_subtree_depths(&mut self, id: &str) {
        let start = if id == ROOT_ID {
            0
        } else {
            let parent_depth = self
                .parent_key(id)
                .map(|parent| self.depth_of(&parent))
                .unwrap_or(0);
            match self.nodes.get_mut(id) {
                Some(node) => {
                    node.data.depth = parent_depth + 1;
                    node.data.depth
                }
                None => return,
            }
        };

        let mut stack = vec![(id.to_string(), start)];
        while let Some((current, depth)) = stack.pop() {
            let children = self.children(&current).to_vec();
            for child in children {
                if let Some(node) = self.nodes.get_mut(&child) {
                    node.data.depth = depth + 1;
                    stack.push((child, depth + 1));
                }
            }
        }
    }

    /// Rewrite `sort_no` of every child of `parent` to its position.
    pub(crate) fn resequence_children(&mut self, parent: &str) {
        let children = self.children(parent).to_vec();
        for (index, child) in children.iter().enumerate() {
            if let Some(node) = self.nodes.get_mut(child) {
                node.data.sort_no = index as i64;
            }
        }
    }
}
