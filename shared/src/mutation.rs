//! Structural edits on a [`Tree`].
//!
//! Every operation borrows the current snapshot and returns a new one, so
//! callers can keep the previous snapshot for diffing or rollback. A refused
//! edit returns a [`TreeError`] and produces nothing.

use std::collections::HashMap;
use tracing::debug;

use crate::error::TreeError;
use crate::group::{new_pending_id, GroupRecord, GroupSeed};
use crate::tree::{Tree, TreeNode, ROOT_ID};

/// Result of [`rename_node`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenameOutcome {
    Renamed(Tree),
    /// A pending group was given an empty name and has been dropped.
    Abandoned(Tree),
    /// Empty name on a persisted group; nothing changed.
    Unchanged,
}

/// Move `node_ids` under `target_parent`, starting at `target_index`.
///
/// Nodes keep their relative batch order. Siblings in the source and target
/// lists are renumbered so `sort_no` matches position, and the depths of
/// every moved subtree are re-derived.
pub fn move_nodes(
    tree: &Tree,
    node_ids: &[String],
    target_parent: &str,
    target_index: usize,
) -> Result<Tree, TreeError> {
    tree.can_drop(node_ids, target_parent)?;

    let mut next = tree.clone();
    let mut target_index = target_index;
    let mut seen: Vec<&str> = Vec::with_capacity(node_ids.len());
    let mut touched_parents: Vec<String> = vec![target_parent.to_string()];

    for id in node_ids {
        if seen.contains(&id.as_str()) {
            continue;
        }
        let offset = seen.len();
        seen.push(id);

        let old_parent = next
            .parent_key(id)
            .ok_or_else(|| TreeError::NodeNotFound(id.clone()))?;

        if let Some(parent) = next.get_mut(&old_parent) {
            if let Some(old_index) = parent.children.iter().position(|child| child == id) {
                parent.children.remove(old_index);
                if old_parent == target_parent && old_index < target_index {
                    target_index -= 1;
                }
            }
        }
        if !touched_parents.contains(&old_parent) {
            touched_parents.push(old_parent);
        }

        let target = next
            .get_mut(target_parent)
            .ok_or_else(|| TreeError::TargetNotFound(target_parent.to_string()))?;
        let insert_at = target_index.saturating_add(offset).min(target.children.len());
        target.children.insert(insert_at, id.clone());

        if let Some(node) = next.get_mut(id) {
            node.data.parent_id = if target_parent == ROOT_ID {
                None
            } else {
                Some(target_parent.to_string())
            };
        }
        next.recompute_subtree_depths(id);
    }

    for parent in &touched_parents {
        next.resequence_children(parent);
    }

    debug!(
        "Moved {} groups under {} at {}",
        seen.len(),
        target_parent,
        target_index
    );
    Ok(next)
}

/// Append a new pending group as the last child of `parent_id`.
///
/// Returns the new snapshot and the temporary id assigned to the group.
pub fn insert_node(
    tree: &Tree,
    parent_id: &str,
    seed: GroupSeed,
) -> Result<(Tree, String), TreeError> {
    let parent = tree
        .get(parent_id)
        .ok_or_else(|| TreeError::TargetNotFound(parent_id.to_string()))?;

    let sort_no = parent
        .children
        .iter()
        .filter_map(|child| tree.get(child))
        .map(|child| child.data.sort_no)
        .max()
        .map(|max| max + 1)
        .unwrap_or(0);

    let id = new_pending_id();
    let record = GroupRecord {
        id: id.clone(),
        name: seed.name.trim().to_string(),
        parent_id: (parent_id != ROOT_ID).then(|| parent_id.to_string()),
        sort_no,
        depth: tree.depth_of(parent_id) + 1,
        enabled: !seed.disabled,
        description: seed.description,
        pending_create: true,
    };

    let mut next = tree.clone();
    next.insert_node(TreeNode::from_record(record));
    if let Some(parent) = next.get_mut(parent_id) {
        parent.children.push(id.clone());
    }
    next.recompute_subtree_depths(&id);

    debug!("Inserted pending group {} under {}", id, parent_id);
    Ok((next, id))
}

/// Remove `node_id` together with its whole subtree.
///
/// Returns the new snapshot and the removed ids, in pre-order starting with
/// `node_id`. Children are not re-parented.
pub fn remove_node(tree: &Tree, node_id: &str) -> Result<(Tree, Vec<String>), TreeError> {
    if node_id == ROOT_ID {
        return Err(TreeError::RootImmutable);
    }
    let parent = tree
        .parent_key(node_id)
        .ok_or_else(|| TreeError::NodeNotFound(node_id.to_string()))?;

    let mut removed = vec![node_id.to_string()];
    removed.extend(tree.preorder(node_id).into_iter().map(String::from));

    let mut next = tree.clone();
    if let Some(parent) = next.get_mut(&parent) {
        parent.children.retain(|child| child != node_id);
    }
    for id in &removed {
        next.remove_entry(id);
    }

    debug!("Removed group {} and {} descendants", node_id, removed.len() - 1);
    Ok((next, removed))
}

/// Rename a group. See [`RenameOutcome`] for the empty-name cases.
pub fn rename_node(tree: &Tree, node_id: &str, new_name: &str) -> Result<RenameOutcome, TreeError> {
    let node = tree
        .get(node_id)
        .ok_or_else(|| TreeError::NodeNotFound(node_id.to_string()))?;
    if !node.renamable {
        return Err(TreeError::RootImmutable);
    }

    let name = new_name.trim();
    if name.is_empty() {
        if node.data.pending_create {
            let (next, _) = remove_node(tree, node_id)?;
            return Ok(RenameOutcome::Abandoned(next));
        }
        debug!("Ignoring empty name for group {}", node_id);
        return Ok(RenameOutcome::Unchanged);
    }

    let mut next = tree.clone();
    if let Some(node) = next.get_mut(node_id) {
        node.data.name = name.to_string();
    }
    Ok(RenameOutcome::Renamed(next))
}

/// Swap temporary ids for the ids the store assigned and clear the pending
/// marker on those groups. Ids missing from `tree` are skipped.
pub fn confirm_created(tree: &Tree, assigned: &HashMap<String, String>) -> Tree {
    let mut next = tree.clone();

    for (temp, real) in assigned {
        let Some(mut node) = next.remove_entry(temp) else {
            continue;
        };
        node.id = real.clone();
        node.data.id = real.clone();
        node.data.pending_create = false;

        let parent = node.data.parent_id.clone().unwrap_or_else(|| ROOT_ID.to_string());
        if let Some(parent) = next.get_mut(&parent) {
            for child in parent
                .children
                .iter_mut()
                .filter(|child| child.as_str() == temp.as_str())
            {
                *child = real.clone();
            }
        }
        for child in &node.children {
            if let Some(child) = next.get_mut(child) {
                child.data.parent_id = Some(real.clone());
            }
        }
        next.insert_node(node);
    }

    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::tests::{record, sample_tree};

    fn ids(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn assert_contiguous(tree: &Tree, parent: &str) {
        for (index, child) in tree.children(parent).iter().enumerate() {
            assert_eq!(tree.get(child).unwrap().data.sort_no, index as i64, "{}", child);
        }
    }

    #[test]
    fn test_move_to_other_parent() {
        let tree = sample_tree();
        let moved = move_nodes(&tree, &ids(&["A1"]), "B", 0).unwrap();

        assert_eq!(moved.children("B"), ["A1"]);
        let a1 = moved.get("A1").unwrap();
        assert_eq!(a1.data.parent_id.as_deref(), Some("B"));
        assert_eq!(a1.data.depth, 2);
        assert_eq!(moved.children("A"), ["A2"]);
        assert_eq!(moved.get("A2").unwrap().data.sort_no, 0);

        // the original snapshot is untouched
        assert_eq!(tree.children("A"), ["A1", "A2"]);
    }

    #[test]
    fn test_move_to_root_clears_parent() {
        let tree = sample_tree();
        let moved = move_nodes(&tree, &ids(&["A1"]), ROOT_ID, 0).unwrap();
        assert_eq!(moved.root().children, vec!["A1", "A", "B"]);
        assert_eq!(moved.get("A1").unwrap().data.parent_id, None);
        assert_eq!(moved.depth_of("A1"), 1);
        assert_contiguous(&moved, ROOT_ID);
        assert_contiguous(&moved, "A");
    }

    #[test]
    fn test_move_same_parent_adjusts_index() {
        let tree = Tree::build(vec![
            record("a", None, 0),
            record("x", None, 1),
            record("b", None, 2),
            record("c", None, 3),
        ]);
        let moved = move_nodes(&tree, &ids(&["x"]), ROOT_ID, 3).unwrap();
        assert_eq!(moved.root().children, vec!["a", "b", "x", "c"]);
        assert_contiguous(&moved, ROOT_ID);
    }

    #[test]
    fn test_move_clamps_index() {
        let tree = sample_tree();
        let moved = move_nodes(&tree, &ids(&["A1"]), "B", 99).unwrap();
        assert_eq!(moved.children("B"), ["A1"]);
    }

    #[test]
    fn test_move_batch_with_huge_index_appends() {
        let tree = sample_tree();
        let moved = move_nodes(&tree, &ids(&["A1", "A2"]), "B", usize::MAX).unwrap();
        assert_eq!(moved.children("B"), ["A1", "A2"]);
        assert!(moved.children("A").is_empty());
        assert_contiguous(&moved, "B");
    }

    #[test]
    fn test_move_batch_within_same_parent() {
        let tree = Tree::build(vec![
            record("a", None, 0),
            record("x", None, 1),
            record("b", None, 2),
            record("y", None, 3),
        ]);
        let moved = move_nodes(&tree, &ids(&["x", "y"]), ROOT_ID, 4).unwrap();
        assert_eq!(moved.root().children, vec!["a", "b", "x", "y"]);
        assert_contiguous(&moved, ROOT_ID);

        let moved = move_nodes(&tree, &ids(&["y", "a"]), ROOT_ID, 1).unwrap();
        assert_eq!(moved.root().children, vec!["y", "a", "x", "b"]);
        assert_contiguous(&moved, ROOT_ID);
    }

    #[test]
    fn test_move_batch_keeps_relative_order() {
        let tree = Tree::build(vec![
            record("p", None, 0),
            record("q", None, 1),
            record("q1", Some("q"), 0),
            record("x", Some("p"), 0),
            record("y", Some("p"), 1),
        ]);
        let moved = move_nodes(&tree, &ids(&["x", "y", "x"]), "q", 0).unwrap();
        assert_eq!(moved.children("q"), ["x", "y", "q1"]);
        assert!(moved.children("p").is_empty());
        assert_contiguous(&moved, "q");
    }

    #[test]
    fn test_move_cascades_depth() {
        let tree = Tree::build(vec![
            record("A", None, 0),
            record("A1", Some("A"), 0),
            record("A1a", Some("A1"), 0),
            record("B", None, 1),
            record("B1", Some("B"), 0),
        ]);
        let moved = move_nodes(&tree, &ids(&["A"]), "B1", 0).unwrap();
        assert_eq!(moved.depth_of("A"), 3);
        assert_eq!(moved.depth_of("A1"), 4);
        assert_eq!(moved.depth_of("A1a"), 5);
        // descendants keep their order values
        assert_eq!(moved.get("A1a").unwrap().data.sort_no, 0);
    }

    #[test]
    fn test_move_is_idempotent() {
        let tree = sample_tree();
        let cases: Vec<(Vec<String>, &str, usize)> = vec![
            (ids(&["A1"]), "B", 0),
            (ids(&["A1"]), "A", 2),
            (ids(&["B"]), ROOT_ID, 0),
            (ids(&["A1", "A2"]), "B", 5),
            (ids(&["A"]), "B", 1),
        ];
        for (nodes, target, index) in cases {
            let once = move_nodes(&tree, &nodes, target, index).unwrap();
            let twice = move_nodes(&once, &nodes, target, index).unwrap();
            assert_eq!(once, twice, "{:?} -> {} @ {}", nodes, target, index);
        }
    }

    #[test]
    fn test_move_into_descendant_is_rejected() {
        let tree = sample_tree();
        let err = move_nodes(&tree, &ids(&["A"]), "A1", 0).unwrap_err();
        assert!(matches!(err, TreeError::Cycle { .. }));
    }

    #[test]
    fn test_insert_appends_pending_child() {
        let tree = sample_tree();
        let (next, id) = insert_node(&tree, "A", GroupSeed::named(" New ")).unwrap();
        let node = next.get(&id).unwrap();
        assert!(node.data.pending_create);
        assert_eq!(node.data.name, "New");
        assert_eq!(node.data.sort_no, 2);
        assert_eq!(node.data.depth, 2);
        assert_eq!(next.children("A").last(), Some(&id));

        let (next, top) = insert_node(&next, ROOT_ID, GroupSeed::default()).unwrap();
        assert_eq!(next.get(&top).unwrap().data.parent_id, None);
        assert_eq!(next.depth_of(&top), 1);

        let (next, leaf) = insert_node(&next, "B", GroupSeed::default()).unwrap();
        assert_eq!(next.get(&leaf).unwrap().data.sort_no, 0);
    }

    #[test]
    fn test_insert_unknown_parent() {
        let tree = sample_tree();
        assert!(matches!(
            insert_node(&tree, "ghost", GroupSeed::default()),
            Err(TreeError::TargetNotFound(_))
        ));
    }

    #[test]
    fn test_remove_drops_subtree() {
        let tree = sample_tree();
        let (next, removed) = remove_node(&tree, "A").unwrap();
        assert_eq!(removed, vec!["A", "A1", "A2"]);
        for id in ["A", "A1", "A2"] {
            assert!(!next.contains(id));
        }
        assert_eq!(next.root().children, vec!["B"]);
        assert_eq!(next.preorder(ROOT_ID), vec!["B"]);
        assert_eq!(remove_node(&tree, ROOT_ID), Err(TreeError::RootImmutable));
    }

    #[test]
    fn test_rename() {
        let tree = sample_tree();
        match rename_node(&tree, "A", "Alpha").unwrap() {
            RenameOutcome::Renamed(next) => assert_eq!(next.get("A").unwrap().data.name, "Alpha"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(rename_node(&tree, "A", "   ").unwrap(), RenameOutcome::Unchanged);
        assert_eq!(rename_node(&tree, ROOT_ID, "x"), Err(TreeError::RootImmutable));
    }

    #[test]
    fn test_empty_rename_abandons_pending_group() {
        let tree = sample_tree();
        let (next, id) = insert_node(&tree, "A", GroupSeed::default()).unwrap();
        match rename_node(&next, &id, "").unwrap() {
            RenameOutcome::Abandoned(after) => {
                assert!(!after.contains(&id));
                assert_eq!(after, tree);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_confirm_created_rekeys_pending_groups() {
        let tree = sample_tree();
        let (tree, parent) = insert_node(&tree, "B", GroupSeed::named("P")).unwrap();
        let (tree, child) = insert_node(&tree, &parent, GroupSeed::named("C")).unwrap();

        let mut assigned = HashMap::new();
        assigned.insert(parent.clone(), "101".to_string());
        assigned.insert(child.clone(), "102".to_string());
        let confirmed = confirm_created(&tree, &assigned);

        assert!(!confirmed.contains(&parent));
        assert_eq!(confirmed.children("B"), ["101"]);
        assert_eq!(confirmed.children("101"), ["102"]);
        let c = confirmed.get("102").unwrap();
        assert_eq!(c.data.parent_id.as_deref(), Some("101"));
        assert!(!c.data.pending_create);
        assert_eq!(c.data.depth, 3);
    }
}
