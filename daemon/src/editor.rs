//! The editing session: the last snapshot known to match the store (base)
//! and the one the user is working on.

use anyhow::Result;
use serde::Serialize;
use shared::{
    confirm_created, insert_node, move_nodes, remove_node, rename_node, Change, Event, GroupSeed,
    Normalizer, RenameOutcome, Tree, TreeError, TreeSnapshot,
};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};

use crate::commit::{CommitCoordinator, CommitOutcome, DeleteOutcome};
use crate::store::RecordStore;

#[derive(Debug, Default)]
struct EditorState {
    base: Tree,
    working: Tree,
}

impl EditorState {
    fn is_dirty(&self) -> bool {
        self.base != self.working
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RenameStatus {
    Renamed,
    /// An unsaved group was given an empty name and dropped.
    Abandoned,
    Unchanged,
}

pub struct TreeEditor {
    state: RwLock<EditorState>,
    normalizer: Normalizer,
    store: Arc<dyn RecordStore>,
    coordinator: Arc<CommitCoordinator>,
    event_tx: broadcast::Sender<Event>,
}

impl TreeEditor {
    pub fn new(
        store: Arc<dyn RecordStore>,
        normalizer: Normalizer,
        coordinator: Arc<CommitCoordinator>,
        event_tx: broadcast::Sender<Event>,
    ) -> Self {
        Self {
            state: RwLock::new(EditorState::default()),
            normalizer,
            store,
            coordinator,
            event_tx,
        }
    }

    pub fn coordinator(&self) -> &CommitCoordinator {
        &self.coordinator
    }

    /// Rebuild the base snapshot from the store.
    ///
    /// The working snapshot follows only when it carries no local edits.
    pub async fn refresh(&self) -> Result<usize> {
        let records = self.store.load().await?;
        let tree = Tree::build(self.normalizer.normalize(&records));
        let count = tree.len();

        let mut state = self.state.write().await;
        if state.is_dirty() {
            info!("Refreshed {} groups, keeping unsaved edits", count);
        } else {
            state.working = tree.clone();
            info!("Refreshed {} groups", count);
        }
        state.base = tree;
        self.notify(&state.working);
        Ok(count)
    }

    pub async fn snapshot(&self) -> Tree {
        self.state.read().await.working.clone()
    }

    pub async fn can_drop(&self, node_ids: &[String], target: &str) -> Result<(), TreeError> {
        self.state.read().await.working.can_drop(node_ids, target)
    }

    /// Move `node_ids` under `target`; no index appends after the last child.
    pub async fn move_nodes(
        &self,
        node_ids: &[String],
        target: &str,
        index: Option<usize>,
    ) -> Result<(), TreeError> {
        let mut state = self.state.write().await;
        let index = index.unwrap_or_else(|| state.working.children(target).len());
        state.working = move_nodes(&state.working, node_ids, target, index)?;
        debug!("Moved {:?} under {} at {}", node_ids, target, index);
        self.notify(&state.working);
        Ok(())
    }

    pub async fn insert(&self, parent: &str, seed: GroupSeed) -> Result<String, TreeError> {
        let mut state = self.state.write().await;
        let (tree, id) = insert_node(&state.working, parent, seed)?;
        state.working = tree;
        self.notify(&state.working);
        Ok(id)
    }

    pub async fn rename(&self, node_id: &str, name: &str) -> Result<RenameStatus, TreeError> {
        let mut state = self.state.write().await;
        let status = match rename_node(&state.working, node_id, name)? {
            RenameOutcome::Renamed(tree) => {
                state.working = tree;
                RenameStatus::Renamed
            }
            RenameOutcome::Abandoned(tree) => {
                state.working = tree;
                RenameStatus::Abandoned
            }
            RenameOutcome::Unchanged => return Ok(RenameStatus::Unchanged),
        };
        self.notify(&state.working);
        Ok(status)
    }

    /// Delete a group and its subtree from the store, then from both
    /// snapshots.
    pub async fn remove(&self, node_id: &str) -> Result<DeleteOutcome, TreeError> {
        let working = self.snapshot().await;
        let outcome = self.coordinator.request_delete(&working, node_id).await?;

        if let DeleteOutcome::Deleted { .. } = &outcome {
            // Edits may have landed while the prompt was open
            let mut state = self.state.write().await;
            if let Ok((tree, _)) = remove_node(&state.working, node_id) {
                state.working = tree;
            }
            if let Ok((tree, _)) = remove_node(&state.base, node_id) {
                state.base = tree;
            }
            self.notify(&state.working);
        }
        Ok(outcome)
    }

    pub async fn pending_changes(&self) -> Vec<Change> {
        let state = self.state.read().await;
        self.coordinator.pending_changes(&state.working, &state.base)
    }

    /// Commit the working snapshot against the base.
    ///
    /// The lock is released while the coordinator waits for confirmation so
    /// other requests keep being served.
    pub async fn commit(&self) -> CommitOutcome {
        let (current, previous) = {
            let state = self.state.read().await;
            (state.working.clone(), state.base.clone())
        };

        let outcome = self.coordinator.request_commit(&current, &previous).await;

        let mut state = self.state.write().await;
        match &outcome {
            CommitOutcome::NoChanges => {
                state.base = current;
            }
            CommitOutcome::Committed { id_map, .. } => {
                state.base = confirm_created(&current, id_map);
                state.working = confirm_created(&state.working, id_map);
                self.notify(&state.working);
            }
            CommitOutcome::Rejected => {
                state.working = previous;
                self.notify(&state.working);
            }
            CommitOutcome::Failed { .. } | CommitOutcome::Busy => {}
        }
        outcome
    }

    /// Drop every unsaved edit.
    pub async fn discard(&self) {
        let mut state = self.state.write().await;
        state.working = state.base.clone();
        self.notify(&state.working);
    }

    fn notify(&self, tree: &Tree) {
        let event = Event {
            event: "tree.updated".to_string(),
            data: serde_json::to_value(TreeSnapshot::from(tree)).unwrap_or_default(),
        };
        let _ = self.event_tx.send(event);
    }
}
