//! Stages tree edits, asks for confirmation where needed and pushes them to
//! the record store in a single batch.

use serde_json::Value;
use shared::{
    diff, is_pending_id, is_simple, remove_node, AttributeMapping, Change, ChangeBatch, ChangeKind,
    DiffOptions, Field, Tree, TreeError,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::gate::ConfirmGate;
use crate::journal::{changes_json, ChangeAction, ChangeJournal};
use crate::store::{RecordStore, StoreRecord};

#[derive(Debug, Clone)]
pub struct CommitSettings {
    pub entity: String,
    pub refresh_delay: Duration,
    pub max_concurrent_resolutions: usize,
    pub diff: DiffOptions,
    pub mapping: AttributeMapping,
}

impl CommitSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            entity: config.commit.entity.clone(),
            refresh_delay: config.commit.refresh_delay(),
            max_concurrent_resolutions: config.commit.max_concurrent_resolutions.max(1),
            diff: DiffOptions {
                track_names: config.tree.track_names,
            },
            mapping: config.attributes.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    /// Nothing differs; the new snapshot can become the base as is.
    NoChanges,
    Committed {
        changes: Vec<Change>,
        committed: usize,
        /// Ids whose records could not be resolved and were left out
        skipped: Vec<String>,
        /// Temporary id -> id assigned by the store
        id_map: HashMap<String, String>,
    },
    /// The user declined; the previous snapshot should be restored.
    Rejected,
    /// The store refused the batch; local edits stay in place.
    Failed { changes: Vec<Change>, error: String },
    /// Another commit is still waiting for confirmation or the store.
    Busy,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeleteOutcome {
    Deleted { tree: Tree, removed: Vec<String> },
    Rejected,
    Failed { error: String },
    Busy,
}

pub struct CommitCoordinator {
    store: Arc<dyn RecordStore>,
    gate: Arc<dyn ConfirmGate>,
    journal: ChangeJournal,
    action: Option<Arc<dyn ChangeAction>>,
    settings: CommitSettings,
    in_flight: Mutex<()>,
    refresh_tx: Option<mpsc::UnboundedSender<()>>,
}

impl CommitCoordinator {
    pub fn new(
        store: Arc<dyn RecordStore>,
        gate: Arc<dyn ConfirmGate>,
        journal: ChangeJournal,
        settings: CommitSettings,
    ) -> Self {
        Self {
            store,
            gate,
            journal,
            action: None,
            settings,
            in_flight: Mutex::new(()),
            refresh_tx: None,
        }
    }

    pub fn with_action(mut self, action: Arc<dyn ChangeAction>) -> Self {
        self.action = Some(action);
        self
    }

    /// Signalled once the delayed post-commit reload has run.
    pub fn with_refresh_notifier(mut self, tx: mpsc::UnboundedSender<()>) -> Self {
        self.refresh_tx = Some(tx);
        self
    }

    pub fn journal(&self) -> &ChangeJournal {
        &self.journal
    }

    pub fn pending_changes(&self, current: &Tree, previous: &Tree) -> Vec<Change> {
        diff(current, previous, self.settings.diff)
    }

    /// Push the edits that turn `previous` into `current` to the store.
    ///
    /// Creations and pure renames go straight through; anything that moves
    /// groups around is confirmed first.
    pub async fn request_commit(&self, current: &Tree, previous: &Tree) -> CommitOutcome {
        let changes = self.pending_changes(current, previous);
        if changes.is_empty() {
            debug!("No group changes to commit");
            return CommitOutcome::NoChanges;
        }

        let Ok(_guard) = self.in_flight.try_lock() else {
            warn!("Commit requested while another is pending");
            return CommitOutcome::Busy;
        };

        if !is_simple(&changes, previous) {
            let message = confirm_message(&changes);
            if !self.gate.confirm(&message).await {
                info!("Commit of {} changes declined, rolling back", changes.len());
                return CommitOutcome::Rejected;
            }
        }

        self.apply(changes).await
    }

    async fn apply(&self, changes: Vec<Change>) -> CommitOutcome {
        let (records, skipped, id_map) = self.resolve_records(&changes).await;
        let committed = records.len();

        let result = if records.is_empty() {
            Err(anyhow::anyhow!("none of the changed groups could be loaded"))
        } else {
            self.store.commit(records).await
        };
        self.record(&changes);

        match result {
            Ok(()) => {
                info!(
                    "Committed {} group changes ({} skipped)",
                    committed,
                    skipped.len()
                );
                self.schedule_refresh();
                CommitOutcome::Committed {
                    changes,
                    committed,
                    skipped,
                    id_map,
                }
            }
            Err(e) => {
                error!("Group commit failed: {}", e);
                self.gate
                    .alert(&format!("Saving group changes failed: {}", e))
                    .await;
                CommitOutcome::Failed {
                    changes,
                    error: e.to_string(),
                }
            }
        }
    }

    /// Turn each change into a store record with its fields set.
    ///
    /// New groups are created first so children created in the same batch can
    /// point at their parent's real id. Existing records are fetched in
    /// parallel; one that fails to load is left out of the batch.
    async fn resolve_records(
        &self,
        changes: &[Change],
    ) -> (Vec<StoreRecord>, Vec<String>, HashMap<String, String>) {
        let mut records = Vec::with_capacity(changes.len());
        let mut skipped = Vec::new();
        let mut id_map = HashMap::new();

        let (creates, updates): (Vec<&Change>, Vec<&Change>) =
            changes.iter().partition(|change| change.is_pending());

        // Creates arrive parents first, so a failed parent is mapped (or not)
        // before any of its children are looked at
        let mut created = Vec::with_capacity(creates.len());
        for change in creates {
            if orphaned(change, &id_map) {
                warn!("Skipping {}: its new parent was not created", change.id);
                skipped.push(change.id.clone());
                continue;
            }
            match self.store.create(&self.settings.entity).await {
                Ok(record) => {
                    id_map.insert(change.id.clone(), record.guid.clone());
                    created.push((change, record));
                }
                Err(e) => {
                    warn!("Could not create record for {}: {}", change.id, e);
                    skipped.push(change.id.clone());
                }
            }
        }

        let updates: Vec<&Change> = updates
            .into_iter()
            .filter(|change| {
                if orphaned(change, &id_map) {
                    warn!("Skipping {}: its new parent was not created", change.id);
                    skipped.push(change.id.clone());
                    return false;
                }
                true
            })
            .collect();

        let semaphore = Arc::new(Semaphore::new(self.settings.max_concurrent_resolutions));
        let mut tasks = JoinSet::new();
        for (index, change) in updates.iter().enumerate() {
            let store = Arc::clone(&self.store);
            let semaphore = Arc::clone(&semaphore);
            let id = change.id.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                (index, store.fetch(&id).await)
            });
        }

        let mut fetched: Vec<Option<StoreRecord>> = vec![None; updates.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, Ok(record))) => fetched[index] = Some(record),
                Ok((index, Err(e))) => {
                    warn!("Could not resolve group {}: {}", updates[index].id, e)
                }
                Err(e) => warn!("Record resolution task failed: {}", e),
            }
        }

        for (change, mut record) in created {
            self.write_fields(&mut record, change, &id_map);
            records.push(record);
        }
        for (change, record) in updates.iter().zip(fetched) {
            match record {
                Some(mut record) => {
                    self.write_fields(&mut record, change, &id_map);
                    records.push(record);
                }
                None => skipped.push(change.id.clone()),
            }
        }

        (records, skipped, id_map)
    }

    fn write_fields(
        &self,
        record: &mut StoreRecord,
        change: &Change,
        id_map: &HashMap<String, String>,
    ) {
        let mapping = &self.settings.mapping;

        if let Some(id) = id_map.get(&change.id) {
            record.set(mapping.attribute_name(Field::Id), id.as_str());
        }
        let parent = change
            .parent_id
            .as_ref()
            .map(|parent| id_map.get(parent).unwrap_or(parent).clone());
        record.set(
            mapping.attribute_name(Field::ParentId),
            parent.map(Value::from).unwrap_or(Value::Null),
        );
        record.set(mapping.attribute_name(Field::SortNo), change.sort_no);
        record.set(mapping.attribute_name(Field::Depth), change.depth);
        if let Some(name) = &change.name {
            record.set(mapping.attribute_name(Field::Name), name.as_str());
        }
    }

    /// Remove `node_id` and its subtree from the store right away.
    ///
    /// Groups that only exist locally are dropped without a prompt or a store
    /// call. Returns the snapshot without the subtree on success.
    pub async fn request_delete(
        &self,
        tree: &Tree,
        node_id: &str,
    ) -> Result<DeleteOutcome, TreeError> {
        let (next, removed) = remove_node(tree, node_id)?;

        let persisted: Vec<&str> = removed
            .iter()
            .map(String::as_str)
            .filter(|id| tree.get(id).is_some_and(|node| !node.data.pending_create))
            .collect();
        if persisted.is_empty() {
            debug!("Dropped local-only group {}", node_id);
            return Ok(DeleteOutcome::Deleted { tree: next, removed });
        }

        let Ok(_guard) = self.in_flight.try_lock() else {
            warn!("Delete requested while a commit is pending");
            return Ok(DeleteOutcome::Busy);
        };

        let name = tree
            .get(node_id)
            .map(|node| node.data.name.clone())
            .unwrap_or_default();
        let message = match persisted.len() {
            1 => format!("Delete group \"{}\"?", name),
            n => format!("Delete group \"{}\" and its {} subgroups?", name, n - 1),
        };
        if !self.gate.confirm(&message).await {
            info!("Delete of {} declined", node_id);
            return Ok(DeleteOutcome::Rejected);
        }

        let ids: Vec<String> = persisted.iter().map(|id| id.to_string()).collect();
        if let Err(e) = self.store.delete(&ids).await {
            error!("Deleting groups failed: {}", e);
            self.gate
                .alert(&format!("Deleting groups failed: {}", e))
                .await;
            return Ok(DeleteOutcome::Failed {
                error: e.to_string(),
            });
        }

        let changes: Vec<Change> = persisted
            .iter()
            .filter_map(|id| tree.get(id))
            .map(|node| Change::of(node, ChangeKind::Delete))
            .collect();
        self.record(&changes);
        info!("Deleted {} groups", changes.len());

        Ok(DeleteOutcome::Deleted { tree: next, removed })
    }

    /// Journal the batch and hand it to the action hook.
    fn record(&self, changes: &[Change]) {
        if let Err(e) = self.journal.save(&ChangeBatch::now(changes.to_vec())) {
            error!("Failed to journal changes: {}", e);
        }
        if let Some(action) = &self.action {
            action.invoke(&changes_json(changes));
        }
    }

    /// Reload from the store after a short delay so server-side effects have
    /// landed. Not cancellable.
    fn schedule_refresh(&self) {
        let store = Arc::clone(&self.store);
        let delay = self.settings.refresh_delay;
        let notify = self.refresh_tx.clone();

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = store.reload().await {
                warn!("Post-commit reload failed: {}", e);
                return;
            }
            if let Some(tx) = notify {
                let _ = tx.send(());
            }
        });
    }
}

/// True when the change points at a new parent the store never created.
fn orphaned(change: &Change, id_map: &HashMap<String, String>) -> bool {
    change
        .parent_id
        .as_deref()
        .is_some_and(|parent| is_pending_id(parent) && !id_map.contains_key(parent))
}

fn confirm_message(changes: &[Change]) -> String {
    let moved = changes
        .iter()
        .filter(|change| change.kind == ChangeKind::Move)
        .count();
    if moved > 0 {
        format!(
            "Save {} group changes ({} moved to a new parent)?",
            changes.len(),
            moved
        )
    } else {
        format!("Save {} group changes?", changes.len())
    }
}
