//! Local record of the most recent change batch.
//!
//! Kept for diagnostics and audit only. Nothing reads it back into the tree.

use anyhow::Result;
use shared::{Change, ChangeBatch, Event, TreeChangesData};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error};

pub const JOURNAL_KEY: &str = "group_tree_changes";

/// Minimal string key-value persistence.
pub trait KeyValueStore: Send + Sync {
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// One file per key under a directory.
pub struct FileKvStore {
    dir: PathBuf,
}

impl FileKvStore {
    pub fn new(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }
}

impl KeyValueStore for FileKvStore {
    fn set(&self, key: &str, value: &str) -> Result<()> {
        fs::write(self.path(key), value)?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.path(key);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read_to_string(path)?))
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = self.path(key);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct ChangeJournal {
    store: Arc<dyn KeyValueStore>,
}

impl ChangeJournal {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn save(&self, batch: &ChangeBatch) -> Result<()> {
        let json = serde_json::to_string(batch)?;
        self.store.set(JOURNAL_KEY, &json)?;
        debug!("Journaled {} changes", batch.changes.len());
        Ok(())
    }

    /// The last saved batch. An unreadable entry is logged and treated as absent.
    pub fn last(&self) -> Result<Option<ChangeBatch>> {
        let Some(json) = self.store.get(JOURNAL_KEY)? else {
            return Ok(None);
        };
        match serde_json::from_str(&json) {
            Ok(batch) => Ok(Some(batch)),
            Err(e) => {
                error!("Failed to parse journaled changes: {}", e);
                Ok(None)
            }
        }
    }

    pub fn clear(&self) -> Result<()> {
        self.store.remove(JOURNAL_KEY)
    }
}

/// Hook fired with the JSON change list after each commit attempt.
pub trait ChangeAction: Send + Sync {
    fn invoke(&self, changes_json: &str);
}

/// Broadcasts the change list to connected clients as `tree.changes`.
pub struct EventAction {
    event_tx: broadcast::Sender<Event>,
}

impl EventAction {
    pub fn new(event_tx: broadcast::Sender<Event>) -> Self {
        Self { event_tx }
    }
}

impl ChangeAction for EventAction {
    fn invoke(&self, changes_json: &str) {
        let event = Event {
            event: "tree.changes".to_string(),
            data: serde_json::to_value(TreeChangesData {
                changes_json: changes_json.to_string(),
            })
            .unwrap_or_default(),
        };
        let _ = self.event_tx.send(event);
    }
}

pub fn changes_json(changes: &[Change]) -> String {
    serde_json::to_string(changes).unwrap_or_else(|_| "[]".to_string())
}


#[cfg(test)]
mod tests {
    use super::*;
    use shared::ChangeKind;

    fn sample_batch() -> ChangeBatch {
        ChangeBatch::now(vec![Change {
            id: "g1".to_string(),
            parent_id: Some("g0".to_string()),
            sort_no: 2,
            depth: 2,
            name: None,
            kind: ChangeKind::Move,
        }])
    }

    #[test]
    fn test_journal_round_trip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKvStore::new(dir.path().join("kv")).unwrap();
        let journal = ChangeJournal::new(Arc::new(store));
        assert!(journal.last().unwrap().is_none());

        let batch = sample_batch();
        journal.save(&batch).unwrap();
        assert_eq!(journal.last().unwrap(), Some(batch));

        journal.clear().unwrap();
        assert!(journal.last().unwrap().is_none());
        journal.clear().unwrap();
    }

    #[test]
    fn test_corrupt_entry_reads_as_empty() {
        let store = Arc::new(testing::MemoryKvStore::default());
        store.set(JOURNAL_KEY, "{not json").unwrap();
        let journal = ChangeJournal::new(store);
        assert!(journal.last().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_event_action_broadcasts() {
        let (event_tx, mut event_rx) = broadcast::channel(4);
        let action = EventAction::new(event_tx);
        action.invoke(&changes_json(&sample_batch().changes));

        let event = event_rx.recv().await.unwrap();
        assert_eq!(event.event, "tree.changes");
        let payload = event.data["changes_json"].as_str().unwrap();
        assert!(payload.contains("\"kind\":\"move\""));
    }
}
