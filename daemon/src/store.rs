//! The authoritative record store the editor reconciles against.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

/// A mutable record handed out by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreRecord {
    pub guid: String,
    pub entity: String,
    pub attributes: Map<String, Value>,
}

impl StoreRecord {
    pub fn new(entity: &str) -> Self {
        Self {
            guid: Uuid::new_v4().to_string(),
            entity: entity.to_string(),
            attributes: Map::new(),
        }
    }

    pub fn set(&mut self, name: &str, value: impl Into<Value>) {
        self.attributes.insert(name.to_string(), value.into());
    }

    /// Read a record in any shape: attributes come from a nested
    /// `"attributes"` object when present, otherwise from the top-level keys.
    pub fn from_value(value: Value) -> Self {
        let mut map = match value {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let guid = map
            .remove("guid")
            .and_then(|g| g.as_str().map(String::from))
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let entity = map
            .remove("entity")
            .and_then(|e| e.as_str().map(String::from))
            .unwrap_or_default();
        let attributes = match map.remove("attributes") {
            Some(Value::Object(attributes)) => attributes,
            _ => map,
        };
        Self {
            guid,
            entity,
            attributes,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "guid": self.guid,
            "entity": self.entity,
            "attributes": self.attributes,
        })
    }

    /// True when the record answers to `id` through its guid or `id_attribute`.
    pub fn matches(&self, id_attribute: &str, id: &str) -> bool {
        if self.guid == id {
            return true;
        }
        match self.attributes.get(id_attribute) {
            Some(Value::String(s)) => s == id,
            Some(Value::Number(n)) => n.to_string() == id,
            _ => false,
        }
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// All group records, in whatever shape the store keeps them.
    async fn load(&self) -> Result<Vec<Value>>;

    async fn fetch(&self, id: &str) -> Result<StoreRecord>;

    /// A fresh, not yet committed record of `entity`.
    async fn create(&self, entity: &str) -> Result<StoreRecord>;

    /// Persist every record in one batch. Either all are written or none.
    async fn commit(&self, records: Vec<StoreRecord>) -> Result<()>;

    async fn delete(&self, ids: &[String]) -> Result<()>;

    /// Advisory: pick up changes made outside this process.
    async fn reload(&self) -> Result<()>;
}

/// Records kept as a JSON array on disk.
pub struct JsonFileStore {
    path: PathBuf,
    id_attribute: String,
    records: RwLock<Vec<StoreRecord>>,
}

impl JsonFileStore {
    pub fn open(path: PathBuf, id_attribute: impl Into<String>) -> Result<Self> {
        let records = read_records(&path)?;
        info!("Record store opened: {} records in {:?}", records.len(), path);
        Ok(Self {
            path,
            id_attribute: id_attribute.into(),
            records: RwLock::new(records),
        })
    }

    fn write(&self, records: &[StoreRecord]) -> Result<()> {
        let values: Vec<Value> = records.iter().map(StoreRecord::to_value).collect();
        let json = serde_json::to_string_pretty(&values)?;

        // Backup before writing
        if self.path.exists() {
            let backup = self.path.with_extension("json.bak");
            fs::copy(&self.path, backup)?;
        }
        fs::write(&self.path, json)?;
        Ok(())
    }
}

fn read_records(path: &Path) -> Result<Vec<StoreRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(path)?;
    let values: Vec<Value> = serde_json::from_str(&content)?;
    Ok(values.into_iter().map(StoreRecord::from_value).collect())
}

#[async_trait]
impl RecordStore for JsonFileStore {
    async fn load(&self) -> Result<Vec<Value>> {
        let records = self.records.read().await;
        Ok(records.iter().map(StoreRecord::to_value).collect())
    }

    async fn fetch(&self, id: &str) -> Result<StoreRecord> {
        let records = self.records.read().await;
        records
            .iter()
            .find(|record| record.matches(&self.id_attribute, id))
            .cloned()
            .ok_or_else(|| anyhow!("record {} not found", id))
    }

    async fn create(&self, entity: &str) -> Result<StoreRecord> {
        Ok(StoreRecord::new(entity))
    }

    async fn commit(&self, batch: Vec<StoreRecord>) -> Result<()> {
        let mut records = self.records.write().await;
        let mut next = records.clone();
        for record in batch {
            match next.iter_mut().find(|existing| existing.guid == record.guid) {
                Some(existing) => *existing = record,
                None => next.push(record),
            }
        }
        self.write(&next)?;
        debug!("Committed batch, store now holds {} records", next.len());
        *records = next;
        Ok(())
    }

    async fn delete(&self, ids: &[String]) -> Result<()> {
        let mut records = self.records.write().await;
        let next: Vec<StoreRecord> = records
            .iter()
            .filter(|record| !ids.iter().any(|id| record.matches(&self.id_attribute, id)))
            .cloned()
            .collect();
        self.write(&next)?;
        debug!("Deleted {} records", records.len() - next.len());
        *records = next;
        Ok(())
    }

    async fn reload(&self) -> Result<()> {
        let fresh = read_records(&self.path)?;
        *self.records.write().await = fresh;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// In-memory store with switchable failures.
    #[derive(Default)]
    pub struct MemoryStore {
        pub records: Mutex<Vec<StoreRecord>>,
        pub unresolvable: Mutex<HashSet<String>>,
        pub fail_create: AtomicBool,
        pub fail_commit: AtomicBool,
        pub fail_delete: AtomicBool,
        pub commits: AtomicUsize,
        pub reloads: AtomicUsize,
    }

    impl MemoryStore {
        pub fn with_groups(groups: &[(&str, &str, Option<&str>, i64)]) -> Self {
            let store = Self::default();
            {
                let mut records = store.records.lock().unwrap();
                for (id, name, parent, sort_no) in groups {
                    let mut record = StoreRecord::new("Group");
                    record.guid = id.to_string();
                    record.set("GroupId", *id);
                    record.set("GroupName", *name);
                    record.set("ParentId", parent.map(Value::from).unwrap_or(Value::Null));
                    record.set("SortNo", *sort_no);
                    records.push(record);
                }
            }
            store
        }

        pub fn record(&self, id: &str) -> Option<StoreRecord> {
            self.records
                .lock()
                .unwrap()
                .iter()
                .find(|record| record.matches("GroupId", id))
                .cloned()
        }
    }

    #[async_trait]
    impl RecordStore for MemoryStore {
        async fn load(&self) -> Result<Vec<Value>> {
            let records = self.records.lock().unwrap();
            Ok(records.iter().map(StoreRecord::to_value).collect())
        }

        async fn fetch(&self, id: &str) -> Result<StoreRecord> {
            if self.unresolvable.lock().unwrap().contains(id) {
                return Err(anyhow!("record {} could not be loaded", id));
            }
            self.record(id).ok_or_else(|| anyhow!("record {} not found", id))
        }

        async fn create(&self, entity: &str) -> Result<StoreRecord> {
            if self.fail_create.load(Ordering::SeqCst) {
                return Err(anyhow!("create rejected"));
            }
            Ok(StoreRecord::new(entity))
        }

        async fn commit(&self, batch: Vec<StoreRecord>) -> Result<()> {
            if self.fail_commit.load(Ordering::SeqCst) {
                return Err(anyhow!("commit rejected"));
            }
            self.commits.fetch_add(1, Ordering::SeqCst);
            let mut records = self.records.lock().unwrap();
            for record in batch {
                match records.iter_mut().find(|existing| existing.guid == record.guid) {
                    Some(existing) => *existing = record,
                    None => records.push(record),
                }
            }
            Ok(())
        }

        async fn delete(&self, ids: &[String]) -> Result<()> {
            if self.fail_delete.load(Ordering::SeqCst) {
                return Err(anyhow!("delete rejected"));
            }
            self.records
                .lock()
                .unwrap()
                .retain(|record| !ids.iter().any(|id| record.matches("GroupId", id)));
            Ok(())
        }

        async fn reload(&self) -> Result<()> {
            self.reloads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
}
