use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Prefix carried by ids that the record store has not assigned yet.
pub const PENDING_ID_PREFIX: &str = "new-";

/// Canonical group record, produced by the normalizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupRecord {
    pub id: String,
    pub name: String,
    pub parent_id: Option<String>,
    #[serde(default)]
    pub sort_no: i64,
    #[serde(default)]
    pub depth: i64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Exists only locally, waiting for the store to assign an id
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub pending_create: bool,
}

fn default_enabled() -> bool {
    true
}

impl GroupRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>, parent_id: Option<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            parent_id,
            sort_no: 0,
            depth: 0,
            enabled: true,
            description: None,
            pending_create: false,
        }
    }

    pub fn with_sort_no(mut self, sort_no: i64) -> Self {
        self.sort_no = sort_no;
        self
    }
}

/// Attributes supplied by the client when adding a group.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSeed {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub disabled: bool,
}

impl GroupSeed {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Generate a temporary id for a locally created group.
pub fn new_pending_id() -> String {
    format!("{}{}", PENDING_ID_PREFIX, Uuid::new_v4())
}

/// True when `id` has the shape of a locally generated temporary id.
pub fn is_pending_id(id: &str) -> bool {
    id.strip_prefix(PENDING_ID_PREFIX)
        .map(|rest| Uuid::parse_str(rest).is_ok())
        .unwrap_or(false)
}
