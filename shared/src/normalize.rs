//! Mapping of heterogeneous external records onto [`GroupRecord`].
//!
//! The record store does not promise a fixed shape: attributes may sit behind
//! a host accessor or directly on the record, may be wrapped as
//! `{ "value": .. }`, and may use any of several spellings. Each field is
//! resolved by trying the explicitly configured attribute first and the
//! built-in alias list second. Missing fields fall back to defaults without
//! raising an error.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::group::GroupRecord;
use crate::tree::ROOT_ID;

/// Canonical fields of a group record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Id,
    Name,
    ParentId,
    SortNo,
    Depth,
    Enabled,
    Description,
}

impl Field {
    pub const ALL: [Field; 7] = [
        Field::Id,
        Field::Name,
        Field::ParentId,
        Field::SortNo,
        Field::Depth,
        Field::Enabled,
        Field::Description,
    ];

    /// Spellings probed when no explicit attribute is configured. The first
    /// entry doubles as the attribute written back on commit.
    pub fn aliases(self) -> &'static [&'static str] {
        match self {
            Field::Id => &["GroupId", "Groupld", "group_id", "id", "guid"],
            Field::Name => &["GroupName", "group_name", "name"],
            Field::ParentId => &["ParentId", "parent_id", "parent"],
            Field::SortNo => &["SortNo", "sort_no", "order"],
            Field::Depth => &["Depth"],
            Field::Enabled => &["EnableTF", "EnabledTF", "enabled", "enable"],
            Field::Description => &["Description", "desc"],
        }
    }
}

/// Explicit attribute names, one per field. Unset fields use alias probing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttributeMapping {
    pub id: Option<String>,
    pub name: Option<String>,
    pub parent_id: Option<String>,
    pub sort_no: Option<String>,
    pub depth: Option<String>,
    pub enabled: Option<String>,
    pub description: Option<String>,
}

impl AttributeMapping {
    pub fn configured(&self, field: Field) -> Option<&str> {
        let name = match field {
            Field::Id => &self.id,
            Field::Name => &self.name,
            Field::ParentId => &self.parent_id,
            Field::SortNo => &self.sort_no,
            Field::Depth => &self.depth,
            Field::Enabled => &self.enabled,
            Field::Description => &self.description,
        };
        name.as_deref().filter(|n| !n.is_empty())
    }

    /// Attribute name used when writing `field` back to the store.
    pub fn attribute_name(&self, field: Field) -> &str {
        self.configured(field).unwrap_or(field.aliases()[0])
    }
}

/// Read access to one external record.
pub trait RecordAccess {
    /// Host accessor lookup (`get(name)`), exact name.
    fn get(&self, name: &str) -> Option<Value>;

    /// Direct field lookup, exact name.
    fn field(&self, name: &str) -> Option<Value>;

    /// Names reachable through [`RecordAccess::get`].
    fn attribute_names(&self) -> Vec<String> {
        Vec::new()
    }

    /// Names reachable through [`RecordAccess::field`].
    fn field_names(&self) -> Vec<String> {
        Vec::new()
    }
}

/// A JSON record: `get` reads the nested `"attributes"` object, `field`
/// reads top-level keys.
impl RecordAccess for Value {
    fn get(&self, name: &str) -> Option<Value> {
        self.get("attributes")
            .and_then(|attributes| attributes.get(name))
            .cloned()
    }

    fn field(&self, name: &str) -> Option<Value> {
        self.as_object().and_then(|map| map.get(name)).cloned()
    }

    fn attribute_names(&self) -> Vec<String> {
        self.get("attributes")
            .and_then(Value::as_object)
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn field_names(&self) -> Vec<String> {
        self.as_object()
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default()
    }
}

/// A bare map has no host accessor, only fields.
impl RecordAccess for Map<String, Value> {
    fn get(&self, _name: &str) -> Option<Value> {
        None
    }

    fn field(&self, name: &str) -> Option<Value> {
        Map::get(self, name).cloned()
    }

    fn field_names(&self) -> Vec<String> {
        self.keys().cloned().collect()
    }
}

/// One strategy for locating a field's raw value on a record.
pub trait Accessor {
    fn resolve(&self, record: &dyn RecordAccess, field: Field) -> Option<Value>;
}

/// Looks up the attribute name configured for the field.
pub struct ConfiguredAccessor<'a>(pub &'a AttributeMapping);

impl Accessor for ConfiguredAccessor<'_> {
    fn resolve(&self, record: &dyn RecordAccess, field: Field) -> Option<Value> {
        let name = self.0.configured(field)?;
        record.get(name).or_else(|| record.field(name))
    }
}

/// Probes the field's alias list, ignoring case.
pub struct AliasAccessor;

impl Accessor for AliasAccessor {
    fn resolve(&self, record: &dyn RecordAccess, field: Field) -> Option<Value> {
        let attribute_names = record.attribute_names();
        let field_names = record.field_names();

        field.aliases().iter().find_map(|alias| {
            record
                .get(alias)
                .or_else(|| {
                    find_ignore_case(&attribute_names, alias).and_then(|name| record.get(name))
                })
                .or_else(|| record.field(alias))
                .or_else(|| {
                    find_ignore_case(&field_names, alias).and_then(|name| record.field(name))
                })
                .filter(|value| !value.is_null())
        })
    }
}

fn find_ignore_case<'a>(names: &'a [String], alias: &str) -> Option<&'a str> {
    names
        .iter()
        .find(|name| name.eq_ignore_ascii_case(alias))
        .map(String::as_str)
}

/// Strip a `{ "value": .. }` wrapper and treat null as absent.
fn unwrap_value(value: Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Object(mut map) if map.contains_key("value") => {
            map.remove("value").and_then(unwrap_value)
        }
        other => Some(other),
    }
}

fn as_text(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn as_int(value: Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().map(|f| f as i64))
        }
        _ => None,
    }
}

fn as_bool(value: Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(b),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "y" | "yes" | "1" => Some(true),
            "false" | "n" | "no" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Turns external records into canonical group records.
#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    mapping: AttributeMapping,
}

impl Normalizer {
    pub fn new(mapping: AttributeMapping) -> Self {
        Self { mapping }
    }

    pub fn mapping(&self) -> &AttributeMapping {
        &self.mapping
    }

    /// Normalize every record, dropping those without an id.
    pub fn normalize<R: RecordAccess>(&self, records: &[R]) -> Vec<GroupRecord> {
        let normalized: Vec<GroupRecord> = records
            .iter()
            .filter_map(|record| self.normalize_one(record))
            .collect();
        if normalized.len() < records.len() {
            debug!(
                "Dropped {} records without a group id",
                records.len() - normalized.len()
            );
        }
        normalized
    }

    pub fn normalize_one(&self, record: &dyn RecordAccess) -> Option<GroupRecord> {
        let id = self
            .resolve(record, Field::Id, as_text)
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())?;

        let name = self
            .resolve(record, Field::Name, as_text)
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| id.clone());

        let parent_id = self
            .resolve(record, Field::ParentId, as_text)
            .map(|parent| parent.trim().to_string())
            .filter(|parent| !parent.is_empty() && parent != ROOT_ID);

        let sort_no = self.resolve_or(record, Field::SortNo, as_int, 0);
        let depth = self.resolve_or(record, Field::Depth, as_int, 0);
        let enabled = self.resolve_or(record, Field::Enabled, as_bool, true);
        let description = self.resolve(record, Field::Description, as_text);

        Some(GroupRecord {
            id,
            name,
            parent_id,
            sort_no,
            depth,
            enabled,
            description,
            pending_create: false,
        })
    }

    fn resolve<T>(
        &self,
        record: &dyn RecordAccess,
        field: Field,
        coerce: fn(Value) -> Option<T>,
    ) -> Option<T> {
        let configured = ConfiguredAccessor(&self.mapping);
        let accessors: [&dyn Accessor; 2] = [&configured, &AliasAccessor];

        accessors.iter().find_map(|accessor| {
            accessor
                .resolve(record, field)
                .and_then(unwrap_value)
                .and_then(coerce)
        })
    }

    fn resolve_or<T>(
        &self,
        record: &dyn RecordAccess,
        field: Field,
        coerce: fn(Value) -> Option<T>,
        default: T,
    ) -> T {
        match self.resolve(record, field, coerce) {
            Some(value) => value,
            None => {
                debug!("Field {:?} missing or unreadable, using default", field);
                default
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lowercase_alias_resolves_name() {
        let record = json!({ "GroupId": "g1", "groupname": "Finance" });
        let group = Normalizer::default().normalize_one(&record).unwrap();
        assert_eq!(group.name, "Finance");
    }

    #[test]
    fn test_host_accessor_and_wrapped_values() {
        let record = json!({
            "attributes": {
                "GroupId": { "value": 17 },
                "GroupName": { "value": "Ops" },
                "ParentId": { "value": "3" },
                "SortNo": { "value": "4" },
                "EnableTF": { "value": false }
            }
        });
        let group = Normalizer::default().normalize_one(&record).unwrap();
        assert_eq!(group.id, "17");
        assert_eq!(group.name, "Ops");
        assert_eq!(group.parent_id.as_deref(), Some("3"));
        assert_eq!(group.sort_no, 4);
        assert!(!group.enabled);
    }

    #[test]
    fn test_configured_attribute_wins() {
        let mapping = AttributeMapping {
            name: Some("Label".to_string()),
            ..AttributeMapping::default()
        };
        let record = json!({ "id": "g1", "GroupName": "ignored", "Label": "Chosen" });
        let group = Normalizer::new(mapping).normalize_one(&record).unwrap();
        assert_eq!(group.name, "Chosen");
    }

    #[test]
    fn test_defaults_and_name_fallback() {
        let record = json!({ "id": "g9", "ParentId": "" });
        let group = Normalizer::default().normalize_one(&record).unwrap();
        assert_eq!(group.name, "g9");
        assert_eq!(group.parent_id, None);
        assert_eq!(group.sort_no, 0);
        assert_eq!(group.depth, 0);
        assert!(group.enabled);
        assert_eq!(group.description, None);
    }

    #[test]
    fn test_records_without_id_are_dropped() {
        let records = vec![
            json!({ "GroupName": "nameless" }),
            json!({ "GroupId": "  " }),
            json!({ "GroupId": "ok" }),
        ];
        let groups = Normalizer::default().normalize(&records);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].id, "ok");
    }

    #[test]
    fn test_plain_map_records() {
        let mut map = Map::new();
        map.insert("GROUPID".to_string(), json!("m1"));
        map.insert("Sort_No".to_string(), json!(2.0));
        map.insert("enabled".to_string(), json!("N"));
        let group = Normalizer::default().normalize_one(&map).unwrap();
        assert_eq!(group.id, "m1");
        assert_eq!(group.sort_no, 2);
        assert!(!group.enabled);
    }

    #[test]
    fn test_attribute_name_for_write_back() {
        let mapping = AttributeMapping {
            sort_no: Some("Position".to_string()),
            ..AttributeMapping::default()
        };
        assert_eq!(mapping.attribute_name(Field::SortNo), "Position");
        assert_eq!(mapping.attribute_name(Field::ParentId), "ParentId");
    }
}
