use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A single field value in a schema-less document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Integer(i64),
    Text(String),
    /// Unix seconds.
    Timestamp(i64),
    /// Write-side placeholder; the backend stores its own clock instead.
    #[serde(skip)]
    ServerTimestamp,
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_owned())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

pub type Fields = BTreeMap<String, FieldValue>;

/// Replace every `ServerTimestamp` with the commit time `now`.
pub fn resolve_server_timestamps(mut fields: Fields, now: i64) -> Fields {
    for value in fields.values_mut() {
        if matches!(value, FieldValue::ServerTimestamp) {
            *value = FieldValue::Timestamp(now);
        }
    }
    fields
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub fields: Fields,
}

/// Every document of one collection at a point in time, in backend order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub documents: Vec<Document>,
}

/// `collection/document/collection/...`, always ending on a collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionPath(String);

impl CollectionPath {
    pub fn user_tasks(uid: &str) -> Self {
        Self(format!("users/{uid}/tasks"))
    }

    pub fn doc(&self, id: &str) -> DocumentPath {
        DocumentPath {
            collection: self.clone(),
            id: id.to_owned(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CollectionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentPath {
    collection: CollectionPath,
    id: String,
}

impl DocumentPath {
    pub fn collection(&self) -> &CollectionPath {
        &self.collection
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for DocumentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_paths_are_scoped_by_user() {
        let tasks = CollectionPath::user_tasks("u1");
        assert_eq!(tasks.as_str(), "users/u1/tasks");
        let doc = tasks.doc("t9");
        assert_eq!(doc.to_string(), "users/u1/tasks/t9");
        assert_eq!(doc.collection(), &tasks);
        assert_eq!(doc.id(), "t9");
    }

    #[test]
    fn server_timestamps_are_resolved_and_other_fields_kept() {
        let mut fields = Fields::new();
        fields.insert("title".into(), "a".into());
        fields.insert("createdAt".into(), FieldValue::ServerTimestamp);

        let resolved = resolve_server_timestamps(fields, 1_700_000_000);
        assert_eq!(resolved["title"], FieldValue::Text("a".into()));
        assert_eq!(resolved["createdAt"], FieldValue::Timestamp(1_700_000_000));
    }
}
