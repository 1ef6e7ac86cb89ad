//! Cross-layer relationship store.
//!
//! Relationships live outside the layer files so that staging edits to one
//! layer never touch another layer's persisted content.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A directed, typed edge between two elements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub id: String,
    pub source: String,
    pub target: String,

    #[serde(rename = "type")]
    pub relationship_type: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, Value>,
}

impl Relationship {
    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
        relationship_type: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            relationship_type: relationship_type.into(),
            properties: BTreeMap::new(),
        }
    }

    fn involves(&self, element_id: &str) -> bool {
        self.source == element_id || self.target == element_id
    }
}

/// Query used by [`RelationshipStore::find`]. Unset fields match anything.
#[derive(Debug, Clone, Default)]
pub struct RelationshipQuery<'a> {
    pub source: Option<&'a str>,
    pub target: Option<&'a str>,
    pub relationship_type: Option<&'a str>,
}

/// In-memory relationship collection with dirty tracking.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelationshipStore {
    #[serde(default)]
    relationships: Vec<Relationship>,

    #[serde(skip)]
    dirty: bool,
}

impl RelationshipStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a relationship, replacing any existing one with the same id.
    pub fn add(&mut self, relationship: Relationship) {
        match self
            .relationships
            .iter_mut()
            .find(|existing| existing.id == relationship.id)
        {
            Some(existing) => *existing = relationship,
            None => self.relationships.push(relationship),
        }
        self.dirty = true;
    }

    pub fn find(&self, query: &RelationshipQuery<'_>) -> Vec<&Relationship> {
        self.relationships
            .iter()
            .filter(|r| query.source.map_or(true, |s| r.source == s))
            .filter(|r| query.target.map_or(true, |t| r.target == t))
            .filter(|r| {
                query
                    .relationship_type
                    .map_or(true, |t| r.relationship_type == t)
            })
            .collect()
    }

    /// Delete by relationship id. Returns whether anything was removed.
    pub fn delete(&mut self, id: &str) -> bool {
        let before = self.relationships.len();
        self.relationships.retain(|r| r.id != id);
        let removed = self.relationships.len() != before;
        self.dirty |= removed;
        removed
    }

    /// Delete every relationship touching `element_id`. Returns the count removed.
    pub fn delete_for_element(&mut self, element_id: &str) -> usize {
        let before = self.relationships.len();
        self.relationships.retain(|r| !r.involves(element_id));
        let removed = before - self.relationships.len();
        if removed > 0 {
            self.dirty = true;
        }
        removed
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub fn len(&self) -> usize {
        self.relationships.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relationships.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> RelationshipStore {
        let mut store = RelationshipStore::new();
        store.add(Relationship::new("r1", "goal-1", "svc-1", "realizes"));
        store.add(Relationship::new("r2", "svc-1", "db-1", "uses"));
        store.add(Relationship::new("r3", "svc-2", "db-1", "uses"));
        store
    }

    #[test]
    fn test_find_by_fields() {
        let store = store();

        let uses = store.find(&RelationshipQuery {
            relationship_type: Some("uses"),
            ..Default::default()
        });
        assert_eq!(uses.len(), 2);

        let from_svc = store.find(&RelationshipQuery {
            source: Some("svc-1"),
            target: Some("db-1"),
            ..Default::default()
        });
        assert_eq!(from_svc.len(), 1);
        assert_eq!(from_svc[0].id, "r2");
    }

    #[test]
    fn test_add_replaces_same_id() {
        let mut store = store();
        store.add(Relationship::new("r1", "goal-1", "svc-2", "realizes"));
        assert_eq!(store.len(), 3);
        assert_eq!(
            store
                .find(&RelationshipQuery {
                    target: Some("svc-2"),
                    ..Default::default()
                })
                .len(),
            1
        );
    }

    #[test]
    fn test_delete_for_element_marks_dirty() {
        let mut store = store();
        store.mark_clean();

        assert_eq!(store.delete_for_element("svc-1"), 2);
        assert!(store.is_dirty());
        assert_eq!(store.len(), 1);

        store.mark_clean();
        assert_eq!(store.delete_for_element("unknown"), 0);
        assert!(!store.is_dirty());
    }

    #[test]
    fn test_delete_by_id() {
        let mut store = store();
        assert!(store.delete("r3"));
        assert!(!store.delete("r3"));
        assert_eq!(store.len(), 2);
    }
}
