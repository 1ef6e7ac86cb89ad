//! Elements and partial element state.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Where in a code base an element was derived from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceReference {
    /// How the reference was obtained ("manual", "extracted", ...).
    pub provenance: String,

    /// Source locations backing the element.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<SourceLocation>,
}

/// A single file (and optional symbol) inside a [`SourceReference`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceLocation {
    pub file: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
}

/// A typed element owned by exactly one layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Element {
    /// Identifier, unique within the owning layer.
    pub id: String,

    /// Element type (e.g. "service", "goal", "endpoint").
    #[serde(rename = "type")]
    pub element_type: String,

    /// Display name.
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Free-form properties.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_reference: Option<SourceReference>,
}

impl Element {
    /// Create an element with no description or properties.
    pub fn new(
        id: impl Into<String>,
        element_type: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            element_type: element_type.into(),
            name: name.into(),
            description: None,
            properties: BTreeMap::new(),
            source_reference: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Merge the fields present in `patch` onto this element.
    ///
    /// Properties merge key by key; a `null` property value removes the key.
    /// An empty description clears the description.
    pub fn apply_patch(&mut self, patch: &ElementPatch) {
        if let Some(element_type) = &patch.element_type {
            self.element_type = element_type.clone();
        }
        if let Some(name) = &patch.name {
            self.name = name.clone();
        }
        if let Some(description) = &patch.description {
            self.description = if description.is_empty() {
                None
            } else {
                Some(description.clone())
            };
        }
        for (key, value) in &patch.properties {
            if value.is_null() {
                self.properties.remove(key);
            } else {
                self.properties.insert(key.clone(), value.clone());
            }
        }
        if let Some(source_reference) = &patch.source_reference {
            self.source_reference = Some(source_reference.clone());
        }
    }
}

/// Partial element state: only the fields an update touches.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementPatch {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub element_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_reference: Option<SourceReference>,
}

impl ElementPatch {
    pub fn is_empty(&self) -> bool {
        self.element_type.is_none()
            && self.name.is_none()
            && self.description.is_none()
            && self.properties.is_empty()
            && self.source_reference.is_none()
    }

    /// Capture the current values of exactly the fields `touched` sets.
    ///
    /// Applying the result to the patched element restores it.
    pub fn capture(element: &Element, touched: &ElementPatch) -> Self {
        let properties = touched
            .properties
            .keys()
            .map(|key| {
                let current = element.properties.get(key).cloned().unwrap_or(Value::Null);
                (key.clone(), current)
            })
            .collect();

        Self {
            element_type: touched
                .element_type
                .as_ref()
                .map(|_| element.element_type.clone()),
            name: touched.name.as_ref().map(|_| element.name.clone()),
            description: touched
                .description
                .as_ref()
                .map(|_| element.description.clone().unwrap_or_default()),
            properties,
            // A reference cannot be "unset" by a patch, so only a previous value is restorable.
            source_reference: touched
                .source_reference
                .as_ref()
                .and_then(|_| element.source_reference.clone()),
        }
    }
}
