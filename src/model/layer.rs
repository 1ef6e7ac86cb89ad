//! Layers: the fixed set of named element containers.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ArchError;
use crate::model::element::{Element, ElementPatch};

/// The fixed enumeration of architecture layers, in canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LayerName {
    Motivation,
    Business,
    Security,
    Application,
    Technology,
    Api,
    DataModel,
    Datastore,
    Ux,
    Navigation,
    Apm,
    Testing,
}

impl LayerName {
    /// Every layer, in canonical order.
    pub const ALL: [LayerName; 12] = [
        LayerName::Motivation,
        LayerName::Business,
        LayerName::Security,
        LayerName::Application,
        LayerName::Technology,
        LayerName::Api,
        LayerName::DataModel,
        LayerName::Datastore,
        LayerName::Ux,
        LayerName::Navigation,
        LayerName::Apm,
        LayerName::Testing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LayerName::Motivation => "motivation",
            LayerName::Business => "business",
            LayerName::Security => "security",
            LayerName::Application => "application",
            LayerName::Technology => "technology",
            LayerName::Api => "api",
            LayerName::DataModel => "data-model",
            LayerName::Datastore => "datastore",
            LayerName::Ux => "ux",
            LayerName::Navigation => "navigation",
            LayerName::Apm => "apm",
            LayerName::Testing => "testing",
        }
    }
}

impl fmt::Display for LayerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LayerName {
    type Err = ArchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LayerName::ALL
            .iter()
            .copied()
            .find(|layer| layer.as_str() == s)
            .ok_or_else(|| ArchError::UnknownLayer {
                name: s.to_string(),
            })
    }
}

/// A named container of elements.
///
/// `version` counts in-memory mutations on top of the version recorded in
/// the manifest; it is what the projection cache keys base-layer freshness on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    #[serde(rename = "layer")]
    pub name: LayerName,

    #[serde(default)]
    elements: BTreeMap<String, Element>,

    #[serde(skip)]
    version: u64,
}

impl Layer {
    pub fn new(name: LayerName) -> Self {
        Self {
            name,
            elements: BTreeMap::new(),
            version: 0,
        }
    }

    pub(crate) fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    /// Mutation version of this layer.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.elements.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Element> {
        self.elements.get(id)
    }

    /// Elements ordered by id.
    pub fn list_elements(&self) -> impl Iterator<Item = &Element> {
        self.elements.values()
    }

    /// Insert or replace an element, returning the previous one.
    pub fn insert(&mut self, element: Element) -> Option<Element> {
        self.version += 1;
        self.elements.insert(element.id.clone(), element)
    }

    /// Merge `patch` onto an existing element. Returns `None` if absent.
    pub fn update(&mut self, id: &str, patch: &ElementPatch) -> Option<&Element> {
        let element = self.elements.get_mut(id)?;
        element.apply_patch(patch);
        self.version += 1;
        Some(element)
    }

    pub fn remove(&mut self, id: &str) -> Option<Element> {
        let removed = self.elements.remove(id);
        if removed.is_some() {
            self.version += 1;
        }
        removed
    }
}
