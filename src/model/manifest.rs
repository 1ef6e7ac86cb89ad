//! Model manifest: metadata plus the per-layer path/version table.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::layer::LayerName;
use crate::model::migration::CURRENT_SCHEMA_VERSION;

/// Application version stamped into manifests on save.
pub const TOOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Location and persisted mutation version of one layer file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerEntry {
    /// Path of the layer file, relative to the model root.
    pub path: PathBuf,

    /// Mutation version recorded at the last save.
    #[serde(default)]
    pub version: u64,
}

/// Contents of `manifest.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: String,

    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub created_at: DateTime<Utc>,

    pub modified_at: DateTime<Utc>,

    /// archstage version that last wrote this manifest.
    pub tool_version: String,

    #[serde(default)]
    pub layers: BTreeMap<LayerName, LayerEntry>,
}

impl Manifest {
    /// A fresh manifest listing every layer at version 0.
    pub fn new(name: impl Into<String>, layers_dir: &str) -> Self {
        let now = Utc::now();
        let layers = LayerName::ALL
            .iter()
            .map(|layer| {
                let entry = LayerEntry {
                    path: PathBuf::from(layers_dir).join(format!("{}.json", layer)),
                    version: 0,
                };
                (*layer, entry)
            })
            .collect();

        Self {
            schema_version: CURRENT_SCHEMA_VERSION.to_string(),
            name: name.into(),
            description: None,
            created_at: now,
            modified_at: now,
            tool_version: TOOL_VERSION.to_string(),
            layers,
        }
    }
}
