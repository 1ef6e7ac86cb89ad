//! Base Model
//!
//! The durably persisted, canonical layer/element state. A model root holds a
//! manifest, one file per layer and a relationship store:
//!
//! ```text
//! <root>/manifest.json
//! <root>/layers/<layer>.json
//! <root>/relationships.json
//! <root>/changesets/...
//! ```
//!
//! Mutations here are direct-mode only; staged edits never reach these files.

pub mod element;
pub mod layer;
pub mod manifest;
pub mod migration;
pub mod relationships;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::error::{ArchError, Result};
use crate::storage;

pub use element::{Element, ElementPatch, SourceLocation, SourceReference};
pub use layer::{Layer, LayerName};
pub use manifest::{LayerEntry, Manifest};
pub use relationships::{Relationship, RelationshipQuery, RelationshipStore};

/// Model directory structure constants.
pub const MANIFEST_FILE: &str = "manifest.json";
pub const LAYERS_DIR: &str = "layers";
pub const RELATIONSHIPS_FILE: &str = "relationships.json";
pub const CHANGESETS_DIR: &str = "changesets";

/// An architecture model loaded from a model root directory.
#[derive(Debug, Clone)]
pub struct Model {
    root: PathBuf,
    manifest: Manifest,
    layers: BTreeMap<LayerName, Layer>,
    relationships: RelationshipStore,
    dirty_layers: BTreeSet<LayerName>,
}

impl Model {
    /// Create and persist an empty model with every layer present.
    pub fn init(root: &Path, name: &str) -> Result<Self> {
        let manifest_path = root.join(MANIFEST_FILE);
        if manifest_path.exists() {
            return Err(ArchError::ModelAlreadyExists {
                path: root.to_path_buf(),
            });
        }

        storage::ensure_dir(&root.join(LAYERS_DIR))?;
        storage::ensure_dir(&root.join(CHANGESETS_DIR))?;

        let manifest = Manifest::new(name, LAYERS_DIR);
        let layers = manifest
            .layers
            .keys()
            .map(|name| (*name, Layer::new(*name)))
            .collect();

        let mut model = Self {
            root: root.to_path_buf(),
            layers,
            manifest,
            relationships: RelationshipStore::new(),
            dirty_layers: LayerName::ALL.iter().copied().collect(),
        };
        model.save()?;

        log::info!("Initialized model '{}' at {}", name, root.display());
        Ok(model)
    }

    /// Load a model from disk, migrating an older manifest if needed.
    pub fn load(root: &Path) -> Result<Self> {
        let manifest_path = root.join(MANIFEST_FILE);
        let raw: serde_json::Value = match storage::read_json_opt(&manifest_path)? {
            None => {
                return Err(ArchError::ModelNotFound {
                    path: root.to_path_buf(),
                })
            }
            Some(parsed) => parsed.map_err(|e| ArchError::ModelLoadFailed {
                path: manifest_path.clone(),
                source: e,
            })?,
        };

        let migrated = migration::migrate_manifest(raw)?;
        let manifest: Manifest =
            serde_json::from_value(migrated).map_err(|e| ArchError::ModelLoadFailed {
                path: manifest_path.clone(),
                source: e,
            })?;

        let mut layers = BTreeMap::new();
        for (name, entry) in &manifest.layers {
            let layer_path = root.join(&entry.path);
            let mut layer = match storage::read_json_opt::<Layer>(&layer_path)? {
                Some(parsed) => parsed.map_err(|e| ArchError::ModelLoadFailed {
                    path: layer_path.clone(),
                    source: e,
                })?,
                None => Layer::new(*name),
            };
            layer.name = *name;
            layer.set_version(entry.version);
            layers.insert(*name, layer);
        }

        let relationships_path = root.join(RELATIONSHIPS_FILE);
        let relationships = match storage::read_json_opt::<RelationshipStore>(&relationships_path)? {
            Some(parsed) => parsed.map_err(|e| ArchError::ModelLoadFailed {
                path: relationships_path.clone(),
                source: e,
            })?,
            None => RelationshipStore::new(),
        };

        log::debug!(
            "Loaded model '{}' ({} layers) from {}",
            manifest.name,
            layers.len(),
            root.display()
        );

        Ok(Self {
            root: root.to_path_buf(),
            manifest,
            layers,
            relationships,
            dirty_layers: BTreeSet::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Path of the manifest file; also the resource guarded by the model lock.
    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    pub fn changesets_dir(&self) -> PathBuf {
        self.root.join(CHANGESETS_DIR)
    }

    /// Absolute path of a layer's file.
    pub fn layer_path(&self, name: LayerName) -> Result<PathBuf> {
        self.manifest
            .layers
            .get(&name)
            .map(|entry| self.root.join(&entry.path))
            .ok_or(ArchError::LayerNotFound { layer: name })
    }

    pub fn layer(&self, name: LayerName) -> Option<&Layer> {
        self.layers.get(&name)
    }

    /// Mutable access to a layer. The layer is marked dirty for [`Model::save`].
    pub fn layer_mut(&mut self, name: LayerName) -> Option<&mut Layer> {
        let layer = self.layers.get_mut(&name)?;
        self.dirty_layers.insert(name);
        Some(layer)
    }

    pub fn layers(&self) -> impl Iterator<Item = &Layer> {
        self.layers.values()
    }

    pub fn element(&self, layer: LayerName, id: &str) -> Option<&Element> {
        self.layers.get(&layer)?.get(id)
    }

    /// Find an element by id in any layer.
    pub fn find_element(&self, id: &str) -> Option<(LayerName, &Element)> {
        self.layers
            .values()
            .find_map(|layer| layer.get(id).map(|element| (layer.name, element)))
    }

    pub fn add_element(&mut self, layer: LayerName, element: Element) -> Result<()> {
        let target = self.require_layer_mut(layer)?;
        if target.contains(&element.id) {
            return Err(ArchError::ElementExists {
                layer,
                id: element.id,
            });
        }
        target.insert(element);
        Ok(())
    }

    pub fn update_element(
        &mut self,
        layer: LayerName,
        id: &str,
        patch: &ElementPatch,
    ) -> Result<&Element> {
        self.require_layer_mut(layer)?
            .update(id, patch)
            .ok_or_else(|| ArchError::ElementNotFound {
                layer,
                id: id.to_string(),
            })
    }

    /// Delete an element and every relationship that references it.
    pub fn delete_element(&mut self, layer: LayerName, id: &str) -> Result<Element> {
        let removed = self
            .require_layer_mut(layer)?
            .remove(id)
            .ok_or_else(|| ArchError::ElementNotFound {
                layer,
                id: id.to_string(),
            })?;

        let dropped = self.relationships.delete_for_element(id);
        if dropped > 0 {
            log::debug!("Removed {} relationship(s) of deleted element {}", dropped, id);
        }
        Ok(removed)
    }

    pub fn relationships(&self) -> &RelationshipStore {
        &self.relationships
    }

    pub fn relationships_mut(&mut self) -> &mut RelationshipStore {
        &mut self.relationships
    }

    /// Replace this value with the model currently on disk.
    ///
    /// Unsaved in-memory edits are discarded. Call under the manifest lock to
    /// start a read-modify-write from the latest state.
    pub fn reload(&mut self) -> Result<()> {
        *self = Self::load(&self.root)?;
        Ok(())
    }

    /// Persist one layer file and record its version in the in-memory manifest.
    ///
    /// The manifest itself is written by [`Model::save_manifest`].
    pub fn save_layer(&mut self, name: LayerName) -> Result<()> {
        let path = self.layer_path(name)?;
        let layer = self
            .layers
            .get(&name)
            .ok_or(ArchError::LayerNotFound { layer: name })?;

        storage::write_json_atomic(&path, layer)?;

        if let Some(entry) = self.manifest.layers.get_mut(&name) {
            entry.version = layer.version();
        }
        self.dirty_layers.remove(&name);
        log::debug!("Saved layer {} (version {})", name, layer.version());
        Ok(())
    }

    pub fn save_manifest(&mut self) -> Result<()> {
        self.manifest.modified_at = Utc::now();
        self.manifest.tool_version = manifest::TOOL_VERSION.to_string();
        storage::write_json_atomic(&self.manifest_path(), &self.manifest)
    }

    pub fn save_relationships(&mut self) -> Result<()> {
        storage::write_json_atomic(&self.root.join(RELATIONSHIPS_FILE), &self.relationships)?;
        self.relationships.mark_clean();
        Ok(())
    }

    /// Persist every dirty layer, the relationship store if dirty, and the manifest.
    pub fn save(&mut self) -> Result<()> {
        let dirty: Vec<LayerName> = self.dirty_layers.iter().copied().collect();
        for name in dirty {
            self.save_layer(name)?;
        }
        if self.relationships.is_dirty() || !self.root.join(RELATIONSHIPS_FILE).exists() {
            self.save_relationships()?;
        }
        self.save_manifest()
    }

    fn require_layer_mut(&mut self, name: LayerName) -> Result<&mut Layer> {
        self.layer_mut(name)
            .ok_or(ArchError::LayerNotFound { layer: name })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_init_creates_structure() {
        let temp = TempDir::new().unwrap();
        let model = Model::init(temp.path(), "demo").unwrap();

        assert!(temp.path().join(MANIFEST_FILE).exists());
        assert!(temp.path().join(LAYERS_DIR).join("application.json").exists());
        assert!(temp.path().join(RELATIONSHIPS_FILE).exists());
        assert!(temp.path().join(CHANGESETS_DIR).is_dir());
        assert_eq!(model.layers().count(), LayerName::ALL.len());
    }

    #[test]
    fn test_init_twice_fails() {
        let temp = TempDir::new().unwrap();
        Model::init(temp.path(), "demo").unwrap();

        let result = Model::init(temp.path(), "demo");
        assert!(matches!(result, Err(ArchError::ModelAlreadyExists { .. })));
    }

    #[test]
    fn test_load_missing_model() {
        let temp = TempDir::new().unwrap();
        let result = Model::load(temp.path());
        assert!(matches!(result, Err(ArchError::ModelNotFound { .. })));
    }

    #[test]
    fn test_save_and_reload_elements() {
        let temp = TempDir::new().unwrap();
        let mut model = Model::init(temp.path(), "demo").unwrap();

        model
            .add_element(
                LayerName::Application,
                Element::new("svc", "service", "Service").with_property("lang", "rust"),
            )
            .unwrap();
        model.save().unwrap();

        let reloaded = Model::load(temp.path()).unwrap();
        let element = reloaded.element(LayerName::Application, "svc").unwrap();
        assert_eq!(element.properties["lang"], "rust");
        assert_eq!(reloaded.layer(LayerName::Application).unwrap().version(), 1);
        assert_eq!(reloaded.manifest().layers[&LayerName::Application].version, 1);
    }

    #[test]
    fn test_reload_picks_up_other_writers() {
        let temp = TempDir::new().unwrap();
        let mut stale = Model::init(temp.path(), "m").unwrap();
        let mut other = Model::load(temp.path()).unwrap();
        other
            .add_element(LayerName::Business, Element::new("b", "actor", "B"))
            .unwrap();
        other.save().unwrap();

        stale
            .add_element(LayerName::Business, Element::new("unsaved", "actor", "U"))
            .unwrap();
        stale.reload().unwrap();

        assert!(stale.element(LayerName::Business, "b").is_some());
        assert!(stale.element(LayerName::Business, "unsaved").is_none());
        assert_eq!(stale.layer(LayerName::Business).unwrap().version(), 1);
    }

    #[test]
    fn test_add_duplicate_and_update_missing() {
        let temp = TempDir::new().unwrap();
        let mut model = Model::init(temp.path(), "demo").unwrap();
        model
            .add_element(LayerName::Business, Element::new("a", "actor", "A"))
            .unwrap();

        let dup = model.add_element(LayerName::Business, Element::new("a", "actor", "A"));
        assert!(matches!(dup, Err(ArchError::ElementExists { .. })));

        let missing = model.update_element(LayerName::Business, "zzz", &ElementPatch::default());
        assert!(matches!(missing, Err(ArchError::ElementNotFound { .. })));
    }

    #[test]
    fn test_delete_element_cascades_relationships() {
        let temp = TempDir::new().unwrap();
        let mut model = Model::init(temp.path(), "demo").unwrap();
        model
            .add_element(LayerName::Application, Element::new("svc", "service", "Svc"))
            .unwrap();
        model
            .relationships_mut()
            .add(Relationship::new("r1", "goal", "svc", "realizes"));

        model.delete_element(LayerName::Application, "svc").unwrap();

        assert!(model.relationships().is_empty());
        assert!(model.find_element("svc").is_none());
    }

    #[test]
    fn test_corrupted_layer_file_is_load_error() {
        let temp = TempDir::new().unwrap();
        Model::init(temp.path(), "demo").unwrap();
        fs::write(temp.path().join(LAYERS_DIR).join("business.json"), "{ nope").unwrap();

        let result = Model::load(temp.path());
        assert!(matches!(result, Err(ArchError::ModelLoadFailed { .. })));
    }

    #[test]
    fn test_load_legacy_manifest() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join(LAYERS_DIR)).unwrap();
        fs::write(
            temp.path().join(MANIFEST_FILE),
            r#"{
                "name": "legacy",
                "createdAt": "2024-01-15T10:00:00Z",
                "modifiedAt": "2024-01-15T10:00:00Z",
                "toolVersion": "0.0.9",
                "layers": { "business": "layers/business.json" }
            }"#,
        )
        .unwrap();

        let model = Model::load(temp.path()).unwrap();
        assert_eq!(model.manifest().name, "legacy");
        assert!(model.layer(LayerName::Business).unwrap().is_empty());
        assert!(model.layer(LayerName::Application).is_none());
    }
}
