//! Virtual Projection Engine
//!
//! Computes the merged view of a base layer plus a changeset's staged edits
//! and caches it per `(model root, changeset, layer)`.
//!
//! A cache entry remembers a version token built from its inputs: the base
//! layer's mutation version and a digest of that layer's staged ops. A
//! lookup whose token no longer matches is a miss. The digest covers only
//! the layer's own changes and ignores sequence numbers, so unstaging an
//! element in one layer leaves every other layer's projection valid.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;

use log::debug;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{ArchError, Result};
use crate::model::{Layer, LayerName, Model};
use crate::staging::changeset::{Change, ChangeOp, Changeset};
use crate::staging::store::ChangesetStore;

/// Projected layers of one changeset.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectedModel {
    /// Always true; lets consumers tell a projection from a base model view.
    pub is_projection: bool,

    pub changeset_id: String,

    /// Only layers with at least one staged change.
    pub layers: BTreeMap<LayerName, Layer>,
}

impl ProjectedModel {
    pub fn layer(&self, name: LayerName) -> Option<&Layer> {
        self.layers.get(&name)
    }
}

/// Raw change entries of a changeset, partitioned by type.
///
/// Not a net-effect diff: an add later deleted is reported as both.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChangesetDiff {
    pub additions: Vec<Change>,
    pub modifications: Vec<Change>,
    pub deletions: Vec<Change>,
}

/// Per-changeset cache counters. Never reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct VersionToken {
    base_version: u64,
    changes_digest: String,
}

type CacheKey = (PathBuf, String, LayerName);

#[derive(Debug, Clone)]
struct CacheEntry {
    layer: Layer,
    token: VersionToken,
    /// Element ids whose changes went into `layer`.
    touched: HashSet<String>,
}

/// Projection engine with an in-process, per-layer cache.
#[derive(Debug)]
pub struct ProjectionEngine {
    store: ChangesetStore,
    cache: HashMap<CacheKey, CacheEntry>,
    metrics: HashMap<String, CacheMetrics>,
}

impl ProjectionEngine {
    pub fn new(store: ChangesetStore) -> Self {
        Self {
            store,
            cache: HashMap::new(),
            metrics: HashMap::new(),
        }
    }

    pub fn store(&self) -> &ChangesetStore {
        &self.store
    }

    /// Merged view of `layer` under `changeset_id`.
    ///
    /// # Errors
    /// `ChangesetNotFound`, `LayerNotFound`, or `ReplayTargetMissing` when an
    /// update has no element to apply to.
    pub fn project_layer(
        &mut self,
        model: &Model,
        changeset_id: &str,
        layer: LayerName,
    ) -> Result<Layer> {
        let changeset = self.store.require(changeset_id)?;
        self.project_changeset(model, &changeset, layer)
    }

    /// Project every layer that has at least one staged change.
    pub fn project_model(&mut self, model: &Model, changeset_id: &str) -> Result<ProjectedModel> {
        let changeset = self.store.require(changeset_id)?;

        let mut layers = BTreeMap::new();
        for layer in changeset.touched_layers() {
            let projected = self.project_changeset(model, &changeset, layer)?;
            layers.insert(layer, projected);
        }

        Ok(ProjectedModel {
            is_projection: true,
            changeset_id: changeset.id,
            layers,
        })
    }

    /// The layer as seen under an optional changeset.
    ///
    /// Falls back to the base layer, without touching the cache, when there is
    /// no changeset or it has no edits for `layer`.
    pub fn view_layer(
        &mut self,
        model: &Model,
        changeset_id: Option<&str>,
        layer: LayerName,
    ) -> Result<Layer> {
        let base = model
            .layer(layer)
            .ok_or(ArchError::LayerNotFound { layer })?;

        let changeset = match changeset_id {
            Some(id) => self.store.require(id)?,
            None => return Ok(base.clone()),
        };

        if changeset.changes.iter().any(|c| c.layer_name == layer) {
            self.project_changeset(model, &changeset, layer)
        } else {
            Ok(base.clone())
        }
    }

    /// Partition the changeset's entries by type, in sequence order.
    pub fn compute_diff(&self, changeset_id: &str) -> Result<ChangesetDiff> {
        let mut changeset = self.store.require(changeset_id)?;
        changeset.changes.sort_by_key(|c| c.sequence_number);

        let mut diff = ChangesetDiff::default();
        for change in changeset.changes {
            match change.op {
                ChangeOp::Add { .. } => diff.additions.push(change),
                ChangeOp::Update { .. } => diff.modifications.push(change),
                ChangeOp::Delete { .. } => diff.deletions.push(change),
            }
        }
        Ok(diff)
    }

    /// Drop cached projections after an unstage.
    ///
    /// With `element_id`, only layers whose projection included that element
    /// are dropped; without it, every layer of the changeset is. Returns the
    /// number of entries removed.
    pub fn invalidate_on_unstage(&mut self, changeset_id: &str, element_id: Option<&str>) -> usize {
        let before = self.cache.len();
        self.cache.retain(|(_, cached_id, _), entry| {
            if cached_id != changeset_id {
                return true;
            }
            match element_id {
                Some(id) => !entry.touched.contains(id),
                None => false,
            }
        });

        let removed = before - self.cache.len();
        debug!(
            "Invalidated {} cached layer(s) of changeset {}",
            removed, changeset_id
        );
        removed
    }

    pub fn cache_metrics(&self, changeset_id: &str) -> CacheMetrics {
        self.metrics.get(changeset_id).copied().unwrap_or_default()
    }

    /// Layers currently cached for a changeset, in canonical order.
    pub fn cached_layers(&self, changeset_id: &str) -> Vec<LayerName> {
        let mut layers: Vec<LayerName> = self
            .cache
            .keys()
            .filter(|(_, id, _)| id == changeset_id)
            .map(|(_, _, layer)| *layer)
            .collect();
        layers.sort();
        layers.dedup();
        layers
    }

    /// Merged view of `layer` under an already loaded changeset record.
    pub fn project_changeset(
        &mut self,
        model: &Model,
        changeset: &Changeset,
        layer: LayerName,
    ) -> Result<Layer> {
        let base = model
            .layer(layer)
            .ok_or(ArchError::LayerNotFound { layer })?;
        let changes = changeset.changes_for_layer(layer);

        let token = VersionToken {
            base_version: base.version(),
            changes_digest: digest_changes(&changes)?,
        };
        let key = (model.root().to_path_buf(), changeset.id.clone(), layer);
        let metrics = self.metrics.entry(changeset.id.clone()).or_default();

        if let Some(entry) = self.cache.get(&key) {
            if entry.token == token {
                metrics.hits += 1;
                debug!("Projection cache hit: {}/{}", changeset.id, layer);
                return Ok(entry.layer.clone());
            }
        }

        metrics.misses += 1;
        debug!(
            "Projection cache miss: {}/{} ({} change(s))",
            changeset.id,
            layer,
            changes.len()
        );

        let mut projected = base.clone();
        replay(&mut projected, &changeset.id, &changes)?;

        let touched = changes.iter().map(|c| c.element_id.clone()).collect();
        self.cache.insert(
            key,
            CacheEntry {
                layer: projected.clone(),
                token,
                touched,
            },
        );
        Ok(projected)
    }
}

/// Replay `changes` onto `layer` in sequence order.
///
/// `add` inserts, `update` merges onto an existing element, `delete` removes
/// (a missing target is a no-op).
///
/// # Errors
/// `ArchError::ReplayTargetMissing` for an update whose element is absent.
pub fn replay(layer: &mut Layer, changeset_id: &str, changes: &[&Change]) -> Result<()> {
    let mut ordered = changes.to_vec();
    ordered.sort_by_key(|c| c.sequence_number);

    for change in ordered {
        match &change.op {
            ChangeOp::Add { after } => {
                layer.insert(after.clone());
            }
            ChangeOp::Update { after, .. } => {
                if layer.update(&change.element_id, after).is_none() {
                    return Err(ArchError::ReplayTargetMissing {
                        changeset_id: changeset_id.to_string(),
                        layer: change.layer_name,
                        element_id: change.element_id.clone(),
                        sequence_number: change.sequence_number,
                    });
                }
            }
            ChangeOp::Delete { .. } => {
                layer.remove(&change.element_id);
            }
        }
    }
    Ok(())
}

/// Digest of a layer's ops in order, independent of sequence numbers and timestamps.
fn digest_changes(changes: &[&Change]) -> Result<String> {
    let mut hasher = Sha256::new();
    for change in changes {
        let bytes = serde_json::to_vec(&(&change.element_id, &change.op))?;
        hasher.update((bytes.len() as u64).to_le_bytes());
        hasher.update(&bytes);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
