//! Staging Interceptor
//!
//! Routing policy for element mutations. The decision is made once, when the
//! interceptor is built from the active changeset read at the start of a
//! command: if that changeset is `staged`, edits go to its change log and the
//! base model files are left alone; otherwise edits are applied to the model
//! and persisted under the model lock.
//!
//! Staged preconditions are checked under the changeset lock. Direct edits
//! reload the model under the manifest lock before mutating it.

use log::info;

use crate::error::{ArchError, Result};
use crate::lock::{FileLock, LockOptions};
use crate::model::{Element, ElementPatch, Layer, LayerName, Model};
use crate::staging::changeset::{Change, Changeset};
use crate::staging::projection::ProjectionEngine;
use crate::staging::store::ChangesetStore;

/// Where a mutation ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOutcome {
    /// Appended to a changeset's change log.
    Staged {
        changeset_id: String,
        sequence_number: u64,
    },
    /// Written to the base model.
    Applied { layer: LayerName },
}

/// Routes add/update/delete to either the change log or the base model.
#[derive(Debug)]
pub struct StagingInterceptor {
    engine: ProjectionEngine,
    active: Option<Changeset>,
    lock_options: LockOptions,
}

impl StagingInterceptor {
    /// Build from an explicit active changeset value.
    pub fn new(store: ChangesetStore, active: Option<Changeset>) -> Self {
        let lock_options = store.lock_options().clone();
        Self {
            engine: ProjectionEngine::new(store),
            active,
            lock_options,
        }
    }

    /// Build by reading the store's active pointer once.
    pub fn from_store(store: ChangesetStore) -> Result<Self> {
        let active = store.get_active()?;
        Ok(Self::new(store, active))
    }

    pub fn active(&self) -> Option<&Changeset> {
        self.active.as_ref()
    }

    /// True when mutations will be staged rather than applied.
    pub fn is_active_and_staged(&self) -> bool {
        self.active.as_ref().map_or(false, Changeset::is_staged)
    }

    /// The projection engine used to read current staged state.
    pub fn engine_mut(&mut self) -> &mut ProjectionEngine {
        &mut self.engine
    }

    pub fn add_element(
        &mut self,
        model: &mut Model,
        layer: LayerName,
        element: Element,
    ) -> Result<MutationOutcome> {
        match self.staged_id() {
            Some(changeset_id) => self.stage(model, &changeset_id, layer, |current| {
                if current.contains(&element.id) {
                    return Err(ArchError::ElementExists {
                        layer,
                        id: element.id,
                    });
                }
                Ok(Change::add(layer, element))
            }),
            None => self.apply_direct(model, layer, false, |model| {
                model.add_element(layer, element)
            }),
        }
    }

    pub fn update_element(
        &mut self,
        model: &mut Model,
        layer: LayerName,
        id: &str,
        patch: ElementPatch,
    ) -> Result<MutationOutcome> {
        match self.staged_id() {
            Some(changeset_id) => self.stage(model, &changeset_id, layer, |current| {
                let element = current.get(id).ok_or_else(|| ArchError::ElementNotFound {
                    layer,
                    id: id.to_string(),
                })?;
                let before = ElementPatch::capture(element, &patch);
                Ok(Change::update(layer, id, before, patch))
            }),
            None => self.apply_direct(model, layer, false, |model| {
                model.update_element(layer, id, &patch).map(|_| ())
            }),
        }
    }

    pub fn delete_element(
        &mut self,
        model: &mut Model,
        layer: LayerName,
        id: &str,
    ) -> Result<MutationOutcome> {
        match self.staged_id() {
            Some(changeset_id) => self.stage(model, &changeset_id, layer, |current| {
                let element = current.get(id).cloned().ok_or_else(|| {
                    ArchError::ElementNotFound {
                        layer,
                        id: id.to_string(),
                    }
                })?;
                Ok(Change::delete(layer, element))
            }),
            None => self.apply_direct(model, layer, true, |model| {
                model.delete_element(layer, id).map(|_| ())
            }),
        }
    }

    fn staged_id(&self) -> Option<String> {
        self.active
            .as_ref()
            .filter(|changeset| changeset.is_staged())
            .map(|changeset| changeset.id.clone())
    }

    /// Check `build`'s precondition against the projection and append its
    /// change, both under the changeset lock.
    fn stage<F>(
        &mut self,
        model: &Model,
        changeset_id: &str,
        layer: LayerName,
        build: F,
    ) -> Result<MutationOutcome>
    where
        F: FnOnce(&Layer) -> Result<Change>,
    {
        let store = self.engine.store().clone();
        let engine = &mut self.engine;
        let stored = store.append_with(changeset_id, |changeset| {
            let current = engine.project_changeset(model, changeset, layer)?;
            build(&current)
        })?;
        info!(
            "Staged {} of '{}' in changeset {}",
            stored.kind(),
            stored.element_id,
            changeset_id
        );
        Ok(MutationOutcome::Staged {
            changeset_id: changeset_id.to_string(),
            sequence_number: stored.sequence_number,
        })
    }

    /// Reload, mutate and persist the base model under the manifest lock.
    ///
    /// `model` ends up holding the on-disk state, including edits made by
    /// other writers since it was loaded.
    fn apply_direct<F>(
        &self,
        model: &mut Model,
        layer: LayerName,
        with_relationships: bool,
        mutate: F,
    ) -> Result<MutationOutcome>
    where
        F: FnOnce(&mut Model) -> Result<()>,
    {
        let mut lock = FileLock::new(model.manifest_path());
        lock.with_lock(&self.lock_options, || {
            model.reload()?;
            mutate(&mut *model)?;
            model.save_layer(layer)?;
            if with_relationships && model.relationships().is_dirty() {
                model.save_relationships()?;
            }
            model.save_manifest()
        })?;
        info!("Applied change directly to base layer {}", layer);
        Ok(MutationOutcome::Applied { layer })
    }
}
