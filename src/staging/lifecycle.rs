//! Changeset lifecycle: apply, revert, discard, export and import.
//!
//! Applying materializes a changeset into the base model; reverting undoes an
//! applied changeset using the `before` state its entries carry. Both hold the
//! manifest lock for the whole reload, check, replay and save sequence, and
//! replay onto copies of the affected layers first, so a replay error leaves
//! the model files exactly as they were.

use std::collections::BTreeMap;
use std::path::Path;

use log::{info, warn};
use serde::Serialize;

use crate::error::{ArchError, Result};
use crate::lock::FileLock;
use crate::model::{LayerName, Model};
use crate::staging::changeset::{Change, ChangeOp, Changeset, ChangesetStatus};
use crate::staging::projection::{replay, ProjectionEngine};
use crate::staging::snapshot::{validate_compatibility, CompatibilityReport};
use crate::staging::store::ChangesetStore;
use crate::storage;

/// Result of applying or reverting a changeset.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleReport {
    pub changeset_id: String,
    /// Number of change entries replayed.
    pub replayed: usize,
    /// Base layers that were rewritten.
    pub layers: Vec<LayerName>,
    pub compatibility: CompatibilityReport,
}

/// Replay a `draft` or `staged` changeset onto the base model and persist it.
///
/// Runs under the manifest lock against a freshly reloaded `model`, so edits
/// other writers saved since `model` was loaded are kept. Blocking
/// compatibility findings abort unless `force` is set; replay errors (an
/// update with no target) abort regardless.
pub fn apply_changeset(
    model: &mut Model,
    engine: &mut ProjectionEngine,
    changeset_id: &str,
    force: bool,
) -> Result<LifecycleReport> {
    let store = engine.store().clone();
    let lock_options = store.lock_options().clone();

    let (changeset, compatibility, layers) =
        FileLock::new(model.manifest_path()).with_lock(&lock_options, || {
            model.reload()?;
            let changeset = store.require(changeset_id)?;
            if !matches!(
                changeset.status,
                ChangesetStatus::Draft | ChangesetStatus::Staged
            ) {
                return Err(ArchError::InvalidChangesetStatus {
                    id: changeset.id,
                    status: changeset.status.to_string(),
                    expected: "draft or staged".to_string(),
                });
            }

            let compatibility = check(&changeset, model, force)?;
            let layers = replay_onto_model(model, &changeset.id, &changeset.changes)?;
            store.set_status(changeset_id, ChangesetStatus::Applied)?;
            Ok((changeset, compatibility, layers))
        })?;

    if store.active_id()?.as_deref() == Some(changeset_id) {
        store.clear_active()?;
    }
    engine.invalidate_on_unstage(changeset_id, None);

    info!(
        "Applied changeset {} ({} change(s)) to the base model",
        changeset_id,
        changeset.changes.len()
    );
    Ok(LifecycleReport {
        changeset_id: changeset.id,
        replayed: changeset.changes.len(),
        layers,
        compatibility,
    })
}

/// Undo an `applied` changeset by replaying inverse ops in reverse order.
///
/// Locks and reloads the model the same way as [`apply_changeset`].
pub fn revert_changeset(
    model: &mut Model,
    engine: &mut ProjectionEngine,
    changeset_id: &str,
) -> Result<LifecycleReport> {
    let store = engine.store().clone();
    let lock_options = store.lock_options().clone();

    let (changeset, replayed, layers) =
        FileLock::new(model.manifest_path()).with_lock(&lock_options, || {
            model.reload()?;
            let changeset = store.require(changeset_id)?;
            if changeset.status != ChangesetStatus::Applied {
                return Err(ArchError::InvalidChangesetStatus {
                    id: changeset.id,
                    status: changeset.status.to_string(),
                    expected: "applied".to_string(),
                });
            }

            let inverse = inverse_changes(&changeset);
            let layers = replay_onto_model(model, &changeset.id, &inverse)?;
            store.set_status(changeset_id, ChangesetStatus::Reverted)?;
            Ok((changeset, inverse.len(), layers))
        })?;

    engine.invalidate_on_unstage(changeset_id, None);

    info!("Reverted changeset {}", changeset_id);
    Ok(LifecycleReport {
        changeset_id: changeset.id,
        replayed,
        layers,
        compatibility: CompatibilityReport {
            compatible: true,
            ..Default::default()
        },
    })
}

/// Delete a changeset, clear the active pointer if it named it, and drop its cache.
pub fn discard_changeset(engine: &mut ProjectionEngine, changeset_id: &str) -> Result<()> {
    let store = engine.store().clone();
    if !store.delete(changeset_id)? {
        return Err(ArchError::ChangesetNotFound {
            id: changeset_id.to_string(),
        });
    }
    if store.active_id()?.as_deref() == Some(changeset_id) {
        store.clear_active()?;
    }
    engine.invalidate_on_unstage(changeset_id, None);
    info!("Discarded changeset {}", changeset_id);
    Ok(())
}

/// Write a changeset record to `path`.
pub fn export_changeset(store: &ChangesetStore, changeset_id: &str, path: &Path) -> Result<()> {
    let changeset = store.require(changeset_id)?;
    storage::write_json_atomic(path, &changeset)?;
    info!("Exported changeset {} to {}", changeset_id, path.display());
    Ok(())
}

/// Import a changeset file as a new `draft` changeset of this model.
///
/// The record keeps its original base snapshot, so drift from the exporting
/// model shows up in the report. An id already in use is replaced by a fresh one.
pub fn import_changeset(
    store: &ChangesetStore,
    model: &Model,
    path: &Path,
    force: bool,
) -> Result<(Changeset, CompatibilityReport)> {
    let content = storage::read_string(path)?;
    let mut imported: Changeset =
        serde_json::from_str(&content).map_err(|e| ArchError::ChangesetLoadFailed {
            id: path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default(),
            path: path.to_path_buf(),
            source: e,
        })?;

    imported.resequence();
    let report = check(&imported, model, force)?;

    let id = if store.exists(&imported.id)? {
        let fresh = ChangesetStore::generate_id();
        warn!(
            "Changeset id {} already in use; importing as {}",
            imported.id, fresh
        );
        fresh
    } else {
        imported.id.clone()
    };

    let mut changeset = store.create(
        &id,
        &imported.name,
        imported.description.clone(),
        &imported.base_snapshot,
    )?;
    changeset.changes = imported.changes;
    store.save(&mut changeset)?;

    info!(
        "Imported changeset {} with {} change(s)",
        changeset.id,
        changeset.changes.len()
    );
    Ok((changeset, report))
}

fn check(changeset: &Changeset, model: &Model, force: bool) -> Result<CompatibilityReport> {
    let report = validate_compatibility(changeset, model)?;
    for warning in &report.warnings {
        warn!("{}", warning);
    }
    if !report.compatible {
        if !force {
            return Err(ArchError::IncompatibleChangeset {
                id: changeset.id.clone(),
                reasons: report.blocking.clone(),
            });
        }
        warn!(
            "Proceeding with incompatible changeset {} (forced)",
            changeset.id
        );
    }
    Ok(report)
}

fn inverse_changes(changeset: &Changeset) -> Vec<Change> {
    let mut ordered: Vec<&Change> = changeset.changes.iter().collect();
    ordered.sort_by_key(|c| std::cmp::Reverse(c.sequence_number));

    ordered
        .into_iter()
        .enumerate()
        .map(|(index, change)| {
            let mut inverse = Change::new(
                change.layer_name,
                change.element_id.clone(),
                change.op.inverse(),
            );
            inverse.sequence_number = index as u64;
            inverse
        })
        .collect()
}

/// Replay onto copies of the touched layers, then swap them in and persist.
///
/// The caller holds the manifest lock.
fn replay_onto_model(
    model: &mut Model,
    changeset_id: &str,
    changes: &[Change],
) -> Result<Vec<LayerName>> {
    let mut replayed: BTreeMap<LayerName, _> = BTreeMap::new();
    for layer in LayerName::ALL {
        let layer_changes: Vec<&Change> =
            changes.iter().filter(|c| c.layer_name == layer).collect();
        if layer_changes.is_empty() {
            continue;
        }
        let mut copy = model
            .layer(layer)
            .ok_or(ArchError::LayerNotFound { layer })?
            .clone();
        replay(&mut copy, changeset_id, &layer_changes)?;
        replayed.insert(layer, copy);
    }

    let layers: Vec<LayerName> = replayed.keys().copied().collect();
    for (name, layer) in replayed {
        if let Some(target) = model.layer_mut(name) {
            *target = layer;
        }
    }

    for change in changes {
        if let ChangeOp::Delete { .. } = change.op {
            if model.find_element(&change.element_id).is_none() {
                model.relationships_mut().delete_for_element(&change.element_id);
            }
        }
    }

    for layer in &layers {
        model.save_layer(*layer)?;
    }
    if model.relationships().is_dirty() {
        model.save_relationships()?;
    }
    model.save_manifest()?;

    Ok(layers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Element, ElementPatch, Relationship};
    use crate::lock::LockOptions;
    use crate::staging::snapshot::capture_snapshot;
    use std::time::Duration;
    use tempfile::TempDir;

    fn setup(temp: &TempDir) -> (Model, ProjectionEngine) {
        let mut model = Model::init(temp.path(), "demo").unwrap();
        model
            .add_element(LayerName::Application, Element::new("svc", "service", "Svc"))
            .unwrap();
        model
            .relationships_mut()
            .add(Relationship::new("r1", "goal", "svc", "realizes"));
        model.save().unwrap();
        let store = ChangesetStore::for_model(&model);
        let snapshot = capture_snapshot(&model).unwrap();
        store.create("cs", "cs", None, &snapshot).unwrap();
        (model, ProjectionEngine::new(store))
    }

    fn stage_edits(engine: &ProjectionEngine) {
        let store = engine.store();
        store
            .add_change(
                "cs",
                Change::add(LayerName::Business, Element::new("actor", "actor", "Actor")),
            )
            .unwrap();
        store
            .add_change(
                "cs",
                Change::update(
                    LayerName::Application,
                    "svc",
                    ElementPatch {
                        name: Some("Svc".to_string()),
                        ..Default::default()
                    },
                    ElementPatch {
                        name: Some("Service".to_string()),
                        ..Default::default()
                    },
                ),
            )
            .unwrap();
    }

    #[test]
    fn test_apply_materializes_changes() {
        let temp = TempDir::new().unwrap();
        let (mut model, mut engine) = setup(&temp);
        stage_edits(&engine);
        engine.store().stage("cs").unwrap();

        let report = apply_changeset(&mut model, &mut engine, "cs", false).unwrap();

        assert_eq!(report.replayed, 2);
        assert_eq!(
            report.layers,
            vec![LayerName::Business, LayerName::Application]
        );
        let reloaded = Model::load(temp.path()).unwrap();
        assert!(reloaded.element(LayerName::Business, "actor").is_some());
        assert_eq!(
            reloaded.element(LayerName::Application, "svc").unwrap().name,
            "Service"
        );
        let changeset = engine.store().require("cs").unwrap();
        assert_eq!(changeset.status, ChangesetStatus::Applied);
        assert!(engine.store().active_id().unwrap().is_none());
    }

    #[test]
    fn test_apply_from_stale_model_keeps_other_writes() {
        let temp = TempDir::new().unwrap();
        let (mut stale, mut engine) = setup(&temp);
        stage_edits(&engine);

        let mut other = Model::load(temp.path()).unwrap();
        other
            .add_element(LayerName::Application, Element::new("late", "component", "Late"))
            .unwrap();
        other.save().unwrap();

        apply_changeset(&mut stale, &mut engine, "cs", false).unwrap();

        let reloaded = Model::load(temp.path()).unwrap();
        assert!(reloaded.element(LayerName::Application, "late").is_some());
        assert_eq!(
            reloaded.element(LayerName::Application, "svc").unwrap().name,
            "Service"
        );
        assert!(reloaded.element(LayerName::Business, "actor").is_some());
        assert!(!FileLock::exists(&reloaded.manifest_path()));
    }

    #[test]
    fn test_apply_waits_for_manifest_lock() {
        let temp = TempDir::new().unwrap();
        let (mut model, engine) = setup(&temp);
        let store = engine
            .store()
            .clone()
            .with_lock_options(LockOptions::default().with_timeout(Duration::from_millis(100)));
        let mut engine = ProjectionEngine::new(store);

        let mut held = FileLock::new(model.manifest_path());
        held.acquire(&LockOptions::default()).unwrap();
        let result = apply_changeset(&mut model, &mut engine, "cs", false);
        held.release().unwrap();

        assert!(matches!(result, Err(ArchError::LockTimeout { .. })));
        assert_eq!(
            engine.store().require("cs").unwrap().status,
            ChangesetStatus::Draft
        );
    }

    #[test]
    fn test_apply_twice_rejected() {
        let temp = TempDir::new().unwrap();
        let (mut model, mut engine) = setup(&temp);
        apply_changeset(&mut model, &mut engine, "cs", false).unwrap();

        let result = apply_changeset(&mut model, &mut engine, "cs", false);
        assert!(matches!(
            result,
            Err(ArchError::InvalidChangesetStatus { .. })
        ));
    }

    #[test]
    fn test_apply_incompatible_leaves_model_untouched() {
        let temp = TempDir::new().unwrap();
        let (mut model, mut engine) = setup(&temp);
        engine
            .store()
            .add_change(
                "cs",
                Change::add(LayerName::Application, Element::new("svc", "service", "Dup")),
            )
            .unwrap();

        let result = apply_changeset(&mut model, &mut engine, "cs", false);
        assert!(matches!(
            result,
            Err(ArchError::IncompatibleChangeset { .. })
        ));
        assert_eq!(
            model.element(LayerName::Application, "svc").unwrap().name,
            "Svc"
        );

        // Forcing lets the duplicate add overwrite.
        apply_changeset(&mut model, &mut engine, "cs", true).unwrap();
        assert_eq!(
            model.element(LayerName::Application, "svc").unwrap().name,
            "Dup"
        );
    }

    #[test]
    fn test_apply_delete_cascades_relationships() {
        let temp = TempDir::new().unwrap();
        let (mut model, mut engine) = setup(&temp);
        engine
            .store()
            .add_change(
                "cs",
                Change::delete(LayerName::Application, Element::new("svc", "service", "Svc")),
            )
            .unwrap();

        apply_changeset(&mut model, &mut engine, "cs", false).unwrap();

        let reloaded = Model::load(temp.path()).unwrap();
        assert!(reloaded.relationships().is_empty());
    }

    #[test]
    fn test_revert_restores_base() {
        let temp = TempDir::new().unwrap();
        let (mut model, mut engine) = setup(&temp);
        let original = capture_snapshot(&model).unwrap();
        stage_edits(&engine);

        apply_changeset(&mut model, &mut engine, "cs", false).unwrap();
        assert_ne!(capture_snapshot(&model).unwrap(), original);

        let report = revert_changeset(&mut model, &mut engine, "cs").unwrap();
        assert_eq!(report.replayed, 2);
        assert_eq!(capture_snapshot(&model).unwrap(), original);
        assert_eq!(
            engine.store().require("cs").unwrap().status,
            ChangesetStatus::Reverted
        );
    }

    #[test]
    fn test_revert_requires_applied() {
        let temp = TempDir::new().unwrap();
        let (mut model, mut engine) = setup(&temp);
        let result = revert_changeset(&mut model, &mut engine, "cs");
        assert!(matches!(
            result,
            Err(ArchError::InvalidChangesetStatus { .. })
        ));
    }

    #[test]
    fn test_discard_clears_active() {
        let temp = TempDir::new().unwrap();
        let (_model, mut engine) = setup(&temp);
        engine.store().stage("cs").unwrap();

        discard_changeset(&mut engine, "cs").unwrap();

        assert!(engine.store().load("cs").unwrap().is_none());
        assert!(engine.store().active_id().unwrap().is_none());
        assert!(matches!(
            discard_changeset(&mut engine, "cs"),
            Err(ArchError::ChangesetNotFound { .. })
        ));
    }

    #[test]
    fn test_export_import_round_trip() {
        let temp = TempDir::new().unwrap();
        let (model, engine) = setup(&temp);
        stage_edits(&engine);
        let export_path = temp.path().join("exported.json");

        export_changeset(engine.store(), "cs", &export_path).unwrap();
        let (imported, report) =
            import_changeset(engine.store(), &model, &export_path, false).unwrap();

        assert!(report.compatible);
        assert!(report.base_snapshot_match);
        assert_ne!(imported.id, "cs");
        assert_eq!(imported.status, ChangesetStatus::Draft);
        assert_eq!(imported.changes.len(), 2);
        assert_eq!(imported.stats.additions, 1);
    }

    #[test]
    fn test_import_incompatible_rejected() {
        let temp = TempDir::new().unwrap();
        let (model, engine) = setup(&temp);
        engine
            .store()
            .add_change(
                "cs",
                Change::update(
                    LayerName::Application,
                    "ghost",
                    ElementPatch::default(),
                    ElementPatch::default(),
                ),
            )
            .unwrap();
        let export_path = temp.path().join("exported.json");
        export_changeset(engine.store(), "cs", &export_path).unwrap();

        let result = import_changeset(engine.store(), &model, &export_path, false);
        assert!(matches!(
            result,
            Err(ArchError::IncompatibleChangeset { .. })
        ));

        let (_, report) = import_changeset(engine.store(), &model, &export_path, true).unwrap();
        assert_eq!(report.missing_elements, vec!["ghost"]);
    }
}
