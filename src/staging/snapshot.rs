//! Base Snapshot Manager
//!
//! Fingerprints the base model and checks whether a changeset still fits the
//! model it is about to be replayed against.

use std::collections::{BTreeSet, HashSet};

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::model::{LayerName, Model};
use crate::staging::changeset::{ChangeOp, Changeset};

/// Compute the fingerprint of every base layer's element set.
///
/// Deterministic: equal layer contents always yield the same 64-char hex
/// digest. Layer versions and manifest metadata are not part of it.
pub fn capture_snapshot(model: &Model) -> Result<String> {
    let mut hasher = Sha256::new();

    for layer in model.layers() {
        hasher.update(layer.name.as_str().as_bytes());
        hasher.update([0u8]);
        for element in layer.list_elements() {
            let canonical = serde_json::to_vec(element)?;
            hasher.update((canonical.len() as u64).to_le_bytes());
            hasher.update(&canonical);
        }
        hasher.update([0xffu8]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Outcome of [`validate_compatibility`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompatibilityReport {
    /// True when nothing blocks replaying the changeset.
    pub compatible: bool,

    /// Whether the model still matches the changeset's base snapshot.
    pub base_snapshot_match: bool,

    /// Element ids that updates or deletes expected but the model lacks.
    pub missing_elements: Vec<String>,

    /// Non-blocking findings.
    pub warnings: Vec<String>,

    /// Findings that make the changeset unsafe to replay.
    pub blocking: Vec<String>,

    /// Layers the changeset touches.
    pub affected_layers: Vec<LayerName>,
}

/// Check whether `changeset` can be replayed onto `model`.
///
/// Changes are walked in sequence order while tracking which elements exist,
/// so an update that follows an add of the same element is accepted.
pub fn validate_compatibility(changeset: &Changeset, model: &Model) -> Result<CompatibilityReport> {
    let current = capture_snapshot(model)?;
    let base_snapshot_match = current == changeset.base_snapshot;

    let mut report = CompatibilityReport {
        base_snapshot_match,
        ..Default::default()
    };

    if !base_snapshot_match {
        report.warnings.push(format!(
            "Base model has changed since changeset '{}' was created",
            changeset.id
        ));
    }

    let mut ordered: Vec<_> = changeset.changes.iter().collect();
    ordered.sort_by_key(|c| c.sequence_number);

    let mut present: HashSet<(LayerName, &str)> = HashSet::new();
    let mut absent: HashSet<(LayerName, &str)> = HashSet::new();
    let mut affected = BTreeSet::new();

    for change in ordered {
        let key = (change.layer_name, change.element_id.as_str());
        affected.insert(change.layer_name);

        let exists = present.contains(&key)
            || (!absent.contains(&key)
                && model
                    .element(change.layer_name, &change.element_id)
                    .is_some());

        match &change.op {
            ChangeOp::Add { .. } => {
                if exists {
                    report.blocking.push(format!(
                        "Add of '{}' in {}: element already exists",
                        change.element_id, change.layer_name
                    ));
                }
                absent.remove(&key);
                present.insert(key);
            }
            ChangeOp::Update { .. } => {
                if !exists {
                    report.missing_elements.push(change.element_id.clone());
                    report.blocking.push(format!(
                        "Update of '{}' in {}: element not found",
                        change.element_id, change.layer_name
                    ));
                }
            }
            ChangeOp::Delete { .. } => {
                if !exists {
                    report.missing_elements.push(change.element_id.clone());
                    report.warnings.push(format!(
                        "Delete of '{}' in {}: element already absent",
                        change.element_id, change.layer_name
                    ));
                }
                present.remove(&key);
                absent.insert(key);
            }
        }
    }

    report.affected_layers = affected.into_iter().collect();
    report.compatible = report.blocking.is_empty();
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Element, ElementPatch};
    use crate::staging::changeset::Change;
    use tempfile::TempDir;

    fn model_with(temp: &TempDir, ids: &[&str]) -> Model {
        let mut model = Model::init(temp.path(), "demo").unwrap();
        for id in ids {
            model
                .add_element(LayerName::Application, Element::new(*id, "service", *id))
                .unwrap();
        }
        model
    }

    #[test]
    fn test_snapshot_is_deterministic_and_content_based() {
        let temp = TempDir::new().unwrap();
        let mut model = model_with(&temp, &["a", "b"]);

        let first = capture_snapshot(&model).unwrap();
        assert_eq!(first.len(), 64);
        assert_eq!(first, capture_snapshot(&model).unwrap());

        model
            .update_element(
                LayerName::Application,
                "a",
                &ElementPatch {
                    name: Some("renamed".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        let changed = capture_snapshot(&model).unwrap();
        assert_ne!(first, changed);

        // Restoring the content restores the fingerprint even though versions moved on.
        model
            .update_element(
                LayerName::Application,
                "a",
                &ElementPatch {
                    name: Some("a".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(first, capture_snapshot(&model).unwrap());
    }

    #[test]
    fn test_snapshot_survives_reload() {
        let temp = TempDir::new().unwrap();
        let mut model = model_with(&temp, &["a"]);
        model.save().unwrap();

        let reloaded = Model::load(temp.path()).unwrap();
        assert_eq!(
            capture_snapshot(&model).unwrap(),
            capture_snapshot(&reloaded).unwrap()
        );
    }

    #[test]
    fn test_compatible_changeset() {
        let temp = TempDir::new().unwrap();
        let model = model_with(&temp, &["a"]);
        let mut changeset = Changeset::new("cs", "cs", None, capture_snapshot(&model).unwrap());
        changeset.push_change(Change::add(
            LayerName::Application,
            Element::new("b", "service", "b"),
        ));
        changeset.push_change(Change::update(
            LayerName::Application,
            "b",
            ElementPatch::default(),
            ElementPatch::default(),
        ));

        let report = validate_compatibility(&changeset, &model).unwrap();
        assert!(report.compatible);
        assert!(report.base_snapshot_match);
        assert!(report.warnings.is_empty());
        assert_eq!(report.affected_layers, vec![LayerName::Application]);
    }

    #[test]
    fn test_incompatibilities_reported() {
        let temp = TempDir::new().unwrap();
        let model = model_with(&temp, &["a"]);
        let mut changeset = Changeset::new("cs", "cs", None, "stale-fingerprint");
        changeset.push_change(Change::add(
            LayerName::Application,
            Element::new("a", "service", "a"),
        ));
        changeset.push_change(Change::update(
            LayerName::Application,
            "ghost",
            ElementPatch::default(),
            ElementPatch::default(),
        ));
        changeset.push_change(Change::delete(
            LayerName::Business,
            Element::new("gone", "actor", "gone"),
        ));

        let report = validate_compatibility(&changeset, &model).unwrap();

        assert!(!report.compatible);
        assert!(!report.base_snapshot_match);
        assert_eq!(report.blocking.len(), 2);
        assert_eq!(report.missing_elements, vec!["ghost", "gone"]);
        // drift + delete-of-missing
        assert_eq!(report.warnings.len(), 2);
        assert_eq!(
            report.affected_layers,
            vec![LayerName::Business, LayerName::Application]
        );
    }

    #[test]
    fn test_delete_then_update_is_blocking() {
        let temp = TempDir::new().unwrap();
        let model = model_with(&temp, &["a"]);
        let mut changeset = Changeset::new("cs", "cs", None, capture_snapshot(&model).unwrap());
        changeset.push_change(Change::delete(
            LayerName::Application,
            Element::new("a", "service", "a"),
        ));
        changeset.push_change(Change::update(
            LayerName::Application,
            "a",
            ElementPatch::default(),
            ElementPatch::default(),
        ));

        let report = validate_compatibility(&changeset, &model).unwrap();
        assert!(!report.compatible);
        assert_eq!(report.missing_elements, vec!["a"]);
    }
}
