//! CLI Command Implementations
//!
//! Each command opens the model, reads the active changeset pointer once and
//! does its work through the library. Only this module writes to stdout.

use std::path::Path;

use log::{info, warn};

use crate::cli::ElementFields;
use crate::config::Config;
use crate::error::{ArchError, Result};
use crate::lock::FileLock;
use crate::model::{Element, ElementPatch, LayerName, Model};
use crate::staging::{
    self, capture_snapshot, validate_compatibility, Change, ChangeOp, Changeset, ChangesetStore,
    MutationOutcome, ProjectionEngine, StagingInterceptor,
};

/// A loaded model plus the changeset store configured for it.
struct Workspace {
    model: Model,
    store: ChangesetStore,
    config: Config,
}

impl Workspace {
    fn open(root: &Path) -> Result<Self> {
        let config = Config::load(root)?;
        let model = Model::load(root)?;
        let store = ChangesetStore::for_model(&model).with_lock_options(config.lock_options());
        Ok(Self {
            model,
            store,
            config,
        })
    }

    /// The explicit id, or the active changeset's id.
    fn resolve(&self, id: Option<&str>) -> Result<String> {
        match id {
            Some(id) => Ok(id.to_string()),
            None => self
                .store
                .active_id()?
                .ok_or(ArchError::NoActiveChangeset),
        }
    }
}

/// Create an empty model.
pub fn init(root: &Path, name: Option<&str>) -> Result<()> {
    info!("Initializing model at: {}", root.display());

    let name = match name {
        Some(name) => name.to_string(),
        None => root
            .canonicalize()
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
            .unwrap_or_else(|| "model".to_string()),
    };
    let model = Model::init(root, &name)?;

    println!("Model '{}' created: {}", name, root.display());
    println!("Layers: {}", model.layers().count());
    Ok(())
}

fn report_outcome(outcome: &MutationOutcome, verb: &str, id: &str) {
    match outcome {
        MutationOutcome::Staged {
            changeset_id,
            sequence_number,
        } => println!(
            "Staged {} of '{}' in changeset {} (#{})",
            verb, id, changeset_id, sequence_number
        ),
        MutationOutcome::Applied { layer } => println!("{} '{}' in {}", verb, id, layer),
    }
}

/// Add an element, staging it when a staged changeset is active.
pub fn element_add(
    root: &Path,
    layer: LayerName,
    id: &str,
    element_type: &str,
    fields: ElementFields,
) -> Result<()> {
    let mut ws = Workspace::open(root)?;
    let mut interceptor = StagingInterceptor::from_store(ws.store.clone())?;

    let mut element = Element::new(id, element_type, fields.name.unwrap_or_else(|| id.to_string()));
    if let Some(description) = fields.description.filter(|d| !d.is_empty()) {
        element = element.with_description(description);
    }
    for (key, value) in fields.properties.into_iter().filter(|(_, v)| !v.is_null()) {
        element = element.with_property(key, value);
    }

    let outcome = interceptor.add_element(&mut ws.model, layer, element)?;
    report_outcome(&outcome, "Added", id);
    Ok(())
}

/// Update an element's fields.
pub fn element_update(
    root: &Path,
    layer: LayerName,
    id: &str,
    fields: ElementFields,
    remove_properties: Vec<String>,
) -> Result<()> {
    let mut ws = Workspace::open(root)?;
    let mut interceptor = StagingInterceptor::from_store(ws.store.clone())?;

    let mut patch = ElementPatch {
        name: fields.name,
        description: fields.description,
        properties: fields.properties.into_iter().collect(),
        ..Default::default()
    };
    for key in remove_properties {
        patch.properties.insert(key, serde_json::Value::Null);
    }
    if patch.is_empty() {
        warn!("Nothing to update for '{}'", id);
        return Ok(());
    }

    let outcome = interceptor.update_element(&mut ws.model, layer, id, patch)?;
    report_outcome(&outcome, "Updated", id);
    Ok(())
}

/// Delete an element.
pub fn element_delete(root: &Path, layer: LayerName, id: &str) -> Result<()> {
    let mut ws = Workspace::open(root)?;
    let mut interceptor = StagingInterceptor::from_store(ws.store.clone())?;

    let outcome = interceptor.delete_element(&mut ws.model, layer, id)?;
    report_outcome(&outcome, "Deleted", id);
    Ok(())
}

/// List elements as seen through a changeset (the active one by default).
pub fn element_list(
    root: &Path,
    layer: Option<LayerName>,
    changeset: Option<&str>,
    base: bool,
) -> Result<()> {
    let ws = Workspace::open(root)?;
    let view = if base {
        None
    } else {
        match changeset {
            Some(id) => Some(id.to_string()),
            None => ws.store.active_id()?,
        }
    };
    let mut engine = ProjectionEngine::new(ws.store.clone());

    let layers: Vec<LayerName> = match layer {
        Some(layer) => vec![layer],
        None => LayerName::ALL.to_vec(),
    };

    if let Some(id) = &view {
        println!("Viewing through changeset {}", id);
    }
    let mut total = 0;
    for name in layers {
        let projected = engine.view_layer(&ws.model, view.as_deref(), name)?;
        if projected.is_empty() {
            continue;
        }
        println!("{} ({})", name, projected.len());
        for element in projected.list_elements() {
            println!("  {:<30} {:<16} {}", element.id, element.element_type, element.name);
        }
        total += projected.len();
    }
    if total == 0 {
        println!("No elements.");
    }
    Ok(())
}

/// Create a draft changeset against the current model.
pub fn changeset_create(
    root: &Path,
    name: &str,
    description: Option<String>,
    id: Option<&str>,
) -> Result<()> {
    let ws = Workspace::open(root)?;
    let id = id.map(str::to_string).unwrap_or_else(ChangesetStore::generate_id);
    let snapshot = capture_snapshot(&ws.model)?;

    let changeset = ws.store.create(&id, name, description, &snapshot)?;

    println!("Changeset created: {} ({})", changeset.name, changeset.id);
    println!("Base snapshot: {}", changeset.base_snapshot);
    Ok(())
}

/// List changesets.
pub fn changeset_list(root: &Path) -> Result<()> {
    let ws = Workspace::open(root)?;
    let active = ws.store.active_id()?;
    let changesets = ws.store.list()?;

    if changesets.is_empty() {
        println!("No changesets.");
        return Ok(());
    }

    println!("Changesets:");
    println!("{:-<72}", "");
    for changeset in &changesets {
        let marker = if active.as_deref() == Some(changeset.id.as_str()) {
            "*"
        } else {
            " "
        };
        println!(
            "{} {:<38} {:<9} {:>4} change(s)  {}",
            marker,
            changeset.id,
            changeset.status.to_string(),
            changeset.changes.len(),
            changeset.name
        );
    }
    Ok(())
}

fn print_change(change: &Change) {
    let detail = match &change.op {
        ChangeOp::Add { after } => format!("{} '{}'", after.element_type, after.name),
        ChangeOp::Update { after, .. } => {
            serde_json::to_string(after).unwrap_or_else(|_| "<patch>".to_string())
        }
        ChangeOp::Delete { before } => format!("{} '{}'", before.element_type, before.name),
    };
    println!(
        "  #{:<4} {:<6} {:<12} {:<30} {}",
        change.sequence_number,
        change.kind().to_string(),
        change.layer_name.to_string(),
        change.element_id,
        detail
    );
}

fn print_changeset(changeset: &Changeset) {
    println!("Changeset: {} ({})", changeset.name, changeset.id);
    if let Some(description) = &changeset.description {
        println!("Description: {}", description);
    }
    println!("Status: {}", changeset.status);
    println!("Created: {}", changeset.created);
    println!("Modified: {}", changeset.modified);
    println!("Base snapshot: {}", changeset.base_snapshot);
    println!(
        "Changes: {} (+{} ~{} -{})",
        changeset.stats.total(),
        changeset.stats.additions,
        changeset.stats.modifications,
        changeset.stats.deletions
    );
}

/// Show a changeset and its change log.
pub fn changeset_show(root: &Path, id: Option<&str>) -> Result<()> {
    let ws = Workspace::open(root)?;
    let id = ws.resolve(id)?;
    let changeset = ws.store.require(&id)?;

    print_changeset(&changeset);
    for change in &changeset.changes {
        print_change(change);
    }
    Ok(())
}

/// Mark a changeset staged and make it active.
pub fn changeset_stage(root: &Path, id: &str) -> Result<()> {
    let ws = Workspace::open(root)?;
    let changeset = ws.store.stage(id)?;
    println!("Changeset {} is staged and active", changeset.id);
    Ok(())
}

/// Point the active pointer at a changeset.
pub fn changeset_activate(root: &Path, id: &str) -> Result<()> {
    let ws = Workspace::open(root)?;
    ws.store.set_active(id)?;
    let changeset = ws.store.require(id)?;
    println!("Active changeset: {}", changeset.id);
    if !changeset.is_staged() {
        println!(
            "Note: changeset is {}; edits are applied directly until it is staged",
            changeset.status
        );
    }
    Ok(())
}

/// Clear the active pointer.
pub fn changeset_deactivate(root: &Path) -> Result<()> {
    let ws = Workspace::open(root)?;
    if ws.store.clear_active()? {
        println!("No active changeset");
    } else {
        println!("No changeset was active");
    }
    Ok(())
}

/// Remove every change of one element.
pub fn changeset_unstage(root: &Path, element_id: &str, changeset: Option<&str>) -> Result<()> {
    let ws = Workspace::open(root)?;
    let id = ws.resolve(changeset)?;
    let removed = ws.store.unstage(&id, element_id)?;

    if removed.is_empty() {
        println!("No staged changes for '{}' in changeset {}", element_id, id);
    } else {
        println!(
            "Unstaged {} change(s) for '{}' from changeset {}",
            removed.len(),
            element_id,
            id
        );
    }
    Ok(())
}

/// Print staged changes grouped by type.
pub fn changeset_diff(root: &Path, id: Option<&str>) -> Result<()> {
    let ws = Workspace::open(root)?;
    let id = ws.resolve(id)?;
    let engine = ProjectionEngine::new(ws.store.clone());
    let diff = engine.compute_diff(&id)?;

    for (title, changes) in [
        ("Additions", &diff.additions),
        ("Modifications", &diff.modifications),
        ("Deletions", &diff.deletions),
    ] {
        println!("{} ({}):", title, changes.len());
        for change in changes {
            print_change(change);
        }
    }
    Ok(())
}

fn print_compatibility(report: &staging::CompatibilityReport) {
    println!(
        "Compatible: {}  (base snapshot {})",
        if report.compatible { "yes" } else { "no" },
        if report.base_snapshot_match {
            "matches"
        } else {
            "has drifted"
        }
    );
    for blocking in &report.blocking {
        println!("  blocking: {}", blocking);
    }
    for warning in &report.warnings {
        println!("  warning:  {}", warning);
    }
}

/// Apply a changeset to the base model.
pub fn changeset_apply(root: &Path, id: Option<&str>, force: bool) -> Result<()> {
    let mut ws = Workspace::open(root)?;
    let id = ws.resolve(id)?;
    let mut engine = ProjectionEngine::new(ws.store.clone());

    let report = staging::apply_changeset(&mut ws.model, &mut engine, &id, force)?;

    print_compatibility(&report.compatibility);
    println!(
        "Applied {} change(s) from changeset {} to {} layer(s)",
        report.replayed,
        report.changeset_id,
        report.layers.len()
    );
    Ok(())
}

/// Revert an applied changeset.
pub fn changeset_revert(root: &Path, id: &str) -> Result<()> {
    let mut ws = Workspace::open(root)?;
    let mut engine = ProjectionEngine::new(ws.store.clone());

    let report = staging::revert_changeset(&mut ws.model, &mut engine, id)?;

    println!(
        "Reverted changeset {} ({} change(s) undone)",
        report.changeset_id, report.replayed
    );
    Ok(())
}

/// Delete a changeset.
pub fn changeset_discard(root: &Path, id: &str) -> Result<()> {
    let ws = Workspace::open(root)?;
    let mut engine = ProjectionEngine::new(ws.store.clone());
    staging::discard_changeset(&mut engine, id)?;
    println!("Changeset {} discarded", id);
    Ok(())
}

/// Export a changeset to a file.
pub fn changeset_export(root: &Path, id: &str, output: &Path) -> Result<()> {
    let ws = Workspace::open(root)?;
    staging::export_changeset(&ws.store, id, output)?;
    println!("Changeset {} exported to {}", id, output.display());
    Ok(())
}

/// Import a changeset file as a new draft.
pub fn changeset_import(root: &Path, input: &Path, force: bool) -> Result<()> {
    let ws = Workspace::open(root)?;
    let (changeset, report) = staging::import_changeset(&ws.store, &ws.model, input, force)?;

    print_compatibility(&report);
    println!(
        "Imported changeset {} ({}) with {} change(s)",
        changeset.name,
        changeset.id,
        changeset.changes.len()
    );
    Ok(())
}

/// Print the base model fingerprint, optionally checking a changeset against it.
pub fn snapshot(root: &Path, check: Option<&str>) -> Result<()> {
    let ws = Workspace::open(root)?;
    println!("{}", capture_snapshot(&ws.model)?);

    if let Some(id) = check {
        let changeset = ws.store.require(id)?;
        let report = validate_compatibility(&changeset, &ws.model)?;
        print_compatibility(&report);
    }
    Ok(())
}

/// List lock markers under the model root.
pub fn lock_status(root: &Path) -> Result<()> {
    let ws = Workspace::open(root)?;
    let threshold = ws.config.lock_options().stale_lock_threshold;
    let locked = FileLock::find_locked_resources(ws.model.root());

    if locked.is_empty() {
        println!("No locks held.");
        return Ok(());
    }

    for resource in locked {
        let stale = if FileLock::is_lock_stale(&resource, threshold) {
            " (stale)"
        } else {
            ""
        };
        match FileLock::holder(&resource) {
            Some(holder) => println!(
                "{}  pid {} since {}{}",
                resource.display(),
                holder.pid,
                holder.acquired_at,
                stale
            ),
            None => println!("{}  holder unknown{}", resource.display(), stale),
        }
    }
    Ok(())
}

/// Remove stale lock markers, or every marker with `force`.
pub fn lock_cleanup(root: &Path, force: bool) -> Result<()> {
    let ws = Workspace::open(root)?;
    let threshold = ws.config.lock_options().stale_lock_threshold;

    let mut removed = 0;
    for resource in FileLock::find_locked_resources(ws.model.root()) {
        let cleaned = if force {
            FileLock::force_remove(&resource)?
        } else {
            FileLock::cleanup_stale_locks(&resource, threshold)?
        };
        if cleaned {
            info!("Removed lock marker for {}", resource.display());
            removed += 1;
        }
    }

    println!("Removed {} lock marker(s)", removed);
    Ok(())
}
