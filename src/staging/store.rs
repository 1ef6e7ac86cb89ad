//! Change Log (Staged Changeset Store)
//!
//! Durable storage for changesets: one JSON record per changeset under the
//! model's `changesets/` directory, plus a small pointer record naming the
//! active changeset. Every read-modify-write runs under a [`FileLock`] on the
//! record being changed, so concurrent CLI invocations cannot interleave
//! writes to the same changeset.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::error::{ArchError, Result};
use crate::lock::{FileLock, LockOptions};
use crate::model::Model;
use crate::staging::changeset::{Change, Changeset, ChangesetStats, ChangesetStatus};
use crate::storage;

/// File name of the active changeset pointer.
pub const ACTIVE_POINTER_FILE: &str = "active.json";

/// Reserved: would collide with the pointer record.
const RESERVED_ID: &str = "active";

/// Contents of the active changeset pointer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivePointer {
    pub changeset_id: String,
    pub activated_at: DateTime<Utc>,
}

/// Persistent store of changesets for one model.
#[derive(Debug, Clone)]
pub struct ChangesetStore {
    dir: PathBuf,
    lock_options: LockOptions,
}

impl ChangesetStore {
    /// A store rooted at `dir` (usually `<model>/changesets`).
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            lock_options: LockOptions::default(),
        }
    }

    /// The store belonging to `model`.
    pub fn for_model(model: &Model) -> Self {
        Self::new(model.changesets_dir())
    }

    pub fn with_lock_options(mut self, lock_options: LockOptions) -> Self {
        self.lock_options = lock_options;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn lock_options(&self) -> &LockOptions {
        &self.lock_options
    }

    /// A fresh random changeset id.
    pub fn generate_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Path of a changeset's record.
    pub fn changeset_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    fn active_pointer_path(&self) -> PathBuf {
        self.dir.join(ACTIVE_POINTER_FILE)
    }

    /// Create and persist a new `draft` changeset.
    ///
    /// # Errors
    /// `ArchError::ChangesetExists` if a changeset with `id` is already stored.
    pub fn create(
        &self,
        id: &str,
        name: &str,
        description: Option<String>,
        base_snapshot: &str,
    ) -> Result<Changeset> {
        validate_id(id)?;
        let path = self.changeset_path(id);

        self.locked(&path, || {
            if path.exists() {
                return Err(ArchError::ChangesetExists { id: id.to_string() });
            }
            let changeset = Changeset::new(id, name, description, base_snapshot);
            storage::write_json_atomic(&path, &changeset)?;
            info!("Created changeset '{}' ({})", name, id);
            Ok(changeset)
        })
    }

    pub fn exists(&self, id: &str) -> Result<bool> {
        validate_id(id)?;
        Ok(self.changeset_path(id).exists())
    }

    /// Load a changeset. A missing changeset is `Ok(None)`, not an error.
    ///
    /// # Errors
    /// `ArchError::ChangesetLoadFailed` if the record exists but cannot be parsed.
    pub fn load(&self, id: &str) -> Result<Option<Changeset>> {
        validate_id(id)?;
        let path = self.changeset_path(id);
        match storage::read_json_opt::<Changeset>(&path)? {
            None => Ok(None),
            Some(parsed) => parsed
                .map(Some)
                .map_err(|e| ArchError::ChangesetLoadFailed {
                    id: id.to_string(),
                    path,
                    source: e,
                }),
        }
    }

    /// Load a changeset, turning a miss into `ArchError::ChangesetNotFound`.
    pub fn require(&self, id: &str) -> Result<Changeset> {
        self.load(id)?
            .ok_or_else(|| ArchError::ChangesetNotFound { id: id.to_string() })
    }

    /// Append `change` with the next sequence number. Returns the stored entry.
    ///
    /// Not idempotent: submitting the same change twice appends it twice.
    pub fn add_change(&self, id: &str, change: Change) -> Result<Change> {
        self.append_with(id, |_| Ok(change))
    }

    /// Build a change from the current record and append it, all under the
    /// changeset lock. An error from `build` leaves the record unchanged.
    pub fn append_with<F>(&self, id: &str, build: F) -> Result<Change>
    where
        F: FnOnce(&Changeset) -> Result<Change>,
    {
        validate_id(id)?;
        let path = self.changeset_path(id);

        self.locked(&path, || {
            let mut changeset = self.require(id)?;
            let change = build(&changeset)?;
            let stored = changeset.push_change(change).clone();
            changeset.modified = Utc::now();
            storage::write_json_atomic(&path, &changeset)?;
            debug!(
                "Staged {} of '{}' in {} as #{} of changeset {}",
                stored.kind(),
                stored.element_id,
                stored.layer_name,
                stored.sequence_number,
                id
            );
            Ok(stored)
        })
    }

    /// Remove every change for `element_id` and resequence the rest to `0..n-1`.
    ///
    /// Returns the removed entries (empty if the element had no changes).
    pub fn unstage(&self, id: &str, element_id: &str) -> Result<Vec<Change>> {
        validate_id(id)?;
        let path = self.changeset_path(id);

        self.locked(&path, || {
            let mut changeset = self.require(id)?;
            let (removed, kept): (Vec<Change>, Vec<Change>) = changeset
                .changes
                .drain(..)
                .partition(|c| c.element_id == element_id);

            changeset.changes = kept;
            changeset.resequence();
            changeset.modified = Utc::now();
            storage::write_json_atomic(&path, &changeset)?;

            info!(
                "Unstaged {} change(s) for '{}' from changeset {}",
                removed.len(),
                element_id,
                id
            );
            Ok(removed)
        })
    }

    /// Overwrite the persisted form of an in-memory changeset.
    ///
    /// Stats are recounted from `changes`; sequence numbers are kept as given.
    pub fn save(&self, changeset: &mut Changeset) -> Result<()> {
        validate_id(&changeset.id)?;
        let path = self.changeset_path(&changeset.id);

        changeset.stats = ChangesetStats::from_changes(&changeset.changes);
        changeset.modified = Utc::now();

        let snapshot = &*changeset;
        self.locked(&path, || storage::write_json_atomic(&path, snapshot))
    }

    /// Change a changeset's status and persist it.
    pub fn set_status(&self, id: &str, status: ChangesetStatus) -> Result<Changeset> {
        validate_id(id)?;
        let path = self.changeset_path(id);

        self.locked(&path, || {
            let mut changeset = self.require(id)?;
            changeset.status = status;
            changeset.modified = Utc::now();
            storage::write_json_atomic(&path, &changeset)?;
            Ok(changeset)
        })
    }

    /// Every stored changeset, oldest first. Unreadable records are skipped.
    pub fn list(&self) -> Result<Vec<Changeset>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut changesets = Vec::new();
        for entry in WalkDir::new(&self.dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let id = match entry
                .file_name()
                .to_str()
                .and_then(|name| name.strip_suffix(".json"))
            {
                Some(id) if id != RESERVED_ID && validate_id(id).is_ok() => id.to_string(),
                _ => continue,
            };

            match self.load(&id) {
                Ok(Some(changeset)) => changesets.push(changeset),
                Ok(None) => {}
                Err(e) => warn!("Skipping changeset {}: {}", id, e),
            }
        }

        changesets.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
        Ok(changesets)
    }

    /// Delete a changeset record. Returns whether it existed.
    pub fn delete(&self, id: &str) -> Result<bool> {
        validate_id(id)?;
        let path = self.changeset_path(id);
        let removed = self.locked(&path, || storage::remove_if_exists(&path))?;
        if removed {
            info!("Deleted changeset {}", id);
        }
        Ok(removed)
    }

    /// Id recorded in the active pointer, if any.
    pub fn active_id(&self) -> Result<Option<String>> {
        let path = self.active_pointer_path();
        match storage::read_json_opt::<ActivePointer>(&path)? {
            None => Ok(None),
            Some(Ok(pointer)) => Ok(Some(pointer.changeset_id)),
            Some(Err(e)) => {
                warn!("Ignoring unreadable active changeset pointer: {}", e);
                Ok(None)
            }
        }
    }

    /// The active changeset. A pointer to a deleted changeset reads as none.
    pub fn get_active(&self) -> Result<Option<Changeset>> {
        let id = match self.active_id()? {
            Some(id) => id,
            None => return Ok(None),
        };
        let changeset = self.load(&id)?;
        if changeset.is_none() {
            warn!("Active changeset '{}' no longer exists", id);
        }
        Ok(changeset)
    }

    /// Point the active pointer at an existing changeset.
    pub fn set_active(&self, id: &str) -> Result<()> {
        if !self.exists(id)? {
            return Err(ArchError::ChangesetNotFound { id: id.to_string() });
        }
        let pointer = ActivePointer {
            changeset_id: id.to_string(),
            activated_at: Utc::now(),
        };
        let path = self.active_pointer_path();
        self.locked(&path, || storage::write_json_atomic(&path, &pointer))?;
        info!("Active changeset is now {}", id);
        Ok(())
    }

    /// Remove the active pointer. Returns whether one was set.
    pub fn clear_active(&self) -> Result<bool> {
        let path = self.active_pointer_path();
        self.locked(&path, || storage::remove_if_exists(&path))
    }

    /// Mark a changeset `staged` and make it the active one.
    pub fn stage(&self, id: &str) -> Result<Changeset> {
        let current = self.require(id)?;
        if matches!(
            current.status,
            ChangesetStatus::Applied | ChangesetStatus::Reverted
        ) {
            return Err(ArchError::InvalidChangesetStatus {
                id: id.to_string(),
                status: current.status.to_string(),
                expected: "draft or staged".to_string(),
            });
        }

        let changeset = self.set_status(id, ChangesetStatus::Staged)?;
        self.set_active(id)?;
        Ok(changeset)
    }

    fn locked<T, F>(&self, resource: &Path, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        FileLock::new(resource).with_lock(&self.lock_options, f)
    }
}

/// Changeset ids become file names: `[A-Za-z0-9._-]`, not starting with `.`.
fn validate_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id != RESERVED_ID
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));

    if valid {
        Ok(())
    } else {
        Err(ArchError::InvalidChangesetId { id: id.to_string() })
    }
}
