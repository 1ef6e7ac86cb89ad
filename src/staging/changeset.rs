//! Changeset and change log entry types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{Element, ElementPatch, LayerName};

/// The kind of a change, without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Add,
    Update,
    Delete,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Add => write!(f, "add"),
            ChangeKind::Update => write!(f, "update"),
            ChangeKind::Delete => write!(f, "delete"),
        }
    }
}

/// Payload of a change. Each variant carries exactly the state replay needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChangeOp {
    Add {
        after: Element,
    },
    Update {
        before: ElementPatch,
        after: ElementPatch,
    },
    Delete {
        before: Element,
    },
}

impl ChangeOp {
    pub fn kind(&self) -> ChangeKind {
        match self {
            ChangeOp::Add { .. } => ChangeKind::Add,
            ChangeOp::Update { .. } => ChangeKind::Update,
            ChangeOp::Delete { .. } => ChangeKind::Delete,
        }
    }

    /// The op that undoes this one.
    pub fn inverse(&self) -> ChangeOp {
        match self {
            ChangeOp::Add { after } => ChangeOp::Delete {
                before: after.clone(),
            },
            ChangeOp::Update { before, after } => ChangeOp::Update {
                before: after.clone(),
                after: before.clone(),
            },
            ChangeOp::Delete { before } => ChangeOp::Add {
                after: before.clone(),
            },
        }
    }
}

/// An immutable entry in a changeset's change log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    pub element_id: String,

    pub layer_name: LayerName,

    /// Position in the changeset; dense from 0.
    pub sequence_number: u64,

    pub timestamp: DateTime<Utc>,

    #[serde(flatten)]
    pub op: ChangeOp,
}

impl Change {
    /// A change not yet appended to a log; the store assigns the sequence number.
    pub fn new(layer_name: LayerName, element_id: impl Into<String>, op: ChangeOp) -> Self {
        Self {
            element_id: element_id.into(),
            layer_name,
            sequence_number: 0,
            timestamp: Utc::now(),
            op,
        }
    }

    pub fn add(layer_name: LayerName, element: Element) -> Self {
        Self::new(layer_name, element.id.clone(), ChangeOp::Add { after: element })
    }

    pub fn update(
        layer_name: LayerName,
        element_id: impl Into<String>,
        before: ElementPatch,
        after: ElementPatch,
    ) -> Self {
        Self::new(layer_name, element_id, ChangeOp::Update { before, after })
    }

    pub fn delete(layer_name: LayerName, element: Element) -> Self {
        Self::new(layer_name, element.id.clone(), ChangeOp::Delete { before: element })
    }

    pub fn kind(&self) -> ChangeKind {
        self.op.kind()
    }
}

/// Lifecycle status of a changeset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangesetStatus {
    Draft,
    Staged,
    Applied,
    Reverted,
}

impl fmt::Display for ChangesetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangesetStatus::Draft => write!(f, "draft"),
            ChangesetStatus::Staged => write!(f, "staged"),
            ChangesetStatus::Applied => write!(f, "applied"),
            ChangesetStatus::Reverted => write!(f, "reverted"),
        }
    }
}

/// Per-type change counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangesetStats {
    pub additions: usize,
    pub modifications: usize,
    pub deletions: usize,
}

impl ChangesetStats {
    pub fn record(&mut self, kind: ChangeKind) {
        match kind {
            ChangeKind::Add => self.additions += 1,
            ChangeKind::Update => self.modifications += 1,
            ChangeKind::Delete => self.deletions += 1,
        }
    }

    pub fn from_changes(changes: &[Change]) -> Self {
        let mut stats = Self::default();
        for change in changes {
            stats.record(change.kind());
        }
        stats
    }

    pub fn total(&self) -> usize {
        self.additions + self.modifications + self.deletions
    }
}

/// A named, ordered collection of pending edits against a base snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Changeset {
    pub id: String,

    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub created: DateTime<Utc>,

    pub modified: DateTime<Utc>,

    pub status: ChangesetStatus,

    /// Fingerprint of the base model when the changeset was created.
    pub base_snapshot: String,

    #[serde(default)]
    pub changes: Vec<Change>,

    #[serde(default)]
    pub stats: ChangesetStats,
}

impl Changeset {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        description: Option<String>,
        base_snapshot: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            description,
            created: now,
            modified: now,
            status: ChangesetStatus::Draft,
            base_snapshot: base_snapshot.into(),
            changes: Vec::new(),
            stats: ChangesetStats::default(),
        }
    }

    /// Append a change with the next sequence number and count it in `stats`.
    pub fn push_change(&mut self, mut change: Change) -> &Change {
        change.sequence_number = self.changes.len() as u64;
        self.stats.record(change.kind());
        self.changes.push(change);
        &self.changes[self.changes.len() - 1]
    }

    /// Re-issue sequence numbers `0..n-1` in current order and recount stats.
    pub fn resequence(&mut self) {
        self.changes.sort_by_key(|c| c.sequence_number);
        for (index, change) in self.changes.iter_mut().enumerate() {
            change.sequence_number = index as u64;
        }
        self.stats = ChangesetStats::from_changes(&self.changes);
    }

    /// Changes for one layer, in sequence order.
    pub fn changes_for_layer(&self, layer: LayerName) -> Vec<&Change> {
        let mut changes: Vec<&Change> = self
            .changes
            .iter()
            .filter(|c| c.layer_name == layer)
            .collect();
        changes.sort_by_key(|c| c.sequence_number);
        changes
    }

    /// Layers with at least one change, in canonical order.
    pub fn touched_layers(&self) -> Vec<LayerName> {
        LayerName::ALL
            .iter()
            .copied()
            .filter(|layer| self.changes.iter().any(|c| c.layer_name == *layer))
            .collect()
    }

    pub fn is_staged(&self) -> bool {
        self.status == ChangesetStatus::Staged
    }
}
