//! Staging
//!
//! Changesets record element edits against a fingerprinted base model without
//! touching the model's files. Reads see a projection of base plus staged
//! edits; applying a changeset materializes it.

pub mod changeset;
pub mod interceptor;
pub mod lifecycle;
pub mod projection;
pub mod snapshot;
pub mod store;

pub use changeset::{Change, ChangeKind, ChangeOp, Changeset, ChangesetStats, ChangesetStatus};
pub use interceptor::{MutationOutcome, StagingInterceptor};
pub use lifecycle::{
    apply_changeset, discard_changeset, export_changeset, import_changeset, revert_changeset,
    LifecycleReport,
};
pub use projection::{replay, CacheMetrics, ChangesetDiff, ProjectedModel, ProjectionEngine};
pub use snapshot::{capture_snapshot, validate_compatibility, CompatibilityReport};
pub use store::{ActivePointer, ChangesetStore};
