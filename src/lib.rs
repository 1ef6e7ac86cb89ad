//! archstage - Changeset Staging for Architecture Models
//!
//! An architecture model is a set of named layers holding typed elements,
//! persisted as JSON under a model root. This crate lets edits be collected
//! in named changesets instead of being written straight to the model:
//!
//! - The base model stays byte-for-byte untouched while a changeset is staged
//! - Reads go through a cached projection of base plus staged edits
//! - Changesets can be applied, reverted, discarded, exported and imported
//! - Cross-process exclusion uses lock marker files next to each resource

pub mod cli;
pub mod config;
pub mod error;
pub mod lock;
pub mod model;
pub mod staging;
pub mod storage;

pub use error::{ArchError, Result};
