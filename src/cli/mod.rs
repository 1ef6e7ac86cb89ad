//! CLI Module
//!
//! Command-line interface for archstage.

pub mod commands;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use serde_json::Value;

use crate::model::LayerName;

/// archstage - stage, review and apply architecture model edits
#[derive(Parser, Debug)]
#[command(name = "archstage")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Model root directory
    #[arg(short, long, global = true, default_value = ".")]
    pub model: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create an empty model in the model directory
    Init {
        /// Model name (defaults to the directory name)
        #[arg(long)]
        name: Option<String>,
    },

    /// Add, update, delete or list elements
    #[command(subcommand)]
    Element(ElementCommand),

    /// Manage changesets
    #[command(subcommand)]
    Changeset(ChangesetCommand),

    /// Print the base model fingerprint
    Snapshot {
        /// Also check a changeset's compatibility with the model
        #[arg(long)]
        check: Option<String>,
    },

    /// Inspect or clean up lock markers
    #[command(subcommand)]
    Lock(LockCommand),
}

/// Element fields shared by `add` and `update`.
#[derive(Args, Debug, Default)]
pub struct ElementFields {
    /// Display name
    #[arg(long)]
    pub name: Option<String>,

    /// Description (an empty string clears it on update)
    #[arg(long)]
    pub description: Option<String>,

    /// Property as KEY=VALUE; VALUE is parsed as JSON when possible
    #[arg(short, long = "property", value_parser = parse_property)]
    pub properties: Vec<(String, Value)>,
}

#[derive(Subcommand, Debug)]
pub enum ElementCommand {
    /// Add an element to a layer
    Add {
        layer: LayerName,
        id: String,

        /// Element type, e.g. `service` or `component`
        #[arg(short = 't', long = "type")]
        element_type: String,

        #[command(flatten)]
        fields: ElementFields,
    },

    /// Update fields of an existing element
    Update {
        layer: LayerName,
        id: String,

        #[command(flatten)]
        fields: ElementFields,

        /// Remove a property by key
        #[arg(long = "remove-property")]
        remove_properties: Vec<String>,
    },

    /// Delete an element
    Delete { layer: LayerName, id: String },

    /// List elements, as seen through the active changeset
    List {
        /// Only this layer
        layer: Option<LayerName>,

        /// View through this changeset instead of the active one
        #[arg(long, conflicts_with = "base")]
        changeset: Option<String>,

        /// Ignore staged edits
        #[arg(long)]
        base: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum ChangesetCommand {
    /// Create a draft changeset against the current model
    Create {
        name: String,

        #[arg(long)]
        description: Option<String>,

        /// Explicit id (defaults to a generated one)
        #[arg(long)]
        id: Option<String>,
    },

    /// List changesets
    List,

    /// Show a changeset (defaults to the active one)
    Show { id: Option<String> },

    /// Mark a changeset staged and make it active
    Stage { id: String },

    /// Make a changeset the active one without changing its status
    Activate { id: String },

    /// Clear the active changeset
    Deactivate,

    /// Remove every staged change of an element
    Unstage {
        element_id: String,

        /// Changeset (defaults to the active one)
        #[arg(long)]
        changeset: Option<String>,
    },

    /// Show staged changes grouped by type
    Diff { id: Option<String> },

    /// Replay a changeset onto the base model
    Apply {
        id: Option<String>,

        /// Apply even when the compatibility check fails
        #[arg(long)]
        force: bool,
    },

    /// Undo an applied changeset
    Revert { id: String },

    /// Delete a changeset
    Discard { id: String },

    /// Write a changeset to a file
    Export { id: String, output: PathBuf },

    /// Import a changeset file as a new draft
    Import {
        input: PathBuf,

        /// Import even when the compatibility check fails
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum LockCommand {
    /// List lock markers under the model root
    Status,

    /// Remove stale lock markers
    Cleanup {
        /// Remove every marker, stale or not
        #[arg(long)]
        force: bool,
    },
}

/// Parse `KEY=VALUE`, reading VALUE as JSON and falling back to a string.
fn parse_property(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", raw))?;
    if key.is_empty() {
        return Err(format!("empty property key in '{}'", raw));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}
