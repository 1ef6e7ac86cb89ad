//! archstage CLI
//!
//! Command-line interface for staging architecture model edits.

use std::process;

use clap::Parser;
use env_logger::Env;
use log::debug;

use archstage::cli::commands;
use archstage::cli::{ChangesetCommand, Cli, Commands, ElementCommand, LockCommand};
use archstage::ArchError;

fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(default_filter)).init();

    debug!("archstage v{}", env!("CARGO_PKG_VERSION"));

    if let Err(err) = run(cli) {
        eprintln!("Error: {:#}", err);
        if let Some(hint) = err
            .downcast_ref::<ArchError>()
            .and_then(ArchError::recovery_suggestion)
        {
            eprintln!("Hint: {}", hint);
        }
        process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let root = cli.model.as_path();

    match cli.command {
        Commands::Init { name } => commands::init(root, name.as_deref())?,
        Commands::Element(cmd) => handle_element(root, cmd)?,
        Commands::Changeset(cmd) => handle_changeset(root, cmd)?,
        Commands::Snapshot { check } => commands::snapshot(root, check.as_deref())?,
        Commands::Lock(LockCommand::Status) => commands::lock_status(root)?,
        Commands::Lock(LockCommand::Cleanup { force }) => commands::lock_cleanup(root, force)?,
    }
    Ok(())
}

fn handle_element(root: &std::path::Path, cmd: ElementCommand) -> archstage::Result<()> {
    match cmd {
        ElementCommand::Add {
            layer,
            id,
            element_type,
            fields,
        } => commands::element_add(root, layer, &id, &element_type, fields),
        ElementCommand::Update {
            layer,
            id,
            fields,
            remove_properties,
        } => commands::element_update(root, layer, &id, fields, remove_properties),
        ElementCommand::Delete { layer, id } => commands::element_delete(root, layer, &id),
        ElementCommand::List {
            layer,
            changeset,
            base,
        } => commands::element_list(root, layer, changeset.as_deref(), base),
    }
}

fn handle_changeset(root: &std::path::Path, cmd: ChangesetCommand) -> archstage::Result<()> {
    match cmd {
        ChangesetCommand::Create {
            name,
            description,
            id,
        } => commands::changeset_create(root, &name, description, id.as_deref()),
        ChangesetCommand::List => commands::changeset_list(root),
        ChangesetCommand::Show { id } => commands::changeset_show(root, id.as_deref()),
        ChangesetCommand::Stage { id } => commands::changeset_stage(root, &id),
        ChangesetCommand::Activate { id } => commands::changeset_activate(root, &id),
        ChangesetCommand::Deactivate => commands::changeset_deactivate(root),
        ChangesetCommand::Unstage {
            element_id,
            changeset,
        } => commands::changeset_unstage(root, &element_id, changeset.as_deref()),
        ChangesetCommand::Diff { id } => commands::changeset_diff(root, id.as_deref()),
        ChangesetCommand::Apply { id, force } => {
            commands::changeset_apply(root, id.as_deref(), force)
        }
        ChangesetCommand::Revert { id } => commands::changeset_revert(root, &id),
        ChangesetCommand::Discard { id } => commands::changeset_discard(root, &id),
        ChangesetCommand::Export { id, output } => commands::changeset_export(root, &id, &output),
        ChangesetCommand::Import { input, force } => {
            commands::changeset_import(root, &input, force)
        }
    }
}
