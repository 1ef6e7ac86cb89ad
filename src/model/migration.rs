//! Manifest schema migration.
//!
//! Upgrades `manifest.json` files written by older releases to the current
//! schema. Migrations run sequentially over the raw JSON before it is
//! deserialized, so each step only needs to understand its two neighbours.

use serde_json::{json, Map, Value};

use crate::error::{ArchError, Result};

/// Current schema version for manifest files.
pub const CURRENT_SCHEMA_VERSION: &str = "1.0.0";

/// Schema assumed for manifests that carry no version field.
const LEGACY_SCHEMA_VERSION: &str = "0.9.0";

type MigrationFn = fn(Value) -> Result<Value>;

/// Known versions in order, each paired with the step that upgrades it.
const MIGRATIONS: &[(&str, &str, MigrationFn)] = &[("0.9.0", "1.0.0", migrate_0_9_0_to_1_0_0)];

/// Migrate manifest JSON to [`CURRENT_SCHEMA_VERSION`].
///
/// # Errors
/// Returns `ArchError::InvalidSchemaVersion` if the version is not recognized,
/// which includes manifests written by a newer release.
pub fn migrate_manifest(mut data: Value) -> Result<Value> {
    let mut version = data
        .get("schemaVersion")
        .and_then(|v| v.as_str())
        .unwrap_or(LEGACY_SCHEMA_VERSION)
        .to_string();

    while version != CURRENT_SCHEMA_VERSION {
        let (_, to, migrate) = MIGRATIONS
            .iter()
            .find(|(from, _, _)| *from == version)
            .ok_or_else(|| ArchError::InvalidSchemaVersion {
                version: version.clone(),
            })?;

        log::info!("Migrating manifest schema {} -> {}", version, to);
        data = migrate(data)?;
        version = (*to).to_string();
    }

    Ok(data)
}

/// 0.9.0 stored `layers` as a plain `name -> path` map and had no layer
/// versions; 1.0.0 stores `{ path, version }` per layer.
fn migrate_0_9_0_to_1_0_0(mut data: Value) -> Result<Value> {
    let obj = data
        .as_object_mut()
        .ok_or_else(|| ArchError::MigrationError {
            from: "0.9.0".to_string(),
            to: "1.0.0".to_string(),
            reason: "manifest is not a JSON object".to_string(),
        })?;

    let legacy_layers = obj
        .remove("layers")
        .unwrap_or_else(|| Value::Object(Map::new()));

    let mut layers = Map::new();
    if let Value::Object(entries) = legacy_layers {
        for (name, path) in entries {
            let path = path.as_str().ok_or_else(|| ArchError::MigrationError {
                from: "0.9.0".to_string(),
                to: "1.0.0".to_string(),
                reason: format!("layer '{}' has a non-string path", name),
            })?;
            layers.insert(name, json!({ "path": path, "version": 0 }));
        }
    }

    obj.insert("layers".to_string(), Value::Object(layers));
    obj.insert(
        "schemaVersion".to_string(),
        Value::String("1.0.0".to_string()),
    );
    Ok(data)
}
