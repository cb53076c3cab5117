use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use schemars::{JsonSchema, schema_for};
use tracing::info;

use crate::{plugin::PluginManifest, wiring::WiringConfiguration};

pub const WIRING_SCHEMA: &str = "wiring-configuration.schema.json";
pub const MANIFEST_SCHEMA: &str = "plugin-manifest.schema.json";

/// Write the JSON schemas for the on-disk formats into `out_dir`.
/// Returns the written paths.
pub fn write_schemas(out_dir: &Path) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(out_dir)
        .with_context(|| format!("creating schema directory {}", out_dir.display()))?;

    let written = vec![
        write_one::<WiringConfiguration>(out_dir, WIRING_SCHEMA)?,
        write_one::<PluginManifest>(out_dir, MANIFEST_SCHEMA)?,
    ];
    info!(dir = %out_dir.display(), count = written.len(), "schemas written");
    Ok(written)
}

fn write_one<T: JsonSchema>(out_dir: &Path, file: &str) -> Result<PathBuf> {
    let schema = schema_for!(T);
    let path = out_dir.join(file);
    fs::write(&path, serde_json::to_string_pretty(&schema)?)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}
