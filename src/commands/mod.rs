pub mod export;
pub mod import;
pub mod sync;
pub mod verify;

use crate::config::{self, EnvironmentConfig};
use crate::snapshot::SnapshotStore;
use anyhow::Result;
use std::collections::BTreeMap;
use std::path::Path;

/// Open an environment by name (local declarations first) or snapshot path.
pub fn open_environment(
    name_or_path: &str,
    local: &BTreeMap<String, EnvironmentConfig>,
    base: &Path,
) -> Result<SnapshotStore> {
    let (name, path) = config::resolve_environment(name_or_path, local, base)?;
    let store = SnapshotStore::open(&name, &path)?;
    log::debug!(
        "environment {} → {} ({} entities)",
        store.name(),
        store.path().display(),
        store.entity_count()
    );
    Ok(store)
}

/// Open an environment given on the command line.
pub fn open_cli_environment(name_or_path: &str) -> Result<SnapshotStore> {
    open_environment(name_or_path, &BTreeMap::new(), Path::new("."))
}

/// Pretty JSON on stdout
pub fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
