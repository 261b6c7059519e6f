//! Bundle format
//!
//! A bundle is a directory:
//!
//! ```text
//! <root>/
//!   manifest.yaml            # format_version, source_env, exported_at, digest
//!   connections/<uuid>.yaml
//!   tables/<uuid>.yaml
//!   visualizations/<uuid>.yaml
//!   dashboards/<uuid>.yaml
//! ```
//!
//! Operators may drop a `<uuid>.overrides.yaml` mapping next to any entity
//! file. It is deep-merged into the rendered payload at import time and is
//! not covered by the digest.

use crate::entity::{Entity, EntityKind, Reference};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;
use walkdir::WalkDir;

/// Format written by this version.
pub const FORMAT_VERSION: &str = "1.0.0";

pub const MANIFEST_FILE: &str = "manifest.yaml";

const ENTITY_SUFFIX: &str = ".yaml";
const OVERRIDES_SUFFIX: &str = ".overrides.yaml";

/// A reference that leaves the bundle on purpose (export without dependencies).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExternalReference {
    /// The bundled entity holding the reference
    pub from: Uuid,
    pub kind: EntityKind,
    pub uuid: Uuid,
}

/// Contents of `manifest.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: String,
    pub source_env: String,
    pub exported_at: DateTime<Utc>,
    pub digest: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub external: Vec<ExternalReference>,
}

/// One entity file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleEntry {
    pub uuid: Uuid,
    pub kind: EntityKind,
    pub name: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(default)]
    pub references: Vec<Reference>,
    /// Operator overrides read from `<uuid>.overrides.yaml`
    #[serde(skip)]
    pub overrides: Option<Map<String, Value>>,
}

impl BundleEntry {
    /// Build an entry; references are stored sorted.
    pub fn new(entity: Entity, references: BTreeSet<Reference>) -> Self {
        Self {
            uuid: entity.uuid,
            kind: entity.kind,
            name: entity.name,
            payload: entity.payload,
            references: references.into_iter().collect(),
            overrides: None,
        }
    }

    /// The entity as stored (escaped, no handle)
    pub fn to_entity(&self) -> Entity {
        Entity::with_uuid(self.uuid, self.kind, &self.name, self.payload.clone())
    }

    /// Relative path inside the bundle
    pub fn relative_path(&self) -> PathBuf {
        Path::new(self.kind.dir_name()).join(format!("{}{ENTITY_SUFFIX}", self.uuid))
    }
}

/// A versioned set of entities plus its manifest.
#[derive(Debug, Clone)]
pub struct Bundle {
    pub manifest: Manifest,
    entries: Vec<BundleEntry>,
}

impl Bundle {
    /// Assemble a bundle, stamping the export time and digest.
    pub fn new(
        source_env: impl Into<String>,
        entries: Vec<BundleEntry>,
        mut external: Vec<ExternalReference>,
    ) -> Self {
        external.sort();
        external.dedup();
        let digest = digest_entries(&entries);
        Self {
            manifest: Manifest {
                format_version: FORMAT_VERSION.to_string(),
                source_env: source_env.into(),
                exported_at: Utc::now(),
                digest,
                external,
            },
            entries,
        }
    }

    /// Entries in stored order
    pub fn entries(&self) -> &[BundleEntry] {
        &self.entries
    }

    pub fn entries_of(&self, kind: EntityKind) -> impl Iterator<Item = &BundleEntry> {
        self.entries.iter().filter(move |e| e.kind == kind)
    }

    pub fn get(&self, uuid: &Uuid) -> Option<&BundleEntry> {
        self.entries.iter().find(|e| e.uuid == *uuid)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn count(&self, kind: EntityKind) -> usize {
        self.entries_of(kind).count()
    }

    /// Whether `from → to` was recorded as an external reference
    pub fn is_external(&self, from: Uuid, to: Uuid) -> bool {
        self.manifest
            .external
            .iter()
            .any(|x| x.from == from && x.uuid == to)
    }

    /// Digest over the entries as they are now
    pub fn compute_digest(&self) -> String {
        digest_entries(&self.entries)
    }

    /// Fail with `DigestMismatch` unless entries match the manifest digest
    pub fn verify_digest(&self) -> Result<()> {
        let actual = self.compute_digest();
        if actual == self.manifest.digest {
            Ok(())
        } else {
            Err(Error::DigestMismatch {
                expected: self.manifest.digest.clone(),
                actual,
            })
        }
    }

    /// Write the bundle under `root`.
    ///
    /// An existing bundle is only replaced when `overwrite` is set; stale
    /// entity files are removed, operator override files are kept. The
    /// manifest is written last, so an interrupted write leaves no
    /// readable bundle behind.
    pub fn write(&self, root: &Path, overwrite: bool) -> Result<Vec<PathBuf>> {
        let manifest_path = root.join(MANIFEST_FILE);
        if manifest_path.exists() {
            if !overwrite {
                return Err(Error::invalid_archive(
                    root,
                    "a bundle already exists here (use overwrite to replace it)",
                ));
            }
            remove_entity_files(root)?;
        }

        let mut written = Vec::with_capacity(self.entries.len() + 1);
        for kind in EntityKind::ALL {
            fs::create_dir_all(root.join(kind.dir_name()))?;
        }
        for entry in &self.entries {
            let path = root.join(entry.relative_path());
            write_yaml(&path, entry)?;
            written.push(path);
        }
        write_yaml(&manifest_path, &self.manifest)?;
        written.push(manifest_path);

        log::info!(
            "wrote bundle with {} entities to {}",
            self.entries.len(),
            root.display()
        );
        Ok(written)
    }

    /// Read a bundle directory, including operator override files.
    pub fn read(root: &Path) -> Result<Self> {
        let manifest_path = root.join(MANIFEST_FILE);
        if !manifest_path.is_file() {
            return Err(Error::invalid_archive(root, "missing manifest.yaml"));
        }
        let manifest: Manifest = read_yaml(&manifest_path)?;
        check_format_version(&manifest.format_version)?;

        let mut entries = Vec::new();
        let mut overrides = Vec::new();
        for (kind, path, file_name) in entity_files(root) {
            if let Some(stem) = file_name.strip_suffix(OVERRIDES_SUFFIX) {
                let uuid = parse_stem(&path, stem)?;
                let map: Map<String, Value> = read_yaml(&path)?;
                overrides.push((uuid, map));
                continue;
            }
            let Some(stem) = file_name.strip_suffix(ENTITY_SUFFIX) else {
                continue;
            };
            let uuid = parse_stem(&path, stem)?;
            let entry: BundleEntry = read_yaml(&path)?;
            if entry.uuid != uuid || entry.kind != kind {
                return Err(Error::invalid_archive(
                    &path,
                    format!(
                        "file holds {} {} but its location says {kind} {uuid}",
                        entry.kind, entry.uuid
                    ),
                ));
            }
            entries.push(entry);
        }

        for (uuid, map) in overrides {
            match entries.iter_mut().find(|e| e.uuid == uuid) {
                Some(entry) => entry.overrides = Some(map),
                None => log::warn!("ignoring overrides for {uuid}: no such entity in bundle"),
            }
        }

        entries.sort_by(|a, b| (a.kind, a.uuid).cmp(&(b.kind, b.uuid)));
        log::debug!(
            "read bundle with {} entities from {}",
            entries.len(),
            root.display()
        );
        Ok(Self { manifest, entries })
    }
}

/// Recompute the digest by re-scanning the entity files under `root`.
pub fn rescan_digest(root: &Path) -> Result<String> {
    let mut entries = Vec::new();
    for (_, path, file_name) in entity_files(root) {
        if file_name.ends_with(OVERRIDES_SUFFIX) || !file_name.ends_with(ENTITY_SUFFIX) {
            continue;
        }
        let entry: BundleEntry = read_yaml(&path)?;
        entries.push(entry);
    }
    Ok(digest_entries(&entries))
}

/// Stable blake3 digest over sorted `(uuid, sorted(references))` pairs.
pub fn digest<I>(edges: I) -> String
where
    I: IntoIterator<Item = (Uuid, Vec<Uuid>)>,
{
    let mut lines: Vec<String> = edges
        .into_iter()
        .map(|(uuid, mut refs)| {
            refs.sort();
            refs.dedup();
            let refs: Vec<String> = refs.iter().map(ToString::to_string).collect();
            format!("{uuid}:{}\n", refs.join(","))
        })
        .collect();
    lines.sort();

    let mut hasher = blake3::Hasher::new();
    for line in &lines {
        hasher.update(line.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

fn digest_entries(entries: &[BundleEntry]) -> String {
    digest(
        entries
            .iter()
            .map(|e| (e.uuid, e.references.iter().map(|r| r.uuid).collect())),
    )
}

/// Recursively merge `overlay` into `base`; non-mapping values replace.
pub fn deep_merge(base: &mut Map<String, Value>, overlay: Map<String, Value>) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                deep_merge(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Fail with `UnsupportedFormat` unless `version` shares our major version
pub fn check_format_version(version: &str) -> Result<()> {
    let supported_major = FORMAT_VERSION.split('.').next();
    if version.split('.').next() == supported_major {
        Ok(())
    } else {
        Err(Error::UnsupportedFormat {
            version: version.to_string(),
        })
    }
}

/// `(kind, path, file name)` for every file directly inside a kind directory
fn entity_files(root: &Path) -> Vec<(EntityKind, PathBuf, String)> {
    let mut files = Vec::new();
    for kind in EntityKind::ALL {
        let dir = root.join(kind.dir_name());
        if !dir.is_dir() {
            continue;
        }
        for entry in WalkDir::new(&dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().to_string();
            if file_name.starts_with('.') {
                continue;
            }
            files.push((kind, entry.into_path(), file_name));
        }
    }
    files
}

fn remove_entity_files(root: &Path) -> Result<()> {
    for (_, path, file_name) in entity_files(root) {
        if file_name.ends_with(ENTITY_SUFFIX) && !file_name.ends_with(OVERRIDES_SUFFIX) {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

fn parse_stem(path: &Path, stem: &str) -> Result<Uuid> {
    Uuid::parse_str(stem)
        .map_err(|_| Error::invalid_archive(path, "file name is not <uuid>.yaml"))
}

fn read_yaml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)?;
    serde_yaml::from_str(&content).map_err(|source| Error::Yaml {
        path: path.to_path_buf(),
        source,
    })
}

fn write_yaml<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_yaml::to_string(value).map_err(|source| Error::Yaml {
        path: path.to_path_buf(),
        source,
    })?;
    fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template;
    use serde_json::json;
    use tempfile::TempDir;

    fn entry(kind: EntityKind, name: &str, payload: Value, refs: &[Reference]) -> BundleEntry {
        let entity = Entity::new(kind, name, payload.as_object().cloned().unwrap_or_default());
        BundleEntry::new(entity, refs.iter().copied().collect())
    }

    fn sample() -> Bundle {
        let conn = entry(
            EntityKind::Connection,
            "warehouse",
            json!({ "uri": "postgresql://etl@db/warehouse", "password": "XXXXXXXXXX" }),
            &[],
        );
        let table = entry(
            EntityKind::Table,
            "orders",
            json!({
                "connection_uuid": conn.uuid.to_string(),
                "sql": template::escape("SELECT * FROM {{ schema }}.orders").unwrap(),
            }),
            &[Reference {
                kind: EntityKind::Connection,
                uuid: conn.uuid,
            }],
        );
        Bundle::new("dev", vec![conn, table], Vec::new())
    }

    #[test]
    fn test_write_read_round_trip() {
        let dir = TempDir::new().unwrap();
        let bundle = sample();
        let written = bundle.write(dir.path(), false).unwrap();
        assert_eq!(written.len(), 3);
        assert!(dir.path().join(MANIFEST_FILE).is_file());
        assert!(dir.path().join("dashboards").is_dir());

        let read = Bundle::read(dir.path()).unwrap();
        assert_eq!(read.manifest, bundle.manifest);
        assert_eq!(read.len(), 2);
        for original in bundle.entries() {
            assert_eq!(read.get(&original.uuid), Some(original));
        }
        read.verify_digest().unwrap();
    }

    #[test]
    fn test_entity_file_layout() {
        let dir = TempDir::new().unwrap();
        let bundle = sample();
        bundle.write(dir.path(), false).unwrap();

        let table = bundle.entries_of(EntityKind::Table).next().unwrap();
        let path = dir.path().join("tables").join(format!("{}.yaml", table.uuid));
        let content = fs::read_to_string(path).unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&content).unwrap();
        for key in ["uuid", "kind", "name", "payload", "references"] {
            assert!(doc.get(key).is_some(), "missing key {key}");
        }
        assert!(!content.contains("{{"));
    }

    #[test]
    fn test_rescan_digest_matches_manifest() {
        let dir = TempDir::new().unwrap();
        let bundle = sample();
        bundle.write(dir.path(), false).unwrap();
        assert_eq!(rescan_digest(dir.path()).unwrap(), bundle.manifest.digest);
    }

    #[test]
    fn test_tampered_references_change_digest() {
        let dir = TempDir::new().unwrap();
        let bundle = sample();
        bundle.write(dir.path(), false).unwrap();

        let table = bundle.entries_of(EntityKind::Table).next().unwrap();
        let mut edited = table.clone();
        edited.references.push(Reference {
            kind: EntityKind::Connection,
            uuid: Uuid::new_v4(),
        });
        write_yaml(&dir.path().join(table.relative_path()), &edited).unwrap();

        assert_ne!(rescan_digest(dir.path()).unwrap(), bundle.manifest.digest);
        let read = Bundle::read(dir.path()).unwrap();
        assert!(matches!(
            read.verify_digest(),
            Err(Error::DigestMismatch { .. })
        ));
    }

    #[test]
    fn test_digest_ignores_order() {
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);
        let c = Uuid::from_u128(3);
        assert_eq!(
            digest([(a, vec![b, c]), (b, vec![])]),
            digest([(b, vec![]), (a, vec![c, b])])
        );
        assert_ne!(digest([(a, vec![b])]), digest([(a, vec![c])]));
    }

    #[test]
    fn test_refuses_to_clobber_without_overwrite() {
        let dir = TempDir::new().unwrap();
        let bundle = sample();
        bundle.write(dir.path(), false).unwrap();
        assert!(matches!(
            bundle.write(dir.path(), false),
            Err(Error::InvalidArchive { .. })
        ));
    }

    #[test]
    fn test_overwrite_keeps_overrides_and_drops_stale_entities() {
        let dir = TempDir::new().unwrap();
        let bundle = sample();
        bundle.write(dir.path(), false).unwrap();

        let table = bundle.entries_of(EntityKind::Table).next().unwrap();
        let overrides_path = dir
            .path()
            .join("tables")
            .join(format!("{}.overrides.yaml", table.uuid));
        fs::write(&overrides_path, "cache_timeout: 60\n").unwrap();

        let conn_only: Vec<BundleEntry> = bundle
            .entries_of(EntityKind::Connection)
            .cloned()
            .collect();
        Bundle::new("dev", conn_only, Vec::new())
            .write(dir.path(), true)
            .unwrap();

        assert!(overrides_path.exists());
        assert!(!dir.path().join(table.relative_path()).exists());
        let read = Bundle::read(dir.path()).unwrap();
        assert_eq!(read.len(), 1);
    }

    #[test]
    fn test_overrides_attached_on_read() {
        let dir = TempDir::new().unwrap();
        let bundle = sample();
        bundle.write(dir.path(), false).unwrap();
        let table = bundle.entries_of(EntityKind::Table).next().unwrap();
        fs::write(
            dir.path()
                .join("tables")
                .join(format!("{}.overrides.yaml", table.uuid)),
            "extra:\n  owner: \"{{ team }}\"\n",
        )
        .unwrap();

        let read = Bundle::read(dir.path()).unwrap();
        let overrides = read.get(&table.uuid).unwrap().overrides.clone().unwrap();
        assert_eq!(overrides["extra"]["owner"], json!("{{ team }}"));
        read.verify_digest().unwrap();
    }

    #[test]
    fn test_unsupported_format_version() {
        let dir = TempDir::new().unwrap();
        let mut bundle = sample();
        bundle.manifest.format_version = "2.0.0".into();
        bundle.write(dir.path(), false).unwrap();
        assert!(matches!(
            Bundle::read(dir.path()),
            Err(Error::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn test_misplaced_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let bundle = sample();
        bundle.write(dir.path(), false).unwrap();
        let conn = bundle.entries_of(EntityKind::Connection).next().unwrap();
        fs::rename(
            dir.path().join(conn.relative_path()),
            dir.path().join("tables").join(format!("{}.yaml", conn.uuid)),
        )
        .unwrap();
        assert!(matches!(
            Bundle::read(dir.path()),
            Err(Error::InvalidArchive { .. })
        ));
    }

    #[test]
    fn test_deep_merge() {
        let mut base = json!({ "a": 1, "nested": { "x": 1, "y": 2 } })
            .as_object()
            .cloned()
            .unwrap();
        let overlay = json!({ "nested": { "y": 3 }, "b": true })
            .as_object()
            .cloned()
            .unwrap();
        deep_merge(&mut base, overlay);
        assert_eq!(
            Value::Object(base),
            json!({ "a": 1, "b": true, "nested": { "x": 1, "y": 3 } })
        );
    }
}
