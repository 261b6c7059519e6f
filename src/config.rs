use crate::paths;
use anyhow::{Context, Result, bail};
use assetkit::{ConflictPolicy, EntityFilter, EntityKind, Selection, Variables};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Sync folder configuration file
pub const SYNC_CONFIG_FILE: &str = "sync_config.yml";

/// Global environment registry, inside the config dir
pub const ENVIRONMENTS_FILE: &str = "environments.yaml";

fn default_true() -> bool {
    true
}

fn default_assets_folder() -> String {
    "assets".to_string()
}

// ============================================================================
// Environments
// ============================================================================

/// Where an environment's entities live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    /// Snapshot file, `~` expanded, relative to the file that declares it
    pub snapshot: String,
}

impl EnvironmentConfig {
    pub fn snapshot_path(&self, base: &Path) -> PathBuf {
        let path = paths::expand(&self.snapshot);
        if path.is_absolute() {
            path
        } else {
            base.join(path)
        }
    }
}

/// `environments.yaml` in the config dir.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvironmentsConfig {
    #[serde(default)]
    pub environments: BTreeMap<String, EnvironmentConfig>,
}

impl EnvironmentsConfig {
    /// Load the global registry; a missing file is an empty registry
    pub fn load() -> Result<(Self, PathBuf)> {
        let dir = paths::config_dir()?;
        let path = dir.join(ENVIRONMENTS_FILE);
        if !path.exists() {
            return Ok((Self::default(), dir));
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Could not read {}", path.display()))?;
        let config = serde_yaml::from_str(&content)
            .with_context(|| format!("Invalid {} format", path.display()))?;
        Ok((config, dir))
    }
}

/// Resolve an environment name or snapshot path to `(name, snapshot file)`.
///
/// Names declared in `local` (relative to `base`) win over the global
/// registry; anything else that looks like a YAML file is used as a path.
pub fn resolve_environment(
    name_or_path: &str,
    local: &BTreeMap<String, EnvironmentConfig>,
    base: &Path,
) -> Result<(String, PathBuf)> {
    if let Some(env) = local.get(name_or_path) {
        return Ok((name_or_path.to_string(), env.snapshot_path(base)));
    }

    let (global, dir) = EnvironmentsConfig::load()?;
    if let Some(env) = global.environments.get(name_or_path) {
        return Ok((name_or_path.to_string(), env.snapshot_path(&dir)));
    }

    let path = paths::expand(name_or_path);
    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml" | "yml")
    );
    if is_yaml || path.exists() {
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| name_or_path.to_string());
        return Ok((name, path));
    }

    bail!(
        "Unknown environment '{}'. Declare it under `environments` or pass a snapshot file.",
        name_or_path
    )
}

// ============================================================================
// Sync Config
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMode {
    All,
    Ids,
    Uuids,
    Owner,
    Pattern,
}

/// Which entities of one kind a sync pulls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetSelection {
    pub selection: SelectionMode,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ids: Vec<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uuids: Vec<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

impl AssetSelection {
    pub fn all() -> Self {
        Self {
            selection: SelectionMode::All,
            ids: Vec::new(),
            uuids: Vec::new(),
            owner: None,
            pattern: None,
        }
    }

    pub fn to_filter(&self) -> Result<EntityFilter> {
        Ok(match self.selection {
            SelectionMode::All => EntityFilter::All,
            SelectionMode::Ids => {
                if self.ids.is_empty() {
                    bail!("selection 'ids' needs a non-empty `ids` list");
                }
                EntityFilter::Handles(self.ids.iter().copied().collect())
            }
            SelectionMode::Uuids => {
                if self.uuids.is_empty() {
                    bail!("selection 'uuids' needs a non-empty `uuids` list");
                }
                EntityFilter::Uuids(self.uuids.iter().copied().collect())
            }
            SelectionMode::Owner => {
                let owner = self
                    .owner
                    .as_deref()
                    .context("selection 'owner' needs an `owner`")?;
                EntityFilter::Owner(owner.to_string())
            }
            SelectionMode::Pattern => {
                let pattern = self
                    .pattern
                    .as_deref()
                    .context("selection 'pattern' needs a `pattern`")?;
                let regex = Regex::new(pattern)
                    .with_context(|| format!("invalid pattern '{pattern}'"))?;
                EntityFilter::NamePattern(regex)
            }
        })
    }

    /// One-line description for summaries
    pub fn summary(&self) -> String {
        match self.selection {
            SelectionMode::All => "all".to_string(),
            SelectionMode::Ids => format!("{} ids", self.ids.len()),
            SelectionMode::Uuids => format!("{} uuids", self.uuids.len()),
            SelectionMode::Owner => format!("owner {}", self.owner.as_deref().unwrap_or("?")),
            SelectionMode::Pattern => {
                format!("pattern /{}/", self.pattern.as_deref().unwrap_or(""))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Environment name or snapshot file
    pub env: String,
    #[serde(default = "default_true")]
    pub include_dependencies: bool,
    /// Keyed by kind name (`dashboards`, `charts`, ...)
    #[serde(default)]
    pub assets: BTreeMap<String, AssetSelection>,
}

impl SourceConfig {
    /// Build the export selection; no assets means everything
    pub fn selection(&self) -> Result<Selection> {
        if self.assets.is_empty() {
            return Ok(Selection::all());
        }
        let mut selection = Selection::new();
        for (key, asset) in &self.assets {
            let kind: EntityKind = key.parse().map_err(anyhow::Error::msg)?;
            let filter = asset
                .to_filter()
                .with_context(|| format!("in source.assets.{key}"))?;
            selection = selection.with(kind, filter);
        }
        Ok(selection)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetDefaults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_policy: Option<ConflictPolicy>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetConfig {
    pub name: String,
    /// Environment name or snapshot file
    pub env: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_policy: Option<ConflictPolicy>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, String>,
}

impl TargetConfig {
    /// Target setting, then the defaults, then `fail`
    pub fn effective_conflict_policy(&self, defaults: &TargetDefaults) -> ConflictPolicy {
        self.conflict_policy
            .or(defaults.conflict_policy)
            .unwrap_or_default()
    }

    /// Default variables overlaid with the target's own
    pub fn effective_variables(&self, defaults: &TargetDefaults) -> Variables {
        let mut variables = defaults.variables.clone();
        variables.extend(self.variables.clone());
        variables
    }
}

/// `sync_config.yml`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    pub source: SourceConfig,
    #[serde(default)]
    pub target_defaults: TargetDefaults,
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environments: BTreeMap<String, EnvironmentConfig>,
    #[serde(default = "default_assets_folder")]
    pub assets_folder: String,
}

impl SyncConfig {
    pub fn load(folder: &Path) -> Result<Self> {
        let path = folder.join(SYNC_CONFIG_FILE);
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Could not read {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Invalid {} format", path.display()))
    }

    pub fn save(&self, folder: &Path) -> Result<()> {
        fs::create_dir_all(folder)?;
        let path = folder.join(SYNC_CONFIG_FILE);
        let content = serde_yaml::to_string(self)?;
        fs::write(&path, content)?;
        Ok(())
    }

    /// Starting point written by `ferry sync create`
    pub fn example() -> Self {
        let mut assets = BTreeMap::new();
        assets.insert("dashboards".to_string(), AssetSelection::all());

        let mut environments = BTreeMap::new();
        environments.insert(
            "dev".to_string(),
            EnvironmentConfig {
                snapshot: "environments/dev.yaml".to_string(),
            },
        );
        environments.insert(
            "prod".to_string(),
            EnvironmentConfig {
                snapshot: "environments/prod.yaml".to_string(),
            },
        );

        Self {
            source: SourceConfig {
                env: "dev".to_string(),
                include_dependencies: true,
                assets,
            },
            target_defaults: TargetDefaults {
                conflict_policy: Some(ConflictPolicy::Skip),
                variables: BTreeMap::new(),
            },
            targets: vec![TargetConfig {
                name: "production".to_string(),
                env: "prod".to_string(),
                conflict_policy: None,
                variables: BTreeMap::from([("env".to_string(), "prod".to_string())]),
            }],
            environments,
            assets_folder: default_assets_folder(),
        }
    }

    /// Bundle directory inside the sync folder
    pub fn assets_path(&self, folder: &Path) -> PathBuf {
        folder.join(paths::expand(&self.assets_folder))
    }

    pub fn target(&self, name: &str) -> Option<&TargetConfig> {
        self.targets.iter().find(|t| t.name == name)
    }

    /// The named targets, or every target when `names` is empty
    pub fn select_targets(&self, names: &[String]) -> Result<Vec<&TargetConfig>> {
        if names.is_empty() {
            return Ok(self.targets.iter().collect());
        }
        names
            .iter()
            .map(|name| {
                self.target(name).with_context(|| {
                    let known: Vec<&str> = self.targets.iter().map(|t| t.name.as_str()).collect();
                    format!("Unknown target '{}'. Known targets: {}", name, known.join(", "))
                })
            })
            .collect()
    }

    /// Every problem found, empty when the config is usable
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.source.env.trim().is_empty() {
            problems.push("source.env is empty".to_string());
        }
        for (key, asset) in &self.source.assets {
            if let Err(e) = key.parse::<EntityKind>() {
                problems.push(format!("source.assets.{key}: {e}"));
            }
            if let Err(e) = asset.to_filter() {
                problems.push(format!("source.assets.{key}: {e:#}"));
            }
        }

        if self.targets.is_empty() {
            problems.push("no targets configured".to_string());
        }
        let mut seen = BTreeSet::new();
        for target in &self.targets {
            if !seen.insert(target.name.as_str()) {
                problems.push(format!("duplicate target name '{}'", target.name));
            }
            if target.env == self.source.env {
                problems.push(format!(
                    "target '{}' points at the source environment",
                    target.name
                ));
            }
        }

        problems
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"
source:
  env: dev
  assets:
    dashboards:
      selection: ids
      ids: [7, 9]
    charts:
      selection: pattern
      pattern: "^Revenue"
target_defaults:
  conflict_policy: skip
  variables:
    env: staging
    region: eu
targets:
  - name: production
    env: prod
    conflict_policy: overwrite
    variables:
      env: prod
  - name: qa
    env: qa
environments:
  dev:
    snapshot: envs/dev.yaml
"#;

    #[test]
    fn test_parse_sample() {
        let config: SyncConfig = serde_yaml::from_str(SAMPLE).unwrap();
        assert_eq!(config.assets_folder, "assets");
        assert!(config.source.include_dependencies);
        assert_eq!(config.targets.len(), 2);
        assert!(config.validate().is_empty());

        let selection = config.source.selection().unwrap();
        let kinds: Vec<EntityKind> = selection.kinds().map(|(k, _)| k).collect();
        assert!(kinds.contains(&EntityKind::Dashboard));
        assert!(kinds.contains(&EntityKind::Visualization));
    }

    #[test]
    fn test_effective_target_settings() {
        let config: SyncConfig = serde_yaml::from_str(SAMPLE).unwrap();
        let prod = config.target("production").unwrap();
        let qa = config.target("qa").unwrap();

        assert_eq!(
            prod.effective_conflict_policy(&config.target_defaults),
            ConflictPolicy::Overwrite
        );
        assert_eq!(
            qa.effective_conflict_policy(&config.target_defaults),
            ConflictPolicy::Skip
        );

        let vars = prod.effective_variables(&config.target_defaults);
        assert_eq!(vars["env"], "prod");
        assert_eq!(vars["region"], "eu");
    }

    #[test]
    fn test_select_targets() {
        let config: SyncConfig = serde_yaml::from_str(SAMPLE).unwrap();
        assert_eq!(config.select_targets(&[]).unwrap().len(), 2);
        assert_eq!(
            config.select_targets(&["qa".to_string()]).unwrap()[0].name,
            "qa"
        );
        assert!(config.select_targets(&["nope".to_string()]).is_err());
    }

    #[test]
    fn test_validate_reports_problems() {
        let mut config = SyncConfig::example();
        config.targets.clear();
        config.source.assets.insert(
            "widgets".to_string(),
            AssetSelection {
                selection: SelectionMode::Owner,
                ..AssetSelection::all()
            },
        );
        let problems = config.validate();
        assert_eq!(problems.len(), 3, "{problems:?}");
    }

    #[test]
    fn test_example_round_trip() {
        let dir = TempDir::new().unwrap();
        let example = SyncConfig::example();
        example.save(dir.path()).unwrap();
        let loaded = SyncConfig::load(dir.path()).unwrap();
        assert_eq!(loaded, example);
        assert!(loaded.validate().is_empty());
    }

    #[test]
    fn test_resolve_local_environment() {
        let config: SyncConfig = serde_yaml::from_str(SAMPLE).unwrap();
        let base = Path::new("/srv/sync");
        let (name, path) = resolve_environment("dev", &config.environments, base).unwrap();
        assert_eq!(name, "dev");
        assert_eq!(path, PathBuf::from("/srv/sync/envs/dev.yaml"));
    }

    #[test]
    fn test_resolve_snapshot_path() {
        let (name, path) =
            resolve_environment("/tmp/ferry/staging.yaml", &BTreeMap::new(), Path::new("."))
                .unwrap();
        assert_eq!(name, "staging");
        assert_eq!(path, PathBuf::from("/tmp/ferry/staging.yaml"));
    }
}
