use assetkit::{ConflictPolicy, EntityKind, ExternalReferencePolicy};
use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ferry")]
#[command(author = "Alberto Cavalcante")]
#[command(version)]
#[command(about = "Move BI assets between environments as versioned bundles", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Export entities from an environment into a bundle directory
    Export(ExportArgs),

    /// Import a bundle directory into an environment
    Import(ImportArgs),

    /// Pull/push bundles as described by a sync folder
    #[command(subcommand)]
    Sync(SyncCommand),

    /// Check a bundle's layout, digest and references without importing it
    Verify {
        /// Bundle directory
        bundle: PathBuf,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

// ============================================================================
// Export
// ============================================================================

#[derive(Args)]
pub struct ExportArgs {
    /// Source environment name or snapshot file
    #[arg(short, long, env = "FERRY_SOURCE")]
    pub source: String,

    /// Bundle directory to write
    #[arg(short, long)]
    pub output: PathBuf,

    /// Kinds to select (repeatable); defaults to every kind
    #[arg(short, long = "kind", value_parser = parse_kind)]
    pub kinds: Vec<EntityKind>,

    #[command(flatten)]
    pub filter: FilterArgs,

    /// Export only the selection; references leaving it are recorded as external
    #[arg(long)]
    pub no_dependencies: bool,

    /// Concurrent list calls against the source
    #[arg(short, long, default_value = "4")]
    pub jobs: usize,

    /// Replace an existing bundle at the output path
    #[arg(long)]
    pub overwrite: bool,

    /// Print the export report as JSON
    #[arg(long)]
    pub json: bool,
}

/// Narrow the selected kinds; at most one filter applies.
#[derive(Args, Default)]
#[group(multiple = false)]
pub struct FilterArgs {
    /// Environment-local handles (comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub ids: Vec<u64>,

    /// Stable identifiers (comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub uuids: Vec<uuid::Uuid>,

    /// Entities listing this owner
    #[arg(long)]
    pub owner: Option<String>,

    /// Regex matched against display names
    #[arg(long)]
    pub pattern: Option<String>,
}

// ============================================================================
// Import
// ============================================================================

#[derive(Args)]
pub struct ImportArgs {
    /// Bundle directory to import
    pub bundle: PathBuf,

    /// Target environment name or snapshot file
    #[arg(short, long, env = "FERRY_TARGET")]
    pub target: String,

    #[command(flatten)]
    pub apply: ApplyArgs,

    /// Print the import report as JSON
    #[arg(long)]
    pub json: bool,
}

/// Options shared by `import` and `sync run`.
#[derive(Args, Clone, Default)]
pub struct ApplyArgs {
    /// What to do when an entity already exists at the target
    #[arg(long, value_parser = parse_conflict)]
    pub conflict: Option<ConflictPolicy>,

    /// Run every check, write nothing
    #[arg(long)]
    pub dry_run: bool,

    /// Template variable (repeatable)
    #[arg(long = "var", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub vars: Vec<(String, String)>,

    /// Secret for a masked field, keyed by kind/uuid/field or kind/name/field (repeatable)
    #[arg(long = "secret", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub secrets: Vec<(String, String)>,

    /// How to treat references the bundle left external
    #[arg(long, value_parser = parse_external, default_value = "reject")]
    pub external: ExternalReferencePolicy,

    /// Never prompt for secrets
    #[arg(long)]
    pub no_input: bool,

    /// Check that each connection endpoint is reachable before accepting its secret
    #[arg(long)]
    pub verify_connections: bool,
}

// ============================================================================
// Sync
// ============================================================================

#[derive(Subcommand)]
pub enum SyncCommand {
    /// Scaffold a sync folder with a sample sync_config.yml
    Create {
        /// Folder to create
        folder: PathBuf,

        /// Replace an existing sync_config.yml
        #[arg(long)]
        force: bool,
    },

    /// Export from the source, then import into every target
    Run {
        /// Sync folder
        folder: PathBuf,

        /// Only this target (repeatable)
        #[arg(short, long = "target")]
        targets: Vec<String>,

        /// Export only, do not import
        #[arg(long, conflicts_with = "push_only")]
        pull_only: bool,

        /// Import the existing bundle, do not export
        #[arg(long)]
        push_only: bool,

        #[command(flatten)]
        apply: ApplyArgs,

        /// Print reports as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check a sync folder's configuration
    Validate {
        /// Sync folder
        folder: PathBuf,
    },
}

// ============================================================================
// Value parsers
// ============================================================================

fn parse_kind(s: &str) -> Result<EntityKind, String> {
    s.parse()
}

fn parse_conflict(s: &str) -> Result<ConflictPolicy, String> {
    s.parse()
}

fn parse_external(s: &str) -> Result<ExternalReferencePolicy, String> {
    s.parse()
}

/// Parse `KEY=VALUE`; the value may itself contain `=`.
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{s}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in '{s}'"));
    }
    Ok((key.to_string(), value.to_string()))
}
