//! # assetkit
//!
//! Move a cross-referencing set of BI assets (connections, tables,
//! visualizations, dashboards) from one environment to another.
//!
//! An export reads a selection from a source environment, pulls in
//! whatever it references, masks secrets, escapes embedded templates and
//! writes a versioned [`Bundle`]. An import replays that bundle against a
//! target in dependency order, rendering operator variables, filling in
//! secrets and rewriting references to the target's own handles.
//!
//! ## Core Concepts
//!
//! - **Entity**: one typed record, addressed by a portable UUID and an
//!   environment-local handle
//! - **Bundle**: manifest plus one YAML file per entity
//! - **Closure**: everything reachable from a selection through references
//! - **Conflict policy**: what an import does when the UUID already exists
//!
//! ## Example
//!
//! ```no_run
//! use assetkit::{
//!     ConflictPolicy, Exporter, ExportOptions, Importer, ImportOptions, MemoryStore, Selection,
//! };
//!
//! let source = MemoryStore::new();
//! let target = MemoryStore::new();
//!
//! let export = Exporter::new(&source, ExportOptions::default())
//!     .export(&Selection::all())
//!     .expect("export failed");
//! export.bundle.write("bundle".as_ref(), false).expect("write failed");
//!
//! let options = ImportOptions {
//!     conflict_policy: ConflictPolicy::Skip,
//!     ..Default::default()
//! };
//! let report = Importer::new(&target, options)
//!     .import(&export.bundle)
//!     .expect("import failed");
//! assert!(report.is_success());
//! ```
//!
//! ## Collaborators
//!
//! The engine talks to the outside world only through traits:
//!
//! - [`RemoteStore`]: lists and writes entities of one environment
//! - [`CredentialSource`]: supplies secrets by logical key
//! - [`SecretPrompt`]: asks the operator, when running interactively
//! - [`ConnectionVerifier`]: checks a candidate secret before it is used

pub mod bundle;
pub mod cancel;
pub mod credentials;
pub mod entity;
pub mod error;
pub mod exporter;
pub mod importer;
pub mod report;
pub mod resolver;
pub mod retry;
pub mod store;
pub mod template;

// Re-export main types at crate root
pub use bundle::{Bundle, BundleEntry, ExternalReference, FORMAT_VERSION, Manifest};
pub use cancel::CancelToken;
pub use credentials::{
    ConnectionVerifier, CredentialResolver, CredentialSource, Secret, SecretPrompt, StaticSource,
    logical_key,
};
pub use entity::{Entity, EntityKind, Handle, Reference, SECRET_MASK, references_of};
pub use error::{Error, ErrorKind, ErrorScope, Result, StoreError};
pub use exporter::{Export, ExportOptions, Exporter, Selection};
pub use importer::{ConflictPolicy, ExternalReferencePolicy, ImportOptions, Importer};
pub use report::{
    EntityOutcome, EntityState, ExportReport, ImportReport, OutcomeCounts, Phase, SkipReason,
};
pub use resolver::{DependencyGraph, closure, topological_order};
pub use retry::RetryConfig;
pub use store::{EntityFilter, MemoryStore, RemoteStore, WriteRequest};
pub use template::{TemplateError, Variables};
