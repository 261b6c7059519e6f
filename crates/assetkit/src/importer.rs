//! Importer
//!
//! Replays a bundle against a target environment. The run is split into
//! a pre-flight that checks the bundle as a whole and a strictly sequential
//! per-entity pass in dependency order:
//!
//! ```text
//! pending → validated → rendered → credentialed → created | updated | skipped | failed
//! ```
//!
//! Pre-flight failures abort before anything is written. Per-entity
//! failures are recorded and only take the entity's dependents down with
//! them.

use crate::bundle::{Bundle, BundleEntry, check_format_version, deep_merge};
use crate::cancel::CancelToken;
use crate::credentials::CredentialResolver;
use crate::entity::{Entity, Handle, Reference, references_of, rewrite_references};
use crate::error::{Error, ErrorKind, Result, StoreError};
use crate::report::{EntityOutcome, EntityState, ImportReport, Phase, ReportedError, SkipReason};
use crate::resolver::DependencyGraph;
use crate::retry::{LogCallback, RetryConfig, with_retry};
use crate::store::{RemoteStore, WriteRequest};
use crate::template::{self, TemplateError, Variables};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// What to do when the target already holds an entity's stable identifier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Update the existing entity in place
    Overwrite,
    /// Leave the existing entity alone
    Skip,
    /// Stop the run
    #[default]
    Fail,
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Overwrite => "overwrite",
            Self::Skip => "skip",
            Self::Fail => "fail",
        })
    }
}

impl FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "overwrite" => Ok(Self::Overwrite),
            "skip" => Ok(Self::Skip),
            "fail" => Ok(Self::Fail),
            _ => Err(format!(
                "unknown conflict policy '{s}' (expected overwrite, skip or fail)"
            )),
        }
    }
}

/// What to do with references a bundle deliberately leaves external.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalReferencePolicy {
    /// Refuse the bundle before writing anything
    #[default]
    Reject,
    /// Skip entities holding an external reference
    SkipEntity,
    /// Expect the referenced entity to already exist at the target
    ResolveAtTarget,
}

impl fmt::Display for ExternalReferencePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Reject => "reject",
            Self::SkipEntity => "skip",
            Self::ResolveAtTarget => "resolve",
        })
    }
}

impl FromStr for ExternalReferencePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "reject" => Ok(Self::Reject),
            "skip" | "skip_entity" => Ok(Self::SkipEntity),
            "resolve" | "resolve_at_target" => Ok(Self::ResolveAtTarget),
            _ => Err(format!(
                "unknown external reference policy '{s}' (expected reject, skip or resolve)"
            )),
        }
    }
}

/// Import settings.
#[derive(Debug, Clone)]
pub struct ImportOptions {
    /// Name of the target, for the report
    pub target_env: String,
    pub conflict_policy: ConflictPolicy,
    /// Run every check but issue no writes
    pub dry_run: bool,
    /// Values for operator placeholders
    pub variables: Variables,
    pub external_policy: ExternalReferencePolicy,
    pub retry: RetryConfig,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            target_env: "target".to_string(),
            conflict_policy: ConflictPolicy::default(),
            dry_run: false,
            variables: Variables::new(),
            external_policy: ExternalReferencePolicy::default(),
            retry: RetryConfig::default(),
        }
    }
}

/// Why processing of one entity stopped early.
enum Halt {
    Skipped(SkipReason),
    Failed(Error),
}

impl From<Error> for Halt {
    fn from(error: Error) -> Self {
        match error {
            Error::Cancelled => Halt::Skipped(SkipReason::Cancelled),
            other => Halt::Failed(other),
        }
    }
}

/// Per-run bookkeeping shared between entities.
#[derive(Default)]
struct RunState {
    states: HashMap<Uuid, EntityState>,
    /// Target handles of applied, conflicting and resolved entities
    handles: HashMap<Uuid, Handle>,
}

pub struct Importer<'a> {
    store: &'a dyn RemoteStore,
    credentials: CredentialResolver<'a>,
    options: ImportOptions,
    cancel: CancelToken,
}

impl<'a> Importer<'a> {
    pub fn new(store: &'a dyn RemoteStore, options: ImportOptions) -> Self {
        Self {
            store,
            credentials: CredentialResolver::new(),
            options,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_credentials(mut self, credentials: CredentialResolver<'a>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn options(&self) -> &ImportOptions {
        &self.options
    }

    /// Apply `bundle` to the target.
    ///
    /// Returns `Err` only for operation-scoped problems found in
    /// pre-flight; everything else is in the report.
    pub fn import(&self, bundle: &Bundle) -> Result<ImportReport> {
        let order = self.preflight(bundle)?;
        log::info!(
            "importing {} entities into {}{}",
            order.len(),
            self.options.target_env,
            if self.options.dry_run { " (dry run)" } else { "" }
        );

        let mut report = ImportReport::new(&self.options.target_env, self.options.dry_run);
        let mut run = RunState::default();

        for entry in order {
            let mut phase = Phase::Pending;
            let result = if report.aborted.is_some() {
                let reason = if self.cancel.is_cancelled() {
                    SkipReason::Cancelled
                } else {
                    SkipReason::RunAborted
                };
                Err(Halt::Skipped(reason))
            } else {
                self.process(bundle, entry, &mut run, &mut phase)
            };

            let (state, handle, error) = match result {
                Ok((state, handle)) => {
                    if state.is_applied() && !self.options.dry_run {
                        phase = Phase::Applied;
                    }
                    (state, handle, None)
                }
                Err(Halt::Skipped(reason)) => {
                    if reason == SkipReason::Cancelled && report.aborted.is_none() {
                        log::warn!("import cancelled at {} {}", entry.kind, entry.uuid);
                        report.aborted = Some(ReportedError::from(&Error::Cancelled));
                    }
                    (EntityState::Skipped { reason }, None, None)
                }
                Err(Halt::Failed(error)) => {
                    log::warn!("{} {} failed: {error}", entry.kind, entry.name);
                    let reported = ReportedError::from(&error);
                    if error.kind() == ErrorKind::ConflictDetected {
                        report.aborted = Some(reported.clone());
                    }
                    (EntityState::Failed, None, Some(reported))
                }
            };

            log::debug!("{} {} → {state}", entry.kind, entry.uuid);
            if let Some(h) = handle {
                run.handles.insert(entry.uuid, h);
            }
            run.states.insert(entry.uuid, state);
            report.outcomes.push(EntityOutcome {
                uuid: entry.uuid,
                kind: entry.kind,
                name: entry.name.clone(),
                phase_reached: phase,
                state,
                handle,
                error,
            });
        }

        let counts = report.counts();
        log::info!(
            "import into {} finished: {} created, {} updated, {} skipped, {} failed",
            report.target,
            counts.created,
            counts.updated,
            counts.skipped,
            counts.failed
        );
        Ok(report)
    }

    /// Bundle-wide checks; returns entries in apply order.
    fn preflight<'b>(&self, bundle: &'b Bundle) -> Result<Vec<&'b BundleEntry>> {
        check_format_version(&bundle.manifest.format_version)?;
        bundle.verify_digest()?;

        let mut graph = DependencyGraph::new();
        for entry in bundle.entries() {
            graph.add(&entry.to_entity(), entry.references.iter().map(|r| r.uuid));
        }
        let order = graph.order()?;

        for entry in bundle.entries() {
            for reference in &entry.references {
                if bundle.get(&reference.uuid).is_some() {
                    continue;
                }
                let tolerated = bundle.is_external(entry.uuid, reference.uuid)
                    && self.options.external_policy != ExternalReferencePolicy::Reject;
                if !tolerated {
                    return Err(Error::DanglingReference {
                        from: entry.uuid,
                        to: *reference,
                    });
                }
            }
        }

        // Hand-edited payloads must agree with the declared references
        // before anything is written
        for entry in bundle.entries() {
            let entity = match self.render(entry) {
                Ok(entity) => entity,
                Err(Error::Template { .. }) => continue,
                Err(e) => return Err(e),
            };
            self.check_references(bundle, entry, &entity)?;
        }

        Ok(order.iter().filter_map(|id| bundle.get(id)).collect())
    }

    /// Rendered payload references must equal the declared ones.
    fn check_references(
        &self,
        bundle: &Bundle,
        entry: &BundleEntry,
        entity: &Entity,
    ) -> Result<()> {
        let declared: BTreeSet<Reference> = entry.references.iter().copied().collect();
        let rendered = references_of(entity)?;
        if rendered == declared {
            return Ok(());
        }
        for reference in rendered.difference(&declared) {
            let tolerated = bundle.get(&reference.uuid).is_some()
                || (bundle.is_external(entry.uuid, reference.uuid)
                    && self.options.external_policy != ExternalReferencePolicy::Reject);
            if !tolerated {
                return Err(dangling(entry, reference));
            }
        }
        Err(Error::invalid_archive(
            entry.relative_path(),
            format!(
                "payload references of {} {} do not match the declared references",
                entry.kind, entry.uuid
            ),
        ))
    }

    fn process(
        &self,
        bundle: &Bundle,
        entry: &BundleEntry,
        run: &mut RunState,
        phase: &mut Phase,
    ) -> std::result::Result<(EntityState, Option<Handle>), Halt> {
        self.cancel.check()?;
        self.validate(bundle, entry, run)?;
        *phase = Phase::Validated;

        self.cancel.check()?;
        let entity = self.render(entry)?;
        *phase = Phase::Rendered;

        // Conflicts first: a skipped or failed entity needs no secret
        self.cancel.check()?;
        let existing = self.retrying(|| self.store.find_by_uuid(entry.kind, entry.uuid))?;
        let existing_handle = match existing {
            None => None,
            Some(found) => {
                let handle = found.handle.ok_or_else(|| {
                    Error::Store(StoreError::Rejected {
                        message: format!("{} {} has no handle", entry.kind, entry.uuid),
                    })
                })?;
                match self.options.conflict_policy {
                    ConflictPolicy::Overwrite => Some(handle),
                    ConflictPolicy::Skip => {
                        return Ok((
                            EntityState::Skipped {
                                reason: SkipReason::Conflict,
                            },
                            Some(handle),
                        ));
                    }
                    ConflictPolicy::Fail => {
                        return Err(Halt::Failed(Error::ConflictDetected {
                            kind: entry.kind,
                            uuid: entry.uuid,
                        }));
                    }
                }
            }
        };

        self.cancel.check()?;
        let mut entity = self.credentials.resolve(entity)?;
        *phase = Phase::Credentialed;

        if self.options.dry_run {
            let state = match existing_handle {
                Some(_) => EntityState::Updated,
                None => EntityState::Created,
            };
            return Ok((state, existing_handle));
        }

        rewrite_references(&mut entity, &run.handles).map_err(|to| {
            Halt::Failed(Error::DanglingReference {
                from: entry.uuid,
                to,
            })
        })?;
        let request = WriteRequest::from(&entity);
        let write_failed = |source: StoreError| {
            Halt::Failed(Error::TargetWriteFailed {
                kind: entry.kind,
                uuid: entry.uuid,
                source,
            })
        };

        match existing_handle {
            Some(handle) => {
                self.retrying(|| self.store.update(entry.kind, handle, &request))
                    .map_err(write_failed)?;
                Ok((EntityState::Updated, Some(handle)))
            }
            None => {
                let handle = self
                    .retrying(|| self.store.create(entry.kind, &request))
                    .map_err(write_failed)?;
                Ok((EntityState::Created, Some(handle)))
            }
        }
    }

    /// Dependency states and external references.
    fn validate(
        &self,
        bundle: &Bundle,
        entry: &BundleEntry,
        run: &mut RunState,
    ) -> std::result::Result<(), Halt> {
        for reference in &entry.references {
            if bundle.get(&reference.uuid).is_some() {
                match run.states.get(&reference.uuid) {
                    Some(state) if state.is_failed() || state.is_blocked() => {
                        return Err(Halt::Skipped(SkipReason::BlockedByDependencyFailure));
                    }
                    Some(EntityState::Skipped { reason }) if *reason != SkipReason::Conflict => {
                        return Err(Halt::Skipped(SkipReason::DependencySkipped));
                    }
                    _ => {}
                }
                continue;
            }

            match self.options.external_policy {
                ExternalReferencePolicy::SkipEntity => {
                    return Err(Halt::Skipped(SkipReason::ExternalReference));
                }
                ExternalReferencePolicy::ResolveAtTarget => {
                    let handle = self
                        .retrying(|| self.store.find_by_uuid(reference.kind, reference.uuid))?
                        .and_then(|found| found.handle)
                        .ok_or_else(|| dangling(entry, reference))?;
                    log::debug!("external {reference} resolved to handle {handle}");
                    run.handles.insert(reference.uuid, handle);
                }
                ExternalReferencePolicy::Reject => {
                    return Err(Halt::Failed(dangling(entry, reference)));
                }
            }
        }
        Ok(())
    }

    /// Render placeholders and merge overrides.
    fn render(&self, entry: &BundleEntry) -> Result<Entity> {
        let uuid = entry.uuid;
        let variables = &self.options.variables;
        let template_error = |source: TemplateError| Error::Template { uuid, source };

        let mut entity = entry.to_entity();
        entity.name = template::render(&entity.name, variables).map_err(template_error)?;

        let mut payload = Value::Object(std::mem::take(&mut entity.payload));
        template::render_value(&mut payload, "payload", variables).map_err(template_error)?;
        if let Value::Object(map) = payload {
            entity.payload = map;
        }

        if let Some(overrides) = &entry.overrides {
            let mut overlay = Value::Object(overrides.clone());
            template::render_value(&mut overlay, "overrides", variables)
                .map_err(template_error)?;
            if let Value::Object(map) = overlay {
                deep_merge(&mut entity.payload, map);
            }
        }

        Ok(entity)
    }

    fn retrying<T>(
        &self,
        operation: impl FnMut() -> std::result::Result<T, StoreError>,
    ) -> std::result::Result<T, StoreError> {
        with_retry(&self.options.retry, Some(&LogCallback), operation)
    }
}

fn dangling(entry: &BundleEntry, reference: &Reference) -> Error {
    Error::DanglingReference {
        from: entry.uuid,
        to: *reference,
    }
}

impl From<StoreError> for Halt {
    fn from(error: StoreError) -> Self {
        Halt::Failed(Error::Store(error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{Secret, logical_key};
    use crate::entity::{EntityKind, SECRET_MASK};
    use crate::exporter::{ExportOptions, Exporter, Selection};
    use crate::store::{EntityFilter, MemoryStore};
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Source {
        store: MemoryStore,
        connection: Uuid,
        table: Uuid,
        charts: [Uuid; 2],
        dashboard: Uuid,
    }

    fn seed(store: &MemoryStore, kind: EntityKind, name: &str, payload: Value) -> Uuid {
        let entity = Entity::new(kind, name, payload.as_object().cloned().unwrap_or_default());
        let uuid = entity.uuid;
        store.insert(entity);
        uuid
    }

    fn source() -> Source {
        let store = MemoryStore::new();
        let connection = seed(
            &store,
            EntityKind::Connection,
            "warehouse",
            json!({ "uri": "postgresql://etl@db:5432/warehouse", "password": "hunter2" }),
        );
        let table = seed(
            &store,
            EntityKind::Table,
            "orders",
            json!({
                "connection_uuid": connection.to_string(),
                "sql": "SELECT * FROM {{ schema }}.orders",
            }),
        );
        let charts = [
            seed(
                &store,
                EntityKind::Visualization,
                "Revenue",
                json!({ "source_table_uuid": table.to_string() }),
            ),
            seed(
                &store,
                EntityKind::Visualization,
                "Orders per day",
                json!({ "source_table_uuid": table.to_string() }),
            ),
        ];
        let dashboard = seed(
            &store,
            EntityKind::Dashboard,
            "Sales",
            json!({ "visualization_uuids": [charts[0].to_string(), charts[1].to_string()] }),
        );
        Source {
            store,
            connection,
            table,
            charts,
            dashboard,
        }
    }

    fn export(source: &Source, include_dependencies: bool) -> Bundle {
        let selection = Selection::new().with(
            EntityKind::Dashboard,
            EntityFilter::Uuids(BTreeSet::from([source.dashboard])),
        );
        let options = ExportOptions {
            include_dependencies,
            ..Default::default()
        };
        Exporter::new(&source.store, options)
            .export(&selection)
            .unwrap()
            .bundle
    }

    fn options(policy: ConflictPolicy) -> ImportOptions {
        ImportOptions {
            conflict_policy: policy,
            retry: RetryConfig {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                backoff_factor: 1.0,
                max_delay: Duration::from_millis(2),
            },
            ..Default::default()
        }
    }

    fn password_override(connection: Uuid) -> HashMap<String, Secret> {
        HashMap::from([(
            logical_key(EntityKind::Connection, connection, "password"),
            Secret::from("prod-pass"),
        )])
    }

    fn import(
        bundle: &Bundle,
        target: &MemoryStore,
        options: ImportOptions,
        connection: Uuid,
    ) -> ImportReport {
        Importer::new(target, options)
            .with_credentials(
                CredentialResolver::new().with_overrides(password_override(connection)),
            )
            .import(bundle)
            .unwrap()
    }

    #[test]
    fn test_import_into_empty_target() {
        let src = source();
        let bundle = export(&src, true);
        let target = MemoryStore::new();

        let report = import(&bundle, &target, options(ConflictPolicy::Fail), src.connection);

        assert!(report.is_success());
        assert_eq!(report.counts().created, 5);
        assert_eq!(target.len(), 5);

        let order: Vec<Uuid> = report.outcomes.iter().map(|o| o.uuid).collect();
        assert_eq!(order.first(), Some(&src.connection));
        assert_eq!(order.last(), Some(&src.dashboard));

        let conn_handle = target.find(src.connection).unwrap().handle.unwrap();
        let table = target.find(src.table).unwrap();
        assert_eq!(table.payload["connection_id"], json!(conn_handle));
        assert_eq!(table.payload["sql"], json!("SELECT * FROM {{ schema }}.orders"));

        let dashboard = target.find(src.dashboard).unwrap();
        let chart_handles: Vec<Value> = src
            .charts
            .iter()
            .map(|c| json!(target.find(*c).unwrap().handle.unwrap()))
            .collect();
        assert_eq!(dashboard.payload["visualization_ids"], json!(chart_handles));
    }

    #[test]
    fn test_reimport_with_skip_writes_nothing() {
        let src = source();
        let bundle = export(&src, true);
        let target = MemoryStore::new();
        import(&bundle, &target, options(ConflictPolicy::Fail), src.connection);
        let writes = target.write_count();

        let report = import(&bundle, &target, options(ConflictPolicy::Skip), src.connection);

        assert!(report.is_success());
        assert_eq!(report.counts().skipped, 5);
        assert!(report.outcomes.iter().all(|o| o.state
            == EntityState::Skipped {
                reason: SkipReason::Conflict
            }));
        assert_eq!(target.write_count(), writes);
    }

    #[test]
    fn test_reimport_with_skip_needs_no_secrets() {
        let src = source();
        let bundle = export(&src, true);
        let target = MemoryStore::new();
        import(&bundle, &target, options(ConflictPolicy::Fail), src.connection);
        let writes = target.write_count();

        let report = Importer::new(&target, options(ConflictPolicy::Skip))
            .import(&bundle)
            .unwrap();

        assert!(report.is_success());
        assert_eq!(report.counts().skipped, 5);
        let conn = report.outcome(&src.connection).unwrap();
        assert_eq!(
            conn.state,
            EntityState::Skipped {
                reason: SkipReason::Conflict
            }
        );
        assert!(conn.error.is_none());
        assert_eq!(target.write_count(), writes);
    }

    #[test]
    fn test_reimport_with_overwrite_keeps_handles() {
        let src = source();
        let bundle = export(&src, true);
        let target = MemoryStore::new();
        let first = import(&bundle, &target, options(ConflictPolicy::Fail), src.connection);
        let second = import(
            &bundle,
            &target,
            options(ConflictPolicy::Overwrite),
            src.connection,
        );

        assert_eq!(second.counts().updated, 5);
        assert_eq!(target.len(), 5);
        for (a, b) in first.outcomes.iter().zip(&second.outcomes) {
            assert_eq!(a.handle, b.handle);
        }
    }

    #[test]
    fn test_conflict_with_fail_aborts_run() {
        let src = source();
        let bundle = export(&src, true);
        let target = MemoryStore::new();
        // The connection already exists at the target
        let existing = src.store.find(src.connection).unwrap();
        target.insert(Entity::with_uuid(
            existing.uuid,
            existing.kind,
            &existing.name,
            existing.payload,
        ));

        let report = import(&bundle, &target, options(ConflictPolicy::Fail), src.connection);

        assert!(!report.is_success());
        assert!(report.aborted.is_some());
        let first = &report.outcomes[0];
        assert_eq!(first.state, EntityState::Failed);
        assert_eq!(
            first.error.as_ref().map(|e| e.kind),
            Some(ErrorKind::ConflictDetected)
        );
        assert!(report.outcomes[1..].iter().all(|o| o.state
            == EntityState::Skipped {
                reason: SkipReason::RunAborted
            }));
        assert_eq!(target.write_count(), 0);
    }

    #[test]
    fn test_write_failure_blocks_dependents() {
        let src = source();
        let bundle = export(&src, true);
        let target = MemoryStore::new();
        target.fail_writes_for(
            src.table,
            StoreError::Rejected {
                message: "quota exceeded".into(),
            },
        );

        let report = import(&bundle, &target, options(ConflictPolicy::Fail), src.connection);

        assert!(!report.is_success());
        let state = |id: &Uuid| report.outcome(id).unwrap().state;
        assert_eq!(state(&src.connection), EntityState::Created);
        assert_eq!(state(&src.table), EntityState::Failed);
        let blocked = EntityState::Skipped {
            reason: SkipReason::BlockedByDependencyFailure,
        };
        assert_eq!(state(&src.charts[0]), blocked);
        assert_eq!(state(&src.charts[1]), blocked);
        assert_eq!(state(&src.dashboard), blocked);
        assert_eq!(
            report.outcome(&src.table).unwrap().error.as_ref().unwrap().kind,
            ErrorKind::TargetWriteFailed
        );
    }

    #[test]
    fn test_transient_write_failure_is_retried() {
        let src = source();
        let bundle = export(&src, true);
        let target = MemoryStore::new();
        target.fail_next_writes_for(
            src.table,
            2,
            StoreError::Transient {
                message: "timeout".into(),
            },
        );

        let report = import(&bundle, &target, options(ConflictPolicy::Fail), src.connection);

        assert!(report.is_success());
        assert_eq!(target.len(), 5);
        assert_eq!(target.write_count(), 7);
    }

    #[test]
    fn test_secret_override_reaches_target() {
        let src = source();
        let bundle = export(&src, true);
        assert_eq!(
            bundle.get(&src.connection).unwrap().payload["password"],
            json!(SECRET_MASK)
        );
        let target = MemoryStore::new();

        import(&bundle, &target, options(ConflictPolicy::Fail), src.connection);

        let stored = target.find(src.connection).unwrap();
        assert_eq!(stored.payload["password"], json!("prod-pass"));
    }

    #[test]
    fn test_missing_secret_fails_connection_only() {
        let src = source();
        let bundle = export(&src, true);
        let target = MemoryStore::new();

        let report = Importer::new(&target, options(ConflictPolicy::Fail))
            .import(&bundle)
            .unwrap();

        let conn = report.outcome(&src.connection).unwrap();
        assert_eq!(conn.state, EntityState::Failed);
        assert_eq!(conn.phase_reached, Phase::Rendered);
        assert_eq!(
            conn.error.as_ref().map(|e| e.kind),
            Some(ErrorKind::CredentialUnresolved)
        );
        assert!(report.outcome(&src.table).unwrap().state.is_blocked());
        assert!(target.is_empty());
    }

    #[test]
    fn test_dry_run_issues_no_writes() {
        let src = source();
        let bundle = export(&src, true);
        let target = MemoryStore::new();

        let report = import(
            &bundle,
            &target,
            ImportOptions {
                dry_run: true,
                ..options(ConflictPolicy::Fail)
            },
            src.connection,
        );

        assert!(report.dry_run);
        assert!(report.is_success());
        assert_eq!(report.counts().created, 5);
        assert!(
            report
                .outcomes
                .iter()
                .all(|o| o.phase_reached == Phase::Credentialed)
        );
        assert_eq!(target.write_count(), 0);
        assert!(target.is_empty());
    }

    #[test]
    fn test_variables_are_rendered() {
        let src = source();
        let mut bundle = export(&src, true);
        let chart = src.charts[0];
        let mut entries = bundle.entries().to_vec();
        for entry in &mut entries {
            if entry.uuid == chart {
                entry.name = "Revenue ({{ env }})".to_string();
                entry
                    .payload
                    .insert("title".into(), json!("{{ region | default(\"eu\") }}"));
            }
        }
        let external = bundle.manifest.external.clone();
        bundle = Bundle::new("dev", entries, external);
        let target = MemoryStore::new();

        let mut opts = options(ConflictPolicy::Fail);
        opts.variables.insert("env".into(), "prod".into());
        let report = import(&bundle, &target, opts, src.connection);

        assert!(report.is_success());
        let stored = target.find(chart).unwrap();
        assert_eq!(stored.name, "Revenue (prod)");
        assert_eq!(stored.payload["title"], json!("eu"));
    }

    #[test]
    fn test_unresolved_variable_fails_entity() {
        let src = source();
        let bundle = export(&src, true);
        let chart = src.charts[1];
        let entries: Vec<BundleEntry> = bundle
            .entries()
            .iter()
            .cloned()
            .map(|mut e| {
                if e.uuid == chart {
                    e.payload.insert("title".into(), json!("{{ missing }}"));
                }
                e
            })
            .collect();
        let bundle = Bundle::new("dev", entries, Vec::new());
        let target = MemoryStore::new();

        let report = import(&bundle, &target, options(ConflictPolicy::Fail), src.connection);

        let outcome = report.outcome(&chart).unwrap();
        assert_eq!(outcome.state, EntityState::Failed);
        assert_eq!(
            outcome.error.as_ref().map(|e| e.kind),
            Some(ErrorKind::UnresolvedVariable)
        );
        // Independent siblings still go through
        assert_eq!(
            report.outcome(&src.charts[0]).unwrap().state,
            EntityState::Created
        );
    }

    #[test]
    fn test_overrides_are_merged() {
        let src = source();
        let bundle = export(&src, true);
        let dir = TempDir::new().unwrap();
        bundle.write(dir.path(), false).unwrap();
        std::fs::write(
            dir.path()
                .join("tables")
                .join(format!("{}.overrides.yaml", src.table)),
            "cache_timeout: 600\nextra:\n  schema: \"{{ schema | default('analytics') }}\"\n",
        )
        .unwrap();
        let bundle = Bundle::read(dir.path()).unwrap();
        let target = MemoryStore::new();

        let report = import(&bundle, &target, options(ConflictPolicy::Fail), src.connection);

        assert!(report.is_success());
        let table = target.find(src.table).unwrap();
        assert_eq!(table.payload["cache_timeout"], json!(600));
        assert_eq!(table.payload["extra"]["schema"], json!("analytics"));
    }

    #[test]
    fn test_tampered_bundle_rejected_before_writes() {
        let src = source();
        let bundle = export(&src, true);
        let dir = TempDir::new().unwrap();
        bundle.write(dir.path(), false).unwrap();

        let table = bundle.get(&src.table).unwrap();
        let mut edited = table.clone();
        edited.references.clear();
        edited.payload.remove("connection_uuid");
        std::fs::write(
            dir.path().join(table.relative_path()),
            serde_yaml::to_string(&edited).unwrap(),
        )
        .unwrap();

        let tampered = Bundle::read(dir.path()).unwrap();
        let target = MemoryStore::new();
        let err = Importer::new(&target, options(ConflictPolicy::Fail))
            .import(&tampered)
            .unwrap_err();
        assert!(matches!(err, Error::DigestMismatch { .. }));
        assert_eq!(target.write_count(), 0);
    }

    #[test]
    fn test_edited_payload_reference_rejected_before_writes() {
        let src = source();
        let bundle = export(&src, true);
        let dir = TempDir::new().unwrap();
        bundle.write(dir.path(), false).unwrap();

        // Only the payload changes, so the digest still matches
        let table = bundle.get(&src.table).unwrap();
        let stray = Uuid::new_v4();
        let mut edited = table.clone();
        edited
            .payload
            .insert("connection_uuid".into(), json!(stray.to_string()));
        std::fs::write(
            dir.path().join(table.relative_path()),
            serde_yaml::to_string(&edited).unwrap(),
        )
        .unwrap();

        let edited = Bundle::read(dir.path()).unwrap();
        let target = MemoryStore::new();
        let err = Importer::new(&target, options(ConflictPolicy::Fail))
            .with_credentials(
                CredentialResolver::new().with_overrides(password_override(src.connection)),
            )
            .import(&edited)
            .unwrap_err();

        assert!(matches!(
            err,
            Error::DanglingReference { from, to } if from == src.table && to.uuid == stray
        ));
        assert_eq!(err.kind().scope(), crate::error::ErrorScope::Operation);
        assert_eq!(target.write_count(), 0);
        assert!(target.is_empty());
    }

    #[test]
    fn test_external_reference_policies() {
        let src = source();
        let bundle = export(&src, false);
        let target = MemoryStore::new();

        let err = Importer::new(&target, options(ConflictPolicy::Fail))
            .import(&bundle)
            .unwrap_err();
        assert!(matches!(err, Error::DanglingReference { .. }));

        let report = import(
            &bundle,
            &target,
            ImportOptions {
                external_policy: ExternalReferencePolicy::SkipEntity,
                ..options(ConflictPolicy::Fail)
            },
            src.connection,
        );
        assert_eq!(
            report.outcome(&src.dashboard).unwrap().state,
            EntityState::Skipped {
                reason: SkipReason::ExternalReference
            }
        );
        assert!(report.is_success());

        let resolve = ImportOptions {
            external_policy: ExternalReferencePolicy::ResolveAtTarget,
            ..options(ConflictPolicy::Fail)
        };
        let report = import(&bundle, &target, resolve.clone(), src.connection);
        let outcome = report.outcome(&src.dashboard).unwrap();
        assert_eq!(outcome.state, EntityState::Failed);
        assert_eq!(
            outcome.error.as_ref().map(|e| e.kind),
            Some(ErrorKind::DanglingReference)
        );

        // Once the charts exist at the target, the dashboard links to them
        let mut handles = Vec::new();
        for chart in src.charts {
            let found = src.store.find(chart).unwrap();
            let seeded = Entity::with_uuid(found.uuid, found.kind, &found.name, found.payload);
            handles.push(json!(target.insert(seeded)));
        }
        let report = import(&bundle, &target, resolve, src.connection);
        assert!(report.is_success());
        let dashboard = target.find(src.dashboard).unwrap();
        assert_eq!(dashboard.payload["visualization_ids"], json!(handles));
    }

    #[test]
    fn test_cancelled_before_start() {
        let src = source();
        let bundle = export(&src, true);
        let target = MemoryStore::new();
        let cancel = CancelToken::new();
        cancel.cancel();

        let report = Importer::new(&target, options(ConflictPolicy::Fail))
            .with_cancel(cancel)
            .import(&bundle)
            .unwrap();

        assert!(report.aborted.is_some());
        assert!(!report.is_success());
        assert!(report.outcomes.iter().all(|o| o.state
            == EntityState::Skipped {
                reason: SkipReason::Cancelled
            }));
        assert_eq!(target.write_count(), 0);
    }

    #[test]
    fn test_cycle_rejected_in_preflight() {
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);
        let entry = |uuid: Uuid, other: Uuid| {
            let entity = Entity::with_uuid(
                uuid,
                EntityKind::Table,
                "t",
                json!({ "connection_uuid": other.to_string() })
                    .as_object()
                    .cloned()
                    .unwrap(),
            );
            BundleEntry::new(
                entity,
                BTreeSet::from([Reference {
                    kind: EntityKind::Table,
                    uuid: other,
                }]),
            )
        };
        let bundle = Bundle::new("dev", vec![entry(a, b), entry(b, a)], Vec::new());
        let target = MemoryStore::new();
        let err = Importer::new(&target, ImportOptions::default())
            .import(&bundle)
            .unwrap_err();
        assert!(matches!(err, Error::CyclicDependency { .. }));
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!("Skip".parse::<ConflictPolicy>(), Ok(ConflictPolicy::Skip));
        assert!("merge".parse::<ConflictPolicy>().is_err());
        assert_eq!(
            "resolve".parse::<ExternalReferencePolicy>(),
            Ok(ExternalReferencePolicy::ResolveAtTarget)
        );
        assert_eq!(ExternalReferencePolicy::SkipEntity.to_string(), "skip");
    }
}
