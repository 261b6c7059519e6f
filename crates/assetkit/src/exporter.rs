//! Exporter
//!
//! Reads a selection of entities (plus, optionally, everything they
//! reference) from a source environment and turns it into a [`Bundle`].
//! The source is only ever read.

use crate::bundle::{Bundle, BundleEntry, ExternalReference};
use crate::cancel::CancelToken;
use crate::entity::{Entity, EntityKind, Reference, references_of};
use crate::error::{Error, ErrorKind, Result, StoreError};
use crate::report::{ExportFailure, ExportReport, ReportedError};
use crate::resolver::{closure, external_references, topological_order};
use crate::retry::{LogCallback, RetryConfig, with_retry};
use crate::store::{EntityFilter, RemoteStore};
use crate::template;
use rayon::prelude::*;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use uuid::Uuid;

/// Which entities to export, per kind.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    filters: BTreeMap<EntityKind, EntityFilter>,
}

impl Selection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every entity of every kind
    pub fn all() -> Self {
        EntityKind::ALL
            .into_iter()
            .fold(Self::new(), |s, kind| s.with(kind, EntityFilter::All))
    }

    pub fn with(mut self, kind: EntityKind, filter: EntityFilter) -> Self {
        self.filters.insert(kind, filter);
        self
    }

    pub fn kinds(&self) -> impl Iterator<Item = (EntityKind, &EntityFilter)> {
        self.filters.iter().map(|(k, f)| (*k, f))
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

/// Export settings.
#[derive(Debug, Clone)]
pub struct ExportOptions {
    /// Name recorded in the manifest
    pub source_env: String,
    /// Pull in everything the selection references
    pub include_dependencies: bool,
    /// Concurrent list calls against the source
    pub jobs: usize,
    pub retry: RetryConfig,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            source_env: "source".to_string(),
            include_dependencies: true,
            jobs: 4,
            retry: RetryConfig::default(),
        }
    }
}

/// A bundle and the report of how it was built.
#[derive(Debug, Clone)]
pub struct Export {
    pub bundle: Bundle,
    pub report: ExportReport,
}

/// One `list` call of the fan-out.
struct FetchJob<'s> {
    kind: EntityKind,
    filter: &'s EntityFilter,
    selected: bool,
}

pub struct Exporter<'a> {
    store: &'a dyn RemoteStore,
    options: ExportOptions,
    cancel: CancelToken,
}

impl<'a> Exporter<'a> {
    pub fn new(store: &'a dyn RemoteStore, options: ExportOptions) -> Self {
        Self {
            store,
            options,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Export `selection` into an in-memory bundle.
    pub fn export(&self, selection: &Selection) -> Result<Export> {
        log::info!(
            "exporting from {} (dependencies: {})",
            self.options.source_env,
            self.options.include_dependencies
        );

        let all = EntityFilter::All;
        let mut jobs: Vec<FetchJob<'_>> = selection
            .kinds()
            .map(|(kind, filter)| FetchJob {
                kind,
                filter,
                selected: true,
            })
            .collect();
        if self.options.include_dependencies {
            let mut extra = BTreeSet::new();
            for (kind, _) in selection.kinds() {
                extra.extend(kind.dependency_kinds());
            }
            for kind in extra {
                if !selection
                    .kinds()
                    .any(|(k, f)| k == kind && matches!(f, EntityFilter::All))
                {
                    jobs.push(FetchJob {
                        kind,
                        filter: &all,
                        selected: false,
                    });
                }
            }
        }

        let fetched = self.fetch(&jobs)?;

        let mut universe: HashMap<Uuid, Entity> = HashMap::new();
        let mut seeds = BTreeSet::new();
        for (job, entities) in jobs.iter().zip(fetched) {
            for entity in entities {
                if job.selected {
                    seeds.insert(entity.uuid);
                }
                universe.insert(entity.uuid, entity);
            }
        }
        self.cancel.check()?;

        let (dropped, failures) = self.drop_unusable(&universe, &seeds);
        let seeds: BTreeSet<Uuid> = seeds.difference(&dropped).copied().collect();

        let members = if self.options.include_dependencies {
            let clean: HashMap<Uuid, Entity> = universe
                .iter()
                .filter(|(id, _)| !dropped.contains(*id))
                .map(|(id, e)| (*id, e.clone()))
                .collect();
            closure(&seeds, &clean)?
        } else {
            seeds
        };

        let selected: Vec<Entity> = members
            .iter()
            .filter_map(|id| universe.get(id).cloned())
            .collect();

        let mut external = Vec::new();
        if !self.options.include_dependencies {
            for entity in &selected {
                for reference in external_references(entity, &members)? {
                    log::debug!("{} keeps external reference to {reference}", entity.uuid);
                    external.push(ExternalReference {
                        from: entity.uuid,
                        kind: reference.kind,
                        uuid: reference.uuid,
                    });
                }
            }
        }

        let ordered = topological_order(&selected)?;
        let mut entries = Vec::with_capacity(ordered.len());
        for entity in ordered {
            self.cancel.check()?;
            entries.push(prepare_entry(entity)?);
        }

        let bundle = Bundle::new(self.options.source_env.clone(), entries, external);
        let report = ExportReport {
            source_env: self.options.source_env.clone(),
            bundled: EntityKind::ALL
                .into_iter()
                .map(|kind| (kind, bundle.count(kind)))
                .filter(|(_, n)| *n > 0)
                .collect(),
            external: bundle.manifest.external.clone(),
            failures,
        };
        log::info!(
            "exported {} entities ({} dropped)",
            bundle.len(),
            report.failures.len()
        );
        Ok(Export { bundle, report })
    }

    /// Run the list calls, sequentially or on a bounded pool.
    fn fetch(&self, jobs: &[FetchJob<'_>]) -> Result<Vec<Vec<Entity>>> {
        let list = |job: &FetchJob<'_>| -> std::result::Result<Vec<Entity>, StoreError> {
            log::debug!("listing {} entities", job.kind);
            with_retry(&self.options.retry, Some(&LogCallback), || {
                self.store.list(job.kind, job.filter)
            })
        };

        if self.options.jobs <= 1 || jobs.len() <= 1 {
            let mut results = Vec::with_capacity(jobs.len());
            for job in jobs {
                self.cancel.check()?;
                results.push(list(job)?);
            }
            return Ok(results);
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.options.jobs)
            .build()
            .map_err(|e| {
                Error::Io(std::io::Error::other(format!(
                    "failed to create thread pool: {e}"
                )))
            })?;

        let results: Vec<std::result::Result<Vec<Entity>, StoreError>> =
            pool.install(|| jobs.par_iter().map(list).collect());
        results
            .into_iter()
            .map(|r| r.map_err(Error::from))
            .collect()
    }

    /// Entities with malformed payloads, plus everything depending on them.
    ///
    /// Only entities that would have been exported are reported.
    fn drop_unusable(
        &self,
        universe: &HashMap<Uuid, Entity>,
        seeds: &BTreeSet<Uuid>,
    ) -> (BTreeSet<Uuid>, Vec<ExportFailure>) {
        let mut parsed: HashMap<Uuid, BTreeSet<Reference>> = HashMap::new();
        let mut reasons: BTreeMap<Uuid, ReportedError> = BTreeMap::new();
        for (id, entity) in universe {
            match references_of(entity) {
                Ok(refs) => {
                    parsed.insert(*id, refs);
                }
                Err(e) => {
                    log::warn!("dropping {} {}: {e}", entity.kind, entity.name);
                    reasons.insert(*id, ReportedError::from(&e));
                }
            }
        }

        let mut dropped: BTreeSet<Uuid> = reasons.keys().copied().collect();
        loop {
            let newly: Vec<(Uuid, Uuid)> = parsed
                .iter()
                .filter(|(id, _)| !dropped.contains(*id))
                .filter_map(|(id, refs)| {
                    refs.iter()
                        .find(|r| dropped.contains(&r.uuid))
                        .map(|r| (*id, r.uuid))
                })
                .collect();
            if newly.is_empty() {
                break;
            }
            for (id, blocker) in newly {
                dropped.insert(id);
                reasons.insert(
                    id,
                    ReportedError {
                        kind: ErrorKind::DanglingReference,
                        message: format!("depends on {blocker}, which was dropped"),
                    },
                );
            }
        }

        let wanted = if self.options.include_dependencies {
            reachable(seeds, &parsed)
        } else {
            seeds.clone()
        };

        let failures = reasons
            .into_iter()
            .filter(|(id, _)| wanted.contains(id))
            .filter_map(|(id, error)| {
                universe.get(&id).map(|e| ExportFailure {
                    uuid: id,
                    kind: e.kind,
                    name: e.name.clone(),
                    error,
                })
            })
            .collect();
        (dropped, failures)
    }
}

/// Everything reachable from `seeds` through parsed references.
fn reachable(
    seeds: &BTreeSet<Uuid>,
    parsed: &HashMap<Uuid, BTreeSet<Reference>>,
) -> BTreeSet<Uuid> {
    let mut seen = BTreeSet::new();
    let mut frontier: Vec<Uuid> = seeds.iter().copied().collect();
    while let Some(id) = frontier.pop() {
        if !seen.insert(id) {
            continue;
        }
        if let Some(refs) = parsed.get(&id) {
            frontier.extend(refs.iter().map(|r| r.uuid));
        }
    }
    seen
}

/// Mask secrets and escape every string that goes into the bundle.
fn prepare_entry(mut entity: Entity) -> Result<BundleEntry> {
    let references = references_of(&entity)?;
    entity.handle = None;
    entity.mask_secrets();

    let uuid = entity.uuid;
    entity.name = template::escape(&entity.name).map_err(|source| Error::Template {
        uuid,
        source,
    })?;
    let mut payload = Value::Object(std::mem::take(&mut entity.payload));
    template::escape_value(&mut payload, "payload")
        .map_err(|source| Error::Template { uuid, source })?;
    if let Value::Object(map) = payload {
        entity.payload = map;
    }

    Ok(BundleEntry::new(entity, references))
}
