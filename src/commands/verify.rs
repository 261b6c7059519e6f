use anyhow::{Context as _, Result, bail};
use assetkit::{Bundle, DependencyGraph, EntityKind, bundle};
use serde::Serialize;
use std::path::Path;

use crate::Context;
use crate::commands;
use crate::ui;

/// What `ferry verify` found
#[derive(Debug, Serialize)]
pub struct VerifyReport {
    pub bundle: String,
    pub format_version: String,
    pub source_env: String,
    pub exported_at: String,
    pub entities: Vec<(String, usize)>,
    pub external: usize,
    pub problems: Vec<String>,
}

pub fn run(ctx: &Context, path: &Path, json: bool) -> Result<()> {
    let report = verify(path)?;

    if json {
        commands::print_json(&report)?;
    } else {
        ui::header(&format!("Bundle {}", report.bundle));
        ui::kv("format", &report.format_version);
        ui::kv("source", &report.source_env);
        ui::kv("exported", &report.exported_at);
        for (kind, count) in &report.entities {
            ui::kv(kind, &count.to_string());
        }
        if report.external > 0 && !ctx.quiet {
            ui::kv("external references", &report.external.to_string());
        }
        println!();
        for problem in &report.problems {
            ui::error(problem);
        }
        if report.problems.is_empty() {
            ui::success("Bundle is consistent");
        }
    }

    if !report.problems.is_empty() {
        bail!("{} problem(s) found in {}", report.problems.len(), path.display());
    }
    Ok(())
}

/// Check layout, digest, ordering and references of a bundle on disk.
///
/// Unreadable bundles are an error; everything else is collected as a
/// problem so one run reports all of them.
pub fn verify(path: &Path) -> Result<VerifyReport> {
    let bundle = Bundle::read(path)
        .with_context(|| format!("Could not read bundle {}", path.display()))?;
    let mut problems = Vec::new();

    let on_disk = bundle::rescan_digest(path)?;
    if on_disk != bundle.manifest.digest {
        problems.push(format!(
            "digest mismatch: manifest says {}, files give {}",
            bundle.manifest.digest, on_disk
        ));
    }

    let mut graph = DependencyGraph::new();
    for entry in bundle.entries() {
        graph.add(
            &entry.to_entity(),
            entry.references.iter().map(|r| r.uuid),
        );
        for reference in &entry.references {
            if bundle.get(&reference.uuid).is_none()
                && !bundle.is_external(entry.uuid, reference.uuid)
            {
                problems.push(format!(
                    "{} {} references {}, which is neither bundled nor declared external",
                    entry.kind, entry.uuid, reference
                ));
            }
        }
    }
    if let Err(e) = graph.order() {
        problems.push(e.to_string());
    }

    Ok(VerifyReport {
        bundle: path.display().to_string(),
        format_version: bundle.manifest.format_version.clone(),
        source_env: bundle.manifest.source_env.clone(),
        exported_at: bundle.manifest.exported_at.to_rfc3339(),
        entities: EntityKind::ALL
            .iter()
            .map(|kind| (kind.dir_name().to_string(), bundle.count(*kind)))
            .filter(|(_, count)| *count > 0)
            .collect(),
        external: bundle.manifest.external.len(),
        problems,
    })
}
