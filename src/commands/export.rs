use anyhow::{Context as _, Result, bail};
use assetkit::{EntityFilter, EntityKind, ExportOptions, ExportReport, Exporter, RemoteStore, Selection};
use regex::Regex;
use std::path::Path;

use crate::Context;
use crate::cli::{ExportArgs, FilterArgs};
use crate::commands;
use crate::ui;

pub fn run(ctx: &Context, args: ExportArgs) -> Result<()> {
    let store = commands::open_cli_environment(&args.source)?;
    let selection = selection_from_args(&args.kinds, &args.filter)?;
    let options = ExportOptions {
        source_env: store.name().to_string(),
        include_dependencies: !args.no_dependencies,
        jobs: args.jobs.max(1),
        ..Default::default()
    };

    let report = export_to(
        ctx,
        &store,
        &selection,
        options,
        &args.output,
        args.overwrite,
        args.json,
    )?;

    if args.json {
        commands::print_json(&report)?;
    } else {
        ui::print_export_report(&report);
        if !ctx.quiet {
            ui::kv("bundle", &args.output.display().to_string());
        }
    }

    if !report.is_success() {
        bail!(
            "{} entities could not be exported from {}",
            report.failures.len(),
            report.source_env
        );
    }
    Ok(())
}

/// Export `selection` from `store` and write the bundle to `output`.
pub fn export_to(
    ctx: &Context,
    store: &dyn RemoteStore,
    selection: &Selection,
    options: ExportOptions,
    output: &Path,
    overwrite: bool,
    json: bool,
) -> Result<ExportReport> {
    let source = options.source_env.clone();
    let pb = ui::spinner(&format!("Exporting from {source}..."), ctx.quiet || json);
    let result = Exporter::new(store, options).export(selection);
    pb.finish_and_clear();

    let export = result.with_context(|| format!("Export from {source} failed"))?;
    let written = export
        .bundle
        .write(output, overwrite)
        .with_context(|| format!("Could not write bundle to {}", output.display()))?;
    log::info!("wrote {} files to {}", written.len(), output.display());

    let masked: usize = export
        .bundle
        .entries()
        .iter()
        .map(|e| e.to_entity().masked_secret_fields().len())
        .sum();
    if masked > 0 && !json && !ctx.quiet {
        ui::info(&format!(
            "{masked} secret field(s) masked; supply them on import with --secret or FERRY_SECRET_*"
        ));
    }

    Ok(export.report)
}

/// Kinds and filter from the command line; no kinds means every kind.
pub fn selection_from_args(kinds: &[EntityKind], filter: &FilterArgs) -> Result<Selection> {
    let filter = if !filter.ids.is_empty() {
        EntityFilter::Handles(filter.ids.iter().copied().collect())
    } else if !filter.uuids.is_empty() {
        EntityFilter::Uuids(filter.uuids.iter().copied().collect())
    } else if let Some(owner) = &filter.owner {
        EntityFilter::Owner(owner.clone())
    } else if let Some(pattern) = &filter.pattern {
        let regex =
            Regex::new(pattern).with_context(|| format!("Invalid --pattern '{pattern}'"))?;
        EntityFilter::NamePattern(regex)
    } else {
        EntityFilter::All
    };

    let kinds: &[EntityKind] = if kinds.is_empty() {
        &EntityKind::ALL
    } else {
        kinds
    };
    Ok(kinds
        .iter()
        .fold(Selection::new(), |selection, kind| {
            selection.with(*kind, filter.clone())
        }))
}
