//! `ferry sync`: a folder holding `sync_config.yml` and the bundle it
//! pulls from the source and pushes to each target.

use anyhow::{Context as _, Result, bail};
use assetkit::{Bundle, ExportOptions, ExportReport, ImportReport};
use colored::Colorize;
use serde::Serialize;
use std::fs;
use std::path::Path;

use crate::Context;
use crate::cli::{ApplyArgs, SyncCommand};
use crate::commands::{self, export, import};
use crate::config::{SYNC_CONFIG_FILE, SyncConfig};
use crate::ui;

pub fn run(ctx: &Context, cmd: SyncCommand) -> Result<()> {
    match cmd {
        SyncCommand::Create { folder, force } => create(ctx, &folder, force),
        SyncCommand::Run {
            folder,
            targets,
            pull_only,
            push_only,
            apply,
            json,
        } => run_sync(
            ctx,
            &folder,
            &RunOptions {
                targets,
                pull: !push_only,
                push: !pull_only,
                apply,
                json,
            },
        ),
        SyncCommand::Validate { folder } => validate(ctx, &folder),
    }
}

fn create(ctx: &Context, folder: &Path, force: bool) -> Result<()> {
    let config_path = folder.join(SYNC_CONFIG_FILE);
    if config_path.exists() && !force {
        bail!(
            "{} already exists. Use --force to replace it.",
            config_path.display()
        );
    }

    let config = SyncConfig::example();
    config.save(folder)?;
    fs::create_dir_all(config.assets_path(folder))?;
    fs::create_dir_all(folder.join("environments"))?;

    if !ctx.quiet {
        ui::success(&format!("Created {}", config_path.display()));
        println!();
        println!("  Next steps:");
        println!("    1. Point `environments` at your snapshot files");
        println!("    2. Pick the assets to sync under `source.assets`");
        println!(
            "    3. Run {}",
            format!("ferry sync run {}", folder.display()).bold()
        );
    }
    Ok(())
}

/// Every problem in the config, including environments that cannot be
/// resolved.
fn problems(config: &SyncConfig, folder: &Path) -> Vec<String> {
    let mut problems = config.validate();
    let envs = std::iter::once(("source".to_string(), config.source.env.as_str())).chain(
        config
            .targets
            .iter()
            .map(|t| (format!("target '{}'", t.name), t.env.as_str())),
    );
    for (label, env) in envs {
        if let Err(e) = crate::config::resolve_environment(env, &config.environments, folder) {
            problems.push(format!("{label}: {e}"));
        }
    }
    problems
}

fn validate(ctx: &Context, folder: &Path) -> Result<()> {
    let config = SyncConfig::load(folder)?;
    let problems = problems(&config, folder);

    if problems.is_empty() {
        if !ctx.quiet {
            ui::success(&format!("{} is valid", folder.join(SYNC_CONFIG_FILE).display()));
            ui::kv("source", &config.source.env);
            for (kind, asset) in &config.source.assets {
                ui::kv(kind, &asset.summary());
            }
            for target in &config.targets {
                ui::kv(
                    &format!("target {}", target.name),
                    &format!(
                        "{} (conflict {})",
                        target.env,
                        target.effective_conflict_policy(&config.target_defaults)
                    ),
                );
            }
        }
        return Ok(());
    }

    for problem in &problems {
        ui::error(problem);
    }
    bail!("{} problem(s) in {}", problems.len(), SYNC_CONFIG_FILE)
}

struct RunOptions {
    targets: Vec<String>,
    pull: bool,
    push: bool,
    apply: ApplyArgs,
    json: bool,
}

#[derive(Serialize)]
struct RefusedTarget {
    target: String,
    error: String,
}

#[derive(Serialize)]
struct SyncReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    export: Option<ExportReport>,
    imports: Vec<ImportReport>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    refused: Vec<RefusedTarget>,
}

fn run_sync(ctx: &Context, folder: &Path, opts: &RunOptions) -> Result<()> {
    let config = SyncConfig::load(folder)?;
    let problems = problems(&config, folder);
    if !problems.is_empty() {
        for problem in &problems {
            ui::error(problem);
        }
        bail!("{} problem(s) in {}", problems.len(), SYNC_CONFIG_FILE);
    }

    let targets = if opts.push {
        config.select_targets(&opts.targets)?
    } else {
        Vec::new()
    };
    let assets = config.assets_path(folder);
    let total = usize::from(opts.pull) + targets.len();
    let show = !opts.json && !ctx.quiet;
    let mut step = 0;
    let mut report = SyncReport {
        export: None,
        imports: Vec::new(),
        refused: Vec::new(),
    };

    if opts.pull {
        step += 1;
        if show {
            ui::step(step, total, &format!("Pull from {}", config.source.env));
        }
        let store = commands::open_environment(&config.source.env, &config.environments, folder)?;
        let options = ExportOptions {
            source_env: store.name().to_string(),
            include_dependencies: config.source.include_dependencies,
            ..Default::default()
        };
        let selection = config.source.selection()?;
        let exported =
            export::export_to(ctx, &store, &selection, options, &assets, true, opts.json)?;
        if show {
            ui::print_export_report(&exported);
        }
        if !exported.is_success() {
            if opts.json {
                report.export = Some(exported);
                commands::print_json(&report)?;
            }
            bail!("Pull from {} dropped entities; nothing pushed", config.source.env);
        }
        report.export = Some(exported);
    }

    if !targets.is_empty() {
        let bundle = Bundle::read(&assets)
            .with_context(|| format!("Could not read bundle {}", assets.display()))?;

        for target in &targets {
            step += 1;
            if show {
                println!();
                ui::step(step, total, &format!("Push to {}", target.name));
            }
            let store = commands::open_environment(&target.env, &config.environments, folder)?;
            let conflict = opts
                .apply
                .conflict
                .unwrap_or_else(|| target.effective_conflict_policy(&config.target_defaults));
            let variables = target.effective_variables(&config.target_defaults);

            // One target refusing the bundle does not stop the others
            match import::import_into(
                ctx,
                &store,
                &target.name,
                &bundle,
                &opts.apply,
                conflict,
                variables,
                opts.json,
            ) {
                Ok(imported) => {
                    if show {
                        ui::print_import_report(&imported);
                    }
                    report.imports.push(imported);
                }
                Err(e) => {
                    ui::error(&format!("{}: {e:#}", target.name));
                    report.refused.push(RefusedTarget {
                        target: target.name.clone(),
                        error: format!("{e:#}"),
                    });
                }
            }
        }
    }

    if opts.json {
        commands::print_json(&report)?;
    }

    let failed: Vec<&str> = report
        .imports
        .iter()
        .filter(|r| !r.is_success())
        .map(|r| r.target.as_str())
        .chain(report.refused.iter().map(|r| r.target.as_str()))
        .collect();
    if !failed.is_empty() {
        bail!("Sync did not complete for: {}", failed.join(", "));
    }
    if show {
        println!();
        ui::success("Sync complete");
    }
    Ok(())
}
