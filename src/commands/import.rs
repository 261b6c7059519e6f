use anyhow::{Context as _, Result, bail};
use assetkit::{
    Bundle, ConflictPolicy, CredentialResolver, ImportOptions, ImportReport, Importer, RemoteStore,
    Secret, Variables,
};
use std::collections::HashMap;

use crate::Context;
use crate::cli::{ApplyArgs, ImportArgs};
use crate::commands;
use crate::secrets::{EnvSource, ReachabilityVerifier, TerminalPrompt};
use crate::ui;

pub fn run(ctx: &Context, args: ImportArgs) -> Result<()> {
    let bundle = Bundle::read(&args.bundle)
        .with_context(|| format!("Could not read bundle {}", args.bundle.display()))?;
    let store = commands::open_cli_environment(&args.target)?;

    let conflict = args.apply.conflict.unwrap_or_default();
    let report = import_into(
        ctx,
        &store,
        store.name(),
        &bundle,
        &args.apply,
        conflict,
        Variables::new(),
        args.json,
    )?;

    if args.json {
        commands::print_json(&report)?;
    } else {
        ui::print_import_report(&report);
    }
    check(&report)
}

/// Secrets and interactive helpers for one run, owned here so the
/// resolver can borrow them.
pub struct Credentials {
    overrides: HashMap<String, Secret>,
    prompt: Option<TerminalPrompt>,
    verifier: Option<ReachabilityVerifier>,
}

impl Credentials {
    pub fn from_args(args: &ApplyArgs) -> Self {
        let interactive = !args.no_input && console::Term::stderr().is_term();
        Self {
            overrides: args
                .secrets
                .iter()
                .map(|(k, v)| (k.clone(), Secret::new(v.clone())))
                .collect(),
            prompt: interactive.then_some(TerminalPrompt),
            verifier: args
                .verify_connections
                .then(ReachabilityVerifier::default),
        }
    }

    pub fn resolver(&self) -> CredentialResolver<'_> {
        let mut resolver = CredentialResolver::new()
            .with_overrides(self.overrides.clone())
            .with_source(&EnvSource);
        if let Some(prompt) = &self.prompt {
            resolver = resolver.interactive(prompt);
        }
        if let Some(verifier) = &self.verifier {
            resolver = resolver.with_verifier(verifier);
        }
        resolver
    }
}

/// Options for one target: command-line variables win over configured ones.
pub fn import_options(
    target: &str,
    args: &ApplyArgs,
    conflict: ConflictPolicy,
    mut variables: Variables,
) -> ImportOptions {
    variables.extend(args.vars.iter().cloned());
    ImportOptions {
        target_env: target.to_string(),
        conflict_policy: conflict,
        dry_run: args.dry_run,
        variables,
        external_policy: args.external,
        ..Default::default()
    }
}

/// Import `bundle` into `store`.
#[allow(clippy::too_many_arguments)]
pub fn import_into(
    ctx: &Context,
    store: &dyn RemoteStore,
    target: &str,
    bundle: &Bundle,
    args: &ApplyArgs,
    conflict: ConflictPolicy,
    variables: Variables,
    json: bool,
) -> Result<ImportReport> {
    let options = import_options(target, args, conflict, variables);
    log::info!(
        "importing {} entities from {} into {} (conflict policy {})",
        bundle.len(),
        bundle.manifest.source_env,
        target,
        options.conflict_policy
    );

    let credentials = Credentials::from_args(args);
    let importer = Importer::new(store, options).with_credentials(credentials.resolver());

    // Prompts need the terminal, so no spinner while they may appear
    let pb = if credentials.prompt.is_some() {
        ui::spinner("", true)
    } else {
        ui::spinner(&format!("Importing into {target}..."), ctx.quiet || json)
    };
    let result = importer.import(bundle);
    pb.finish_and_clear();

    result.with_context(|| format!("Import into {target} refused"))
}

/// Non-zero exit unless every entity was applied or skipped on purpose.
pub fn check(report: &ImportReport) -> Result<()> {
    if report.is_success() {
        return Ok(());
    }
    let counts = report.counts();
    bail!(
        "Import into {} did not complete: {} failed{}",
        report.target,
        counts.failed,
        if report.aborted.is_some() {
            ", run aborted"
        } else {
            ""
        }
    )
}
