use assetkit::{EntityOutcome, EntityState, ExportReport, ImportReport};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Print an info message
pub fn info(msg: &str) {
    println!("{} {}", "ℹ".blue(), msg);
}

/// Print a success message
pub fn success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

/// Print a warning message
pub fn warn(msg: &str) {
    println!("{} {}", "⚠".yellow(), msg);
}

/// Print an error message
pub fn error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

/// Print a dim/muted message
pub fn dim(msg: &str) {
    println!("  {}", msg.dimmed());
}

/// Print a header/title
pub fn header(title: &str) {
    println!();
    println!("{}", title.bold());
    println!("{}", "─".repeat(title.chars().count()).dimmed());
}

/// Print a section header
pub fn section(title: &str) {
    println!();
    println!("{}", title.cyan().bold());
}

/// Print a key-value pair
pub fn kv(key: &str, value: &str) {
    println!("  {}: {}", key.dimmed(), value);
}

/// Print a step indicator
pub fn step(num: usize, total: usize, msg: &str) {
    println!("{} {}", format!("[{}/{}]", num, total).blue().bold(), msg);
}

// ============================================================================
// Progress
// ============================================================================

/// Spinner on stderr; hidden when `quiet`.
pub fn spinner(msg: &str, quiet: bool) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

// ============================================================================
// Reports
// ============================================================================

pub fn print_export_report(report: &ExportReport) {
    header(&format!("Export from {}", report.source_env));
    for (kind, count) in &report.bundled {
        kv(kind.dir_name(), &count.to_string());
    }

    if !report.external.is_empty() {
        section("External references");
        for ext in &report.external {
            dim(&format!("{} → {} {}", ext.from, ext.kind, ext.uuid));
        }
    }

    if !report.failures.is_empty() {
        section("Not exported");
        for failure in &report.failures {
            println!(
                "  {} {} {} ({}): {}",
                "✗".red(),
                failure.kind,
                failure.name.bold(),
                failure.error.kind.description(),
                failure.error.message
            );
        }
    }

    println!();
    if report.is_success() {
        success(&format!("{} entities bundled", report.total_bundled()));
    } else {
        warn(&format!(
            "{} entities bundled, {} dropped",
            report.total_bundled(),
            report.failures.len()
        ));
    }
}

fn outcome_line(outcome: &EntityOutcome) -> String {
    let label = format!("{} {}", outcome.kind, outcome.name.bold());
    match &outcome.state {
        EntityState::Created => format!("{} {}", "+".green(), label),
        EntityState::Updated => format!("{} {}", "~".yellow(), label),
        EntityState::Skipped { reason } => {
            format!("{} {} {}", "-".dimmed(), label, format!("({reason})").dimmed())
        }
        EntityState::Failed => {
            let detail = outcome
                .error
                .as_ref()
                .map(|e| format!("{}: {}", e.kind.description(), e.message))
                .unwrap_or_default();
            format!(
                "{} {} {} {}",
                "✗".red(),
                label,
                format!("[{}]", outcome.phase_reached).dimmed(),
                detail.red()
            )
        }
    }
}

pub fn print_import_report(report: &ImportReport) {
    let title = if report.dry_run {
        format!("Import into {} (dry run)", report.target)
    } else {
        format!("Import into {}", report.target)
    };
    header(&title);

    for outcome in &report.outcomes {
        println!("  {}", outcome_line(outcome));
    }

    if let Some(aborted) = &report.aborted {
        println!();
        error(&format!(
            "Run aborted ({}): {}",
            aborted.kind.description(),
            aborted.message
        ));
        dim(aborted.kind.advice());
    }

    let counts = report.counts();
    let summary = format!(
        "{} created, {} updated, {} skipped, {} failed",
        counts.created, counts.updated, counts.skipped, counts.failed
    );
    println!();
    if report.is_success() {
        success(&summary);
    } else {
        warn(&summary);
    }
}
