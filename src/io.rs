use std::fmt::Display;
use std::sync::LazyLock;
use std::time::Instant;

use console::{Style, style};
use indicatif::ProgressStyle;

use crate::manifest::{EntryStatus, Report, RunStatus};

const ANSI_BLUE: Style = Style::new().blue();

/// How many failed entries the summary lists before eliding the rest.
const MAX_LISTED: usize = 10;

static PROGRESS_STYLE: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .expect("Error setting progress bar template")
        .progress_chars("#>-")
});

pub(crate) fn progress_style() -> ProgressStyle {
    PROGRESS_STYLE.clone()
}

pub fn as_overhead(s: Instant) -> impl Display {
    let e = Instant::now();
    let f = format!("(+{}ms)", e.duration_since(s).as_millis());
    ANSI_BLUE.apply_to(f)
}

/// Prints a human readable summary of a finished run to stderr.
pub fn print_summary(report: &Report) {
    let status = match report.status {
        RunStatus::Ok => style(report.status).green(),
        RunStatus::Partial => style(report.status).yellow(),
        RunStatus::Failed => style(report.status).red(),
    };

    eprintln!(
        "Archive finished: {} ({} verified, {} simulated, {} failed)",
        status.bold(),
        report.count(EntryStatus::Verified),
        report.count(EntryStatus::Simulated),
        report.count(EntryStatus::Failed),
    );

    if let Some(script) = &report.final_script_path {
        eprintln!("Script: {}", style(script).cyan());
    }

    let failed: Vec<_> = report.failed().collect();
    for entry in failed.iter().take(MAX_LISTED) {
        eprintln!(
            "  {} {} {}",
            style("✗").red(),
            entry.original,
            style(entry.error.as_deref().unwrap_or_default()).dim()
        );
    }
    if failed.len() > MAX_LISTED {
        eprintln!("  … and {} more", failed.len() - MAX_LISTED);
    }

    for error in &report.errors {
        eprintln!("{} {error}", style("error:").red().bold());
    }

    if !report.warnings.is_empty() {
        eprintln!(
            "{} {} warning(s), see the report for details",
            style("warning:").yellow().bold(),
            report.warnings.len()
        );
    }
}
