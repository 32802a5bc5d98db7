use std::io::Write;

use nora_translation::{ReadinessState, TranslationResult};
use owo_colors::OwoColorize;

/// Whether to use colored output.
#[derive(Debug, Clone, Copy)]
pub struct ColorMode(pub bool);

impl ColorMode {
    pub fn enabled(&self) -> bool {
        self.0
    }
}

/// Print a one-line summary of the record, then the record itself as JSON.
pub fn print_result(
    w: &mut dyn Write,
    result: &TranslationResult,
    color: ColorMode,
) -> anyhow::Result<()> {
    let title = result.title().unwrap_or("(untitled)");
    let item_type = result.item_type().unwrap_or("item");
    let year = result.year().map(|y| format!(" ({y})")).unwrap_or_default();
    if color.enabled() {
        writeln!(w, "{}{} [{}]", title.bold(), year, item_type.dimmed())?;
    } else {
        writeln!(w, "{}{} [{}]", title, year, item_type)?;
    }

    let authors = result.authors();
    if !authors.is_empty() {
        let names: Vec<String> = authors
            .iter()
            .map(|a| format!("{} {}", a.first_name, a.last_name))
            .collect();
        writeln!(w, "  {}", names.join(", "))?;
    }
    if let Some(doi) = result.doi() {
        writeln!(w, "  DOI: {}", doi)?;
    }
    writeln!(w)?;
    writeln!(w, "{}", serde_json::to_string_pretty(result)?)?;
    Ok(())
}

pub fn print_status(
    w: &mut dyn Write,
    base_url: &str,
    state: ReadinessState,
    owner: Option<u32>,
    color: ColorMode,
) -> std::io::Result<()> {
    let label = match state {
        ReadinessState::Ready => "ready",
        ReadinessState::Starting => "starting",
        ReadinessState::NotRunning => "not running",
    };
    if color.enabled() {
        match state {
            ReadinessState::Ready => writeln!(w, "{} {}", base_url, label.green().bold())?,
            ReadinessState::Starting => writeln!(w, "{} {}", base_url, label.yellow())?,
            ReadinessState::NotRunning => writeln!(w, "{} {}", base_url, label.red())?,
        }
    } else {
        writeln!(w, "{} {}", base_url, label)?;
    }
    match owner {
        Some(pid) => writeln!(w, "  port owner: pid {}", pid)?,
        None => writeln!(w, "  port owner: unknown")?,
    }
    Ok(())
}

/// Print one `doctor` line; `Err` carries the failure message.
pub fn print_check(
    w: &mut dyn Write,
    name: &str,
    outcome: &Result<String, String>,
    color: ColorMode,
) -> std::io::Result<()> {
    match (outcome, color.enabled()) {
        (Ok(detail), true) => writeln!(w, "{} {}: {}", "[ok]".green(), name, detail),
        (Ok(detail), false) => writeln!(w, "[ok] {}: {}", name, detail),
        (Err(msg), true) => writeln!(w, "{} {}: {}", "[fail]".red().bold(), name, msg),
        (Err(msg), false) => writeln!(w, "[fail] {}: {}", name, msg),
    }
}
