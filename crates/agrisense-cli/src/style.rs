//! Spinners, progress bars and colors for terminal output.

use std::time::Duration;

use agrisense_types::Metric;
use indicatif::{ProgressBar, ProgressStyle};
use owo_colors::OwoColorize;

/// Braille dots animation
const SPINNER_TICK_CHARS: &str = "⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏";

const SPINNER_TICK_MS: u64 = 80;

const PROGRESS_CHARS: &str = "=>-";

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{spinner:.cyan} {msg}")
        .expect("valid template")
        .tick_chars(SPINNER_TICK_CHARS)
}

fn progress_bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .expect("valid template")
        .progress_chars(PROGRESS_CHARS)
}

/// A spinner with `message`, hidden when `quiet`.
pub fn spinner(message: impl Into<String>, quiet: bool) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new_spinner();
    pb.set_style(spinner_style());
    pb.set_message(message.into());
    pb.enable_steady_tick(Duration::from_millis(SPINNER_TICK_MS));
    pb
}

/// A bar over `len` steps, hidden when `quiet`.
pub fn progress_bar(len: u64, message: impl Into<String>, quiet: bool) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len);
    pb.set_style(progress_bar_style());
    pb.set_message(message.into());
    pb.enable_steady_tick(Duration::from_millis(SPINNER_TICK_MS));
    pb
}

/// Format a metric value, colored by a rough agronomic band.
pub fn format_value(metric: Option<Metric>, value: f64, no_color: bool) -> String {
    let text = format!("{value:.1}");
    if no_color {
        return text;
    }
    match metric.map(|m| band(m, value)) {
        Some(Band::Good) => text.green().to_string(),
        Some(Band::Marginal) => text.yellow().to_string(),
        Some(Band::Poor) => text.red().to_string(),
        None => text,
    }
}

/// Dim helper text.
pub fn dim(text: &str, no_color: bool) -> String {
    if no_color {
        text.to_string()
    } else {
        text.dimmed().to_string()
    }
}

/// Bold heading text.
pub fn heading(text: &str, no_color: bool) -> String {
    if no_color {
        text.to_string()
    } else {
        text.bold().to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Band {
    Good,
    Marginal,
    Poor,
}

fn band(metric: Metric, value: f64) -> Band {
    let (good, marginal) = match metric {
        Metric::Ph => ((6.0, 7.5), (5.5, 8.0)),
        Metric::Moisture => ((25.0, 60.0), (15.0, 75.0)),
        _ => return Band::Good,
    };
    if value >= good.0 && value <= good.1 {
        Band::Good
    } else if value >= marginal.0 && value <= marginal.1 {
        Band::Marginal
    } else {
        Band::Poor
    }
}
