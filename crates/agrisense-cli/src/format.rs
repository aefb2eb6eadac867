//! Text and JSON rendering of readings, devices and session summaries.

use std::fmt::Write as _;

use agrisense_core::SessionSummary;
use agrisense_types::{DeviceDescriptor, Metric, TelemetryFrame};
use anyhow::Result;
use serde_json::{Value, json};
use time::format_description::well_known::Rfc3339;

use crate::style;

fn unit_suffix(metric: Option<Metric>) -> String {
    match metric.map(|m| m.unit()) {
        Some(unit) if !unit.is_empty() => format!(" {unit}"),
        _ => String::new(),
    }
}

/// Multi-line text view of one reading.
pub fn format_frame_text(frame: &TelemetryFrame, no_color: bool) -> String {
    let mut out = String::new();
    let width = frame.values().map(|(k, _)| k.len()).max().unwrap_or(0);
    for (key, value) in frame.values() {
        let metric = Metric::recognize(key);
        let _ = writeln!(
            out,
            "  {:<width$}  {}{}",
            key,
            style::format_value(metric, value, no_color),
            unit_suffix(metric),
        );
    }
    if frame.is_simulated() {
        let _ = writeln!(out, "  {}", style::dim("(simulated)", no_color));
    }
    out
}

/// Single-line text view, used by `watch`.
pub fn format_frame_line(frame: &TelemetryFrame, no_color: bool) -> String {
    let time = frame
        .captured_at()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "-".to_string());
    let values: Vec<String> = frame
        .values()
        .map(|(key, value)| {
            let metric = Metric::recognize(key);
            format!(
                "{key}={}{}",
                style::format_value(metric, value, no_color),
                unit_suffix(metric)
            )
        })
        .collect();
    let mut line = format!("[{}] {}", style::dim(&time, no_color), values.join("  "));
    if frame.is_simulated() {
        line.push_str("  (simulated)");
    }
    line
}

pub fn format_frame_json(frame: &TelemetryFrame) -> Result<String> {
    Ok(serde_json::to_string(frame)?)
}

pub fn format_devices_text(devices: &[DeviceDescriptor], no_color: bool) -> String {
    if devices.is_empty() {
        return "No sensors found.\n".to_string();
    }
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{}",
        style::heading(&format!("Found {} sensor(s):", devices.len()), no_color)
    );
    for device in devices {
        let signal = device
            .signal_strength()
            .map(|rssi| format!("  {rssi} dBm"))
            .unwrap_or_default();
        let _ = writeln!(
            out,
            "  {:<24} {:<6} {}{}",
            device.display_name(),
            device.transport(),
            device.address(),
            style::dim(&signal, no_color),
        );
        if let Some(reading) = device.last_known_reading() {
            out.push_str(&format_frame_text(reading, no_color).replace("\n  ", "\n      "));
        }
    }
    out
}

pub fn format_devices_json(devices: &[DeviceDescriptor]) -> Result<String> {
    Ok(serde_json::to_string_pretty(devices)?)
}

fn summary_value(summary: &SessionSummary) -> Value {
    let means: serde_json::Map<String, Value> = summary
        .aggregate
        .iter()
        .flat_map(|a| a.means())
        .map(|(key, mean)| (key.to_string(), json!(mean)))
        .collect();
    json!({
        "samples": summary.samples,
        "elapsed_ms": summary.elapsed.as_millis() as u64,
        "stopped_early": summary.stopped_early,
        "includes_simulated": summary.includes_simulated,
        "means": means,
    })
}

pub fn format_summary_json(summary: &SessionSummary) -> Result<String> {
    Ok(serde_json::to_string_pretty(&summary_value(summary))?)
}

pub fn format_summary_text(summary: &SessionSummary, no_color: bool) -> String {
    let mut out = String::new();
    let status = if summary.stopped_early {
        " (stopped early)"
    } else {
        ""
    };
    let _ = writeln!(
        out,
        "{}",
        style::heading(
            &format!(
                "Session: {} sample(s) in {:.1}s{}",
                summary.samples,
                summary.elapsed.as_secs_f64(),
                status
            ),
            no_color
        )
    );
    match &summary.aggregate {
        Some(aggregate) => {
            out.push_str(&format_frame_text(&aggregate.to_frame(), no_color));
            if summary.includes_simulated {
                let _ = writeln!(out, "  {}", style::dim("includes simulated samples", no_color));
            }
        }
        None => out.push_str("  No readings collected.\n"),
    }
    out
}
