//! Scan command implementation.

use std::sync::Arc;

use agrisense_core::{
    BleAdvertisementScanner, BtleplugAdapter, DeviceProbe, NetworkDeviceScanner, ScanEvent,
    ScanMode,
};
use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cli::OutputArgs;
use crate::cli::OutputFormat;
use crate::commands::CommandContext;
use crate::format::{format_devices_json, format_devices_text};
use crate::style;

/// Cancel `token` on Ctrl+C so a scan returns what it found so far.
fn cancel_on_ctrl_c(token: &CancellationToken) {
    let token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            debug!("Ctrl+C received, stopping scan");
            token.cancel();
        }
    });
}

pub async fn cmd_scan_wifi(
    batch_size: Option<usize>,
    probe_timeout_ms: Option<u64>,
    ranges: &[String],
    output: &OutputArgs,
    ctx: &CommandContext<'_>,
) -> Result<()> {
    let config = ctx.config;
    let options = config.network_scan_options(batch_size, probe_timeout_ms, ranges)?;
    let prober = Arc::new(
        DeviceProbe::with_options(options.probe.clone()).context("Invalid probe options")?,
    );
    let scanner = NetworkDeviceScanner::new(prober, Arc::new(config.permissions()), options)?;

    let show_progress = !ctx.quiet && output.format == OutputFormat::Text;
    let bar = style::progress_bar(
        scanner.options().plan.total() as u64,
        "Probing network...",
        !show_progress,
    );

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(&cancel);

    let devices = scanner
        .scan(&cancel, |event| match event {
            ScanEvent::Progress(progress) => bar.set_position(progress.current as u64),
            ScanEvent::DeviceFound(device) => {
                bar.println(format!("Found {} at {}", device.display_name(), device.address()));
            }
        })
        .await
        .context("Network scan failed")?;
    bar.finish_and_clear();

    let content = match output.format {
        OutputFormat::Json => format_devices_json(&devices)?,
        OutputFormat::Text => format_devices_text(&devices, output.no_color),
    };
    print!("{}", content);
    if cancel.is_cancelled() && !ctx.quiet {
        eprintln!("Scan interrupted; results are partial.");
    }
    Ok(())
}

pub async fn cmd_scan_ble(
    duration_secs: Option<u64>,
    all: bool,
    output: &OutputArgs,
    ctx: &CommandContext<'_>,
) -> Result<()> {
    let config = ctx.config;
    let mode = if all {
        ScanMode::Collect
    } else {
        ScanMode::FirstMatch
    };
    let options = config.ble_scan_options(duration_secs).mode(mode);
    let secs = options.duration.as_secs();

    let adapter = Arc::new(
        BtleplugAdapter::new()
            .await
            .context("Failed to open Bluetooth adapter")?,
    );
    let scanner = BleAdvertisementScanner::new(adapter, Arc::new(config.permissions()), options)?;

    let show_progress = !ctx.quiet && output.format == OutputFormat::Text;
    let spinner = style::spinner(
        format!("Scanning for AgriSense sensors... ({}s)", secs),
        !show_progress,
    );

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(&cancel);

    let devices = scanner
        .scan(&cancel, |device| {
            spinner.set_message(format!("Found {}", device.display_name()));
        })
        .await
        .context("BLE scan failed")?;
    spinner.finish_and_clear();

    let content = match output.format {
        OutputFormat::Json => format_devices_json(&devices)?,
        OutputFormat::Text => format_devices_text(&devices, output.no_color),
    };
    print!("{}", content);
    Ok(())
}
