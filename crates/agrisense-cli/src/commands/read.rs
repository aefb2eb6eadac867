//! Read command implementation.

use std::time::Duration;

use agrisense_core::Transport;
use anyhow::{Context, Result};

use crate::cli::{DeviceArgs, OutputArgs, OutputFormat};
use crate::commands::{CommandContext, connect};
use crate::config::resolve_device;
use crate::format::{format_frame_json, format_frame_text};
use crate::style;

const DEFAULT_FIRST_FRAME_SECS: u64 = 15;

pub async fn cmd_read(
    device: &DeviceArgs,
    output: &OutputArgs,
    ctx: &CommandContext<'_>,
) -> Result<()> {
    let choice = resolve_device(device, ctx.config)?;
    let connected = connect(&choice, device.timeout, ctx).await?;

    let result = match connected.transport {
        Transport::Wifi => connected.supervisor.fetch_latest(Transport::Wifi).await,
        Transport::Ble => {
            let wait = Duration::from_secs(device.timeout.unwrap_or(DEFAULT_FIRST_FRAME_SECS));
            let spinner = style::spinner("Waiting for a reading...", ctx.quiet);
            let frame = connected.supervisor.wait_for_first_frame(wait).await;
            spinner.finish_and_clear();
            frame
        }
    };
    let name = connected.name.clone();
    connected.close().await?;
    let frame = result.with_context(|| format!("Failed to read from {}", name))?;

    let content = match output.format {
        OutputFormat::Json => format!("{}\n", format_frame_json(&frame)?),
        OutputFormat::Text => format!(
            "{}\n{}",
            style::heading(&name, output.no_color),
            format_frame_text(&frame, output.no_color)
        ),
    };
    print!("{}", content);
    Ok(())
}
