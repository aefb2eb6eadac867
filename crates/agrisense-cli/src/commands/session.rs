//! Session command implementation.

use agrisense_core::{ReadingSession, TransportTelemetry};
use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::cli::{DeviceArgs, OutputArgs, OutputFormat};
use crate::commands::{CommandContext, connect};
use crate::config::resolve_device;
use crate::format::{format_summary_json, format_summary_text};
use crate::style;

pub async fn cmd_session(
    device: &DeviceArgs,
    samples: Option<usize>,
    duration_secs: Option<u64>,
    simulate_on_zero: bool,
    output: &OutputArgs,
    ctx: &CommandContext<'_>,
) -> Result<()> {
    let choice = resolve_device(device, ctx.config)?;
    let mut session = ReadingSession::new(ctx.config.session_config(
        samples,
        duration_secs,
        simulate_on_zero,
    ))?;
    let connected = connect(&choice, device.timeout, ctx).await?;

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let show_progress = !ctx.quiet && output.format == OutputFormat::Text;
    let bar = style::progress_bar(100, format!("Sampling {}", connected.name), !show_progress);
    let source = TransportTelemetry::new(connected.supervisor.clone(), connected.transport);
    let result = session
        .run(&source, &cancel, |progress| {
            bar.set_position((progress.fraction * 100.0).round() as u64);
            bar.set_message(format!("{} sample(s)", progress.samples));
        })
        .await;
    bar.finish_and_clear();
    connected.close().await?;
    let summary = result.context("Session failed")?;

    let content = match output.format {
        OutputFormat::Json => format!("{}\n", format_summary_json(&summary)?),
        OutputFormat::Text => format_summary_text(&summary, output.no_color),
    };
    print!("{}", content);
    Ok(())
}
