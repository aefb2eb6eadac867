//! Watch command implementation.
//!
//! Holds one connection open and prints every reading the poller delivers
//! until Ctrl+C or the requested count is reached.

use std::sync::Arc;

use agrisense_core::{TelemetryFrame, TelemetryPoller, TransportTelemetry};
use anyhow::Result;
use tokio::sync::mpsc;
use tracing::info;

use crate::cli::{DeviceArgs, OutputArgs, OutputFormat};
use crate::commands::{CommandContext, connect};
use crate::config::resolve_device;
use crate::format::{format_frame_json, format_frame_line};

/// Arguments for the watch command.
pub struct WatchArgs<'a> {
    pub device: &'a DeviceArgs,
    pub interval: Option<u64>,
    pub count: u32,
    pub simulate_on_zero: bool,
    pub output: &'a OutputArgs,
}

pub async fn cmd_watch(args: WatchArgs<'_>, ctx: &CommandContext<'_>) -> Result<()> {
    let WatchArgs {
        device,
        interval,
        count,
        simulate_on_zero,
        output,
    } = args;

    let choice = resolve_device(device, ctx.config)?;
    let options = ctx.config.poller_options(interval, simulate_on_zero);
    let connected = connect(&choice, device.timeout, ctx).await?;

    if !ctx.quiet {
        eprintln!(
            "Watching {} every {}s (Ctrl+C to stop)",
            connected.name,
            options.interval.as_secs()
        );
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<TelemetryFrame>();
    let source = Arc::new(TransportTelemetry::new(
        connected.supervisor.clone(),
        connected.transport,
    ));
    let mut poller = TelemetryPoller::start(source, options, move |frame| {
        let _ = tx.send(frame);
    })?;

    let mut printed: u32 = 0;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                match output.format {
                    OutputFormat::Json => println!("{}", format_frame_json(&frame)?),
                    OutputFormat::Text => {
                        println!("{}", format_frame_line(&frame, output.no_color))
                    }
                }
                printed += 1;
                if count > 0 && printed >= count {
                    break;
                }
            }
        }
    }

    poller.stop().await;
    let stats = poller.stats();
    if !ctx.quiet {
        eprintln!(
            "Stopped after {} reading(s), {} failed fetch(es)",
            printed, stats.errors
        );
    }
    connected.close().await
}
