use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
mod commands;
mod config;
mod format;
mod style;

use cli::{Cli, Commands, ScanCommand};
use commands::{CommandContext, WatchArgs};
use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so JSON output on stdout stays clean.
    let filter = if cli.quiet {
        EnvFilter::new("warn")
    } else if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load(cli.config.as_deref());
    let ctx = CommandContext {
        config: &config,
        quiet: cli.quiet,
    };

    match cli.command {
        Commands::Scan { transport } => match transport {
            ScanCommand::Wifi {
                batch_size,
                probe_timeout_ms,
                ranges,
                output,
            } => {
                commands::cmd_scan_wifi(batch_size, probe_timeout_ms, &ranges, &output, &ctx).await
            }
            ScanCommand::Ble {
                duration,
                all,
                output,
            } => commands::cmd_scan_ble(duration, all, &output, &ctx).await,
        },
        Commands::Read { device, output } => commands::cmd_read(&device, &output, &ctx).await,
        Commands::Watch {
            device,
            interval,
            count,
            simulate_on_zero,
            output,
        } => {
            commands::cmd_watch(
                WatchArgs {
                    device: &device,
                    interval,
                    count,
                    simulate_on_zero,
                    output: &output,
                },
                &ctx,
            )
            .await
        }
        Commands::Session {
            device,
            samples,
            duration,
            simulate_on_zero,
            output,
        } => {
            commands::cmd_session(&device, samples, duration, simulate_on_zero, &output, &ctx)
                .await
        }
        Commands::Config { action } => commands::cmd_config(action, cli.config.as_deref(), &config),
    }
}
