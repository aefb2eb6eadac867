//! CLI argument definitions using clap.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Output format for commands
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Which sensor to talk to. Falls back to the config file when neither
/// flag is given.
#[derive(Debug, Clone, Default, Args)]
pub struct DeviceArgs {
    /// WiFi sensor address (`host`, `host:port` or `http://host[:port]/path`)
    #[arg(short = 'w', long, conflicts_with = "ble")]
    pub wifi: Option<String>,

    /// BLE peripheral id (MAC address, or UUID on macOS)
    #[arg(short = 'b', long)]
    pub ble: Option<String>,

    /// Connection / first-reading timeout in seconds
    #[arg(short = 'T', long)]
    pub timeout: Option<u64>,
}

/// Reusable output arguments
#[derive(Debug, Clone, Args)]
pub struct OutputArgs {
    /// Output format
    #[arg(short, long, value_enum, default_value = "text")]
    pub format: OutputFormat,

    /// Disable colored output
    #[arg(long, env = "NO_COLOR")]
    pub no_color: bool,
}

#[derive(Parser)]
#[command(name = "agrisense")]
#[command(author, version, about = "CLI for AgriSense soil and sample sensors", long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Config file (default: platform config dir /agrisense/config.toml)
    #[arg(long, global = true, env = "AGRISENSE_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Discover sensors on the local network or over BLE
    Scan {
        #[command(subcommand)]
        transport: ScanCommand,
    },

    /// Read the current values once
    Read {
        #[command(flatten)]
        device: DeviceArgs,

        #[command(flatten)]
        output: OutputArgs,
    },

    /// Poll a sensor at a fixed interval until Ctrl+C
    Watch {
        #[command(flatten)]
        device: DeviceArgs,

        /// Poll interval in seconds
        #[arg(short, long)]
        interval: Option<u64>,

        /// Stop after this many readings (0 = unlimited)
        #[arg(short = 'n', long, default_value = "0")]
        count: u32,

        /// Substitute simulated readings after repeated all-zero readings
        #[arg(long)]
        simulate_on_zero: bool,

        #[command(flatten)]
        output: OutputArgs,
    },

    /// Collect a timed multi-sample session and print the averages
    Session {
        #[command(flatten)]
        device: DeviceArgs,

        /// Number of samples
        #[arg(short = 'n', long)]
        samples: Option<usize>,

        /// Session length in seconds
        #[arg(short, long)]
        duration: Option<u64>,

        /// Substitute simulated samples after repeated all-zero samples
        #[arg(long)]
        simulate_on_zero: bool,

        #[command(flatten)]
        output: OutputArgs,
    },

    /// Show or create the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the config file path
    Path,

    /// Print the effective configuration
    Show,

    /// Write a config file with the default values
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
pub enum ScanCommand {
    /// Probe common private subnets for the HTTP telemetry endpoint
    Wifi {
        /// Concurrent probes per batch
        #[arg(long)]
        batch_size: Option<usize>,

        /// Per-probe timeout in milliseconds
        #[arg(long)]
        probe_timeout_ms: Option<u64>,

        /// Extra /24 ranges to sweep, as `a.b.c` (repeatable)
        #[arg(short, long = "range", value_delimiter = ',')]
        ranges: Vec<String>,

        #[command(flatten)]
        output: OutputArgs,
    },

    /// Listen for sensor advertisements
    Ble {
        /// Scan duration in seconds
        #[arg(short, long)]
        duration: Option<u64>,

        /// Keep scanning for the whole duration instead of stopping at the first sensor
        #[arg(short, long)]
        all: bool,

        #[command(flatten)]
        output: OutputArgs,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_scan_wifi_ranges() {
        let cli = Cli::try_parse_from([
            "agrisense", "scan", "wifi", "--range", "10.1.1,10.1.2", "--batch-size", "5",
        ])
        .unwrap();
        match cli.command {
            Commands::Scan {
                transport: ScanCommand::Wifi { ranges, batch_size, .. },
            } => {
                assert_eq!(ranges, vec!["10.1.1", "10.1.2"]);
                assert_eq!(batch_size, Some(5));
            }
            _ => panic!("expected scan wifi"),
        }
    }

    #[test]
    fn test_wifi_and_ble_conflict() {
        let result = Cli::try_parse_from([
            "agrisense", "read", "--wifi", "10.0.0.2", "--ble", "AA:BB:CC:DD:EE:FF",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_watch_defaults() {
        let cli = Cli::try_parse_from(["agrisense", "watch", "--wifi", "10.0.0.2"]).unwrap();
        match cli.command {
            Commands::Watch {
                device,
                interval,
                count,
                simulate_on_zero,
                output,
            } => {
                assert_eq!(device.wifi.as_deref(), Some("10.0.0.2"));
                assert_eq!(interval, None);
                assert_eq!(count, 0);
                assert!(!simulate_on_zero);
                assert_eq!(output.format, OutputFormat::Text);
            }
            _ => panic!("expected watch"),
        }
    }
}
