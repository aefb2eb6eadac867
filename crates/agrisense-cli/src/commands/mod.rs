//! Command implementations for the CLI.

mod config;
mod read;
mod scan;
mod session;
mod watch;

use std::sync::Arc;
use std::time::Duration;

use agrisense_core::{
    BleAdvertisementScanner, BtleplugAdapter, ConnectionConfig, ConnectionSupervisor,
    DeviceDescriptor, DeviceProbe, ScanMode, Transport,
};
use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{Config, DeviceChoice};
use crate::style;

pub use config::cmd_config;
pub use read::cmd_read;
pub use scan::{cmd_scan_ble, cmd_scan_wifi};
pub use session::cmd_session;
pub use watch::{WatchArgs, cmd_watch};

/// Settings every command shares.
pub struct CommandContext<'a> {
    pub config: &'a Config,
    pub quiet: bool,
}

/// A live connection held for the duration of one command.
pub struct Connected {
    pub supervisor: Arc<ConnectionSupervisor>,
    pub transport: Transport,
    pub name: String,
}

impl Connected {
    pub async fn close(self) -> Result<()> {
        self.supervisor
            .close()
            .await
            .context("Failed to close connection")
    }
}

/// Connect to the chosen sensor.
///
/// BLE needs the adapter to have seen the peripheral advertise, so a short
/// scan runs first and stops as soon as the id shows up.
pub async fn connect(
    choice: &DeviceChoice,
    timeout_secs: Option<u64>,
    ctx: &CommandContext<'_>,
) -> Result<Connected> {
    let config = ctx.config;
    let permissions = Arc::new(config.permissions());
    let prober = Arc::new(
        DeviceProbe::with_options(config.probe_options(None))
            .context("Invalid probe options")?,
    );
    let connection = ConnectionConfig::new()
        .connection_timeout(Duration::from_secs(
            timeout_secs.unwrap_or(config.ble.connect_timeout_secs),
        ))
        .http_path(config.wifi.path.clone());

    match choice {
        DeviceChoice::Wifi(target) => {
            let supervisor = Arc::new(
                ConnectionSupervisor::new(prober, permissions).with_config(connection)?,
            );
            let descriptor = DeviceDescriptor::wifi(target, target.address(), None);
            let handle = supervisor.connect(&descriptor).await?;
            Ok(Connected {
                supervisor,
                transport: Transport::Wifi,
                name: handle.display_name,
            })
        }
        DeviceChoice::Ble(id) => {
            let adapter = Arc::new(
                BtleplugAdapter::new()
                    .await
                    .context("Failed to open Bluetooth adapter")?,
            );

            let spinner = style::spinner(format!("Looking for {}...", id), ctx.quiet);
            let scanner = BleAdvertisementScanner::new(
                adapter.clone(),
                permissions.clone(),
                config.ble_scan_options(None).mode(ScanMode::Collect),
            )?;
            let found_cancel = CancellationToken::new();
            let wanted = id.to_lowercase();
            let devices = scanner
                .scan(&found_cancel, |device| {
                    if device.address().to_lowercase() == wanted {
                        found_cancel.cancel();
                    }
                })
                .await;
            spinner.finish_and_clear();

            let name = devices?
                .into_iter()
                .find(|d| d.address().to_lowercase() == wanted)
                .map(|d| d.display_name().to_string())
                .unwrap_or_else(|| {
                    debug!("{} did not advertise during the scan", id);
                    id.clone()
                });

            let supervisor = Arc::new(
                ConnectionSupervisor::new(prober, permissions)
                    .with_ble_adapter(adapter)
                    .with_config(connection)?,
            );
            let spinner = style::spinner(format!("Connecting to {}...", name), ctx.quiet);
            let result = supervisor
                .connect(&DeviceDescriptor::ble(id.clone(), name, None))
                .await;
            spinner.finish_and_clear();
            let handle = result.with_context(|| format!("Failed to connect to {}", id))?;
            info!("Connected to {} ({})", handle.display_name, handle.address);

            Ok(Connected {
                supervisor,
                transport: Transport::Ble,
                name: handle.display_name,
            })
        }
    }
}
