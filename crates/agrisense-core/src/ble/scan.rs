//! BLE advertisement scanning.
//!
//! A scan runs for a fixed duration (10 seconds by default). Matching
//! happens in software: sensors that advertise only their name would be
//! hidden by a service filter, so the hardware scan is filtered by service
//! only when no name prefix is configured. The hardware scan is stopped
//! before [`BleAdvertisementScanner::scan`] returns on every path, and a
//! [`ScanGuard`] stops it if the scan future is dropped mid-flight.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use agrisense_types::gatt::{DEVICE_NAME_PREFIX, TELEMETRY_SERVICE};
use agrisense_types::{DeviceDescriptor, Transport};

use crate::ble::{Advertisement, BleAdapter};
use crate::error::{Error, Result};
use crate::permissions::PermissionGate;

/// Default overall scan duration.
pub const DEFAULT_BLE_SCAN_DURATION: Duration = Duration::from_secs(10);

/// When a scan resolves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ScanMode {
    /// Resolve with the first matching advertisement.
    #[default]
    FirstMatch,
    /// Gather distinct matches until the duration elapses.
    Collect,
}

/// Options for [`BleAdvertisementScanner`].
#[derive(Debug, Clone)]
pub struct BleScanOptions {
    /// Overall scan duration.
    pub duration: Duration,
    /// Case-insensitive local name prefix.
    pub name_prefix: String,
    /// Service UUID used for matching, and for the hardware filter when
    /// `name_prefix` is empty.
    pub service: Uuid,
    /// Resolution mode.
    pub mode: ScanMode,
}

impl Default for BleScanOptions {
    fn default() -> Self {
        Self {
            duration: DEFAULT_BLE_SCAN_DURATION,
            name_prefix: DEVICE_NAME_PREFIX.to_string(),
            service: TELEMETRY_SERVICE,
            mode: ScanMode::default(),
        }
    }
}

impl BleScanOptions {
    /// Create options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the scan duration.
    #[must_use]
    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Set the name prefix.
    #[must_use]
    pub fn name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    /// Set the resolution mode.
    #[must_use]
    pub fn mode(mut self, mode: ScanMode) -> Self {
        self.mode = mode;
        self
    }

    /// Validate the options.
    pub fn validate(&self) -> Result<()> {
        if self.duration.is_zero() {
            return Err(Error::invalid_config("BLE scan duration must be > 0"));
        }
        Ok(())
    }

    /// Service UUIDs to pass to the hardware scan.
    pub fn hardware_filter(&self) -> Vec<Uuid> {
        if self.name_prefix.is_empty() {
            vec![self.service]
        } else {
            Vec::new()
        }
    }

    /// Whether an advertisement belongs to the sensor family.
    pub fn matches(&self, advertisement: &Advertisement) -> bool {
        if advertisement.services.contains(&self.service) {
            return true;
        }
        match &advertisement.local_name {
            Some(name) if !self.name_prefix.is_empty() => name
                .to_lowercase()
                .starts_with(&self.name_prefix.to_lowercase()),
            _ => false,
        }
    }
}

/// Stops a running hardware scan when dropped.
///
/// Call [`ScanGuard::stop`] on normal exit paths; the drop path spawns the
/// stop on the current runtime.
pub struct ScanGuard {
    adapter: Option<Arc<dyn BleAdapter>>,
}

impl ScanGuard {
    /// Guard a scan that has already been started on `adapter`.
    pub fn new(adapter: Arc<dyn BleAdapter>) -> Self {
        Self {
            adapter: Some(adapter),
        }
    }

    /// Stop the scan now.
    pub async fn stop(mut self) -> Result<()> {
        match self.adapter.take() {
            Some(adapter) => adapter.stop_scan().await,
            None => Ok(()),
        }
    }
}

impl Drop for ScanGuard {
    fn drop(&mut self) {
        if let Some(adapter) = self.adapter.take() {
            if let Ok(handle) = Handle::try_current() {
                handle.spawn(async move {
                    if let Err(e) = adapter.stop_scan().await {
                        warn!("Failed to stop BLE scan in guard drop: {}", e);
                    }
                });
            } else {
                warn!("No tokio runtime available to stop BLE scan in guard drop");
            }
        }
    }
}

/// Finds sensors by their BLE advertisements.
pub struct BleAdvertisementScanner {
    adapter: Arc<dyn BleAdapter>,
    permissions: Arc<dyn PermissionGate>,
    options: BleScanOptions,
}

impl std::fmt::Debug for BleAdvertisementScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BleAdvertisementScanner")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl BleAdvertisementScanner {
    /// Create a scanner.
    pub fn new(
        adapter: Arc<dyn BleAdapter>,
        permissions: Arc<dyn PermissionGate>,
        options: BleScanOptions,
    ) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            adapter,
            permissions,
            options,
        })
    }

    /// The scan options.
    pub fn options(&self) -> &BleScanOptions {
        &self.options
    }

    /// Scan until the first match ([`ScanMode::FirstMatch`]), the duration
    /// elapses, or `cancel` fires.
    ///
    /// Elapsing without a match is not an error; the result is simply
    /// empty. `on_found` is called once per distinct matching peripheral.
    #[tracing::instrument(level = "info", skip_all, fields(mode = ?self.options.mode))]
    pub async fn scan<F>(
        &self,
        cancel: &CancellationToken,
        mut on_found: F,
    ) -> Result<Vec<DeviceDescriptor>>
    where
        F: FnMut(&DeviceDescriptor) + Send,
    {
        self.permissions.require(Transport::Ble)?;

        info!(
            "Starting BLE scan for {} seconds...",
            self.options.duration.as_secs()
        );
        self.adapter
            .start_scan(&self.options.hardware_filter())
            .await?;
        let guard = ScanGuard::new(Arc::clone(&self.adapter));

        let result = self.collect(cancel, &mut on_found).await;

        if let Err(e) = guard.stop().await {
            warn!("Failed to stop BLE scan: {}", e);
        }

        let found = result?;
        info!("BLE scan complete. Found {} device(s)", found.len());
        Ok(found)
    }

    async fn collect<F>(
        &self,
        cancel: &CancellationToken,
        on_found: &mut F,
    ) -> Result<Vec<DeviceDescriptor>>
    where
        F: FnMut(&DeviceDescriptor) + Send,
    {
        let mut advertisements = self.adapter.advertisements().await?;
        let deadline = tokio::time::sleep(self.options.duration);
        tokio::pin!(deadline);

        let mut seen = HashSet::new();
        let mut found = Vec::new();

        loop {
            let advertisement = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("BLE scan cancelled");
                    break;
                }
                _ = &mut deadline => {
                    debug!("BLE scan duration elapsed");
                    break;
                }
                next = advertisements.next() => match next {
                    Some(advertisement) => advertisement,
                    None => break,
                },
            };

            if !self.options.matches(&advertisement) || !seen.insert(advertisement.id.clone()) {
                continue;
            }

            let descriptor = descriptor_for(&advertisement);
            info!(
                "Found sensor {} ({})",
                descriptor.display_name(),
                descriptor.address()
            );
            on_found(&descriptor);
            found.push(descriptor);

            if self.options.mode == ScanMode::FirstMatch {
                break;
            }
        }

        Ok(found)
    }
}

fn descriptor_for(advertisement: &Advertisement) -> DeviceDescriptor {
    let name = advertisement
        .local_name
        .clone()
        .unwrap_or_else(|| format!("{} {}", DEVICE_NAME_PREFIX, advertisement.id));
    DeviceDescriptor::ble(advertisement.id.clone(), name, advertisement.rssi)
}
