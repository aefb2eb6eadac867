//! Local-network sensor discovery.
//!
//! The scanner walks a [`ScanPlan`]: the sensor's access-point address is
//! probed alone first, then each address range is swept in fixed-size
//! batches. A batch must fully resolve before the next one starts, so at most
//! `batch_size` probes are ever in flight.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use agrisense_core::network::{NetworkDeviceScanner, NetworkScanOptions, ScanEvent};
//! use agrisense_core::{DeviceProbe, Permissions};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> agrisense_core::Result<()> {
//! let scanner = NetworkDeviceScanner::new(
//!     Arc::new(DeviceProbe::new()?),
//!     Arc::new(Permissions::granted()),
//!     NetworkScanOptions::default(),
//! )?;
//! let found = scanner
//!     .scan(&CancellationToken::new(), |event| {
//!         if let ScanEvent::DeviceFound(device) = event {
//!             println!("{}", device.address());
//!         }
//!     })
//!     .await?;
//! println!("{} sensors", found.len());
//! # Ok(())
//! # }
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use agrisense_types::{DeviceDescriptor, ScanProgress, Transport};

use crate::error::{Error, Result};
use crate::permissions::PermissionGate;
use crate::probe::{ProbeOptions, ProbeOutcome, Prober};

/// Address the sensor uses when running as its own access point.
pub const ACCESS_POINT_ADDRESS: &str = "192.168.4.1";

/// Default number of probes in flight.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Probe cap for the access-point range.
pub const ACCESS_POINT_RANGE_LIMIT: usize = 100;

/// Probe cap for every other range.
pub const DEFAULT_RANGE_LIMIT: usize = 50;

/// A `/24` sweep, capped at `limit` hosts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRange {
    /// First three octets.
    pub prefix: [u8; 3],
    /// First host octet probed.
    pub start: u8,
    /// Last host octet probed (inclusive).
    pub end: u8,
    /// Maximum number of hosts probed from this range.
    pub limit: usize,
}

impl AddressRange {
    /// Range `a.b.c.1..=254` with the default cap.
    pub fn new(a: u8, b: u8, c: u8) -> Self {
        Self {
            prefix: [a, b, c],
            start: 1,
            end: 254,
            limit: DEFAULT_RANGE_LIMIT,
        }
    }

    /// Set the host cap.
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Parse `a.b.c` or `a.b.c.x`.
    pub fn parse(input: &str) -> Option<Self> {
        let trimmed = input.trim().trim_end_matches(".x").trim_end_matches('.');
        let mut octets = trimmed.split('.').map(|part| part.parse::<u8>().ok());
        let (Some(Some(a)), Some(Some(b)), Some(Some(c)), None) =
            (octets.next(), octets.next(), octets.next(), octets.next())
        else {
            return None;
        };
        Some(Self::new(a, b, c))
    }

    /// Hosts in sweep order.
    pub fn hosts(&self) -> impl Iterator<Item = String> + '_ {
        let [a, b, c] = self.prefix;
        (self.start..=self.end)
            .take(self.limit)
            .map(move |d| format!("{a}.{b}.{c}.{d}"))
    }
}

impl std::fmt::Display for AddressRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [a, b, c] = self.prefix;
        write!(f, "{a}.{b}.{c}.x")
    }
}

/// Prioritized list of addresses to probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanPlan {
    /// Host probed alone before any range.
    pub precheck: Option<String>,
    /// Ranges swept in order.
    pub ranges: Vec<AddressRange>,
}

impl Default for ScanPlan {
    fn default() -> Self {
        Self {
            precheck: Some(ACCESS_POINT_ADDRESS.to_string()),
            ranges: vec![
                AddressRange::new(192, 168, 4).limit(ACCESS_POINT_RANGE_LIMIT),
                AddressRange::new(192, 168, 1),
                AddressRange::new(192, 168, 0),
                AddressRange::new(10, 0, 0),
                AddressRange::new(172, 20, 10),
                AddressRange::new(192, 168, 43),
            ],
        }
    }
}

impl ScanPlan {
    /// A plan with no pre-check and no ranges.
    pub fn empty() -> Self {
        Self {
            precheck: None,
            ranges: Vec::new(),
        }
    }

    /// Set the pre-check host.
    #[must_use]
    pub fn precheck(mut self, host: impl Into<String>) -> Self {
        self.precheck = Some(host.into());
        self
    }

    /// Append a range.
    #[must_use]
    pub fn range(mut self, range: AddressRange) -> Self {
        self.ranges.push(range);
        self
    }

    /// Sweep hosts after the pre-check, without duplicates and without the
    /// pre-check host itself.
    pub fn sweep_hosts(&self) -> Vec<String> {
        let mut seen: HashSet<String> = self.precheck.iter().cloned().collect();
        self.ranges
            .iter()
            .flat_map(|range| range.hosts())
            .filter(|host| seen.insert(host.clone()))
            .collect()
    }

    /// Number of probes the plan performs.
    ///
    /// This counts distinct hosts, which is not always the sum of the range
    /// limits. The pre-check host counts once even when a range covers it,
    /// and hosts shared by overlapping ranges count once. A pre-check host
    /// outside every range adds one. For the default plan the two agree:
    /// 1 + 99 + 5 * 50 = 100 + 5 * 50 = 350.
    pub fn total(&self) -> usize {
        usize::from(self.precheck.is_some()) + self.sweep_hosts().len()
    }
}

/// Options for [`NetworkDeviceScanner`].
#[derive(Debug, Clone)]
pub struct NetworkScanOptions {
    /// Probes in flight per batch.
    pub batch_size: usize,
    /// Port and path probed on each host.
    pub probe: ProbeOptions,
    /// Addresses to probe.
    pub plan: ScanPlan,
}

impl Default for NetworkScanOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            probe: ProbeOptions::default(),
            plan: ScanPlan::default(),
        }
    }
}

impl NetworkScanOptions {
    /// Create options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the batch size.
    #[must_use]
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the probe options.
    #[must_use]
    pub fn probe(mut self, probe: ProbeOptions) -> Self {
        self.probe = probe;
        self
    }

    /// Set the scan plan.
    #[must_use]
    pub fn plan(mut self, plan: ScanPlan) -> Self {
        self.plan = plan;
        self
    }

    /// Validate the options.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::invalid_config("batch_size must be > 0"));
        }
        self.probe.validate()
    }
}

/// Event reported while a scan runs.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    /// A probe resolved.
    Progress(ScanProgress),
    /// A sensor answered at a new address.
    DeviceFound(DeviceDescriptor),
}

/// Discovers WiFi sensors by probing address ranges.
pub struct NetworkDeviceScanner {
    prober: Arc<dyn Prober>,
    permissions: Arc<dyn PermissionGate>,
    options: NetworkScanOptions,
}

impl std::fmt::Debug for NetworkDeviceScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkDeviceScanner")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl NetworkDeviceScanner {
    /// Create a scanner.
    pub fn new(
        prober: Arc<dyn Prober>,
        permissions: Arc<dyn PermissionGate>,
        options: NetworkScanOptions,
    ) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            prober,
            permissions,
            options,
        })
    }

    /// The scan options.
    pub fn options(&self) -> &NetworkScanOptions {
        &self.options
    }

    /// Run the scan plan to completion or cancellation.
    ///
    /// `on_event` is called from the scanning task, never concurrently with
    /// itself. Progress `current` increments once per resolved probe and
    /// `total` is fixed before the first probe starts. Cancelling returns
    /// the devices found so far.
    #[tracing::instrument(level = "info", skip_all, fields(batch_size = self.options.batch_size))]
    pub async fn scan<F>(
        &self,
        cancel: &CancellationToken,
        mut on_event: F,
    ) -> Result<Vec<DeviceDescriptor>>
    where
        F: FnMut(ScanEvent) + Send,
    {
        self.permissions.require(Transport::Wifi)?;

        let plan = &self.options.plan;
        let sweep = plan.sweep_hosts();
        let total = usize::from(plan.precheck.is_some()) + sweep.len();
        info!("Starting network scan of {} addresses", total);

        let mut run = ScanRun {
            total,
            current: 0,
            seen: HashSet::new(),
            found: Vec::new(),
        };

        let precheck: Vec<String> = plan.precheck.iter().cloned().collect();
        let batches = std::iter::once(precheck.as_slice())
            .filter(|batch| !batch.is_empty())
            .chain(sweep.chunks(self.options.batch_size));

        for batch in batches {
            if cancel.is_cancelled() {
                break;
            }
            debug!("Probing batch of {} starting at {}", batch.len(), batch[0]);
            if !self.run_batch(batch, cancel, &mut run, &mut on_event).await {
                break;
            }
        }

        if cancel.is_cancelled() {
            info!(
                "Network scan cancelled after {}/{} probes, {} found",
                run.current,
                run.total,
                run.found.len()
            );
        } else {
            info!("Network scan complete. Found {} device(s)", run.found.len());
        }
        Ok(run.found)
    }

    /// Probe one batch; returns `false` when cancelled mid-batch.
    async fn run_batch<F>(
        &self,
        hosts: &[String],
        cancel: &CancellationToken,
        run: &mut ScanRun,
        on_event: &mut F,
    ) -> bool
    where
        F: FnMut(ScanEvent) + Send,
    {
        let targets: Vec<_> = hosts
            .iter()
            .map(|host| self.options.probe.target(host.as_str()))
            .collect();
        let mut pending: FuturesUnordered<_> = targets
            .iter()
            .map(|target| self.prober.probe(target))
            .collect();

        loop {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return false,
                next = pending.next() => match next {
                    Some(outcome) => outcome,
                    None => return true,
                },
            };

            run.current += 1;
            if let ProbeOutcome::Found(descriptor) = outcome {
                if run.seen.insert(descriptor.address().to_string()) {
                    info!("Found sensor at {}", descriptor.address());
                    run.found.push(descriptor.clone());
                    on_event(ScanEvent::DeviceFound(descriptor));
                } else {
                    debug!("Suppressed duplicate at {}", descriptor.address());
                }
            }
            on_event(ScanEvent::Progress(ScanProgress {
                current: run.current,
                total: run.total,
            }));
        }
    }
}

struct ScanRun {
    total: usize,
    current: usize,
    seen: HashSet<String>,
    found: Vec<DeviceDescriptor>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_plan_total() {
        let plan = ScanPlan::default();
        // pre-check + (100 - duplicate .1) + 5 * 50
        assert_eq!(plan.total(), 1 + 99 + 250);
        assert!(!plan.sweep_hosts().contains(&ACCESS_POINT_ADDRESS.to_string()));
        assert_eq!(plan.sweep_hosts()[0], "192.168.4.2");

        let limits: usize = plan.ranges.iter().map(|r| r.limit).sum();
        assert_eq!(plan.total(), limits);
    }

    #[test]
    fn test_precheck_outside_ranges_adds_one() {
        let plan = ScanPlan::empty()
            .precheck("10.9.9.9")
            .range(AddressRange::new(10, 0, 0).limit(5));
        assert_eq!(plan.total(), 6);
    }

    #[test]
    fn test_range_hosts_respect_limit() {
        let range = AddressRange::new(10, 0, 0).limit(3);
        let hosts: Vec<_> = range.hosts().collect();
        assert_eq!(hosts, vec!["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
        assert_eq!(range.to_string(), "10.0.0.x");
    }

    #[test]
    fn test_overlapping_ranges_are_deduplicated() {
        let plan = ScanPlan::empty()
            .range(AddressRange::new(10, 0, 0).limit(5))
            .range(AddressRange::new(10, 0, 0).limit(8));
        assert_eq!(plan.total(), 8);
    }

    #[test]
    fn test_range_parse() {
        assert_eq!(
            AddressRange::parse("192.168.8.x"),
            Some(AddressRange::new(192, 168, 8))
        );
        assert_eq!(AddressRange::parse("10.1.2"), Some(AddressRange::new(10, 1, 2)));
        assert_eq!(AddressRange::parse("10.1"), None);
        assert_eq!(AddressRange::parse("10.1.2.3.4"), None);
        assert_eq!(AddressRange::parse("300.1.2"), None);
    }

    #[test]
    fn test_options_validation() {
        assert!(NetworkScanOptions::default().validate().is_ok());
        assert!(NetworkScanOptions::new().batch_size(0).validate().is_err());
    }
}
