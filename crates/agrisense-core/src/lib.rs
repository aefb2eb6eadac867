//! Discovery, connection and telemetry acquisition for AgriSense sensors.
//!
//! AgriSense soil probes and sample analyzers expose their readings as JSON
//! over two transports:
//!
//! | Transport | Discovery | Reading |
//! |-----------|-----------|---------|
//! | WiFi | HTTP sweep of private subnets | `GET http://host/moisture` |
//! | BLE | Advertisement scan | Notifications on a UART-style characteristic |
//!
//! # Features
//!
//! - **Network discovery**: Batched HTTP probing of common sensor subnets
//! - **BLE discovery**: Name prefix and service UUID matching
//! - **Connection supervision**: One connection per transport, clean teardown
//! - **Frame reassembly**: JSON frames rebuilt from fragmented notifications
//! - **Polling**: Fixed-cadence "fetch latest" on either transport
//! - **Sessions**: Timed multi-sample collection with averaged results
//!
//! # Platform Differences
//!
//! On macOS BLE peripherals are identified by a UUID assigned by
//! CoreBluetooth; on Linux and Windows by their MAC address. See
//! [`ble::platform`].
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use agrisense_core::{ConnectionSupervisor, DeviceProbe, Permissions, Transport};
//! use agrisense_core::network::{NetworkDeviceScanner, NetworkScanOptions};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let prober = Arc::new(DeviceProbe::new()?);
//!     let permissions = Arc::new(Permissions::granted());
//!
//!     let scanner = NetworkDeviceScanner::new(
//!         prober.clone(),
//!         permissions.clone(),
//!         NetworkScanOptions::default(),
//!     )?;
//!     let devices = scanner.scan(&CancellationToken::new(), |_| {}).await?;
//!
//!     let supervisor = ConnectionSupervisor::new(prober, permissions);
//!     if let Some(device) = devices.first() {
//!         supervisor.connect(device).await?;
//!         let reading = supervisor.fetch_latest(Transport::Wifi).await?;
//!         println!("pH: {:?}", reading.get("pH"));
//!     }
//!     supervisor.close().await?;
//!     Ok(())
//! }
//! ```

pub mod ble;
pub mod error;
pub mod mock;
pub mod network;
pub mod permissions;
pub mod poller;
pub mod probe;
pub mod reassembly;
pub mod registry;
pub mod session;
pub mod supervisor;

// Core exports
pub use error::{Error, NotFoundReason, Result};
pub use network::{NetworkDeviceScanner, NetworkScanOptions, ScanEvent, ScanPlan};
pub use permissions::{Permission, PermissionGate, Permissions};
pub use poller::{PollerHandle, PollerOptions, TelemetryPoller, TelemetrySource, TransportTelemetry};
pub use probe::{DeviceProbe, ProbeOptions, ProbeOutcome, Prober};
pub use reassembly::{FrameReassembler, FramingStrategy, ReassemblerConfig};
pub use registry::ConnectionRegistry;
pub use session::{ReadingSession, SessionConfig, SessionProgress, SessionSummary};
pub use supervisor::{ConnectionConfig, ConnectionSupervisor};

pub use ble::{BleAdvertisementScanner, BleScanOptions, BtleplugAdapter, ScanMode};

// Re-export from agrisense-types
pub use agrisense_types::gatt;
pub use agrisense_types::{
    ConnectionHandle, ConnectionState, DeviceDescriptor, HttpTarget, Metric, ReadingOrigin,
    ScanProgress, SensorKind, TelemetryFrame, Transport,
};
