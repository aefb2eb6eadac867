//! Hardware integration tests for agrisense-core
//!
//! These tests require a real sensor and should be run with:
//! ```
//! cargo test --package agrisense-core --test hardware_tests -- --ignored --nocapture
//! ```
//!
//! Configure devices via environment variables:
//! - `AGRISENSE_BLE_DEVICE`: BLE peripheral id (MAC address, or CoreBluetooth UUID on macOS)
//! - `AGRISENSE_WIFI_HOST`: address of a WiFi sensor, e.g. `192.168.4.1`
//!
//! Example:
//! ```
//! AGRISENSE_WIFI_HOST=192.168.4.1 cargo test --package agrisense-core --test hardware_tests -- --ignored --nocapture
//! ```

use std::env;
use std::sync::Arc;
use std::time::Duration;

use agrisense_core::{
    BleAdvertisementScanner, BleScanOptions, BtleplugAdapter, ConnectionSupervisor,
    DeviceDescriptor, DeviceProbe, HttpTarget, Permissions, ReadingSession, ScanMode,
    SessionConfig, Transport, TransportTelemetry,
};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Default timeout for BLE operations
const BLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Route library logs through the test harness; `RUST_LOG` picks the level.
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn env_device(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

// =============================================================================
// BLE
// =============================================================================

#[tokio::test]
#[ignore = "requires BLE hardware"]
async fn test_ble_scan_finds_sensors() {
    init_logging();
    let adapter = Arc::new(BtleplugAdapter::new().await.expect("no Bluetooth adapter"));
    let scanner = BleAdvertisementScanner::new(
        adapter,
        Arc::new(Permissions::granted()),
        BleScanOptions::new().mode(ScanMode::Collect),
    )
    .unwrap();

    let devices = timeout(BLE_TIMEOUT, scanner.scan(&CancellationToken::new(), |_| {}))
        .await
        .expect("scan timed out")
        .expect("scan failed");

    println!("Found {} sensor(s)", devices.len());
    for device in &devices {
        println!(
            "  {} ({}) RSSI {:?}",
            device.display_name(),
            device.address(),
            device.signal_strength()
        );
    }
}

#[tokio::test]
#[ignore = "requires BLE hardware"]
async fn test_ble_connect_and_receive_frame() {
    init_logging();
    let Some(id) = env_device("AGRISENSE_BLE_DEVICE") else {
        println!("AGRISENSE_BLE_DEVICE not set, skipping");
        return;
    };

    let adapter = Arc::new(BtleplugAdapter::new().await.expect("no Bluetooth adapter"));
    // The adapter only knows peripherals it has seen advertise.
    let scanner = BleAdvertisementScanner::new(
        adapter.clone(),
        Arc::new(Permissions::granted()),
        BleScanOptions::default(),
    )
    .unwrap();
    let _ = scanner.scan(&CancellationToken::new(), |_| {}).await;

    let supervisor = ConnectionSupervisor::new(
        Arc::new(DeviceProbe::new().unwrap()),
        Arc::new(Permissions::granted()),
    )
    .with_ble_adapter(adapter);

    let device = DeviceDescriptor::ble(id.clone(), id, None);
    let handle = supervisor.connect(&device).await.expect("connect failed");
    println!("Connected: {} ({})", handle.display_name, handle.state);

    let frame = supervisor
        .wait_for_first_frame(Duration::from_secs(15))
        .await
        .expect("no frame received");
    for (key, value) in frame.values() {
        println!("  {key}: {value}");
    }
    if let Some(stats) = supervisor.reassembly_stats().await {
        println!("Reassembly: {:?}", stats);
    }

    supervisor.close().await.unwrap();
}

// =============================================================================
// WiFi
// =============================================================================

#[tokio::test]
#[ignore = "requires a WiFi sensor"]
async fn test_wifi_session() {
    init_logging();
    let Some(host) = env_device("AGRISENSE_WIFI_HOST") else {
        println!("AGRISENSE_WIFI_HOST not set, skipping");
        return;
    };

    let supervisor = Arc::new(ConnectionSupervisor::new(
        Arc::new(DeviceProbe::new().unwrap()),
        Arc::new(Permissions::granted()),
    ));
    let device = DeviceDescriptor::wifi(&HttpTarget::new(host), "Sensor", None);
    supervisor.connect(&device).await.unwrap();

    let source = TransportTelemetry::new(supervisor.clone(), Transport::Wifi);
    let mut session = ReadingSession::new(SessionConfig::default()).unwrap();
    let summary = session
        .run(&source, &CancellationToken::new(), |p| {
            println!("  {:>3.0}% ({} samples)", p.fraction * 100.0, p.samples)
        })
        .await
        .unwrap();

    println!("Collected {} samples", summary.samples);
    if let Some(aggregate) = summary.aggregate {
        for (key, mean) in aggregate.means() {
            println!("  {key}: {mean:.2}");
        }
    }
    assert!(supervisor.registry().is_connected(Transport::Wifi));
    supervisor.close().await.unwrap();
}
