//! BLE advertisement scan tests against a scripted adapter.
//!
//! Advertisements are replayed on tokio's paused clock, so the 10 second
//! scan window costs no real time.

use std::sync::Arc;
use std::time::Duration;

use agrisense_core::ble::Advertisement;
use agrisense_core::gatt::TELEMETRY_SERVICE;
use agrisense_core::mock::MockBleAdapter;
use agrisense_core::{
    BleAdvertisementScanner, BleScanOptions, Error, Permission, Permissions, ScanMode, Transport,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn named(id: &str, name: &str) -> Advertisement {
    Advertisement {
        id: id.to_string(),
        local_name: Some(name.to_string()),
        services: vec![],
        rssi: Some(-61),
    }
}

fn scanner(
    adapter: &Arc<MockBleAdapter>,
    permissions: Permissions,
    options: BleScanOptions,
) -> BleAdvertisementScanner {
    BleAdvertisementScanner::new(adapter.clone(), Arc::new(permissions), options).unwrap()
}

/// Elapsed paused-clock time, allowing for millisecond timer rounding.
fn assert_elapsed(start: Instant, secs: u64) {
    let elapsed = start.elapsed();
    let expected = Duration::from_secs(secs);
    assert!(
        elapsed >= expected && elapsed < expected + Duration::from_millis(10),
        "elapsed {elapsed:?}, expected {expected:?}"
    );
}

async fn wait_until_stopped(adapter: &MockBleAdapter) {
    for _ in 0..10 {
        if !adapter.is_scanning() {
            break;
        }
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_first_match_resolves_early_and_stops_scan() {
    let adapter = Arc::new(MockBleAdapter::new());
    adapter.advertise(Duration::from_secs(1), named("11:22:33:44:55:66", "Headphones"));
    adapter.advertise(Duration::from_secs(1), named("AA:BB:CC:DD:EE:01", "AgriSense 01"));
    adapter.advertise(Duration::from_secs(1), named("AA:BB:CC:DD:EE:02", "AgriSense 02"));
    let scanner = scanner(&adapter, Permissions::granted(), BleScanOptions::default());

    let start = Instant::now();
    let mut reported = Vec::new();
    let found = scanner
        .scan(&CancellationToken::new(), |d| {
            reported.push(d.address().to_string())
        })
        .await
        .unwrap();

    assert_elapsed(start, 2);
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].address(), "AA:BB:CC:DD:EE:01");
    assert_eq!(found[0].display_name(), "AgriSense 01");
    assert_eq!(found[0].transport(), Transport::Ble);
    assert_eq!(reported, vec!["AA:BB:CC:DD:EE:01".to_string()]);
    assert_eq!(adapter.start_count(), 1);
    assert_eq!(adapter.stop_count(), 1);
    assert!(!adapter.is_scanning());
}

#[tokio::test(start_paused = true)]
async fn test_no_match_resolves_empty_at_deadline() {
    let adapter = Arc::new(MockBleAdapter::new());
    adapter.advertise(Duration::from_secs(1), named("11:22:33:44:55:66", "Headphones"));
    let scanner = scanner(&adapter, Permissions::granted(), BleScanOptions::default());

    let start = Instant::now();
    let found = scanner.scan(&CancellationToken::new(), |_| {}).await.unwrap();

    assert!(found.is_empty());
    assert_elapsed(start, 10);
    assert_eq!(adapter.stop_count(), 1);
    assert!(!adapter.is_scanning());
}

#[tokio::test(start_paused = true)]
async fn test_collect_keeps_distinct_matches_until_deadline() {
    let adapter = Arc::new(MockBleAdapter::new());
    adapter.advertise(Duration::from_secs(1), named("AA:BB:CC:DD:EE:01", "AgriSense 01"));
    adapter.advertise(Duration::from_secs(1), named("AA:BB:CC:DD:EE:01", "AgriSense 01"));
    adapter.advertise(Duration::from_secs(1), named("11:22:33:44:55:66", "Headphones"));
    adapter.advertise(
        Duration::from_secs(1),
        Advertisement {
            id: "AA:BB:CC:DD:EE:03".to_string(),
            local_name: None,
            services: vec![TELEMETRY_SERVICE],
            rssi: None,
        },
    );
    let scanner = scanner(
        &adapter,
        Permissions::granted(),
        BleScanOptions::new().mode(ScanMode::Collect),
    );

    let start = Instant::now();
    let mut reported = 0;
    let found = scanner
        .scan(&CancellationToken::new(), |_| reported += 1)
        .await
        .unwrap();

    assert_elapsed(start, 10);
    let addresses: Vec<_> = found.iter().map(|d| d.address()).collect();
    assert_eq!(addresses, vec!["AA:BB:CC:DD:EE:01", "AA:BB:CC:DD:EE:03"]);
    assert_eq!(reported, 2);
    assert_eq!(adapter.stop_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_stops_scan() {
    let adapter = Arc::new(MockBleAdapter::new());
    adapter.advertise(Duration::from_secs(1), named("AA:BB:CC:DD:EE:01", "AgriSense 01"));
    let scanner = scanner(
        &adapter,
        Permissions::granted(),
        BleScanOptions::new().mode(ScanMode::Collect),
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(3)).await;
        trigger.cancel();
    });

    let start = Instant::now();
    let found = scanner.scan(&cancel, |_| {}).await.unwrap();

    assert_elapsed(start, 3);
    assert_eq!(found.len(), 1);
    assert_eq!(adapter.stop_count(), 1);
    assert!(!adapter.is_scanning());
}

#[tokio::test(start_paused = true)]
async fn test_dropped_scan_future_stops_scan() {
    let adapter = Arc::new(MockBleAdapter::new());
    let scanner = scanner(&adapter, Permissions::granted(), BleScanOptions::default());
    let cancel = CancellationToken::new();

    let result = tokio::time::timeout(Duration::from_secs(1), scanner.scan(&cancel, |_| {})).await;
    assert!(result.is_err());

    wait_until_stopped(&adapter).await;
    assert!(!adapter.is_scanning());
    assert_eq!(adapter.stop_count(), 1);
}

#[tokio::test]
async fn test_start_failure_is_reported() {
    let adapter = Arc::new(MockBleAdapter::new());
    adapter.set_fail_start(true);
    let scanner = scanner(&adapter, Permissions::granted(), BleScanOptions::default());

    let err = scanner.scan(&CancellationToken::new(), |_| {}).await.unwrap_err();
    assert!(matches!(
        err,
        Error::TransportUnavailable {
            transport: Transport::Ble,
            ..
        }
    ));
    assert_eq!(adapter.start_count(), 1);
    assert!(!adapter.is_scanning());
}

#[tokio::test]
async fn test_permissions_checked_before_scanning() {
    let adapter = Arc::new(MockBleAdapter::new());

    let bluetooth_off = scanner(&adapter, Permissions::denied(), BleScanOptions::default());
    let err = bluetooth_off
        .scan(&CancellationToken::new(), |_| {})
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PermissionDenied(Permission::Bluetooth)));

    let location_off = scanner(
        &adapter,
        Permissions::new(true, true, false),
        BleScanOptions::default(),
    );
    let err = location_off
        .scan(&CancellationToken::new(), |_| {})
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PermissionDenied(Permission::Location)));

    assert_eq!(adapter.start_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_name_prefix_scans_without_service_filter() {
    let adapter = Arc::new(MockBleAdapter::new());
    // Advertises a name but no service UUID.
    adapter.advertise(Duration::from_secs(1), named("AA:BB:CC:DD:EE:01", "agrisense-soil"));

    let default_scan = scanner(&adapter, Permissions::granted(), BleScanOptions::default());
    let found = default_scan
        .scan(&CancellationToken::new(), |_| {})
        .await
        .unwrap();
    assert_eq!(adapter.last_scan_filter(), Some(Vec::<Uuid>::new()));
    assert_eq!(found.len(), 1);

    let service_only = scanner(
        &adapter,
        Permissions::granted(),
        BleScanOptions::new().name_prefix(""),
    );
    let found = service_only
        .scan(&CancellationToken::new(), |_| {})
        .await
        .unwrap();
    assert_eq!(adapter.last_scan_filter(), Some(vec![TELEMETRY_SERVICE]));
    assert!(found.is_empty());
}
