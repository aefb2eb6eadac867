//! Network discovery tests against a scripted prober.
//!
//! These run on tokio's paused clock, so probe latency costs no real time.

use std::sync::Arc;
use std::time::Duration;

use agrisense_core::mock::MockProber;
use agrisense_core::network::{
    AddressRange, NetworkDeviceScanner, NetworkScanOptions, ScanEvent, ScanPlan,
};
use agrisense_core::{Error, Metric, Permission, Permissions, Transport};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn scanner(prober: &Arc<MockProber>, plan: ScanPlan, batch_size: usize) -> NetworkDeviceScanner {
    NetworkDeviceScanner::new(
        prober.clone(),
        Arc::new(Permissions::granted()),
        NetworkScanOptions::new().plan(plan).batch_size(batch_size),
    )
    .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_access_point_sensor_reported_once() {
    let prober = Arc::new(MockProber::new());
    prober.add_sensor("192.168.4.1", r#"{"moisture":45.2}"#);

    let plan = ScanPlan::empty()
        .precheck("192.168.4.1")
        .range(AddressRange::new(192, 168, 4).limit(20));
    let scanner = scanner(&prober, plan, 10);

    let mut events = Vec::new();
    let found = scanner
        .scan(&CancellationToken::new(), |event| events.push(event))
        .await
        .unwrap();

    assert_eq!(found.len(), 1);
    let device = &found[0];
    assert_eq!(device.transport(), Transport::Wifi);
    assert_eq!(device.address(), "192.168.4.1");
    let reading = device.last_known_reading().unwrap();
    assert_eq!(reading.metric(Metric::Moisture), Some(45.2));

    let found_events = events
        .iter()
        .filter(|e| matches!(e, ScanEvent::DeviceFound(_)))
        .count();
    assert_eq!(found_events, 1);
    assert_eq!(
        prober
            .probed_hosts()
            .iter()
            .filter(|h| h.as_str() == "192.168.4.1")
            .count(),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn test_batches_bound_wall_time() {
    let prober = Arc::new(MockProber::new());
    prober.set_latency(Duration::from_secs(2));

    let plan = ScanPlan::empty().range(AddressRange::new(10, 0, 0).limit(50));
    let scanner = scanner(&prober, plan, 10);

    let started = Instant::now();
    let found = scanner
        .scan(&CancellationToken::new(), |_| {})
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert!(found.is_empty());
    assert_eq!(prober.probe_count(), 50);
    assert_eq!(prober.max_in_flight(), 10);
    assert!(elapsed >= Duration::from_secs(10), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(11), "elapsed {:?}", elapsed);
}

#[tokio::test(start_paused = true)]
async fn test_progress_is_monotonic_and_complete() {
    let prober = Arc::new(MockProber::new());
    prober.add_sensor("10.0.0.3", r#"{"pH": 6.8}"#);

    let plan = ScanPlan::empty()
        .precheck("10.0.0.1")
        .range(AddressRange::new(10, 0, 0).limit(25));
    let scanner = scanner(&prober, plan, 10);

    let mut progress = Vec::new();
    scanner
        .scan(&CancellationToken::new(), |event| {
            if let ScanEvent::Progress(p) = event {
                progress.push(p);
            }
        })
        .await
        .unwrap();

    assert_eq!(progress.len(), 25);
    assert!(progress.windows(2).all(|w| w[1].current == w[0].current + 1));
    assert!(progress.iter().all(|p| p.total == 25));
    assert!(progress.last().unwrap().is_complete());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_returns_partial_results() {
    let prober = Arc::new(MockProber::new());
    prober.set_latency(Duration::from_secs(2));
    prober.add_sensor("10.0.0.4", r#"{"soil_moisture_pct": 38}"#);

    let plan = ScanPlan::empty().range(AddressRange::new(10, 0, 0).limit(50));
    let scanner = scanner(&prober, plan, 10);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(3)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let found = scanner.scan(&cancel, |_| {}).await.unwrap();

    assert_eq!(found.len(), 1);
    assert_eq!(found[0].address(), "10.0.0.4");
    assert_eq!(prober.probe_count(), 20);
    assert!(started.elapsed() < Duration::from_secs(4));
}

#[tokio::test]
async fn test_scan_without_network_permission() {
    let prober = Arc::new(MockProber::new());
    let scanner = NetworkDeviceScanner::new(
        prober.clone(),
        Arc::new(Permissions::new(false, true, true)),
        NetworkScanOptions::default(),
    )
    .unwrap();

    let err = scanner
        .scan(&CancellationToken::new(), |_| {})
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PermissionDenied(Permission::Network)));
    assert_eq!(prober.probe_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_non_sensor_responses_are_ignored() {
    let prober = Arc::new(MockProber::new());
    prober.add_response("10.0.0.1", 200, r#"{"status": "ok"}"#);
    prober.add_response("10.0.0.2", 200, "<html>router</html>");
    prober.add_response("10.0.0.3", 500, r#"{"moisture": 12}"#);
    prober.add_sensor("10.0.0.4", r#"{"temperature": 21.5, "humidity": 40}"#);

    let plan = ScanPlan::empty().range(AddressRange::new(10, 0, 0).limit(4));
    let found = scanner(&prober, plan, 10)
        .scan(&CancellationToken::new(), |_| {})
        .await
        .unwrap();

    assert_eq!(found.len(), 1);
    assert_eq!(found[0].address(), "10.0.0.4");
}
