//! Poller and reading-session tests on tokio's paused clock.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use agrisense_core::mock::{MockProber, MockTelemetrySource};
use agrisense_core::session::SessionStatus;
use agrisense_core::{
    ConnectionSupervisor, DeviceDescriptor, Error, HttpTarget, Metric, Permissions,
    PollerOptions, ReadingSession, SessionConfig, SessionProgress, TelemetryFrame,
    TelemetryPoller, Transport, TransportTelemetry,
};
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;

fn collector() -> (Arc<Mutex<Vec<TelemetryFrame>>>, impl FnMut(TelemetryFrame) + Send + 'static) {
    let readings = Arc::new(Mutex::new(Vec::new()));
    let sink = readings.clone();
    (readings, move |frame| sink.lock().unwrap().push(frame))
}

// =============================================================================
// Poller
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_poller_fetches_on_interval() {
    let source = Arc::new(MockTelemetrySource::default());
    let (readings, on_reading) = collector();

    let mut handle = TelemetryPoller::start(
        source.clone(),
        PollerOptions::new().interval(Duration::from_secs(5)),
        on_reading,
    )
    .unwrap();

    sleep(Duration::from_secs(12)).await;
    assert_eq!(readings.lock().unwrap().len(), 3);
    assert!(handle.is_running());

    handle.stop().await;
    assert!(!handle.is_running());
    sleep(Duration::from_secs(30)).await;
    assert_eq!(readings.lock().unwrap().len(), 3);
    assert_eq!(source.fetch_count(), 3);
    assert_eq!(handle.stats().ticks, 3);

    handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_poller_stop_lets_in_flight_fetch_finish() {
    let source = Arc::new(MockTelemetrySource::default());
    source.set_latency(Duration::from_secs(2));
    let (readings, on_reading) = collector();

    let mut handle =
        TelemetryPoller::start(source.clone(), PollerOptions::default(), on_reading).unwrap();

    sleep(Duration::from_secs(1)).await;
    assert_eq!(source.fetch_count(), 1);
    handle.stop().await;

    assert_eq!(readings.lock().unwrap().len(), 1);
    sleep(Duration::from_secs(30)).await;
    assert_eq!(source.fetch_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_poller_counts_errors_without_delivering() {
    let source = Arc::new(MockTelemetrySource::default());
    source.set_should_fail(true);
    let (readings, on_reading) = collector();

    let mut handle = TelemetryPoller::start(
        source.clone(),
        PollerOptions::new().interval(Duration::from_secs(1)),
        on_reading,
    )
    .unwrap();

    sleep(Duration::from_millis(3500)).await;
    handle.stop().await;

    let stats = handle.stats();
    assert_eq!(stats.errors, 4);
    assert_eq!(stats.readings, 0);
    assert!(readings.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_poller_simulated_fallback_is_tagged() {
    let zeros = TelemetryFrame::from_values([("pH", 0.0), ("moisture", 0.0)]);
    let source = Arc::new(MockTelemetrySource::new(zeros));
    let (readings, on_reading) = collector();

    let mut handle = TelemetryPoller::start(
        source,
        PollerOptions::new()
            .interval(Duration::from_secs(1))
            .simulate_on_zero(true)
            .zero_threshold(3),
        on_reading,
    )
    .unwrap();

    sleep(Duration::from_millis(3500)).await;
    handle.stop().await;

    let readings = readings.lock().unwrap();
    assert_eq!(readings.len(), 4);
    assert!(!readings[0].is_simulated());
    assert!(!readings[1].is_simulated());
    assert!(readings[2].is_simulated());
    assert!(readings[3].is_simulated());
    assert!(readings[2].metric(Metric::Ph).unwrap() > 0.0);
    assert_eq!(handle.stats().simulated, 2);
}

#[tokio::test(start_paused = true)]
async fn test_poller_without_fallback_passes_zeros() {
    let zeros = TelemetryFrame::from_values([("pH", 0.0)]);
    let source = Arc::new(MockTelemetrySource::new(zeros));
    let (readings, on_reading) = collector();

    let mut handle = TelemetryPoller::start(
        source,
        PollerOptions::new().interval(Duration::from_secs(1)),
        on_reading,
    )
    .unwrap();
    sleep(Duration::from_millis(4500)).await;
    handle.stop().await;

    let readings = readings.lock().unwrap();
    assert_eq!(readings.len(), 5);
    assert!(readings.iter().all(|r| r.is_all_zero() && !r.is_simulated()));
}

#[tokio::test(start_paused = true)]
async fn test_dropping_handle_stops_polling() {
    let source = Arc::new(MockTelemetrySource::default());
    let (_readings, on_reading) = collector();

    let handle = TelemetryPoller::start(
        source.clone(),
        PollerOptions::new().interval(Duration::from_secs(1)),
        on_reading,
    )
    .unwrap();
    sleep(Duration::from_millis(500)).await;
    drop(handle);

    sleep(Duration::from_secs(10)).await;
    assert_eq!(source.fetch_count(), 1);
}

#[tokio::test]
async fn test_poller_rejects_zero_interval() {
    let source = Arc::new(MockTelemetrySource::default());
    let result = TelemetryPoller::start(
        source,
        PollerOptions::new().interval(Duration::ZERO),
        |_| {},
    );
    assert!(matches!(result, Err(Error::InvalidConfig(_))));
}

#[tokio::test(start_paused = true)]
async fn test_poller_over_wifi_connection() {
    let prober = Arc::new(MockProber::new());
    prober.add_sensor("10.0.0.2", r#"{"moisture": 41.5}"#);
    let supervisor = Arc::new(ConnectionSupervisor::new(
        prober,
        Arc::new(Permissions::granted()),
    ));
    supervisor
        .connect(&DeviceDescriptor::wifi(&HttpTarget::new("10.0.0.2"), "Probe", None))
        .await
        .unwrap();

    let source = Arc::new(TransportTelemetry::new(supervisor.clone(), Transport::Wifi));
    let (readings, on_reading) = collector();
    let mut handle = TelemetryPoller::start(source, PollerOptions::default(), on_reading).unwrap();
    sleep(Duration::from_secs(6)).await;
    handle.stop().await;

    assert_eq!(readings.lock().unwrap().len(), 2);
    assert!(supervisor.registry().is_connected(Transport::Wifi));
}

// =============================================================================
// Session
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_session_collects_target_samples_on_time() {
    let source = MockTelemetrySource::default();
    let mut session = ReadingSession::new(
        SessionConfig::new()
            .target_sample_count(10)
            .target_duration(Duration::from_secs(5)),
    )
    .unwrap();

    let mut progress: Vec<SessionProgress> = Vec::new();
    let started = Instant::now();
    let summary = session
        .run(&source, &CancellationToken::new(), |p| progress.push(p))
        .await
        .unwrap();

    assert_eq!(started.elapsed(), Duration::from_secs(5));
    assert_eq!(summary.samples, 10);
    assert_eq!(session.samples().len(), 10);
    assert_eq!(session.status(), SessionStatus::Complete);
    assert!(!summary.stopped_early);
    assert!(!summary.includes_simulated);

    let last = progress.last().unwrap();
    assert_eq!(last.fraction, 1.0);
    assert_eq!(last.samples, 10);
    assert!(progress.windows(2).all(|w| w[0].fraction <= w[1].fraction));

    let aggregate = summary.aggregate.unwrap();
    assert!((aggregate.metric(Metric::Ph).unwrap() - 6.5).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn test_session_duration_wins_over_slow_source() {
    let source = MockTelemetrySource::default();
    source.set_latency(Duration::from_secs(2));
    let mut session = ReadingSession::new(SessionConfig::default()).unwrap();

    let started = Instant::now();
    let summary = session
        .run(&source, &CancellationToken::new(), |_| {})
        .await
        .unwrap();

    assert_eq!(started.elapsed(), Duration::from_secs(5));
    assert!(summary.samples >= 1);
    assert!(summary.samples < 10);
    assert!(!summary.stopped_early);
}

#[tokio::test(start_paused = true)]
async fn test_session_averages_varied_samples() {
    let source = MockTelemetrySource::default();
    for i in 0..10 {
        let ph = if i % 2 == 0 { 6.0 } else { 7.0 };
        source.push(TelemetryFrame::from_values([("pH", ph), ("moisture", 40.0 + i as f64)]));
    }
    let mut session = ReadingSession::new(SessionConfig::default()).unwrap();
    let summary = session
        .run(&source, &CancellationToken::new(), |_| {})
        .await
        .unwrap();

    let aggregate = summary.aggregate.unwrap();
    assert_eq!(aggregate.sample_count(), 10);
    assert!((aggregate.get("pH").unwrap() - 6.5).abs() < 1e-9);
    assert!((aggregate.get("moisture").unwrap() - 44.5).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn test_session_cancel_stops_early() {
    let source = MockTelemetrySource::default();
    let mut session = ReadingSession::new(SessionConfig::default()).unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(1200)).await;
        trigger.cancel();
    });

    let summary = session.run(&source, &cancel, |_| {}).await.unwrap();
    assert!(summary.stopped_early);
    assert_eq!(summary.samples, 3);
    assert_eq!(session.status(), SessionStatus::Complete);
}

#[tokio::test(start_paused = true)]
async fn test_session_with_failing_source_has_no_aggregate() {
    let source = MockTelemetrySource::default();
    source.set_should_fail(true);
    let mut session = ReadingSession::new(SessionConfig::default()).unwrap();

    let summary = session
        .run(&source, &CancellationToken::new(), |_| {})
        .await
        .unwrap();
    assert_eq!(summary.samples, 0);
    assert!(summary.aggregate.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_session_passes_zero_samples_through_by_default() {
    let source = MockTelemetrySource::new(TelemetryFrame::from_values([("pH", 0.0)]));
    let mut session = ReadingSession::new(SessionConfig::default()).unwrap();

    let summary = session
        .run(&source, &CancellationToken::new(), |_| {})
        .await
        .unwrap();
    assert_eq!(summary.samples, 10);
    assert!(!summary.includes_simulated);
    assert_eq!(summary.aggregate.unwrap().get("pH"), Some(0.0));
}

#[tokio::test(start_paused = true)]
async fn test_session_simulated_fallback_is_tagged() {
    let source = MockTelemetrySource::new(TelemetryFrame::from_values([
        ("pH", 0.0),
        ("moisture", 0.0),
    ]));
    let mut session = ReadingSession::new(
        SessionConfig::new()
            .simulate_on_zero(true)
            .zero_threshold(3),
    )
    .unwrap();

    let summary = session
        .run(&source, &CancellationToken::new(), |_| {})
        .await
        .unwrap();
    assert_eq!(summary.samples, 10);
    assert!(summary.includes_simulated);

    let samples = session.samples();
    assert!(samples[..2].iter().all(|s| !s.is_simulated()));
    assert!(samples[2..].iter().all(TelemetryFrame::is_simulated));
    assert!(samples[2].get("pH").is_some());
}

#[tokio::test(start_paused = true)]
async fn test_session_runs_once() {
    let source = MockTelemetrySource::default();
    let mut session = ReadingSession::new(
        SessionConfig::new()
            .target_sample_count(2)
            .target_duration(Duration::from_secs(1)),
    )
    .unwrap();
    session
        .run(&source, &CancellationToken::new(), |_| {})
        .await
        .unwrap();

    let err = session
        .run(&source, &CancellationToken::new(), |_| {})
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidConfig(_)));
}
