//! Mock transports for testing without sensors or radios.
//!
//! - [`MockProber`]: scripted HTTP responses per host, with latency and
//!   concurrency tracking.
//! - [`MockBleAdapter`] and [`MockGattLink`]: scripted advertisements and a
//!   peripheral whose notifications are pushed from the test.
//! - [`MockTelemetrySource`]: a scripted "fetch latest".
//!
//! All mocks support failure injection and simulated latency, and honour
//! tokio's paused clock.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use tokio::sync::mpsc;
use uuid::Uuid;

use agrisense_types::gatt::{TELEMETRY_NOTIFY, TELEMETRY_SERVICE};
use agrisense_types::{HttpTarget, TelemetryFrame, Transport};

use crate::ble::{
    Advertisement, AdvertisementStream, BleAdapter, GattCharacteristic, GattLink, GattService,
    NotificationStream,
};
use crate::error::{Error, NotFoundReason, Result};
use crate::poller::TelemetrySource;
use crate::probe::{ProbeOutcome, Prober, evaluate_response};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

async fn simulate_latency(ms: &AtomicU64) {
    let ms = ms.load(Ordering::Relaxed);
    if ms > 0 {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

/// Scripted HTTP responder keyed by host.
///
/// Unscripted hosts answer with a connection error after the configured
/// latency.
///
/// # Example
///
/// ```
/// use agrisense_core::mock::MockProber;
/// use agrisense_core::Prober;
/// use agrisense_types::HttpTarget;
///
/// #[tokio::main]
/// async fn main() {
///     let prober = MockProber::new();
///     prober.add_sensor("192.168.4.1", r#"{"pH": 6.4, "moisture": 41.0}"#);
///     let outcome = prober.probe(&HttpTarget::new("192.168.4.1")).await;
///     assert!(outcome.is_found());
/// }
/// ```
#[derive(Debug, Default)]
pub struct MockProber {
    responses: Mutex<HashMap<String, (u16, Vec<u8>)>>,
    latency_ms: AtomicU64,
    probes: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    probed: Mutex<Vec<String>>,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockProber {
    /// Prober with no sensors.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `host` with HTTP 200 and `body`.
    pub fn add_sensor(&self, host: &str, body: &str) {
        self.add_response(host, 200, body);
    }

    /// Answer `host` with an arbitrary status and body.
    pub fn add_response(&self, host: &str, status: u16, body: &str) {
        lock(&self.responses).insert(host.to_string(), (status, body.as_bytes().to_vec()));
    }

    /// Stop answering `host`.
    pub fn remove(&self, host: &str) {
        lock(&self.responses).remove(host);
    }

    /// Delay every probe by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Probes started so far.
    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    /// Highest number of probes in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Hosts probed, in the order probes started.
    pub fn probed_hosts(&self) -> Vec<String> {
        lock(&self.probed).clone()
    }
}

#[async_trait]
impl Prober for MockProber {
    async fn probe(&self, target: &HttpTarget) -> ProbeOutcome {
        self.probes.fetch_add(1, Ordering::SeqCst);
        lock(&self.probed).push(target.host.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _in_flight = InFlight(&self.in_flight);

        simulate_latency(&self.latency_ms).await;

        let response = lock(&self.responses).get(&target.host).cloned();
        match response {
            Some((status, body)) => evaluate_response(target, status, &body),
            None => ProbeOutcome::NotFound(NotFoundReason::Network(
                "connection refused".to_string(),
            )),
        }
    }
}

/// Operations recorded by [`MockGattLink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// `connect` called.
    Connect,
    /// `request_mtu` called.
    RequestMtu,
    /// `discover_services` called.
    DiscoverServices,
    /// `subscribe` called.
    Subscribe,
    /// `unsubscribe` called.
    Unsubscribe,
    /// `disconnect` called.
    Disconnect,
}

/// Scripted peripheral.
///
/// Exposes the telemetry service with a notify characteristic by default.
/// Chunks passed to [`send_chunk`](Self::send_chunk) are delivered to the
/// current subscriber.
#[derive(Debug)]
pub struct MockGattLink {
    id: String,
    name: Option<String>,
    services: Mutex<Vec<GattService>>,
    connected: AtomicBool,
    fail_connect: AtomicBool,
    fail_mtu: AtomicBool,
    connect_latency_ms: AtomicU64,
    notifier: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    events: Mutex<Vec<LinkEvent>>,
}

impl MockGattLink {
    /// Peripheral with the telemetry service.
    pub fn new(id: &str, name: Option<&str>) -> Self {
        Self {
            id: id.to_string(),
            name: name.map(str::to_string),
            services: Mutex::new(vec![GattService {
                uuid: TELEMETRY_SERVICE,
                characteristics: vec![GattCharacteristic {
                    uuid: TELEMETRY_NOTIFY,
                    notify: true,
                }],
            }]),
            connected: AtomicBool::new(false),
            fail_connect: AtomicBool::new(false),
            fail_mtu: AtomicBool::new(false),
            connect_latency_ms: AtomicU64::new(0),
            notifier: Mutex::new(None),
            events: Mutex::new(Vec::new()),
        }
    }

    /// Replace the services reported by discovery.
    pub fn set_services(&self, services: Vec<GattService>) {
        *lock(&self.services) = services;
    }

    /// Make `connect` fail.
    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::Relaxed);
    }

    /// Make `request_mtu` fail.
    pub fn set_fail_mtu(&self, fail: bool) {
        self.fail_mtu.store(fail, Ordering::Relaxed);
    }

    /// Delay `connect` by `latency`.
    pub fn set_connect_latency(&self, latency: Duration) {
        self.connect_latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Deliver one notification payload. Returns `false` when nobody is
    /// subscribed.
    pub fn send_chunk(&self, chunk: &[u8]) -> bool {
        match lock(&self.notifier).as_ref() {
            Some(tx) => tx.send(chunk.to_vec()).is_ok(),
            None => false,
        }
    }

    /// Whether a subscription is active.
    pub fn is_subscribed(&self) -> bool {
        lock(&self.notifier).is_some()
    }

    /// Whether the link is connected.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Operations performed so far, in order.
    pub fn events(&self) -> Vec<LinkEvent> {
        lock(&self.events).clone()
    }

    fn record(&self, event: LinkEvent) {
        lock(&self.events).push(event);
    }
}

#[async_trait]
impl GattLink for MockGattLink {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> Option<String> {
        self.name.clone()
    }

    async fn connect(&self) -> Result<()> {
        self.record(LinkEvent::Connect);
        simulate_latency(&self.connect_latency_ms).await;
        if self.fail_connect.load(Ordering::Relaxed) {
            return Err(Error::connection_failed(&self.id, "mock connect failure"));
        }
        self.connected.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn request_mtu(&self, mtu: u16) -> Result<u16> {
        self.record(LinkEvent::RequestMtu);
        if self.fail_mtu.load(Ordering::Relaxed) {
            return Err(Error::Unsupported("mock MTU failure".to_string()));
        }
        Ok(mtu.min(247))
    }

    async fn discover_services(&self) -> Result<Vec<GattService>> {
        self.record(LinkEvent::DiscoverServices);
        if !self.is_connected() {
            return Err(Error::NotConnected(Transport::Ble));
        }
        Ok(lock(&self.services).clone())
    }

    async fn subscribe(&self, service: Uuid, characteristic: Uuid) -> Result<NotificationStream> {
        self.record(LinkEvent::Subscribe);
        let known = lock(&self.services)
            .iter()
            .find(|s| s.uuid == service)
            .and_then(|s| s.characteristic(characteristic))
            .is_some();
        if !known {
            return Err(Error::characteristic_not_found(
                characteristic.to_string(),
                service.to_string(),
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.notifier) = Some(tx);
        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|chunk| (chunk, rx))
        })
        .boxed())
    }

    async fn unsubscribe(&self, _service: Uuid, _characteristic: Uuid) -> Result<()> {
        self.record(LinkEvent::Unsubscribe);
        lock(&self.notifier).take();
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.record(LinkEvent::Disconnect);
        lock(&self.notifier).take();
        self.connected.store(false, Ordering::Relaxed);
        Ok(())
    }
}

/// Scripted Bluetooth adapter.
///
/// Advertisements added with [`advertise`](Self::advertise) are replayed
/// on every scan, each after its delay; the stream then stays open.
#[derive(Debug, Default)]
pub struct MockBleAdapter {
    script: Mutex<Vec<(Duration, Advertisement)>>,
    links: Mutex<HashMap<String, Arc<MockGattLink>>>,
    scanning: AtomicBool,
    fail_start: AtomicBool,
    last_filter: Mutex<Option<Vec<Uuid>>>,
    start_count: AtomicU32,
    stop_count: AtomicU32,
}

impl MockBleAdapter {
    /// Adapter that sees nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit `advertisement` `delay` after the previous scripted one.
    pub fn advertise(&self, delay: Duration, advertisement: Advertisement) {
        lock(&self.script).push((delay, advertisement));
    }

    /// Make a peripheral connectable under its id.
    pub fn add_link(&self, link: Arc<MockGattLink>) {
        lock(&self.links).insert(link.id.clone(), link);
    }

    /// The peripheral registered under `id`.
    pub fn get_link(&self, id: &str) -> Option<Arc<MockGattLink>> {
        lock(&self.links).get(id).cloned()
    }

    /// Make `start_scan` fail.
    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::Relaxed);
    }

    /// Whether a hardware scan is running.
    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    /// Service filter passed to the last `start_scan`.
    pub fn last_scan_filter(&self) -> Option<Vec<Uuid>> {
        lock(&self.last_filter).clone()
    }

    /// Number of `start_scan` calls.
    pub fn start_count(&self) -> u32 {
        self.start_count.load(Ordering::SeqCst)
    }

    /// Number of `stop_scan` calls.
    pub fn stop_count(&self) -> u32 {
        self.stop_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BleAdapter for MockBleAdapter {
    async fn start_scan(&self, services: &[Uuid]) -> Result<()> {
        self.start_count.fetch_add(1, Ordering::SeqCst);
        *lock(&self.last_filter) = Some(services.to_vec());
        if self.fail_start.load(Ordering::Relaxed) {
            return Err(Error::transport_unavailable(
                Transport::Ble,
                "mock adapter powered off",
            ));
        }
        self.scanning.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.stop_count.fetch_add(1, Ordering::SeqCst);
        self.scanning.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn advertisements(&self) -> Result<AdvertisementStream> {
        let script: VecDeque<_> = lock(&self.script).iter().cloned().collect();
        let scripted = stream::unfold(script, |mut script| async move {
            let (delay, advertisement) = script.pop_front()?;
            tokio::time::sleep(delay).await;
            Some((advertisement, script))
        });
        Ok(scripted.chain(stream::pending()).boxed())
    }

    async fn link(&self, id: &str) -> Result<Arc<dyn GattLink>> {
        match self.get_link(id) {
            Some(link) => Ok(link),
            None => Err(Error::connection_failed(id, "unknown mock peripheral")),
        }
    }
}

/// Scripted [`TelemetrySource`].
///
/// Queued frames are returned one per fetch; once the queue is empty every
/// fetch returns the fallback frame.
#[derive(Debug)]
pub struct MockTelemetrySource {
    queue: Mutex<VecDeque<TelemetryFrame>>,
    fallback: Mutex<TelemetryFrame>,
    latency_ms: AtomicU64,
    should_fail: AtomicBool,
    fetches: AtomicU32,
}

impl Default for MockTelemetrySource {
    fn default() -> Self {
        Self::new(TelemetryFrame::from_values([("pH", 6.5), ("moisture", 42.0)]))
    }
}

impl MockTelemetrySource {
    /// Source that always returns `frame`.
    pub fn new(frame: TelemetryFrame) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(frame),
            latency_ms: AtomicU64::new(0),
            should_fail: AtomicBool::new(false),
            fetches: AtomicU32::new(0),
        }
    }

    /// Queue a frame for a single fetch.
    pub fn push(&self, frame: TelemetryFrame) {
        lock(&self.queue).push_back(frame);
    }

    /// Replace the fallback frame.
    pub fn set_frame(&self, frame: TelemetryFrame) {
        *lock(&self.fallback) = frame;
    }

    /// Delay every fetch by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Make fetches fail.
    pub fn set_should_fail(&self, fail: bool) {
        self.should_fail.store(fail, Ordering::Relaxed);
    }

    /// Fetches started so far.
    pub fn fetch_count(&self) -> u32 {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TelemetrySource for MockTelemetrySource {
    async fn fetch_latest(&self) -> Result<TelemetryFrame> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        simulate_latency(&self.latency_ms).await;
        if self.should_fail.load(Ordering::Relaxed) {
            return Err(Error::ProbeNotFound {
                address: "mock".to_string(),
                reason: NotFoundReason::Timeout,
            });
        }
        let queued = lock(&self.queue).pop_front();
        Ok(queued.unwrap_or_else(|| lock(&self.fallback).clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_prober_scripts_hosts() {
        let prober = MockProber::new();
        prober.add_sensor("10.0.0.5", r#"{"moisture": 33}"#);
        prober.add_response("10.0.0.6", 404, "not found");

        assert!(prober.probe(&HttpTarget::new("10.0.0.5")).await.is_found());
        assert!(!prober.probe(&HttpTarget::new("10.0.0.6")).await.is_found());
        assert!(!prober.probe(&HttpTarget::new("10.0.0.7")).await.is_found());
        assert_eq!(prober.probe_count(), 3);
        assert_eq!(prober.max_in_flight(), 1);
        assert_eq!(prober.probed_hosts()[0], "10.0.0.5");
    }

    #[tokio::test]
    async fn test_mock_link_delivers_chunks_until_unsubscribed() {
        let link = MockGattLink::new("AA:01", Some("AgriSense 01"));
        assert!(!link.send_chunk(b"x"));
        link.connect().await.unwrap();
        let mut notifications = link
            .subscribe(TELEMETRY_SERVICE, TELEMETRY_NOTIFY)
            .await
            .unwrap();

        assert!(link.send_chunk(b"{\"pH\":6}\n"));
        assert_eq!(notifications.next().await.unwrap(), b"{\"pH\":6}\n".to_vec());

        link.unsubscribe(TELEMETRY_SERVICE, TELEMETRY_NOTIFY)
            .await
            .unwrap();
        assert!(notifications.next().await.is_none());
        assert_eq!(
            link.events(),
            vec![LinkEvent::Connect, LinkEvent::Subscribe, LinkEvent::Unsubscribe]
        );
    }

    #[tokio::test]
    async fn test_mock_link_requires_connect_for_discovery() {
        let link = MockGattLink::new("AA:01", None);
        assert!(link.discover_services().await.is_err());
        link.connect().await.unwrap();
        assert_eq!(link.discover_services().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_mock_source_queue_then_fallback() {
        let source = MockTelemetrySource::new(TelemetryFrame::from_values([("pH", 7.0)]));
        source.push(TelemetryFrame::from_values([("pH", 5.0)]));
        assert_eq!(source.fetch_latest().await.unwrap().get("pH"), Some(5.0));
        assert_eq!(source.fetch_latest().await.unwrap().get("pH"), Some(7.0));
        source.set_should_fail(true);
        assert!(source.fetch_latest().await.is_err());
        assert_eq!(source.fetch_count(), 3);
    }
}
