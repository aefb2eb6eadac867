//! Connection lifecycle, one connection per transport.
//!
//! [`ConnectionSupervisor`] is the only writer of the
//! [`ConnectionRegistry`]. Connect and disconnect are serialized per
//! transport by one async mutex each: a new connect first tears down
//! whatever the transport held.
//!
//! BLE connect runs: permission check, teardown, link connect, best-effort
//! MTU request, service discovery, service and characteristic lookup,
//! subscribe, then a notification task that owns a fresh
//! [`FrameReassembler`]. Any failure disconnects the link and leaves the
//! registry untouched.
//!
//! When the notification stream ends without being cancelled the link is
//! treated as lost: the task marks the registry entry `Failed` and the next
//! call that touches the BLE slot releases the session.
//!
//! WiFi has no handshake. Connecting records the target and registers it as
//! `Connecting`; the first successful fetch promotes it to `Connected`.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::runtime::Handle;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use agrisense_types::gatt::{DEFAULT_MTU, REQUESTED_MTU, TELEMETRY_NOTIFY, TELEMETRY_SERVICE};
use agrisense_types::{
    ConnectionHandle, ConnectionState, DEFAULT_HTTP_PATH, DeviceDescriptor, HttpTarget,
    TelemetryFrame, Transport,
};

use crate::ble::{BleAdapter, GattLink, NotificationStream};
use crate::error::{Error, Result};
use crate::permissions::PermissionGate;
use crate::probe::Prober;
use crate::reassembly::{FirstFrame, FrameReassembler, ReassemblerConfig, ReassemblyStats};
use crate::registry::ConnectionRegistry;

/// Default timeout for establishing a BLE link.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Default timeout for service discovery.
const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for the MTU request.
const DEFAULT_MTU_TIMEOUT: Duration = Duration::from_secs(3);

/// Capacity of the frame broadcast channel.
const FRAME_CHANNEL_CAPACITY: usize = 64;

/// Failure reason recorded when the peripheral drops the link.
const LINK_LOST: &str = "link lost";

/// Configuration for connection timeouts and the GATT contract.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use agrisense_core::ConnectionConfig;
///
/// let config = ConnectionConfig::default()
///     .connection_timeout(Duration::from_secs(20))
///     .http_path("/data");
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Timeout for establishing a BLE link.
    pub connection_timeout: Duration,
    /// Timeout for service discovery after connecting.
    pub discovery_timeout: Duration,
    /// Timeout for the best-effort MTU request.
    pub mtu_timeout: Duration,
    /// MTU requested after connecting.
    pub requested_mtu: u16,
    /// Telemetry service UUID.
    pub service: Uuid,
    /// Notify characteristic UUID.
    pub characteristic: Uuid,
    /// Path used for WiFi targets built from descriptor addresses.
    pub http_path: String,
    /// Reassembler options for each BLE connection.
    pub reassembler: ReassemblerConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connection_timeout: DEFAULT_CONNECT_TIMEOUT,
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            mtu_timeout: DEFAULT_MTU_TIMEOUT,
            requested_mtu: REQUESTED_MTU,
            service: TELEMETRY_SERVICE,
            characteristic: TELEMETRY_NOTIFY,
            http_path: DEFAULT_HTTP_PATH.to_string(),
            reassembler: ReassemblerConfig::default(),
        }
    }
}

impl ConnectionConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the BLE connection timeout.
    #[must_use]
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set the service discovery timeout.
    #[must_use]
    pub fn discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    /// Set the requested MTU.
    #[must_use]
    pub fn requested_mtu(mut self, mtu: u16) -> Self {
        self.requested_mtu = mtu;
        self
    }

    /// Set the WiFi telemetry path.
    #[must_use]
    pub fn http_path(mut self, path: impl Into<String>) -> Self {
        self.http_path = path.into();
        self
    }

    /// Set the reassembler options.
    #[must_use]
    pub fn reassembler(mut self, config: ReassemblerConfig) -> Self {
        self.reassembler = config;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.connection_timeout.is_zero() || self.discovery_timeout.is_zero() {
            return Err(Error::invalid_config("connection timeouts must be > 0"));
        }
        if self.requested_mtu < DEFAULT_MTU {
            return Err(Error::invalid_config(format!(
                "requested_mtu must be >= {}",
                DEFAULT_MTU
            )));
        }
        self.reassembler.validate()
    }
}

/// Latest output of a BLE notification task.
#[derive(Debug, Clone, Default)]
struct BleFeed {
    latest: Option<TelemetryFrame>,
    stats: ReassemblyStats,
    link_lost: bool,
}

struct BleSession {
    link: Arc<dyn GattLink>,
    service: Uuid,
    characteristic: Uuid,
    cancel: CancellationToken,
    closing: CancellationToken,
    task: JoinHandle<()>,
    feed: watch::Receiver<BleFeed>,
    first_frame: Option<FirstFrame>,
}

#[derive(Default)]
struct BleSlot {
    state: ConnectionState,
    session: Option<BleSession>,
}

#[derive(Default)]
struct WifiSlot {
    state: ConnectionState,
    target: Option<HttpTarget>,
    /// Bumped on every connect and disconnect, so a fetch that started
    /// against an older target cannot promote the current one.
    generation: u64,
}

/// Owns the connection held on each transport.
///
/// Construct one per process and share it behind an `Arc`. Call
/// [`close`](Self::close) before dropping it; the drop path only performs
/// best-effort cleanup.
pub struct ConnectionSupervisor {
    registry: ConnectionRegistry,
    permissions: Arc<dyn PermissionGate>,
    prober: Arc<dyn Prober>,
    ble_adapter: Option<Arc<dyn BleAdapter>>,
    config: ConnectionConfig,
    wifi: Mutex<WifiSlot>,
    ble: Mutex<BleSlot>,
    frames: broadcast::Sender<TelemetryFrame>,
}

impl std::fmt::Debug for ConnectionSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSupervisor")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .field("ble_adapter", &self.ble_adapter.is_some())
            .finish_non_exhaustive()
    }
}

impl ConnectionSupervisor {
    /// Supervisor for WiFi only; add BLE with
    /// [`with_ble_adapter`](Self::with_ble_adapter).
    pub fn new(prober: Arc<dyn Prober>, permissions: Arc<dyn PermissionGate>) -> Self {
        let (frames, _) = broadcast::channel(FRAME_CHANNEL_CAPACITY);
        Self {
            registry: ConnectionRegistry::new(),
            permissions,
            prober,
            ble_adapter: None,
            config: ConnectionConfig::default(),
            wifi: Mutex::new(WifiSlot::default()),
            ble: Mutex::new(BleSlot::default()),
            frames,
        }
    }

    /// Attach a BLE adapter.
    #[must_use]
    pub fn with_ble_adapter(mut self, adapter: Arc<dyn BleAdapter>) -> Self {
        self.ble_adapter = Some(adapter);
        self
    }

    /// Replace the connection configuration.
    pub fn with_config(mut self, config: ConnectionConfig) -> Result<Self> {
        config.validate()?;
        self.config = config;
        Ok(self)
    }

    /// Read-only view of the registry.
    pub fn registry(&self) -> ConnectionRegistry {
        self.registry.clone()
    }

    /// The connection configuration.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Current lifecycle state of a transport.
    pub async fn state(&self, transport: Transport) -> ConnectionState {
        match transport {
            Transport::Wifi => self.wifi.lock().await.state.clone(),
            Transport::Ble => {
                let mut slot = self.ble.lock().await;
                self.reap_lost_link(&mut slot).await;
                slot.state.clone()
            }
        }
    }

    /// Receive every frame the BLE connection reassembles.
    pub fn subscribe_frames(&self) -> broadcast::Receiver<TelemetryFrame> {
        self.frames.subscribe()
    }

    /// Connect to a discovered device on its transport.
    pub async fn connect(&self, descriptor: &DeviceDescriptor) -> Result<ConnectionHandle> {
        match descriptor.transport() {
            Transport::Wifi => self.connect_wifi(descriptor).await,
            Transport::Ble => self.connect_ble(descriptor).await,
        }
    }

    /// Record a WiFi target. Liveness is established by the first fetch.
    #[tracing::instrument(level = "info", skip_all, fields(address = %descriptor.address()))]
    pub async fn connect_wifi(&self, descriptor: &DeviceDescriptor) -> Result<ConnectionHandle> {
        self.permissions.require(Transport::Wifi)?;
        let target = HttpTarget::parse(descriptor.address(), &self.config.http_path)
            .ok_or_else(|| {
                Error::invalid_config(format!("invalid WiFi address: {}", descriptor.address()))
            })?;

        let mut slot = self.wifi.lock().await;
        self.teardown_wifi(&mut slot);

        slot.generation += 1;
        slot.target = Some(target);
        slot.state = ConnectionState::Connecting;
        let handle = self.registry.register(descriptor, ConnectionState::Connecting);
        info!("Recorded WiFi target {}", descriptor.address());
        Ok(handle)
    }

    /// Connect to a BLE sensor and start streaming its notifications.
    #[tracing::instrument(level = "info", skip_all, fields(address = %descriptor.address()))]
    pub async fn connect_ble(&self, descriptor: &DeviceDescriptor) -> Result<ConnectionHandle> {
        self.permissions.require(Transport::Ble)?;
        let adapter = self.ble_adapter.clone().ok_or_else(|| {
            Error::transport_unavailable(Transport::Ble, "no Bluetooth adapter configured")
        })?;

        let mut slot = self.ble.lock().await;
        self.teardown_ble(&mut slot).await;
        slot.state = ConnectionState::Connecting;

        match self.establish_ble(adapter.as_ref(), descriptor).await {
            Ok(session) => {
                slot.session = Some(session);
                slot.state = ConnectionState::Connected;
                let handle = self.registry.register(descriptor, ConnectionState::Connected);
                info!("Connected to {}", descriptor.display_name());
                Ok(handle)
            }
            Err(e) => {
                warn!("BLE connect to {} failed: {}", descriptor.address(), e);
                slot.state = ConnectionState::Failed(e.to_string());
                Err(e)
            }
        }
    }

    async fn establish_ble(
        &self,
        adapter: &dyn BleAdapter,
        descriptor: &DeviceDescriptor,
    ) -> Result<BleSession> {
        let link = adapter.link(descriptor.address()).await?;
        match self.open_session(Arc::clone(&link)).await {
            Ok(session) => Ok(session),
            Err(e) => {
                if let Err(disconnect_err) = link.disconnect().await {
                    debug!("Disconnect after failed connect: {}", disconnect_err);
                }
                Err(e)
            }
        }
    }

    async fn open_session(&self, link: Arc<dyn GattLink>) -> Result<BleSession> {
        let config = &self.config;

        info!("Connecting to device...");
        timeout(config.connection_timeout, link.connect())
            .await
            .map_err(|_| Error::timeout("connect to device", config.connection_timeout))??;

        match timeout(config.mtu_timeout, link.request_mtu(config.requested_mtu)).await {
            Ok(Ok(mtu)) => debug!("Negotiated MTU {}", mtu),
            Ok(Err(e)) => debug!("MTU request failed, using default {}: {}", DEFAULT_MTU, e),
            Err(_) => debug!("MTU request timed out, using default {}", DEFAULT_MTU),
        }

        info!("Discovering services...");
        let services = timeout(config.discovery_timeout, link.discover_services())
            .await
            .map_err(|_| Error::timeout("discover services", config.discovery_timeout))??;
        debug!("Found {} services", services.len());

        let service = services
            .iter()
            .find(|s| s.uuid == config.service)
            .ok_or_else(|| Error::service_not_found(config.service.to_string(), services.len()))?;
        let characteristic = service.characteristic(config.characteristic).ok_or_else(|| {
            Error::characteristic_not_found(
                config.characteristic.to_string(),
                config.service.to_string(),
            )
        })?;
        if !characteristic.notify {
            warn!(
                "Characteristic {} does not advertise notify, subscribing anyway",
                characteristic.uuid
            );
        }

        let notifications = link.subscribe(config.service, config.characteristic).await?;

        let mut reassembler = FrameReassembler::with_config(config.reassembler.clone());
        let first_frame = reassembler.first_frame();
        let (feed_tx, feed) = watch::channel(BleFeed::default());
        let cancel = CancellationToken::new();
        let closing = CancellationToken::new();
        let task = tokio::spawn(run_notifications(
            notifications,
            reassembler,
            NotificationSinks {
                feed: feed_tx,
                frames: self.frames.clone(),
                registry: self.registry.clone(),
            },
            cancel.clone(),
            closing.clone(),
        ));

        Ok(BleSession {
            link,
            service: config.service,
            characteristic: config.characteristic,
            cancel,
            closing,
            task,
            feed,
            first_frame: Some(first_frame),
        })
    }

    /// Tear down a transport. Safe to call when already disconnected.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn disconnect(&self, transport: Transport) -> Result<()> {
        match transport {
            Transport::Wifi => {
                let mut slot = self.wifi.lock().await;
                self.teardown_wifi(&mut slot);
            }
            Transport::Ble => {
                let mut slot = self.ble.lock().await;
                self.teardown_ble(&mut slot).await;
            }
        }
        Ok(())
    }

    /// Disconnect both transports.
    pub async fn close(&self) -> Result<()> {
        self.disconnect(Transport::Ble).await?;
        self.disconnect(Transport::Wifi).await
    }

    fn teardown_wifi(&self, slot: &mut WifiSlot) {
        if let Some(target) = slot.target.take() {
            info!("Cleared WiFi target {}", target.address());
        }
        slot.generation += 1;
        slot.state = ConnectionState::Disconnected;
        self.registry.remove(Transport::Wifi);
    }

    async fn teardown_ble(&self, slot: &mut BleSlot) {
        if let Some(session) = slot.session.take() {
            info!("Disconnecting from {}...", session.link.id());
            // The subscription goes first so no notification reaches a
            // reassembler that is being dropped. `closing` keeps the stream
            // ending here from being read as a lost link.
            session.closing.cancel();
            if let Err(e) = session
                .link
                .unsubscribe(session.service, session.characteristic)
                .await
            {
                warn!("Failed to unsubscribe: {}", e);
            }
            session.cancel.cancel();
            join_notification_task(session.task).await;
            if let Err(e) = session.link.disconnect().await {
                warn!("Failed to disconnect: {}", e);
            }
        }
        slot.state = ConnectionState::Disconnected;
        self.registry.remove(Transport::Ble);
    }

    /// Release a session whose notification stream ended on its own.
    async fn reap_lost_link(&self, slot: &mut BleSlot) {
        let lost = slot
            .session
            .as_ref()
            .is_some_and(|s| s.feed.borrow().link_lost);
        if !lost {
            return;
        }
        if let Some(session) = slot.session.take() {
            warn!("Lost link to {}", session.link.id());
            join_notification_task(session.task).await;
            if let Err(e) = session.link.disconnect().await {
                debug!("Disconnect after link loss: {}", e);
            }
        }
        slot.state = ConnectionState::Failed(LINK_LOST.to_string());
        self.registry
            .set_state(Transport::Ble, ConnectionState::Failed(LINK_LOST.to_string()));
    }

    /// Latest reading on a transport.
    ///
    /// WiFi re-probes the recorded target; the first success promotes the
    /// handle to `Connected`. BLE returns the last reassembled frame.
    pub async fn fetch_latest(&self, transport: Transport) -> Result<TelemetryFrame> {
        match transport {
            Transport::Wifi => self.fetch_wifi().await,
            Transport::Ble => {
                let mut slot = self.ble.lock().await;
                self.reap_lost_link(&mut slot).await;
                let session = slot
                    .session
                    .as_ref()
                    .ok_or(Error::NotConnected(Transport::Ble))?;
                let latest = session.feed.borrow().latest.clone();
                latest.ok_or(Error::NoReading(Transport::Ble))
            }
        }
    }

    async fn fetch_wifi(&self) -> Result<TelemetryFrame> {
        let (target, generation) = {
            let slot = self.wifi.lock().await;
            let target = slot
                .target
                .clone()
                .ok_or(Error::NotConnected(Transport::Wifi))?;
            (target, slot.generation)
        };

        let frame = self.prober.probe(&target).await.into_reading(&target)?;

        let mut slot = self.wifi.lock().await;
        if slot.generation == generation && slot.state == ConnectionState::Connecting {
            slot.state = ConnectionState::Connected;
            self.registry
                .set_state(Transport::Wifi, ConnectionState::Connected);
            info!("WiFi sensor at {} is live", target.address());
        }
        Ok(frame)
    }

    /// Wait until the BLE connection delivers a frame.
    ///
    /// The wait and the timeout are one future; on timeout nothing is left
    /// waiting on the connection.
    pub async fn wait_for_first_frame(&self, wait: Duration) -> Result<TelemetryFrame> {
        let (first_frame, mut feed) = {
            let mut slot = self.ble.lock().await;
            self.reap_lost_link(&mut slot).await;
            let session = slot
                .session
                .as_mut()
                .ok_or(Error::NotConnected(Transport::Ble))?;
            (session.first_frame.take(), session.feed.clone())
        };

        // The feed and the first-frame sender go away with the
        // notification task.
        if let Some(first_frame) = first_frame {
            return first_frame.wait(wait).await.map_err(|e| match e {
                Error::Cancelled => Error::NotConnected(Transport::Ble),
                e => e,
            });
        }

        let latest = match timeout(wait, feed.wait_for(|f| f.latest.is_some())).await {
            Ok(Ok(current)) => current.latest.clone(),
            Ok(Err(_)) => None,
            Err(_) => return Err(Error::timeout("wait for first frame", wait)),
        };
        latest.ok_or(Error::NotConnected(Transport::Ble))
    }

    /// Reassembly counters of the current BLE connection.
    pub async fn reassembly_stats(&self) -> Option<ReassemblyStats> {
        let mut slot = self.ble.lock().await;
        self.reap_lost_link(&mut slot).await;
        slot.session.as_ref().map(|s| s.feed.borrow().stats)
    }
}

impl Drop for ConnectionSupervisor {
    fn drop(&mut self) {
        let Some(session) = self.ble.get_mut().session.take() else {
            return;
        };
        session.closing.cancel();
        session.cancel.cancel();
        if let Ok(handle) = Handle::try_current() {
            handle.spawn(async move {
                let _ = session
                    .link
                    .unsubscribe(session.service, session.characteristic)
                    .await;
                if let Err(e) = session.link.disconnect().await {
                    warn!("Failed to disconnect in supervisor drop: {}", e);
                }
            });
        } else {
            warn!("No tokio runtime available for BLE disconnect in supervisor drop");
        }
    }
}

/// Where a notification task publishes what it reassembles.
struct NotificationSinks {
    feed: watch::Sender<BleFeed>,
    frames: broadcast::Sender<TelemetryFrame>,
    registry: ConnectionRegistry,
}

async fn run_notifications(
    mut notifications: NotificationStream,
    mut reassembler: FrameReassembler,
    sinks: NotificationSinks,
    cancel: CancellationToken,
    closing: CancellationToken,
) {
    let NotificationSinks {
        feed,
        frames,
        registry,
    } = sinks;

    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            chunk = notifications.next() => match chunk {
                Some(chunk) => chunk,
                None if closing.is_cancelled() => {
                    debug!("Notification stream closed");
                    break;
                }
                None => {
                    warn!("Notification stream ended, link lost");
                    feed.send_modify(|current| current.link_lost = true);
                    registry.set_state(
                        Transport::Ble,
                        ConnectionState::Failed(LINK_LOST.to_string()),
                    );
                    break;
                }
            },
        };

        let completed = reassembler.push(&chunk);
        feed.send_modify(|current| {
            if let Some(last) = completed.last() {
                current.latest = Some(last.clone());
            }
            current.stats = reassembler.stats();
        });
        for frame in completed {
            let _ = frames.send(frame);
        }
    }
    debug!("Notification task stopped, stats: {:?}", reassembler.stats());
}

async fn join_notification_task(task: JoinHandle<()>) {
    if let Err(e) = task.await
        && e.is_panic()
    {
        warn!("Notification task panicked: {}", e);
    }
}
