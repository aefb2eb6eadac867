//! Bluetooth Low Energy transport.
//!
//! The [`BleAdapter`] and [`GattLink`] traits are the seam between the
//! acquisition logic and the platform stack. [`platform`] implements them
//! with btleplug; [`crate::mock`] implements them for tests.

pub mod platform;
pub mod scan;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::error::Result;

pub use platform::BtleplugAdapter;
pub use scan::{BleAdvertisementScanner, BleScanOptions, ScanMode};

/// Stream of raw notification payloads from one characteristic.
pub type NotificationStream = BoxStream<'static, Vec<u8>>;

/// Stream of advertisements seen while scanning.
pub type AdvertisementStream = BoxStream<'static, Advertisement>;

/// One advertisement, reduced to what discovery needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Platform peripheral id (MAC address, or a UUID on macOS).
    pub id: String,
    /// Advertised local name.
    pub local_name: Option<String>,
    /// Advertised service UUIDs.
    pub services: Vec<Uuid>,
    /// RSSI in dBm.
    pub rssi: Option<i16>,
}

/// A discovered GATT characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// Whether it supports notify.
    pub notify: bool,
}

/// A discovered GATT service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    /// Service UUID.
    pub uuid: Uuid,
    /// Characteristics of the service.
    pub characteristics: Vec<GattCharacteristic>,
}

impl GattService {
    /// Look up a characteristic by UUID.
    pub fn characteristic(&self, uuid: Uuid) -> Option<&GattCharacteristic> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }
}

/// A local Bluetooth radio.
#[async_trait]
pub trait BleAdapter: Send + Sync {
    /// Start a hardware scan. An empty `services` list scans for every
    /// peripheral.
    async fn start_scan(&self, services: &[Uuid]) -> Result<()>;

    /// Stop the hardware scan. Stopping an idle adapter is not an error.
    async fn stop_scan(&self) -> Result<()>;

    /// Advertisements seen from now on, preceded by peripherals the
    /// adapter already knows about.
    async fn advertisements(&self) -> Result<AdvertisementStream>;

    /// Handle to a peripheral by id. Does not connect.
    async fn link(&self, id: &str) -> Result<Arc<dyn GattLink>>;
}

/// GATT operations on one peripheral.
#[async_trait]
pub trait GattLink: Send + Sync {
    /// Peripheral id.
    fn id(&self) -> &str;

    /// Local name, if known.
    fn name(&self) -> Option<String>;

    /// Establish the link.
    async fn connect(&self) -> Result<()>;

    /// Ask for a larger MTU; returns the negotiated value.
    async fn request_mtu(&self, mtu: u16) -> Result<u16>;

    /// Discover services and characteristics.
    async fn discover_services(&self) -> Result<Vec<GattService>>;

    /// Enable notifications on a characteristic.
    async fn subscribe(&self, service: Uuid, characteristic: Uuid) -> Result<NotificationStream>;

    /// Disable notifications on a characteristic.
    async fn unsubscribe(&self, service: Uuid, characteristic: Uuid) -> Result<()>;

    /// Tear down the link.
    async fn disconnect(&self) -> Result<()>;
}
