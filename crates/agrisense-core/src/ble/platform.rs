//! btleplug implementation of the BLE transport traits.
//!
//! # Platform differences
//!
//! On macOS CoreBluetooth hides MAC addresses and reports
//! `00:00:00:00:00:00`; peripherals are identified by the UUID assigned by
//! CoreBluetooth instead. On Linux and Windows the MAC address is used.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use agrisense_types::Transport;

use crate::ble::{
    Advertisement, AdvertisementStream, BleAdapter, GattCharacteristic, GattLink, GattService,
    NotificationStream,
};
use crate::error::{Error, Result};

/// Address CoreBluetooth reports for every peripheral.
const HIDDEN_ADDRESS: &str = "00:00:00:00:00:00";

/// Format a peripheral ID as a plain string.
///
/// `PeripheralId` only exposes its value through `Debug`, wrapped as
/// `PeripheralId(...)`.
pub fn format_peripheral_id(id: &PeripheralId) -> String {
    format!("{:?}", id)
        .trim_start_matches("PeripheralId(")
        .trim_end_matches(')')
        .to_string()
}

/// Stable identifier for a peripheral: the address, or the peripheral id
/// where the platform hides addresses.
pub fn create_identifier(address: &str, peripheral_id: &PeripheralId) -> String {
    choose_identifier(address, || format_peripheral_id(peripheral_id))
}

fn choose_identifier(address: &str, peripheral_id: impl FnOnce() -> String) -> String {
    if address == HIDDEN_ADDRESS {
        peripheral_id()
    } else {
        address.to_string()
    }
}

/// The first Bluetooth adapter of the host.
#[derive(Debug, Clone)]
pub struct BtleplugAdapter {
    adapter: Adapter,
}

impl BtleplugAdapter {
    /// Open the first available adapter.
    ///
    /// Fails with [`Error::TransportUnavailable`] when the host has none.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        let adapter = adapters
            .into_iter()
            .next()
            .ok_or_else(|| {
                Error::transport_unavailable(Transport::Ble, "no Bluetooth adapter found")
            })?;
        debug!("Using Bluetooth adapter {:?}", adapter.adapter_info().await.ok());
        Ok(Self { adapter })
    }

    /// Wrap an already-opened adapter.
    pub fn from_adapter(adapter: Adapter) -> Self {
        Self { adapter }
    }
}

async fn advertisement_of(peripheral: &Peripheral) -> Option<Advertisement> {
    let properties = peripheral.properties().await.ok()??;
    Some(Advertisement {
        id: create_identifier(&properties.address.to_string(), &peripheral.id()),
        local_name: properties.local_name,
        services: properties.services,
        rssi: properties.rssi,
    })
}

#[async_trait]
impl BleAdapter for BtleplugAdapter {
    async fn start_scan(&self, services: &[Uuid]) -> Result<()> {
        self.adapter
            .start_scan(ScanFilter {
                services: services.to_vec(),
            })
            .await?;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn advertisements(&self) -> Result<AdvertisementStream> {
        let mut known = Vec::new();
        for peripheral in self.adapter.peripherals().await? {
            if let Some(advertisement) = advertisement_of(&peripheral).await {
                known.push(advertisement);
            }
        }

        let adapter = self.adapter.clone();
        let updates = self.adapter.events().await?.filter_map(move |event| {
            let adapter = adapter.clone();
            async move {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id)
                    | CentralEvent::DeviceUpdated(id)
                    | CentralEvent::ServicesAdvertisement { id, .. } => id,
                    _ => return None,
                };
                let peripheral = adapter.peripheral(&id).await.ok()?;
                advertisement_of(&peripheral).await
            }
        });

        Ok(futures::stream::iter(known).chain(updates).boxed())
    }

    async fn link(&self, id: &str) -> Result<Arc<dyn GattLink>> {
        for peripheral in self.adapter.peripherals().await? {
            let Some(properties) = peripheral.properties().await? else {
                continue;
            };
            let identifier = create_identifier(&properties.address.to_string(), &peripheral.id());
            if identifier.eq_ignore_ascii_case(id)
                || format_peripheral_id(&peripheral.id()).eq_ignore_ascii_case(id)
            {
                return Ok(Arc::new(BtleplugLink {
                    peripheral,
                    id: identifier,
                    name: properties.local_name,
                    characteristics: RwLock::new(HashMap::new()),
                }));
            }
        }
        Err(Error::connection_failed(
            id,
            "peripheral not known to the adapter, scan first",
        ))
    }
}

/// A btleplug peripheral behind [`GattLink`].
pub struct BtleplugLink {
    peripheral: Peripheral,
    id: String,
    name: Option<String>,
    /// Characteristics by (service, characteristic) UUID, filled by discovery.
    characteristics: RwLock<HashMap<(Uuid, Uuid), Characteristic>>,
}

impl std::fmt::Debug for BtleplugLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtleplugLink")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl BtleplugLink {
    async fn characteristic(&self, service: Uuid, uuid: Uuid) -> Result<Characteristic> {
        self.characteristics
            .read()
            .await
            .get(&(service, uuid))
            .cloned()
            .ok_or_else(|| Error::characteristic_not_found(uuid.to_string(), service.to_string()))
    }
}

#[async_trait]
impl GattLink for BtleplugLink {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> Option<String> {
        self.name.clone()
    }

    async fn connect(&self) -> Result<()> {
        self.peripheral.connect().await?;
        info!("Connected to {}", self.id);
        Ok(())
    }

    async fn request_mtu(&self, _mtu: u16) -> Result<u16> {
        Err(Error::Unsupported(
            "MTU negotiation is not exposed by btleplug".to_string(),
        ))
    }

    async fn discover_services(&self) -> Result<Vec<GattService>> {
        self.peripheral.discover_services().await?;

        let mut cache = HashMap::new();
        let services: Vec<GattService> = self
            .peripheral
            .services()
            .into_iter()
            .map(|service| {
                debug!("  Service: {}", service.uuid);
                let characteristics = service
                    .characteristics
                    .iter()
                    .map(|characteristic| {
                        debug!("    Characteristic: {}", characteristic.uuid);
                        cache.insert((service.uuid, characteristic.uuid), characteristic.clone());
                        GattCharacteristic {
                            uuid: characteristic.uuid,
                            notify: characteristic.properties.contains(CharPropFlags::NOTIFY),
                        }
                    })
                    .collect();
                GattService {
                    uuid: service.uuid,
                    characteristics,
                }
            })
            .collect();

        debug!("Cached {} characteristics", cache.len());
        *self.characteristics.write().await = cache;
        Ok(services)
    }

    async fn subscribe(&self, service: Uuid, characteristic: Uuid) -> Result<NotificationStream> {
        let target = self.characteristic(service, characteristic).await?;
        self.peripheral.subscribe(&target).await?;
        let notifications = self.peripheral.notifications().await?;
        Ok(notifications
            .filter(move |n| futures::future::ready(n.uuid == characteristic))
            .map(|n| n.value)
            .boxed())
    }

    async fn unsubscribe(&self, service: Uuid, characteristic: Uuid) -> Result<()> {
        let target = self.characteristic(service, characteristic).await?;
        self.peripheral.unsubscribe(&target).await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.peripheral.disconnect().await?;
        Ok(())
    }
}
