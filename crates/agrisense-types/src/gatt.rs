//! Bluetooth identifiers for AgriSense sensors.
//!
//! The sensor firmware exposes a UART-style GATT service: telemetry is
//! streamed as newline-delimited JSON text over a single notify
//! characteristic.

use uuid::{Uuid, uuid};

/// Telemetry service advertised by every sensor in the family.
pub const TELEMETRY_SERVICE: Uuid = uuid!("6e400001-b5a3-f393-e0a9-e50e24dcca9e");

/// Notify characteristic carrying the chunked telemetry stream.
pub const TELEMETRY_NOTIFY: Uuid = uuid!("6e400003-b5a3-f393-e0a9-e50e24dcca9e");

/// Advertised local-name prefix of the sensor family.
pub const DEVICE_NAME_PREFIX: &str = "AgriSense";

/// Transfer unit requested right after connecting.
///
/// The default ATT MTU of 23 leaves 20 bytes per notification, which splits
/// almost every frame. Negotiation is best effort.
pub const REQUESTED_MTU: u16 = 512;

/// ATT MTU every central and peripheral must support.
pub const DEFAULT_MTU: u16 = 23;
