//! Platform-agnostic types for AgriSense field sensors.
//!
//! This crate holds the data model shared by the connectivity core
//! (agrisense-core) and its consumers: device descriptors produced by the
//! scanners, parsed telemetry frames, HTTP endpoint targets and the
//! well-known GATT identifiers of the sensor family.
//!
//! # Example
//!
//! ```
//! use agrisense_types::{Metric, TelemetryFrame};
//!
//! let frame = TelemetryFrame::from_json(r#"{"pH":6.5,"soil_moisture_pct":40}"#).unwrap();
//! assert_eq!(frame.metric(Metric::Ph), Some(6.5));
//! assert_eq!(frame.metric(Metric::Moisture), Some(40.0));
//! ```

pub mod error;
pub mod types;
pub mod gatt;

pub use error::{ParseError, ParseResult};
pub use types::{
    ConnectionHandle, ConnectionState, DeviceDescriptor, HttpTarget, Metric, ReadingOrigin,
    ScanProgress, SensorKind, TelemetryFrame, Transport, DEFAULT_HTTP_PATH, DEFAULT_HTTP_PORT,
};

