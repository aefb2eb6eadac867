//! Error types for agrisense-core.
//!
//! Errors are split by how far they are allowed to travel:
//!
//! | Failure | Surfaces as | Reaches the caller? |
//! |---------|-------------|---------------------|
//! | Probe timeout, refused connection, non-2xx, unknown body | [`NotFoundReason`] | No, the scanner sees "no device" |
//! | Frame parse failure | `agrisense_types::ParseError` | No, logged and counted |
//! | Reassembly buffer overflow | counter + `warn!` | No |
//! | [`Error::ServiceNotFound`], [`Error::CharacteristicNotFound`] | connect result | Yes, once per attempt |
//! | [`Error::PermissionDenied`], [`Error::TransportUnavailable`] | connect/scan result | Yes, before any I/O |
//! | [`Error::Timeout`] during connect | connect result | Yes |
//!
//! A failed connect never leaves a half-registered handle in the
//! [`crate::ConnectionRegistry`].

use std::time::Duration;

use thiserror::Error;

use agrisense_types::Transport;

use crate::permissions::Permission;

/// Errors that can occur while discovering, connecting to, or reading from
/// a sensor.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Bluetooth Low Energy error from the platform stack.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// A telemetry fetch found no usable reading at the address.
    #[error("No telemetry at {address}: {reason}")]
    ProbeNotFound {
        /// Address that was fetched.
        address: String,
        /// Why the response was rejected.
        reason: NotFoundReason,
    },

    /// Operation timed out.
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The timeout duration.
        duration: Duration,
    },

    /// The expected GATT service is not exposed by the peripheral.
    #[error("Service not found: {uuid} (device exposes {service_count} services)")]
    ServiceNotFound {
        /// The service UUID that was not found.
        uuid: String,
        /// Number of services the device exposes.
        service_count: usize,
    },

    /// The expected characteristic is missing from the telemetry service.
    #[error("Characteristic not found: {uuid} in service {service}")]
    CharacteristicNotFound {
        /// The characteristic UUID that was not found.
        uuid: String,
        /// The service that was searched.
        service: String,
    },

    /// A required platform permission has not been granted.
    #[error("Permission denied: {0}")]
    PermissionDenied(Permission),

    /// The radio for this transport is off, missing or unsupported.
    #[error("{transport} unavailable: {reason}")]
    TransportUnavailable {
        /// The transport that cannot be used.
        transport: Transport,
        /// Human-readable cause.
        reason: String,
    },

    /// Connection failed for a reason not covered above.
    #[error("Connection to {device_id} failed: {reason}")]
    ConnectionFailed {
        /// The device that failed to connect.
        device_id: String,
        /// Description of the failure.
        reason: String,
    },

    /// No connection is held on this transport.
    #[error("Not connected over {0}")]
    NotConnected(Transport),

    /// Connected, but no telemetry has arrived yet.
    #[error("No reading received yet over {0}")]
    NoReading(Transport),

    /// The platform stack does not support the operation.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Operation was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Why a probe did not find a sensor at an address.
///
/// This is absence, not failure: scanners log it at `debug` and move on.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum NotFoundReason {
    /// No response within the probe timeout.
    Timeout,
    /// Connection refused, unreachable host, reset, etc.
    Network(String),
    /// The endpoint answered with a non-2xx status.
    Status(u16),
    /// The body was not a JSON object with numeric fields.
    InvalidBody(String),
    /// The body parsed but carried none of the recognized telemetry keys.
    NoRecognizedKeys,
}

impl std::fmt::Display for NotFoundReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "timed out"),
            Self::Network(msg) => write!(f, "network error: {}", msg),
            Self::Status(code) => write!(f, "HTTP status {}", code),
            Self::InvalidBody(msg) => write!(f, "invalid body: {}", msg),
            Self::NoRecognizedKeys => write!(f, "no recognized telemetry keys"),
        }
    }
}

impl Error {
    /// Create a timeout error with operation context.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create a service not found error.
    pub fn service_not_found(uuid: impl Into<String>, service_count: usize) -> Self {
        Self::ServiceNotFound {
            uuid: uuid.into(),
            service_count,
        }
    }

    /// Create a characteristic not found error.
    pub fn characteristic_not_found(uuid: impl Into<String>, service: impl Into<String>) -> Self {
        Self::CharacteristicNotFound {
            uuid: uuid.into(),
            service: service.into(),
        }
    }

    /// Create a transport unavailable error.
    pub fn transport_unavailable(transport: Transport, reason: impl Into<String>) -> Self {
        Self::TransportUnavailable {
            transport,
            reason: reason.into(),
        }
    }

    /// Create a connection failure.
    pub fn connection_failed(device_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            device_id: device_id.into(),
            reason: reason.into(),
        }
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Whether this error is a connection-level failure that is reported
    /// to the connect caller.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            Error::ServiceNotFound { .. }
                | Error::CharacteristicNotFound { .. }
                | Error::PermissionDenied(_)
                | Error::TransportUnavailable { .. }
                | Error::ConnectionFailed { .. }
                | Error::Timeout { .. }
                | Error::Bluetooth(_)
        )
    }
}

/// Result type alias using agrisense-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;
