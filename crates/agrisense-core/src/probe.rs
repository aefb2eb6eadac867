//! Single-host HTTP telemetry probe.
//!
//! A probe issues one `GET http://{host}:{port}{path}` and decides whether a
//! sensor answered. Every failure mode collapses to
//! [`ProbeOutcome::NotFound`]: scanners only ever see presence or absence.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

use agrisense_types::{
    DEFAULT_HTTP_PATH, DEFAULT_HTTP_PORT, DeviceDescriptor, HttpTarget, TelemetryFrame,
};

use crate::error::{Error, NotFoundReason, Result};

/// Default timeout for a single probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Body fields consulted, in order, for a device's display name.
const NAME_FIELDS: [&str; 3] = ["name", "device", "id"];

/// Options for [`DeviceProbe`].
#[derive(Debug, Clone)]
pub struct ProbeOptions {
    /// Per-request timeout, covering connect, headers and body.
    pub timeout: Duration,
    /// Port probed on each host.
    pub port: u16,
    /// Telemetry path probed on each host.
    pub path: String,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_PROBE_TIMEOUT,
            port: DEFAULT_HTTP_PORT,
            path: DEFAULT_HTTP_PATH.to_string(),
        }
    }
}

impl ProbeOptions {
    /// Create options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the probe timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the port.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the telemetry path.
    #[must_use]
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Target for `host` using these options' port and path.
    pub fn target(&self, host: impl Into<String>) -> HttpTarget {
        HttpTarget::new(host)
            .with_port(self.port)
            .with_path(self.path.clone())
    }

    /// Validate the options.
    pub fn validate(&self) -> Result<()> {
        if self.timeout.is_zero() {
            return Err(Error::invalid_config("probe timeout must be > 0"));
        }
        if self.port == 0 {
            return Err(Error::invalid_config("probe port must be > 0"));
        }
        Ok(())
    }
}

/// Result of probing one host.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    /// A sensor answered; the descriptor carries the inline reading.
    Found(DeviceDescriptor),
    /// Nothing usable at this address.
    NotFound(NotFoundReason),
}

impl ProbeOutcome {
    /// Whether a sensor answered.
    pub fn is_found(&self) -> bool {
        matches!(self, ProbeOutcome::Found(_))
    }

    /// The descriptor, if found.
    pub fn descriptor(&self) -> Option<&DeviceDescriptor> {
        match self {
            ProbeOutcome::Found(descriptor) => Some(descriptor),
            ProbeOutcome::NotFound(_) => None,
        }
    }

    /// Convert into the inline reading, or a [`Error::ProbeNotFound`] for
    /// callers that treat absence as a failed fetch.
    pub fn into_reading(self, target: &HttpTarget) -> Result<TelemetryFrame> {
        match self {
            ProbeOutcome::Found(descriptor) => {
                descriptor
                    .last_known_reading()
                    .cloned()
                    .ok_or_else(|| Error::ProbeNotFound {
                        address: target.address(),
                        reason: NotFoundReason::NoRecognizedKeys,
                    })
            }
            ProbeOutcome::NotFound(reason) => Err(Error::ProbeNotFound {
                address: target.address(),
                reason,
            }),
        }
    }
}

/// Tests one HTTP target for the telemetry endpoint.
///
/// Implementations never fail: every problem is reported as
/// [`ProbeOutcome::NotFound`].
#[async_trait]
pub trait Prober: Send + Sync {
    /// Probe a single target.
    async fn probe(&self, target: &HttpTarget) -> ProbeOutcome;
}

/// [`Prober`] backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct DeviceProbe {
    client: Client,
    options: ProbeOptions,
}

impl DeviceProbe {
    /// Create a probe with default options.
    pub fn new() -> Result<Self> {
        Self::with_options(ProbeOptions::default())
    }

    /// Create a probe with custom options.
    pub fn with_options(options: ProbeOptions) -> Result<Self> {
        options.validate()?;
        let client = Client::builder()
            .timeout(options.timeout)
            .no_proxy()
            .build()?;
        Ok(Self { client, options })
    }

    /// The probe options.
    pub fn options(&self) -> &ProbeOptions {
        &self.options
    }
}

#[async_trait]
impl Prober for DeviceProbe {
    async fn probe(&self, target: &HttpTarget) -> ProbeOutcome {
        let url = target.url();
        let outcome = match self.client.get(&url).send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                match response.bytes().await {
                    Ok(body) => evaluate_response(target, status, &body),
                    Err(e) => ProbeOutcome::NotFound(classify_transport_error(&e)),
                }
            }
            Err(e) => ProbeOutcome::NotFound(classify_transport_error(&e)),
        };

        match &outcome {
            ProbeOutcome::Found(descriptor) => {
                debug!("Sensor found at {} ({})", url, descriptor.display_name());
            }
            ProbeOutcome::NotFound(reason) => debug!("No sensor at {}: {}", url, reason),
        }
        outcome
    }
}

fn classify_transport_error(error: &reqwest::Error) -> NotFoundReason {
    if error.is_timeout() {
        NotFoundReason::Timeout
    } else {
        NotFoundReason::Network(error.to_string())
    }
}

/// Decide whether an HTTP response came from a sensor.
///
/// Found only for a 2xx status whose JSON body carries at least one
/// recognized telemetry key.
pub fn evaluate_response(target: &HttpTarget, status: u16, body: &[u8]) -> ProbeOutcome {
    if !(200..300).contains(&status) {
        return ProbeOutcome::NotFound(NotFoundReason::Status(status));
    }

    let frame = match TelemetryFrame::from_json_bytes(body) {
        Ok(frame) => frame,
        Err(e) => return ProbeOutcome::NotFound(NotFoundReason::InvalidBody(e.to_string())),
    };
    if !frame.has_recognized_metric() {
        return ProbeOutcome::NotFound(NotFoundReason::NoRecognizedKeys);
    }

    let name = display_name_from_body(body)
        .unwrap_or_else(|| format!("Sensor @ {}", target.address()));
    ProbeOutcome::Found(DeviceDescriptor::wifi(target, name, Some(frame)))
}

fn display_name_from_body(body: &[u8]) -> Option<String> {
    let Ok(Value::Object(object)) = serde_json::from_slice::<Value>(body) else {
        return None;
    };
    NAME_FIELDS.iter().find_map(|field| match object.get(*field) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use agrisense_types::Metric;

    fn target() -> HttpTarget {
        HttpTarget::new("192.168.4.1")
    }

    #[test]
    fn test_found_with_inline_reading() {
        let outcome = evaluate_response(&target(), 200, br#"{"moisture":45.2}"#);
        let descriptor = outcome.descriptor().unwrap();
        assert_eq!(descriptor.address(), "192.168.4.1");
        assert_eq!(descriptor.display_name(), "Sensor @ 192.168.4.1");
        assert_eq!(
            descriptor.last_known_reading().and_then(|r| r.metric(Metric::Moisture)),
            Some(45.2)
        );
    }

    #[test]
    fn test_display_name_from_body() {
        let outcome = evaluate_response(
            &target(),
            200,
            br#"{"device":"North Field","id":"np-7","pH":6.1}"#,
        );
        assert_eq!(outcome.descriptor().unwrap().display_name(), "North Field");
    }

    #[test]
    fn test_non_2xx_is_not_found() {
        assert_eq!(
            evaluate_response(&target(), 404, br#"{"moisture":1}"#),
            ProbeOutcome::NotFound(NotFoundReason::Status(404))
        );
        assert_eq!(
            evaluate_response(&target(), 500, b""),
            ProbeOutcome::NotFound(NotFoundReason::Status(500))
        );
    }

    #[test]
    fn test_unrecognized_body_is_not_found() {
        assert_eq!(
            evaluate_response(&target(), 200, br#"{"uptime":1234}"#),
            ProbeOutcome::NotFound(NotFoundReason::NoRecognizedKeys)
        );
        assert!(matches!(
            evaluate_response(&target(), 200, b"<html>router login</html>"),
            ProbeOutcome::NotFound(NotFoundReason::InvalidBody(_))
        ));
    }

    #[test]
    fn test_into_reading() {
        let target = target();
        let reading = evaluate_response(&target, 200, br#"{"value":12}"#)
            .into_reading(&target)
            .unwrap();
        assert_eq!(reading.metric(Metric::Moisture), Some(12.0));

        let err = ProbeOutcome::NotFound(NotFoundReason::Timeout)
            .into_reading(&target)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::ProbeNotFound {
                reason: NotFoundReason::Timeout,
                ..
            }
        ));
    }

    #[test]
    fn test_options_target_and_validation() {
        let options = ProbeOptions::new().port(8080).path("data");
        assert_eq!(options.target("10.0.0.5").url(), "http://10.0.0.5:8080/data");
        assert!(options.validate().is_ok());
        assert!(ProbeOptions::new().timeout(Duration::ZERO).validate().is_err());
        assert!(ProbeOptions::new().port(0).validate().is_err());
    }
}
