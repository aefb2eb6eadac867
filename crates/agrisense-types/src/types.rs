//! Core types for AgriSense sensor connectivity.

use core::fmt;
use std::collections::BTreeMap;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::error::{ParseError, ParseResult};

/// Default port of the sensor's HTTP telemetry endpoint.
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// Default path of the sensor's HTTP telemetry endpoint.
pub const DEFAULT_HTTP_PATH: &str = "/moisture";

/// Physical transport a sensor is reached over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Transport {
    /// Local-network HTTP.
    Wifi,
    /// Bluetooth Low Energy notifications.
    Ble,
}

impl Transport {
    /// Both transports, in registry order.
    pub const ALL: [Transport; 2] = [Transport::Wifi, Transport::Ble];
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Wifi => write!(f, "WiFi"),
            Transport::Ble => write!(f, "BLE"),
        }
    }
}

/// Where a reading came from.
///
/// Simulated readings are only ever produced when a consumer explicitly opts
/// into the placeholder fallback, and they always carry this tag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ReadingOrigin {
    /// Reported by the physical sensor.
    #[default]
    Sensor,
    /// Generated placeholder, not a measurement.
    Simulated,
}

/// A telemetry metric recognized on the wire.
///
/// Firmware revisions disagree on key names, so every metric accepts a set
/// of aliases. The first alias is the canonical spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[non_exhaustive]
pub enum Metric {
    /// Soil moisture, percent.
    Moisture,
    /// Soil pH.
    Ph,
    /// Electrical conductivity, µS/cm.
    Conductivity,
    /// Soil temperature, °C.
    SoilTemperature,
    /// Water depth, cm.
    WaterDepth,
    /// Raw capacitive moisture count.
    CapacitiveMoisture,
    /// Sample temperature, °C.
    SampleTemperature,
    /// Ambient air temperature, °C.
    AmbientTemperature,
    /// Ambient relative humidity, percent.
    AmbientHumidity,
    /// Sample weight, grams.
    SampleWeight,
}

impl Metric {
    /// Every metric, in display order.
    pub const ALL: [Metric; 10] = [
        Metric::Moisture,
        Metric::Ph,
        Metric::Conductivity,
        Metric::SoilTemperature,
        Metric::WaterDepth,
        Metric::CapacitiveMoisture,
        Metric::SampleTemperature,
        Metric::AmbientTemperature,
        Metric::AmbientHumidity,
        Metric::SampleWeight,
    ];

    /// Wire keys accepted for this metric.
    #[must_use]
    pub fn aliases(&self) -> &'static [&'static str] {
        match self {
            Metric::Moisture => &[
                "moisture",
                "moistureLevel",
                "moisture_level",
                "value",
                "soil_moisture",
                "soil_moisture_pct",
                "soilMoisture",
            ],
            Metric::Ph => &["pH", "ph", "soil_ph", "soilPh"],
            Metric::Conductivity => &["ec", "EC", "conductivity", "soil_ec"],
            Metric::SoilTemperature => &[
                "soil_temp",
                "soil_temperature",
                "soilTemperature",
                "soil_temp_c",
            ],
            Metric::WaterDepth => &["water_depth", "waterDepth", "depth_cm"],
            Metric::CapacitiveMoisture => &["capacitive", "capacitive_moisture", "cap_moisture"],
            Metric::SampleTemperature => &[
                "sample_temp",
                "sample_temperature",
                "sampleTemperature",
            ],
            Metric::AmbientTemperature => &["temperature", "temp", "ambient_temp", "air_temp"],
            Metric::AmbientHumidity => &["humidity", "ambient_humidity", "air_humidity"],
            Metric::SampleWeight => &["weight", "sample_weight", "weight_g"],
        }
    }

    /// Look up the metric a wire key belongs to.
    ///
    /// ```
    /// use agrisense_types::Metric;
    ///
    /// assert_eq!(Metric::recognize("moistureLevel"), Some(Metric::Moisture));
    /// assert_eq!(Metric::recognize("battery"), None);
    /// ```
    #[must_use]
    pub fn recognize(key: &str) -> Option<Metric> {
        Metric::ALL
            .into_iter()
            .find(|metric| metric.aliases().contains(&key))
    }

    /// Measurement unit suffix for display.
    #[must_use]
    pub fn unit(&self) -> &'static str {
        match self {
            Metric::Moisture | Metric::AmbientHumidity => "%",
            Metric::Ph | Metric::CapacitiveMoisture => "",
            Metric::Conductivity => "µS/cm",
            Metric::SoilTemperature | Metric::SampleTemperature | Metric::AmbientTemperature => {
                "°C"
            }
            Metric::WaterDepth => "cm",
            Metric::SampleWeight => "g",
        }
    }

    /// Sensor kind that reports this metric.
    #[must_use]
    pub fn sensor_kind(&self) -> SensorKind {
        match self {
            Metric::Moisture
            | Metric::Ph
            | Metric::Conductivity
            | Metric::SoilTemperature
            | Metric::WaterDepth => SensorKind::SoilProbe,
            Metric::CapacitiveMoisture
            | Metric::SampleTemperature
            | Metric::AmbientTemperature
            | Metric::AmbientHumidity
            | Metric::SampleWeight => SensorKind::SampleAnalyzer,
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Metric::Moisture => "Moisture",
            Metric::Ph => "pH",
            Metric::Conductivity => "EC",
            Metric::SoilTemperature => "Soil temperature",
            Metric::WaterDepth => "Water depth",
            Metric::CapacitiveMoisture => "Capacitive moisture",
            Metric::SampleTemperature => "Sample temperature",
            Metric::AmbientTemperature => "Ambient temperature",
            Metric::AmbientHumidity => "Ambient humidity",
            Metric::SampleWeight => "Sample weight",
        };
        f.write_str(label)
    }
}

/// Family of sensor hardware, inferred from the metrics it reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum SensorKind {
    /// In-ground probe: pH, moisture, EC, soil temperature, water depth.
    SoilProbe,
    /// Bench analyzer: capacitive moisture, sample and ambient climate, weight.
    SampleAnalyzer,
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorKind::SoilProbe => write!(f, "Soil probe"),
            SensorKind::SampleAnalyzer => write!(f, "Sample analyzer"),
        }
    }
}

/// One complete, parsed telemetry record.
///
/// Values are kept under their wire keys so that aggregation and display can
/// preserve whatever the firmware reported; [`TelemetryFrame::metric`]
/// resolves aliases on lookup.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TelemetryFrame {
    values: BTreeMap<String, f64>,
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    captured_at: OffsetDateTime,
    #[cfg_attr(feature = "serde", serde(default))]
    origin: ReadingOrigin,
}

impl TelemetryFrame {
    /// Build a sensor frame from key/value pairs, captured now.
    pub fn from_values<K, I>(values: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, f64)>,
    {
        Self {
            values: values.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            captured_at: OffsetDateTime::now_utc(),
            origin: ReadingOrigin::Sensor,
        }
    }

    /// Parse one JSON object into a frame.
    ///
    /// Numeric fields and numeric strings are kept; every other field is
    /// ignored. An object with no numeric field is rejected.
    pub fn from_json(text: &str) -> ParseResult<Self> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Object(object) = value else {
            return Err(ParseError::NotAnObject);
        };

        let values: BTreeMap<String, f64> = object
            .into_iter()
            .filter_map(|(key, value)| numeric(&value).map(|v| (key, v)))
            .collect();

        if values.is_empty() {
            return Err(ParseError::NoNumericFields);
        }

        Ok(Self {
            values,
            captured_at: OffsetDateTime::now_utc(),
            origin: ReadingOrigin::Sensor,
        })
    }

    /// Parse a frame from raw bytes, which must be UTF-8 JSON.
    pub fn from_json_bytes(bytes: &[u8]) -> ParseResult<Self> {
        let text = std::str::from_utf8(bytes).map_err(|_| ParseError::InvalidUtf8)?;
        Self::from_json(text)
    }

    /// Replace the capture timestamp.
    #[must_use]
    pub fn with_captured_at(mut self, captured_at: OffsetDateTime) -> Self {
        self.captured_at = captured_at;
        self
    }

    /// Replace the origin tag.
    #[must_use]
    pub fn with_origin(mut self, origin: ReadingOrigin) -> Self {
        self.origin = origin;
        self
    }

    /// Value stored under an exact wire key.
    pub fn get(&self, key: &str) -> Option<f64> {
        self.values.get(key).copied()
    }

    /// Value of a metric, resolved through its aliases in order.
    pub fn metric(&self, metric: Metric) -> Option<f64> {
        metric.aliases().iter().find_map(|alias| self.get(alias))
    }

    /// Iterate over wire keys and values, sorted by key.
    pub fn values(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Number of numeric fields.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the frame has no fields (only possible for hand-built frames).
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Whether at least one key is a recognized metric alias.
    pub fn has_recognized_metric(&self) -> bool {
        self.values.keys().any(|key| Metric::recognize(key).is_some())
    }

    /// Whether every value is exactly zero.
    ///
    /// Some probes report all zeros when the electrodes are dry or
    /// disconnected.
    pub fn is_all_zero(&self) -> bool {
        !self.values.is_empty() && self.values.values().all(|v| *v == 0.0)
    }

    /// When the frame was captured.
    pub fn captured_at(&self) -> OffsetDateTime {
        self.captured_at
    }

    /// Where the frame came from.
    pub fn origin(&self) -> ReadingOrigin {
        self.origin
    }

    /// Whether this is a generated placeholder rather than a measurement.
    pub fn is_simulated(&self) -> bool {
        self.origin == ReadingOrigin::Simulated
    }

    /// Sensor kind inferred from the recognized metrics, if any.
    pub fn sensor_kind(&self) -> Option<SensorKind> {
        self.values
            .keys()
            .find_map(|key| Metric::recognize(key))
            .map(|metric| metric.sensor_kind())
    }

    /// Compare only the key/value content of two frames.
    pub fn same_values(&self, other: &TelemetryFrame) -> bool {
        self.values == other.values
    }
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
        _ => None,
    }
}

/// HTTP endpoint of a WiFi sensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct HttpTarget {
    /// Host name or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Request path, always starting with `/`.
    pub path: String,
}

impl HttpTarget {
    /// Target on the default port and path.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_HTTP_PORT,
            path: DEFAULT_HTTP_PATH.to_string(),
        }
    }

    /// Set the port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the path; a missing leading `/` is added.
    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        let path = path.into();
        self.path = if path.starts_with('/') {
            path
        } else {
            format!("/{path}")
        };
        self
    }

    /// Full request URL.
    pub fn url(&self) -> String {
        format!("http://{}:{}{}", self.host, self.port, self.path)
    }

    /// Address as reported in descriptors: the host, plus the port when it
    /// is not the default.
    pub fn address(&self) -> String {
        if self.port == DEFAULT_HTTP_PORT {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Parse `host`, `host:port`, or `http://host[:port][/path]`.
    ///
    /// A path embedded in the input wins over `default_path`.
    ///
    /// ```
    /// use agrisense_types::HttpTarget;
    ///
    /// let target = HttpTarget::parse("192.168.4.1:8080", "/moisture").unwrap();
    /// assert_eq!(target.url(), "http://192.168.4.1:8080/moisture");
    ///
    /// let target = HttpTarget::parse("http://10.0.0.7/data", "/moisture").unwrap();
    /// assert_eq!(target.url(), "http://10.0.0.7:80/data");
    /// ```
    pub fn parse(input: &str, default_path: &str) -> Option<Self> {
        let rest = input.trim();
        let rest = rest.strip_prefix("http://").unwrap_or(rest);
        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], Some(&rest[idx..])),
            None => (rest, None),
        };
        if authority.is_empty() {
            return None;
        }

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => (host, port.parse::<u16>().ok()?),
            None => (authority, DEFAULT_HTTP_PORT),
        };
        if host.is_empty() {
            return None;
        }

        Some(
            HttpTarget::new(host)
                .with_port(port)
                .with_path(path.unwrap_or(default_path)),
        )
    }
}

impl fmt::Display for HttpTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}

/// Identity of a discoverable device, as produced by a scanner.
///
/// Descriptors are not unique across scans: rediscovering a device yields a
/// fresh descriptor with the same address.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DeviceDescriptor {
    transport: Transport,
    address: String,
    display_name: String,
    signal_strength: Option<i16>,
    last_known_reading: Option<TelemetryFrame>,
}

impl DeviceDescriptor {
    /// Descriptor for a sensor answering on the HTTP endpoint.
    pub fn wifi(
        target: &HttpTarget,
        display_name: impl Into<String>,
        reading: Option<TelemetryFrame>,
    ) -> Self {
        Self {
            transport: Transport::Wifi,
            address: target.address(),
            display_name: display_name.into(),
            signal_strength: None,
            last_known_reading: reading,
        }
    }

    /// Descriptor for an advertising BLE peripheral.
    pub fn ble(id: impl Into<String>, display_name: impl Into<String>, rssi: Option<i16>) -> Self {
        Self {
            transport: Transport::Ble,
            address: id.into(),
            display_name: display_name.into(),
            signal_strength: rssi,
            last_known_reading: None,
        }
    }

    /// Transport the device was found on.
    pub fn transport(&self) -> Transport {
        self.transport
    }

    /// `host[:port]` for WiFi, peripheral id for BLE.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Human-readable name.
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// RSSI in dBm, when the transport reports one.
    pub fn signal_strength(&self) -> Option<i16> {
        self.signal_strength
    }

    /// Reading returned inline by the discovery probe.
    pub fn last_known_reading(&self) -> Option<&TelemetryFrame> {
        self.last_known_reading.as_ref()
    }
}

/// Lifecycle state of a per-transport connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "state", content = "reason", rename_all = "snake_case"))]
pub enum ConnectionState {
    /// No connection.
    #[default]
    Disconnected,
    /// Being established, or recorded but not yet confirmed live.
    Connecting,
    /// Established and delivering telemetry.
    Connected,
    /// The last attempt failed.
    Failed(String),
}

impl ConnectionState {
    /// Whether the state holds transport resources.
    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Registry view of the connection held on one transport.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ConnectionHandle {
    /// Transport this handle belongs to.
    pub transport: Transport,
    /// Device address (see [`DeviceDescriptor::address`]).
    pub address: String,
    /// Human-readable device name.
    pub display_name: String,
    /// Current lifecycle state.
    pub state: ConnectionState,
    /// When the handle was registered.
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub connected_at: OffsetDateTime,
}

/// Progress of a network scan.
///
/// `total` is fixed when the scan plan is computed; `current` never
/// decreases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ScanProgress {
    /// Probes resolved so far.
    pub current: usize,
    /// Probes planned.
    pub total: usize,
}

impl ScanProgress {
    /// Fraction done in `0.0..=1.0`; an empty plan counts as done.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.current.min(self.total) as f64 / self.total as f64
        }
    }

    /// Whether every planned probe has resolved.
    pub fn is_complete(&self) -> bool {
        self.current >= self.total
    }
}
