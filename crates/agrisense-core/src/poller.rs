//! Fixed-cadence polling of the latest reading.
//!
//! [`TelemetrySource`] is the one "fetch latest" operation both transports
//! share. [`TelemetryPoller`] calls it on a fixed interval from a background
//! task until its [`PollerHandle`] is stopped or dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use agrisense_types::{Metric, ReadingOrigin, TelemetryFrame, Transport};

use crate::error::{Error, Result};
use crate::supervisor::ConnectionSupervisor;

/// Default polling interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Default number of consecutive all-zero readings before the simulated
/// fallback kicks in.
pub const DEFAULT_ZERO_THRESHOLD: u32 = 3;

/// Source of the current reading.
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    /// Fetch the latest reading.
    async fn fetch_latest(&self) -> Result<TelemetryFrame>;
}

#[async_trait]
impl<T: TelemetrySource + ?Sized> TelemetrySource for Arc<T> {
    async fn fetch_latest(&self) -> Result<TelemetryFrame> {
        (**self).fetch_latest().await
    }
}

/// The reading of one transport held by a supervisor.
#[derive(Debug, Clone)]
pub struct TransportTelemetry {
    supervisor: Arc<ConnectionSupervisor>,
    transport: Transport,
}

impl TransportTelemetry {
    /// Source reading `transport` through `supervisor`.
    pub fn new(supervisor: Arc<ConnectionSupervisor>, transport: Transport) -> Self {
        Self {
            supervisor,
            transport,
        }
    }

    /// The transport read.
    pub fn transport(&self) -> Transport {
        self.transport
    }
}

#[async_trait]
impl TelemetrySource for TransportTelemetry {
    async fn fetch_latest(&self) -> Result<TelemetryFrame> {
        self.supervisor.fetch_latest(self.transport).await
    }
}

/// Options for [`TelemetryPoller`].
#[derive(Debug, Clone)]
pub struct PollerOptions {
    /// Time between fetches.
    pub interval: Duration,
    /// Substitute simulated readings after repeated all-zero readings.
    ///
    /// Off by default. Substituted readings are tagged
    /// [`ReadingOrigin::Simulated`].
    pub simulate_on_zero: bool,
    /// Consecutive all-zero readings before substituting.
    pub zero_threshold: u32,
}

impl Default for PollerOptions {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            simulate_on_zero: false,
            zero_threshold: DEFAULT_ZERO_THRESHOLD,
        }
    }
}

impl PollerOptions {
    /// Create options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the polling interval.
    #[must_use]
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Enable or disable the simulated fallback.
    #[must_use]
    pub fn simulate_on_zero(mut self, enabled: bool) -> Self {
        self.simulate_on_zero = enabled;
        self
    }

    /// Set the all-zero threshold.
    #[must_use]
    pub fn zero_threshold(mut self, threshold: u32) -> Self {
        self.zero_threshold = threshold;
        self
    }

    /// Validate the options.
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(Error::invalid_config("poll interval must be > 0"));
        }
        if self.zero_threshold == 0 {
            return Err(Error::invalid_config("zero_threshold must be > 0"));
        }
        Ok(())
    }
}

/// Counters kept by a running poller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollerStats {
    /// Ticks fired.
    pub ticks: u64,
    /// Readings delivered, simulated ones included.
    pub readings: u64,
    /// Fetches that failed.
    pub errors: u64,
    /// Simulated readings delivered.
    pub simulated: u64,
}

#[derive(Debug, Default)]
struct PollerCounters {
    ticks: AtomicU64,
    readings: AtomicU64,
    errors: AtomicU64,
    simulated: AtomicU64,
}

impl PollerCounters {
    fn snapshot(&self) -> PollerStats {
        PollerStats {
            ticks: self.ticks.load(Ordering::Relaxed),
            readings: self.readings.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            simulated: self.simulated.load(Ordering::Relaxed),
        }
    }
}

/// Replaces runs of all-zero readings with tagged placeholders.
#[derive(Debug)]
pub struct SimulatedFallback {
    threshold: u32,
    consecutive_zero: u32,
}

impl SimulatedFallback {
    /// Fallback that triggers after `threshold` consecutive all-zero frames.
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive_zero: 0,
        }
    }

    /// Pass a reading through, substituting a simulated one when the
    /// all-zero run reaches the threshold.
    pub fn apply(&mut self, frame: TelemetryFrame) -> TelemetryFrame {
        if !frame.is_all_zero() {
            self.consecutive_zero = 0;
            return frame;
        }
        self.consecutive_zero = self.consecutive_zero.saturating_add(1);
        if self.consecutive_zero < self.threshold {
            return frame;
        }
        warn!(
            "{} consecutive all-zero readings, substituting a simulated reading",
            self.consecutive_zero
        );
        simulated_like(&frame)
    }
}

/// Plausible random reading with the same keys as `template`.
pub fn simulated_like(template: &TelemetryFrame) -> TelemetryFrame {
    let mut rng = rand::rng();
    let values: Vec<(String, f64)> = template
        .values()
        .map(|(key, _)| {
            let (low, high) = Metric::recognize(key).map_or((0.0, 100.0), plausible_range);
            let value: f64 = rng.random_range(low..high);
            (key.to_string(), (value * 10.0).round() / 10.0)
        })
        .collect();
    TelemetryFrame::from_values(values).with_origin(ReadingOrigin::Simulated)
}

fn plausible_range(metric: Metric) -> (f64, f64) {
    match metric {
        Metric::Moisture => (20.0, 60.0),
        Metric::Ph => (5.5, 7.5),
        Metric::Conductivity => (100.0, 1500.0),
        Metric::SoilTemperature => (15.0, 30.0),
        Metric::WaterDepth => (0.0, 30.0),
        Metric::CapacitiveMoisture => (300.0, 800.0),
        Metric::SampleTemperature => (18.0, 28.0),
        Metric::AmbientTemperature => (18.0, 32.0),
        Metric::AmbientHumidity => (30.0, 80.0),
        Metric::SampleWeight => (5.0, 50.0),
        _ => (0.0, 100.0),
    }
}

/// Starts fixed-interval polling loops.
pub struct TelemetryPoller;

impl TelemetryPoller {
    /// Spawn a loop that delivers each fetched reading to `on_reading`.
    ///
    /// The first fetch happens immediately. Fetch errors are logged and
    /// counted, never delivered.
    pub fn start<S, F>(
        source: Arc<S>,
        options: PollerOptions,
        mut on_reading: F,
    ) -> Result<PollerHandle>
    where
        S: TelemetrySource + ?Sized + 'static,
        F: FnMut(TelemetryFrame) + Send + 'static,
    {
        options.validate()?;

        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let counters = Arc::new(PollerCounters::default());
        let task_counters = Arc::clone(&counters);

        let task = tokio::spawn(async move {
            let mut ticker = interval(options.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut fallback = options
                .simulate_on_zero
                .then(|| SimulatedFallback::new(options.zero_threshold));

            loop {
                tokio::select! {
                    biased;
                    _ = task_cancel.cancelled() => {
                        debug!("Poller cancelled, stopping gracefully");
                        break;
                    }
                    _ = ticker.tick() => {}
                }
                task_counters.ticks.fetch_add(1, Ordering::Relaxed);

                match source.fetch_latest().await {
                    Ok(frame) => {
                        let frame = match fallback.as_mut() {
                            Some(fallback) => fallback.apply(frame),
                            None => frame,
                        };
                        if frame.is_simulated() {
                            task_counters.simulated.fetch_add(1, Ordering::Relaxed);
                        }
                        task_counters.readings.fetch_add(1, Ordering::Relaxed);
                        on_reading(frame);
                    }
                    Err(e) => {
                        task_counters.errors.fetch_add(1, Ordering::Relaxed);
                        debug!("Poll failed: {}", e);
                    }
                }
            }
        });

        Ok(PollerHandle {
            cancel,
            task: Some(task),
            counters,
        })
    }
}

/// Controls a running poller. Dropping it stops the loop.
#[derive(Debug)]
pub struct PollerHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    counters: Arc<PollerCounters>,
}

impl PollerHandle {
    /// Stop polling.
    ///
    /// A fetch already in flight completes and is delivered; no tick fires
    /// once this returns. Calling it again is a no-op.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
            && e.is_panic()
        {
            warn!("Poller task panicked: {}", e);
        }
    }

    /// Whether the loop is still running.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Counters so far.
    pub fn stats(&self) -> PollerStats {
        self.counters.snapshot()
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zeros() -> TelemetryFrame {
        TelemetryFrame::from_values([("pH", 0.0), ("moisture", 0.0)])
    }

    #[test]
    fn test_options_defaults() {
        let options = PollerOptions::default();
        assert_eq!(options.interval, Duration::from_secs(5));
        assert!(!options.simulate_on_zero);
        assert_eq!(options.zero_threshold, 3);
        assert!(options.validate().is_ok());
        assert!(PollerOptions::new().interval(Duration::ZERO).validate().is_err());
        assert!(PollerOptions::new().zero_threshold(0).validate().is_err());
    }

    #[test]
    fn test_fallback_triggers_after_threshold() {
        let mut fallback = SimulatedFallback::new(3);
        assert!(!fallback.apply(zeros()).is_simulated());
        assert!(!fallback.apply(zeros()).is_simulated());
        let third = fallback.apply(zeros());
        assert!(third.is_simulated());
        assert_eq!(third.len(), 2);
        assert!(fallback.apply(zeros()).is_simulated());
    }

    #[test]
    fn test_fallback_resets_on_real_reading() {
        let mut fallback = SimulatedFallback::new(2);
        fallback.apply(zeros());
        let real = fallback.apply(TelemetryFrame::from_values([("pH", 6.4)]));
        assert!(!real.is_simulated());
        assert!(!fallback.apply(zeros()).is_simulated());
    }

    #[test]
    fn test_simulated_values_are_plausible() {
        for _ in 0..50 {
            let frame = simulated_like(&zeros());
            let ph = frame.metric(Metric::Ph).unwrap();
            assert!((5.5..=7.5).contains(&ph), "pH {ph}");
            let moisture = frame.metric(Metric::Moisture).unwrap();
            assert!((20.0..=60.0).contains(&moisture), "moisture {moisture}");
            assert_eq!(frame.origin(), ReadingOrigin::Simulated);
        }
    }
}
