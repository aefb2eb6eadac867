//! Timed multi-sample reading sessions.
//!
//! A session samples a [`TelemetrySource`] `target_sample_count` times,
//! spread evenly across `target_duration`, and reduces the samples to their
//! per-metric means. The duration is authoritative: when the source is slow
//! the session ends on time with fewer samples.
//!
//! Sessions pass samples through unchanged unless
//! [`SessionConfig::simulate_on_zero`] is set, in which case runs of
//! all-zero samples are replaced the same way the poller replaces them.

use std::collections::BTreeMap;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use agrisense_types::{Metric, TelemetryFrame};

use crate::error::{Error, Result};
use crate::poller::{DEFAULT_ZERO_THRESHOLD, SimulatedFallback, TelemetrySource};

/// Default number of samples per session.
pub const DEFAULT_SAMPLE_COUNT: usize = 10;

/// Default session length.
pub const DEFAULT_SESSION_DURATION: Duration = Duration::from_secs(5);

/// Default time between progress updates.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Session parameters.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Samples to collect.
    pub target_sample_count: usize,
    /// Session length.
    pub target_duration: Duration,
    /// Time between progress updates.
    pub progress_interval: Duration,
    /// Substitute simulated samples after repeated all-zero samples.
    pub simulate_on_zero: bool,
    /// Consecutive all-zero samples before the fallback triggers.
    pub zero_threshold: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            target_sample_count: DEFAULT_SAMPLE_COUNT,
            target_duration: DEFAULT_SESSION_DURATION,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            simulate_on_zero: false,
            zero_threshold: DEFAULT_ZERO_THRESHOLD,
        }
    }
}

impl SessionConfig {
    /// Create a config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the sample count.
    #[must_use]
    pub fn target_sample_count(mut self, count: usize) -> Self {
        self.target_sample_count = count;
        self
    }

    /// Set the session length.
    #[must_use]
    pub fn target_duration(mut self, duration: Duration) -> Self {
        self.target_duration = duration;
        self
    }

    /// Set the progress interval.
    #[must_use]
    pub fn progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    /// Enable or disable the simulated fallback.
    #[must_use]
    pub fn simulate_on_zero(mut self, enabled: bool) -> Self {
        self.simulate_on_zero = enabled;
        self
    }

    /// Set the all-zero run length that triggers the fallback.
    #[must_use]
    pub fn zero_threshold(mut self, threshold: u32) -> Self {
        self.zero_threshold = threshold;
        self
    }

    /// Time between samples.
    pub fn sample_interval(&self) -> Duration {
        let count = u32::try_from(self.target_sample_count.max(1)).unwrap_or(u32::MAX);
        self.target_duration / count
    }

    /// Validate the config.
    pub fn validate(&self) -> Result<()> {
        if self.target_sample_count == 0 {
            return Err(Error::invalid_config("target_sample_count must be > 0"));
        }
        if self.target_duration.is_zero() {
            return Err(Error::invalid_config("target_duration must be > 0"));
        }
        if self.sample_interval().is_zero() {
            return Err(Error::invalid_config(
                "target_duration too short for target_sample_count",
            ));
        }
        if self.progress_interval.is_zero() {
            return Err(Error::invalid_config("progress_interval must be > 0"));
        }
        if self.zero_threshold == 0 {
            return Err(Error::invalid_config("zero_threshold must be > 0"));
        }
        Ok(())
    }
}

/// Lifecycle of a [`ReadingSession`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionStatus {
    /// Not started.
    #[default]
    Idle,
    /// Collecting samples.
    Running,
    /// Finished, on time or early.
    Complete,
}

/// Progress report emitted while a session runs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionProgress {
    /// Time since the session started.
    pub elapsed: Duration,
    /// Session length.
    pub target: Duration,
    /// `elapsed / target`, clamped to `0.0..=1.0`.
    pub fraction: f64,
    /// Samples collected so far.
    pub samples: usize,
}

/// Per-metric means over a session.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateReading {
    means: BTreeMap<String, f64>,
    sample_count: usize,
}

impl AggregateReading {
    /// Mean of every key across the samples that carry it.
    ///
    /// `None` when there are no samples.
    pub fn from_samples(samples: &[TelemetryFrame]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let mut sums: BTreeMap<String, (f64, usize)> = BTreeMap::new();
        for sample in samples {
            for (key, value) in sample.values() {
                let entry = sums.entry(key.to_string()).or_insert((0.0, 0));
                entry.0 += value;
                entry.1 += 1;
            }
        }
        let means = sums
            .into_iter()
            .map(|(key, (sum, n))| (key, sum / n as f64))
            .collect();
        Some(Self {
            means,
            sample_count: samples.len(),
        })
    }

    /// Mean for a raw key.
    pub fn get(&self, key: &str) -> Option<f64> {
        self.means.get(key).copied()
    }

    /// Mean for a metric, under any of its aliases.
    pub fn metric(&self, metric: Metric) -> Option<f64> {
        metric.aliases().iter().find_map(|alias| self.get(alias))
    }

    /// All means, ordered by key.
    pub fn means(&self) -> impl Iterator<Item = (&str, f64)> {
        self.means.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Number of samples averaged.
    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    /// The means as a frame.
    pub fn to_frame(&self) -> TelemetryFrame {
        TelemetryFrame::from_values(self.means.iter().map(|(k, v)| (k.clone(), *v)))
    }
}

/// Outcome of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    /// Samples collected.
    pub samples: usize,
    /// Per-metric means, `None` when no sample was collected.
    pub aggregate: Option<AggregateReading>,
    /// Time the session ran.
    pub elapsed: Duration,
    /// Whether the session was cancelled before its duration elapsed.
    pub stopped_early: bool,
    /// Whether any sample was simulated, by the source or by the
    /// session's own fallback.
    pub includes_simulated: bool,
}

enum Step {
    Continue,
    Deadline,
    Cancelled,
}

/// One timed sampling run.
#[derive(Debug)]
pub struct ReadingSession {
    config: SessionConfig,
    samples: Vec<TelemetryFrame>,
    status: SessionStatus,
    started_at: Option<OffsetDateTime>,
}

impl ReadingSession {
    /// Create an idle session.
    pub fn new(config: SessionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            samples: Vec::new(),
            status: SessionStatus::Idle,
            started_at: None,
        })
    }

    /// The session config.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Current status.
    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Samples collected so far.
    pub fn samples(&self) -> &[TelemetryFrame] {
        &self.samples
    }

    /// Wall-clock start time, once started.
    pub fn started_at(&self) -> Option<OffsetDateTime> {
        self.started_at
    }

    /// Run the session to completion.
    ///
    /// The first sample is taken immediately. A fetch still in flight when
    /// the duration elapses is abandoned. Failed fetches are skipped.
    /// `on_progress` fires every `progress_interval` and once more at the
    /// end. A session runs once; running it again is an
    /// [`Error::InvalidConfig`].
    #[tracing::instrument(level = "info", skip_all, fields(
        samples = self.config.target_sample_count,
        duration_ms = self.config.target_duration.as_millis() as u64,
    ))]
    pub async fn run<S, F>(
        &mut self,
        source: &S,
        cancel: &CancellationToken,
        mut on_progress: F,
    ) -> Result<SessionSummary>
    where
        S: TelemetrySource + ?Sized,
        F: FnMut(SessionProgress) + Send,
    {
        if self.status != SessionStatus::Idle {
            return Err(Error::invalid_config("session has already run"));
        }
        self.status = SessionStatus::Running;
        self.started_at = Some(OffsetDateTime::now_utc());

        let target = self.config.target_duration;
        let start = Instant::now();
        let deadline = sleep_until(start + target);
        tokio::pin!(deadline);

        let mut sampler = interval_at(start, self.config.sample_interval());
        sampler.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let progress_every = self.config.progress_interval;
        let mut progress = interval_at(start + progress_every, progress_every);
        progress.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut fallback = self
            .config
            .simulate_on_zero
            .then(|| SimulatedFallback::new(self.config.zero_threshold));

        info!("Session started");
        let stopped_early = loop {
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => Step::Cancelled,
                _ = &mut deadline => Step::Deadline,
                _ = progress.tick() => {
                    on_progress(self.progress(start.elapsed()));
                    Step::Continue
                }
                _ = sampler.tick() => {
                    if self.samples.len() >= self.config.target_sample_count {
                        Step::Continue
                    } else {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => Step::Cancelled,
                            _ = &mut deadline => Step::Deadline,
                            fetched = source.fetch_latest() => {
                                match fetched {
                                    Ok(frame) => {
                                        let frame = match fallback.as_mut() {
                                            Some(fallback) => fallback.apply(frame),
                                            None => frame,
                                        };
                                        self.samples.push(frame);
                                    }
                                    Err(e) => debug!("Sample skipped: {}", e),
                                }
                                Step::Continue
                            }
                        }
                    }
                }
            };
            match step {
                Step::Continue => {}
                Step::Deadline => break false,
                Step::Cancelled => break true,
            }
        };

        self.status = SessionStatus::Complete;
        let elapsed = start.elapsed().min(target);
        let final_progress = if stopped_early {
            self.progress(elapsed)
        } else {
            SessionProgress {
                elapsed: target,
                target,
                fraction: 1.0,
                samples: self.samples.len(),
            }
        };
        on_progress(final_progress);

        let summary = SessionSummary {
            samples: self.samples.len(),
            aggregate: AggregateReading::from_samples(&self.samples),
            elapsed,
            stopped_early,
            includes_simulated: self.samples.iter().any(TelemetryFrame::is_simulated),
        };
        info!(
            "Session complete: {} sample(s){}",
            summary.samples,
            if stopped_early { ", stopped early" } else { "" }
        );
        Ok(summary)
    }

    fn progress(&self, elapsed: Duration) -> SessionProgress {
        let target = self.config.target_duration;
        let elapsed = elapsed.min(target);
        SessionProgress {
            elapsed,
            target,
            fraction: (elapsed.as_secs_f64() / target.as_secs_f64()).clamp(0.0, 1.0),
            samples: self.samples.len(),
        }
    }
}
