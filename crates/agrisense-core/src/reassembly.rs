//! Reassembly of chunked BLE notifications into telemetry frames.
//!
//! Notifications arrive in MTU-bounded chunks that split frames at arbitrary
//! byte offsets. [`FrameReassembler`] accumulates chunks in a bounded
//! [`FrameBuffer`], cuts complete segments according to its
//! [`FramingStrategy`] and parses each segment independently. Only complete,
//! successfully parsed frames ever leave this module.
//!
//! ```
//! use agrisense_core::reassembly::FrameReassembler;
//!
//! let mut reassembler = FrameReassembler::new();
//! assert!(reassembler.push(br#"{"pH":6.5,"s"#).is_empty());
//! let frames = reassembler.push(b"oil_moisture_pct\":40}\n{\"pH\":6.6}\n");
//! assert_eq!(frames.len(), 2);
//! assert_eq!(reassembler.buffered(), 0);
//! ```

use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use agrisense_types::TelemetryFrame;

use crate::error::{Error, Result};

/// Default hard cap on buffered, undelimited bytes.
pub const DEFAULT_BUFFER_CAP: usize = 1000;

/// How complete frames are cut out of the byte stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FramingStrategy {
    /// One JSON object per `\n`-terminated line.
    #[default]
    NewlineDelimited,
    /// Balanced `{ ... }` objects, for firmware that omits newlines.
    BraceBalanced,
}

/// Options for [`FrameReassembler`].
#[derive(Debug, Clone)]
pub struct ReassemblerConfig {
    /// Framing rule.
    pub framing: FramingStrategy,
    /// Maximum bytes retained without a frame boundary.
    pub buffer_cap: usize,
}

impl Default for ReassemblerConfig {
    fn default() -> Self {
        Self {
            framing: FramingStrategy::default(),
            buffer_cap: DEFAULT_BUFFER_CAP,
        }
    }
}

impl ReassemblerConfig {
    /// Set the framing rule.
    #[must_use]
    pub fn framing(mut self, framing: FramingStrategy) -> Self {
        self.framing = framing;
        self
    }

    /// Set the buffer cap.
    #[must_use]
    pub fn buffer_cap(mut self, cap: usize) -> Self {
        self.buffer_cap = cap;
        self
    }

    /// Validate the options.
    pub fn validate(&self) -> Result<()> {
        if self.buffer_cap == 0 {
            return Err(Error::invalid_config("buffer_cap must be > 0"));
        }
        Ok(())
    }
}

/// Bounded accumulator of bytes awaiting a frame boundary.
#[derive(Debug)]
pub struct FrameBuffer {
    bytes: BytesMut,
    cap: usize,
}

impl FrameBuffer {
    /// Empty buffer with a hard cap.
    pub fn new(cap: usize) -> Self {
        Self {
            bytes: BytesMut::with_capacity(cap.min(4096)),
            cap,
        }
    }

    /// Bytes currently buffered.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The hard cap.
    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Whether the buffered content has grown past the cap.
    pub fn is_over_cap(&self) -> bool {
        self.bytes.len() > self.cap
    }

    fn extend(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
    }

    fn clear(&mut self) {
        self.bytes.clear();
    }
}

/// Counters kept by a reassembler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReassemblyStats {
    /// Chunks pushed.
    pub chunks: u64,
    /// Frames emitted.
    pub frames: u64,
    /// Segments dropped because they did not parse.
    pub parse_errors: u64,
    /// Times the buffer was cleared for exceeding its cap.
    pub overflows: u64,
}

/// Callback invoked for every emitted frame.
pub type FrameCallback = Box<dyn FnMut(&TelemetryFrame) + Send>;

/// One-shot signal fulfilled by the first frame a reassembler emits.
///
/// Dropping it (for example after [`FirstFrame::wait`] times out) detaches
/// it from the reassembler.
#[derive(Debug)]
pub struct FirstFrame {
    rx: oneshot::Receiver<TelemetryFrame>,
}

impl FirstFrame {
    /// Wait for the first frame, or fail with [`Error::Timeout`].
    ///
    /// Returns [`Error::Cancelled`] if the reassembler is dropped before
    /// emitting anything.
    pub async fn wait(self, timeout: Duration) -> Result<TelemetryFrame> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(Error::Cancelled),
            Err(_) => Err(Error::timeout("wait for first frame", timeout)),
        }
    }
}

#[derive(Debug, Default)]
struct BraceScan {
    depth: usize,
    in_string: bool,
    escaped: bool,
    scanned: usize,
}

/// Turns a sequence of byte chunks into parsed telemetry frames.
pub struct FrameReassembler {
    config: ReassemblerConfig,
    buffer: FrameBuffer,
    brace: BraceScan,
    stats: ReassemblyStats,
    on_frame: Option<FrameCallback>,
    first_frame: Option<oneshot::Sender<TelemetryFrame>>,
}

impl std::fmt::Debug for FrameReassembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameReassembler")
            .field("config", &self.config)
            .field("buffered", &self.buffer.len())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl Default for FrameReassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameReassembler {
    /// Newline framing with the default cap.
    pub fn new() -> Self {
        Self::with_config(ReassemblerConfig::default())
    }

    /// Reassembler with custom options.
    pub fn with_config(config: ReassemblerConfig) -> Self {
        Self {
            buffer: FrameBuffer::new(config.buffer_cap),
            config,
            brace: BraceScan::default(),
            stats: ReassemblyStats::default(),
            on_frame: None,
            first_frame: None,
        }
    }

    /// Install the per-frame callback.
    #[must_use]
    pub fn on_frame<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&TelemetryFrame) + Send + 'static,
    {
        self.on_frame = Some(Box::new(callback));
        self
    }

    /// Signal fulfilled by the next emitted frame.
    ///
    /// Calling this again replaces the previous signal, whose
    /// [`FirstFrame::wait`] then resolves with [`Error::Cancelled`].
    pub fn first_frame(&mut self) -> FirstFrame {
        let (tx, rx) = oneshot::channel();
        self.first_frame = Some(tx);
        FirstFrame { rx }
    }

    /// Feed one notification payload; returns the frames it completed, in
    /// stream order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<TelemetryFrame> {
        self.stats.chunks += 1;
        self.buffer.extend(chunk);

        let mut frames = Vec::new();
        match self.config.framing {
            FramingStrategy::NewlineDelimited => self.drain_lines(&mut frames),
            FramingStrategy::BraceBalanced => self.drain_braces(&mut frames),
        }

        if self.buffer.is_over_cap() {
            warn!(
                "Frame buffer exceeded {} bytes without a frame boundary, discarding {} bytes",
                self.buffer.cap(),
                self.buffer.len()
            );
            self.buffer.clear();
            self.brace = BraceScan::default();
            self.stats.overflows += 1;
        }

        frames
    }

    /// Bytes buffered awaiting a boundary.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Counters so far.
    pub fn stats(&self) -> ReassemblyStats {
        self.stats
    }

    /// Framing rule in use.
    pub fn framing(&self) -> FramingStrategy {
        self.config.framing
    }

    /// Drop any buffered partial frame.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.brace = BraceScan::default();
    }

    fn drain_lines(&mut self, frames: &mut Vec<TelemetryFrame>) {
        while let Some(pos) = self.buffer.bytes.iter().position(|b| *b == b'\n') {
            let line = self.buffer.bytes.split_to(pos + 1);
            self.handle_segment(&line[..pos], frames);
        }
    }

    fn drain_braces(&mut self, frames: &mut Vec<TelemetryFrame>) {
        let mut i = self.brace.scanned;
        while i < self.buffer.bytes.len() {
            let byte = self.buffer.bytes[i];
            let scan = &mut self.brace;

            if scan.depth == 0 {
                if byte == b'{' {
                    // Bytes between objects are not part of any frame.
                    if i > 0 {
                        self.buffer.bytes.advance(i);
                        i = 0;
                    }
                    scan.depth = 1;
                }
                i += 1;
                continue;
            }

            if scan.in_string {
                if scan.escaped {
                    scan.escaped = false;
                } else if byte == b'\\' {
                    scan.escaped = true;
                } else if byte == b'"' {
                    scan.in_string = false;
                }
            } else {
                match byte {
                    b'"' => scan.in_string = true,
                    b'{' => scan.depth += 1,
                    b'}' => {
                        scan.depth -= 1;
                        if scan.depth == 0 {
                            let object = self.buffer.bytes.split_to(i + 1);
                            self.handle_segment(&object, frames);
                            i = 0;
                            continue;
                        }
                    }
                    _ => {}
                }
            }
            i += 1;
        }

        if self.brace.depth == 0 {
            self.buffer.clear();
            i = 0;
        }
        self.brace.scanned = i;
    }

    fn handle_segment(&mut self, segment: &[u8], frames: &mut Vec<TelemetryFrame>) {
        let segment = segment.trim_ascii();
        if segment.is_empty() {
            return;
        }

        match TelemetryFrame::from_json_bytes(segment) {
            Ok(frame) => {
                debug!("Reassembled frame with {} fields", frame.len());
                self.stats.frames += 1;
                if let Some(callback) = self.on_frame.as_mut() {
                    callback(&frame);
                }
                if let Some(tx) = self.first_frame.take() {
                    let _ = tx.send(frame.clone());
                }
                frames.push(frame);
            }
            Err(e) => {
                self.stats.parse_errors += 1;
                warn!("Dropping malformed frame ({} bytes): {}", segment.len(), e);
            }
        }
    }
}
