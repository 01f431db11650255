//! Token coalescing.
//!
//! Tokens arrive one fragment at a time, often a word or less. Forwarding
//! each one to the caller would flood it with updates, so tokens are grouped
//! and handed to a sink in chunks. The concatenation of all chunks always
//! equals the concatenation of all tokens, in order.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::Config;

/// Receives coalesced chunks, in flush order.
pub type ContentSink = Box<dyn FnMut(String) + Send>;

/// A token buffer that flushes coalesced content to a sink.
///
/// The time trigger, if any, is passive: the owner asks for
/// [`flush_deadline`](Streamer::flush_deadline) and calls
/// [`flush_if_due`](Streamer::flush_if_due) when it passes. This keeps the
/// buffer single-owner and lock-free while still firing on idle streams.
pub trait Streamer: Send {
    fn set_sink(&mut self, sink: ContentSink);

    /// Arm the time trigger. The idle clock starts now.
    fn start(&mut self);

    fn add_token(&mut self, token: String);

    /// When the time trigger next fires, or `None` if nothing is pending or
    /// there is no time trigger.
    fn flush_deadline(&self) -> Option<Instant>;

    /// Flush pending content if the time trigger is due at `now`.
    fn flush_if_due(&mut self, now: Instant);

    /// Flush whatever is pending. Effective once; later calls do nothing and
    /// later tokens are ignored.
    fn stop(&mut self);

    /// Number of tokens waiting for a flush.
    fn pending(&self) -> usize;
}

/// Which [`Streamer`] implementation to use, chosen once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamerKind {
    /// Size trigger plus idle-time trigger.
    Adaptive,
    /// Size trigger only.
    Batch,
}

impl StreamerKind {
    /// A zero flush interval means the time trigger is unavailable.
    pub fn detect(flush_interval: Duration) -> Self {
        if flush_interval.is_zero() {
            Self::Batch
        } else {
            Self::Adaptive
        }
    }
}

/// Everything needed to build a fresh buffer for each task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSettings {
    pub buffer_size: usize,
    pub flush_interval: Duration,
    pub kind: StreamerKind,
}

impl BufferSettings {
    pub fn new(buffer_size: usize, flush_interval: Duration) -> Self {
        let kind = StreamerKind::detect(flush_interval);
        tracing::debug!(?kind, buffer_size, "selected token streamer");
        Self {
            buffer_size: buffer_size.max(1),
            flush_interval,
            kind,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.buffer_size, config.flush_interval())
    }

    pub fn build(&self) -> Box<dyn Streamer> {
        match self.kind {
            StreamerKind::Adaptive => {
                Box::new(AdaptiveBuffer::new(self.buffer_size, self.flush_interval))
            }
            StreamerKind::Batch => Box::new(BatchBuffer::new(self.buffer_size)),
        }
    }
}

/// Pending tokens plus the size trigger, shared by both implementations.
struct Coalescer {
    pending: Vec<String>,
    buffer_size: usize,
    sink: Option<ContentSink>,
    stopped: bool,
}

impl Coalescer {
    fn new(buffer_size: usize) -> Self {
        Self {
            pending: Vec::with_capacity(buffer_size),
            buffer_size: buffer_size.max(1),
            sink: None,
            stopped: false,
        }
    }

    /// Returns true if the size trigger flushed.
    fn push(&mut self, token: String) -> bool {
        if self.stopped {
            tracing::trace!("token after stop ignored");
            return false;
        }
        self.pending.push(token);
        self.pending.len() >= self.buffer_size && self.flush()
    }

    /// Returns true if anything was handed to the sink. Without a sink,
    /// pending tokens are kept.
    fn flush(&mut self) -> bool {
        if self.pending.is_empty() {
            return false;
        }
        let Some(sink) = self.sink.as_mut() else {
            return false;
        };
        let chunk = self.pending.concat();
        self.pending.clear();
        sink(chunk);
        true
    }

    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.flush();
        self.stopped = true;
    }
}

/// Flushes when `buffer_size` tokens are pending, or when tokens have been
/// pending with no flush for `flush_interval`.
pub struct AdaptiveBuffer {
    inner: Coalescer,
    flush_interval: Duration,
    last_flush: Instant,
    started: bool,
}

impl AdaptiveBuffer {
    pub fn new(buffer_size: usize, flush_interval: Duration) -> Self {
        Self {
            inner: Coalescer::new(buffer_size),
            flush_interval,
            last_flush: Instant::now(),
            started: false,
        }
    }
}

impl Streamer for AdaptiveBuffer {
    fn set_sink(&mut self, sink: ContentSink) {
        self.inner.sink = Some(sink);
    }

    fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        self.last_flush = Instant::now();
    }

    fn add_token(&mut self, token: String) {
        if self.inner.push(token) {
            self.last_flush = Instant::now();
        }
    }

    fn flush_deadline(&self) -> Option<Instant> {
        if !self.started || self.inner.stopped || self.inner.pending.is_empty() {
            return None;
        }
        Some(self.last_flush + self.flush_interval)
    }

    fn flush_if_due(&mut self, now: Instant) {
        let Some(deadline) = self.flush_deadline() else {
            return;
        };
        if now >= deadline && self.inner.flush() {
            self.last_flush = now;
        }
    }

    fn stop(&mut self) {
        self.inner.stop();
    }

    fn pending(&self) -> usize {
        self.inner.pending.len()
    }
}

/// Size trigger only. Pending tokens wait for the next full batch or `stop`.
pub struct BatchBuffer {
    inner: Coalescer,
}

impl BatchBuffer {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            inner: Coalescer::new(buffer_size),
        }
    }
}

impl Streamer for BatchBuffer {
    fn set_sink(&mut self, sink: ContentSink) {
        self.inner.sink = Some(sink);
    }

    fn start(&mut self) {}

    fn add_token(&mut self, token: String) {
        self.inner.push(token);
    }

    fn flush_deadline(&self) -> Option<Instant> {
        None
    }

    fn flush_if_due(&mut self, _now: Instant) {}

    fn stop(&mut self) {
        self.inner.stop();
    }

    fn pending(&self) -> usize {
        self.inner.pending.len()
    }
}
