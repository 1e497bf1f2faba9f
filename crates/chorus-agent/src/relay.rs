//! Adaptive batching of streamed text before it reaches the observer.
//!
//! The relay flushes on the first chunk, on paragraph breaks, on code
//! statement boundaries, and when the buffer grows past a fixed size. Between
//! those, an interval trigger flushes small buffers at a bounded rate. When the
//! emit rate over the rolling window gets high the interval trigger is relaxed
//! (larger buffers, shorter interval) until the rate falls again.

use core::mem;
use core::time::Duration;
use std::collections::VecDeque;
use std::sync::LazyLock;

use chorus_core::RelayConfig;
use regex::Regex;
use tokio::time::Instant;
use tracing::debug;

/// Decides whether a buffer ends at a point where code can be shown safely.
pub type CodeBoundaryPredicate = fn(&str) -> bool;

/// A statement or declaration followed by a terminator or line break.
static CODE_BOUNDARY: LazyLock<Regex> = LazyLock::new(|| {
    match Regex::new(
        r"(?m)(?:^|[\s;{}(])(?:let|const|var|fn|def|class|import|from|return|use|pub|struct|impl|function)\b[^\n;{]*(?:;|\{|\n)|\b[A-Za-z_][A-Za-z0-9_.]*\s*[-+*/]?=\s*[^=\s][^\n;]*(?:;|\n)",
    ) {
        Ok(regex) => regex,
        Err(err) => panic!("Code boundary regex is invalid: {err}"),
    }
});

/// Default code-boundary heuristic.
pub fn looks_like_code_boundary(buffer: &str) -> bool {
    CODE_BOUNDARY.is_match(buffer)
}

/// Display-ready text released by the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayChunk {
    /// Text to append
    pub text: String,
    /// Whether this is the first text released for the call
    pub is_first: bool,
}

/// Per-call streaming state. Arrival timing for the inactivity check lives in
/// the watchdog loop driving the same call.
#[derive(Debug, Clone)]
pub struct StreamState {
    /// Text received but not yet released
    buffer: String,
    /// Whether anything has been released yet
    emitted_first_chunk: bool,
}

/// Buffers one call's stream and releases display-ready chunks.
#[derive(Debug, Clone)]
pub struct StreamingRelay {
    config: RelayConfig,
    is_code_boundary: CodeBoundaryPredicate,
    state: StreamState,
    last_flush: Option<Instant>,
    recent_emits: VecDeque<Instant>,
    high_speed: bool,
    received: String,
}

impl StreamingRelay {
    /// Creates a relay using [`looks_like_code_boundary`].
    #[must_use]
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            is_code_boundary: looks_like_code_boundary,
            state: StreamState {
                buffer: String::new(),
                emitted_first_chunk: false,
            },
            last_flush: None,
            recent_emits: VecDeque::new(),
            high_speed: false,
            received: String::new(),
        }
    }

    /// Replaces the code-boundary heuristic.
    #[must_use]
    pub fn with_code_boundary(mut self, predicate: CodeBoundaryPredicate) -> Self {
        self.is_code_boundary = predicate;
        self
    }

    /// Accepts a chunk arriving now.
    pub fn push(&mut self, chunk: &str) -> Option<RelayChunk> {
        self.push_at(chunk, Instant::now())
    }

    /// Accepts a chunk arriving at `now`.
    pub fn push_at(&mut self, chunk: &str, now: Instant) -> Option<RelayChunk> {
        self.received.push_str(chunk);
        self.state.buffer.push_str(chunk);

        if self.state.buffer.is_empty() || !self.should_flush(now) {
            return None;
        }
        Some(self.flush_at(now))
    }

    /// Releases whatever is still buffered.
    pub fn finish(&mut self) -> Option<RelayChunk> {
        self.finish_at(Instant::now())
    }

    /// Releases whatever is still buffered, at `now`.
    pub fn finish_at(&mut self, now: Instant) -> Option<RelayChunk> {
        if self.state.buffer.is_empty() {
            return None;
        }
        Some(self.flush_at(now))
    }

    /// Everything received so far, released or not.
    #[must_use]
    pub fn received(&self) -> &str {
        &self.received
    }

    /// Text waiting to be released.
    #[must_use]
    pub fn buffered(&self) -> &str {
        &self.state.buffer
    }

    /// Whether the relaxed interval trigger is active.
    #[must_use]
    pub const fn is_high_speed(&self) -> bool {
        self.high_speed
    }

    /// Emits per second over the rolling window ending at `now`.
    #[must_use]
    pub fn emit_rate(&self, now: Instant) -> f64 {
        let window = self.rate_window();
        let count = self
            .recent_emits
            .iter()
            .filter(|emitted| now.duration_since(**emitted) <= window)
            .count();
        count as f64 / window.as_secs_f64()
    }

    fn rate_window(&self) -> Duration {
        Duration::from_secs(self.config.rate_window_secs.max(1))
    }

    fn should_flush(&self, now: Instant) -> bool {
        let buffer = &self.state.buffer;
        if !self.state.emitted_first_chunk
            || buffer.contains("\n\n")
            || (self.is_code_boundary)(buffer)
        {
            return true;
        }

        let length = buffer.chars().count();
        if length > self.config.max_buffer_chars {
            return true;
        }

        let (size_trigger, interval_ms) = if self.high_speed {
            (
                self.config.high_speed_size_trigger_chars,
                self.config.high_speed_min_flush_interval_ms,
            )
        } else {
            (
                self.config.size_trigger_chars,
                self.config.min_flush_interval_ms,
            )
        };
        let interval = Duration::from_millis(interval_ms);
        length >= size_trigger
            && self
                .last_flush
                .is_none_or(|last| now.duration_since(last) >= interval)
    }

    fn flush_at(&mut self, now: Instant) -> RelayChunk {
        let text = mem::take(&mut self.state.buffer);
        let is_first = !self.state.emitted_first_chunk;
        self.state.emitted_first_chunk = true;
        self.last_flush = Some(now);
        self.record_emit(now);
        RelayChunk { text, is_first }
    }

    fn record_emit(&mut self, now: Instant) {
        let window = self.rate_window();
        self.recent_emits.push_back(now);
        while self
            .recent_emits
            .front()
            .is_some_and(|oldest| now.duration_since(*oldest) > window)
        {
            self.recent_emits.pop_front();
        }

        let rate = self.emit_rate(now);
        if !self.high_speed && rate > self.config.high_speed_enter_rate {
            self.high_speed = true;
            debug!(rate, "Relay entering high-speed mode");
        } else if self.high_speed && rate < self.config.high_speed_exit_rate {
            self.high_speed = false;
            debug!(rate, "Relay leaving high-speed mode");
        }
    }
}
