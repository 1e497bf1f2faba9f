//! Deadline and retry supervision for a single provider call.
//!
//! Every attempt streams on its own task and forwards chunks over a channel.
//! The supervising loop polls on a fixed interval and abandons the attempt when
//! no chunk arrived within the inactivity timeout or the overall deadline has
//! passed. Abandoned attempts are aborted, which drops the underlying stream.
//!
//! Transient failures are retried with exponential backoff, but only while the
//! call has produced nothing: once a chunk reached the caller the stream is
//! committed and a later failure is final.

use core::fmt::{self, Display, Formatter};
use core::time::Duration;
use std::sync::Arc;

use chorus_core::{ChorusConfig, CompletionRequest, LlmProvider, ProviderError, WatchdogConfig};
use futures::StreamExt as _;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, interval, sleep_until};
use tokio::{select, spawn};
use tracing::{debug, warn};

use crate::cancel::CancellationFlag;

/// Text recorded for a call abandoned by a timeout.
pub const TIMEOUT_PLACEHOLDER: &str = "[timed out]";

/// Buffered chunks between a worker and its supervisor.
const WORKER_CHANNEL_CAPACITY: usize = 64;

/// Largest backoff exponent; keeps `2^attempt` well inside `u32`.
const MAX_BACKOFF_EXPONENT: u32 = 16;

/// Longest overall deadline honoured; larger configured values are clamped.
const LONGEST_DEADLINE: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// Which deadline abandoned a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// No chunk within the inactivity timeout
    Inactivity,
    /// The overall deadline since dispatch passed
    Overall,
}

impl Display for TimeoutKind {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inactivity => write!(formatter, "inactivity timeout"),
            Self::Overall => write!(formatter, "overall timeout"),
        }
    }
}

/// How a supervised call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallStatus {
    /// The stream finished normally
    Completed,
    /// The provider failed and no retry was possible
    Failed(ProviderError),
    /// A deadline fired
    TimedOut(TimeoutKind),
    /// Cancellation was observed and in-flight aborts are enabled
    Cancelled,
}

/// Result of [`RetryWatchdog::call`].
#[derive(Debug, Clone)]
pub struct CallOutcome {
    /// Text received, including partial text from an abandoned stream
    pub text: String,
    /// How the call ended
    pub status: CallStatus,
    /// Attempts dispatched
    pub attempts: u32,
    /// Chunks received
    pub chunks: usize,
    /// Time since the first dispatch
    pub elapsed: Duration,
}

impl CallOutcome {
    /// Text to record for a timed-out call: any partial text followed by
    /// [`TIMEOUT_PLACEHOLDER`].
    #[must_use]
    pub fn timed_out_text(&self) -> String {
        let partial = self.text.trim_end();
        if partial.is_empty() {
            TIMEOUT_PLACEHOLDER.to_owned()
        } else {
            format!("{partial}\n{TIMEOUT_PLACEHOLDER}")
        }
    }
}

/// Timeouts and retry policy for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogSettings {
    /// Longest gap allowed between chunks
    pub inactivity_timeout: Duration,
    /// Longest time allowed since the first dispatch
    pub overall_timeout: Duration,
    /// How often deadlines and cancellation are checked
    pub poll_interval: Duration,
    /// Retries for transient failures before the first chunk
    pub max_retries: u32,
    /// Backoff base; retry `n` waits `base * 2^n` unless the provider suggests a delay
    pub base_delay: Duration,
    /// Whether an observed cancellation abandons the in-flight call
    pub abort_on_cancel: bool,
}

impl WatchdogSettings {
    /// Settings taken from the watchdog and execution sections of `config`.
    #[must_use]
    pub fn from_config(config: &ChorusConfig) -> Self {
        Self {
            abort_on_cancel: config.execution.abort_in_flight_on_cancel,
            ..Self::from(&config.watchdog)
        }
    }

    /// Delay before retry number `attempt` (zero-based) when the provider
    /// suggested nothing.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.min(MAX_BACKOFF_EXPONENT));
        self.base_delay.saturating_mul(factor)
    }
}

impl From<&WatchdogConfig> for WatchdogSettings {
    fn from(config: &WatchdogConfig) -> Self {
        Self {
            inactivity_timeout: config.inactivity_timeout(),
            overall_timeout: config.overall_timeout(),
            poll_interval: config.poll_interval().max(Duration::from_millis(1)),
            max_retries: config.max_retries,
            base_delay: config.base_delay(),
            abort_on_cancel: false,
        }
    }
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self::from(&WatchdogConfig::default())
    }
}

/// Message from an attempt's worker task.
enum WorkerEvent {
    Chunk(String),
    Failed(ProviderError),
    Finished,
}

/// How one attempt ended.
enum AttemptEnd {
    Completed,
    Failed(ProviderError),
    TimedOut(TimeoutKind),
    Cancelled,
}

/// Text and chunk count accumulated across attempts.
#[derive(Default)]
struct Progress {
    text: String,
    chunks: usize,
}

/// Supervises provider calls with timeouts, retries, and cancellation.
#[derive(Debug, Clone)]
pub struct RetryWatchdog {
    settings: WatchdogSettings,
    cancel: CancellationFlag,
}

impl RetryWatchdog {
    /// Creates a watchdog observing `cancel`.
    #[must_use]
    pub const fn new(settings: WatchdogSettings, cancel: CancellationFlag) -> Self {
        Self { settings, cancel }
    }

    /// Active settings.
    #[must_use]
    pub const fn settings(&self) -> &WatchdogSettings {
        &self.settings
    }

    /// Runs `request` against `provider`, passing every received chunk to
    /// `on_chunk` as it arrives.
    pub async fn call<F>(
        &self,
        provider: &Arc<dyn LlmProvider>,
        request: &CompletionRequest,
        mut on_chunk: F,
    ) -> CallOutcome
    where
        F: FnMut(&str) + Send,
    {
        let dispatched = Instant::now();
        let deadline = dispatched + self.settings.overall_timeout.min(LONGEST_DEADLINE);
        let mut progress = Progress::default();
        let mut attempt: u32 = 0;

        let status = loop {
            let end = self
                .attempt(
                    Arc::clone(provider),
                    request.clone(),
                    deadline,
                    &mut progress,
                    &mut on_chunk,
                )
                .await;

            match end {
                AttemptEnd::Completed => break CallStatus::Completed,
                AttemptEnd::TimedOut(kind) => break CallStatus::TimedOut(kind),
                AttemptEnd::Cancelled => break CallStatus::Cancelled,
                AttemptEnd::Failed(error) => {
                    if !self.should_retry(&error, attempt, progress.chunks) {
                        break CallStatus::Failed(error);
                    }
                    let delay = error
                        .suggested_delay()
                        .unwrap_or_else(|| self.settings.backoff(attempt));
                    let Some(wake) = Instant::now()
                        .checked_add(delay)
                        .filter(|wake| *wake <= deadline)
                    else {
                        debug!(model = %request.model, "Retry would pass the overall deadline");
                        break CallStatus::Failed(error);
                    };
                    warn!(
                        model = %request.model,
                        attempt = attempt + 1,
                        max_retries = self.settings.max_retries,
                        delay_ms = delay.as_millis(),
                        "Transient provider error, retrying: {error}"
                    );
                    if !self.pause_until(wake).await {
                        break CallStatus::Cancelled;
                    }
                    attempt += 1;
                }
            }
        };

        CallOutcome {
            text: progress.text,
            status,
            attempts: attempt + 1,
            chunks: progress.chunks,
            elapsed: dispatched.elapsed(),
        }
    }

    fn should_retry(&self, error: &ProviderError, attempt: u32, chunks: usize) -> bool {
        error.is_transient() && chunks == 0 && attempt < self.settings.max_retries
    }

    fn cancel_observed(&self) -> bool {
        self.settings.abort_on_cancel && self.cancel.is_cancelled()
    }

    /// Sleeps until `wake`, checking for cancellation every poll interval.
    /// Returns `false` if the wait was cut short by cancellation.
    async fn pause_until(&self, wake: Instant) -> bool {
        loop {
            if self.cancel_observed() {
                return false;
            }
            let now = Instant::now();
            if now >= wake {
                return true;
            }
            let tick = now
                .checked_add(self.settings.poll_interval)
                .map_or(wake, |tick| tick.min(wake));
            sleep_until(tick).await;
        }
    }

    async fn attempt<F>(
        &self,
        provider: Arc<dyn LlmProvider>,
        request: CompletionRequest,
        deadline: Instant,
        progress: &mut Progress,
        on_chunk: &mut F,
    ) -> AttemptEnd
    where
        F: FnMut(&str) + Send,
    {
        let model = request.model.clone();
        let (sender, mut receiver) = mpsc::channel(WORKER_CHANNEL_CAPACITY);
        let worker =
            spawn(async move { stream_worker(provider.as_ref(), &request, &sender).await });

        let mut ticker = interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_activity = Instant::now();

        let end = loop {
            select! {
                biased;

                event = receiver.recv() => match event {
                    Some(WorkerEvent::Chunk(text)) => {
                        last_activity = Instant::now();
                        progress.chunks += 1;
                        progress.text.push_str(&text);
                        on_chunk(&text);
                    }
                    Some(WorkerEvent::Failed(error)) => break AttemptEnd::Failed(error),
                    Some(WorkerEvent::Finished) => break AttemptEnd::Completed,
                    None => {
                        break AttemptEnd::Failed(ProviderError::Stream(
                            "provider stream ended without finishing".to_owned(),
                        ));
                    }
                },
                _ = ticker.tick() => {
                    if self.cancel_observed() {
                        debug!(%model, "Cancellation observed, abandoning call");
                        break AttemptEnd::Cancelled;
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        warn!(%model, "Provider call passed the overall deadline");
                        break AttemptEnd::TimedOut(TimeoutKind::Overall);
                    }
                    if now.duration_since(last_activity) >= self.settings.inactivity_timeout {
                        warn!(%model, "Provider call went quiet, abandoning");
                        break AttemptEnd::TimedOut(TimeoutKind::Inactivity);
                    }
                }
            }
        };

        worker.abort();
        end
    }
}

/// Drives one provider stream and forwards it to the supervisor.
async fn stream_worker(
    provider: &dyn LlmProvider,
    request: &CompletionRequest,
    sender: &mpsc::Sender<WorkerEvent>,
) {
    let mut stream = match provider.complete(request).await {
        Ok(stream) => stream,
        Err(error) => {
            deliver(sender, WorkerEvent::Failed(error)).await;
            return;
        }
    };

    while let Some(item) = stream.next().await {
        match item {
            Ok(text) => {
                if !deliver(sender, WorkerEvent::Chunk(text)).await {
                    return;
                }
            }
            Err(error) => {
                deliver(sender, WorkerEvent::Failed(error)).await;
                return;
            }
        }
    }
    deliver(sender, WorkerEvent::Finished).await;
}

/// Sends `event`; returns `false` once the supervisor has gone away.
async fn deliver(sender: &mpsc::Sender<WorkerEvent>, event: WorkerEvent) -> bool {
    if sender.send(event).await.is_err() {
        debug!("Watchdog dropped the stream; stopping worker");
        return false;
    }
    true
}
