//! Mock provider for testing pipeline behaviour.
//!
//! Replies are scripted per model (or globally) and can stream chunks with
//! delays, fail mid-stream, reject the call outright, or stall forever. Every
//! call is recorded with start and end instants so tests can check ordering
//! and overlap.

use core::result::Result as CoreResult;
use core::time::Duration;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chorus_core::{
    CompletionRequest, CompletionStream, IgnoreLock as _, LlmProvider, ProviderError, ProviderKind,
};
use futures::future;
use futures::stream;
use tokio::time::{Instant, sleep};

/// One step of a scripted stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockStep {
    /// Wait `delay`, then yield `text`
    Chunk {
        /// Text to yield
        text: String,
        /// Delay before yielding
        delay: Duration,
    },
    /// Yield an error item
    Fail(ProviderError),
    /// Never yield again
    Stall,
}

/// Scripted reply for one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockReply {
    /// Accept the call and play these steps
    Stream(Vec<MockStep>),
    /// Fail the call before any chunk
    Reject(ProviderError),
}

impl MockReply {
    /// Single chunk, no delay.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Stream(vec![MockStep::Chunk {
            text: text.into(),
            delay: Duration::ZERO,
        }])
    }

    /// Several chunks, each preceded by `delay`.
    pub fn chunks<I, S>(chunks: I, delay: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Stream(
            chunks
                .into_iter()
                .map(|text| MockStep::Chunk {
                    text: text.into(),
                    delay,
                })
                .collect(),
        )
    }

    /// Word-by-word stream of `text`, each word preceded by `delay`.
    pub fn words(text: &str, delay: Duration) -> Self {
        let mut pieces: Vec<String> = Vec::new();
        for (index, word) in text.split(' ').enumerate() {
            if index == 0 {
                pieces.push(word.to_owned());
            } else {
                pieces.push(format!(" {word}"));
            }
        }
        Self::chunks(pieces, delay)
    }

    /// One chunk after `delay`, then silence.
    pub fn stall_after(first: impl Into<String>, delay: Duration) -> Self {
        Self::Stream(vec![
            MockStep::Chunk {
                text: first.into(),
                delay,
            },
            MockStep::Stall,
        ])
    }

    /// Call rejected with `error`.
    #[must_use]
    pub const fn reject(error: ProviderError) -> Self {
        Self::Reject(error)
    }

    /// Steps played after `delay` of silence.
    #[must_use]
    pub fn delayed(self, delay: Duration) -> Self {
        match self {
            Self::Stream(mut steps) => {
                if let Some(MockStep::Chunk { delay: first, .. }) = steps.first_mut() {
                    *first += delay;
                }
                Self::Stream(steps)
            }
            Self::Reject(error) => Self::Reject(error),
        }
    }
}

/// One recorded call.
#[derive(Debug, Clone, PartialEq)]
pub struct MockCall {
    /// Model requested
    pub model: String,
    /// Prompt sent
    pub prompt: String,
    /// Output allowance sent
    pub max_tokens: usize,
    /// When the call was made
    pub started_at: Instant,
    /// When the stream ended or the call was rejected
    pub finished_at: Option<Instant>,
}

/// Scripts keyed by model; the empty key holds replies for any model.
type ScriptMap = Arc<Mutex<HashMap<String, VecDeque<MockReply>>>>;

/// Provider that plays scripted replies.
#[derive(Clone)]
pub struct MockProvider {
    /// Kind reported to the registry
    kind: ProviderKind,
    /// Queued replies
    scripts: ScriptMap,
    /// Replies chosen by prompt substring when no script is queued
    patterns: Arc<Mutex<Vec<(String, MockReply)>>>,
    /// Reply text when nothing else matches
    default_response: Arc<Mutex<Option<String>>>,
    /// Call history for verification
    calls: Arc<Mutex<Vec<MockCall>>>,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    /// Creates a provider registered as [`ProviderKind::Mock`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_kind(ProviderKind::Mock)
    }

    /// Creates a provider that stands in for another vendor.
    #[must_use]
    pub fn with_kind(kind: ProviderKind) -> Self {
        Self {
            kind,
            scripts: Arc::new(Mutex::new(HashMap::new())),
            patterns: Arc::new(Mutex::new(Vec::new())),
            default_response: Arc::new(Mutex::new(None)),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Queues a reply for the next call to `model`.
    #[must_use]
    pub fn with_reply(self, model: impl Into<String>, reply: MockReply) -> Self {
        self.push_reply(model, reply);
        self
    }

    /// Queues a reply for the next call to any model without its own script.
    #[must_use]
    pub fn with_any_reply(self, reply: MockReply) -> Self {
        self.push_reply(String::new(), reply);
        self
    }

    /// Replies with `reply` whenever the prompt contains `pattern`.
    #[must_use]
    pub fn with_pattern(self, pattern: impl Into<String>, reply: MockReply) -> Self {
        self.patterns
            .lock_ignore_poison()
            .push((pattern.into(), reply));
        self
    }

    /// Sets the text used when nothing else matches.
    #[must_use]
    pub fn with_default_response(self, response: impl Into<String>) -> Self {
        *self.default_response.lock_ignore_poison() = Some(response.into());
        self
    }

    /// Queues a reply after construction.
    pub fn push_reply(&self, model: impl Into<String>, reply: MockReply) {
        self.scripts
            .lock_ignore_poison()
            .entry(model.into())
            .or_default()
            .push_back(reply);
    }

    /// Every call made so far.
    #[must_use]
    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock_ignore_poison().clone()
    }

    /// Calls made to one model.
    #[must_use]
    pub fn calls_for(&self, model: &str) -> Vec<MockCall> {
        self.calls
            .lock_ignore_poison()
            .iter()
            .filter(|call| call.model == model)
            .cloned()
            .collect()
    }

    /// Number of calls made.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock_ignore_poison().len()
    }

    fn next_reply(&self, request: &CompletionRequest) -> MockReply {
        {
            let mut scripts = self.scripts.lock_ignore_poison();
            for key in [request.model.as_str(), ""] {
                if let Some(reply) = scripts.get_mut(key).and_then(VecDeque::pop_front) {
                    return reply;
                }
            }
        }

        if let Some((_, reply)) = self
            .patterns
            .lock_ignore_poison()
            .iter()
            .find(|(pattern, _)| request.prompt.contains(pattern.as_str()))
        {
            return reply.clone();
        }

        let text = self
            .default_response
            .lock_ignore_poison()
            .clone()
            .unwrap_or_else(|| format!("Mock response from {}.", request.model));
        MockReply::words(&text, Duration::ZERO)
    }

    fn record_start(&self, request: &CompletionRequest) -> usize {
        let mut calls = self.calls.lock_ignore_poison();
        calls.push(MockCall {
            model: request.model.clone(),
            prompt: request.prompt.clone(),
            max_tokens: request.max_tokens,
            started_at: Instant::now(),
            finished_at: None,
        });
        calls.len() - 1
    }
}

/// Marks a call finished.
fn record_finish(calls: &Mutex<Vec<MockCall>>, index: usize) {
    if let Some(call) = calls.lock_ignore_poison().get_mut(index) {
        call.finished_at = Some(Instant::now());
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> CoreResult<CompletionStream, ProviderError> {
        let index = self.record_start(request);
        let steps = match self.next_reply(request) {
            MockReply::Reject(error) => {
                record_finish(&self.calls, index);
                return Err(error);
            }
            MockReply::Stream(steps) => steps,
        };

        let calls = Arc::clone(&self.calls);
        let state = (VecDeque::from(steps), calls, index);
        Ok(Box::pin(stream::unfold(
            state,
            |(mut steps, calls, index)| async move {
                match steps.pop_front() {
                    Some(MockStep::Chunk { text, delay }) => {
                        if !delay.is_zero() {
                            sleep(delay).await;
                        }
                        Some((Ok(text), (steps, calls, index)))
                    }
                    Some(MockStep::Fail(error)) => {
                        record_finish(&calls, index);
                        Some((Err(error), (VecDeque::new(), calls, index)))
                    }
                    Some(MockStep::Stall) => future::pending().await,
                    None => {
                        record_finish(&calls, index);
                        None
                    }
                }
            },
        )))
    }
}
