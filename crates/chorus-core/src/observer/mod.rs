//! Observer interface through which a pipeline reports to its caller.
//! Results only leave the pipeline through this interface.

use tokio::sync::mpsc;
use tracing::warn;

/// Event types for observer updates
pub mod events;

pub use events::PipelineEvent;

/// Callbacks implemented by the layer driving a pipeline run.
pub trait Observer: Send + Sync {
    /// Display-ready text from an agent's stream.
    fn on_stream_chunk(&self, agent_number: u32, model: &str, text: &str, is_first: bool);

    /// User-facing progress line.
    fn on_log(&self, message: &str);

    /// An agent failed; the run continues.
    fn on_agent_error(&self, agent_number: u32, message: &str);

    /// The run finished.
    fn on_complete(&self);

    /// The run aborted.
    fn on_fatal_error(&self, message: &str);
}

/// Observer that forwards every callback as a [`PipelineEvent`] over a channel.
#[derive(Clone)]
pub struct ChannelObserver {
    /// Sender used to deliver events to the consumer
    sender: mpsc::UnboundedSender<PipelineEvent>,
}

impl ChannelObserver {
    /// Creates an observer and the receiver its events arrive on.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PipelineEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// Creates an observer from an existing sender.
    pub fn from_sender(sender: mpsc::UnboundedSender<PipelineEvent>) -> Self {
        Self { sender }
    }

    /// Sends an event.
    ///
    /// Events are dropped if the receiver has been closed.
    pub fn send(&self, event: PipelineEvent) {
        if let Err(error) = self.sender.send(event) {
            warn!("Failed to send pipeline event: {}", error);
        }
    }
}

impl Observer for ChannelObserver {
    fn on_stream_chunk(&self, agent_number: u32, model: &str, text: &str, is_first: bool) {
        self.send(PipelineEvent::StreamChunk {
            agent_number,
            model: model.to_owned(),
            text: text.to_owned(),
            is_first,
        });
    }

    fn on_log(&self, message: &str) {
        self.send(PipelineEvent::Log {
            message: message.to_owned(),
        });
    }

    fn on_agent_error(&self, agent_number: u32, message: &str) {
        self.send(PipelineEvent::AgentError {
            agent_number,
            message: message.to_owned(),
        });
    }

    fn on_complete(&self) {
        self.send(PipelineEvent::Complete);
    }

    fn on_fatal_error(&self, message: &str) {
        self.send(PipelineEvent::FatalError {
            message: message.to_owned(),
        });
    }
}

/// Observer that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullObserver;

impl Observer for NullObserver {
    fn on_stream_chunk(&self, _agent_number: u32, _model: &str, _text: &str, _is_first: bool) {}

    fn on_log(&self, _message: &str) {}

    fn on_agent_error(&self, _agent_number: u32, _message: &str) {}

    fn on_complete(&self) {}

    fn on_fatal_error(&self, _message: &str) {}
}
