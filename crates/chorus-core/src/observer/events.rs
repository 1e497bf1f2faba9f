use serde::{Deserialize, Serialize};

/// Event delivered to the layer driving a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineEvent {
    /// Display-ready text from an agent's stream
    StreamChunk {
        /// Agent producing the text
        agent_number: u32,
        /// Model producing the text
        model: String,
        /// Text to append
        text: String,
        /// Whether this is the agent's first chunk
        is_first: bool,
    },
    /// User-facing progress line
    Log {
        /// Message text
        message: String,
    },
    /// An agent failed; the run continues
    AgentError {
        /// Agent that failed
        agent_number: u32,
        /// Error description
        message: String,
    },
    /// The run finished
    Complete,
    /// The run aborted
    FatalError {
        /// Error description
        message: String,
    },
}
