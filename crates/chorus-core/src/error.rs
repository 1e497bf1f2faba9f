use core::result::Result as CoreResult;
use core::time::Duration;
use std::io::Error as IoError;

use serde_json::Error as SerdeJsonError;
use thiserror::Error;
use toml::de::Error as TomlError;
use toml::ser::Error as TomlSerError;

/// Result type for core operations.
pub type Result<T> = CoreResult<T, Error>;

/// Errors that can occur while configuring or running a pipeline.
#[derive(Debug, Error)]
pub enum Error {
    /// An I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization or deserialization failed.
    #[error("JSON serialization error: {0}")]
    Json(#[from] SerdeJsonError),

    /// TOML deserialization failed.
    #[error("TOML deserialization error: {0}")]
    Toml(#[from] TomlError),

    /// TOML serialization failed.
    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] TomlSerError),

    /// Configuration is invalid or missing.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An agent specification was rejected before dispatch.
    #[error("Invalid agent specification: {0}")]
    Validation(String),

    /// A provider call failed.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// The run was cancelled before every agent finished.
    #[error("Pipeline run cancelled")]
    Cancelled,

    /// A general error not covered by other variants.
    #[error("{0}")]
    Other(String),
}

/// Typed failures raised by an LLM provider.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// The provider reported that the request timed out.
    #[error("request timed out: {0}")]
    Timeout(String),

    /// The connection could not be established or was dropped.
    #[error("connection failure: {0}")]
    ConnectionFailure(String),

    /// The provider is throttling requests.
    #[error("rate limited: {message}")]
    RateLimited {
        /// Server-provided message
        message: String,
        /// Delay suggested by the server, if any
        retry_after: Option<Duration>,
    },

    /// The provider returned a server-side failure.
    #[error("server error {status}: {message}")]
    Server {
        /// HTTP status code
        status: u16,
        /// Response body or message
        message: String,
    },

    /// The request was malformed and will never succeed as-is.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Credentials were missing or rejected.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The response stream could not be decoded.
    #[error("stream error: {0}")]
    Stream(String),
}

impl ProviderError {
    /// Returns `true` for failures worth retrying with backoff.
    ///
    /// Malformed requests and authentication failures are permanent.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::BadRequest(_) | Self::Authentication(_))
    }

    /// Delay suggested by the provider before retrying, if any.
    pub fn suggested_delay(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Maps an HTTP status code and body to the matching error bucket.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::Authentication(body),
            408 => Self::Timeout(body),
            429 => Self::RateLimited {
                message: body,
                retry_after: None,
            },
            500..=599 => Self::Server {
                status,
                message: body,
            },
            _ => Self::BadRequest(format!("HTTP {status}: {body}")),
        }
    }
}

/// Failures raised while resolving a tool directive.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ToolError {
    /// No enabled tool matches the requested name.
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    /// The tool was found but the invocation failed.
    #[error("tool '{tool}' failed: {message}")]
    Invocation {
        /// Name of the tool that failed
        tool: String,
        /// Failure description
        message: String,
    },

    /// Auto selection was requested but no tools are enabled.
    #[error("no tools are enabled")]
    NoToolsEnabled,
}
