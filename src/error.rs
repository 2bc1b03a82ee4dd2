use std::path::PathBuf;

/// Errors related to configuration loading and parsing.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config at {path}: {message}")]
    ParseError { path: PathBuf, message: String },

    #[error("Invalid routing pattern `{pattern}`: {message}")]
    InvalidPattern { pattern: String, message: String },
}

/// Failure kinds of the external LLM call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LlmError {
    #[error("rate limited by provider: {0}")]
    RateLimited(String),

    /// The provider itself reported a timeout.
    #[error("provider timed out: {0}")]
    Timeout(String),

    #[error("provider error: {0}")]
    ProviderError(String),
}

/// Why a mailbox refused an envelope.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("mailbox full")]
    MailboxFull,

    #[error("mailbox closed")]
    Closed,
}

/// Errors returned by [`crate::message::bus::MessageBus::publish`].
///
/// The envelope is always appended to the log before delivery is attempted,
/// so a `BusError` never means the message was lost from the transcript.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    #[error("no subscriber for `{0}`")]
    NoSubscriber(String),

    #[error("delivery to `{receiver}` failed: {source}")]
    Delivery {
        receiver: String,
        #[source]
        source: DeliveryError,
    },
}

/// Errors raised inside one agent's `process` call. Contained by the
/// runtime and converted into a REJECT reply.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("processing failed: {0}")]
    Processing(String),

    #[error("routing produced no specialists: {0}")]
    Routing(String),

    #[error("agent panicked: {0}")]
    Panicked(String),
}

/// The only failures that reach the caller of a task.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskError {
    #[error("task timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("task rejected: {0}")]
    Rejected(String),

    #[error("task abandoned: {0}")]
    Abandoned(String),

    #[error("could not submit task: {0}")]
    Publish(#[from] BusError),

    /// The single-model baseline's only call failed.
    #[error("LLM call failed: {0}")]
    Llm(#[from] LlmError),
}

/// Errors from a task-memory backend.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("memory file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("memory file {path} is not valid: {message}")]
    Corrupt { path: PathBuf, message: String },

    #[error("could not encode memory: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Errors constructing a fabric.
#[derive(Debug, thiserror::Error)]
pub enum FabricError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("routing can target `{0}`, which is not a specialist")]
    UnknownSpecialist(String),

    #[error(transparent)]
    Memory(#[from] MemoryError),
}
