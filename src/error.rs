//! Error types for the pipeline core.

use thiserror::Error;

/// Failure reported by a capability provider (demuxer, codec, filter graph, muxer).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} (code {code})")]
pub struct BackendError {
    pub code: i32,
    pub message: String,
}

impl BackendError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// An error without a meaningful provider code.
    pub fn other(message: impl Into<String>) -> Self {
        Self::new(-1, message)
    }
}

/// Fatal pipeline errors. Transient and end-of-stream conditions are not errors;
/// they travel as [`crate::backend::Outcome`] values.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("{context}: {source}")]
    Backend {
        context: String,
        #[source]
        source: BackendError,
    },

    #[error("{0}: no progress after retry (send blocked and nothing to receive)")]
    Stalled(String),

    #[error("{0}: input sent after end of stream")]
    AlreadyFlushed(String),

    #[error("{0}: flush ended without end of stream")]
    FlushIncomplete(String),

    #[error("stream #{file}:{index}: {message}")]
    Stream {
        file: usize,
        index: usize,
        message: String,
    },

    #[error("filter graph: {0}")]
    FilterGraph(String),

    #[error("invalid pipeline setup: {0}")]
    Setup(String),

    #[error("reader thread for '{0}' panicked")]
    ReaderPanicked(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn backend(context: impl Into<String>, source: BackendError) -> Self {
        Self::Backend {
            context: context.into(),
            source,
        }
    }

    pub fn stream(file: usize, index: usize, message: impl Into<String>) -> Self {
        Self::Stream {
            file,
            index,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Attaches a context string to a provider failure.
pub trait BackendContext<T> {
    fn backend_context(self, context: impl FnOnce() -> String) -> Result<T>;
}

impl<T> BackendContext<T> for std::result::Result<T, BackendError> {
    fn backend_context(self, context: impl FnOnce() -> String) -> Result<T> {
        self.map_err(|source| PipelineError::backend(context(), source))
    }
}
