// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for rwkv-chunks.

/// Errors that can occur while assembling or stepping a chunked RWKV model.
#[derive(Debug, thiserror::Error)]
pub enum RwkvError {
    /// Null-equivalent or out-of-range argument (token id, chunk count, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Logical input/output index past the end of the logical surface.
    #[error("{kind} index {index} out of bounds (count {count})")]
    IndexOutOfBounds {
        /// `"input"`, `"output"` or `"chunk"`.
        kind: &'static str,
        /// Requested logical index.
        index: usize,
        /// Number of logical tensors of that kind.
        count: usize,
    },

    /// Caller-declared element count disagrees with the tensor's.
    #[error("size mismatch for {what}: expected {expected} elements, got {actual}")]
    SizeMismatch {
        /// Description of the tensor being accessed.
        what: String,
        /// Element count the tensor holds.
        expected: usize,
        /// Element count supplied or requested by the caller.
        actual: usize,
    },

    /// A compiled graph failed to execute (or produced malformed outputs).
    #[error("execution of chunk {chunk} failed: {source}")]
    Execution {
        /// Chunk index of the failing graph.
        chunk: usize,
        /// Underlying failure reported by the graph.
        #[source]
        source: Box<RwkvError>,
    },

    /// Buffer allocation failure.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Graph topology, dtype or revision the runner cannot handle.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Runner configuration parsing error.
    #[error("config error: {0}")]
    Config(String),

    /// Tensor allocation or conversion error (wraps candle).
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// JSON (de)serialization error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for rwkv-chunks operations.
pub type Result<T> = std::result::Result<T, RwkvError>;
