// SPDX-License-Identifier: MIT OR Apache-2.0

//! Runner configuration and JSON parsing.
//!
//! [`RunnerConfig`] captures the per-model choices that the compiled graphs
//! cannot describe themselves: how recurrence is carried, where the
//! embedding table lives, and how externalized decay is consumed.  Every
//! field has a default, so an empty JSON object is a valid configuration.
//!
//! # Usage
//!
//! ```
//! use rwkv_chunks::{RecurrenceMode, RunnerConfig};
//!
//! let json = serde_json::json!({
//!     "recurrence": "externalized",
//!     "model_path": "models/rwkv7-1.5b.bin",
//!     "vocab_size": 65536
//! });
//! let config = RunnerConfig::from_json(&json).unwrap();
//! assert_eq!(config.recurrence, Some(RecurrenceMode::Externalized));
//! assert_eq!(config.vocab_size, Some(65536));
//! ```

use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::embedding::embedding_path_for;
use crate::error::{Result, RwkvError};
use crate::rwkv::config::{DecayTransform, RecurrenceMode, StateRevision};

// ---------------------------------------------------------------------------
// RunnerConfig
// ---------------------------------------------------------------------------

/// Configuration for a [`ChunkedRwkv`](crate::ChunkedRwkv) runner.
///
/// # JSON field reference
///
/// | Field | Key | Notes |
/// |-------|-----|-------|
/// | `recurrence` | `recurrence` | `"fused"`, `"externalized"`, or `"auto"` (default) |
/// | `revision` | `revision` | `"standard"` (default) or `"v6"` |
/// | `decay_transform` | `decay_transform` | `"as_is"` (default) or `"double_exp"` |
/// | `embedding_path` | `embedding_path` | Explicit table path |
/// | `embedding_path` | `model_path` | Derives `<stem>.emb` when no explicit path |
/// | `vocab_size` | `vocab_size` | Optional upper bound on token ids |
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunnerConfig {
    /// Recurrence mode; `None` infers it from the chunk-0 signature.
    pub recurrence: Option<RecurrenceMode>,
    /// State tensor ordering of the export.
    pub revision: StateRevision,
    /// Nonlinearity for externalized decay scalars.
    pub decay_transform: DecayTransform,
    /// Embedding side file, loaded lazily on the first step.
    pub embedding_path: Option<PathBuf>,
    /// Vocabulary size; token ids must be below it when set.
    pub vocab_size: Option<usize>,
}

impl RunnerConfig {
    /// Parse a [`RunnerConfig`] from a JSON object.
    ///
    /// # Errors
    ///
    /// Returns [`RwkvError::Config`] if the value is not an object or a
    /// field has an unexpected type or value.
    pub fn from_json(config: &Value) -> Result<Self> {
        if !config.is_object() {
            return Err(RwkvError::Config("runner config must be a JSON object".into()));
        }

        let recurrence = match get_optional_str(config, "recurrence")? {
            None | Some("auto") => None,
            Some(mode) => Some(mode.parse::<RecurrenceMode>()?),
        };
        let revision = get_optional_str(config, "revision")?
            .map(str::parse::<StateRevision>)
            .transpose()?
            .unwrap_or_default();
        let decay_transform = get_optional_str(config, "decay_transform")?
            .map(str::parse::<DecayTransform>)
            .transpose()?
            .unwrap_or_default();

        let embedding_path = match get_optional_str(config, "embedding_path")? {
            Some(path) => Some(PathBuf::from(path)),
            None => get_optional_str(config, "model_path")?.map(embedding_path_for),
        };

        Ok(Self {
            recurrence,
            revision,
            decay_transform,
            embedding_path,
            vocab_size: get_optional_usize(config, "vocab_size")?,
        })
    }

    /// Read and parse a JSON config file.
    ///
    /// # Errors
    ///
    /// Returns [`RwkvError::Io`] if the file cannot be read,
    /// [`RwkvError::Json`] if it is not valid JSON, and
    /// [`RwkvError::Config`] for invalid fields.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let json: Value = serde_json::from_str(&text)?;
        Self::from_json(&json)
    }

    /// Force a recurrence mode instead of inferring it.
    #[must_use]
    pub const fn with_recurrence(mut self, mode: RecurrenceMode) -> Self {
        self.recurrence = Some(mode);
        self
    }

    /// Select the state tensor ordering.
    #[must_use]
    pub const fn with_revision(mut self, revision: StateRevision) -> Self {
        self.revision = revision;
        self
    }

    /// Select the decay nonlinearity.
    #[must_use]
    pub const fn with_decay_transform(mut self, transform: DecayTransform) -> Self {
        self.decay_transform = transform;
        self
    }

    /// Use the embedding side file that sits next to `model_path`.
    #[must_use]
    pub fn with_model_path(mut self, model_path: impl AsRef<Path>) -> Self {
        self.embedding_path = Some(embedding_path_for(model_path));
        self
    }

    /// Use an explicit embedding table path.
    #[must_use]
    pub fn with_embedding_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.embedding_path = Some(path.into());
        self
    }

    /// Bound token ids by a vocabulary size.
    #[must_use]
    pub const fn with_vocab_size(mut self, vocab_size: usize) -> Self {
        self.vocab_size = Some(vocab_size);
        self
    }
}

// ---------------------------------------------------------------------------
// JSON extraction helpers
// ---------------------------------------------------------------------------

/// Extract an optional string field; present but non-string is an error.
fn get_optional_str<'a>(config: &'a Value, key: &str) -> Result<Option<&'a str>> {
    match config.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_str()
            .map(Some)
            .ok_or_else(|| RwkvError::Config(format!("field '{key}' must be a string"))),
    }
}

/// Extract an optional `usize` field; present but invalid is an error.
fn get_optional_usize(config: &Value, key: &str) -> Result<Option<usize>> {
    match config.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => {
            let val = v
                .as_u64()
                .ok_or_else(|| RwkvError::Config(format!("missing or invalid field '{key}'")))?;
            usize::try_from(val)
                .map(Some)
                .map_err(|_| RwkvError::Config(format!("field '{key}' value {val} overflows usize")))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
