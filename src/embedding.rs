// SPDX-License-Identifier: MIT OR Apache-2.0

//! Token embedding table used to feed chunk 0.
//!
//! Compiled graphs usually start after the embedding lookup, so the host
//! keeps the table and writes one row per step into the first input.  The
//! table ships as a side file next to the model (`model.bin` →
//! `model.emb`): consecutive little-endian `f32` vectors of fixed width, no
//! header.
//!
//! # Memory layout
//!
//! Rows are stored contiguously: row `t` occupies
//! `data[t * width .. (t + 1) * width]`.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::error::{Result, RwkvError};

/// Size of one encoded element.
const F32_BYTES: usize = std::mem::size_of::<f32>();

/// Immutable `[rows, width]` table of `f32` embedding vectors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmbeddingTable {
    /// Vector width (embedding dimension).
    width: usize,
    /// Row-major vectors, `rows * width` elements.
    data: Vec<f32>,
}

impl EmbeddingTable {
    /// An empty table of the given width.
    #[must_use]
    pub const fn empty(width: usize) -> Self {
        Self {
            width,
            data: Vec::new(),
        }
    }

    /// Build a table from row-major values.
    ///
    /// # Errors
    ///
    /// Returns [`RwkvError::InvalidArgument`] if `width` is zero or
    /// `data.len()` is not a multiple of `width`.
    pub fn from_vec(data: Vec<f32>, width: usize) -> Result<Self> {
        if width == 0 || data.len() % width != 0 {
            return Err(RwkvError::InvalidArgument(format!(
                "{} values do not form rows of width {width}",
                data.len()
            )));
        }
        Ok(Self { width, data })
    }

    /// Decode consecutive little-endian `f32` vectors of `width` elements.
    ///
    /// Row count is `bytes.len() / (width * 4)`; a trailing partial vector
    /// is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`RwkvError::InvalidArgument`] if `width` is zero.
    pub fn from_le_bytes(bytes: &[u8], width: usize) -> Result<Self> {
        if width == 0 {
            return Err(RwkvError::InvalidArgument(
                "embedding width must be non-zero".into(),
            ));
        }
        let row_bytes = width * F32_BYTES;
        let rows = bytes.len() / row_bytes;
        let data = bytes
            .chunks_exact(F32_BYTES)
            .take(rows * width)
            .map(|chunk| {
                let mut raw = [0u8; F32_BYTES];
                raw.copy_from_slice(chunk);
                f32::from_le_bytes(raw)
            })
            .collect();
        Ok(Self { width, data })
    }

    /// Decode an in-memory table for a known vocabulary size; the row width
    /// is derived as `bytes.len() / 4 / vocab_size`.
    ///
    /// # Errors
    ///
    /// Returns [`RwkvError::InvalidArgument`] if `vocab_size` is zero or the
    /// buffer is too small for one element per token.
    pub fn from_vocab_buffer(bytes: &[u8], vocab_size: usize) -> Result<Self> {
        if vocab_size == 0 {
            return Err(RwkvError::InvalidArgument(
                "vocabulary size must be non-zero".into(),
            ));
        }
        let width = bytes.len() / F32_BYTES / vocab_size;
        if width == 0 {
            return Err(RwkvError::InvalidArgument(format!(
                "{} bytes cannot hold {vocab_size} embedding rows",
                bytes.len()
            )));
        }
        Self::from_le_bytes(bytes, width)
    }

    /// Load a table from a side file.
    ///
    /// A missing file is not an error: an empty table is returned and the
    /// caller must supply pre-embedded inputs itself.
    ///
    /// # Errors
    ///
    /// Returns [`RwkvError::Io`] for read failures other than "not found",
    /// and [`RwkvError::InvalidArgument`] if `width` is zero.
    pub fn load(path: impl AsRef<Path>, width: usize) -> Result<Self> {
        let path = path.as_ref();
        match std::fs::read(path) {
            Ok(bytes) => {
                let table = Self::from_le_bytes(&bytes, width)?;
                tracing::info!(
                    path = %path.display(),
                    rows = table.len(),
                    width,
                    "loaded embedding table"
                );
                Ok(table)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::warn!(
                    path = %path.display(),
                    "embedding table not found, inputs must be pre-embedded"
                );
                Ok(Self::empty(width))
            }
            Err(e) => Err(RwkvError::Io(e)),
        }
    }

    /// Vector width.
    #[must_use]
    pub const fn width(&self) -> usize {
        self.width
    }

    /// Number of rows (vocabulary entries).
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len().checked_div(self.width).unwrap_or(0)
    }

    /// Whether the table holds no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The vector for `token`, or `None` past the end.
    #[must_use]
    pub fn row(&self, token: usize) -> Option<&[f32]> {
        let start = token.checked_mul(self.width)?;
        let end = start.checked_add(self.width)?;
        self.data.get(start..end)
    }
}

/// Side-file path for a model: the model path with its extension replaced
/// by `emb`.
///
/// ```
/// use std::path::Path;
/// use rwkv_chunks::embedding_path_for;
///
/// assert_eq!(
///     embedding_path_for("models/rwkv7-0.4b.bin"),
///     Path::new("models/rwkv7-0.4b.emb")
/// );
/// ```
#[must_use]
pub fn embedding_path_for(model_path: impl AsRef<Path>) -> PathBuf {
    model_path.as_ref().with_extension("emb")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
