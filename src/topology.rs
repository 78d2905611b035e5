// SPDX-License-Identifier: MIT OR Apache-2.0

//! Logical index resolution across a chain of chunks.
//!
//! A chunked model exposes one logical input/output surface even though the
//! hidden carry between consecutive chunks is physically duplicated:
//!
//! ```text
//! inputs:   chunk 0 → all of its tensors       0 .. n0
//!           chunk i → tensors 1 .. ni          (tensor 0 is the carry in)
//! outputs:  chunk i → tensors 0 .. ni-1        (last tensor is the carry out)
//!           final   → last tensor of the last chunk
//! ```
//!
//! Hence both logical counts are `Σ counts − (chunks − 1)`.
//!
//! # Usage
//!
//! ```
//! use rwkv_chunks::{ChunkLayout, TensorLocation};
//!
//! let layout = ChunkLayout::new(vec![5, 5], vec![5, 5]).unwrap();
//! assert_eq!(layout.logical_input_count(), 9);
//! assert_eq!(layout.resolve_input(5).unwrap(), TensorLocation::new(1, 1));
//! assert_eq!(layout.resolve_output(8).unwrap(), TensorLocation::new(1, 4));
//! ```

use std::fmt;

use crate::error::{Result, RwkvError};

/// Maximum number of chunks a model may be split into.
pub const MAX_CHUNKS: usize = 8;

// ---------------------------------------------------------------------------
// TensorLocation
// ---------------------------------------------------------------------------

/// Physical `(graph, tensor)` address of a logical input or output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorLocation {
    /// Chunk (graph) index.
    pub graph: usize,
    /// Tensor index within that graph's inputs or outputs.
    pub tensor: usize,
}

impl TensorLocation {
    /// Create a location.
    #[must_use]
    pub const fn new(graph: usize, tensor: usize) -> Self {
        Self { graph, tensor }
    }
}

impl fmt::Display for TensorLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "graph {} tensor {}", self.graph, self.tensor)
    }
}

// ---------------------------------------------------------------------------
// ChunkLayout
// ---------------------------------------------------------------------------

/// Per-chunk tensor counts; the pure input to index resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkLayout {
    /// Number of input tensors of each chunk.
    inputs: Vec<usize>,
    /// Number of output tensors of each chunk.
    outputs: Vec<usize>,
}

impl ChunkLayout {
    /// Build a layout from per-chunk input and output counts.
    ///
    /// # Errors
    ///
    /// Returns [`RwkvError::InvalidArgument`] if there are no chunks, more
    /// than [`MAX_CHUNKS`], the two lists differ in length, or any chunk has
    /// no inputs or no outputs.
    pub fn new(inputs: Vec<usize>, outputs: Vec<usize>) -> Result<Self> {
        if inputs.is_empty() || inputs.len() > MAX_CHUNKS {
            return Err(RwkvError::InvalidArgument(format!(
                "chunk count {} outside 1..={MAX_CHUNKS}",
                inputs.len()
            )));
        }
        if inputs.len() != outputs.len() {
            return Err(RwkvError::InvalidArgument(format!(
                "{} input counts but {} output counts",
                inputs.len(),
                outputs.len()
            )));
        }
        if let Some(chunk) = inputs
            .iter()
            .zip(&outputs)
            .position(|(&i, &o)| i == 0 || o == 0)
        {
            return Err(RwkvError::InvalidArgument(format!(
                "chunk {chunk} has no inputs or no outputs"
            )));
        }
        Ok(Self { inputs, outputs })
    }

    /// Number of chunks.
    #[must_use]
    pub fn num_chunks(&self) -> usize {
        self.inputs.len()
    }

    /// Per-chunk input counts.
    #[must_use]
    pub fn input_counts(&self) -> &[usize] {
        &self.inputs
    }

    /// Per-chunk output counts.
    #[must_use]
    pub fn output_counts(&self) -> &[usize] {
        &self.outputs
    }

    /// Number of logical inputs seen by callers.
    #[must_use]
    pub fn logical_input_count(&self) -> usize {
        deduplicated_count(&self.inputs)
    }

    /// Number of logical outputs seen by callers.
    #[must_use]
    pub fn logical_output_count(&self) -> usize {
        deduplicated_count(&self.outputs)
    }

    /// Map a logical input index to its physical location.
    ///
    /// # Errors
    ///
    /// Returns [`RwkvError::IndexOutOfBounds`] if `index` is not below
    /// [`logical_input_count`](Self::logical_input_count).
    pub fn resolve_input(&self, index: usize) -> Result<TensorLocation> {
        let count = self.logical_input_count();
        if index >= count {
            return Err(RwkvError::IndexOutOfBounds { kind: "input", index, count });
        }

        let mut remaining = index;
        for (graph, &n) in self.inputs.iter().enumerate() {
            // Chunk 0 contributes every tensor, later chunks skip the carry.
            let first = usize::from(graph > 0);
            let span = n - first;
            if remaining < span {
                return Ok(TensorLocation::new(graph, remaining + first));
            }
            remaining -= span;
        }
        Err(RwkvError::IndexOutOfBounds { kind: "input", index, count })
    }

    /// Map a logical output index to its physical location.
    ///
    /// The last logical output always resolves to the last tensor of the
    /// last chunk.
    ///
    /// # Errors
    ///
    /// Returns [`RwkvError::IndexOutOfBounds`] if `index` is not below
    /// [`logical_output_count`](Self::logical_output_count).
    pub fn resolve_output(&self, index: usize) -> Result<TensorLocation> {
        let count = self.logical_output_count();
        if index >= count {
            return Err(RwkvError::IndexOutOfBounds { kind: "output", index, count });
        }
        if index == count - 1 {
            return Ok(self.final_output());
        }

        let mut remaining = index;
        for (graph, &n) in self.outputs.iter().enumerate() {
            // Every chunk's last output is either the carry or the final one.
            let span = n - 1;
            if remaining < span {
                return Ok(TensorLocation::new(graph, remaining));
            }
            remaining -= span;
        }
        Err(RwkvError::IndexOutOfBounds { kind: "output", index, count })
    }

    /// Location of the model's final output (typically logits).
    #[must_use]
    pub fn final_output(&self) -> TensorLocation {
        let graph = self.outputs.len() - 1;
        let tensor = self.outputs.last().map_or(0, |n| n - 1);
        TensorLocation::new(graph, tensor)
    }
}

/// `Σ counts − (chunks − 1)`: one shared boundary tensor per chunk pair.
fn deduplicated_count(counts: &[usize]) -> usize {
    let total: usize = counts.iter().sum();
    total + 1 - counts.len()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn single_chunk_is_identity() {
        let layout = ChunkLayout::new(vec![7], vec![7]).unwrap();
        assert_eq!(layout.logical_input_count(), 7);
        assert_eq!(layout.logical_output_count(), 7);
        for i in 0..7 {
            assert_eq!(layout.resolve_input(i).unwrap(), TensorLocation::new(0, i));
            assert_eq!(layout.resolve_output(i).unwrap(), TensorLocation::new(0, i));
        }
    }

    #[test]
    fn multi_chunk_counts() {
        // 3 chunks of 4 inputs / 4 outputs: 12 - 2 = 10 logical tensors.
        let layout = ChunkLayout::new(vec![4, 4, 4], vec![4, 4, 4]).unwrap();
        assert_eq!(layout.logical_input_count(), 10);
        assert_eq!(layout.logical_output_count(), 10);
    }

    #[test]
    fn multi_chunk_inputs_skip_carry() {
        let layout = ChunkLayout::new(vec![4, 4, 4], vec![4, 4, 4]).unwrap();
        let resolved: Vec<_> = (0..10)
            .map(|i| layout.resolve_input(i).unwrap())
            .map(|loc| (loc.graph, loc.tensor))
            .collect();
        assert_eq!(
            resolved,
            vec![
                (0, 0),
                (0, 1),
                (0, 2),
                (0, 3),
                (1, 1),
                (1, 2),
                (1, 3),
                (2, 1),
                (2, 2),
                (2, 3),
            ]
        );
    }

    #[test]
    fn multi_chunk_outputs_skip_carry() {
        let layout = ChunkLayout::new(vec![4, 4, 4], vec![4, 4, 4]).unwrap();
        let resolved: Vec<_> = (0..10)
            .map(|i| layout.resolve_output(i).unwrap())
            .map(|loc| (loc.graph, loc.tensor))
            .collect();
        assert_eq!(
            resolved,
            vec![
                (0, 0),
                (0, 1),
                (0, 2),
                (1, 0),
                (1, 1),
                (1, 2),
                (2, 0),
                (2, 1),
                (2, 2),
                (2, 3),
            ]
        );
    }

    #[test]
    fn uniform_chunks_match_closed_form() {
        // For equally sized chunks the walk reduces to modular arithmetic.
        let n = 6;
        let layout = ChunkLayout::new(vec![n; 4], vec![n; 4]).unwrap();
        for i in n..layout.logical_input_count() {
            let loc = layout.resolve_input(i).unwrap();
            assert_eq!(loc.graph, (i - 1) / (n - 1));
            assert_eq!(loc.tensor, (i - 1) % (n - 1) + 1);
        }
        for i in (n - 1)..layout.logical_output_count() - 1 {
            let loc = layout.resolve_output(i).unwrap();
            assert_eq!(loc.graph, i / (n - 1));
            assert_eq!(loc.tensor, i % (n - 1));
        }
    }

    #[test]
    fn last_output_is_final_chunk_last_tensor() {
        let layout = ChunkLayout::new(vec![3, 5], vec![9, 6]).unwrap();
        let last = layout.logical_output_count() - 1;
        assert_eq!(layout.resolve_output(last).unwrap(), TensorLocation::new(1, 5));
        assert_eq!(layout.final_output(), TensorLocation::new(1, 5));
    }

    #[test]
    fn uneven_chunks_resolve() {
        let layout = ChunkLayout::new(vec![3, 5], vec![9, 6]).unwrap();
        assert_eq!(layout.logical_input_count(), 7);
        assert_eq!(layout.resolve_input(2).unwrap(), TensorLocation::new(0, 2));
        assert_eq!(layout.resolve_input(3).unwrap(), TensorLocation::new(1, 1));
        assert_eq!(layout.resolve_input(6).unwrap(), TensorLocation::new(1, 4));
        assert_eq!(layout.logical_output_count(), 14);
        assert_eq!(layout.resolve_output(7).unwrap(), TensorLocation::new(0, 7));
        assert_eq!(layout.resolve_output(8).unwrap(), TensorLocation::new(1, 0));
        assert_eq!(layout.resolve_output(12).unwrap(), TensorLocation::new(1, 4));
    }

    #[test]
    fn out_of_bounds_is_rejected() {
        let layout = ChunkLayout::new(vec![4, 4], vec![4, 4]).unwrap();
        assert!(matches!(
            layout.resolve_input(7),
            Err(RwkvError::IndexOutOfBounds { kind: "input", index: 7, count: 7 })
        ));
        assert!(matches!(
            layout.resolve_output(100),
            Err(RwkvError::IndexOutOfBounds { kind: "output", .. })
        ));
    }

    #[test]
    fn invalid_layouts() {
        assert!(ChunkLayout::new(vec![], vec![]).is_err());
        assert!(ChunkLayout::new(vec![2; MAX_CHUNKS + 1], vec![2; MAX_CHUNKS + 1]).is_err());
        assert!(ChunkLayout::new(vec![2, 2], vec![2]).is_err());
        assert!(ChunkLayout::new(vec![2, 0], vec![2, 2]).is_err());
        assert!(ChunkLayout::new(vec![2; MAX_CHUNKS], vec![2; MAX_CHUNKS]).is_ok());
    }
}
