// SPDX-License-Identifier: MIT OR Apache-2.0

//! Compiled-graph trait and a host-side implementation.
//!
//! [`ComputeGraph`] is the trait every chunk implements; it is the seam
//! behind which backend loading, graph compilation and binary caching live.
//! [`HostGraph`] wraps a Rust closure, for CPU fallbacks and test doubles.

use std::fmt;

use candle_core::Tensor;

use crate::error::{Result, RwkvError};
use crate::tensor::TensorSpec;

// ---------------------------------------------------------------------------
// ComputeGraph trait
// ---------------------------------------------------------------------------

/// One finalized computation graph (a "chunk") of a compiled RWKV model.
///
/// Input and output signatures are fixed once the graph is finalized; the
/// runner allocates one buffer per spec and hands the current inputs to
/// [`execute`](Self::execute) on every step.
///
/// Implementations only run the graph: they never carry state themselves.
pub trait ComputeGraph: Send + Sync {
    // --- Metadata --------------------------------------------------------

    /// Graph name, used in logs and error messages.
    fn name(&self) -> &str;

    /// Ordered input signature.
    fn inputs(&self) -> &[TensorSpec];

    /// Ordered output signature.
    fn outputs(&self) -> &[TensorSpec];

    // --- Invocation ------------------------------------------------------

    /// Run the graph once.
    ///
    /// # Shapes
    /// - `inputs`: one tensor per [`inputs`](Self::inputs) spec, same order
    /// - returns: one tensor per [`outputs`](Self::outputs) spec, same order,
    ///   matching each spec's dims and dtype exactly
    ///
    /// # Errors
    ///
    /// Any error is reported to the caller as an execution failure of this
    /// chunk.  The call is blocking and is never retried.
    fn execute(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>>;
}

// ---------------------------------------------------------------------------
// HostGraph
// ---------------------------------------------------------------------------

/// Signature of a [`HostGraph`] body.
// TRAIT_OBJECT: arbitrary closures need dynamic dispatch
pub type HostGraphFn = dyn Fn(&[Tensor]) -> Result<Vec<Tensor>> + Send + Sync;

/// A [`ComputeGraph`] whose body is a host-side closure.
///
/// # Example
///
/// ```
/// use rwkv_chunks::{ComputeGraph, HostGraph, TensorSpec};
///
/// // Identity over a 4-element state plus a doubled hidden vector.
/// let graph = HostGraph::new(
///     "identity",
///     vec![TensorSpec::f32("x", &[4]), TensorSpec::f32("state_in", &[4])],
///     vec![TensorSpec::f32("state_out", &[4]), TensorSpec::f32("out", &[4])],
///     |inputs| Ok(vec![inputs[1].clone(), (&inputs[0] * 2.0)?]),
/// );
/// assert_eq!(graph.inputs().len(), 2);
/// ```
pub struct HostGraph {
    /// Graph name.
    name: String,
    /// Input signature.
    inputs: Vec<TensorSpec>,
    /// Output signature.
    outputs: Vec<TensorSpec>,
    /// Graph body.
    // TRAIT_OBJECT: arbitrary closures need dynamic dispatch
    body: Box<HostGraphFn>,
}

impl HostGraph {
    /// Wrap a closure as a graph with the given signature.
    pub fn new<F>(
        name: impl Into<String>,
        inputs: Vec<TensorSpec>,
        outputs: Vec<TensorSpec>,
        body: F,
    ) -> Self
    where
        F: Fn(&[Tensor]) -> Result<Vec<Tensor>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            inputs,
            outputs,
            body: Box::new(body),
        }
    }
}

impl fmt::Debug for HostGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostGraph")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish_non_exhaustive()
    }
}

impl ComputeGraph for HostGraph {
    fn name(&self) -> &str {
        &self.name
    }

    fn inputs(&self) -> &[TensorSpec] {
        &self.inputs
    }

    fn outputs(&self) -> &[TensorSpec] {
        &self.outputs
    }

    fn execute(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        if inputs.len() != self.inputs.len() {
            return Err(RwkvError::InvalidArgument(format!(
                "graph '{}' takes {} inputs, got {}",
                self.name,
                self.inputs.len(),
                inputs.len()
            )));
        }
        (self.body)(inputs)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use candle_core::Device;

    use super::*;

    fn doubling_graph() -> HostGraph {
        HostGraph::new(
            "double",
            vec![TensorSpec::f32("x", &[3])],
            vec![TensorSpec::f32("y", &[3])],
            |inputs| Ok(vec![(&inputs[0] * 2.0)?]),
        )
    }

    #[test]
    fn host_graph_runs_body() {
        let graph = doubling_graph();
        let x = Tensor::new(&[1.0_f32, 2.0, 3.0], &Device::Cpu).unwrap();
        let out = graph.execute(&[x]).unwrap();
        assert_eq!(out[0].to_vec1::<f32>().unwrap(), vec![2.0, 4.0, 6.0]);
        assert_eq!(graph.name(), "double");
    }

    #[test]
    fn host_graph_checks_arity() {
        let graph = doubling_graph();
        assert!(matches!(
            graph.execute(&[]),
            Err(RwkvError::InvalidArgument(_))
        ));
    }

    #[test]
    fn trait_object_dispatch() {
        // TRAIT_OBJECT: the runner stores heterogeneous graphs
        let graph: Box<dyn ComputeGraph> = Box::new(doubling_graph());
        assert_eq!(graph.outputs()[0].dims, vec![3]);
    }
}
