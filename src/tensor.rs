// SPDX-License-Identifier: MIT OR Apache-2.0

//! Typed tensor handles: the buffers a chunk reads and writes each step.
//!
//! Every compiled graph publishes an ordered list of [`TensorSpec`]s for its
//! inputs and outputs.  [`TensorHandleSet`] owns one [`TensorSlot`] per spec;
//! slots are zero-initialized when the model is assembled and overwritten in
//! place on every step.  Shapes and dtypes never change after assembly.

use std::fmt;

use candle_core::{DType, Device, Tensor};

use crate::error::{Result, RwkvError};

// ---------------------------------------------------------------------------
// TensorSpec
// ---------------------------------------------------------------------------

/// Name, shape and element type of one graph input or output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorSpec {
    /// Tensor name as published by the graph.
    pub name: String,
    /// Per-axis extents, fixed after graph finalization.
    pub dims: Vec<usize>,
    /// Native element type of the backing buffer.
    pub dtype: DType,
}

impl TensorSpec {
    /// Create a spec from a name, shape and element type.
    #[must_use]
    pub fn new(name: impl Into<String>, dims: &[usize], dtype: DType) -> Self {
        Self {
            name: name.into(),
            dims: dims.to_vec(),
            dtype,
        }
    }

    /// Shorthand for a 32-bit float tensor.
    #[must_use]
    pub fn f32(name: impl Into<String>, dims: &[usize]) -> Self {
        Self::new(name, dims, DType::F32)
    }

    /// Shorthand for a 16-bit float tensor.
    #[must_use]
    pub fn f16(name: impl Into<String>, dims: &[usize]) -> Self {
        Self::new(name, dims, DType::F16)
    }

    /// Number of elements (product of all extents).
    #[must_use]
    pub fn elem_count(&self) -> usize {
        self.dims.iter().product()
    }

    /// Number of axes.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Whether a verbatim buffer copy from `self` into `dst` is well-formed.
    ///
    /// Logical extents must agree and both sides must share a dtype; state
    /// copies never perform numeric conversion.
    #[must_use]
    pub fn is_copy_compatible(&self, dst: &Self) -> bool {
        self.elem_count() == dst.elem_count() && self.dtype == dst.dtype
    }

    /// Check that a tensor produced by a graph matches this spec exactly.
    pub(crate) fn check(&self, tensor: &Tensor) -> Result<()> {
        if tensor.dims() != self.dims.as_slice() || tensor.dtype() != self.dtype {
            return Err(RwkvError::Unsupported(format!(
                "tensor for {self} has shape {:?} and dtype {:?}",
                tensor.dims(),
                tensor.dtype()
            )));
        }
        Ok(())
    }
}

impl fmt::Display for TensorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}' {:?} {:?}", self.name, self.dims, self.dtype)
    }
}

// ---------------------------------------------------------------------------
// TensorSlot
// ---------------------------------------------------------------------------

/// One allocated tensor handle: a spec plus its current backing buffer.
#[derive(Debug, Clone)]
pub struct TensorSlot {
    /// Immutable description of the buffer.
    spec: TensorSpec,
    /// Current content; replaced wholesale on every write.
    tensor: Tensor,
}

impl TensorSlot {
    /// Allocate a zero-filled slot for `spec` on `device`.
    ///
    /// # Errors
    ///
    /// Returns [`RwkvError::ResourceExhausted`] if the buffer cannot be
    /// allocated.
    pub fn zeros(spec: TensorSpec, device: &Device) -> Result<Self> {
        let tensor = Tensor::zeros(spec.dims.as_slice(), spec.dtype, device)
            .map_err(|e| RwkvError::ResourceExhausted(format!("allocate {spec}: {e}")))?;
        Ok(Self { spec, tensor })
    }

    /// The slot's spec.
    #[must_use]
    pub const fn spec(&self) -> &TensorSpec {
        &self.spec
    }

    /// The current backing tensor.
    #[must_use]
    pub const fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    /// Per-axis extents.
    #[must_use]
    pub fn dims(&self) -> &[usize] {
        &self.spec.dims
    }

    /// Read the whole buffer as `f32`, converting from the native dtype.
    ///
    /// `F32` is read directly, `F16` is widened, anything else goes through
    /// candle's generic dtype conversion.
    ///
    /// # Errors
    ///
    /// Returns [`RwkvError::Tensor`] if the dtype cannot be converted.
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        let flat = self.tensor.flatten_all()?;
        let values = match self.spec.dtype {
            DType::F32 => flat.to_vec1::<f32>()?,
            _ => flat.to_dtype(DType::F32)?.to_vec1::<f32>()?,
        };
        Ok(values)
    }

    /// Overwrite the buffer with `values`, converting to the native dtype.
    ///
    /// # Errors
    ///
    /// Returns [`RwkvError::SizeMismatch`] if `values.len()` differs from the
    /// slot's element count, or [`RwkvError::Tensor`] on conversion failure.
    pub fn write_f32(&mut self, values: &[f32]) -> Result<()> {
        let expected = self.spec.elem_count();
        if values.len() != expected {
            return Err(RwkvError::SizeMismatch {
                what: self.spec.to_string(),
                expected,
                actual: values.len(),
            });
        }
        let tensor = Tensor::from_slice(values, self.spec.dims.as_slice(), self.tensor.device())?;
        self.tensor = if self.spec.dtype == DType::F32 {
            tensor
        } else {
            tensor.to_dtype(self.spec.dtype)?
        };
        Ok(())
    }

    /// Copy `src`'s buffer into this slot verbatim.
    ///
    /// The destination keeps its own dims; only the element count has to
    /// agree.  No numeric conversion is performed.
    ///
    /// # Errors
    ///
    /// Returns [`RwkvError::SizeMismatch`] on differing element counts and
    /// [`RwkvError::Unsupported`] on differing dtypes.
    pub fn copy_from(&mut self, src: &Self) -> Result<()> {
        if src.spec.elem_count() != self.spec.elem_count() {
            return Err(RwkvError::SizeMismatch {
                what: format!("copy {} -> {}", src.spec, self.spec),
                expected: self.spec.elem_count(),
                actual: src.spec.elem_count(),
            });
        }
        if src.spec.dtype != self.spec.dtype {
            return Err(RwkvError::Unsupported(format!(
                "copy {} -> {} would convert dtype",
                src.spec, self.spec
            )));
        }
        // BORROW: deep copy so the destination never aliases the source buffer
        let copied = src.tensor.copy()?;
        self.tensor = if src.spec.dims == self.spec.dims {
            copied
        } else {
            copied.reshape(self.spec.dims.as_slice())?
        };
        Ok(())
    }

    /// Replace the buffer with a graph-produced tensor after checking it
    /// against the spec.
    pub(crate) fn replace(&mut self, tensor: Tensor) -> Result<()> {
        self.spec.check(&tensor)?;
        self.tensor = tensor;
        Ok(())
    }

    /// Reset the buffer to zeros.
    ///
    /// # Errors
    ///
    /// Returns [`RwkvError::Tensor`] if the zero tensor cannot be created.
    pub fn zero(&mut self) -> Result<()> {
        self.tensor = self.tensor.zeros_like()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// TensorHandleSet
// ---------------------------------------------------------------------------

/// Input and output tensor handles of one graph.
#[derive(Debug, Clone)]
pub struct TensorHandleSet {
    /// Input slots, in graph order.
    inputs: Vec<TensorSlot>,
    /// Output slots, in graph order.
    outputs: Vec<TensorSlot>,
}

impl TensorHandleSet {
    /// Allocate zero-filled slots for every input and output spec.
    ///
    /// # Errors
    ///
    /// Returns [`RwkvError::ResourceExhausted`] if any buffer cannot be
    /// allocated.
    pub fn allocate(inputs: &[TensorSpec], outputs: &[TensorSpec], device: &Device) -> Result<Self> {
        let inputs = inputs
            .iter()
            .cloned()
            .map(|spec| TensorSlot::zeros(spec, device))
            .collect::<Result<Vec<_>>>()?;
        let outputs = outputs
            .iter()
            .cloned()
            .map(|spec| TensorSlot::zeros(spec, device))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { inputs, outputs })
    }

    /// Number of input tensors.
    #[must_use]
    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    /// Number of output tensors.
    #[must_use]
    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    /// All input slots.
    #[must_use]
    pub fn inputs(&self) -> &[TensorSlot] {
        &self.inputs
    }

    /// All output slots.
    #[must_use]
    pub fn outputs(&self) -> &[TensorSlot] {
        &self.outputs
    }

    /// Input slot `idx`.
    ///
    /// # Errors
    ///
    /// Returns [`RwkvError::IndexOutOfBounds`] if `idx` is past the end.
    pub fn input(&self, idx: usize) -> Result<&TensorSlot> {
        let count = self.inputs.len();
        self.inputs
            .get(idx)
            .ok_or(RwkvError::IndexOutOfBounds { kind: "input", index: idx, count })
    }

    /// Mutable input slot `idx`.
    ///
    /// # Errors
    ///
    /// Returns [`RwkvError::IndexOutOfBounds`] if `idx` is past the end.
    pub fn input_mut(&mut self, idx: usize) -> Result<&mut TensorSlot> {
        let count = self.inputs.len();
        self.inputs
            .get_mut(idx)
            .ok_or(RwkvError::IndexOutOfBounds { kind: "input", index: idx, count })
    }

    /// Output slot `idx`.
    ///
    /// # Errors
    ///
    /// Returns [`RwkvError::IndexOutOfBounds`] if `idx` is past the end.
    pub fn output(&self, idx: usize) -> Result<&TensorSlot> {
        let count = self.outputs.len();
        self.outputs
            .get(idx)
            .ok_or(RwkvError::IndexOutOfBounds { kind: "output", index: idx, count })
    }

    /// The last output slot (hidden carry or logits).
    ///
    /// # Errors
    ///
    /// Returns [`RwkvError::Unsupported`] for a graph without outputs.
    pub fn last_output(&self) -> Result<&TensorSlot> {
        self.outputs
            .last()
            .ok_or_else(|| RwkvError::Unsupported("graph has no outputs".into()))
    }

    /// Cheap (reference-counted) clones of the current input tensors, in
    /// graph order, for handing to a graph invocation.
    #[must_use]
    pub fn input_tensors(&self) -> Vec<Tensor> {
        // BORROW: candle tensors are Arc-backed, cloning shares storage
        self.inputs.iter().map(|slot| slot.tensor.clone()).collect()
    }

    /// Copy output `output` into input `input` of the same set.
    ///
    /// # Errors
    ///
    /// Returns [`RwkvError::IndexOutOfBounds`] for bad indices and propagates
    /// [`TensorSlot::copy_from`] failures.
    pub fn copy_output_to_input(&mut self, output: usize, input: usize) -> Result<()> {
        let out_count = self.outputs.len();
        let in_count = self.inputs.len();
        // Disjoint fields: borrowing outputs immutably and inputs mutably is fine.
        let src = self.outputs.get(output).ok_or(RwkvError::IndexOutOfBounds {
            kind: "output",
            index: output,
            count: out_count,
        })?;
        let dst = self.inputs.get_mut(input).ok_or(RwkvError::IndexOutOfBounds {
            kind: "input",
            index: input,
            count: in_count,
        })?;
        dst.copy_from(src)
    }

    /// Store the tensors produced by a graph invocation.
    ///
    /// # Errors
    ///
    /// Returns [`RwkvError::Unsupported`] if the graph returned the wrong
    /// number of tensors or a tensor that does not match its spec.
    pub fn store_outputs(&mut self, produced: Vec<Tensor>) -> Result<()> {
        if produced.len() != self.outputs.len() {
            return Err(RwkvError::Unsupported(format!(
                "graph produced {} outputs, expected {}",
                produced.len(),
                self.outputs.len()
            )));
        }
        for (slot, tensor) in self.outputs.iter_mut().zip(produced) {
            slot.replace(tensor)?;
        }
        Ok(())
    }

    /// Zero every input and output buffer.
    ///
    /// # Errors
    ///
    /// Returns [`RwkvError::Tensor`] if a zero tensor cannot be created.
    pub fn zero_all(&mut self) -> Result<()> {
        for slot in self.inputs.iter_mut().chain(self.outputs.iter_mut()) {
            slot.zero()?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
