// SPDX-License-Identifier: MIT OR Apache-2.0

//! Chunked RWKV runner.
//!
//! Drives single-token inference of an RWKV model that has been compiled
//! into one or more graphs ("chunks"), threading recurrent state between
//! calls.
//!
//! # Step
//!
//! ```text
//! token → embedding row → chunk 0 input 0
//!   → for each chunk i:
//!       → (i > 0) chunk i-1 last output → chunk i input 0
//!       → execute graph i
//!   → final chunk last output (logits)
//! propagate: each chunk's outputs → its own inputs for the next token
//!            (fused copy, externalized WKV update, or RWKV-6 permutation)
//! ```
//!
//! [`ChunkedRwkv::execute`] and [`ChunkedRwkv::propagate`] form one step
//! and must alternate; [`ChunkedRwkv::step`] runs both.

pub mod config;
pub mod propagate;
pub mod wkv;

use std::fmt;
use std::time::{Duration, Instant};

use candle_core::Device;

use crate::backend::ComputeGraph;
use crate::config::RunnerConfig;
use crate::embedding::EmbeddingTable;
use crate::error::{Result, RwkvError};
use crate::tensor::{TensorHandleSet, TensorSlot};
use crate::topology::{ChunkLayout, TensorLocation};

pub use config::{DecayTransform, RecurrenceMode, StateRevision};
pub use propagate::{PropagationPlan, PropagationStep};

// ---------------------------------------------------------------------------
// StepPhase
// ---------------------------------------------------------------------------

/// Where the runner is within the `execute` → `propagate` cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StepPhase {
    /// Nothing executed since construction or [`ChunkedRwkv::reset`].
    #[default]
    Idle,
    /// Outputs are fresh and not yet carried into the inputs.
    Executed,
    /// Outputs have been carried; the next call must be `execute`.
    Propagated,
    /// The last `execute` or `propagate` failed part-way.
    Failed,
}

// ---------------------------------------------------------------------------
// ChunkedRwkv
// ---------------------------------------------------------------------------

/// An RWKV model split across a chain of compiled graphs.
///
/// Owns every graph, every tensor buffer and the embedding table; nothing
/// is shared between instances.
///
/// # Example
///
/// ```
/// use candle_core::Device;
/// use rwkv_chunks::{
///     ChunkedRwkv, ComputeGraph, EmbeddingTable, HostGraph, RunnerConfig, TensorSpec,
/// };
///
/// # fn main() -> rwkv_chunks::Result<()> {
/// // One fused chunk: state' = state + x, logits = state'.
/// let graph = HostGraph::new(
///     "accumulate",
///     vec![TensorSpec::f32("x", &[2]), TensorSpec::f32("state", &[2])],
///     vec![TensorSpec::f32("state_out", &[2]), TensorSpec::f32("logits", &[2])],
///     |inputs| {
///         let state = (&inputs[1] + &inputs[0])?;
///         Ok(vec![state.clone(), state])
///     },
/// );
/// let graphs: Vec<Box<dyn ComputeGraph>> = vec![Box::new(graph)];
/// let table = EmbeddingTable::from_vec(vec![0.0, 0.0, 1.0, 2.0], 2)?;
/// let mut model = ChunkedRwkv::new(graphs, RunnerConfig::default(), &Device::Cpu)?
///     .with_embedding(table);
///
/// assert_eq!(model.step(1)?, vec![1.0, 2.0]);
/// assert_eq!(model.step(1)?, vec![2.0, 4.0]);
/// # Ok(())
/// # }
/// ```
pub struct ChunkedRwkv {
    /// Compiled graphs, in chunk order.
    // TRAIT_OBJECT: graphs come from heterogeneous backends
    graphs: Vec<Box<dyn ComputeGraph>>,
    /// Tensor buffers, one handle set per graph.
    tensors: Vec<TensorHandleSet>,
    /// Logical index resolution over the chain.
    layout: ChunkLayout,
    /// How recurrence is carried.
    mode: RecurrenceMode,
    /// Compiled propagation schedule.
    plan: PropagationPlan,
    /// Runner configuration.
    config: RunnerConfig,
    /// Embedding table; `None` until first needed.
    embedding: Option<EmbeddingTable>,
    /// Position in the step cycle.
    phase: StepPhase,
    /// Whether any execute has succeeded since the last reset.
    inferred: bool,
    /// Final chunk's last output after the last successful execute.
    last_output: Vec<f32>,
    /// Wall-clock time of the last successful multi-chunk pass.
    last_inference_time: Duration,
}

impl ChunkedRwkv {
    /// Assemble a runner from compiled graphs.
    ///
    /// Allocates a zeroed buffer for every input and output, resolves the
    /// recurrence mode (from `config` or the chunk-0 signature) and compiles
    /// the propagation plan.
    ///
    /// # Errors
    ///
    /// Returns [`RwkvError::InvalidArgument`] for an empty or over-long
    /// chain, [`RwkvError::Unsupported`] if the recurrence mode cannot be
    /// inferred, chunk boundaries do not line up, or the state tensors do
    /// not fit the mode, and [`RwkvError::ResourceExhausted`] if a buffer
    /// cannot be allocated.
    // TRAIT_OBJECT: graphs come from heterogeneous backends
    pub fn new(
        graphs: Vec<Box<dyn ComputeGraph>>,
        config: RunnerConfig,
        device: &Device,
    ) -> Result<Self> {
        let layout = ChunkLayout::new(
            graphs.iter().map(|g| g.inputs().len()).collect(),
            graphs.iter().map(|g| g.outputs().len()).collect(),
        )?;

        let tensors = graphs
            .iter()
            .map(|g| TensorHandleSet::allocate(g.inputs(), g.outputs(), device))
            .collect::<Result<Vec<_>>>()?;
        check_boundaries(&tensors)?;

        let mode = match config.recurrence {
            Some(mode) => mode,
            None => {
                let (inputs, outputs) = tensors
                    .first()
                    .map_or((0, 0), |set| (set.num_inputs(), set.num_outputs()));
                RecurrenceMode::infer(inputs, outputs).ok_or_else(|| {
                    RwkvError::Unsupported(format!(
                        "cannot infer recurrence mode from {inputs} inputs and {outputs} outputs"
                    ))
                })?
            }
        };
        let plan = PropagationPlan::build(&tensors, mode, config.revision)?;

        tracing::info!(
            chunks = graphs.len(),
            mode = %mode,
            revision = %config.revision,
            inputs = layout.logical_input_count(),
            outputs = layout.logical_output_count(),
            propagation_steps = plan.len(),
            "assembled chunked RWKV model"
        );

        Ok(Self {
            graphs,
            tensors,
            layout,
            mode,
            plan,
            config,
            embedding: None,
            phase: StepPhase::Idle,
            inferred: false,
            last_output: Vec::new(),
            last_inference_time: Duration::ZERO,
        })
    }

    /// Use a preloaded embedding table instead of the configured side file.
    #[must_use]
    pub fn with_embedding(mut self, table: EmbeddingTable) -> Self {
        self.embedding = Some(table);
        self
    }

    // --- Step ------------------------------------------------------------

    /// Run one token through every chunk.
    ///
    /// Writes the embedding row for `token` into chunk 0's first input
    /// (or, for a single-element first input, the token id itself); with no
    /// embedding table the caller must have filled that input via
    /// [`set_input`](Self::set_input).  Chunks then run in order, each later
    /// chunk receiving its predecessor's last output as input 0.
    ///
    /// # Errors
    ///
    /// Returns [`RwkvError::InvalidArgument`] if `token` is outside the
    /// embedding table or configured vocabulary; buffers are untouched in
    /// that case.  Returns [`RwkvError::Execution`] if a chunk fails or
    /// produces malformed outputs: the pass is aborted, later chunks do not
    /// run, and [`propagate`](Self::propagate) becomes a no-op until the
    /// next successful execute.
    pub fn execute(&mut self, token: u32) -> Result<()> {
        self.feed_token(token)?;

        let start = Instant::now();
        for chunk in 0..self.graphs.len() {
            if let Err(source) = self.run_chunk(chunk) {
                self.phase = StepPhase::Failed;
                return Err(RwkvError::Execution {
                    chunk,
                    source: Box::new(source),
                });
            }
        }
        let elapsed = start.elapsed();

        let TensorLocation { graph, tensor } = self.layout.final_output();
        self.last_output = self.handles(graph)?.output(tensor)?.to_f32_vec()?;
        self.last_inference_time = elapsed;
        self.phase = StepPhase::Executed;
        self.inferred = true;

        tracing::debug!(
            token,
            elapsed_ms = elapsed.as_secs_f64() * 1000.0,
            "executed {} chunk(s)",
            self.graphs.len()
        );
        Ok(())
    }

    /// Carry every chunk's outputs into its own inputs for the next token.
    ///
    /// A no-op unless the previous call was a successful
    /// [`execute`](Self::execute): nothing has run yet, the last execute
    /// failed, or this step was already propagated.  This keeps the WKV
    /// accumulation from being applied twice.
    ///
    /// # Errors
    ///
    /// Propagates tensor conversion failures from the WKV update.
    pub fn propagate(&mut self) -> Result<()> {
        match self.phase {
            StepPhase::Executed => {}
            StepPhase::Idle => return Ok(()),
            phase => {
                tracing::warn!(?phase, "propagate skipped: no fresh outputs");
                return Ok(());
            }
        }
        if let Err(e) = self.plan.apply(&mut self.tensors, self.config.decay_transform) {
            self.phase = StepPhase::Failed;
            return Err(e);
        }
        self.phase = StepPhase::Propagated;
        Ok(())
    }

    /// [`execute`](Self::execute) then [`propagate`](Self::propagate),
    /// returning the final output of this token.
    ///
    /// # Errors
    ///
    /// Returns the first error of either phase.
    pub fn step(&mut self, token: u32) -> Result<Vec<f32>> {
        self.execute(token)?;
        let logits = self.last_output.clone();
        self.propagate()?;
        Ok(logits)
    }

    /// Zero every buffer and forget the step history.
    ///
    /// The embedding table and compiled plan are kept.
    ///
    /// # Errors
    ///
    /// Returns [`RwkvError::Tensor`] if a buffer cannot be zeroed.
    pub fn reset(&mut self) -> Result<()> {
        for set in &mut self.tensors {
            set.zero_all()?;
        }
        self.phase = StepPhase::Idle;
        self.inferred = false;
        self.last_output.clear();
        Ok(())
    }

    // --- Logical I/O -----------------------------------------------------

    /// Number of logical inputs.
    #[must_use]
    pub fn input_count(&self) -> usize {
        self.layout.logical_input_count()
    }

    /// Number of logical outputs.
    #[must_use]
    pub fn output_count(&self) -> usize {
        self.layout.logical_output_count()
    }

    /// Shape of logical input `idx`.
    ///
    /// # Errors
    ///
    /// Returns [`RwkvError::IndexOutOfBounds`] if `idx` is past the end.
    pub fn input_shape(&self, idx: usize) -> Result<Vec<usize>> {
        Ok(self.input_slot(idx)?.dims().to_vec())
    }

    /// Shape of logical output `idx`.
    ///
    /// # Errors
    ///
    /// Returns [`RwkvError::IndexOutOfBounds`] if `idx` is past the end.
    pub fn output_shape(&self, idx: usize) -> Result<Vec<usize>> {
        Ok(self.output_slot(idx)?.dims().to_vec())
    }

    /// Copy logical output `idx` into `buf` as `f32`.
    ///
    /// Fills `buf.len()` elements from the start of the tensor, converting
    /// from its native dtype.
    ///
    /// # Errors
    ///
    /// Returns [`RwkvError::IndexOutOfBounds`] if `idx` is past the end,
    /// [`RwkvError::SizeMismatch`] if `buf` is longer than the tensor, and
    /// [`RwkvError::Tensor`] if the dtype cannot be converted.
    pub fn read_output(&self, idx: usize, buf: &mut [f32]) -> Result<()> {
        let slot = self.output_slot(idx)?;
        let available = slot.spec().elem_count();
        if buf.len() > available {
            return Err(RwkvError::SizeMismatch {
                what: slot.spec().to_string(),
                expected: available,
                actual: buf.len(),
            });
        }
        let values = slot.to_f32_vec()?;
        for (dst, src) in buf.iter_mut().zip(values) {
            *dst = src;
        }
        Ok(())
    }

    /// Logical output `idx` as an owned `f32` vector.
    ///
    /// # Errors
    ///
    /// Same as [`read_output`](Self::read_output), minus the size check.
    pub fn output(&self, idx: usize) -> Result<Vec<f32>> {
        self.output_slot(idx)?.to_f32_vec()
    }

    /// Current content of logical input `idx` as `f32`.
    ///
    /// # Errors
    ///
    /// Returns [`RwkvError::IndexOutOfBounds`] if `idx` is past the end and
    /// [`RwkvError::Tensor`] if the dtype cannot be converted.
    pub fn input(&self, idx: usize) -> Result<Vec<f32>> {
        self.input_slot(idx)?.to_f32_vec()
    }

    /// Overwrite logical input `idx`, converting to its native dtype.
    ///
    /// # Errors
    ///
    /// Returns [`RwkvError::IndexOutOfBounds`] if `idx` is past the end and
    /// [`RwkvError::SizeMismatch`] unless `values` holds exactly the
    /// tensor's element count.
    pub fn set_input(&mut self, idx: usize, values: &[f32]) -> Result<()> {
        let TensorLocation { graph, tensor } = self.layout.resolve_input(idx)?;
        self.handles_mut(graph)?.input_mut(tensor)?.write_f32(values)
    }

    // --- Accessors -------------------------------------------------------

    /// Final chunk's last output (usually logits) from the last successful
    /// execute; empty before the first one.
    #[must_use]
    pub fn last_output(&self) -> &[f32] {
        &self.last_output
    }

    /// Wall-clock time of the last successful execute.
    #[must_use]
    pub const fn last_inference_time(&self) -> Duration {
        self.last_inference_time
    }

    /// Whether any execute has succeeded since construction or reset.
    #[must_use]
    pub const fn has_inferred(&self) -> bool {
        self.inferred
    }

    /// Current position in the step cycle.
    #[must_use]
    pub const fn phase(&self) -> StepPhase {
        self.phase
    }

    /// Recurrence mode in effect.
    #[must_use]
    pub const fn recurrence_mode(&self) -> RecurrenceMode {
        self.mode
    }

    /// State ordering in effect.
    #[must_use]
    pub const fn revision(&self) -> StateRevision {
        self.config.revision
    }

    /// Number of chunks.
    #[must_use]
    pub fn num_chunks(&self) -> usize {
        self.graphs.len()
    }

    /// Logical index layout.
    #[must_use]
    pub const fn layout(&self) -> &ChunkLayout {
        &self.layout
    }

    /// Compiled propagation schedule.
    #[must_use]
    pub const fn plan(&self) -> &PropagationPlan {
        &self.plan
    }

    /// Runner configuration.
    #[must_use]
    pub const fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// The embedding table, once loaded.
    #[must_use]
    pub const fn embedding(&self) -> Option<&EmbeddingTable> {
        self.embedding.as_ref()
    }

    // --- Internals -------------------------------------------------------

    /// Load the embedding table on first use.
    ///
    /// A table is only looked for when chunk 0's first input is a vector of
    /// more than one element; its length is the embedding width.
    fn ensure_embedding(&mut self) -> Result<()> {
        if self.embedding.is_some() {
            return Ok(());
        }
        let dims = self.handles(0)?.input(0)?.dims();
        let width = match dims {
            [width] if *width != 1 => Some(*width),
            _ => None,
        };
        let table = match (width, &self.config.embedding_path) {
            (Some(width), Some(path)) => EmbeddingTable::load(path, width)?,
            (Some(width), None) => EmbeddingTable::empty(width),
            (None, _) => EmbeddingTable::default(),
        };
        self.embedding = Some(table);
        Ok(())
    }

    /// Validate `token` and write its input into chunk 0.
    fn feed_token(&mut self, token: u32) -> Result<()> {
        self.ensure_embedding()?;
        let idx = usize::try_from(token)
            .map_err(|_| RwkvError::InvalidArgument(format!("token {token} overflows usize")))?;
        if let Some(vocab_size) = self.config.vocab_size {
            if idx >= vocab_size {
                return Err(RwkvError::InvalidArgument(format!(
                    "token {token} outside vocabulary of {vocab_size}"
                )));
            }
        }

        let table = self.embedding.as_ref();
        let first = self
            .tensors
            .first_mut()
            .ok_or_else(|| RwkvError::Unsupported("model has no chunks".into()))?
            .input_mut(0)?;
        match table {
            Some(table) if !table.is_empty() => {
                let row = table.row(idx).ok_or_else(|| {
                    RwkvError::InvalidArgument(format!(
                        "token {token} outside embedding table of {} rows",
                        table.len()
                    ))
                })?;
                first.write_f32(row)
            }
            _ if first.spec().elem_count() == 1 => first.write_f32(&[token_value(token)]),
            // Pre-embedded input supplied by the caller.
            _ => Ok(()),
        }
    }

    /// Carry the boundary tensor into `chunk` and run its graph.
    fn run_chunk(&mut self, chunk: usize) -> Result<()> {
        if chunk > 0 {
            let (done, rest) = self.tensors.split_at_mut(chunk);
            if let (Some(prev), Some(cur)) = (done.last(), rest.first_mut()) {
                cur.input_mut(0)?.copy_from(prev.last_output()?)?;
            }
        }
        let count = self.graphs.len();
        let graph = self.graphs.get(chunk).ok_or(RwkvError::IndexOutOfBounds {
            kind: "chunk",
            index: chunk,
            count,
        })?;
        let set = self.tensors.get_mut(chunk).ok_or(RwkvError::IndexOutOfBounds {
            kind: "chunk",
            index: chunk,
            count,
        })?;
        let produced = graph.execute(&set.input_tensors())?;
        set.store_outputs(produced)
    }

    /// Handle set of `graph`.
    fn handles(&self, graph: usize) -> Result<&TensorHandleSet> {
        let count = self.tensors.len();
        self.tensors.get(graph).ok_or(RwkvError::IndexOutOfBounds {
            kind: "chunk",
            index: graph,
            count,
        })
    }

    /// Mutable handle set of `graph`.
    fn handles_mut(&mut self, graph: usize) -> Result<&mut TensorHandleSet> {
        let count = self.tensors.len();
        self.tensors.get_mut(graph).ok_or(RwkvError::IndexOutOfBounds {
            kind: "chunk",
            index: graph,
            count,
        })
    }

    /// Slot behind logical input `idx`.
    fn input_slot(&self, idx: usize) -> Result<&TensorSlot> {
        let TensorLocation { graph, tensor } = self.layout.resolve_input(idx)?;
        self.handles(graph)?.input(tensor)
    }

    /// Slot behind logical output `idx`.
    fn output_slot(&self, idx: usize) -> Result<&TensorSlot> {
        let TensorLocation { graph, tensor } = self.layout.resolve_output(idx)?;
        self.handles(graph)?.output(tensor)
    }
}

impl fmt::Debug for ChunkedRwkv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.graphs.iter().map(|g| g.name()).collect();
        f.debug_struct("ChunkedRwkv")
            .field("graphs", &names)
            .field("mode", &self.mode)
            .field("revision", &self.config.revision)
            .field("phase", &self.phase)
            .field("inferred", &self.inferred)
            .finish_non_exhaustive()
    }
}

/// Every chunk after the first takes its predecessor's last output as
/// input 0; both sides must agree in element count and dtype.
fn check_boundaries(tensors: &[TensorHandleSet]) -> Result<()> {
    for (i, pair) in tensors.windows(2).enumerate() {
        let [prev, cur] = pair else { continue };
        let carry_out = prev.last_output()?.spec();
        let carry_in = cur.input(0)?.spec();
        if !carry_out.is_copy_compatible(carry_in) {
            return Err(RwkvError::Unsupported(format!(
                "chunk {i} output {carry_out} cannot feed chunk {} input {carry_in}",
                i + 1
            )));
        }
    }
    Ok(())
}

/// Token id as written into a single-element id input.
#[allow(clippy::cast_precision_loss, clippy::as_conversions)]
const fn token_value(token: u32) -> f32 {
    token as f32
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::float_cmp
)]
mod tests {
    use candle_core::DType;

    use super::*;
    use crate::backend::HostGraph;
    use crate::tensor::TensorSpec;

    /// Width-4 embedding table whose row `t` is `[t, t, t, t]`.
    fn table(rows: usize) -> EmbeddingTable {
        #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
        let data = (0..rows).flat_map(|t| [t as f32; 4]).collect();
        EmbeddingTable::from_vec(data, 4).unwrap()
    }

    /// Fused chunk: `state' = state + x`, `logits = 2 * state'`.
    fn accumulate_graph() -> HostGraph {
        HostGraph::new(
            "accumulate",
            vec![TensorSpec::f32("x", &[4]), TensorSpec::f32("state", &[4])],
            vec![TensorSpec::f32("state_out", &[4]), TensorSpec::f32("logits", &[4])],
            |inputs| {
                let state = (&inputs[1] + &inputs[0])?;
                let logits = (&state * 2.0)?;
                Ok(vec![state, logits])
            },
        )
    }

    fn runner(graphs: Vec<Box<dyn ComputeGraph>>) -> ChunkedRwkv {
        ChunkedRwkv::new(graphs, RunnerConfig::default(), &Device::Cpu)
            .unwrap()
            .with_embedding(table(8))
    }

    #[test]
    fn single_chunk_token_five() {
        let mut model = runner(vec![Box::new(accumulate_graph())]);
        assert_eq!(model.recurrence_mode(), RecurrenceMode::Fused);
        assert!(!model.has_inferred());

        model.execute(5).unwrap();
        assert!(model.has_inferred());
        assert_eq!(model.phase(), StepPhase::Executed);
        assert_eq!(model.last_output(), &[10.0; 4]);

        model.propagate().unwrap();
        let carried = model.tensors[0].input(1).unwrap().to_f32_vec().unwrap();
        assert_eq!(carried, model.output(0).unwrap());
        assert_eq!(carried, vec![5.0; 4]);
    }

    #[test]
    fn state_accumulates_across_steps() {
        let mut model = runner(vec![Box::new(accumulate_graph())]);
        assert_eq!(model.step(1).unwrap(), vec![2.0; 4]);
        assert_eq!(model.step(2).unwrap(), vec![6.0; 4]);
        assert_eq!(model.step(3).unwrap(), vec![12.0; 4]);
    }

    #[test]
    fn propagate_before_execute_is_noop() {
        let mut model = runner(vec![Box::new(accumulate_graph())]);
        model.propagate().unwrap();
        assert_eq!(model.phase(), StepPhase::Idle);
        assert_eq!(model.tensors[0].input(1).unwrap().to_f32_vec().unwrap(), vec![0.0; 4]);
    }

    #[test]
    fn bad_token_leaves_phase() {
        let mut model = runner(vec![Box::new(accumulate_graph())]);
        model.execute(1).unwrap();
        assert!(matches!(model.execute(8), Err(RwkvError::InvalidArgument(_))));
        assert_eq!(model.phase(), StepPhase::Executed);
    }

    #[test]
    fn failing_chunk_aborts_and_blocks_propagation() {
        let failing = HostGraph::new(
            "broken",
            vec![TensorSpec::f32("x", &[4]), TensorSpec::f32("state", &[4])],
            vec![TensorSpec::f32("state_out", &[4]), TensorSpec::f32("logits", &[4])],
            |_| Err(RwkvError::Unsupported("device lost".into())),
        );
        let mut model = runner(vec![Box::new(accumulate_graph()), Box::new(failing)]);
        let err = model.execute(3).unwrap_err();
        assert!(matches!(err, RwkvError::Execution { chunk: 1, .. }), "{err}");
        assert_eq!(model.phase(), StepPhase::Failed);
        assert!(!model.has_inferred());
        assert!(model.last_output().is_empty());

        model.propagate().unwrap();
        assert_eq!(model.tensors[0].input(1).unwrap().to_f32_vec().unwrap(), vec![0.0; 4]);
    }

    #[test]
    fn malformed_outputs_are_execution_failures() {
        let wrong_shape = HostGraph::new(
            "wrong",
            vec![TensorSpec::f32("x", &[4]), TensorSpec::f32("state", &[4])],
            vec![TensorSpec::f32("state_out", &[4]), TensorSpec::f32("logits", &[4])],
            |inputs| Ok(vec![inputs[1].clone(), inputs[0].reshape((2, 2))?]),
        );
        let mut model = runner(vec![Box::new(wrong_shape)]);
        assert!(matches!(
            model.execute(0),
            Err(RwkvError::Execution { chunk: 0, .. })
        ));
    }

    #[test]
    fn single_element_input_receives_token_id() {
        let graph = HostGraph::new(
            "token_in",
            vec![TensorSpec::new("token", &[1], DType::F32)],
            vec![TensorSpec::f32("logits", &[1])],
            |inputs| Ok(vec![inputs[0].clone()]),
        );
        let graphs: Vec<Box<dyn ComputeGraph>> = vec![Box::new(graph)];
        let mut model = ChunkedRwkv::new(graphs, RunnerConfig::default(), &Device::Cpu).unwrap();
        model.execute(42).unwrap();
        assert_eq!(model.last_output(), &[42.0]);
        assert!(model.embedding().unwrap().is_empty());
    }

    #[test]
    fn unknown_signature_needs_explicit_mode() {
        let graph = HostGraph::new(
            "odd",
            vec![TensorSpec::f32("x", &[4])],
            vec![TensorSpec::f32("a", &[4]), TensorSpec::f32("b", &[4])],
            |inputs| Ok(vec![inputs[0].clone(), inputs[0].clone()]),
        );
        let graphs: Vec<Box<dyn ComputeGraph>> = vec![Box::new(graph)];
        assert!(matches!(
            ChunkedRwkv::new(graphs, RunnerConfig::default(), &Device::Cpu),
            Err(RwkvError::Unsupported(_))
        ));
    }

    #[test]
    fn mismatched_boundary_is_rejected() {
        let narrow = HostGraph::new(
            "narrow",
            vec![TensorSpec::f32("hidden", &[2]), TensorSpec::f32("state", &[2])],
            vec![TensorSpec::f32("state_out", &[2]), TensorSpec::f32("logits", &[2])],
            |inputs| Ok(vec![inputs[1].clone(), inputs[0].clone()]),
        );
        let graphs: Vec<Box<dyn ComputeGraph>> =
            vec![Box::new(accumulate_graph()), Box::new(narrow)];
        assert!(matches!(
            ChunkedRwkv::new(graphs, RunnerConfig::default(), &Device::Cpu),
            Err(RwkvError::Unsupported(_))
        ));
    }

    #[test]
    fn reset_clears_state() {
        let mut model = runner(vec![Box::new(accumulate_graph())]);
        model.step(4).unwrap();
        model.reset().unwrap();
        assert_eq!(model.phase(), StepPhase::Idle);
        assert!(!model.has_inferred());
        assert_eq!(model.step(1).unwrap(), vec![2.0; 4]);
    }

    #[test]
    fn inference_time_is_recorded() {
        let slow = HostGraph::new(
            "slow",
            vec![TensorSpec::f32("x", &[4]), TensorSpec::f32("state", &[4])],
            vec![TensorSpec::f32("state_out", &[4]), TensorSpec::f32("logits", &[4])],
            |inputs| {
                std::thread::sleep(Duration::from_millis(2));
                Ok(vec![inputs[1].clone(), inputs[0].clone()])
            },
        );
        let mut model = runner(vec![Box::new(slow)]);
        assert_eq!(model.last_inference_time(), Duration::ZERO);
        model.execute(0).unwrap();
        assert!(model.last_inference_time() >= Duration::from_millis(2));
    }

    #[test]
    fn debug_lists_graph_names() {
        let model = runner(vec![Box::new(accumulate_graph())]);
        let dbg = format!("{model:?}");
        assert!(dbg.contains("accumulate"), "{dbg}");
    }
}
