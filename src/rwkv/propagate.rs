// SPDX-License-Identifier: MIT OR Apache-2.0

//! State propagation schedule: which outputs feed which inputs next step.
//!
//! The schedule depends only on the chunk signatures, the recurrence mode
//! and the state revision, so it is compiled once into a
//! [`PropagationPlan`] and checked against every [`TensorSpec`] up front.
//! Applying a plan then only moves data.
//!
//! ```text
//! fused:         input[k]    ← output[k - 1]               k ≥ 1
//! externalized:  input[3g+1] ← output[4g]                  (main)
//!                input[3g+2] ← wkv(output[4g+2], output[4g+1], input[3g+2])
//!                input[3g+3] ← output[4g+3]                (aux)
//! v6:            input[3g+1] ← output[3g]
//!                input[3g+3] ← output[3g+1]
//!                input[3g+2] ← output[3g+2]
//! ```
//!
//! Every chunk feeds only itself: propagation is temporal (token `t` to
//! token `t + 1`), never across chunks.

use crate::error::{Result, RwkvError};
use crate::tensor::{TensorHandleSet, TensorSpec};

use super::config::{DecayTransform, RecurrenceMode, StateRevision};
use super::wkv;

// ---------------------------------------------------------------------------
// PropagationStep
// ---------------------------------------------------------------------------

/// One data movement of a [`PropagationPlan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropagationStep {
    /// Verbatim copy of an output buffer into an input buffer.
    Copy {
        /// Chunk index.
        chunk: usize,
        /// Source output tensor.
        output: usize,
        /// Destination input tensor.
        input: usize,
    },
    /// Host-side WKV decay-accumulate update of a state input.
    Wkv {
        /// Chunk index.
        chunk: usize,
        /// Output tensor holding `key_value[A, B, C]`.
        key_value: usize,
        /// Output tensor holding `decay[A, B]`.
        decay: usize,
        /// Input tensor holding `state[A, B, C]`, updated in place.
        state: usize,
        /// State extents `[A, B, C]`.
        dims: [usize; 3],
    },
}

// ---------------------------------------------------------------------------
// PropagationPlan
// ---------------------------------------------------------------------------

/// Validated copy/update schedule for every chunk of a model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropagationPlan {
    /// Steps in application order.
    steps: Vec<PropagationStep>,
}

impl PropagationPlan {
    /// Compile the schedule for `chunks` under the given mode and revision.
    ///
    /// # Errors
    ///
    /// Returns [`RwkvError::Unsupported`] if the V6 revision is combined
    /// with more than one chunk or externalized recurrence, if a chunk's
    /// tensor counts do not fit the mode's grouping, or if any copy or WKV
    /// operand has an incompatible shape or dtype.
    pub fn build(
        chunks: &[TensorHandleSet],
        mode: RecurrenceMode,
        revision: StateRevision,
    ) -> Result<Self> {
        let mut steps = Vec::new();
        match (revision, mode) {
            (StateRevision::V6, RecurrenceMode::Fused) => {
                if chunks.len() != 1 {
                    return Err(RwkvError::Unsupported(format!(
                        "RWKV-6 state ordering needs a single chunk, got {}",
                        chunks.len()
                    )));
                }
                for (chunk, set) in chunks.iter().enumerate() {
                    plan_v6(chunk, set, &mut steps)?;
                }
            }
            (StateRevision::V6, _) => {
                return Err(RwkvError::Unsupported(format!(
                    "RWKV-6 state ordering is always fused, not {mode}"
                )));
            }
            (_, RecurrenceMode::Fused) => {
                for (chunk, set) in chunks.iter().enumerate() {
                    plan_fused(chunk, set, &mut steps)?;
                }
            }
            (_, RecurrenceMode::Externalized) => {
                for (chunk, set) in chunks.iter().enumerate() {
                    plan_externalized(chunk, set, &mut steps)?;
                }
            }
        }
        Ok(Self { steps })
    }

    /// The compiled steps, in application order.
    #[must_use]
    pub fn steps(&self) -> &[PropagationStep] {
        &self.steps
    }

    /// Number of compiled steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the plan moves nothing (single-input fused chunks).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run every step against the chunks' handle sets.
    ///
    /// `transform` maps each decay scalar before a WKV update.
    ///
    /// # Errors
    ///
    /// Returns [`RwkvError::IndexOutOfBounds`] if `chunks` is not the set the
    /// plan was built for, and propagates tensor conversion failures.
    pub fn apply(&self, chunks: &mut [TensorHandleSet], transform: DecayTransform) -> Result<()> {
        for step in &self.steps {
            match *step {
                PropagationStep::Copy { chunk, output, input } => {
                    chunk_mut(chunks, chunk)?.copy_output_to_input(output, input)?;
                }
                PropagationStep::Wkv {
                    chunk,
                    key_value,
                    decay,
                    state,
                    dims,
                } => {
                    let set = chunk_mut(chunks, chunk)?;
                    let kv = set.output(key_value)?.to_f32_vec()?;
                    let decay = set.output(decay)?.to_f32_vec()?;
                    let slot = set.input_mut(state)?;
                    // Non-f32 state is widened for the update and narrowed back.
                    let mut values = slot.to_f32_vec()?;
                    wkv::update_state_with(&kv, &decay, &mut values, dims, transform);
                    slot.write_f32(&values)?;
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Per-mode planners
// ---------------------------------------------------------------------------

/// `input[k] ← output[k - 1]` for every carried input.
fn plan_fused(chunk: usize, set: &TensorHandleSet, steps: &mut Vec<PropagationStep>) -> Result<()> {
    for input in 1..set.num_inputs() {
        push_copy(chunk, set, input - 1, input, steps)?;
    }
    Ok(())
}

/// `(main, decay, key_value, aux)` output groups into state triples.
fn plan_externalized(
    chunk: usize,
    set: &TensorHandleSet,
    steps: &mut Vec<PropagationStep>,
) -> Result<()> {
    let groups = set.num_outputs().saturating_sub(1) / 4;
    if set.num_inputs() < 3 * groups + 1 {
        return Err(RwkvError::Unsupported(format!(
            "chunk {chunk}: {} output groups need {} inputs, graph has {}",
            groups,
            3 * groups + 1,
            set.num_inputs()
        )));
    }
    for g in 0..groups {
        push_copy(chunk, set, 4 * g, 3 * g + 1, steps)?;

        let (key_value, decay, state) = (4 * g + 2, 4 * g + 1, 3 * g + 2);
        let dims = wkv_dims(
            set.input(state)?.spec(),
            set.output(key_value)?.spec(),
            set.output(decay)?.spec(),
        )
        .map_err(|e| RwkvError::Unsupported(format!("chunk {chunk} group {g}: {e}")))?;
        steps.push(PropagationStep::Wkv {
            chunk,
            key_value,
            decay,
            state,
            dims,
        });

        push_copy(chunk, set, 4 * g + 3, 3 * g + 3, steps)?;
    }
    Ok(())
}

/// Output triple `[0, 1, 2]` into input slots `[1, 3, 2]`.
fn plan_v6(chunk: usize, set: &TensorHandleSet, steps: &mut Vec<PropagationStep>) -> Result<()> {
    for g in 0..set.num_inputs() / 3 {
        push_copy(chunk, set, 3 * g, 3 * g + 1, steps)?;
        push_copy(chunk, set, 3 * g + 1, 3 * g + 3, steps)?;
        push_copy(chunk, set, 3 * g + 2, 3 * g + 2, steps)?;
    }
    Ok(())
}

/// Validate and record one copy.
fn push_copy(
    chunk: usize,
    set: &TensorHandleSet,
    output: usize,
    input: usize,
    steps: &mut Vec<PropagationStep>,
) -> Result<()> {
    let src = set.output(output).map_err(|e| unsupported_in(chunk, &e))?.spec();
    let dst = set.input(input).map_err(|e| unsupported_in(chunk, &e))?.spec();
    if !src.is_copy_compatible(dst) {
        return Err(RwkvError::Unsupported(format!(
            "chunk {chunk}: cannot carry output {src} into input {dst}"
        )));
    }
    steps.push(PropagationStep::Copy { chunk, output, input });
    Ok(())
}

/// State extents `[A, B, C]`, checked against the key-value and decay
/// operands.  Leading axes beyond the last three are folded into `A`.
fn wkv_dims(
    state: &TensorSpec,
    key_value: &TensorSpec,
    decay: &TensorSpec,
) -> std::result::Result<[usize; 3], String> {
    let [leading @ .., b, c] = state.dims.as_slice() else {
        return Err(format!("state {state} must have rank 3"));
    };
    if leading.is_empty() {
        return Err(format!("state {state} must have rank 3"));
    }
    let a: usize = leading.iter().product();
    let (b, c) = (*b, *c);
    if key_value.elem_count() != a * b * c {
        return Err(format!("key-value {key_value} does not match state {state}"));
    }
    if decay.elem_count() != a * b {
        return Err(format!("decay {decay} does not match state {state}"));
    }
    Ok([a, b, c])
}

/// Re-tag a handle lookup failure as a signature problem of `chunk`.
fn unsupported_in(chunk: usize, err: &RwkvError) -> RwkvError {
    RwkvError::Unsupported(format!("chunk {chunk}: {err}"))
}

/// Handle set of `chunk`.
fn chunk_mut(chunks: &mut [TensorHandleSet], chunk: usize) -> Result<&mut TensorHandleSet> {
    let count = chunks.len();
    chunks.get_mut(chunk).ok_or(RwkvError::IndexOutOfBounds {
        kind: "chunk",
        index: chunk,
        count,
    })
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
    use candle_core::{Device, Tensor};

    use super::*;

    fn handles(inputs: &[TensorSpec], outputs: &[TensorSpec]) -> TensorHandleSet {
        TensorHandleSet::allocate(inputs, outputs, &Device::Cpu).unwrap()
    }

    /// Single fused chunk: embedding plus `n` states of width 4, `n + 1` outputs.
    fn fused_chunk(n: usize) -> TensorHandleSet {
        let mut inputs = vec![TensorSpec::f32("emb", &[4])];
        let mut outputs = Vec::new();
        for i in 0..n {
            inputs.push(TensorSpec::f32(format!("state_{i}_in"), &[4]));
            outputs.push(TensorSpec::f32(format!("state_{i}_out"), &[1, 4]));
        }
        outputs.push(TensorSpec::f32("logits", &[8]));
        handles(&inputs, &outputs)
    }

    /// Externalized chunk with `groups` layers of `[2, 2, 3]` WKV state.
    fn externalized_chunk(groups: usize) -> TensorHandleSet {
        let mut inputs = vec![TensorSpec::f32("emb", &[4])];
        let mut outputs = Vec::new();
        for g in 0..groups {
            inputs.push(TensorSpec::f32(format!("att_x_{g}"), &[4]));
            inputs.push(TensorSpec::f32(format!("wkv_{g}"), &[2, 2, 3]));
            inputs.push(TensorSpec::f32(format!("ffn_x_{g}"), &[4]));
            outputs.push(TensorSpec::f32(format!("att_x_{g}_out"), &[4]));
            outputs.push(TensorSpec::f32(format!("decay_{g}"), &[2, 2]));
            outputs.push(TensorSpec::f32(format!("kv_{g}"), &[2, 2, 3]));
            outputs.push(TensorSpec::f32(format!("ffn_x_{g}_out"), &[4]));
        }
        outputs.push(TensorSpec::f32("logits", &[8]));
        handles(&inputs, &outputs)
    }

    fn fill(set: &mut TensorHandleSet, seed: f32) {
        let produced: Vec<Tensor> = set
            .outputs()
            .iter()
            .enumerate()
            .map(|(i, slot)| {
                let spec = slot.spec();
                #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
                let values: Vec<f32> = (0..spec.elem_count())
                    .map(|j| seed + (i * 100 + j) as f32)
                    .collect();
                Tensor::from_slice(&values, spec.dims.as_slice(), &Device::Cpu).unwrap()
            })
            .collect();
        set.store_outputs(produced).unwrap();
    }

    #[test]
    fn fused_plan_shifts_by_one() {
        let chunks = vec![fused_chunk(3)];
        let plan = PropagationPlan::build(&chunks, RecurrenceMode::Fused, StateRevision::Standard)
            .unwrap();
        assert_eq!(
            plan.steps(),
            &[
                PropagationStep::Copy { chunk: 0, output: 0, input: 1 },
                PropagationStep::Copy { chunk: 0, output: 1, input: 2 },
                PropagationStep::Copy { chunk: 0, output: 2, input: 3 },
            ]
        );
    }

    #[test]
    fn fused_apply_copies_sentinels() {
        let mut chunks = vec![fused_chunk(2)];
        let plan = PropagationPlan::build(&chunks, RecurrenceMode::Fused, StateRevision::Standard)
            .unwrap();
        fill(&mut chunks[0], 0.125);
        plan.apply(&mut chunks, DecayTransform::AsIs).unwrap();
        for k in 1..3 {
            let expected = chunks[0].output(k - 1).unwrap().to_f32_vec().unwrap();
            let actual = chunks[0].input(k).unwrap().to_f32_vec().unwrap();
            assert_eq!(actual, expected, "input {k}");
            assert_eq!(chunks[0].input(k).unwrap().tensor().dims(), &[4]);
        }
        // Input 0 is never carried.
        assert_eq!(chunks[0].input(0).unwrap().to_f32_vec().unwrap(), vec![0.0; 4]);
    }

    #[test]
    fn externalized_plan_groups() {
        let chunks = vec![externalized_chunk(2)];
        let plan =
            PropagationPlan::build(&chunks, RecurrenceMode::Externalized, StateRevision::Standard)
                .unwrap();
        assert_eq!(plan.len(), 6);
        assert_eq!(
            plan.steps()[3..],
            [
                PropagationStep::Copy { chunk: 0, output: 4, input: 4 },
                PropagationStep::Wkv {
                    chunk: 0,
                    key_value: 6,
                    decay: 5,
                    state: 5,
                    dims: [2, 2, 3],
                },
                PropagationStep::Copy { chunk: 0, output: 7, input: 6 },
            ]
        );
    }

    #[test]
    fn externalized_apply_runs_wkv() {
        let mut chunks = vec![externalized_chunk(1)];
        let plan =
            PropagationPlan::build(&chunks, RecurrenceMode::Externalized, StateRevision::Standard)
                .unwrap();
        chunks[0].input_mut(2).unwrap().write_f32(&[1.0; 12]).unwrap();
        fill(&mut chunks[0], 0.0);
        plan.apply(&mut chunks, DecayTransform::AsIs).unwrap();

        let decay = chunks[0].output(1).unwrap().to_f32_vec().unwrap();
        let kv = chunks[0].output(2).unwrap().to_f32_vec().unwrap();
        let state = chunks[0].input(2).unwrap().to_f32_vec().unwrap();
        for i in 0..12 {
            assert_eq!(state[i], decay[i / 3] + kv[i], "element {i}");
        }
        assert_eq!(
            chunks[0].input(1).unwrap().to_f32_vec().unwrap(),
            chunks[0].output(0).unwrap().to_f32_vec().unwrap()
        );
        assert_eq!(
            chunks[0].input(3).unwrap().to_f32_vec().unwrap(),
            chunks[0].output(3).unwrap().to_f32_vec().unwrap()
        );
    }

    #[test]
    fn v6_plan_permutes_triples() {
        let spec = |name: &str| TensorSpec::f32(name, &[4]);
        let inputs: Vec<_> = (0..7).map(|i| spec(&format!("in_{i}"))).collect();
        let outputs: Vec<_> = (0..7).map(|i| spec(&format!("out_{i}"))).collect();
        let chunks = vec![handles(&inputs, &outputs)];
        let plan =
            PropagationPlan::build(&chunks, RecurrenceMode::Fused, StateRevision::V6).unwrap();
        let pairs: Vec<_> = plan
            .steps()
            .iter()
            .map(|s| match *s {
                PropagationStep::Copy { output, input, .. } => (output, input),
                PropagationStep::Wkv { .. } => panic!("v6 never runs wkv"),
            })
            .collect();
        assert_eq!(pairs, vec![(0, 1), (1, 3), (2, 2), (3, 4), (4, 6), (5, 5)]);
    }

    #[test]
    fn v6_rejects_chunking_and_externalized() {
        let chunks = vec![fused_chunk(3), fused_chunk(3)];
        assert!(matches!(
            PropagationPlan::build(&chunks, RecurrenceMode::Fused, StateRevision::V6),
            Err(RwkvError::Unsupported(_))
        ));
        let chunks = vec![externalized_chunk(1)];
        assert!(matches!(
            PropagationPlan::build(&chunks, RecurrenceMode::Externalized, StateRevision::V6),
            Err(RwkvError::Unsupported(_))
        ));
    }

    #[test]
    fn incompatible_copy_is_rejected() {
        let chunks = vec![handles(
            &[TensorSpec::f32("emb", &[4]), TensorSpec::f16("state", &[4])],
            &[TensorSpec::f32("state_out", &[4]), TensorSpec::f32("logits", &[8])],
        )];
        assert!(matches!(
            PropagationPlan::build(&chunks, RecurrenceMode::Fused, StateRevision::Standard),
            Err(RwkvError::Unsupported(_))
        ));
    }

    #[test]
    fn wkv_operands_are_checked() {
        let chunks = vec![handles(
            &[
                TensorSpec::f32("emb", &[4]),
                TensorSpec::f32("att_x", &[4]),
                TensorSpec::f32("wkv", &[12]),
                TensorSpec::f32("ffn_x", &[4]),
            ],
            &[
                TensorSpec::f32("att_x_out", &[4]),
                TensorSpec::f32("decay", &[4]),
                TensorSpec::f32("kv", &[12]),
                TensorSpec::f32("ffn_x_out", &[4]),
                TensorSpec::f32("logits", &[8]),
            ],
        )];
        let err =
            PropagationPlan::build(&chunks, RecurrenceMode::Externalized, StateRevision::Standard)
                .unwrap_err();
        assert!(err.to_string().contains("rank 3"), "{err}");
    }

    #[test]
    fn wkv_dims_fold_leading_axes() {
        let dims = wkv_dims(
            &TensorSpec::f32("s", &[1, 2, 3, 4]),
            &TensorSpec::f32("kv", &[24]),
            &TensorSpec::f32("w", &[2, 3]),
        )
        .unwrap();
        assert_eq!(dims, [2, 3, 4]);
    }

    #[test]
    fn apply_to_wrong_chunk_set_fails() {
        let chunks = vec![fused_chunk(1), fused_chunk(1)];
        let plan = PropagationPlan::build(&chunks, RecurrenceMode::Fused, StateRevision::Standard)
            .unwrap();
        let mut fewer = vec![fused_chunk(1)];
        assert!(matches!(
            plan.apply(&mut fewer, DecayTransform::AsIs),
            Err(RwkvError::IndexOutOfBounds { kind: "chunk", .. })
        ));
    }
}
