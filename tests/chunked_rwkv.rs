// SPDX-License-Identifier: MIT OR Apache-2.0

//! Integration tests: drive `ChunkedRwkv` end to end with host-side graphs
//! standing in for compiled accelerator chunks.
//!
//! Run:
//!   `cargo test --test chunked_rwkv`

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    clippy::float_cmp,
    clippy::cast_precision_loss,
    clippy::as_conversions,
    clippy::missing_panics_doc,
    missing_docs
)]

use std::io::Write;

use candle_core::{DType, Device, Tensor};
use rwkv_chunks::{
    ChunkedRwkv, ComputeGraph, EmbeddingTable, HostGraph, RecurrenceMode, RunnerConfig, RwkvError,
    StateRevision, StepPhase, TensorSpec,
};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Embedding width used by every fixture.
const WIDTH: usize = 4;

/// Table whose row `t` is `[t; WIDTH]`.
fn ramp_table(rows: usize) -> EmbeddingTable {
    let data = (0..rows).flat_map(|t| [t as f32; WIDTH]).collect();
    EmbeddingTable::from_vec(data, WIDTH).unwrap()
}

fn boxed(graphs: Vec<HostGraph>) -> Vec<Box<dyn ComputeGraph>> {
    graphs
        .into_iter()
        .map(|g| Box::new(g) as Box<dyn ComputeGraph>)
        .collect()
}

fn build(graphs: Vec<HostGraph>, config: RunnerConfig) -> ChunkedRwkv {
    ChunkedRwkv::new(boxed(graphs), config, &Device::Cpu)
        .unwrap()
        .with_embedding(ramp_table(16))
}

/// Fused chunk: `state' = state + hidden`, `hidden' = hidden + 1`.
fn relay_chunk(name: &str) -> HostGraph {
    HostGraph::new(
        name,
        vec![TensorSpec::f32("hidden", &[WIDTH]), TensorSpec::f32("state", &[WIDTH])],
        vec![
            TensorSpec::f32("state_out", &[WIDTH]),
            TensorSpec::f32("hidden_out", &[WIDTH]),
        ],
        |inputs| Ok(vec![(&inputs[1] + &inputs[0])?, (&inputs[0] + 1.0)?]),
    )
}

/// Externalized single-layer chunk with a `[2, 2, 3]` WKV state.
///
/// Emits decay 0.5 and key-value 1 everywhere, passes the embedding as
/// `main`, its negation as `aux`, and the incoming WKV state as logits.
fn externalized_chunk() -> HostGraph {
    HostGraph::new(
        "externalized",
        vec![
            TensorSpec::f32("emb", &[WIDTH]),
            TensorSpec::f32("att_x", &[WIDTH]),
            TensorSpec::f32("wkv", &[2, 2, 3]),
            TensorSpec::f32("ffn_x", &[WIDTH]),
        ],
        vec![
            TensorSpec::f32("att_x_out", &[WIDTH]),
            TensorSpec::f32("decay", &[2, 2]),
            TensorSpec::f32("key_value", &[2, 2, 3]),
            TensorSpec::f32("ffn_x_out", &[WIDTH]),
            TensorSpec::f32("logits", &[12]),
        ],
        |inputs| {
            let dev = inputs[0].device();
            Ok(vec![
                inputs[0].clone(),
                Tensor::full(0.5_f32, (2, 2), dev)?,
                Tensor::ones((2, 2, 3), DType::F32, dev)?,
                (&inputs[0] * -1.0)?,
                inputs[2].flatten_all()?,
            ])
        },
    )
}

// ---------------------------------------------------------------------------
// Fused recurrence
// ---------------------------------------------------------------------------

#[test]
fn fused_copy_is_bit_exact() {
    let sentinel = [1.0_f32 / 3.0, -0.0, f32::MAX, 1.0e-40];
    let graph = HostGraph::new(
        "sentinel",
        vec![TensorSpec::f32("x", &[WIDTH]), TensorSpec::f32("state", &[WIDTH])],
        vec![TensorSpec::f32("state_out", &[WIDTH]), TensorSpec::f32("logits", &[WIDTH])],
        move |inputs| {
            let state = Tensor::from_slice(&sentinel, WIDTH, inputs[0].device())?;
            Ok(vec![state, inputs[0].clone()])
        },
    );
    let mut model = build(vec![graph], RunnerConfig::default());
    model.execute(5).unwrap();
    model.propagate().unwrap();

    let carried = model.input(1).unwrap();
    let bits = |v: &[f32]| v.iter().map(|x| x.to_bits()).collect::<Vec<_>>();
    assert_eq!(bits(&carried), bits(&sentinel));
}

#[test]
fn fused_f16_state_keeps_native_bits() {
    let graph = HostGraph::new(
        "half",
        vec![TensorSpec::f32("x", &[WIDTH]), TensorSpec::f16("state", &[WIDTH])],
        vec![TensorSpec::f16("state_out", &[WIDTH]), TensorSpec::f32("logits", &[WIDTH])],
        |inputs| {
            let values = [0.1_f32, -0.0, 65504.0, 6.1e-5];
            let state = Tensor::from_slice(&values, WIDTH, inputs[0].device())?
                .to_dtype(DType::F16)?;
            Ok(vec![state, inputs[0].clone()])
        },
    );
    let mut model = build(vec![graph], RunnerConfig::default());
    model.step(2).unwrap();

    let produced = model.output(0).unwrap();
    let carried = model.input(1).unwrap();
    assert_eq!(
        produced.iter().map(|x| x.to_bits()).collect::<Vec<_>>(),
        carried.iter().map(|x| x.to_bits()).collect::<Vec<_>>()
    );
    assert_eq!(carried[2], 65504.0);
}

#[test]
fn many_tokens_accumulate_state() {
    let mut model = build(vec![relay_chunk("relay")], RunnerConfig::default());
    let mut expected = 0.0_f32;
    for i in 0..100_u32 {
        let token = i % 16;
        expected += token as f32;
        let logits = model.step(token).unwrap();
        assert_eq!(logits, vec![token as f32 + 1.0; WIDTH]);
    }
    assert_eq!(model.input(1).unwrap(), vec![expected; WIDTH]);
    assert_eq!(model.phase(), StepPhase::Propagated);
}

// ---------------------------------------------------------------------------
// Multi-chunk chains
// ---------------------------------------------------------------------------

#[test]
fn chunks_carry_hidden_within_a_step() {
    let chunks = vec![relay_chunk("c0"), relay_chunk("c1"), relay_chunk("c2")];
    let mut model = build(chunks, RunnerConfig::default());
    assert_eq!(model.num_chunks(), 3);
    assert_eq!(model.input_count(), 4);
    assert_eq!(model.output_count(), 4);

    model.execute(2).unwrap();
    assert_eq!(model.last_output(), &[5.0; WIDTH]);
    // Per-chunk state outputs, then the final hidden.
    for (idx, value) in [(0, 2.0), (1, 3.0), (2, 4.0), (3, 5.0)] {
        assert_eq!(model.output(idx).unwrap(), vec![value; WIDTH], "output {idx}");
    }

    model.propagate().unwrap();
    assert_eq!(model.input(1).unwrap(), vec![2.0; WIDTH]);
    assert_eq!(model.input(2).unwrap(), vec![3.0; WIDTH]);
    assert_eq!(model.input(3).unwrap(), vec![4.0; WIDTH]);

    model.execute(2).unwrap();
    assert_eq!(model.output(2).unwrap(), vec![8.0; WIDTH]);
}

#[test]
fn failure_in_middle_chunk_aborts_step() {
    let broken = HostGraph::new(
        "broken",
        vec![TensorSpec::f32("hidden", &[WIDTH]), TensorSpec::f32("state", &[WIDTH])],
        vec![
            TensorSpec::f32("state_out", &[WIDTH]),
            TensorSpec::f32("hidden_out", &[WIDTH]),
        ],
        |_| Err(RwkvError::Unsupported("graph execution failed".into())),
    );
    let mut model = build(
        vec![relay_chunk("c0"), broken, relay_chunk("c2")],
        RunnerConfig::default(),
    );
    let err = model.step(1).unwrap_err();
    assert!(matches!(err, RwkvError::Execution { chunk: 1, .. }), "{err}");
    assert_eq!(model.phase(), StepPhase::Failed);

    // Chunk 2 never ran and nothing was carried.
    assert_eq!(model.output(2).unwrap(), vec![0.0; WIDTH]);
    model.propagate().unwrap();
    assert_eq!(model.input(1).unwrap(), vec![0.0; WIDTH]);
}

// ---------------------------------------------------------------------------
// Externalized recurrence
// ---------------------------------------------------------------------------

#[test]
fn externalized_state_follows_wkv_update() {
    let mut model = build(vec![externalized_chunk()], RunnerConfig::default());
    assert_eq!(model.recurrence_mode(), RecurrenceMode::Externalized);

    // Logits echo the state the step started from: 0 → 1 → 1.5 → 1.75.
    for expected in [0.0, 1.0, 1.5, 1.75] {
        assert_eq!(model.step(3).unwrap(), vec![expected; 12]);
    }
    assert_eq!(model.input(2).unwrap(), vec![1.875; 12]);
    assert_eq!(model.input(1).unwrap(), vec![3.0; WIDTH]);
    assert_eq!(model.input(3).unwrap(), vec![-3.0; WIDTH]);
}

#[test]
fn second_propagate_does_not_reapply_wkv() {
    let mut model = build(vec![externalized_chunk()], RunnerConfig::default());
    model.execute(0).unwrap();
    model.propagate().unwrap();
    model.propagate().unwrap();
    assert_eq!(model.input(2).unwrap(), vec![1.0; 12]);
}

#[test]
fn double_exp_decay_is_configurable() {
    let config = RunnerConfig::from_json(&serde_json::json!({
        "recurrence": "externalized",
        "decay_transform": "double_exp"
    }))
    .unwrap();
    let mut model = build(vec![externalized_chunk()], config);
    model.step(0).unwrap();
    model.step(0).unwrap();
    // state = exp(-exp(0.5)) * 1 + 1
    let w = (-(0.5_f32).exp()).exp();
    for v in model.input(2).unwrap() {
        assert!((v - (w + 1.0)).abs() < 1e-6, "{v}");
    }
}

// ---------------------------------------------------------------------------
// RWKV-6 ordering
// ---------------------------------------------------------------------------

#[test]
fn v6_revision_permutes_triples() {
    let spec = |name: String| TensorSpec::f32(name, &[WIDTH]);
    let graph = HostGraph::new(
        "rwkv6",
        (0..7).map(|i| spec(format!("in_{i}"))).collect(),
        (0..7).map(|i| spec(format!("out_{i}"))).collect(),
        |inputs| {
            (0..7)
                .map(|j| (&inputs[0] + f64::from(j) * 10.0).map_err(RwkvError::from))
                .collect()
        },
    );
    let config = RunnerConfig::default().with_revision(StateRevision::V6);
    let mut model = build(vec![graph], config);
    model.step(1).unwrap();

    for (input, output) in [(1, 0), (3, 1), (2, 2), (4, 3), (6, 4), (5, 5)] {
        assert_eq!(
            model.input(input).unwrap(),
            model.output(output).unwrap(),
            "input {input} <- output {output}"
        );
    }
}

#[test]
fn v6_revision_rejects_chunking() {
    let config = RunnerConfig::default().with_revision(StateRevision::V6);
    let graphs = boxed(vec![relay_chunk("c0"), relay_chunk("c1")]);
    assert!(matches!(
        ChunkedRwkv::new(graphs, config, &Device::Cpu),
        Err(RwkvError::Unsupported(_))
    ));
}

// ---------------------------------------------------------------------------
// Logical I/O surface
// ---------------------------------------------------------------------------

#[test]
fn logical_io_bounds() {
    let mut model = build(
        vec![relay_chunk("c0"), relay_chunk("c1")],
        RunnerConfig::default(),
    );
    model.execute(7).unwrap();

    assert_eq!(model.input_shape(2).unwrap(), vec![WIDTH]);
    assert_eq!(model.output_shape(2).unwrap(), vec![WIDTH]);
    assert!(matches!(
        model.input_shape(3),
        Err(RwkvError::IndexOutOfBounds { kind: "input", index: 3, count: 3 })
    ));
    assert!(matches!(
        model.output_shape(3),
        Err(RwkvError::IndexOutOfBounds { kind: "output", .. })
    ));

    let mut buf = [0.0_f32; 2];
    model.read_output(2, &mut buf).unwrap();
    assert_eq!(buf, [9.0, 9.0]);

    let mut too_long = [0.0_f32; WIDTH + 1];
    assert!(matches!(
        model.read_output(2, &mut too_long),
        Err(RwkvError::SizeMismatch { expected: 4, actual: 5, .. })
    ));
    assert!(matches!(
        model.read_output(3, &mut buf),
        Err(RwkvError::IndexOutOfBounds { .. })
    ));

    assert!(matches!(
        model.set_input(1, &[1.0; 3]),
        Err(RwkvError::SizeMismatch { .. })
    ));
    model.set_input(2, &[0.5; WIDTH]).unwrap();
    assert_eq!(model.input(2).unwrap(), vec![0.5; WIDTH]);
}

#[test]
fn vocabulary_bound_is_enforced() {
    let config = RunnerConfig::default().with_vocab_size(10);
    let mut model = build(vec![relay_chunk("c0")], config);
    assert!(matches!(model.execute(10), Err(RwkvError::InvalidArgument(_))));
    assert!(matches!(model.execute(16), Err(RwkvError::InvalidArgument(_))));
    model.execute(9).unwrap();
}

// ---------------------------------------------------------------------------
// Embedding side file
// ---------------------------------------------------------------------------

#[test]
fn embedding_loads_lazily_from_config() {
    let dir = tempfile::tempdir().unwrap();
    let model_path = dir.path().join("rwkv.bin");
    let mut file = std::fs::File::create(dir.path().join("rwkv.emb")).unwrap();
    for t in 0..4_u8 {
        for _ in 0..WIDTH {
            file.write_all(&f32::from(t * 10).to_le_bytes()).unwrap();
        }
    }
    file.flush().unwrap();

    let config = RunnerConfig::from_json(&serde_json::json!({
        "model_path": model_path.to_str().unwrap()
    }))
    .unwrap();
    let mut model =
        ChunkedRwkv::new(boxed(vec![relay_chunk("c0")]), config, &Device::Cpu).unwrap();
    assert!(model.embedding().is_none());

    assert_eq!(model.step(2).unwrap(), vec![21.0; WIDTH]);
    let table = model.embedding().unwrap();
    assert_eq!((table.len(), table.width()), (4, WIDTH));
    assert!(matches!(model.execute(4), Err(RwkvError::InvalidArgument(_))));
}

#[test]
fn missing_embedding_needs_pre_embedded_input() {
    let dir = tempfile::tempdir().unwrap();
    let config = RunnerConfig::default().with_model_path(dir.path().join("absent.bin"));
    let mut model =
        ChunkedRwkv::new(boxed(vec![relay_chunk("c0")]), config, &Device::Cpu).unwrap();

    model.set_input(0, &[0.25; WIDTH]).unwrap();
    assert_eq!(model.step(12_345).unwrap(), vec![1.25; WIDTH]);
    assert!(model.embedding().unwrap().is_empty());
    assert!(model.has_inferred());
}
