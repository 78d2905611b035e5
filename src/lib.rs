// SPDX-License-Identifier: MIT OR Apache-2.0

//! # rwkv-chunks
//!
//! Single-token inference driver for RWKV models compiled into one or more
//! accelerator graphs ("chunks"), built on
//! [candle](https://github.com/huggingface/candle) tensors.
//!
//! The compiled graphs run the numeric kernels; this crate is the glue
//! between invocations.  It feeds the token embedding, runs the chunks in
//! order, and carries recurrent state from each step's outputs into the next
//! step's inputs, applying the WKV decay-accumulate update on the host when
//! the graphs leave it out.
//!
//! ## Recurrence modes
//!
//! - **Fused**: the graph advances its own state; output `k` is copied to
//!   input `k + 1` between steps.
//! - **Externalized**: the graph emits `(main, decay, key_value, aux)` per
//!   layer and the host computes `state = decay * state + key_value`.
//! - **RWKV-6 ordering**: single-chunk fused exports with a permuted state
//!   triple.
//!
//! ## Layout
//!
//! | Module | Role |
//! |--------|------|
//! | [`backend`] | [`ComputeGraph`] seam and the closure-backed [`HostGraph`] |
//! | [`tensor`] | Typed buffers of one graph ([`TensorHandleSet`]) |
//! | [`topology`] | Logical input/output index resolution ([`ChunkLayout`]) |
//! | [`embedding`] | Token embedding table ([`EmbeddingTable`]) |
//! | [`rwkv`] | The runner ([`ChunkedRwkv`]), propagation plan and WKV unit |
//! | [`config`] | JSON runner configuration ([`RunnerConfig`]) |
//! | `htp` | HTP backend-extension config files (feature `htp`) |

#![warn(missing_docs)]

pub mod backend;
pub mod config;
pub mod embedding;
pub mod error;
#[cfg(feature = "htp")]
pub mod htp;
pub mod rwkv;
pub mod tensor;
pub mod topology;

pub use backend::{ComputeGraph, HostGraph, HostGraphFn};
pub use config::RunnerConfig;
pub use embedding::{EmbeddingTable, embedding_path_for};
pub use error::{Result, RwkvError};
pub use rwkv::{
    ChunkedRwkv, DecayTransform, PropagationPlan, PropagationStep, RecurrenceMode, StateRevision,
    StepPhase,
};
pub use tensor::{TensorHandleSet, TensorSlot, TensorSpec};
pub use topology::{ChunkLayout, MAX_CHUNKS, TensorLocation};
