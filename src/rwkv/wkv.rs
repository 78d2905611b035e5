// SPDX-License-Identifier: MIT OR Apache-2.0

//! Host-side WKV decay-accumulate update.
//!
//! Externalized models emit the decay and key-value pieces of the WKV
//! recurrence as separate outputs; the host folds them into the state:
//!
//! ```text
//! state[a, b, c] = decay[a, b] * state[a, b, c] + key_value[a, b, c]
//! ```
//!
//! One decay scalar is read per `(a, b)` pair and reused across the `c`
//! axis.  Everything is plain `f32`; no saturation or NaN handling.

use super::config::DecayTransform;

/// Apply one WKV step in place with the decay consumed as given.
///
/// `dims = [A, B, C]` is the state shape.  `key_value` and `state` hold
/// `A * B * C` elements, `decay` holds `A * B`; surplus elements are
/// ignored and short inputs stop the update early.
///
/// # Example
///
/// ```
/// use rwkv_chunks::rwkv::wkv::update_state;
///
/// let mut state = vec![1.0, 2.0, 3.0, 4.0];
/// update_state(&[1.0, 1.0, 1.0, 1.0], &[0.5, 2.0], &mut state, [1, 2, 2]);
/// assert_eq!(state, vec![1.5, 2.0, 7.0, 9.0]);
/// ```
pub fn update_state(key_value: &[f32], decay: &[f32], state: &mut [f32], dims: [usize; 3]) {
    update_state_with(key_value, decay, state, dims, DecayTransform::AsIs);
}

/// Apply one WKV step in place, mapping each decay scalar through
/// `transform` first.
pub fn update_state_with(
    key_value: &[f32],
    decay: &[f32],
    state: &mut [f32],
    dims: [usize; 3],
    transform: DecayTransform,
) {
    let [a, b, c] = dims;
    // chunks_exact panics on a zero chunk size; an empty inner axis is a no-op.
    if c == 0 {
        return;
    }
    let rows = a * b;
    // EXPLICIT: the row walk mirrors the A → B → C nesting of the state layout
    for ((state_row, kv_row), &raw_decay) in state
        .chunks_exact_mut(c)
        .zip(key_value.chunks_exact(c))
        .zip(decay)
        .take(rows)
    {
        let w = transform.apply(raw_decay);
        for (s, &kv) in state_row.iter_mut().zip(kv_row) {
            *s = w * *s + kv;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp, clippy::indexing_slicing)]
mod tests {
    use super::*;

    const DIMS: [usize; 3] = [2, 2, 3];

    #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
    fn ramp(len: usize, start: f32) -> Vec<f32> {
        (0..len).map(|i| start + i as f32).collect()
    }

    #[test]
    fn zero_decay_yields_key_value() {
        let kv = ramp(12, 10.0);
        let mut state = ramp(12, -5.0);
        update_state(&kv, &[0.0; 4], &mut state, DIMS);
        assert_eq!(state, kv);
    }

    #[test]
    fn zero_key_value_scales_state() {
        let decay = [0.5, 0.25, 2.0, 1.0];
        let state0 = ramp(12, 1.0);
        let mut state = state0.clone();
        update_state(&[0.0; 12], &decay, &mut state, DIMS);
        for (i, (&s, &s0)) in state.iter().zip(&state0).enumerate() {
            let w = decay[i / 3];
            assert_eq!(s, w * s0, "element {i}");
        }
    }

    #[test]
    fn decay_is_shared_across_inner_axis() {
        let mut state = vec![1.0; 6];
        update_state(&[0.0; 6], &[3.0, 5.0], &mut state, [1, 2, 3]);
        assert_eq!(state, vec![3.0, 3.0, 3.0, 5.0, 5.0, 5.0]);
    }

    #[test]
    fn two_steps_accumulate() {
        let decay = [0.5, 0.25, 2.0, 1.0];
        let state0 = ramp(12, 1.0);
        let kv1 = ramp(12, 0.5);
        let kv2 = ramp(12, -3.0);

        let mut state = state0.clone();
        update_state(&kv1, &decay, &mut state, DIMS);
        update_state(&kv2, &decay, &mut state, DIMS);

        for i in 0..12 {
            let w = decay[i / 3];
            let expected = w * w * state0[i] + w * kv1[i] + kv2[i];
            assert_eq!(state[i], expected, "element {i}");
        }
        // Not idempotent: a second identical step changes the state.
        assert_ne!(state, {
            let mut once = state0;
            update_state(&kv1, &decay, &mut once, DIMS);
            once
        });
    }

    #[test]
    fn double_exp_transform() {
        let mut state = vec![1.0, 1.0];
        update_state_with(&[0.0, 0.0], &[0.0], &mut state, [1, 1, 2], DecayTransform::DoubleExp);
        // exp(-exp(0)) = exp(-1)
        let expected = (-1.0_f32).exp();
        assert!((state[0] - expected).abs() < 1e-7);
        assert!((state[1] - expected).abs() < 1e-7);
    }

    #[test]
    fn empty_inner_axis_is_noop() {
        let mut state: Vec<f32> = vec![];
        update_state(&[], &[1.0], &mut state, [1, 1, 0]);
        assert!(state.is_empty());
    }
}
