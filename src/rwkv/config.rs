// SPDX-License-Identifier: MIT OR Apache-2.0

//! Recurrence classification for compiled RWKV graphs.
//!
//! These enums capture the axes that change how state is carried between
//! steps: whether the graph advances its own recurrence
//! ([`RecurrenceMode`]), which state tensor ordering the export uses
//! ([`StateRevision`]), and how externalized decay scalars are consumed
//! ([`DecayTransform`]).

use std::fmt;
use std::str::FromStr;

use crate::error::RwkvError;

// ---------------------------------------------------------------------------
// RecurrenceMode
// ---------------------------------------------------------------------------

/// Who advances the WKV recurrence between tokens.
///
/// Fixed per loaded model.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecurrenceMode {
    /// The graph emits the next state directly: outputs copy 1:1 into the
    /// following step's inputs.
    Fused,
    /// The graph emits `(main, decay, key_value, aux)` per layer; the host
    /// applies the decay-accumulate update.
    Externalized,
}

impl RecurrenceMode {
    /// Classify a chunk from its tensor counts.
    ///
    /// - `outputs == inputs` → [`Fused`](Self::Fused) (one output per state
    ///   input plus the trailing hidden/logits output).
    /// - `inputs = 3g + 1` and `outputs = 4g + 1` → [`Externalized`](Self::Externalized).
    ///
    /// Returns `None` for any other signature.
    #[must_use]
    pub const fn infer(num_inputs: usize, num_outputs: usize) -> Option<Self> {
        if num_inputs == num_outputs {
            return Some(Self::Fused);
        }
        if num_inputs == 0 || num_outputs == 0 {
            return None;
        }
        let state_inputs = num_inputs - 1;
        let state_outputs = num_outputs - 1;
        if state_inputs % 3 == 0 && state_outputs % 4 == 0 && state_inputs / 3 == state_outputs / 4
        {
            return Some(Self::Externalized);
        }
        None
    }
}

impl fmt::Display for RecurrenceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fused => write!(f, "fused"),
            Self::Externalized => write!(f, "externalized"),
        }
    }
}

impl FromStr for RecurrenceMode {
    type Err = RwkvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fused" => Ok(Self::Fused),
            "externalized" | "external" => Ok(Self::Externalized),
            other => Err(RwkvError::Config(format!(
                "unknown recurrence mode '{other}'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// StateRevision
// ---------------------------------------------------------------------------

/// State tensor ordering of the exported graph.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StateRevision {
    /// Output `k` feeds input `k + 1` (or the externalized 4 → 3 grouping).
    #[default]
    Standard,
    /// RWKV-6 single-chunk export: per layer, output triple `[0, 1, 2]`
    /// feeds input slots `[1, 3, 2]`.  Always fused, never chunked.
    V6,
}

impl fmt::Display for StateRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Standard => write!(f, "standard"),
            Self::V6 => write!(f, "RWKV-6 (Finch) permuted"),
        }
    }
}

impl FromStr for StateRevision {
    type Err = RwkvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standard" | "default" => Ok(Self::Standard),
            "v6" | "rwkv6" => Ok(Self::V6),
            other => Err(RwkvError::Config(format!(
                "unknown state revision '{other}'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// DecayTransform
// ---------------------------------------------------------------------------

/// Nonlinearity applied to each externalized decay scalar before the WKV
/// update.
///
/// Exports normally bake `exp(-exp(w))` into the graph, so the default
/// consumes the decay as given.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecayTransform {
    /// Use the decay value unchanged.
    #[default]
    AsIs,
    /// Map the raw log-log decay `w` to `exp(-exp(w))`.
    DoubleExp,
}

impl DecayTransform {
    /// Map one raw decay scalar.
    #[must_use]
    #[inline]
    pub fn apply(self, w: f32) -> f32 {
        match self {
            Self::AsIs => w,
            Self::DoubleExp => (-w.exp()).exp(),
        }
    }
}

impl fmt::Display for DecayTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AsIs => write!(f, "as_is"),
            Self::DoubleExp => write!(f, "double_exp"),
        }
    }
}

impl FromStr for DecayTransform {
    type Err = RwkvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "as_is" | "none" => Ok(Self::AsIs),
            "double_exp" => Ok(Self::DoubleExp),
            other => Err(RwkvError::Config(format!(
                "unknown decay transform '{other}'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn infer_fused() {
        assert_eq!(RecurrenceMode::infer(2, 2), Some(RecurrenceMode::Fused));
        assert_eq!(RecurrenceMode::infer(73, 73), Some(RecurrenceMode::Fused));
    }

    #[test]
    fn infer_externalized() {
        // 24 layers: 3 * 24 + 1 inputs, 4 * 24 + 1 outputs.
        assert_eq!(
            RecurrenceMode::infer(73, 97),
            Some(RecurrenceMode::Externalized)
        );
        assert_eq!(RecurrenceMode::infer(4, 5), Some(RecurrenceMode::Externalized));
    }

    #[test]
    fn infer_unknown_signature() {
        assert_eq!(RecurrenceMode::infer(4, 6), None);
        assert_eq!(RecurrenceMode::infer(7, 5), None);
        assert_eq!(RecurrenceMode::infer(0, 3), None);
    }

    #[test]
    fn parse_round_trip() {
        for mode in [RecurrenceMode::Fused, RecurrenceMode::Externalized] {
            assert_eq!(mode.to_string().parse::<RecurrenceMode>().unwrap(), mode);
        }
        assert_eq!("v6".parse::<StateRevision>().unwrap(), StateRevision::V6);
        assert_eq!(
            "double_exp".parse::<DecayTransform>().unwrap(),
            DecayTransform::DoubleExp
        );
        assert!("sideways".parse::<RecurrenceMode>().is_err());
        assert!("v9".parse::<StateRevision>().is_err());
    }

    #[test]
    fn revision_display() {
        assert_eq!(StateRevision::Standard.to_string(), "standard");
        assert_eq!(StateRevision::V6.to_string(), "RWKV-6 (Finch) permuted");
    }

    #[test]
    #[allow(clippy::float_cmp)]
    fn decay_transforms() {
        assert_eq!(DecayTransform::AsIs.apply(0.75), 0.75);
        let w = DecayTransform::DoubleExp.apply(0.0);
        assert!((w - (-1.0_f32).exp()).abs() < 1e-7);
        assert_eq!(DecayTransform::default(), DecayTransform::AsIs);
    }
}
