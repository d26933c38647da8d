// SPDX-License-Identifier: MIT OR Apache-2.0

//! RWKV-6 configuration and `HuggingFace` `config.json` parsing.
//!
//! # Usage
//!
//! ```
//! use rwkv_chain::rwkv::Rwkv6Config;
//!
//! let config_str = r#"{"model_type": "rwkv6", "hidden_size": 2048,
//!     "num_hidden_layers": 24, "num_attention_heads": 64,
//!     "vocab_size": 65536}"#;
//! let json: serde_json::Value = serde_json::from_str(config_str).unwrap();
//! let config = Rwkv6Config::from_hf_config(&json).unwrap();
//! assert_eq!(config.num_heads, 32);
//! assert_eq!(config.state_rows(), 24 * 66);
//! ```

use serde_json::Value;

use crate::config::{get_bool_or, get_f64_or, get_usize, get_usize_or};
use crate::error::{ChainError, Result};

/// `model_type` accepted by [`Rwkv6Config::from_hf_config`].
pub const RWKV6_MODEL_TYPE: &str = "rwkv6";

/// Rank of the five-way token-shift `LoRA`; not stored in `config.json`.
const TIME_MIX_EXTRA_DIM: usize = 32;
/// Rank of the decay `LoRA`; not stored in `config.json`.
const TIME_DECAY_EXTRA_DIM: usize = 64;

/// Dimensions of an RWKV-6 "Finch" model.
///
/// # `config.json` field reference
///
/// | Field | `config.json` key | Notes |
/// |-------|-------------------|-------|
/// | `hidden_size` | `hidden_size` | |
/// | `num_layers` | `num_hidden_layers` | |
/// | `head_dim` | `num_attention_heads` | Holds the head *size*, not the head count |
/// | `vocab_size` | `vocab_size` | |
/// | `norm_eps` | `layer_norm_epsilon` | Default: 1e-5 |
/// | `head_size_divisor` | `head_size_divisor` | Default: 8; scales `GroupNorm` eps |
/// | `intermediate_size` | `intermediate_size` | Default: `(hidden * 7/2) / 32 * 32` |
/// | `tie_word_embeddings` | `tie_word_embeddings` | Default: false |
///
/// `rescale_every` is ignored: the host kernels never run the residual
/// stream in `F16`, so the layer rescaling trick is not needed.
#[derive(Debug, Clone, PartialEq)]
pub struct Rwkv6Config {
    /// Hidden dimension (`d_model`).
    pub hidden_size: usize,
    /// Number of blocks.
    pub num_layers: usize,
    /// Per-head dimension.
    pub head_dim: usize,
    /// `hidden_size / head_dim`.
    pub num_heads: usize,
    /// Vocabulary size.
    pub vocab_size: usize,
    /// `LayerNorm` epsilon.
    pub norm_eps: f64,
    /// Channel-mix inner dimension.
    pub intermediate_size: usize,
    /// Divisor whose square scales the `GroupNorm` epsilon.
    pub head_size_divisor: usize,
    /// Rank of the token-shift `LoRA`.
    pub time_mix_extra_dim: usize,
    /// Rank of the decay `LoRA`.
    pub time_decay_extra_dim: usize,
    /// LM head shares the embedding matrix.
    pub tie_word_embeddings: bool,
}

impl Rwkv6Config {
    /// Parse from a `HuggingFace` `config.json` value.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::Config`] if `model_type` is not `rwkv6`, a
    /// required field is missing, or the head size does not divide the
    /// hidden size.
    pub fn from_hf_config(config: &Value) -> Result<Self> {
        let model_type = config
            .get("model_type")
            .and_then(Value::as_str)
            .ok_or_else(|| ChainError::Config("missing 'model_type' field".into()))?;
        if model_type != RWKV6_MODEL_TYPE {
            return Err(ChainError::Config(format!(
                "unsupported model_type '{model_type}' (expected {RWKV6_MODEL_TYPE})"
            )));
        }

        let hidden_size = get_usize(config, "hidden_size")?;
        // RWKV-6 configs store the head size under this key.
        let head_dim = get_usize(config, "num_attention_heads")?;
        if head_dim == 0 || hidden_size % head_dim != 0 {
            return Err(ChainError::Config(format!(
                "head size {head_dim} does not divide hidden size {hidden_size}"
            )));
        }

        Ok(Self {
            hidden_size,
            num_layers: get_usize(config, "num_hidden_layers")?,
            head_dim,
            num_heads: hidden_size / head_dim,
            vocab_size: get_usize(config, "vocab_size")?,
            norm_eps: get_f64_or(config, "layer_norm_epsilon", 1e-5),
            intermediate_size: get_usize_or(
                config,
                "intermediate_size",
                (hidden_size * 7 / 2) / 32 * 32,
            ),
            head_size_divisor: get_usize_or(config, "head_size_divisor", 8),
            time_mix_extra_dim: TIME_MIX_EXTRA_DIM,
            time_decay_extra_dim: TIME_DECAY_EXTRA_DIM,
            tie_word_embeddings: get_bool_or(config, "tie_word_embeddings", false),
        })
    }

    /// `GroupNorm` epsilon: `norm_eps * head_size_divisor^2`.
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
    pub fn group_norm_eps(&self) -> f64 {
        self.norm_eps * (self.head_size_divisor as f64).powi(2)
    }

    /// State rows owned by one block: `att_x`, `ffn_x`, then the WKV matrix.
    #[must_use]
    pub const fn rows_per_layer(&self) -> usize {
        self.head_dim + 2
    }

    /// Rows of the whole-model state buffer.
    #[must_use]
    pub const fn state_rows(&self) -> usize {
        self.num_layers * self.rows_per_layer()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
