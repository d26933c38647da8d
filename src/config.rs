// SPDX-License-Identifier: MIT OR Apache-2.0

//! Chat configuration and `config.json` field helpers.
//!
//! [`ChatConfig`] is a flat JSON document; every field is optional and
//! falls back to the defaults of the interactive demo. Command-line flags
//! override it field by field.
//!
//! # Usage
//!
//! ```
//! use rwkv_chain::ChatConfig;
//!
//! let config: ChatConfig = serde_json::from_str(
//!     r#"{"generation_mode": "penalty_sample", "temperature": 0.8,
//!         "prefill_policy": "continue", "max_new_tokens": 64}"#,
//! ).unwrap();
//! assert_eq!(config.generation.max_new_tokens, 64);
//! assert!(config.sampler().is_ok());
//! ```

use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

use crate::error::{ChainError, Result};
use crate::generation::GenerationConfig;
use crate::sampler::{PenaltyParams, Sampler, SamplingMode};
use crate::session::SessionConfig;

// ---------------------------------------------------------------------------
// ChatConfig
// ---------------------------------------------------------------------------

/// Everything the chat front end needs besides the model and tokenizer paths.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Device ids to request; kernels run on the first.
    pub devices: Vec<usize>,
    /// Sampling mode name (`greedy` or `penalty_sample`).
    pub generation_mode: String,
    /// Parameters of the penalty sampler.
    #[serde(flatten)]
    pub sampling: PenaltyParams,
    /// RNG seed; `None` seeds from entropy.
    pub seed: Option<u64>,
    /// Carried-state policy.
    #[serde(flatten)]
    pub session: SessionConfig,
    /// Limits and prompt presentation.
    #[serde(flatten)]
    pub generation: GenerationConfig,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            devices: vec![0],
            generation_mode: "greedy".into(),
            sampling: PenaltyParams::default(),
            seed: None,
            session: SessionConfig::default(),
            generation: GenerationConfig::default(),
        }
    }
}

impl ChatConfig {
    /// Read a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::Config`] if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ChainError::Config(format!("cannot read {}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| ChainError::Config(format!("{}: {e}", path.display())))?;
        tracing::debug!(path = %path.display(), ?config, "configuration loaded");
        Ok(config)
    }

    /// Resolve the sampling mode and build the sampler.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::UnsupportedSamplingMode`] for an unknown mode
    /// name, [`ChainError::Config`] for out-of-range parameters or an
    /// empty device list.
    pub fn sampler(&self) -> Result<Sampler> {
        if self.devices.is_empty() {
            return Err(ChainError::Config("device list is empty".into()));
        }
        let mode = SamplingMode::from_name(&self.generation_mode, self.sampling)?;
        Ok(Sampler::new(mode, self.seed))
    }
}

// ---------------------------------------------------------------------------
// JSON extraction helpers
// ---------------------------------------------------------------------------

/// Extract a required `usize` field from a JSON object.
pub(crate) fn get_usize(config: &Value, key: &str) -> Result<usize> {
    let val = config
        .get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| ChainError::Config(format!("missing or invalid field '{key}'")))?;
    usize::try_from(val)
        .map_err(|_| ChainError::Config(format!("field '{key}' value {val} overflows usize")))
}

/// Extract an optional `usize` field, returning a default if absent or null.
pub(crate) fn get_usize_or(config: &Value, key: &str, default: usize) -> usize {
    config
        .get(key)
        .and_then(Value::as_u64)
        .and_then(|v| usize::try_from(v).ok())
        .unwrap_or(default)
}

/// Extract an `f64` field, returning a default if absent.
pub(crate) fn get_f64_or(config: &Value, key: &str, default: f64) -> f64 {
    config.get(key).and_then(Value::as_f64).unwrap_or(default)
}

/// Extract a `bool` field, returning a default if absent.
pub(crate) fn get_bool_or(config: &Value, key: &str, default: bool) -> bool {
    config.get(key).and_then(Value::as_bool).unwrap_or(default)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
