// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for rwkv-chain.
//!
//! Every variant is surfaced to the caller; nothing in the pipeline retries.
//! Errors raised by a forward pass after device work has started leave the
//! carried state undefined, and the owning session refuses further passes
//! (see [`ChainError::SessionCorrupted`]) until it is reset.

/// Errors that can occur while loading or driving the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    /// A compute device could not be acquired.
    #[error("device request failed for device {device}: {reason}")]
    DeviceRequest {
        /// Device id that was requested.
        device: usize,
        /// Underlying reason.
        reason: String,
    },

    /// The compiled model is missing or malformed.
    #[error("model load failed: {0}")]
    ModelLoad(String),

    /// A buffer handoff's source does not fit the destination.
    #[error("size mismatch in {what}: source is {src_bytes} bytes, destination holds {dst_bytes}")]
    SizeMismatch {
        /// Which handoff failed.
        what: String,
        /// Source extent in bytes.
        src_bytes: usize,
        /// Destination capacity in bytes.
        dst_bytes: usize,
    },

    /// A buffer's declared shape or element format disagrees with its use.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Device launch or synchronization failed.
    #[error("sub-network `{subnet}` failed: {reason}")]
    SubnetExecution {
        /// Name of the sub-network that failed.
        subnet: String,
        /// Underlying reason.
        reason: String,
    },

    /// The requested sampling mode is not known.
    #[error("unsupported sampling mode: '{0}'")]
    UnsupportedSamplingMode(String),

    /// The tokenizer could not be loaded.
    #[error("failed to load tokenizer: {0}")]
    TokenizerLoad(String),

    /// Encoding or decoding failed.
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// Configuration parsing or validation error.
    #[error("config error: {0}")]
    Config(String),

    /// A token id lies outside the vocabulary.
    #[error("token {token} is out of range for vocabulary size {vocab_size}")]
    TokenOutOfRange {
        /// Offending token id.
        token: u32,
        /// Vocabulary size of the loaded model.
        vocab_size: usize,
    },

    /// A prefill was requested with no tokens.
    #[error("empty input: {0}")]
    EmptyInput(String),

    /// Logits could not be turned into a token.
    #[error("sampling error: {0}")]
    Sampling(String),

    /// A previous forward pass failed part-way; the carried state is undefined.
    #[error("session state is corrupted by a failed forward pass; reset the session")]
    SessionCorrupted,

    /// Tensor operation failure inside a host kernel (wraps candle).
    #[error("model error: {0}")]
    Model(#[from] candle_core::Error),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for rwkv-chain operations.
pub type Result<T> = std::result::Result<T, ChainError>;
