// SPDX-License-Identifier: MIT OR Apache-2.0

//! Autoregressive generation over a [`Session`].
//!
//! Encode the prompt, prefill it, then sample and step until a stop token
//! or `max_new_tokens`. Stop tokens end the turn and are not part of the
//! output; neither is fed back into the model.

use std::str::FromStr;
use std::time::{Duration, Instant};

use serde::Deserialize;

use crate::engine::Logits;
use crate::error::{ChainError, Result};
use crate::runtime::Runtime;
use crate::sampler::{Sampler, SamplingMode};
use crate::session::Session;
use crate::tokenizer::ChainTokenizer;

/// RWKV end-of-text token.
pub const END_OF_TEXT: u32 = 0;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// How user text is presented to the model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptMode {
    /// Wrap in the chat template `User: {text}\n\nAssistant:`.
    #[default]
    Prompted,
    /// Feed the text unchanged.
    Unprompted,
}

impl PromptMode {
    /// Apply the mode to user text.
    #[must_use]
    pub fn format_prompt(self, text: &str) -> String {
        match self {
            Self::Prompted => format!("User: {text}\n\nAssistant:"),
            Self::Unprompted => text.to_owned(),
        }
    }
}

impl FromStr for PromptMode {
    type Err = ChainError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "prompted" => Ok(Self::Prompted),
            "unprompted" => Ok(Self::Unprompted),
            other => Err(ChainError::Config(format!(
                "unknown prompt mode '{other}' (expected prompted or unprompted)"
            ))),
        }
    }
}

/// Limits and stop conditions of one generation turn.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Ceiling on generated tokens per turn.
    pub max_new_tokens: usize,
    /// Tokens that end the turn.
    pub stop_tokens: Vec<u32>,
    /// Prompt presentation.
    pub prompt_mode: PromptMode,
    /// Use the model's `greedy_head` for greedy decoding when it has one.
    pub device_greedy: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 1024,
            stop_tokens: vec![END_OF_TEXT],
            prompt_mode: PromptMode::Prompted,
            device_greedy: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Why a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The sampler produced this stop token.
    StopToken(u32),
    /// `max_new_tokens` were generated.
    MaxTokens,
}

/// Output of one generation turn.
#[derive(Debug, Clone)]
pub struct GenerationResult {
    /// Prompt text after [`PromptMode::format_prompt`].
    pub prompt: String,
    /// Token ids of the prompt.
    pub prompt_tokens: Vec<u32>,
    /// Generated token ids, stop token excluded.
    pub generated_tokens: Vec<u32>,
    /// Decoded generated text.
    pub generated_text: String,
    /// Why generation ended.
    pub stop_reason: StopReason,
    /// Prefill plus first sample.
    pub first_token_latency: Duration,
    /// Whole turn.
    pub elapsed: Duration,
}

impl GenerationResult {
    /// Decode throughput after the first token.
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
    pub fn tokens_per_second(&self) -> f64 {
        let decode = self.elapsed.saturating_sub(self.first_token_latency).as_secs_f64();
        let steps = self.generated_tokens.len().saturating_sub(1);
        if decode > 0.0 && steps > 0 {
            steps as f64 / decode
        } else {
            0.0
        }
    }
}

/// Token ids and timing of one turn, before decoding.
#[derive(Debug, Clone)]
pub struct TokenRun {
    /// Generated ids, stop token excluded.
    pub tokens: Vec<u32>,
    /// Why generation ended.
    pub stop_reason: StopReason,
    /// Prefill plus first sample.
    pub first_token_latency: Duration,
    /// Whole run.
    pub elapsed: Duration,
}

// ---------------------------------------------------------------------------
// GenerationLoop
// ---------------------------------------------------------------------------

/// Prefill-then-step driver.
#[derive(Debug, Clone)]
pub struct GenerationLoop {
    /// Next-token rule.
    sampler: Sampler,
    /// Limits.
    config: GenerationConfig,
}

impl GenerationLoop {
    /// Create a loop.
    #[must_use]
    pub const fn new(sampler: Sampler, config: GenerationConfig) -> Self {
        Self { sampler, config }
    }

    /// Limits in effect.
    #[must_use]
    pub const fn config(&self) -> &GenerationConfig {
        &self.config
    }

    /// Generate a reply to `text`.
    ///
    /// `on_token` sees every generated id as soon as it is sampled; an
    /// error from it ends the turn.
    ///
    /// # Errors
    ///
    /// Tokenizer, forward pass and sampling errors. A forward pass error
    /// leaves the session corrupted.
    pub fn generate<R, F>(
        &mut self,
        session: &mut Session<R>,
        tokenizer: &ChainTokenizer,
        text: &str,
        on_token: F,
    ) -> Result<GenerationResult>
    where
        R: Runtime,
        F: FnMut(u32) -> Result<()>,
    {
        let prompt = self.config.prompt_mode.format_prompt(text);
        let prompt_tokens = tokenizer.encode(&prompt)?;
        let run = self.generate_from_tokens(session, &prompt_tokens, on_token)?;
        let generated_text = tokenizer.decode_lossy(&run.tokens)?;
        Ok(GenerationResult {
            prompt,
            prompt_tokens,
            generated_tokens: run.tokens,
            generated_text,
            stop_reason: run.stop_reason,
            first_token_latency: run.first_token_latency,
            elapsed: run.elapsed,
        })
    }

    /// Generate from already-encoded prompt ids.
    ///
    /// With `max_new_tokens == 0` the prompt is still prefilled.
    ///
    /// # Errors
    ///
    /// See [`Self::generate`].
    pub fn generate_from_tokens<R, F>(
        &mut self,
        session: &mut Session<R>,
        prompt_tokens: &[u32],
        mut on_token: F,
    ) -> Result<TokenRun>
    where
        R: Runtime,
        F: FnMut(u32) -> Result<()>,
    {
        let start = Instant::now();
        let max = self.config.max_new_tokens;
        let mut logits = session.prefill(prompt_tokens)?;
        let mut first_token_latency = start.elapsed();

        let mut tokens = Vec::with_capacity(max.min(4096));
        let mut stop_reason = StopReason::MaxTokens;
        while tokens.len() < max {
            let next = self.pick(session, &logits)?;
            if tokens.is_empty() {
                first_token_latency = start.elapsed();
            }
            if self.config.stop_tokens.contains(&next) {
                stop_reason = StopReason::StopToken(next);
                break;
            }
            tokens.push(next);
            on_token(next)?;
            logits = session.step(next)?;
        }

        let elapsed = start.elapsed();
        tracing::debug!(
            prompt = prompt_tokens.len(),
            generated = tokens.len(),
            ?stop_reason,
            ?elapsed,
            "turn finished"
        );
        Ok(TokenRun {
            tokens,
            stop_reason,
            first_token_latency,
            elapsed,
        })
    }

    /// Choose the next token from `logits`.
    fn pick<R: Runtime>(&mut self, session: &mut Session<R>, logits: &Logits) -> Result<u32> {
        if self.config.device_greedy
            && *self.sampler.mode() == SamplingMode::Greedy
            && session.engine().has_greedy_head()
        {
            return session.sample_on_device();
        }
        let history = session.generation_state().recent();
        self.sampler.sample(logits, &history)
    }
}

// ---------------------------------------------------------------------------
// Streaming text
// ---------------------------------------------------------------------------

/// Longest run of ids held back waiting for a character to complete.
const MAX_PENDING: usize = 4;

/// Turns a growing id sequence into printable text increments.
///
/// Only ids not yet printed are decoded. A token may end in the middle of a
/// multi-byte character; such text is held back until a later token
/// completes it, or until `MAX_PENDING` ids have piled up, after which the
/// bytes are printed lossily.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    /// Ids not yet handed out as text.
    pending: Vec<u32>,
}

impl StreamDecoder {
    /// Create an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a token; returns newly completed text, if any.
    ///
    /// # Errors
    ///
    /// [`ChainError::Tokenizer`] if the pending ids cannot be decoded.
    pub fn push(&mut self, tokenizer: &ChainTokenizer, id: u32) -> Result<Option<String>> {
        self.pending.push(id);
        let text = tokenizer.decode_lossy(&self.pending)?;
        if text.ends_with('\u{fffd}') && self.pending.len() < MAX_PENDING {
            return Ok(None);
        }
        self.pending.clear();
        Ok((!text.is_empty()).then_some(text))
    }

    /// Flush whatever is still held back at the end of a turn.
    ///
    /// # Errors
    ///
    /// [`ChainError::Tokenizer`] if the pending ids cannot be decoded.
    pub fn finish(&mut self, tokenizer: &ChainTokenizer) -> Result<Option<String>> {
        let ids = std::mem::take(&mut self.pending);
        if ids.is_empty() {
            return Ok(None);
        }
        let text = tokenizer.decode_lossy(&ids)?;
        Ok((!text.is_empty()).then_some(text))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
