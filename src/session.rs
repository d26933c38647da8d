// SPDX-License-Identifier: MIT OR Apache-2.0

//! Explicit session object.
//!
//! A [`Session`] owns the runtime (and through it the device handles and
//! sub-network buffers), the [`ForwardEngine`] and the [`GenerationState`].
//! Every forward call takes `&mut self`, so one session never has two
//! passes in flight; share a session across threads behind a `Mutex`.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use crate::engine::{ForwardEngine, Logits};
use crate::error::{ChainError, Result};
use crate::runtime::{HostData, Runtime};

/// Most recent tokens kept for repetition penalties.
const RECENT_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// What a new prefill does with the carried state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrefillPolicy {
    /// Zero the carried state first; each prompt starts a fresh context.
    #[default]
    Reset,
    /// Keep the state left by the previous turn (conversation history).
    Continue,
}

impl FromStr for PrefillPolicy {
    type Err = ChainError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "reset" => Ok(Self::Reset),
            "continue" => Ok(Self::Continue),
            other => Err(ChainError::Config(format!(
                "unknown prefill policy '{other}' (expected reset or continue)"
            ))),
        }
    }
}

impl fmt::Display for PrefillPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reset => write!(f, "reset"),
            Self::Continue => write!(f, "continue"),
        }
    }
}

/// Session-level settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Carried-state policy for [`Session::prefill`].
    pub prefill_policy: PrefillPolicy,
}

// ---------------------------------------------------------------------------
// GenerationState
// ---------------------------------------------------------------------------

/// Host-side bookkeeping that travels with the carried state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerationState {
    /// Tokens fed through the model since the last reset.
    pub position: usize,
    /// Most recent token fed or produced.
    pub last_token: Option<u32>,
    /// Bounded window of recent tokens, oldest first.
    recent: VecDeque<u32>,
}

impl GenerationState {
    /// Record tokens fed to the model.
    fn advance(&mut self, tokens: &[u32]) {
        self.position += tokens.len();
        for &t in tokens {
            if self.recent.len() == RECENT_CAPACITY {
                self.recent.pop_front();
            }
            self.recent.push_back(t);
        }
        if let Some(&t) = tokens.last() {
            self.last_token = Some(t);
        }
    }

    /// Recent tokens, oldest first.
    #[must_use]
    pub fn recent(&self) -> Vec<u32> {
        self.recent.iter().copied().collect()
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One generation context over one loaded model.
pub struct Session<R: Runtime> {
    /// Device handles and sub-network buffers.
    runtime: R,
    /// Pass orchestration and carried state.
    engine: ForwardEngine,
    /// Host-side bookkeeping.
    state: GenerationState,
    /// Policies.
    config: SessionConfig,
}

impl<R: Runtime> fmt::Debug for Session<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("devices", &self.runtime.device_ids())
            .field("engine", &self.engine)
            .field("state", &self.state)
            .field("config", &self.config)
            .finish()
    }
}

impl<R: Runtime> Session<R> {
    /// Load the pipeline from `runtime` and start with a zero state.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::ModelLoad`] if the runtime does not hold a
    /// usable model.
    pub fn new(runtime: R, config: SessionConfig) -> Result<Self> {
        let engine = ForwardEngine::load(&runtime)?;
        tracing::info!(policy = %config.prefill_policy, "session started");
        Ok(Self {
            runtime,
            engine,
            state: GenerationState::default(),
            config,
        })
    }

    /// Feed a prompt according to the prefill policy; returns the logits
    /// after its last token.
    ///
    /// # Errors
    ///
    /// See [`ForwardEngine::run_prefill`]. A corrupted session or an
    /// invalid prompt is refused before the policy is applied.
    pub fn prefill(&mut self, tokens: &[u32]) -> Result<Logits> {
        if self.engine.is_corrupted() {
            return Err(ChainError::SessionCorrupted);
        }
        self.engine.check_prompt(tokens)?;
        if self.config.prefill_policy == PrefillPolicy::Reset {
            self.reset();
        }
        let logits = self.engine.run_prefill(&mut self.runtime, tokens)?;
        self.state.advance(tokens);
        Ok(logits)
    }

    /// Feed one token; returns the logits it produces.
    ///
    /// # Errors
    ///
    /// See [`ForwardEngine::run_step`].
    pub fn step(&mut self, token: u32) -> Result<Logits> {
        let logits = self.engine.run_step(&mut self.runtime, token)?;
        self.state.advance(&[token]);
        Ok(logits)
    }

    /// Zero the carried state and bookkeeping; clears corruption.
    pub fn reset(&mut self) {
        self.engine.reset();
        self.state = GenerationState::default();
        tracing::debug!("session reset");
    }

    /// Device-side argmax over the last logits.
    ///
    /// # Errors
    ///
    /// See [`ForwardEngine::greedy_on_device`].
    pub fn sample_on_device(&mut self) -> Result<u32> {
        self.engine.greedy_on_device(&mut self.runtime)
    }

    /// Snapshot of the state the next pass will start from.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::SessionCorrupted`] after a failed pass.
    pub fn carried_state(&self) -> Result<HostData> {
        self.engine.read_carried_state(&self.runtime)
    }

    /// Host-side bookkeeping.
    #[must_use]
    pub const fn generation_state(&self) -> &GenerationState {
        &self.state
    }

    /// Session settings.
    #[must_use]
    pub const fn config(&self) -> SessionConfig {
        self.config
    }

    /// The forward engine.
    #[must_use]
    pub const fn engine(&self) -> &ForwardEngine {
        &self.engine
    }

    /// The runtime.
    #[must_use]
    pub const fn runtime(&self) -> &R {
        &self.runtime
    }

    /// Mutable runtime access (fault injection, device reads).
    pub const fn runtime_mut(&mut self) -> &mut R {
        &mut self.runtime
    }

    /// Vocabulary size of the loaded model.
    #[must_use]
    pub const fn vocab_size(&self) -> usize {
        self.engine.vocab_size()
    }

    /// Whether a failed pass requires [`Self::reset`].
    #[must_use]
    pub const fn is_corrupted(&self) -> bool {
        self.engine.is_corrupted()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn policy_parses() {
        assert_eq!("reset".parse::<PrefillPolicy>().unwrap(), PrefillPolicy::Reset);
        assert_eq!(
            "continue".parse::<PrefillPolicy>().unwrap(),
            PrefillPolicy::Continue
        );
        assert!(matches!(
            "rewind".parse::<PrefillPolicy>(),
            Err(ChainError::Config(_))
        ));
        assert_eq!(PrefillPolicy::default(), PrefillPolicy::Reset);
    }

    #[test]
    fn config_deserializes_snake_case() {
        let cfg: SessionConfig =
            serde_json::from_str(r#"{"prefill_policy": "continue"}"#).unwrap();
        assert_eq!(cfg.prefill_policy, PrefillPolicy::Continue);
        let cfg: SessionConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.prefill_policy, PrefillPolicy::Reset);
    }

    #[test]
    fn recent_window_is_bounded() {
        let mut state = GenerationState::default();
        let tokens: Vec<u32> = (0..300).collect();
        state.advance(&tokens);
        assert_eq!(state.position, 300);
        assert_eq!(state.last_token, Some(299));
        let recent = state.recent();
        assert_eq!(recent.len(), RECENT_CAPACITY);
        assert_eq!(recent.first(), Some(&44));
    }
}
