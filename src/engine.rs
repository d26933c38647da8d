// SPDX-License-Identifier: MIT OR Apache-2.0

//! Forward pass orchestration.
//!
//! One pass for one token is: upload the token id into `embedding`, run it,
//! hand its output to the layer stack (converting the element format at
//! that single boundary), run every `block_<i>`, then optionally run
//! `lm_head` over the last activation.
//!
//! [`ForwardEngine::run_prefill`] repeats the pass for every prompt token
//! and runs the head only after the last one; [`ForwardEngine::run_step`]
//! runs one pass with the head. A failure part-way through either marks
//! the engine corrupted, and every later pass is refused with
//! [`ChainError::SessionCorrupted`] until [`ForwardEngine::reset`].

use crate::chain::{CarriedState, StateChain};
use crate::error::{ChainError, Result};
use crate::handoff::FormatConversion;
use crate::invoker::{Binding, SubnetHandle, invoke};
use crate::runtime::{BufferRef, ElemFormat, HostData, Runtime, TensorDesc};

/// Name of the token embedding sub-network.
pub const EMBEDDING: &str = "embedding";
/// Name of the final projection sub-network.
pub const LM_HEAD: &str = "lm_head";
/// Name of the optional device-side argmax sub-network.
pub const GREEDY_HEAD: &str = "greedy_head";

/// Name of layer block `i`.
#[must_use]
pub fn block_name(i: usize) -> String {
    format!("block_{i}")
}

// ---------------------------------------------------------------------------
// Logits
// ---------------------------------------------------------------------------

/// Scores over the vocabulary produced by the head.
#[derive(Debug, Clone, PartialEq)]
pub struct Logits(Vec<f32>);

impl Logits {
    /// Wrap a score vector.
    #[must_use]
    pub const fn new(values: Vec<f32>) -> Self {
        Self(values)
    }

    /// Scores as a slice.
    #[must_use]
    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    /// Vocabulary size.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the vector is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Take the scores.
    #[must_use]
    pub fn into_vec(self) -> Vec<f32> {
        self.0
    }
}

// ---------------------------------------------------------------------------
// ForwardEngine
// ---------------------------------------------------------------------------

/// Drives embedding, layer chain and head for one loaded model.
#[derive(Debug)]
pub struct ForwardEngine {
    /// `U32[1] -> float[1, hidden]`.
    embedding: SubnetHandle,
    /// Layer blocks and carried state.
    chain: StateChain,
    /// `float[1, hidden] -> F32[1, vocab]`.
    lm_head: SubnetHandle,
    /// `F32[1, vocab] -> U32[1]`, when the model ships one.
    greedy_head: Option<SubnetHandle>,
    /// Embedding output format to block activation format.
    conversion: FormatConversion,
    /// Size of the head's output.
    vocab_size: usize,
    /// Set when a pass failed part-way.
    corrupted: bool,
    /// Head launches since load.
    head_launches: u64,
    /// Whether the `lm_head` output holds logits for the carried state.
    has_logits: bool,
}

impl ForwardEngine {
    /// Resolve and validate the model's sub-networks.
    ///
    /// Blocks are discovered as `block_0`, `block_1`, ... until a name is
    /// missing.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::ModelLoad`] if a required sub-network is
    /// missing or its declared buffers do not fit the pipeline.
    pub fn load<R: Runtime + ?Sized>(rt: &R) -> Result<Self> {
        let embedding = SubnetHandle::resolve(rt, EMBEDDING)?;
        let mut blocks = Vec::new();
        while rt.find_subnet(&block_name(blocks.len())).is_some() {
            blocks.push(SubnetHandle::resolve(rt, &block_name(blocks.len()))?);
        }
        let chain = StateChain::new(blocks)?;
        let activation = chain.activation_desc();

        let embed_stage = embedding.stage(0)?;
        let token_desc = TensorDesc::new(ElemFormat::U32, [1]);
        let embed_out = match (embed_stage.inputs.as_slice(), embed_stage.outputs.as_slice()) {
            ([input], [output]) if *input == token_desc => output,
            _ => {
                return Err(ChainError::ModelLoad(format!(
                    "`{EMBEDDING}` must map {token_desc} to one activation"
                )));
            }
        };
        if !embed_out.format.is_float() || embed_out.elem_count() != activation.elem_count() {
            return Err(ChainError::ModelLoad(format!(
                "`{EMBEDDING}` output {embed_out} does not fit block input {activation}"
            )));
        }
        let conversion = FormatConversion::new(embed_out.format, activation.format);

        let lm_head = SubnetHandle::resolve(rt, LM_HEAD)?;
        let head_stage = lm_head.stage(0)?;
        let vocab_size = match (head_stage.inputs.as_slice(), head_stage.outputs.as_slice()) {
            ([input], [output]) if input == activation && output.format == ElemFormat::F32 => {
                output.elem_count()
            }
            _ => {
                return Err(ChainError::ModelLoad(format!(
                    "`{LM_HEAD}` must map {activation} to f32 logits"
                )));
            }
        };

        let greedy_head = match rt.find_subnet(GREEDY_HEAD) {
            Some(_) => {
                let handle = SubnetHandle::resolve(rt, GREEDY_HEAD)?;
                let stage = handle.stage(0)?;
                let logits = TensorDesc::new(ElemFormat::F32, [1, vocab_size]);
                if stage.inputs != [logits] || stage.outputs != [token_desc] {
                    return Err(ChainError::ModelLoad(format!(
                        "`{GREEDY_HEAD}` must map f32[1, {vocab_size}] to u32[1]"
                    )));
                }
                Some(handle)
            }
            None => None,
        };

        tracing::info!(
            layers = chain.num_layers(),
            state = %chain.state_desc(),
            vocab_size,
            from = %conversion.from,
            to = %conversion.to,
            device_greedy = greedy_head.is_some(),
            "pipeline loaded"
        );

        Ok(Self {
            embedding,
            chain,
            lm_head,
            greedy_head,
            conversion,
            vocab_size,
            corrupted: false,
            head_launches: 0,
            has_logits: false,
        })
    }

    // --- accessors -------------------------------------------------------

    /// Number of layer blocks.
    #[must_use]
    pub fn num_layers(&self) -> usize {
        self.chain.num_layers()
    }

    /// Vocabulary size.
    #[must_use]
    pub const fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// The layer chain.
    #[must_use]
    pub const fn chain(&self) -> &StateChain {
        &self.chain
    }

    /// The embedding-to-block conversion contract.
    #[must_use]
    pub const fn conversion(&self) -> FormatConversion {
        self.conversion
    }

    /// Whether a failed pass has left the carried state undefined.
    #[must_use]
    pub const fn is_corrupted(&self) -> bool {
        self.corrupted
    }

    /// Whether the model ships a device-side argmax head.
    #[must_use]
    pub const fn has_greedy_head(&self) -> bool {
        self.greedy_head.is_some()
    }

    /// `lm_head` launches since load.
    #[must_use]
    pub const fn head_launches(&self) -> u64 {
        self.head_launches
    }

    /// Read the state that seeds the next pass.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::SessionCorrupted`] after a failed pass, or a
    /// runtime read error.
    pub fn read_carried_state<R: Runtime + ?Sized>(&self, rt: &R) -> Result<HostData> {
        self.ensure_usable()?;
        self.chain.read_carried_state(rt)
    }

    // --- passes ----------------------------------------------------------

    /// Zero the carried state and clear the corrupted flag.
    pub fn reset(&mut self) {
        self.chain.reset();
        if self.corrupted {
            tracing::info!("corrupted state discarded");
        }
        self.corrupted = false;
        self.has_logits = false;
    }

    /// Feed a whole prompt and return the logits after its last token.
    ///
    /// # Errors
    ///
    /// - [`ChainError::SessionCorrupted`] after an earlier failed pass.
    /// - [`ChainError::EmptyInput`] for an empty prompt.
    /// - [`ChainError::TokenOutOfRange`] for an id outside the vocabulary.
    ///
    /// None of these touch the device. Handoff and launch failures are
    /// propagated unchanged and corrupt the engine.
    pub fn run_prefill<R: Runtime + ?Sized>(&mut self, rt: &mut R, tokens: &[u32]) -> Result<Logits> {
        self.ensure_usable()?;
        self.check_prompt(tokens)?;
        let (&last, rest) = tokens
            .split_last()
            .ok_or_else(|| ChainError::EmptyInput("prefill needs at least one token".into()))?;
        tracing::debug!(
            tokens = tokens.len(),
            fresh = self.chain.carried() == CarriedState::Zero,
            "prefill"
        );

        let result = self.prefill_inner(rt, rest, last);
        self.guard(result)
    }

    /// Feed one token and return the logits it produces.
    ///
    /// # Errors
    ///
    /// Same as [`Self::run_prefill`], minus the empty case.
    pub fn run_step<R: Runtime + ?Sized>(&mut self, rt: &mut R, token: u32) -> Result<Logits> {
        self.ensure_usable()?;
        self.check_token(token)?;
        tracing::trace!(token, "step");
        let result = self.prefill_inner(rt, &[], token);
        self.guard(result)
    }

    /// Run `greedy_head` over the current `lm_head` output.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::UnsupportedSamplingMode`] when the model has
    /// no `greedy_head`, [`ChainError::EmptyInput`] when no pass has run
    /// since load or reset, or a launch failure. The carried state is not
    /// involved, so a failure here does not corrupt the engine.
    pub fn greedy_on_device<R: Runtime + ?Sized>(&self, rt: &mut R) -> Result<u32> {
        self.ensure_usable()?;
        let head = self.greedy_head.as_ref().ok_or_else(|| {
            ChainError::UnsupportedSamplingMode(format!("device greedy (no `{GREEDY_HEAD}`)"))
        })?;
        if !self.has_logits {
            return Err(ChainError::EmptyInput(
                "no logits to sample; run a prefill or step first".into(),
            ));
        }
        invoke(
            rt,
            head,
            0,
            &[Binding::Copy {
                input: 0,
                src: self.lm_head.output(0, 0),
            }],
        )?;
        match rt.copy_d2h(head.output(0, 0))? {
            HostData::U32(ids) => ids.first().copied().ok_or_else(|| {
                ChainError::ShapeMismatch(format!("`{GREEDY_HEAD}` produced no token"))
            }),
            other => Err(ChainError::ShapeMismatch(format!(
                "`{GREEDY_HEAD}` produced {} data",
                other.format()
            ))),
        }
    }

    // --- internals -------------------------------------------------------

    /// Refuse work while the carried state is undefined.
    const fn ensure_usable(&self) -> Result<()> {
        if self.corrupted {
            Err(ChainError::SessionCorrupted)
        } else {
            Ok(())
        }
    }

    /// Check a prompt without touching the device.
    ///
    /// # Errors
    ///
    /// [`ChainError::EmptyInput`] for an empty prompt,
    /// [`ChainError::TokenOutOfRange`] for an id outside the vocabulary.
    pub fn check_prompt(&self, tokens: &[u32]) -> Result<()> {
        if tokens.is_empty() {
            return Err(ChainError::EmptyInput("prefill needs at least one token".into()));
        }
        tokens.iter().try_for_each(|&t| self.check_token(t))
    }

    /// Reject ids the embedding cannot look up.
    fn check_token(&self, token: u32) -> Result<()> {
        if !usize::try_from(token).is_ok_and(|t| t < self.vocab_size) {
            return Err(ChainError::TokenOutOfRange {
                token,
                vocab_size: self.vocab_size,
            });
        }
        Ok(())
    }

    /// Mark the engine corrupted if a pass failed.
    fn guard<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.corrupted = true;
            tracing::error!(error = %e, "forward pass failed; carried state is undefined until reset");
        }
        result
    }

    /// Run headless passes for `warmup`, then a full pass for `last`.
    fn prefill_inner<R: Runtime + ?Sized>(
        &mut self,
        rt: &mut R,
        warmup: &[u32],
        last: u32,
    ) -> Result<Logits> {
        for &token in warmup {
            self.forward_token(rt, token)?;
        }
        let activation = self.forward_token(rt, last)?;
        invoke(
            rt,
            &self.lm_head,
            0,
            &[Binding::Copy {
                input: 0,
                src: activation,
            }],
        )?;
        self.head_launches += 1;
        self.has_logits = true;
        let logits = rt.copy_d2h(self.lm_head.output(0, 0))?;
        Ok(Logits::new(logits.to_f32_vec()))
    }

    /// Embed `token` and run the layer chain; returns the last activation.
    fn forward_token<R: Runtime + ?Sized>(
        &mut self,
        rt: &mut R,
        token: u32,
    ) -> Result<BufferRef> {
        let id = HostData::U32(vec![token]);
        invoke(
            rt,
            &self.embedding,
            0,
            &[Binding::Upload {
                input: 0,
                data: &id,
            }],
        )?;
        self.chain
            .run_layers(rt, self.embedding.output(0, 0), self.conversion)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::runtime::{HostRuntime, StageInfo};
    use candle_core::{DType, Tensor};

    /// Embedding emits `[id, id]` as f16; one block adds the activation
    /// into the state; the head scores `[0, x0, x1]`.
    fn tiny(rt: &mut HostRuntime) {
        let act16 = TensorDesc::new(ElemFormat::F16, [1, 2]);
        let act = TensorDesc::new(ElemFormat::BF16, [1, 2]);
        let state = TensorDesc::new(ElemFormat::BF16, [1, 2]);
        rt.register(
            EMBEDDING,
            vec![StageInfo {
                inputs: vec![TensorDesc::new(ElemFormat::U32, [1])],
                outputs: vec![act16],
            }],
            |inputs: &[Tensor]| -> Result<Vec<Tensor>> {
                let [id] = inputs else {
                    return Err(ChainError::ShapeMismatch("one input".into()));
                };
                let x = id.to_dtype(DType::F32)?.reshape((1, 1))?.repeat((1, 2))?;
                Ok(vec![x.to_dtype(DType::F16)?])
            },
        )
        .unwrap();
        rt.register(
            "block_0",
            vec![StageInfo {
                inputs: vec![act.clone(), state.clone()],
                outputs: vec![act.clone(), state],
            }],
            |inputs: &[Tensor]| -> Result<Vec<Tensor>> {
                let [x, s] = inputs else {
                    return Err(ChainError::ShapeMismatch("two inputs".into()));
                };
                let s = (s + x)?;
                Ok(vec![s.clone(), s])
            },
        )
        .unwrap();
        rt.register(
            LM_HEAD,
            vec![StageInfo {
                inputs: vec![act],
                outputs: vec![TensorDesc::new(ElemFormat::F32, [1, 3])],
            }],
            |inputs: &[Tensor]| -> Result<Vec<Tensor>> {
                let [x] = inputs else {
                    return Err(ChainError::ShapeMismatch("one input".into()));
                };
                let zero = Tensor::zeros((1, 1), DType::F32, x.device())?;
                Ok(vec![Tensor::cat(&[&zero, &x.to_dtype(DType::F32)?], 1)?])
            },
        )
        .unwrap();
    }

    #[test]
    fn load_discovers_layout() {
        let mut rt = HostRuntime::cpu();
        tiny(&mut rt);
        let engine = ForwardEngine::load(&rt).unwrap();
        assert_eq!(engine.num_layers(), 1);
        assert_eq!(engine.vocab_size(), 3);
        assert_eq!(
            engine.conversion(),
            FormatConversion::new(ElemFormat::F16, ElemFormat::BF16)
        );
        assert!(!engine.has_greedy_head());
    }

    #[test]
    fn missing_lm_head_is_model_load() {
        let mut rt = HostRuntime::cpu();
        rt.register(
            EMBEDDING,
            vec![StageInfo {
                inputs: vec![TensorDesc::new(ElemFormat::U32, [1])],
                outputs: vec![TensorDesc::new(ElemFormat::F32, [1, 2])],
            }],
            |inputs: &[Tensor]| -> Result<Vec<Tensor>> { Ok(inputs.to_vec()) },
        )
        .unwrap();
        let err = ForwardEngine::load(&rt).unwrap_err();
        assert!(matches!(err, ChainError::ModelLoad(_)));
    }

    #[test]
    fn prefill_accumulates_state_and_runs_head_once() {
        let mut rt = HostRuntime::cpu();
        tiny(&mut rt);
        let mut engine = ForwardEngine::load(&rt).unwrap();
        let logits = engine.run_prefill(&mut rt, &[1, 2]).unwrap();
        assert_eq!(logits.as_slice(), &[0.0, 3.0, 3.0]);
        assert_eq!(engine.head_launches(), 1);
        let logits = engine.run_step(&mut rt, 2).unwrap();
        assert_eq!(logits.into_vec(), vec![0.0, 5.0, 5.0]);
        assert_eq!(engine.head_launches(), 2);
    }

    #[test]
    fn input_errors_leave_engine_usable() {
        let mut rt = HostRuntime::cpu();
        tiny(&mut rt);
        let mut engine = ForwardEngine::load(&rt).unwrap();
        assert!(matches!(
            engine.run_prefill(&mut rt, &[]).unwrap_err(),
            ChainError::EmptyInput(_)
        ));
        assert!(matches!(
            engine.run_step(&mut rt, 3).unwrap_err(),
            ChainError::TokenOutOfRange { token: 3, vocab_size: 3 }
        ));
        assert!(!engine.is_corrupted());
        assert_eq!(rt.stats().launches, 0);
        engine.run_step(&mut rt, 1).unwrap();
    }

    #[test]
    fn device_greedy_requires_head() {
        let mut rt = HostRuntime::cpu();
        tiny(&mut rt);
        let mut engine = ForwardEngine::load(&rt).unwrap();
        engine.run_step(&mut rt, 1).unwrap();
        assert!(matches!(
            engine.greedy_on_device(&mut rt).unwrap_err(),
            ChainError::UnsupportedSamplingMode(_)
        ));
        assert!(!engine.is_corrupted());
    }
}
