// SPDX-License-Identifier: MIT OR Apache-2.0

//! RWKV-6 "Finch" split into host-runtime sub-networks.
//!
//! A `HuggingFace` RWKV-6 checkpoint is cut into the same pieces a compiled
//! accelerator model exposes, one [`SubnetKernel`] each:
//!
//! ```text
//! embedding   : u32[1]                        -> f16[1, H]
//! block_<i>   : (bf16[1, H], bf16[ROWS, H])   -> (bf16[1, H], bf16[ROWS, H])
//! lm_head     : bf16[1, H]                    -> f32[1, V]
//! greedy_head : f32[1, V]                     -> u32[1]
//! ```
//!
//! The state buffer holds the recurrent state of every layer,
//! `ROWS = num_layers * (head_dim + 2)`. Block `i` owns rows
//! `i * (head_dim + 2)..(i + 1) * (head_dim + 2)`:
//!
//! | Row offset | Content |
//! |------------|---------|
//! | `0` | time-mix token-shift input (`att_x`) |
//! | `1` | channel-mix token-shift input (`ffn_x`) |
//! | `2..2 + head_dim` | WKV matrices, row `k` holding `S[h][k][v]` at column `h * head_dim + v` |
//!
//! and copies every other row through unchanged, so the buffer leaving the
//! last block is the state the first block needs for the next token.

pub mod config;
pub(crate) mod norm;
pub mod weights;

use std::fmt::Display;
use std::path::Path;

use candle_core::{D, DType, IndexOp, Module, Tensor};
use candle_nn::{Embedding, Linear, VarBuilder};

use crate::engine::{EMBEDDING, GREEDY_HEAD, LM_HEAD, block_name};
use crate::error::{ChainError, Result};
use crate::runtime::{ElemFormat, HostRuntime, StageInfo, SubnetKernel, TensorDesc};

use self::norm::LayerNorm;
pub use config::{RWKV6_MODEL_TYPE, Rwkv6Config};

// ---------------------------------------------------------------------------
// Model directory loading
// ---------------------------------------------------------------------------

/// Load `config.json` and the safetensors weights from `dir` and register
/// the sub-networks on `rt`.
///
/// Weights are kept in `BF16` on CUDA and `F32` on the CPU.
///
/// # Errors
///
/// Returns [`ChainError::ModelLoad`] if a file is missing or malformed,
/// the architecture is not RWKV-6, or a tensor is absent.
pub fn load_model_dir(rt: &mut HostRuntime, dir: &Path) -> Result<Rwkv6Config> {
    let config_path = dir.join("config.json");
    let config_str = std::fs::read_to_string(&config_path)
        .map_err(|e| ChainError::ModelLoad(format!("read {}: {e}", config_path.display())))?;
    let json: serde_json::Value = serde_json::from_str(&config_str)
        .map_err(|e| ChainError::ModelLoad(format!("parse {}: {e}", config_path.display())))?;
    let config = Rwkv6Config::from_hf_config(&json)
        .map_err(|e| ChainError::ModelLoad(e.to_string()))?;

    let paths = weights::resolve_safetensors_paths(dir)?;
    // BORROW: explicit .clone(); rt is borrowed mutably while registering
    let device = rt.device().clone();
    let dtype = if device.is_cuda() {
        DType::BF16
    } else {
        DType::F32
    };
    let vb = weights::create_var_builder(&paths, dtype, &device)?;
    register_model(rt, &config, vb)?;

    tracing::info!(
        dir = %dir.display(),
        layers = config.num_layers,
        hidden = config.hidden_size,
        vocab = config.vocab_size,
        ?dtype,
        "RWKV-6 model loaded"
    );
    Ok(config)
}

/// Register `embedding`, `block_<i>`, `lm_head` and `greedy_head` on `rt`.
///
/// # Weight paths
///
/// | Component | Path |
/// |-----------|------|
/// | Embeddings | `rwkv.embeddings` |
/// | Blocks | `rwkv.blocks.{i}` (`pre_ln` on block 0 only) |
/// | Final norm | `rwkv.ln_out` |
/// | LM head | `head` (or the embeddings when tied) |
///
/// # Errors
///
/// Returns [`ChainError::ModelLoad`] naming the component whose weights
/// are missing or mis-shaped.
#[allow(clippy::needless_pass_by_value)] // VarBuilder convention
pub fn register_model(rt: &mut HostRuntime, config: &Rwkv6Config, vb: VarBuilder<'_>) -> Result<()> {
    let h = config.hidden_size;
    let vocab = config.vocab_size;
    let dtype = vb.dtype();
    let activation = TensorDesc::new(ElemFormat::BF16, [1, h]);
    let state = TensorDesc::new(ElemFormat::BF16, [config.state_rows(), h]);
    let logits = TensorDesc::new(ElemFormat::F32, [1, vocab]);
    let token = TensorDesc::new(ElemFormat::U32, [1]);

    let vb_rwkv = vb.pp("rwkv");
    let embeddings = loading("embeddings", || {
        Ok(candle_nn::embedding(vocab, h, vb_rwkv.pp("embeddings"))?)
    })?;
    rt.register(
        EMBEDDING,
        vec![StageInfo {
            inputs: vec![token.clone()],
            outputs: vec![TensorDesc::new(ElemFormat::F16, [1, h])],
        }],
        EmbeddingKernel {
            // BORROW: explicit .clone(); a tied head reuses the matrix
            embeddings: embeddings.clone(),
        },
    )?;

    for i in 0..config.num_layers {
        let block = loading(format!("block {i}"), || {
            BlockKernel::load(config, vb_rwkv.pp(format!("blocks.{i}")), i, dtype)
        })?;
        rt.register(
            block_name(i),
            vec![StageInfo {
                inputs: vec![activation.clone(), state.clone()],
                outputs: vec![activation.clone(), state.clone()],
            }],
            block,
        )?;
    }

    let head = loading("head", || {
        let ln_out = LayerNorm::load(h, config.norm_eps, vb_rwkv.pp("ln_out"))?;
        let proj = if config.tie_word_embeddings {
            Linear::new(embeddings.embeddings().clone(), None)
        } else {
            candle_nn::linear_no_bias(h, vocab, vb.pp("head"))?
        };
        Ok(HeadKernel { ln_out, proj, dtype })
    })?;
    rt.register(
        LM_HEAD,
        vec![StageInfo {
            inputs: vec![activation],
            outputs: vec![logits.clone()],
        }],
        head,
    )?;

    rt.register(
        GREEDY_HEAD,
        vec![StageInfo {
            inputs: vec![logits],
            outputs: vec![token],
        }],
        |inputs: &[Tensor]| -> Result<Vec<Tensor>> {
            Ok(vec![input(inputs, 0)?.argmax(D::Minus1)?])
        },
    )?;

    tracing::debug!(
        layers = config.num_layers,
        state_rows = config.state_rows(),
        "registered RWKV-6 sub-networks"
    );
    Ok(())
}

/// Run a loading step, reporting any failure as [`ChainError::ModelLoad`].
fn loading<T>(what: impl Display, load: impl FnOnce() -> Result<T>) -> Result<T> {
    load().map_err(|e| ChainError::ModelLoad(format!("{what}: {e}")))
}

/// Kernel input `idx`.
fn input(inputs: &[Tensor], idx: usize) -> Result<&Tensor> {
    inputs
        .get(idx)
        .ok_or_else(|| ChainError::ShapeMismatch(format!("kernel input {idx} not bound")))
}

// ---------------------------------------------------------------------------
// Embedding and head
// ---------------------------------------------------------------------------

/// Token id → embedding row.
struct EmbeddingKernel {
    /// `[vocab, hidden]`.
    embeddings: Embedding,
}

impl SubnetKernel for EmbeddingKernel {
    fn forward(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        let row = self.embeddings.forward(input(inputs, 0)?)?;
        Ok(vec![row.to_dtype(DType::F16)?])
    }
}

/// Final `LayerNorm` and vocabulary projection.
struct HeadKernel {
    /// `rwkv.ln_out`.
    ln_out: LayerNorm,
    /// `hidden → vocab`, no bias.
    proj: Linear,
    /// Weight dtype.
    dtype: DType,
}

impl SubnetKernel for HeadKernel {
    fn forward(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        let x = input(inputs, 0)?.to_dtype(self.dtype)?;
        let logits = self.proj.forward(&self.ln_out.forward(&x)?)?;
        Ok(vec![logits.to_dtype(DType::F32)?])
    }
}

// ---------------------------------------------------------------------------
// Block
// ---------------------------------------------------------------------------

/// One RWKV-6 block over the packed state: `LN1 → TimeMix → residual →
/// LN2 → ChannelMix → residual`.
struct BlockKernel {
    /// Block index; selects the state rows.
    layer: usize,
    /// Applied to the embedding before block 0 only.
    pre_ln: Option<LayerNorm>,
    /// Before time-mix.
    ln1: LayerNorm,
    /// Before channel-mix.
    ln2: LayerNorm,
    /// Recurrence.
    time_mix: TimeMix,
    /// Feed-forward.
    channel_mix: ChannelMix,
    /// Weight dtype; inputs are cast to it.
    dtype: DType,
}

impl BlockKernel {
    /// Load block `layer` from `rwkv.blocks.{layer}`.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder convention
    fn load(config: &Rwkv6Config, vb: VarBuilder<'_>, layer: usize, dtype: DType) -> Result<Self> {
        let h = config.hidden_size;
        let eps = config.norm_eps;
        let pre_ln = if layer == 0 {
            Some(LayerNorm::load(h, eps, vb.pp("pre_ln"))?)
        } else {
            None
        };
        Ok(Self {
            layer,
            pre_ln,
            ln1: LayerNorm::load(h, eps, vb.pp("ln1"))?,
            ln2: LayerNorm::load(h, eps, vb.pp("ln2"))?,
            time_mix: TimeMix::load(config, vb.pp("attention"))?,
            channel_mix: ChannelMix::load(config, vb.pp("feed_forward"))?,
            dtype,
        })
    }
}

impl SubnetKernel for BlockKernel {
    /// # Shapes
    /// - `inputs[0]`: `[1, hidden]` activation
    /// - `inputs[1]`: `[state_rows, hidden]` packed state
    /// - returns: the same two shapes, `BF16`
    fn forward(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        let x = input(inputs, 0)?.to_dtype(self.dtype)?;
        let state = input(inputs, 1)?;
        let (_, h) = state.dims2()?;
        let hs = self.time_mix.head_dim;
        let nh = self.time_mix.num_heads;
        let base = self.layer * (hs + 2);

        let att_x = state.narrow(0, base, 1)?.to_dtype(self.dtype)?;
        let ffn_x = state.narrow(0, base + 1, 1)?.to_dtype(self.dtype)?;
        // PROMOTE: WKV recurrence must be in F32 for numerical stability
        // CONTIGUOUS: transpose to [heads, key, value] before matmul
        let wkv = state
            .narrow(0, base + 2, hs)?
            .to_dtype(DType::F32)?
            .reshape((hs, nh, hs))?
            .transpose(0, 1)?
            .contiguous()?;

        let x = match &self.pre_ln {
            Some(pre_ln) => pre_ln.forward(&x)?,
            None => x,
        };
        let xa = self.ln1.forward(&x)?;
        let (att_out, wkv) = self.time_mix.forward(&xa, &att_x, &wkv)?;
        let x = (x + att_out)?;
        let xf = self.ln2.forward(&x)?;
        let x = (&x + self.channel_mix.forward(&xf, &ffn_x)?)?;

        // CONTIGUOUS: back to [key, heads * value] before flattening
        let wkv_rows = wkv.transpose(0, 1)?.contiguous()?.reshape((hs, nh * hs))?;
        let rows = Tensor::cat(
            &[
                xa.to_dtype(DType::F32)?,
                xf.to_dtype(DType::F32)?,
                wkv_rows,
            ],
            0,
        )?
        .to_dtype(DType::BF16)?;
        let state = state.slice_assign(&[base..base + hs + 2, 0..h], &rows)?;

        Ok(vec![x.to_dtype(DType::BF16)?, state])
    }
}

// ---------------------------------------------------------------------------
// TimeMix
// ---------------------------------------------------------------------------

/// RWKV-6 time-mix: data-dependent token shift and the WKV recurrence,
/// one token at a time.
struct TimeMix {
    /// Base shift mix, `[1, hidden]`.
    time_maa_x: Tensor,
    /// Shift mixes for decay, key, value, receptance and gate, `[1, hidden]` each.
    time_maa: [Tensor; 5],
    /// `[hidden, 5 * time_mix_extra_dim]`.
    time_maa_w1: Tensor,
    /// `[5, time_mix_extra_dim, hidden]`.
    time_maa_w2: Tensor,
    /// Decay bias, `[1, hidden]`.
    time_decay: Tensor,
    /// `[hidden, time_decay_extra_dim]`.
    time_decay_w1: Tensor,
    /// `[time_decay_extra_dim, hidden]`.
    time_decay_w2: Tensor,
    /// Current-token bonus, `[heads, head_dim, 1]`, `F32`.
    time_first: Tensor,
    /// Receptance projection.
    receptance: Linear,
    /// Key projection.
    key: Linear,
    /// Value projection.
    value: Linear,
    /// Gate projection.
    gate: Linear,
    /// Output projection.
    output: Linear,
    /// `GroupNorm` scale, `F32`.
    ln_x_weight: Tensor,
    /// `GroupNorm` shift, `F32`.
    ln_x_bias: Tensor,
    /// Head count.
    num_heads: usize,
    /// Head size.
    head_dim: usize,
    /// `GroupNorm` epsilon.
    group_norm_eps: f64,
    /// Rank of the shift `LoRA`.
    time_mix_extra_dim: usize,
}

impl TimeMix {
    #[allow(clippy::needless_pass_by_value)] // VarBuilder convention
    fn load(config: &Rwkv6Config, vb: VarBuilder<'_>) -> Result<Self> {
        let h = config.hidden_size;
        let ah = config.num_heads * config.head_dim;
        let nh = config.num_heads;
        let hs = config.head_dim;
        let mix_extra = config.time_mix_extra_dim;
        let decay_extra = config.time_decay_extra_dim;
        let maa = |name: &str| -> Result<Tensor> { Ok(vb.get((1, 1, h), name)?.reshape((1, h))?) };

        Ok(Self {
            time_maa_x: maa("time_maa_x")?,
            time_maa: [
                maa("time_maa_w")?,
                maa("time_maa_k")?,
                maa("time_maa_v")?,
                maa("time_maa_r")?,
                maa("time_maa_g")?,
            ],
            time_maa_w1: vb.get((h, mix_extra * 5), "time_maa_w1")?,
            time_maa_w2: vb.get((5, mix_extra, h), "time_maa_w2")?,
            time_decay: vb.get((1, 1, ah), "time_decay")?.reshape((1, ah))?,
            time_decay_w1: vb.get((h, decay_extra), "time_decay_w1")?,
            time_decay_w2: vb.get((decay_extra, ah), "time_decay_w2")?,
            time_first: vb
                .get((nh, hs), "time_faaaa")?
                .to_dtype(DType::F32)?
                .reshape((nh, hs, 1))?,
            receptance: candle_nn::linear_no_bias(h, ah, vb.pp("receptance"))?,
            key: candle_nn::linear_no_bias(h, ah, vb.pp("key"))?,
            value: candle_nn::linear_no_bias(h, ah, vb.pp("value"))?,
            gate: candle_nn::linear_no_bias(h, ah, vb.pp("gate"))?,
            output: candle_nn::linear_no_bias(ah, h, vb.pp("output"))?,
            ln_x_weight: vb.get(ah, "ln_x.weight")?.to_dtype(DType::F32)?,
            ln_x_bias: vb.get(ah, "ln_x.bias")?.to_dtype(DType::F32)?,
            num_heads: nh,
            head_dim: hs,
            group_norm_eps: config.group_norm_eps(),
            time_mix_extra_dim: mix_extra,
        })
    }

    /// # Shapes
    /// - `x`: `[1, hidden]` (after `ln1`)
    /// - `shift`: `[1, hidden]`, previous token's `x`
    /// - `wkv`: `[heads, head_dim, head_dim]`, `F32`
    /// - returns: `(output [1, hidden], new wkv [heads, head_dim, head_dim])`
    #[allow(clippy::many_single_char_names)]
    fn forward(&self, x: &Tensor, shift: &Tensor, wkv: &Tensor) -> Result<(Tensor, Tensor)> {
        let nh = self.num_heads;
        let hs = self.head_dim;

        let xx = (shift - x)?;
        let xxx = (x + xx.broadcast_mul(&self.time_maa_x)?)?;
        // [1, 5 * extra] -> [5, 1, extra] -> [5, 1, hidden]
        let mixed = xxx
            .matmul(&self.time_maa_w1)?
            .tanh()?
            .reshape((5, 1, self.time_mix_extra_dim))?
            .matmul(&self.time_maa_w2)?;

        let mut lerped = Vec::with_capacity(5);
        for (idx, maa) in self.time_maa.iter().enumerate() {
            let m = maa.broadcast_add(&mixed.i(idx)?)?;
            lerped.push((x + (&xx * m)?)?);
        }
        let [xw, xk, xv, xr, xg] = lerped.as_slice() else {
            return Err(ChainError::ShapeMismatch("token-shift mix lost a component".into()));
        };

        let r = self.receptance.forward(xr)?;
        let k = self.key.forward(xk)?;
        let v = self.value.forward(xv)?;
        let g = candle_nn::ops::silu(&self.gate.forward(xg)?)?;
        let w = self.time_decay.broadcast_add(
            &xw.matmul(&self.time_decay_w1)?
                .tanh()?
                .matmul(&self.time_decay_w2)?,
        )?;

        // PROMOTE: WKV recurrence must be in F32 for numerical stability
        // decay = exp(-exp(w))
        let decay = w
            .to_dtype(DType::F32)?
            .exp()?
            .neg()?
            .exp()?
            .reshape((nh, hs, 1))?;
        let r = r.to_dtype(DType::F32)?.reshape((nh, 1, hs))?;
        let k = k.to_dtype(DType::F32)?.reshape((nh, hs, 1))?;
        let v = v.to_dtype(DType::F32)?.reshape((nh, 1, hs))?;

        // out = r @ (time_first * kv + S); S' = kv + decay * S
        let kv = k.matmul(&v)?;
        let read = (kv.broadcast_mul(&self.time_first)? + wkv)?;
        let out = r.matmul(&read)?.reshape((1, nh * hs))?;
        let wkv = (kv + wkv.broadcast_mul(&decay)?)?;

        let out = norm::group_norm(
            &out,
            nh,
            &self.ln_x_weight,
            &self.ln_x_bias,
            self.group_norm_eps,
        )?
        .to_dtype(x.dtype())?;
        let out = self.output.forward(&(out * g)?)?;
        Ok((out, wkv))
    }
}

// ---------------------------------------------------------------------------
// ChannelMix
// ---------------------------------------------------------------------------

/// RWKV-6 channel-mix: `sigmoid(receptance(x_r)) * value(relu(key(x_k))^2)`.
struct ChannelMix {
    /// Key-path shift mix, `[1, hidden]`.
    time_maa_k: Tensor,
    /// Receptance-path shift mix, `[1, hidden]`.
    time_maa_r: Tensor,
    /// `hidden → intermediate`.
    key: Linear,
    /// `hidden → hidden`.
    receptance: Linear,
    /// `intermediate → hidden`.
    value: Linear,
}

impl ChannelMix {
    #[allow(clippy::needless_pass_by_value)] // VarBuilder convention
    fn load(config: &Rwkv6Config, vb: VarBuilder<'_>) -> Result<Self> {
        let h = config.hidden_size;
        let inner = config.intermediate_size;
        Ok(Self {
            time_maa_k: vb.get((1, 1, h), "time_maa_k")?.reshape((1, h))?,
            time_maa_r: vb.get((1, 1, h), "time_maa_r")?.reshape((1, h))?,
            key: candle_nn::linear_no_bias(h, inner, vb.pp("key"))?,
            receptance: candle_nn::linear_no_bias(h, h, vb.pp("receptance"))?,
            value: candle_nn::linear_no_bias(inner, h, vb.pp("value"))?,
        })
    }

    /// # Shapes
    /// - `x`, `shift`: `[1, hidden]`
    /// - returns: `[1, hidden]`
    fn forward(&self, x: &Tensor, shift: &Tensor) -> Result<Tensor> {
        let xx = (shift - x)?;
        let xk = (x + xx.broadcast_mul(&self.time_maa_k)?)?;
        let xr = (x + xx.broadcast_mul(&self.time_maa_r)?)?;
        let k = self.key.forward(&xk)?.relu()?.sqr()?;
        let v = self.value.forward(&k)?;
        let r = candle_nn::ops::sigmoid(&self.receptance.forward(&xr)?)?;
        Ok((r * v)?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;

    use candle_core::Device;
    use half::bf16;

    use super::*;
    use crate::runtime::{BufferRef, HostData, Runtime};
    use crate::session::{Session, SessionConfig};

    /// hidden 8, two heads of 4, two layers, vocab 16.
    fn tiny_config() -> Rwkv6Config {
        Rwkv6Config::from_hf_config(&serde_json::json!({
            "model_type": "rwkv6",
            "hidden_size": 8,
            "num_hidden_layers": 2,
            "num_attention_heads": 4,
            "vocab_size": 16,
            "intermediate_size": 16
        }))
        .unwrap()
    }

    /// Deterministic, non-degenerate values.
    #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
    fn pattern(shape: &[usize], salt: usize) -> Tensor {
        let n: usize = shape.iter().product();
        let values: Vec<f32> = (0..n)
            .map(|i| ((i as f32).mul_add(0.618, salt as f32 * 1.37)).sin() * 0.5)
            .collect();
        Tensor::from_vec(values, shape, &Device::Cpu).unwrap()
    }

    /// Every tensor an RWKV-6 checkpoint of `config` holds.
    fn synthetic_weights(config: &Rwkv6Config) -> HashMap<String, Tensor> {
        let h = config.hidden_size;
        let (nh, hs) = (config.num_heads, config.head_dim);
        let mut shapes: Vec<(String, Vec<usize>)> = vec![
            ("rwkv.embeddings.weight".into(), vec![config.vocab_size, h]),
            ("rwkv.ln_out.weight".into(), vec![h]),
            ("rwkv.ln_out.bias".into(), vec![h]),
            ("head.weight".into(), vec![config.vocab_size, h]),
        ];
        for i in 0..config.num_layers {
            let p = format!("rwkv.blocks.{i}");
            let mut norms = vec!["ln1", "ln2"];
            if i == 0 {
                norms.push("pre_ln");
            }
            for n in norms {
                shapes.push((format!("{p}.{n}.weight"), vec![h]));
                shapes.push((format!("{p}.{n}.bias"), vec![h]));
            }
            for m in ["x", "w", "k", "v", "r", "g"] {
                shapes.push((format!("{p}.attention.time_maa_{m}"), vec![1, 1, h]));
            }
            shapes.push((format!("{p}.attention.time_maa_w1"), vec![h, 5 * 32]));
            shapes.push((format!("{p}.attention.time_maa_w2"), vec![5, 32, h]));
            shapes.push((format!("{p}.attention.time_decay"), vec![1, 1, h]));
            shapes.push((format!("{p}.attention.time_decay_w1"), vec![h, 64]));
            shapes.push((format!("{p}.attention.time_decay_w2"), vec![64, h]));
            shapes.push((format!("{p}.attention.time_faaaa"), vec![nh, hs]));
            for proj in ["receptance", "key", "value", "gate", "output"] {
                shapes.push((format!("{p}.attention.{proj}.weight"), vec![h, h]));
            }
            shapes.push((format!("{p}.attention.ln_x.weight"), vec![h]));
            shapes.push((format!("{p}.attention.ln_x.bias"), vec![h]));
            shapes.push((format!("{p}.feed_forward.time_maa_k"), vec![1, 1, h]));
            shapes.push((format!("{p}.feed_forward.time_maa_r"), vec![1, 1, h]));
            shapes.push((format!("{p}.feed_forward.key.weight"), vec![16, h]));
            shapes.push((format!("{p}.feed_forward.receptance.weight"), vec![h, h]));
            shapes.push((format!("{p}.feed_forward.value.weight"), vec![h, 16]));
        }
        shapes
            .into_iter()
            .enumerate()
            .map(|(salt, (name, shape))| (name, pattern(&shape, salt)))
            .collect()
    }

    fn tiny_runtime() -> HostRuntime {
        let config = tiny_config();
        let vb = VarBuilder::from_tensors(synthetic_weights(&config), DType::F32, &Device::Cpu);
        let mut rt = HostRuntime::cpu();
        register_model(&mut rt, &config, vb).unwrap();
        rt
    }

    #[test]
    fn registers_the_split() {
        let rt = tiny_runtime();
        assert_eq!(rt.subnet_count(), 2 + 3);
        let block = rt.find_subnet("block_1").unwrap();
        let info = rt.subnet_info(block).unwrap();
        let stage = info.stages.first().unwrap();
        assert_eq!(stage.inputs[1].shape, vec![12, 8]);
        assert_eq!(stage.inputs, stage.outputs);
        assert!(rt.find_subnet(GREEDY_HEAD).is_some());
    }

    #[test]
    fn prefill_equals_prefill_then_step() {
        let mut whole = Session::new(tiny_runtime(), SessionConfig::default()).unwrap();
        let mut split = Session::new(tiny_runtime(), SessionConfig::default()).unwrap();
        let a = whole.prefill(&[3, 7, 11]).unwrap();
        split.prefill(&[3, 7]).unwrap();
        let b = split.step(11).unwrap();
        assert_eq!(a.len(), 16);
        assert!(a.as_slice().iter().all(|x| x.is_finite()));
        assert_eq!(a, b);
        assert_eq!(whole.carried_state().unwrap(), split.carried_state().unwrap());
    }

    #[test]
    fn block_rewrites_only_its_rows() {
        let mut rt = tiny_runtime();
        let id = rt.find_subnet("block_1").unwrap();
        let x: Vec<bf16> = (0..8u8).map(|i| bf16::from_f32(0.1 * f32::from(i))).collect();
        let state: Vec<bf16> = (0..96u16)
            .map(|i| bf16::from_f32(f32::from(i % 7) * 0.05))
            .collect();
        rt.copy_h2d(BufferRef::input(id, 0, 0), &HostData::BF16(x)).unwrap();
        rt.copy_h2d(BufferRef::input(id, 0, 1), &HostData::BF16(state.clone()))
            .unwrap();
        rt.launch(id, 0).unwrap();

        let out = rt.copy_d2h(BufferRef::output(id, 0, 1)).unwrap().to_f32_vec();
        let before = HostData::BF16(state).to_f32_vec();
        // block 1 owns rows 6..12 of 8 columns
        assert_eq!(out[..48], before[..48]);
        assert_ne!(out[48..], before[48..]);
    }

    #[test]
    fn greedy_head_is_argmax() {
        let mut rt = tiny_runtime();
        let id = rt.find_subnet(GREEDY_HEAD).unwrap();
        let mut logits = vec![0.0_f32; 16];
        logits[5] = 3.0;
        logits[9] = 1.0;
        rt.copy_h2d(BufferRef::input(id, 0, 0), &HostData::F32(logits)).unwrap();
        rt.launch(id, 0).unwrap();
        assert_eq!(
            rt.copy_d2h(BufferRef::output(id, 0, 0)).unwrap(),
            HostData::U32(vec![5])
        );
    }

    #[test]
    fn missing_tensor_names_the_block() {
        let config = tiny_config();
        let mut weights = synthetic_weights(&config);
        weights.remove("rwkv.blocks.1.attention.time_faaaa");
        let vb = VarBuilder::from_tensors(weights, DType::F32, &Device::Cpu);
        let mut rt = HostRuntime::cpu();
        let err = register_model(&mut rt, &config, vb).unwrap_err();
        assert!(matches!(err, ChainError::ModelLoad(ref m) if m.starts_with("block 1")));
    }

    #[test]
    fn loads_a_model_directory() {
        let config = tiny_config();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            r#"{"model_type": "rwkv6", "hidden_size": 8, "num_hidden_layers": 2,
                "num_attention_heads": 4, "vocab_size": 16, "intermediate_size": 16}"#,
        )
        .unwrap();
        candle_core::safetensors::save(
            &synthetic_weights(&config),
            dir.path().join("model.safetensors"),
        )
        .unwrap();

        let mut rt = HostRuntime::cpu();
        let loaded = load_model_dir(&mut rt, dir.path()).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(rt.subnet_count(), 5);

        let mut rt = HostRuntime::cpu();
        let err = load_model_dir(&mut rt, &dir.path().join("absent")).unwrap_err();
        assert!(matches!(err, ChainError::ModelLoad(_)));
    }
}
