// SPDX-License-Identifier: MIT OR Apache-2.0

//! Stub model shared by the integration tests.
//!
//! Registers a small pipeline on a [`HostRuntime`]:
//!
//! - `embedding`: `u32[1] -> f16[1, 2]`, token `t` becomes `[t, 1]`.
//! - `block_i`: `(bf16[1, 2], bf16[L, 2])`; row `i` of the state becomes
//!   `0.5 * row + x`, every other row passes through, and the activation
//!   out is `x + 0.25 * row'`.
//! - `lm_head`: `bf16[1, 2] -> f32[1, VOCAB]`, a fixed linear map, plus
//!   `SCRIPT_BONUS` on the next scripted token if one is queued.
//! - `greedy_head` (optional): device argmax.
//!
//! Every launch is appended to a shared log with its inputs, and any
//! sub-network can be told to fail its next launch.

#![allow(
    dead_code,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::cast_precision_loss,
    clippy::as_conversions,
    missing_docs
)]

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use candle_core::{D, DType, Tensor};
use rwkv_chain::{
    ChainError, ElemFormat, HostRuntime, PrefillPolicy, Result, Session, SessionConfig, StageInfo,
    TensorDesc,
};

/// Output width of `lm_head`.
pub const VOCAB: usize = 16;

/// Logit added to a scripted token; dominates the linear map.
pub const SCRIPT_BONUS: f32 = 1000.0;

/// One recorded launch.
#[derive(Debug, Clone, PartialEq)]
pub struct Launch {
    /// Sub-network name.
    pub subnet: String,
    /// Inputs as seen by the kernel, widened to f32.
    pub inputs: Vec<Vec<f32>>,
}

/// Handles into a registered stub model.
#[derive(Clone, Default)]
pub struct StubModel {
    log: Arc<Mutex<Vec<Launch>>>,
    faults: Arc<Mutex<HashSet<String>>>,
    script: Arc<Mutex<VecDeque<u32>>>,
}

impl StubModel {
    /// Register a `layers`-block stub on `rt`.
    pub fn install(rt: &mut HostRuntime, layers: usize, greedy_head: bool) -> Self {
        let stub = Self::default();
        let act16 = TensorDesc::new(ElemFormat::F16, [1, 2]);
        let act = TensorDesc::new(ElemFormat::BF16, [1, 2]);
        let state = TensorDesc::new(ElemFormat::BF16, [layers, 2]);
        let logits = TensorDesc::new(ElemFormat::F32, [1, VOCAB]);
        let token = TensorDesc::new(ElemFormat::U32, [1]);

        let probe = stub.clone();
        rt.register(
            "embedding",
            vec![StageInfo {
                inputs: vec![token.clone()],
                outputs: vec![act16],
            }],
            move |inputs: &[Tensor]| -> Result<Vec<Tensor>> {
                probe.enter("embedding", inputs)?;
                let [id] = inputs else {
                    return Err(ChainError::ShapeMismatch("embedding takes one input".into()));
                };
                let id = id.to_dtype(DType::F32)?.reshape((1, 1))?;
                let one = Tensor::ones((1, 1), DType::F32, id.device())?;
                Ok(vec![Tensor::cat(&[&id, &one], 1)?.to_dtype(DType::F16)?])
            },
        )
        .unwrap();

        for layer in 0..layers {
            let probe = stub.clone();
            let name = format!("block_{layer}");
            let kernel_name = name.clone();
            rt.register(
                name,
                vec![StageInfo {
                    inputs: vec![act.clone(), state.clone()],
                    outputs: vec![act.clone(), state.clone()],
                }],
                move |inputs: &[Tensor]| -> Result<Vec<Tensor>> {
                    probe.enter(&kernel_name, inputs)?;
                    let [x, s] = inputs else {
                        return Err(ChainError::ShapeMismatch("block takes two inputs".into()));
                    };
                    let row = ((s.narrow(0, layer, 1)? * 0.5)? + x)?;
                    let rows = (0..layers)
                        .map(|r| {
                            if r == layer {
                                Ok(row.clone())
                            } else {
                                s.narrow(0, r, 1)
                            }
                        })
                        .collect::<candle_core::Result<Vec<_>>>()?;
                    let s = Tensor::cat(&rows, 0)?;
                    let x = (x + (row * 0.25)?)?;
                    Ok(vec![x, s])
                },
            )
            .unwrap();
        }

        let probe = stub.clone();
        rt.register(
            "lm_head",
            vec![StageInfo {
                inputs: vec![act],
                outputs: vec![logits.clone()],
            }],
            move |inputs: &[Tensor]| -> Result<Vec<Tensor>> {
                probe.enter("lm_head", inputs)?;
                let [x] = inputs else {
                    return Err(ChainError::ShapeMismatch("lm_head takes one input".into()));
                };
                let weights: Vec<f32> = (0..2 * VOCAB)
                    .map(|i| ((i * 7) % 32) as f32 / 32.0 - 0.5)
                    .collect();
                let w = Tensor::from_vec(weights, (2, VOCAB), x.device())?;
                let mut scores = x.to_dtype(DType::F32)?.matmul(&w)?.flatten_all()?.to_vec1::<f32>()?;
                if let Some(next) = probe.script.lock().unwrap().pop_front() {
                    scores[next as usize] += SCRIPT_BONUS;
                }
                Ok(vec![Tensor::from_vec(scores, (1, VOCAB), x.device())?])
            },
        )
        .unwrap();

        if greedy_head {
            let probe = stub.clone();
            rt.register(
                "greedy_head",
                vec![StageInfo {
                    inputs: vec![logits],
                    outputs: vec![token],
                }],
                move |inputs: &[Tensor]| -> Result<Vec<Tensor>> {
                    probe.enter("greedy_head", inputs)?;
                    let [scores] = inputs else {
                        return Err(ChainError::ShapeMismatch("greedy_head takes one input".into()));
                    };
                    Ok(vec![scores.argmax(D::Minus1)?])
                },
            )
            .unwrap();
        }
        stub
    }

    /// Log a launch, then fail it if a fault is armed for `subnet`.
    fn enter(&self, subnet: &str, inputs: &[Tensor]) -> Result<()> {
        let inputs = inputs
            .iter()
            .map(|t| t.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>())
            .collect::<candle_core::Result<Vec<_>>>()?;
        self.log.lock().unwrap().push(Launch {
            subnet: subnet.to_owned(),
            inputs,
        });
        if self.faults.lock().unwrap().remove(subnet) {
            return Err(ChainError::SubnetExecution {
                subnet: subnet.to_owned(),
                reason: "injected fault".into(),
            });
        }
        Ok(())
    }

    /// Make the next launch of `subnet` fail.
    pub fn fail_next(&self, subnet: &str) {
        self.faults.lock().unwrap().insert(subnet.to_owned());
    }

    /// Queue tokens for `lm_head` to favor, one per launch.
    pub fn script(&self, tokens: &[u32]) {
        self.script.lock().unwrap().extend(tokens);
    }

    /// Every launch so far.
    pub fn launches(&self) -> Vec<Launch> {
        self.log.lock().unwrap().clone()
    }

    /// Launches of one sub-network.
    pub fn launches_of(&self, subnet: &str) -> Vec<Launch> {
        self.launches()
            .into_iter()
            .filter(|l| l.subnet == subnet)
            .collect()
    }

    /// Names of every launch so far, in order.
    pub fn order(&self) -> Vec<String> {
        self.launches().into_iter().map(|l| l.subnet).collect()
    }

    /// Forget recorded launches.
    pub fn clear_log(&self) {
        self.log.lock().unwrap().clear();
    }
}

/// A session over a fresh stub model.
pub fn session(layers: usize, policy: PrefillPolicy) -> (Session<HostRuntime>, StubModel) {
    session_with(layers, policy, false)
}

/// A session over a fresh stub model, optionally with a `greedy_head`.
pub fn session_with(
    layers: usize,
    policy: PrefillPolicy,
    greedy_head: bool,
) -> (Session<HostRuntime>, StubModel) {
    let mut rt = HostRuntime::cpu();
    let stub = StubModel::install(&mut rt, layers, greedy_head);
    let session = Session::new(
        rt,
        SessionConfig {
            prefill_policy: policy,
        },
    )
    .unwrap();
    (session, stub)
}

/// Bit patterns of a float slice, for exact comparisons.
pub fn bits(values: &[f32]) -> Vec<u32> {
    values.iter().map(|v| v.to_bits()).collect()
}
