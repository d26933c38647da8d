// SPDX-License-Identifier: MIT OR Apache-2.0

//! # rwkv-chain
//!
//! Stateful RWKV inference over a model split into precompiled
//! sub-networks, built on [candle](https://github.com/huggingface/candle).
//!
//! A model is exposed by a [`Runtime`] as an `embedding` sub-network, one
//! `block_<i>` per layer, an `lm_head` and optionally a `greedy_head`.
//! Every block takes the activation and the whole-model recurrent state and
//! returns both; the state leaving the last block is fed to the first block
//! on the next token. [`StateChain`] threads buffers through that cycle,
//! [`ForwardEngine`] turns tokens into logits, and [`Session`] plus
//! [`GenerationLoop`] give a chat-style prefill-then-step API on top.
//!
//! [`HostRuntime`] is the reference runtime; [`rwkv::load_model_dir`]
//! fills it from an RWKV-6 `HuggingFace` checkpoint.
//!
//! ```no_run
//! use rwkv_chain::{
//!     ChainTokenizer, ChatConfig, GenerationLoop, HostRuntime, Session,
//! };
//!
//! # fn main() -> rwkv_chain::Result<()> {
//! let config = ChatConfig::default();
//! let mut rt = HostRuntime::request(&config.devices)?;
//! rwkv_chain::rwkv::load_model_dir(&mut rt, "models/rwkv6-1b6".as_ref())?;
//! let tokenizer = ChainTokenizer::from_path("models/rwkv_vocab_v20230424.txt")?;
//!
//! let mut session = Session::new(rt, config.session)?;
//! let mut chat = GenerationLoop::new(config.sampler()?, config.generation.clone());
//! let reply = chat.generate(&mut session, &tokenizer, "Hello!", |_| Ok(()))?;
//! println!("{}", reply.generated_text);
//! # Ok(())
//! # }
//! ```

#![deny(warnings)]
#![warn(missing_docs)]

pub mod chain;
pub mod config;
pub mod engine;
pub mod error;
pub mod generation;
pub mod handoff;
pub mod invoker;
pub mod runtime;
pub mod rwkv;
pub mod sampler;
pub mod session;
pub mod tokenizer;

pub use chain::{CarriedState, StateChain};
pub use config::ChatConfig;
pub use engine::{ForwardEngine, Logits};
pub use error::{ChainError, Result};
pub use generation::{
    GenerationConfig, GenerationLoop, GenerationResult, PromptMode, StopReason, StreamDecoder,
};
pub use handoff::FormatConversion;
pub use runtime::{
    BufferRef, ElemFormat, HostData, HostRuntime, Runtime, StageInfo, SubnetId, SubnetInfo,
    SubnetKernel, TensorDesc,
};
pub use sampler::{PenaltyParams, Sampler, SamplingMode};
pub use session::{GenerationState, PrefillPolicy, Session, SessionConfig};
pub use tokenizer::ChainTokenizer;
