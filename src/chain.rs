// SPDX-License-Identifier: MIT OR Apache-2.0

//! Recurrent state threading across the layer stack.
//!
//! Every layer block takes `(activation, state)` and produces the same pair.
//! Within one pass, layer `i`'s outputs are copied into layer `i + 1`'s
//! inputs. Across passes, the state output of the **last** layer seeds
//! layer 0 on the next pass:
//!
//! ```text
//! state_in(layer 0, t + 1) = state_out(layer L - 1, t)
//! ```
//!
//! Each layer's output pair lives in its own indexed slot of a
//! [`SlotArena`] (`2 * L` entries); handoffs are copies between slots, so a
//! layer's outputs stay readable until that layer runs again.

use crate::error::{ChainError, Result};
use crate::handoff::FormatConversion;
use crate::invoker::{Binding, SubnetHandle, invoke};
use crate::runtime::{BufferRef, HostData, Runtime, TensorDesc};

/// Stage every block is launched at (single-token shape).
const BLOCK_STAGE: usize = 0;
/// Input/output slot of the activation.
const ACTIVATION_SLOT: usize = 0;
/// Input/output slot of the recurrent state.
const STATE_SLOT: usize = 1;

// ---------------------------------------------------------------------------
// Slot arena
// ---------------------------------------------------------------------------

/// Output buffers of one layer, refreshed each time the layer runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerSlot {
    /// Activation output.
    pub activation: BufferRef,
    /// State output.
    pub state: BufferRef,
}

/// `L x 2` table of layer output buffers: entry `2i` is layer `i`'s
/// activation, entry `2i + 1` its state.
#[derive(Debug, Clone)]
pub struct SlotArena {
    /// Flat buffer table.
    entries: Vec<BufferRef>,
}

impl SlotArena {
    /// Build the table from the blocks' stage-0 outputs.
    fn new(blocks: &[SubnetHandle]) -> Self {
        let entries = blocks
            .iter()
            .flat_map(|b| {
                [
                    b.output(BLOCK_STAGE, ACTIVATION_SLOT),
                    b.output(BLOCK_STAGE, STATE_SLOT),
                ]
            })
            .collect();
        Self { entries }
    }

    /// Number of layers covered.
    #[must_use]
    pub fn num_layers(&self) -> usize {
        self.entries.len() / 2
    }

    /// Output slot of `layer`, if it exists.
    #[must_use]
    pub fn layer(&self, layer: usize) -> Option<LayerSlot> {
        let activation = *self.entries.get(2 * layer)?;
        let state = *self.entries.get(2 * layer + 1)?;
        Some(LayerSlot { activation, state })
    }
}

// ---------------------------------------------------------------------------
// StateChain
// ---------------------------------------------------------------------------

/// Where layer 0's input state comes from on the next pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CarriedState {
    /// Fresh context: a zero-filled state.
    Zero,
    /// The last layer's most recent state output.
    LastLayer,
}

/// Owns the layer blocks and the carried recurrent state.
#[derive(Debug)]
pub struct StateChain {
    /// Layer blocks in execution order.
    blocks: Vec<SubnetHandle>,
    /// Output slots, one pair per block.
    arena: SlotArena,
    /// Activation layout shared by every block.
    activation_desc: TensorDesc,
    /// State layout shared by every block, read from block 0's inputs.
    state_desc: TensorDesc,
    /// Source of the next pass's seed state.
    carried: CarriedState,
    /// Zero seed, built once.
    zero_state: HostData,
    /// How many times each layer has written its state output.
    state_writes: Vec<u64>,
}

impl StateChain {
    /// Validate the blocks and build the chain with a zero carried state.
    ///
    /// The state layout is not configured: it is whatever block 0 declares
    /// for its state input, and every block must declare the same layout on
    /// both sides.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::ModelLoad`] if there are no blocks, a block is
    /// not `(activation, state) -> (activation, state)` at stage 0, or two
    /// blocks disagree on either layout.
    pub fn new(blocks: Vec<SubnetHandle>) -> Result<Self> {
        let first = blocks
            .first()
            .ok_or_else(|| ChainError::ModelLoad("model has no layer blocks".into()))?
            .stage(BLOCK_STAGE)?;
        let (activation_desc, state_desc) = match first.inputs.as_slice() {
            [activation, state] => (activation.clone(), state.clone()),
            other => {
                return Err(ChainError::ModelLoad(format!(
                    "block_0 declares {} inputs, expected (activation, state)",
                    other.len()
                )));
            }
        };

        for block in &blocks {
            let stage = block.stage(BLOCK_STAGE)?;
            let expected = [activation_desc.clone(), state_desc.clone()];
            if stage.inputs != expected || stage.outputs != expected {
                return Err(ChainError::ModelLoad(format!(
                    "`{}` is not ({activation_desc}, {state_desc}) -> ({activation_desc}, {state_desc})",
                    block.name()
                )));
            }
        }

        let arena = SlotArena::new(&blocks);
        let zero_state = HostData::zeros(&state_desc);
        let state_writes = vec![0; blocks.len()];
        Ok(Self {
            blocks,
            arena,
            activation_desc,
            state_desc,
            carried: CarriedState::Zero,
            zero_state,
            state_writes,
        })
    }

    /// Number of layer blocks.
    #[must_use]
    pub fn num_layers(&self) -> usize {
        self.blocks.len()
    }

    /// Activation layout.
    #[must_use]
    pub const fn activation_desc(&self) -> &TensorDesc {
        &self.activation_desc
    }

    /// State layout (`STATE_ROWS x STATE_COLS`).
    #[must_use]
    pub const fn state_desc(&self) -> &TensorDesc {
        &self.state_desc
    }

    /// Source of the next pass's seed state.
    #[must_use]
    pub const fn carried(&self) -> CarriedState {
        self.carried
    }

    /// Output slot of `layer`.
    #[must_use]
    pub fn slot(&self, layer: usize) -> Option<LayerSlot> {
        self.arena.layer(layer)
    }

    /// How many times `layer` has produced a state output.
    #[must_use]
    pub fn state_writes(&self, layer: usize) -> u64 {
        self.state_writes.get(layer).copied().unwrap_or(0)
    }

    /// The slot whose state seeds the next pass.
    fn last_slot(&self) -> Result<LayerSlot> {
        self.arena
            .layer(self.blocks.len().saturating_sub(1))
            .ok_or_else(|| ChainError::ModelLoad("model has no layer blocks".into()))
    }

    /// Forget the carried context; the next pass starts from zero state.
    pub fn reset(&mut self) {
        self.carried = CarriedState::Zero;
    }

    /// Read the state the next pass will seed layer 0 with.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime cannot read the last layer's buffer.
    pub fn read_carried_state<R: Runtime + ?Sized>(&self, rt: &R) -> Result<HostData> {
        match self.carried {
            // BORROW: explicit .clone(); callers own the snapshot
            CarriedState::Zero => Ok(self.zero_state.clone()),
            CarriedState::LastLayer => rt.copy_d2h(self.last_slot()?.state),
        }
    }

    /// Read the latest state output of `layer`.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::ShapeMismatch`] for an out-of-range layer.
    pub fn read_layer_state<R: Runtime + ?Sized>(&self, rt: &R, layer: usize) -> Result<HostData> {
        let slot = self.arena.layer(layer).ok_or_else(|| {
            ChainError::ShapeMismatch(format!(
                "layer {layer} out of range ({} layers)",
                self.blocks.len()
            ))
        })?;
        rt.copy_d2h(slot.state)
    }

    /// Run every layer once for one token.
    ///
    /// `embedded` is the embedding output; it reaches layer 0 through
    /// `conversion` (a plain device copy when the conversion is an
    /// identity). Returns the last layer's activation output.
    ///
    /// The carried state advances only when every layer succeeded. On
    /// failure the layer buffers are partially updated and the caller must
    /// treat the context as lost.
    ///
    /// # Errors
    ///
    /// Propagates handoff and launch failures unchanged.
    pub fn run_layers<R: Runtime + ?Sized>(
        &mut self,
        rt: &mut R,
        embedded: BufferRef,
        conversion: FormatConversion,
    ) -> Result<BufferRef> {
        let seed = self.last_slot()?.state;
        let mut prev: Option<LayerSlot> = None;

        for (layer, block) in self.blocks.iter().enumerate() {
            let (activation_in, state_in) = match prev {
                Some(slot) => (
                    Binding::Copy {
                        input: ACTIVATION_SLOT,
                        src: slot.activation,
                    },
                    Binding::Copy {
                        input: STATE_SLOT,
                        src: slot.state,
                    },
                ),
                None => {
                    let activation = if conversion.is_identity() {
                        Binding::Copy {
                            input: ACTIVATION_SLOT,
                            src: embedded,
                        }
                    } else {
                        Binding::Convert {
                            input: ACTIVATION_SLOT,
                            src: embedded,
                            conversion,
                        }
                    };
                    let state = match self.carried {
                        CarriedState::Zero => Binding::Upload {
                            input: STATE_SLOT,
                            data: &self.zero_state,
                        },
                        CarriedState::LastLayer => Binding::Copy {
                            input: STATE_SLOT,
                            src: seed,
                        },
                    };
                    (activation, state)
                }
            };

            invoke(rt, block, BLOCK_STAGE, &[activation_in, state_in])?;
            if let Some(writes) = self.state_writes.get_mut(layer) {
                *writes += 1;
            }
            prev = self.arena.layer(layer);
        }

        self.carried = CarriedState::LastLayer;
        prev.map(|slot| slot.activation)
            .ok_or_else(|| ChainError::ModelLoad("model has no layer blocks".into()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
