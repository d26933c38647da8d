// SPDX-License-Identifier: MIT OR Apache-2.0

//! Single sub-network invocation.
//!
//! A [`SubnetHandle`] is resolved once, by name, when the model is loaded.
//! [`invoke`] binds inputs into the sub-network's pre-allocated input slots
//! (through [`crate::handoff`]), launches the requested stage and blocks
//! until its outputs are written. Output buffers belong to the runtime and
//! are reused by every launch; nothing here allocates device memory.

use crate::error::{ChainError, Result};
use crate::handoff::{FormatConversion, copy_device_to_device, copy_with_format_conversion};
use crate::runtime::{BufferRef, HostData, Runtime, StageInfo, SubnetId, SubnetInfo};

// ---------------------------------------------------------------------------
// SubnetHandle
// ---------------------------------------------------------------------------

/// A sub-network resolved by name at load time.
#[derive(Debug, Clone)]
pub struct SubnetHandle {
    /// Runtime id.
    id: SubnetId,
    /// Declared layout, cached so the hot path never queries the runtime.
    info: SubnetInfo,
}

impl SubnetHandle {
    /// Look up `name` in `rt`.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::ModelLoad`] if no sub-network has that name.
    pub fn resolve<R: Runtime + ?Sized>(rt: &R, name: &str) -> Result<Self> {
        let id = rt
            .find_subnet(name)
            .ok_or_else(|| ChainError::ModelLoad(format!("sub-network `{name}` not found")))?;
        // BORROW: explicit .clone(); the handle outlives the runtime borrow
        let info = rt.subnet_info(id)?.clone();
        Ok(Self { id, info })
    }

    /// Runtime id.
    #[must_use]
    pub const fn id(&self) -> SubnetId {
        self.id
    }

    /// Name the sub-network was compiled under.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Declared layout of `stage`.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::ModelLoad`] if the stage was not compiled.
    pub fn stage(&self, stage: usize) -> Result<&StageInfo> {
        self.info.stages.get(stage).ok_or_else(|| {
            ChainError::ModelLoad(format!(
                "`{}` has no stage {stage} ({} compiled)",
                self.info.name,
                self.info.stages.len()
            ))
        })
    }

    /// Input slot `index` of `stage`.
    #[must_use]
    pub const fn input(&self, stage: usize, index: usize) -> BufferRef {
        BufferRef::input(self.id, stage, index)
    }

    /// Output slot `index` of `stage`.
    #[must_use]
    pub const fn output(&self, stage: usize, index: usize) -> BufferRef {
        BufferRef::output(self.id, stage, index)
    }
}

// ---------------------------------------------------------------------------
// Bindings
// ---------------------------------------------------------------------------

/// How one input slot is filled before a launch.
#[derive(Debug, Clone, Copy)]
pub enum Binding<'a> {
    /// Byte-exact device copy from another buffer.
    Copy {
        /// Input slot index.
        input: usize,
        /// Source buffer.
        src: BufferRef,
    },
    /// Host round trip with element re-encoding.
    Convert {
        /// Input slot index.
        input: usize,
        /// Source buffer.
        src: BufferRef,
        /// Declared format contract.
        conversion: FormatConversion,
    },
    /// Upload from host memory.
    Upload {
        /// Input slot index.
        input: usize,
        /// Data to write.
        data: &'a HostData,
    },
}

impl Binding<'_> {
    /// Input slot this binding fills.
    #[must_use]
    pub const fn input(&self) -> usize {
        match *self {
            Self::Copy { input, .. } | Self::Convert { input, .. } | Self::Upload { input, .. } => {
                input
            }
        }
    }
}

/// Fill the inputs of `handle` at `stage`, launch it and wait for completion.
///
/// Inputs not named in `bindings` keep whatever the previous launch left in
/// them.
///
/// # Errors
///
/// Binding failures ([`ChainError::SizeMismatch`],
/// [`ChainError::ShapeMismatch`]) are returned before the launch.
/// Launch or synchronization failures are [`ChainError::SubnetExecution`].
/// Neither is retried.
pub fn invoke<R: Runtime + ?Sized>(
    rt: &mut R,
    handle: &SubnetHandle,
    stage: usize,
    bindings: &[Binding<'_>],
) -> Result<()> {
    let declared = handle.stage(stage)?.inputs.len();
    for binding in bindings {
        let input = binding.input();
        if input >= declared {
            return Err(ChainError::ShapeMismatch(format!(
                "`{}` stage {stage} has {declared} inputs, binding targets slot {input}",
                handle.name()
            )));
        }
        let dst = handle.input(stage, input);
        match *binding {
            Binding::Copy { src, .. } => copy_device_to_device(rt, dst, src)?,
            Binding::Convert {
                src, conversion, ..
            } => copy_with_format_conversion(rt, dst, src, conversion)?,
            Binding::Upload { data, .. } => rt.copy_h2d(dst, data)?,
        }
    }

    tracing::trace!(subnet = handle.name(), stage, bound = bindings.len(), "launch");
    rt.launch(handle.id(), stage).map_err(|e| match e {
        ChainError::SubnetExecution { .. } => e,
        other => ChainError::SubnetExecution {
            subnet: handle.name().to_owned(),
            reason: other.to_string(),
        },
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
