// SPDX-License-Identifier: MIT OR Apache-2.0

//! Host reference runtime.
//!
//! [`HostRuntime`] mimics an accelerator runtime closely enough for the
//! pipeline to be exercised end to end: every stage's input and output
//! buffers are allocated once, at registration, as flat byte arrays; copies
//! move bytes between them; a launch decodes the bound inputs into candle
//! tensors, runs the sub-network's [`SubnetKernel`] on the selected candle
//! device, validates the results against the declared outputs, and writes
//! them back in place.

use std::cell::Cell;
use std::collections::HashMap;

use candle_core::{Device, Tensor};

use super::{BufferRef, ElemFormat, HostData, Port, Runtime, StageInfo, SubnetId, SubnetInfo};
use crate::error::{ChainError, Result};

// ---------------------------------------------------------------------------
// SubnetKernel
// ---------------------------------------------------------------------------

/// Numeric body of one sub-network.
///
/// Receives the stage's inputs as tensors shaped per their declared
/// descriptors and must return one tensor per declared output.
pub trait SubnetKernel: Send {
    /// Run the sub-network.
    ///
    /// # Errors
    ///
    /// Any error is reported as [`ChainError::SubnetExecution`] by the runtime.
    fn forward(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>>;
}

impl<F> SubnetKernel for F
where
    F: Fn(&[Tensor]) -> Result<Vec<Tensor>> + Send,
{
    fn forward(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        self(inputs)
    }
}

// ---------------------------------------------------------------------------
// TransferStats
// ---------------------------------------------------------------------------

/// Counters of runtime traffic since creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    /// Device-to-device copies.
    pub d2d_copies: u64,
    /// Host-to-device uploads.
    pub h2d_copies: u64,
    /// Device-to-host reads.
    pub d2h_copies: u64,
    /// Sub-network launches.
    pub launches: u64,
}

// ---------------------------------------------------------------------------
// HostRuntime
// ---------------------------------------------------------------------------

/// Pre-allocated buffers of one stage.
struct StageBuffers {
    /// One byte array per declared input.
    inputs: Vec<Vec<u8>>,
    /// One byte array per declared output.
    outputs: Vec<Vec<u8>>,
}

/// A registered sub-network.
struct HostSubnet {
    /// Declared layout.
    info: SubnetInfo,
    /// Numeric body.
    // TRAIT_OBJECT: each sub-network has its own kernel type
    kernel: Box<dyn SubnetKernel>,
    /// Buffers per stage, parallel to `info.stages`.
    buffers: Vec<StageBuffers>,
}

/// Reference runtime with host-resident buffers and candle kernels.
pub struct HostRuntime {
    /// Requested device ids.
    device_ids: Vec<usize>,
    /// Device the kernels execute on (the first requested one).
    device: Device,
    /// Registered sub-networks, indexed by [`SubnetId`].
    subnets: Vec<HostSubnet>,
    /// Name lookup.
    names: HashMap<String, SubnetId>,
    /// Traffic counters, updated from `&self` reads too.
    stats: Cell<TransferStats>,
}

impl std::fmt::Debug for HostRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostRuntime")
            .field("device_ids", &self.device_ids)
            .field("device", &self.device)
            .field("subnets", &self.subnets.len())
            .field("stats", &self.stats.get())
            .finish_non_exhaustive()
    }
}

impl HostRuntime {
    /// Request the given devices.
    ///
    /// Each id is opened as a CUDA device when candle is built with CUDA
    /// support, otherwise it falls back to the CPU. Kernels run on the first
    /// device; the remaining handles are only enumerated.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::DeviceRequest`] if the list is empty or a
    /// device cannot be opened.
    pub fn request(device_ids: &[usize]) -> Result<Self> {
        let first = *device_ids.first().ok_or_else(|| ChainError::DeviceRequest {
            device: 0,
            reason: "no device ids given".into(),
        })?;
        let mut devices = Vec::with_capacity(device_ids.len());
        for &id in device_ids {
            let device =
                Device::cuda_if_available(id).map_err(|e| ChainError::DeviceRequest {
                    device: id,
                    reason: e.to_string(),
                })?;
            devices.push(device);
        }
        let device = devices.swap_remove(0);
        tracing::info!(devices = ?device_ids, primary = first, ?device, "devices acquired");

        Ok(Self {
            device_ids: device_ids.to_vec(),
            device,
            subnets: Vec::new(),
            names: HashMap::new(),
            stats: Cell::default(),
        })
    }

    /// A CPU-only runtime (device id 0).
    #[must_use]
    pub fn cpu() -> Self {
        Self {
            device_ids: vec![0],
            device: Device::Cpu,
            subnets: Vec::new(),
            names: HashMap::new(),
            stats: Cell::default(),
        }
    }

    /// Device the kernels execute on.
    #[must_use]
    pub const fn device(&self) -> &Device {
        &self.device
    }

    /// Traffic counters since creation.
    #[must_use]
    pub fn stats(&self) -> TransferStats {
        self.stats.get()
    }

    /// Update the traffic counters.
    fn count(&self, f: impl FnOnce(&mut TransferStats)) {
        let mut stats = self.stats.get();
        f(&mut stats);
        self.stats.set(stats);
    }

    /// Register a sub-network and allocate its buffers.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::ModelLoad`] if the name is taken or no stage
    /// is declared.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        stages: Vec<StageInfo>,
        kernel: impl SubnetKernel + 'static,
    ) -> Result<SubnetId> {
        let name = name.into();
        if self.names.contains_key(&name) {
            return Err(ChainError::ModelLoad(format!(
                "sub-network `{name}` registered twice"
            )));
        }
        if stages.is_empty() {
            return Err(ChainError::ModelLoad(format!(
                "sub-network `{name}` declares no stages"
            )));
        }

        let buffers = stages
            .iter()
            .map(|stage| StageBuffers {
                inputs: stage.inputs.iter().map(|d| vec![0u8; d.byte_len()]).collect(),
                outputs: stage.outputs.iter().map(|d| vec![0u8; d.byte_len()]).collect(),
            })
            .collect();

        let id = SubnetId(self.subnets.len());
        tracing::debug!(subnet = %name, id = id.0, stages = stages.len(), "registered sub-network");
        // BORROW: explicit .clone(); name is both map key and info field
        self.names.insert(name.clone(), id);
        self.subnets.push(HostSubnet {
            info: SubnetInfo { name, stages },
            kernel: Box::new(kernel),
            buffers,
        });
        Ok(id)
    }

    /// Look up a registered sub-network.
    fn subnet(&self, id: SubnetId) -> Result<&HostSubnet> {
        self.subnets
            .get(id.0)
            .ok_or_else(|| ChainError::ModelLoad(format!("unknown sub-network id {}", id.0)))
    }

    /// Borrow the bytes behind a buffer reference.
    fn bytes(&self, buf: BufferRef) -> Result<&[u8]> {
        let subnet = self.subnet(buf.subnet)?;
        let stage = subnet.buffers.get(buf.stage).ok_or_else(|| missing(&subnet.info, buf))?;
        let slots = match buf.port {
            Port::Input => &stage.inputs,
            Port::Output => &stage.outputs,
        };
        slots
            .get(buf.index)
            .map(Vec::as_slice)
            .ok_or_else(|| missing(&subnet.info, buf))
    }

    /// Mutably borrow the bytes behind a buffer reference.
    fn bytes_mut(&mut self, buf: BufferRef) -> Result<&mut Vec<u8>> {
        let subnet = self
            .subnets
            .get_mut(buf.subnet.0)
            .ok_or_else(|| ChainError::ModelLoad(format!("unknown sub-network id {}", buf.subnet.0)))?;
        let info = &subnet.info;
        let stage = subnet
            .buffers
            .get_mut(buf.stage)
            .ok_or_else(|| missing(info, buf))?;
        let slots = match buf.port {
            Port::Input => &mut stage.inputs,
            Port::Output => &mut stage.outputs,
        };
        slots.get_mut(buf.index).ok_or_else(|| missing(info, buf))
    }

    /// Decode inputs, run the kernel, validate and store outputs.
    fn execute(&mut self, id: SubnetId, stage_idx: usize) -> Result<()> {
        let subnet = self.subnet(id)?;
        let stage = subnet.info.stages.get(stage_idx).ok_or_else(|| {
            ChainError::ShapeMismatch(format!(
                "`{}` has no stage {stage_idx}",
                subnet.info.name
            ))
        })?;
        let buffers = subnet
            .buffers
            .get(stage_idx)
            .ok_or_else(|| ChainError::ShapeMismatch(format!("`{}` stage {stage_idx} has no buffers", subnet.info.name)))?;

        let mut inputs = Vec::with_capacity(stage.inputs.len());
        for (desc, bytes) in stage.inputs.iter().zip(&buffers.inputs) {
            let data = HostData::from_le_bytes(desc, bytes)?;
            inputs.push(data.to_tensor(&desc.shape, &self.device)?);
        }

        let outputs = subnet.kernel.forward(&inputs)?;
        if outputs.len() != stage.outputs.len() {
            return Err(ChainError::ShapeMismatch(format!(
                "`{}` produced {} outputs, declared {}",
                subnet.info.name,
                outputs.len(),
                stage.outputs.len()
            )));
        }

        let mut encoded = Vec::with_capacity(outputs.len());
        for (idx, (tensor, desc)) in outputs.iter().zip(&stage.outputs).enumerate() {
            let format = ElemFormat::from_dtype(tensor.dtype())?;
            if format != desc.format || tensor.dims() != desc.shape.as_slice() {
                return Err(ChainError::ShapeMismatch(format!(
                    "`{}` output {idx} is {format}{:?}, declared {desc}",
                    subnet.info.name,
                    tensor.dims()
                )));
            }
            encoded.push(HostData::from_tensor(tensor)?);
        }

        for (idx, data) in encoded.iter().enumerate() {
            let dst = self.bytes_mut(BufferRef::output(id, stage_idx, idx))?;
            data.write_le_bytes(dst)?;
        }
        Ok(())
    }
}

/// Error for a buffer reference that names no allocated slot.
fn missing(info: &SubnetInfo, buf: BufferRef) -> ChainError {
    ChainError::ShapeMismatch(format!(
        "`{}` has no {:?} buffer {} at stage {}",
        info.name, buf.port, buf.index, buf.stage
    ))
}

impl Runtime for HostRuntime {
    fn device_ids(&self) -> &[usize] {
        &self.device_ids
    }

    fn subnet_count(&self) -> usize {
        self.subnets.len()
    }

    fn find_subnet(&self, name: &str) -> Option<SubnetId> {
        self.names.get(name).copied()
    }

    fn subnet_info(&self, id: SubnetId) -> Result<&SubnetInfo> {
        Ok(&self.subnet(id)?.info)
    }

    fn copy_d2d(&mut self, dst: BufferRef, src: BufferRef) -> Result<()> {
        // BORROW: explicit .to_vec(); src and dst may live in the same subnet
        let src_bytes = self.bytes(src)?.to_vec();
        let dst_bytes = self.bytes_mut(dst)?;
        let dst_len = dst_bytes.len();
        let window = dst_bytes
            .get_mut(..src_bytes.len())
            .ok_or_else(|| ChainError::SizeMismatch {
                what: "device-to-device copy".into(),
                src_bytes: src_bytes.len(),
                dst_bytes: dst_len,
            })?;
        window.copy_from_slice(&src_bytes);
        self.count(|s| s.d2d_copies += 1);
        Ok(())
    }

    fn copy_h2d(&mut self, dst: BufferRef, data: &HostData) -> Result<()> {
        data.write_le_bytes(self.bytes_mut(dst)?)?;
        self.count(|s| s.h2d_copies += 1);
        Ok(())
    }

    fn copy_d2h(&self, src: BufferRef) -> Result<HostData> {
        let desc = self.buffer_desc(src)?;
        let data = HostData::from_le_bytes(desc, self.bytes(src)?)?;
        self.count(|s| s.d2h_copies += 1);
        Ok(data)
    }

    fn launch(&mut self, subnet: SubnetId, stage: usize) -> Result<()> {
        self.count(|s| s.launches += 1);
        self.execute(subnet, stage).map_err(|e| match e {
            ChainError::SubnetExecution { .. } => e,
            other => ChainError::SubnetExecution {
                subnet: self
                    .subnets
                    .get(subnet.0)
                    .map_or_else(|| format!("#{}", subnet.0), |s| s.info.name.clone()),
                reason: other.to_string(),
            },
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::runtime::TensorDesc;
    use candle_core::DType;

    /// A `[1, 4] f32 -> [1, 4] f32` doubling sub-network.
    fn doubler(rt: &mut HostRuntime, name: &str) -> SubnetId {
        let desc = TensorDesc::new(ElemFormat::F32, [1, 4]);
        rt.register(
            name,
            vec![StageInfo {
                inputs: vec![desc.clone()],
                outputs: vec![desc],
            }],
            |inputs: &[Tensor]| -> Result<Vec<Tensor>> {
                let x = inputs.first().ok_or_else(|| ChainError::ShapeMismatch("no input".into()))?;
                Ok(vec![(x * 2.0)?])
            },
        )
        .unwrap()
    }

    #[test]
    fn launch_runs_kernel_in_place() {
        let mut rt = HostRuntime::cpu();
        let id = doubler(&mut rt, "double");
        rt.copy_h2d(BufferRef::input(id, 0, 0), &HostData::F32(vec![1.0, 2.0, 3.0, 4.0]))
            .unwrap();
        rt.launch(id, 0).unwrap();
        let out = rt.copy_d2h(BufferRef::output(id, 0, 0)).unwrap();
        assert_eq!(out, HostData::F32(vec![2.0, 4.0, 6.0, 8.0]));
        assert_eq!(rt.stats().launches, 1);
        assert_eq!(rt.stats().h2d_copies, 1);
    }

    #[test]
    fn chained_d2d_feeds_next_subnet() {
        let mut rt = HostRuntime::cpu();
        let a = doubler(&mut rt, "a");
        let b = doubler(&mut rt, "b");
        rt.copy_h2d(BufferRef::input(a, 0, 0), &HostData::F32(vec![1.0; 4])).unwrap();
        rt.launch(a, 0).unwrap();
        rt.copy_d2d(BufferRef::input(b, 0, 0), BufferRef::output(a, 0, 0)).unwrap();
        rt.launch(b, 0).unwrap();
        let out = rt.copy_d2h(BufferRef::output(b, 0, 0)).unwrap();
        assert_eq!(out, HostData::F32(vec![4.0; 4]));
        assert_eq!(rt.stats().d2d_copies, 1);
    }

    #[test]
    fn duplicate_name_rejected() {
        let mut rt = HostRuntime::cpu();
        doubler(&mut rt, "x");
        let desc = TensorDesc::new(ElemFormat::F32, [1]);
        let err = rt
            .register(
                "x",
                vec![StageInfo {
                    inputs: vec![desc.clone()],
                    outputs: vec![desc],
                }],
                |_: &[Tensor]| -> Result<Vec<Tensor>> { Ok(Vec::new()) },
            )
            .unwrap_err();
        assert!(matches!(err, ChainError::ModelLoad(_)));
    }

    #[test]
    fn wrong_output_dtype_is_execution_failure() {
        let mut rt = HostRuntime::cpu();
        let desc = TensorDesc::new(ElemFormat::F32, [1, 4]);
        let id = rt
            .register(
                "bad",
                vec![StageInfo {
                    inputs: vec![desc.clone()],
                    outputs: vec![desc],
                }],
                |inputs: &[Tensor]| -> Result<Vec<Tensor>> {
                    let x = inputs.first().ok_or_else(|| ChainError::ShapeMismatch("no input".into()))?;
                    Ok(vec![x.to_dtype(DType::F16)?])
                },
            )
            .unwrap();
        let err = rt.launch(id, 0).unwrap_err();
        match err {
            ChainError::SubnetExecution { subnet, reason } => {
                assert_eq!(subnet, "bad");
                assert!(reason.contains("declared"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unknown_stage_is_rejected() {
        let mut rt = HostRuntime::cpu();
        let id = doubler(&mut rt, "d");
        assert!(rt.launch(id, 3).is_err());
        assert!(rt.buffer_desc(BufferRef::input(id, 1, 0)).is_err());
    }

    #[test]
    fn empty_device_list_is_request_failure() {
        let err = HostRuntime::request(&[]).unwrap_err();
        assert!(matches!(err, ChainError::DeviceRequest { .. }));
    }
}
