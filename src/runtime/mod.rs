// SPDX-License-Identifier: MIT OR Apache-2.0

//! Accelerator runtime boundary.
//!
//! The pipeline never computes layer math itself. It talks to a runtime
//! that owns a set of precompiled sub-networks, each with pre-allocated
//! input and output buffers per stage, and exposes three copy primitives
//! plus a blocking launch. [`Runtime`] is that contract; [`HostRuntime`]
//! is a reference implementation whose kernels run on candle.
//!
//! Buffers are addressed by [`BufferRef`] (sub-network, stage, port, slot),
//! never by raw device pointers, so every handoff in the pipeline is an
//! explicit copy between indexed slots.

pub mod host;

use std::fmt;

use candle_core::{DType, Device, Tensor};
use half::{bf16, f16};

use crate::error::{ChainError, Result};

pub use host::{HostRuntime, SubnetKernel, TransferStats};

// ---------------------------------------------------------------------------
// Element formats and descriptors
// ---------------------------------------------------------------------------

/// Numeric element encoding of a device buffer.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElemFormat {
    /// IEEE-754 single precision.
    F32,
    /// IEEE-754 half precision.
    F16,
    /// bfloat16 (8-bit exponent, 7-bit mantissa).
    BF16,
    /// Unsigned 32-bit integer (token ids).
    U32,
}

impl ElemFormat {
    /// Size of one element in bytes.
    #[must_use]
    pub const fn size_in_bytes(self) -> usize {
        match self {
            Self::F32 | Self::U32 => 4,
            Self::F16 | Self::BF16 => 2,
        }
    }

    /// Whether the format holds floating-point values.
    #[must_use]
    pub const fn is_float(self) -> bool {
        !matches!(self, Self::U32)
    }

    /// The matching candle dtype.
    #[must_use]
    pub const fn dtype(self) -> DType {
        match self {
            Self::F32 => DType::F32,
            Self::F16 => DType::F16,
            Self::BF16 => DType::BF16,
            Self::U32 => DType::U32,
        }
    }

    /// Map a candle dtype back to an element format.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::ShapeMismatch`] for dtypes the runtime cannot hold.
    pub fn from_dtype(dtype: DType) -> Result<Self> {
        match dtype {
            DType::F32 => Ok(Self::F32),
            DType::F16 => Ok(Self::F16),
            DType::BF16 => Ok(Self::BF16),
            DType::U32 => Ok(Self::U32),
            other => Err(ChainError::ShapeMismatch(format!(
                "dtype {other:?} has no device buffer format"
            ))),
        }
    }
}

impl fmt::Display for ElemFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::F32 => write!(f, "f32"),
            Self::F16 => write!(f, "f16"),
            Self::BF16 => write!(f, "bf16"),
            Self::U32 => write!(f, "u32"),
        }
    }
}

/// Declared format and shape of one device buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorDesc {
    /// Element format.
    pub format: ElemFormat,
    /// Dimensions, outermost first.
    pub shape: Vec<usize>,
}

impl TensorDesc {
    /// Create a descriptor.
    #[must_use]
    pub fn new(format: ElemFormat, shape: impl Into<Vec<usize>>) -> Self {
        Self {
            format,
            shape: shape.into(),
        }
    }

    /// Number of elements.
    #[must_use]
    pub fn elem_count(&self) -> usize {
        self.shape.iter().product()
    }

    /// Buffer extent in bytes.
    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.elem_count() * self.format.size_in_bytes()
    }
}

impl fmt::Display for TensorDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:?}", self.format, self.shape)
    }
}

/// Input and output buffer layout of one precompiled shape variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageInfo {
    /// Input buffers, in binding order.
    pub inputs: Vec<TensorDesc>,
    /// Output buffers, in production order.
    pub outputs: Vec<TensorDesc>,
}

/// Metadata of a loaded sub-network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubnetInfo {
    /// Name the sub-network was compiled under (`embedding`, `block_3`, ...).
    pub name: String,
    /// Precompiled shape variants; stage 0 is the default.
    pub stages: Vec<StageInfo>,
}

// ---------------------------------------------------------------------------
// Buffer addressing
// ---------------------------------------------------------------------------

/// Opaque handle to a sub-network inside a runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubnetId(pub usize);

/// Which side of a sub-network a buffer sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Port {
    /// Bound before launch, read by the sub-network.
    Input,
    /// Written by the sub-network on launch.
    Output,
}

/// Address of one runtime-owned device buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferRef {
    /// Owning sub-network.
    pub subnet: SubnetId,
    /// Stage (shape variant) index.
    pub stage: usize,
    /// Input or output side.
    pub port: Port,
    /// Position among the stage's inputs or outputs.
    pub index: usize,
}

impl BufferRef {
    /// Address input `index` of `subnet` at `stage`.
    #[must_use]
    pub const fn input(subnet: SubnetId, stage: usize, index: usize) -> Self {
        Self {
            subnet,
            stage,
            port: Port::Input,
            index,
        }
    }

    /// Address output `index` of `subnet` at `stage`.
    #[must_use]
    pub const fn output(subnet: SubnetId, stage: usize, index: usize) -> Self {
        Self {
            subnet,
            stage,
            port: Port::Output,
            index,
        }
    }
}

// ---------------------------------------------------------------------------
// HostData
// ---------------------------------------------------------------------------

/// Typed host-side copy of a device buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum HostData {
    /// `f32` elements.
    F32(Vec<f32>),
    /// `f16` elements.
    F16(Vec<f16>),
    /// `bf16` elements.
    BF16(Vec<bf16>),
    /// `u32` elements.
    U32(Vec<u32>),
}

impl HostData {
    /// Zero-filled data matching `desc`.
    #[must_use]
    pub fn zeros(desc: &TensorDesc) -> Self {
        let n = desc.elem_count();
        match desc.format {
            ElemFormat::F32 => Self::F32(vec![0.0; n]),
            ElemFormat::F16 => Self::F16(vec![f16::ZERO; n]),
            ElemFormat::BF16 => Self::BF16(vec![bf16::ZERO; n]),
            ElemFormat::U32 => Self::U32(vec![0; n]),
        }
    }

    /// Element format of the data.
    #[must_use]
    pub const fn format(&self) -> ElemFormat {
        match self {
            Self::F32(_) => ElemFormat::F32,
            Self::F16(_) => ElemFormat::F16,
            Self::BF16(_) => ElemFormat::BF16,
            Self::U32(_) => ElemFormat::U32,
        }
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::F32(v) => v.len(),
            Self::F16(v) => v.len(),
            Self::BF16(v) => v.len(),
            Self::U32(v) => v.len(),
        }
    }

    /// Whether there are no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Extent in bytes once written to a device buffer.
    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.len() * self.format().size_in_bytes()
    }

    /// Widen every element to `f32` (integers are converted by value).
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
    pub fn to_f32_vec(&self) -> Vec<f32> {
        match self {
            Self::F32(v) => v.clone(),
            Self::F16(v) => v.iter().map(|x| x.to_f32()).collect(),
            Self::BF16(v) => v.iter().map(|x| x.to_f32()).collect(),
            Self::U32(v) => v.iter().map(|&x| x as f32).collect(),
        }
    }

    /// Serialize into `out` as little-endian bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::SizeMismatch`] if `out` is too small.
    pub fn write_le_bytes(&self, out: &mut [u8]) -> Result<()> {
        let needed = self.byte_len();
        let out_len = out.len();
        let dst = out.get_mut(..needed).ok_or_else(|| ChainError::SizeMismatch {
            what: "host-to-device upload".into(),
            src_bytes: needed,
            dst_bytes: out_len,
        })?;
        match self {
            Self::F32(v) => write_chunks(dst, v, |x| x.to_le_bytes()),
            Self::F16(v) => write_chunks(dst, v, |x| x.to_le_bytes()),
            Self::BF16(v) => write_chunks(dst, v, |x| x.to_le_bytes()),
            Self::U32(v) => write_chunks(dst, v, |x| x.to_le_bytes()),
        }
        Ok(())
    }

    /// Decode little-endian bytes laid out as `desc`.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::SizeMismatch`] if `bytes` is shorter than `desc`.
    pub fn from_le_bytes(desc: &TensorDesc, bytes: &[u8]) -> Result<Self> {
        let needed = desc.byte_len();
        let src = bytes.get(..needed).ok_or_else(|| ChainError::SizeMismatch {
            what: format!("device-to-host read of {desc}"),
            src_bytes: needed,
            dst_bytes: bytes.len(),
        })?;
        Ok(match desc.format {
            ElemFormat::F32 => Self::F32(read_chunks(src, f32::from_le_bytes)),
            ElemFormat::F16 => Self::F16(read_chunks(src, f16::from_le_bytes)),
            ElemFormat::BF16 => Self::BF16(read_chunks(src, bf16::from_le_bytes)),
            ElemFormat::U32 => Self::U32(read_chunks(src, u32::from_le_bytes)),
        })
    }

    /// Build a candle tensor of the given shape on `device`.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::Model`] if the element count does not match `shape`.
    pub fn to_tensor(&self, shape: &[usize], device: &Device) -> Result<Tensor> {
        // BORROW: explicit .clone(); Tensor::from_vec takes ownership
        let t = match self {
            Self::F32(v) => Tensor::from_vec(v.clone(), shape, device)?,
            Self::F16(v) => Tensor::from_vec(v.clone(), shape, device)?,
            Self::BF16(v) => Tensor::from_vec(v.clone(), shape, device)?,
            Self::U32(v) => Tensor::from_vec(v.clone(), shape, device)?,
        };
        Ok(t)
    }

    /// Copy a candle tensor's elements to the host.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::ShapeMismatch`] for unsupported dtypes.
    pub fn from_tensor(t: &Tensor) -> Result<Self> {
        let flat = t.flatten_all()?;
        Ok(match ElemFormat::from_dtype(t.dtype())? {
            ElemFormat::F32 => Self::F32(flat.to_vec1()?),
            ElemFormat::F16 => Self::F16(flat.to_vec1()?),
            ElemFormat::BF16 => Self::BF16(flat.to_vec1()?),
            ElemFormat::U32 => Self::U32(flat.to_vec1()?),
        })
    }
}

/// Write each element's `N`-byte encoding into consecutive chunks of `dst`.
fn write_chunks<T: Copy, const N: usize>(dst: &mut [u8], src: &[T], enc: impl Fn(T) -> [u8; N]) {
    for (chunk, &x) in dst.chunks_exact_mut(N).zip(src) {
        chunk.copy_from_slice(&enc(x));
    }
}

/// Decode consecutive `N`-byte chunks of `src`.
fn read_chunks<T, const N: usize>(src: &[u8], dec: impl Fn([u8; N]) -> T) -> Vec<T> {
    src.chunks_exact(N)
        .map(|chunk| {
            let mut buf = [0u8; N];
            buf.copy_from_slice(chunk);
            dec(buf)
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Runtime trait
// ---------------------------------------------------------------------------

/// Contract of the accelerator runtime the pipeline drives.
///
/// Output buffers are runtime-owned and reused across launches; callers
/// read them until the next launch of the same sub-network overwrites
/// them, and never free or reallocate them.
pub trait Runtime {
    /// Ids of the devices this runtime was created on.
    fn device_ids(&self) -> &[usize];

    /// Number of loaded sub-networks.
    fn subnet_count(&self) -> usize;

    /// Look up a sub-network by the name it was compiled under.
    fn find_subnet(&self, name: &str) -> Option<SubnetId>;

    /// Metadata of a loaded sub-network.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::ModelLoad`] for an unknown id.
    fn subnet_info(&self, id: SubnetId) -> Result<&SubnetInfo>;

    /// Declared descriptor of a buffer.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::ShapeMismatch`] if the stage or slot does not exist.
    fn buffer_desc(&self, buf: BufferRef) -> Result<&TensorDesc> {
        let info = self.subnet_info(buf.subnet)?;
        let stage = info.stages.get(buf.stage).ok_or_else(|| {
            ChainError::ShapeMismatch(format!(
                "`{}` has no stage {} ({} stages)",
                info.name,
                buf.stage,
                info.stages.len()
            ))
        })?;
        let slots = match buf.port {
            Port::Input => &stage.inputs,
            Port::Output => &stage.outputs,
        };
        slots.get(buf.index).ok_or_else(|| {
            ChainError::ShapeMismatch(format!(
                "`{}` stage {} has no {:?} slot {}",
                info.name, buf.stage, buf.port, buf.index
            ))
        })
    }

    /// Byte-exact device-to-device copy of `src`'s full extent into `dst`.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::SizeMismatch`] if `dst` is smaller than `src`.
    fn copy_d2d(&mut self, dst: BufferRef, src: BufferRef) -> Result<()>;

    /// Upload host data into a device buffer.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::SizeMismatch`] if the data does not fit.
    fn copy_h2d(&mut self, dst: BufferRef, data: &HostData) -> Result<()>;

    /// Read a device buffer back to the host in its declared format.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer does not exist.
    fn copy_d2h(&self, src: BufferRef) -> Result<HostData>;

    /// Execute `subnet` at `stage` over its bound inputs and block until
    /// its outputs are written.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::SubnetExecution`] on launch or sync failure.
    fn launch(&mut self, subnet: SubnetId, stage: usize) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn desc_byte_len() {
        let desc = TensorDesc::new(ElemFormat::BF16, [1584, 2048]);
        assert_eq!(desc.elem_count(), 1584 * 2048);
        assert_eq!(desc.byte_len(), 1584 * 2048 * 2);
        assert_eq!(desc.to_string(), "bf16[1584, 2048]");
    }

    #[test]
    fn le_bytes_round_trip_preserves_bits() {
        let desc = TensorDesc::new(ElemFormat::F16, [3]);
        let data = HostData::F16(vec![
            f16::from_f32(1.5),
            f16::from_f32(-0.25),
            f16::from_f32(65504.0),
        ]);
        let mut bytes = vec![0u8; desc.byte_len()];
        data.write_le_bytes(&mut bytes).unwrap();
        assert_eq!(HostData::from_le_bytes(&desc, &bytes).unwrap(), data);
    }

    #[test]
    fn upload_into_short_buffer_fails() {
        let data = HostData::U32(vec![1, 2, 3]);
        let mut bytes = vec![0u8; 8];
        let err = data.write_le_bytes(&mut bytes).unwrap_err();
        assert!(matches!(err, ChainError::SizeMismatch { src_bytes: 12, dst_bytes: 8, .. }));
    }

    #[test]
    fn tensor_round_trip() {
        let data = HostData::BF16(vec![bf16::from_f32(0.5), bf16::from_f32(2.0)]);
        let t = data.to_tensor(&[1, 2], &Device::Cpu).unwrap();
        assert_eq!(t.dtype(), DType::BF16);
        assert_eq!(HostData::from_tensor(&t).unwrap(), data);
    }

    #[test]
    fn zeros_match_desc() {
        let z = HostData::zeros(&TensorDesc::new(ElemFormat::BF16, [2, 3]));
        assert_eq!(z.len(), 6);
        assert_eq!(z.format(), ElemFormat::BF16);
        assert!(z.to_f32_vec().iter().all(|&x| x == 0.0));
    }
}
