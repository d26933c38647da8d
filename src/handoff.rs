// SPDX-License-Identifier: MIT OR Apache-2.0

//! Buffer handoff between sub-networks.
//!
//! Two operations move data from one sub-network's buffer into another's
//! input slot:
//!
//! - [`copy_device_to_device`]: byte-exact, used for every hop inside the
//!   layer stack (all blocks share one element format).
//! - [`copy_with_format_conversion`]: a host round trip that re-encodes
//!   each element, used once per pass at the embedding → block 0 boundary,
//!   where the embedding emits a different narrow float format than the
//!   blocks consume.
//!
//! [`convert_elements`] is the only place in the crate where element
//! values are re-encoded, so it is the only place precision can be lost.

use half::{bf16, f16};

use crate::error::{ChainError, Result};
use crate::runtime::{BufferRef, ElemFormat, HostData, Runtime};

/// Declared `(from, to)` contract of a format-converting handoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatConversion {
    /// Element format of the source buffer.
    pub from: ElemFormat,
    /// Element format of the destination buffer.
    pub to: ElemFormat,
}

impl FormatConversion {
    /// Create a conversion contract.
    #[must_use]
    pub const fn new(from: ElemFormat, to: ElemFormat) -> Self {
        Self { from, to }
    }

    /// Whether the conversion leaves bits unchanged.
    #[must_use]
    pub fn is_identity(self) -> bool {
        self.from == self.to
    }
}

/// Copy `src`'s full extent into `dst` on the device.
///
/// # Errors
///
/// Returns [`ChainError::SizeMismatch`] if `dst` holds fewer bytes than
/// `src`, before touching either buffer.
pub fn copy_device_to_device<R: Runtime + ?Sized>(
    rt: &mut R,
    dst: BufferRef,
    src: BufferRef,
) -> Result<()> {
    let src_bytes = rt.buffer_desc(src)?.byte_len();
    let dst_bytes = rt.buffer_desc(dst)?.byte_len();
    if dst_bytes < src_bytes {
        return Err(ChainError::SizeMismatch {
            what: format!("d2d {src:?} -> {dst:?}"),
            src_bytes,
            dst_bytes,
        });
    }
    tracing::trace!(?src, ?dst, bytes = src_bytes, "d2d");
    rt.copy_d2d(dst, src)
}

/// Read `src` to the host, re-encode every element, write it into `dst`.
///
/// # Errors
///
/// Returns [`ChainError::ShapeMismatch`] if either buffer's declared
/// format disagrees with `conversion` or the element counts differ, and
/// [`ChainError::SizeMismatch`] if the converted data does not fit `dst`.
pub fn copy_with_format_conversion<R: Runtime + ?Sized>(
    rt: &mut R,
    dst: BufferRef,
    src: BufferRef,
    conversion: FormatConversion,
) -> Result<()> {
    let src_desc = rt.buffer_desc(src)?;
    let dst_desc = rt.buffer_desc(dst)?;
    if src_desc.format != conversion.from || dst_desc.format != conversion.to {
        return Err(ChainError::ShapeMismatch(format!(
            "conversion {} -> {} applied to {src_desc} -> {dst_desc}",
            conversion.from, conversion.to
        )));
    }
    if src_desc.elem_count() != dst_desc.elem_count() {
        return Err(ChainError::ShapeMismatch(format!(
            "conversion between {src_desc} and {dst_desc} changes element count"
        )));
    }

    let host = rt.copy_d2h(src)?;
    let converted = convert_elements(&host, conversion.to)?;
    let dst_bytes = rt.buffer_desc(dst)?.byte_len();
    if converted.byte_len() > dst_bytes {
        return Err(ChainError::SizeMismatch {
            what: format!("converted upload into {dst:?}"),
            src_bytes: converted.byte_len(),
            dst_bytes,
        });
    }
    tracing::trace!(?src, ?dst, from = %conversion.from, to = %conversion.to, "host conversion");
    rt.copy_h2d(dst, &converted)
}

/// Re-encode float elements into another float format.
///
/// Conversion goes through `f32`, which represents every `f16` and `bf16`
/// value exactly, then rounds to nearest-even in the target format.
/// Values that need more mantissa bits than the target offers are rounded
/// (`f16` → `bf16` keeps 8 of 11 significant bits); values beyond the
/// target's range saturate to infinity (`bf16` → `f16` above 65504).
///
/// # Errors
///
/// Returns [`ChainError::ShapeMismatch`] when either side is an integer
/// format and the formats differ.
pub fn convert_elements(src: &HostData, to: ElemFormat) -> Result<HostData> {
    if src.format() == to {
        return Ok(src.clone());
    }
    if !src.format().is_float() || !to.is_float() {
        return Err(ChainError::ShapeMismatch(format!(
            "no element conversion from {} to {to}",
            src.format()
        )));
    }
    let wide = src.to_f32_vec();
    Ok(match to {
        ElemFormat::F32 => HostData::F32(wide),
        ElemFormat::F16 => HostData::F16(wide.into_iter().map(f16::from_f32).collect()),
        ElemFormat::BF16 => HostData::BF16(wide.into_iter().map(bf16::from_f32).collect()),
        ElemFormat::U32 => {
            return Err(ChainError::ShapeMismatch(
                "no element conversion into u32".into(),
            ));
        }
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
