// SPDX-License-Identifier: MIT OR Apache-2.0

//! Normalization layers used by the RWKV-6 kernels.
//!
//! `LayerNorm` (with bias) sits in front of every mixing block and the
//! head; `GroupNorm` normalizes the WKV read-out per head. Both compute in
//! the input's dtype.

use candle_core::{D, Tensor};
use candle_nn::VarBuilder;

use crate::error::Result;

// ---------------------------------------------------------------------------
// LayerNorm
// ---------------------------------------------------------------------------

/// Layer normalization with learned weight and bias.
pub struct LayerNorm {
    /// Learned scale.
    weight: Tensor,
    /// Learned shift.
    bias: Tensor,
    /// Numerical floor of the variance.
    eps: f64,
}

impl LayerNorm {
    /// Load `weight` and `bias` under `vb`.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::Model`](crate::error::ChainError::Model) if
    /// either tensor is missing or mis-shaped.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder convention
    pub fn load(size: usize, eps: f64, vb: VarBuilder<'_>) -> Result<Self> {
        let weight = vb.get(size, "weight")?;
        let bias = vb.get(size, "bias")?;
        Ok(Self { weight, bias, eps })
    }

    /// Normalize over the last dimension.
    ///
    /// # Shapes
    /// - `x`: `[..., size]`
    /// - returns: same shape
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::Model`](crate::error::ChainError::Model) on
    /// tensor failure.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mean = x.mean_keepdim(D::Minus1)?;
        let centered = x.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = centered.broadcast_div(&(var + self.eps)?.sqrt()?)?;
        Ok(normed
            .broadcast_mul(&self.weight.to_dtype(x.dtype())?)?
            .broadcast_add(&self.bias.to_dtype(x.dtype())?)?)
    }
}

// ---------------------------------------------------------------------------
// GroupNorm
// ---------------------------------------------------------------------------

/// Normalize each of `num_groups` equal channel groups, then apply the
/// affine transform.
///
/// # Shapes
/// - `x`: `[n, channels]`
/// - `weight`, `bias`: `[channels]`
/// - returns: `[n, channels]`
///
/// # Errors
///
/// Returns [`ChainError::Model`](crate::error::ChainError::Model) on
/// tensor failure, including `channels` not divisible by `num_groups`.
pub fn group_norm(
    x: &Tensor,
    num_groups: usize,
    weight: &Tensor,
    bias: &Tensor,
    eps: f64,
) -> Result<Tensor> {
    let (n, c) = x.dims2()?;
    let grouped = x.reshape((n, num_groups, c / num_groups))?;
    let mean = grouped.mean_keepdim(2)?;
    let centered = grouped.broadcast_sub(&mean)?;
    let var = centered.sqr()?.mean_keepdim(2)?;
    let normed = centered
        .broadcast_div(&(var + eps)?.sqrt()?)?
        .reshape((n, c))?;
    Ok(normed
        .broadcast_mul(&weight.unsqueeze(0)?)?
        .broadcast_add(&bias.unsqueeze(0)?)?)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn layer_norm_centers_and_scales() {
        let device = Device::Cpu;
        let ln = LayerNorm {
            weight: Tensor::new(&[2.0_f32, 2.0, 2.0, 2.0], &device).unwrap(),
            bias: Tensor::new(&[1.0_f32, 1.0, 1.0, 1.0], &device).unwrap(),
            eps: 0.0,
        };
        let x = Tensor::new(&[[1.0_f32, 2.0, 3.0, 4.0]], &device).unwrap();
        let out: Vec<f32> = ln.forward(&x).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        // mean 2.5, var 1.25
        let expected = 2.0 * (-1.5 / 1.25_f32.sqrt()) + 1.0;
        assert!((out[0] - expected).abs() < 1e-5);
        let sum: f32 = out.iter().sum();
        assert!((sum - 4.0).abs() < 1e-4);
    }

    #[test]
    fn group_norm_is_per_group() {
        let device = Device::Cpu;
        let x = Tensor::new(&[[1.0_f32, 3.0, 10.0, 30.0]], &device).unwrap();
        let weight = Tensor::ones(4, DType::F32, &device).unwrap();
        let bias = Tensor::zeros(4, DType::F32, &device).unwrap();
        let out: Vec<f32> = group_norm(&x, 2, &weight, &bias, 0.0)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        for (got, want) in out.iter().zip([-1.0, 1.0, -1.0, 1.0]) {
            assert!((got - want).abs() < 1e-5);
        }
    }
}
