//! Element-wise arithmetic on same-shape float tensors.

use crate::dtype::DType;
use crate::element::FloatElement;
use crate::error::RankAttnError;
use crate::tensor::Tensor;
use crate::Result;

impl Tensor {
    /// Element-wise addition: self + other.
    pub fn add(&self, other: &Tensor) -> Result<Tensor> {
        binary_op(self, other, "add", |a, b| a + b, |a, b| a + b)
    }

    /// Largest absolute element-wise difference, computed in f64.
    pub fn max_abs_diff(&self, other: &Tensor) -> Result<f64> {
        check_same(self, other, "max_abs_diff")?;
        let a = self.to_f64_vec().ok_or(RankAttnError::UnsupportedDType(self.dtype()))?;
        let b = other.to_f64_vec().ok_or(RankAttnError::UnsupportedDType(other.dtype()))?;
        Ok(a.iter()
            .zip(b.iter())
            .map(|(x, y)| (x - y).abs())
            .fold(0.0, f64::max))
    }
}

fn check_same(a: &Tensor, b: &Tensor, what: &str) -> Result<()> {
    if a.dtype() != b.dtype() {
        return Err(RankAttnError::DTypeMismatch {
            expected: a.dtype(),
            got: b.dtype(),
        });
    }
    if a.shape() != b.shape() {
        return Err(RankAttnError::shape(what, a.shape().dims(), b.shape().dims()));
    }
    Ok(())
}

fn binary_op(
    a: &Tensor,
    b: &Tensor,
    what: &str,
    op32: impl Fn(f32, f32) -> f32,
    op64: impl Fn(f64, f64) -> f64,
) -> Result<Tensor> {
    check_same(a, b, what)?;
    match a.dtype() {
        DType::F32 => zip_with(a, b, op32),
        DType::F64 => zip_with(a, b, op64),
        other => Err(RankAttnError::UnsupportedDType(other)),
    }
}

fn zip_with<T: FloatElement>(a: &Tensor, b: &Tensor, op: impl Fn(T, T) -> T) -> Result<Tensor> {
    let lhs = a.try_slice::<T>()?;
    let rhs = b.try_slice::<T>()?;
    let data: Vec<T> = lhs.iter().zip(rhs.iter()).map(|(&x, &y)| op(x, y)).collect();
    Tensor::from_vec(data, a.shape().dims())
}
