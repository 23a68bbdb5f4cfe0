//! Float element types the kernels are generic over.

use std::fmt::Debug;

use num_traits::Float;

use crate::dtype::DType;
use crate::storage::Storage;

/// A floating-point element type with a matching tensor storage variant.
///
/// Implemented for `f32` (the primary kernel type) and `f64`.
pub trait FloatElement: Float + Default + Debug + Send + Sync + 'static {
    const DTYPE: DType;

    /// Borrow the storage as a slice of `Self`, if the dtype matches.
    fn slice(storage: &Storage) -> Option<&[Self]>;

    /// Mutable copy-on-write view of the storage, if the dtype matches.
    fn slice_mut(storage: &mut Storage) -> Option<&mut [Self]>;

    /// Wrap an owned buffer in storage.
    fn into_storage(data: Vec<Self>) -> Storage;

    /// Exact conversion of a small count (e.g. a number of valid ranks).
    fn from_count(n: usize) -> Self;

    /// Widen to f64 for diagnostics and comparisons.
    fn to_f64_lossless(self) -> f64;
}

impl FloatElement for f32 {
    const DTYPE: DType = DType::F32;

    fn slice(storage: &Storage) -> Option<&[Self]> {
        storage.as_f32_slice()
    }

    fn slice_mut(storage: &mut Storage) -> Option<&mut [Self]> {
        storage.as_f32_slice_mut()
    }

    fn into_storage(data: Vec<Self>) -> Storage {
        Storage::from_vec_f32(data)
    }

    fn from_count(n: usize) -> Self {
        n as f32
    }

    fn to_f64_lossless(self) -> f64 {
        f64::from(self)
    }
}

impl FloatElement for f64 {
    const DTYPE: DType = DType::F64;

    fn slice(storage: &Storage) -> Option<&[Self]> {
        storage.as_f64_slice()
    }

    fn slice_mut(storage: &mut Storage) -> Option<&mut [Self]> {
        storage.as_f64_slice_mut()
    }

    fn into_storage(data: Vec<Self>) -> Storage {
        Storage::from_vec_f64(data)
    }

    fn from_count(n: usize) -> Self {
        n as f64
    }

    fn to_f64_lossless(self) -> f64 {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_mapping() {
        assert_eq!(<f32 as FloatElement>::DTYPE, DType::F32);
        assert_eq!(<f64 as FloatElement>::DTYPE, DType::F64);
    }

    #[test]
    fn test_slice_roundtrip_through_storage() {
        let s = <f64 as FloatElement>::into_storage(vec![0.5, 1.5]);
        assert_eq!(<f64 as FloatElement>::slice(&s).unwrap(), &[0.5, 1.5]);
        assert!(<f32 as FloatElement>::slice(&s).is_none());
    }

    #[test]
    fn test_from_count() {
        assert_eq!(<f32 as FloatElement>::from_count(3), 3.0);
        assert_eq!(<f64 as FloatElement>::from_count(0), 0.0);
    }
}
