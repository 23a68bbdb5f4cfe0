use std::sync::Arc;

use crate::DType;

/// Typed CPU buffer behind a tensor.
#[derive(Debug, Clone, PartialEq)]
pub enum StorageData {
    F32(Vec<f32>),
    F64(Vec<f64>),
    I32(Vec<i32>),
}

/// Shared, reference-counted tensor storage.
///
/// Storage is reference-counted (`Arc`) so the cached forward intermediates
/// can be handed to a backward node without copying. Mutable access clones
/// the buffer first if it is shared (copy-on-write), so a tensor captured by
/// a gradient node is never modified behind its back.
#[derive(Debug, Clone)]
pub struct Storage {
    data: Arc<StorageData>,
}

impl Storage {
    /// Allocate zero-filled storage for `numel` elements of the given dtype.
    pub fn zeros(dtype: DType, numel: usize) -> Self {
        let data = match dtype {
            DType::F32 => StorageData::F32(vec![0.0; numel]),
            DType::F64 => StorageData::F64(vec![0.0; numel]),
            DType::I32 => StorageData::I32(vec![0; numel]),
        };
        Self { data: Arc::new(data) }
    }

    /// Take ownership of an f32 buffer.
    pub fn from_vec_f32(data: Vec<f32>) -> Self {
        Self { data: Arc::new(StorageData::F32(data)) }
    }

    /// Take ownership of an f64 buffer.
    pub fn from_vec_f64(data: Vec<f64>) -> Self {
        Self { data: Arc::new(StorageData::F64(data)) }
    }

    /// Take ownership of an i32 buffer.
    pub fn from_vec_i32(data: Vec<i32>) -> Self {
        Self { data: Arc::new(StorageData::I32(data)) }
    }

    /// Get the dtype of this storage.
    pub fn dtype(&self) -> DType {
        match self.data.as_ref() {
            StorageData::F32(_) => DType::F32,
            StorageData::F64(_) => DType::F64,
            StorageData::I32(_) => DType::I32,
        }
    }

    /// Number of logical elements.
    pub fn numel(&self) -> usize {
        match self.data.as_ref() {
            StorageData::F32(v) => v.len(),
            StorageData::F64(v) => v.len(),
            StorageData::I32(v) => v.len(),
        }
    }

    pub fn as_f32_slice(&self) -> Option<&[f32]> {
        match self.data.as_ref() {
            StorageData::F32(v) => Some(v),
            _ => None,
        }
    }

    /// Mutable f32 view (copy-on-write).
    pub fn as_f32_slice_mut(&mut self) -> Option<&mut [f32]> {
        match Arc::make_mut(&mut self.data) {
            StorageData::F32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f64_slice(&self) -> Option<&[f64]> {
        match self.data.as_ref() {
            StorageData::F64(v) => Some(v),
            _ => None,
        }
    }

    /// Mutable f64 view (copy-on-write).
    pub fn as_f64_slice_mut(&mut self) -> Option<&mut [f64]> {
        match Arc::make_mut(&mut self.data) {
            StorageData::F64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i32_slice(&self) -> Option<&[i32]> {
        match self.data.as_ref() {
            StorageData::I32(v) => Some(v),
            _ => None,
        }
    }

    /// Whether two storages share the same buffer.
    pub fn ptr_eq(&self, other: &Storage) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}
