use std::fmt;
use std::sync::Arc;

use crate::autograd::GradNode;
use crate::dtype::DType;
use crate::element::FloatElement;
use crate::error::RankAttnError;
use crate::lod::Lod;
use crate::shape::Shape;
use crate::storage::Storage;
use crate::Result;

/// A dense, row-major CPU tensor.
///
/// Tensors carry:
/// - F32 / F64 / I32 data in shared copy-on-write storage
/// - Optional sequence-length metadata (LoD) over the leading dimension
/// - Optional gradient tracking through a `GradNode`
///
/// # Examples
///
/// ```
/// use rankattn_core::Tensor;
///
/// let t = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
/// assert_eq!(t.shape().dims(), &[2, 2]);
/// assert_eq!(t.numel(), 4);
/// ```
#[derive(Clone)]
pub struct Tensor {
    storage: Storage,
    shape: Shape,
    lod: Lod,
    requires_grad: bool,
    grad_node: Option<Arc<GradNode>>,
}

impl Tensor {
    // =========================================================================
    // Constructors
    // =========================================================================

    /// Create a tensor from f32 data with the given shape.
    ///
    /// # Panics
    /// Panics if `data.len()` does not match the shape's element count.
    pub fn from_f32(data: &[f32], shape: &[usize]) -> Self {
        Self::from_vec(data.to_vec(), shape).unwrap_or_else(|e| panic!("{e}"))
    }

    /// Create a tensor from f64 data with the given shape.
    ///
    /// # Panics
    /// Panics if `data.len()` does not match the shape's element count.
    pub fn from_f64(data: &[f64], shape: &[usize]) -> Self {
        Self::from_vec(data.to_vec(), shape).unwrap_or_else(|e| panic!("{e}"))
    }

    /// Create an i32 tensor (e.g. a rank offset table) with the given shape.
    ///
    /// # Panics
    /// Panics if `data.len()` does not match the shape's element count.
    pub fn from_i32(data: &[i32], shape: &[usize]) -> Self {
        Self::from_storage(Storage::from_vec_i32(data.to_vec()), shape)
            .unwrap_or_else(|e| panic!("{e}"))
    }

    /// Take ownership of a float buffer.
    pub fn from_vec<T: FloatElement>(data: Vec<T>, shape: &[usize]) -> Result<Self> {
        Self::from_storage(T::into_storage(data), shape)
    }

    /// Create a tensor of zeros with the given shape and dtype.
    pub fn zeros(shape: &[usize], dtype: DType) -> Self {
        let s = Shape::new(shape);
        Self {
            storage: Storage::zeros(dtype, s.numel()),
            shape: s,
            lod: Lod::empty(),
            requires_grad: false,
            grad_node: None,
        }
    }

    /// Create a tensor from pre-built storage and shape.
    pub fn from_storage(storage: Storage, shape: &[usize]) -> Result<Self> {
        let s = Shape::new(shape);
        if s.numel() != storage.numel() {
            return Err(RankAttnError::StorageError(format!(
                "shape {s} requires {} elements, got {}",
                s.numel(),
                storage.numel()
            )));
        }
        Ok(Self {
            storage,
            shape: s,
            lod: Lod::empty(),
            requires_grad: false,
            grad_node: None,
        })
    }

    // =========================================================================
    // Properties
    // =========================================================================

    /// Shape of the tensor.
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Number of dimensions.
    pub fn ndim(&self) -> usize {
        self.shape.ndim()
    }

    /// Total number of elements.
    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    /// Data type.
    pub fn dtype(&self) -> DType {
        self.storage.dtype()
    }

    /// Sequence-length metadata over the leading dimension.
    pub fn lod(&self) -> &Lod {
        &self.lod
    }

    /// Attach sequence-length metadata. The finest level must cover every row.
    pub fn with_lod(mut self, lod: Lod) -> Result<Self> {
        self.set_lod(lod)?;
        Ok(self)
    }

    /// Replace the LoD in place. The finest level must cover every row.
    pub fn set_lod(&mut self, lod: Lod) -> Result<()> {
        if let Some(rows) = lod.num_rows() {
            let leading = self.shape.dim(0).unwrap_or(1);
            if rows != leading {
                return Err(RankAttnError::InvalidArgument(format!(
                    "LoD covers {rows} rows but tensor has leading dimension {leading}"
                )));
            }
        }
        self.lod = lod;
        Ok(())
    }

    /// Whether this tensor requires gradient computation.
    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    /// Set whether this tensor requires gradient computation.
    /// When enabled, creates a leaf GradNode for this tensor.
    pub fn set_requires_grad(&mut self, requires_grad: bool) {
        self.requires_grad = requires_grad;
        if requires_grad && self.grad_node.is_none() {
            self.grad_node = Some(GradNode::leaf());
        }
        if !requires_grad {
            self.grad_node = None;
        }
    }

    // =========================================================================
    // Autograd
    // =========================================================================

    /// Get the GradNode for this tensor (if tracking gradients).
    pub fn grad_node(&self) -> Option<&Arc<GradNode>> {
        self.grad_node.as_ref()
    }

    /// Attach a GradNode to this tensor (used by op dispatch).
    /// Also sets requires_grad=true since this tensor is part of the computation graph.
    pub fn with_grad_node(mut self, node: Arc<GradNode>) -> Self {
        self.grad_node = Some(node);
        self.requires_grad = true;
        self
    }

    /// Get the accumulated gradient for this tensor.
    pub fn grad(&self) -> Option<Tensor> {
        self.grad_node.as_ref().and_then(|n| n.get_grad())
    }

    /// Clear accumulated gradients.
    pub fn zero_grad(&self) {
        if let Some(ref node) = self.grad_node {
            node.zero_grad();
        }
    }

    /// Whether op dispatch should record a graph node for this tensor.
    pub fn tracks_grad(&self) -> bool {
        self.requires_grad && self.grad_node.is_some() && crate::autograd::is_grad_enabled()
    }

    // =========================================================================
    // Data access
    // =========================================================================

    pub fn as_f32_slice(&self) -> Option<&[f32]> {
        self.storage.as_f32_slice()
    }

    pub fn as_f64_slice(&self) -> Option<&[f64]> {
        self.storage.as_f64_slice()
    }

    pub fn as_i32_slice(&self) -> Option<&[i32]> {
        self.storage.as_i32_slice()
    }

    /// Typed view for generic kernels; `None` on dtype mismatch.
    pub fn as_slice<T: FloatElement>(&self) -> Option<&[T]> {
        T::slice(&self.storage)
    }

    /// Typed mutable view (copy-on-write); `None` on dtype mismatch.
    pub fn as_slice_mut<T: FloatElement>(&mut self) -> Option<&mut [T]> {
        T::slice_mut(&mut self.storage)
    }

    /// Typed view that reports a `DTypeMismatch` instead of `None`.
    pub fn try_slice<T: FloatElement>(&self) -> Result<&[T]> {
        self.as_slice::<T>().ok_or(RankAttnError::DTypeMismatch {
            expected: T::DTYPE,
            got: self.dtype(),
        })
    }

    /// Copy of the data widened to f64, for float tensors.
    pub fn to_f64_vec(&self) -> Option<Vec<f64>> {
        match self.dtype() {
            DType::F32 => self.as_f32_slice().map(widen),
            DType::F64 => self.as_f64_slice().map(widen),
            DType::I32 => None,
        }
    }
}

fn widen<T: FloatElement>(data: &[T]) -> Vec<f64> {
    data.iter().map(|&v| v.to_f64_lossless()).collect()
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tensor(shape={}, dtype={}, lod_levels={}, requires_grad={})",
            self.shape,
            self.dtype(),
            self.lod.num_levels(),
            self.requires_grad,
        )
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_f64_vec() {
            Some(data) if data.len() <= 20 => {
                write!(f, "tensor({:?}, shape={})", data, self.shape)
            }
            Some(data) => write!(
                f,
                "tensor([{:.4}, {:.4}, ..., {:.4}], shape={})",
                data[0],
                data[1],
                data[data.len() - 1],
                self.shape
            ),
            None => write!(f, "tensor(shape={}, dtype={})", self.shape, self.dtype()),
        }
    }
}
