//! Tensor operations.
//!
//! All operations return new tensors (functional style).

pub mod arithmetic;
