//! # rankattn-core
//!
//! Core tensor engine for the rank attention kernels.
//!
//! Provides the foundational `Tensor` type with:
//! - F32 / F64 floats and I32 index tables
//! - Copy-on-write shared storage
//! - Sequence-length metadata (LoD) carried alongside the data
//! - Tape-style gradient nodes for custom backward functions

pub mod dtype;
pub mod element;
pub mod storage;
pub mod shape;
pub mod lod;
pub mod tensor;
pub mod ops;
pub mod autograd;
pub mod error;
pub mod prelude;

pub use dtype::DType;
pub use element::FloatElement;
pub use storage::Storage;
pub use shape::Shape;
pub use lod::Lod;
pub use tensor::Tensor;
pub use error::RankAttnError;

pub type Result<T> = std::result::Result<T, RankAttnError>;
