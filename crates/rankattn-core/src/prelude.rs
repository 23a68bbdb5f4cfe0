//! Convenience re-exports for common rankattn-core types.
//!
//! ```rust
//! use rankattn_core::prelude::*;
//! ```

pub use crate::DType;
pub use crate::FloatElement;
pub use crate::Lod;
pub use crate::RankAttnError;
pub use crate::Result;
pub use crate::Shape;
pub use crate::Tensor;
