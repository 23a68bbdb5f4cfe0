//! # rankattn-kernels
//!
//! CPU kernels for RankAttention: each instance gathers up to `MaxRank`
//! parameter blocks selected by a rank offset table, multiplies its
//! replicated feature vector against them, and scatters gradients back into
//! the shared parameter matrix.
//!
//! Provides:
//! - Shape validation and output-shape derivation (`shape_check`)
//! - Parsed rank offset tables with bounds-checked row offsets (`offset`)
//! - Rayon-parallel forward expansion + multiply (`cpu_forward`)
//! - Row-partitioned, deterministic gradient accumulation (`cpu_backward`)
//! - A `GradFn` hook for the autograd graph (`autograd`)
//! - Named-slot operator wrappers mirroring the host calling contract (`op`)

pub mod config;
pub mod offset;
pub mod shape_check;
pub mod cpu_forward;
pub mod cpu_backward;
pub mod autograd;
pub mod op;

#[cfg(test)]
mod tests;

pub use config::{AttrValue, Attrs, RankAttentionConfig, DEFAULT_MAX_RANK};
pub use offset::RankOffsetTable;
pub use shape_check::{validate_grad_shapes, validate_shapes, GradShapes, RankAttentionDims};
pub use cpu_forward::{rank_attention_forward, RankAttentionOutput};
pub use cpu_backward::rank_attention_backward;
pub use autograd::{rank_attention_with_grad, RankAttentionBackward};
pub use op::{ExecutionContext, Operator, RankAttentionGradOp, RankAttentionOp, TensorMap};
