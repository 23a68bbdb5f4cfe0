//! Named-slot operator wrappers.
//!
//! The host executor hands operators a map of named input tensors, the list
//! of output slots it expects back, and an attribute map. `RankAttentionOp`
//! and `RankAttentionGradOp` check that contract, derive shapes, and call
//! the plain kernel functions; they carry no state beyond the parallelism
//! threshold.

use std::collections::BTreeMap;

use rankattn_core::error::SlotKind;
use rankattn_core::{DType, Lod, RankAttnError, Result, Shape, Tensor};

use crate::autograd::rank_attention_with_grad;
use crate::config::{Attrs, RankAttentionConfig, DEFAULT_PAR_THRESHOLD};
use crate::cpu_backward::rank_attention_backward;
use crate::shape_check::{validate_grad_shapes, validate_shapes, GradShapes};

pub const X: &str = "X";
pub const RANK_OFFSET: &str = "RankOffset";
pub const RANK_PARAM: &str = "RankParam";
pub const OUT: &str = "Out";
pub const INPUT_HELP: &str = "InputHelp";
pub const PARAM_HELP: &str = "ParamHelp";
pub const INS_RANK: &str = "InsRank";
pub const OUT_GRAD: &str = "Out@GRAD";
pub const RANK_PARAM_GRAD: &str = "RankParam@GRAD";

/// Tensors keyed by slot name.
#[derive(Debug, Clone, Default)]
pub struct TensorMap {
    inner: BTreeMap<String, Tensor>,
}

impl TensorMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, slot: impl Into<String>, tensor: Tensor) -> Self {
        self.inner.insert(slot.into(), tensor);
        self
    }

    pub fn insert(&mut self, slot: impl Into<String>, tensor: Tensor) -> Option<Tensor> {
        self.inner.insert(slot.into(), tensor)
    }

    pub fn get(&self, slot: &str) -> Option<&Tensor> {
        self.inner.get(slot)
    }

    pub fn remove(&mut self, slot: &str) -> Option<Tensor> {
        self.inner.remove(slot)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Inputs, expected outputs and attributes of one operator invocation.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    pub inputs: TensorMap,
    pub outputs: Vec<String>,
    pub attrs: Attrs,
}

impl ExecutionContext {
    pub fn new(inputs: TensorMap, outputs: &[&str], attrs: Attrs) -> Self {
        Self {
            inputs,
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            attrs,
        }
    }

    pub fn input(&self, op: &'static str, slot: &'static str) -> Result<&Tensor> {
        self.inputs.get(slot).ok_or(RankAttnError::MissingSlot {
            op,
            kind: SlotKind::Input,
            slot,
        })
    }

    pub fn has_output(&self, slot: &str) -> bool {
        self.outputs.iter().any(|o| o == slot)
    }
}

/// Shape and LoD an operator will produce for one output slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferredShape {
    pub shape: Shape,
    pub lod: Lod,
}

impl InferredShape {
    fn plain(dims: &[usize]) -> Self {
        Self {
            shape: Shape::new(dims),
            lod: Lod::empty(),
        }
    }
}

/// Entry points a host executor drives.
pub trait Operator: Send + Sync {
    fn op_type(&self) -> &'static str;

    fn input_slots(&self) -> &'static [&'static str];

    fn output_slots(&self) -> &'static [&'static str];

    /// Derive every output shape without touching tensor data.
    fn infer_shape(&self, ctx: &ExecutionContext) -> Result<Vec<(&'static str, InferredShape)>>;

    /// Element type the kernel runs in.
    fn kernel_dtype(&self, ctx: &ExecutionContext) -> Result<DType>;

    fn run(&self, ctx: &ExecutionContext) -> Result<TensorMap>;

    /// Every declared input must be present and every output requested.
    fn check_slots(&self, ctx: &ExecutionContext) -> Result<()> {
        for &slot in self.input_slots() {
            ctx.input(self.op_type(), slot)?;
        }
        for &slot in self.output_slots() {
            if !ctx.has_output(slot) {
                return Err(RankAttnError::MissingSlot {
                    op: self.op_type(),
                    kind: SlotKind::Output,
                    slot,
                });
            }
        }
        Ok(())
    }
}

/// `rank_attention(X, RankOffset, RankParam; MaxRank) -> (Out, InputHelp, ParamHelp, InsRank)`
#[derive(Debug, Clone, Copy)]
pub struct RankAttentionOp {
    pub par_threshold: usize,
}

impl Default for RankAttentionOp {
    fn default() -> Self {
        Self {
            par_threshold: DEFAULT_PAR_THRESHOLD,
        }
    }
}

impl RankAttentionOp {
    pub const TYPE: &'static str = "rank_attention";

    fn config(&self, attrs: &Attrs) -> Result<RankAttentionConfig> {
        Ok(RankAttentionConfig::from_attrs(attrs)?.with_par_threshold(self.par_threshold))
    }

    /// Context for the matching `rank_attention_grad` call: the forward
    /// inputs, the cached forward outputs, and the gradient of `Out`.
    pub fn grad_context(
        &self,
        forward: &ExecutionContext,
        forward_outputs: &TensorMap,
        grad_out: Tensor,
    ) -> Result<ExecutionContext> {
        let mut inputs = TensorMap::new();
        for slot in [X, RANK_OFFSET, RANK_PARAM] {
            inputs.insert(slot, forward.input(Self::TYPE, slot)?.clone());
        }
        for slot in [INPUT_HELP, PARAM_HELP, INS_RANK] {
            let t = forward_outputs.get(slot).ok_or(RankAttnError::MissingSlot {
                op: Self::TYPE,
                kind: SlotKind::Output,
                slot,
            })?;
            inputs.insert(slot, t.clone());
        }
        inputs.insert(OUT_GRAD, grad_out);
        Ok(ExecutionContext::new(
            inputs,
            &[RANK_PARAM_GRAD],
            forward.attrs.clone(),
        ))
    }
}

impl Operator for RankAttentionOp {
    fn op_type(&self) -> &'static str {
        Self::TYPE
    }

    fn input_slots(&self) -> &'static [&'static str] {
        &[X, RANK_OFFSET, RANK_PARAM]
    }

    fn output_slots(&self) -> &'static [&'static str] {
        &[OUT, INPUT_HELP, PARAM_HELP, INS_RANK]
    }

    fn infer_shape(&self, ctx: &ExecutionContext) -> Result<Vec<(&'static str, InferredShape)>> {
        self.check_slots(ctx)?;
        let cfg = self.config(&ctx.attrs)?;
        let x = ctx.input(Self::TYPE, X)?;
        let dims = validate_shapes(
            x.shape(),
            ctx.input(Self::TYPE, RANK_OFFSET)?.shape(),
            ctx.input(Self::TYPE, RANK_PARAM)?.shape(),
            cfg.max_rank,
        )?;
        Ok(vec![
            (
                OUT,
                InferredShape {
                    shape: Shape::new(&dims.out_shape()),
                    lod: x.lod().clone(),
                },
            ),
            (PARAM_HELP, InferredShape::plain(&dims.param_help_shape())),
            (INPUT_HELP, InferredShape::plain(&dims.input_help_shape())),
            (INS_RANK, InferredShape::plain(&dims.ins_rank_shape())),
        ])
    }

    fn kernel_dtype(&self, ctx: &ExecutionContext) -> Result<DType> {
        Ok(ctx.input(Self::TYPE, X)?.dtype())
    }

    fn run(&self, ctx: &ExecutionContext) -> Result<TensorMap> {
        self.check_slots(ctx)?;
        let cfg = self.config(&ctx.attrs)?;
        let out = rank_attention_with_grad(
            ctx.input(Self::TYPE, X)?,
            ctx.input(Self::TYPE, RANK_OFFSET)?,
            ctx.input(Self::TYPE, RANK_PARAM)?,
            &cfg,
        )?;
        Ok(TensorMap::new()
            .with(OUT, out.out)
            .with(INPUT_HELP, out.input_help)
            .with(PARAM_HELP, out.param_help)
            .with(INS_RANK, out.ins_rank))
    }
}

/// `rank_attention_grad(X, RankOffset, RankParam, InputHelp, ParamHelp, InsRank, Out@GRAD) -> RankParam@GRAD`
#[derive(Debug, Clone, Copy)]
pub struct RankAttentionGradOp {
    pub par_threshold: usize,
}

impl Default for RankAttentionGradOp {
    fn default() -> Self {
        Self {
            par_threshold: DEFAULT_PAR_THRESHOLD,
        }
    }
}

impl RankAttentionGradOp {
    pub const TYPE: &'static str = "rank_attention_grad";

    fn grad_shapes<'a>(&self, ctx: &'a ExecutionContext) -> Result<GradShapes<'a>> {
        let t = Self::TYPE;
        Ok(GradShapes {
            x: ctx.input(t, X)?.shape(),
            rank_offset: ctx.input(t, RANK_OFFSET)?.shape(),
            rank_param: ctx.input(t, RANK_PARAM)?.shape(),
            input_help: ctx.input(t, INPUT_HELP)?.shape(),
            param_help: ctx.input(t, PARAM_HELP)?.shape(),
            ins_rank: ctx.input(t, INS_RANK)?.shape(),
            grad_out: ctx.input(t, OUT_GRAD)?.shape(),
        })
    }
}

impl Operator for RankAttentionGradOp {
    fn op_type(&self) -> &'static str {
        Self::TYPE
    }

    fn input_slots(&self) -> &'static [&'static str] {
        &[X, RANK_OFFSET, RANK_PARAM, INPUT_HELP, PARAM_HELP, INS_RANK, OUT_GRAD]
    }

    fn output_slots(&self) -> &'static [&'static str] {
        &[RANK_PARAM_GRAD]
    }

    fn infer_shape(&self, ctx: &ExecutionContext) -> Result<Vec<(&'static str, InferredShape)>> {
        self.check_slots(ctx)?;
        let cfg = RankAttentionConfig::from_attrs(&ctx.attrs)?;
        let dims = validate_grad_shapes(self.grad_shapes(ctx)?, cfg.max_rank)?;
        Ok(vec![(RANK_PARAM_GRAD, InferredShape::plain(&dims.param_shape()))])
    }

    fn kernel_dtype(&self, ctx: &ExecutionContext) -> Result<DType> {
        Ok(ctx.input(Self::TYPE, OUT_GRAD)?.dtype())
    }

    fn run(&self, ctx: &ExecutionContext) -> Result<TensorMap> {
        self.check_slots(ctx)?;
        let cfg = RankAttentionConfig::from_attrs(&ctx.attrs)?.with_par_threshold(self.par_threshold);
        let t = Self::TYPE;
        let grad = rank_attention_backward(
            ctx.input(t, X)?,
            ctx.input(t, RANK_OFFSET)?,
            ctx.input(t, RANK_PARAM)?,
            ctx.input(t, INPUT_HELP)?,
            ctx.input(t, PARAM_HELP)?,
            ctx.input(t, INS_RANK)?,
            ctx.input(t, OUT_GRAD)?,
            &cfg,
        )?;
        Ok(TensorMap::new().with(RANK_PARAM_GRAD, grad))
    }
}
