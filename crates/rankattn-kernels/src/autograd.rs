//! Autograd support for rank attention.
//!
//! `rank_attention_with_grad` runs the forward kernel and, when RankParam
//! tracks gradients, attaches a `RankAttentionBackward` node to `Out`. The
//! node keeps the forward inputs and the cached InputHelp / ParamHelp /
//! InsRank tensors (shared storage, no copies) until backward runs.
//!
//! Only RankParam is registered as a graph input: X and RankOffset are
//! stop-gradient by contract.

use std::sync::Arc;

use rankattn_core::autograd::{GradFn, GradNode};
use rankattn_core::{Result, Tensor};

use crate::config::RankAttentionConfig;
use crate::cpu_backward::rank_attention_backward;
use crate::cpu_forward::{rank_attention_forward, RankAttentionOutput};

/// Forward tensors saved for the backward pass.
pub struct RankAttentionSaved {
    pub x: Tensor,
    pub rank_offset: Tensor,
    pub rank_param: Tensor,
    pub input_help: Tensor,
    pub param_help: Tensor,
    pub ins_rank: Tensor,
    pub config: RankAttentionConfig,
}

pub struct RankAttentionBackward {
    pub saved: RankAttentionSaved,
}

impl GradFn for RankAttentionBackward {
    fn apply(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        let s = &self.saved;
        let grad_param = rank_attention_backward(
            &s.x,
            &s.rank_offset,
            &s.rank_param,
            &s.input_help,
            &s.param_help,
            &s.ins_rank,
            grad_output,
            &s.config,
        )?;
        Ok(vec![Some(grad_param)])
    }

    fn name(&self) -> &str {
        "RankAttentionBackward"
    }
}

/// Forward pass that records a backward node on `out` when `rank_param`
/// tracks gradients.
pub fn rank_attention_with_grad(
    x: &Tensor,
    rank_offset: &Tensor,
    rank_param: &Tensor,
    config: &RankAttentionConfig,
) -> Result<RankAttentionOutput> {
    let output = rank_attention_forward(x, rank_offset, rank_param, config)?;

    let Some(param_node) = rank_param.grad_node().filter(|_| rank_param.tracks_grad()) else {
        return Ok(output);
    };

    let saved = RankAttentionSaved {
        x: x.clone(),
        rank_offset: rank_offset.clone(),
        rank_param: rank_param.clone(),
        input_help: output.input_help.clone(),
        param_help: output.param_help.clone(),
        ins_rank: output.ins_rank.clone(),
        config: *config,
    };
    let node = GradNode::with_grad_fn(
        Box::new(RankAttentionBackward { saved }),
        vec![Arc::clone(param_node)],
    );

    Ok(RankAttentionOutput {
        out: output.out.with_grad_node(node),
        ..output
    })
}
