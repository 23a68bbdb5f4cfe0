//! RankAttention backward: scatter-add of per-instance block gradients.
//!
//! For instance `i`, `dParamBlock_i = InputHelp[i]^T · dOut[i]` is a
//! `B × para_col` outer product. Rows `k*d .. (k+1)*d` of it belong to
//! RankParam rows `off_k .. off_k + d` of slot `k`; empty slots contribute
//! nothing.
//!
//! Many instances may hit the same RankParam row. Instead of atomics or
//! locks, the work is partitioned by destination row: a CSR index lists, for
//! every RankParam row, the `(instance, InputHelp column)` pairs that feed
//! it, in ascending instance order. Each gradient row is then owned by a
//! single rayon task and summed in that fixed order, so the result is
//! bit-identical for any thread count.

use rayon::prelude::*;

use rankattn_core::{DType, FloatElement, RankAttnError, Result, Tensor};

use crate::config::RankAttentionConfig;
use crate::cpu_forward::split_rows;
use crate::offset::RankOffsetTable;
use crate::shape_check::{validate_grad_shapes, GradShapes, RankAttentionDims};

/// Backward pass of rank attention; returns the gradient of RankParam.
///
/// `rank_param` and `param_help` are only shape-checked, and `ins_rank` is
/// informational. No gradient is produced for `x` or `rank_offset`.
/// The kernel dtype follows `grad_out`.
#[allow(clippy::too_many_arguments)]
pub fn rank_attention_backward(
    x: &Tensor,
    rank_offset: &Tensor,
    rank_param: &Tensor,
    input_help: &Tensor,
    param_help: &Tensor,
    ins_rank: &Tensor,
    grad_out: &Tensor,
    config: &RankAttentionConfig,
) -> Result<Tensor> {
    config.validate()?;
    let dims = validate_grad_shapes(
        GradShapes {
            x: x.shape(),
            rank_offset: rank_offset.shape(),
            rank_param: rank_param.shape(),
            input_help: input_help.shape(),
            param_help: param_help.shape(),
            ins_rank: ins_rank.shape(),
            grad_out: grad_out.shape(),
        },
        config.max_rank,
    )?;
    if input_help.dtype() != grad_out.dtype() {
        return Err(RankAttnError::DTypeMismatch {
            expected: grad_out.dtype(),
            got: input_help.dtype(),
        });
    }
    let table = RankOffsetTable::parse(rank_offset, &dims)?;
    let index = ScatterIndex::build(&table, &dims);

    match grad_out.dtype() {
        DType::F32 => backward_typed::<f32>(input_help, grad_out, &index, &dims, config),
        DType::F64 => backward_typed::<f64>(input_help, grad_out, &index, &dims, config),
        other => Err(RankAttnError::UnsupportedDType(other)),
    }
}

/// For each RankParam row, the `(instance, InputHelp column)` pairs that feed it.
#[derive(Debug)]
struct ScatterIndex {
    /// `param_rows + 1` offsets into `sources`.
    row_ptr: Vec<usize>,
    sources: Vec<(usize, usize)>,
}

impl ScatterIndex {
    fn build(table: &RankOffsetTable, dims: &RankAttentionDims) -> Self {
        let d = dims.x_fea_dim;

        let mut counts = vec![0usize; dims.param_rows + 1];
        for i in 0..table.ins_num() {
            for &start in table.slots(i).iter().flatten() {
                for row in start..start + d {
                    counts[row + 1] += 1;
                }
            }
        }
        for r in 0..dims.param_rows {
            counts[r + 1] += counts[r];
        }
        let row_ptr = counts;

        let mut cursor = row_ptr.clone();
        let mut sources = vec![(0, 0); row_ptr[dims.param_rows]];
        for i in 0..table.ins_num() {
            for (k, slot) in table.slots(i).iter().enumerate() {
                let Some(start) = *slot else { continue };
                for j in 0..d {
                    let row = start + j;
                    sources[cursor[row]] = (i, k * d + j);
                    cursor[row] += 1;
                }
            }
        }

        Self { row_ptr, sources }
    }

    fn row(&self, r: usize) -> &[(usize, usize)] {
        &self.sources[self.row_ptr[r]..self.row_ptr[r + 1]]
    }
}

fn backward_typed<T: FloatElement>(
    input_help: &Tensor,
    grad_out: &Tensor,
    index: &ScatterIndex,
    dims: &RankAttentionDims,
    config: &RankAttentionConfig,
) -> Result<Tensor> {
    let ih = input_help.try_slice::<T>()?;
    let dout = grad_out.try_slice::<T>()?;
    let RankAttentionDims {
        param_rows,
        para_col,
        block_matrix_row,
        ..
    } = *dims;

    let mut grad = vec![T::zero(); param_rows * para_col];

    let accumulate_row = |(r, grad_row): (usize, &mut [T])| {
        for &(i, col) in index.row(r) {
            let g = ih[i * block_matrix_row + col];
            let dout_row = &dout[i * para_col..(i + 1) * para_col];
            for (acc, &dy) in grad_row.iter_mut().zip(dout_row) {
                *acc = *acc + g * dy;
            }
        }
    };

    let rows = split_rows(&mut grad, param_rows, para_col);
    if param_rows >= config.par_threshold {
        tracing::trace!(param_rows, "rank_attention backward: parallel");
        rows.into_par_iter().enumerate().for_each(accumulate_row);
    } else {
        tracing::trace!(param_rows, "rank_attention backward: sequential");
        rows.into_iter().enumerate().for_each(accumulate_row);
    }

    tracing::debug!(
        ins_num = dims.ins_num,
        param_rows,
        para_col,
        contributions = index.sources.len(),
        "rank_attention backward done"
    );

    Tensor::from_vec(grad, &dims.param_shape())
}
