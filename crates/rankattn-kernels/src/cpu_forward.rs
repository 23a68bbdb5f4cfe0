//! RankAttention forward: per-instance expansion + block multiply.
//!
//! For instance `i` with slots `k = 0..R` (R = `max_rank`, d = `x_fea_dim`,
//! B = `R * d`):
//!
//! ```text
//! InputHelp[i, k*d .. (k+1)*d]           = X[i]                      (or 0)
//! ParamHelp[i*B + k*d .. i*B + (k+1)*d]  = RankParam[off_k .. off_k+d] (or 0)
//! Out[i]                                 = InputHelp[i] · ParamHelp_i
//! ```
//!
//! Instances are independent, so the work is split across rayon workers.
//! Each output element sums its B terms sequentially in ascending order,
//! which keeps results identical between the parallel and sequential paths.

use rayon::prelude::*;

use rankattn_core::{DType, FloatElement, RankAttnError, Result, Tensor};

use crate::config::RankAttentionConfig;
use crate::offset::RankOffsetTable;
use crate::shape_check::{validate_shapes, RankAttentionDims};

/// Everything the forward pass produces.
///
/// `input_help` and `param_help` are the cached expansions the backward pass
/// consumes; `ins_rank` counts the non-empty slots of each instance.
#[derive(Debug, Clone)]
pub struct RankAttentionOutput {
    pub out: Tensor,
    pub input_help: Tensor,
    pub param_help: Tensor,
    pub ins_rank: Tensor,
}

/// Forward pass of rank attention.
///
/// - `x`: `[ins_num, x_fea_dim]` f32 or f64, may carry LoD
/// - `rank_offset`: `[ins_num, 2 * max_rank + 1]` i32
/// - `rank_param`: `[param_rows, para_col]`, same dtype as `x`
///
/// All shape and offset checks run before any output is allocated.
/// `out` inherits the LoD of `x`.
pub fn rank_attention_forward(
    x: &Tensor,
    rank_offset: &Tensor,
    rank_param: &Tensor,
    config: &RankAttentionConfig,
) -> Result<RankAttentionOutput> {
    config.validate()?;
    let dims = validate_shapes(x.shape(), rank_offset.shape(), rank_param.shape(), config.max_rank)?;
    if rank_param.dtype() != x.dtype() {
        return Err(RankAttnError::DTypeMismatch {
            expected: x.dtype(),
            got: rank_param.dtype(),
        });
    }
    let table = RankOffsetTable::parse(rank_offset, &dims)?;

    let mut output = match x.dtype() {
        DType::F32 => forward_typed::<f32>(x, rank_param, &table, &dims, config)?,
        DType::F64 => forward_typed::<f64>(x, rank_param, &table, &dims, config)?,
        other => return Err(RankAttnError::UnsupportedDType(other)),
    };
    output.out.set_lod(x.lod().clone())?;
    Ok(output)
}

/// Mutable views of one instance's slice of every forward output.
struct InstanceOut<'a, T> {
    out: &'a mut [T],
    input_help: &'a mut [T],
    param_help: &'a mut [T],
    ins_rank: &'a mut T,
}

/// Split a row-major buffer into `rows` chunks of `width`, tolerating `width == 0`.
pub(crate) fn split_rows<T>(buf: &mut [T], rows: usize, width: usize) -> Vec<&mut [T]> {
    if width == 0 {
        return (0..rows).map(|_| <&mut [T]>::default()).collect();
    }
    buf.chunks_mut(width).collect()
}

fn forward_typed<T: FloatElement>(
    x: &Tensor,
    rank_param: &Tensor,
    table: &RankOffsetTable,
    dims: &RankAttentionDims,
    config: &RankAttentionConfig,
) -> Result<RankAttentionOutput> {
    let x_data = x.try_slice::<T>()?;
    let param = rank_param.try_slice::<T>()?;

    let RankAttentionDims {
        ins_num,
        x_fea_dim,
        para_col,
        block_matrix_row,
        ..
    } = *dims;

    let mut out = vec![T::zero(); ins_num * para_col];
    let mut input_help = vec![T::zero(); ins_num * block_matrix_row];
    let mut param_help = vec![T::zero(); ins_num * block_matrix_row * para_col];
    let mut ins_rank = vec![T::zero(); ins_num];

    let work: Vec<InstanceOut<'_, T>> = split_rows(&mut out, ins_num, para_col)
        .into_iter()
        .zip(split_rows(&mut input_help, ins_num, block_matrix_row))
        .zip(split_rows(&mut param_help, ins_num, block_matrix_row * para_col))
        .zip(ins_rank.iter_mut())
        .map(|(((out, input_help), param_help), ins_rank)| InstanceOut {
            out,
            input_help,
            param_help,
            ins_rank,
        })
        .collect();

    let run = |(i, mut bufs): (usize, InstanceOut<'_, T>)| {
        let x_row = &x_data[i * x_fea_dim..(i + 1) * x_fea_dim];
        expand_instance(table.slots(i), x_row, param, x_fea_dim, para_col, &mut bufs);
        *bufs.ins_rank = T::from_count(table.valid_count(i));
        block_multiply(bufs.input_help, bufs.param_help, bufs.out);
    };

    if ins_num >= config.par_threshold {
        tracing::trace!(ins_num, "rank_attention forward: parallel");
        work.into_par_iter().enumerate().for_each(run);
    } else {
        tracing::trace!(ins_num, "rank_attention forward: sequential");
        work.into_iter().enumerate().for_each(run);
    }

    tracing::debug!(
        ins_num,
        x_fea_dim,
        para_col,
        max_rank = dims.max_rank,
        "rank_attention forward done"
    );

    Ok(RankAttentionOutput {
        out: Tensor::from_vec(out, &dims.out_shape())?,
        input_help: Tensor::from_vec(input_help, &dims.input_help_shape())?,
        param_help: Tensor::from_vec(param_help, &dims.param_help_shape())?,
        ins_rank: Tensor::from_vec(ins_rank, &dims.ins_rank_shape())?,
    })
}

/// Fill one instance's InputHelp row and ParamHelp block from its slots.
fn expand_instance<T: FloatElement>(
    slots: &[Option<usize>],
    x_row: &[T],
    param: &[T],
    x_fea_dim: usize,
    para_col: usize,
    bufs: &mut InstanceOut<'_, T>,
) {
    let block_len = x_fea_dim * para_col;

    for (k, slot) in slots.iter().enumerate() {
        let ih = &mut bufs.input_help[k * x_fea_dim..(k + 1) * x_fea_dim];
        let ph = &mut bufs.param_help[k * block_len..(k + 1) * block_len];
        match *slot {
            Some(row) => {
                ih.copy_from_slice(x_row);
                ph.copy_from_slice(&param[row * para_col..row * para_col + block_len]);
            }
            None => {
                ih.fill(T::zero());
                ph.fill(T::zero());
            }
        }
    }
}

/// `out = lhs (1 × B) · rhs (B × para_col)`, summing over B in ascending order.
fn block_multiply<T: FloatElement>(lhs: &[T], rhs: &[T], out: &mut [T]) {
    let para_col = out.len();
    out.fill(T::zero());
    if para_col == 0 {
        return;
    }
    for (r, &a) in lhs.iter().enumerate() {
        let rhs_row = &rhs[r * para_col..(r + 1) * para_col];
        for (o, &b) in out.iter_mut().zip(rhs_row) {
            *o = *o + a * b;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rankattn_core::Lod;

    fn cfg(max_rank: usize) -> RankAttentionConfig {
        RankAttentionConfig::new(max_rank).unwrap()
    }

    #[test]
    fn test_single_instance_two_slots() {
        // x_fea_dim = 2, para_col = 2, max_rank = 2
        let x = Tensor::from_f32(&[1.0, 2.0], &[1, 2]);
        let param = Tensor::from_f32(
            &[
                1.0, 0.0, // row 0
                0.0, 1.0, // row 1
                2.0, 3.0, // row 2
                4.0, 5.0, // row 3
            ],
            &[4, 2],
        );
        let offset = Tensor::from_i32(&[0, 1, 0, 2, 2], &[1, 5]);

        let r = rank_attention_forward(&x, &offset, &param, &cfg(2)).unwrap();
        assert_eq!(r.input_help.as_f32_slice().unwrap(), &[1.0, 2.0, 1.0, 2.0]);
        assert_eq!(
            r.param_help.as_f32_slice().unwrap(),
            &[1.0, 0.0, 0.0, 1.0, 2.0, 3.0, 4.0, 5.0]
        );
        // [1,2]·I + [1,2]·[[2,3],[4,5]] = [1,2] + [10,13]
        assert_eq!(r.out.as_f32_slice().unwrap(), &[11.0, 15.0]);
        assert_eq!(r.ins_rank.as_f32_slice().unwrap(), &[2.0]);
    }

    #[test]
    fn test_empty_slot_zero_fills() {
        let x = Tensor::from_f32(&[1.0, 2.0], &[1, 2]);
        let param = Tensor::from_f32(&[1.0, 1.0, 1.0, 1.0], &[2, 2]);
        let offset = Tensor::from_i32(&[0, -1, 0, 1, 0], &[1, 5]);

        let r = rank_attention_forward(&x, &offset, &param, &cfg(2)).unwrap();
        assert_eq!(r.input_help.as_f32_slice().unwrap(), &[0.0, 0.0, 1.0, 2.0]);
        assert_eq!(
            r.param_help.as_f32_slice().unwrap(),
            &[0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0]
        );
        assert_eq!(r.out.as_f32_slice().unwrap(), &[3.0, 3.0]);
        assert_eq!(r.ins_rank.as_f32_slice().unwrap(), &[1.0]);
    }

    #[test]
    fn test_output_shapes_and_lod() {
        let x = Tensor::zeros(&[3, 4], DType::F32)
            .with_lod(Lod::from_lengths(&[2, 1]))
            .unwrap();
        let param = Tensor::zeros(&[12, 5], DType::F32);
        let offset = Tensor::from_i32(&[[0, 1, 0, 1, 4, 1, 8]; 3].concat(), &[3, 7]);

        let r = rank_attention_forward(&x, &offset, &param, &cfg(3)).unwrap();
        assert_eq!(r.out.shape().dims(), &[3, 5]);
        assert_eq!(r.input_help.shape().dims(), &[3, 12]);
        assert_eq!(r.param_help.shape().dims(), &[36, 5]);
        assert_eq!(r.ins_rank.shape().dims(), &[3, 1]);
        assert_eq!(r.out.lod(), x.lod());
        assert!(r.input_help.lod().is_empty());
    }

    #[test]
    fn test_f64_path() {
        let x = Tensor::from_f64(&[0.5, -1.0], &[1, 2]);
        let param = Tensor::from_f64(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
        let offset = Tensor::from_i32(&[0, 1, 0], &[1, 3]);
        let r = rank_attention_forward(&x, &offset, &param, &cfg(1)).unwrap();
        assert_eq!(r.out.as_f64_slice().unwrap(), &[-2.5, -3.0]);
        assert_eq!(r.ins_rank.dtype(), DType::F64);
    }

    #[test]
    fn test_dtype_errors() {
        let x = Tensor::from_f32(&[0.5, -1.0], &[1, 2]);
        let param64 = Tensor::from_f64(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
        let offset = Tensor::from_i32(&[0, 1, 0], &[1, 3]);
        assert!(matches!(
            rank_attention_forward(&x, &offset, &param64, &cfg(1)),
            Err(RankAttnError::DTypeMismatch { .. })
        ));

        let xi = Tensor::from_i32(&[1, 2], &[1, 2]);
        let pi = Tensor::from_i32(&[1, 2, 3, 4], &[2, 2]);
        assert!(matches!(
            rank_attention_forward(&xi, &offset, &pi, &cfg(1)),
            Err(RankAttnError::UnsupportedDType(DType::I32))
        ));
    }

    #[test]
    fn test_zero_width_dims() {
        // para_col == 0: InputHelp is still expanded, Out has no columns
        let x = Tensor::from_f32(&[1.0, 2.0], &[1, 2]);
        let param = Tensor::zeros(&[2, 0], DType::F32);
        let offset = Tensor::from_i32(&[0, 1, 0], &[1, 3]);
        let r = rank_attention_forward(&x, &offset, &param, &cfg(1)).unwrap();
        assert_eq!(r.out.shape().dims(), &[1, 0]);
        assert_eq!(r.input_help.as_f32_slice().unwrap(), &[1.0, 2.0]);
        assert_eq!(r.ins_rank.as_f32_slice().unwrap(), &[1.0]);
    }

    #[test]
    fn test_block_multiply() {
        let mut out = [0.0f32; 2];
        block_multiply(&[1.0, 2.0, 3.0], &[1.0, 0.0, 0.0, 1.0, 1.0, 1.0], &mut out);
        assert_eq!(out, [4.0, 5.0]);
    }
}
