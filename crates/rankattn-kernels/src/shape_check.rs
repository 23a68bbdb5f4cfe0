//! Shape validation and output-shape derivation for rank attention.

use rankattn_core::{RankAttnError, Result, Shape};

/// Dimensions derived from the input shapes and `MaxRank`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankAttentionDims {
    pub ins_num: usize,
    pub x_fea_dim: usize,
    pub para_col: usize,
    /// Rows of the shared parameter matrix.
    pub param_rows: usize,
    pub max_rank: usize,
    /// Columns of the rank offset table (`2 * max_rank + 1` in practice).
    pub offset_cols: usize,
    /// `max_rank * x_fea_dim`: width of one InputHelp row.
    pub block_matrix_row: usize,
}

impl RankAttentionDims {
    pub fn out_shape(&self) -> [usize; 2] {
        [self.ins_num, self.para_col]
    }

    pub fn input_help_shape(&self) -> [usize; 2] {
        [self.ins_num, self.block_matrix_row]
    }

    pub fn param_help_shape(&self) -> [usize; 2] {
        [self.ins_num * self.block_matrix_row, self.para_col]
    }

    pub fn ins_rank_shape(&self) -> [usize; 2] {
        [self.ins_num, 1]
    }

    pub fn param_shape(&self) -> [usize; 2] {
        [self.param_rows, self.para_col]
    }
}

fn matrix(shape: &Shape, what: &str) -> Result<(usize, usize)> {
    shape.as_matrix().ok_or_else(|| RankAttnError::ShapeMismatch {
        what: format!("{what} (expected a 2-D tensor)"),
        expected: vec![0, 0],
        got: shape.dims().to_vec(),
    })
}

/// Validate the forward inputs and derive every output dimension.
///
/// - `x`: `[ins_num, x_fea_dim]`
/// - `rank_offset`: `[ins_num, 2 * max_rank + 1]`
/// - `rank_param`: `[param_rows, para_col]`
///
/// The column check uses integer division, `(cols - 1) / 2 == max_rank`, so a
/// table with one trailing padding column is accepted.
pub fn validate_shapes(
    x: &Shape,
    rank_offset: &Shape,
    rank_param: &Shape,
    max_rank: usize,
) -> Result<RankAttentionDims> {
    if max_rank < 1 {
        return Err(RankAttnError::InvalidArgument(format!(
            "MaxRank must be >= 1, got {max_rank}"
        )));
    }

    let (ins_num, x_fea_dim) = matrix(x, "X")?;
    let (offset_rows, offset_cols) = matrix(rank_offset, "RankOffset")?;
    let (param_rows, para_col) = matrix(rank_param, "RankParam")?;

    let expected_offset = [ins_num, max_rank.saturating_mul(2).saturating_add(1)];
    if offset_rows != ins_num {
        return Err(RankAttnError::shape(
            "RankOffset rows",
            &expected_offset,
            rank_offset.dims(),
        ));
    }
    if offset_cols == 0 || (offset_cols - 1) / 2 != max_rank {
        return Err(RankAttnError::shape(
            "RankOffset has wrong columns",
            &expected_offset,
            rank_offset.dims(),
        ));
    }

    // ParamHelp holds ins_num * max_rank * x_fea_dim * para_col elements
    let block_matrix_row = max_rank
        .checked_mul(x_fea_dim)
        .filter(|&b| {
            ins_num
                .checked_mul(b)
                .and_then(|rows| rows.checked_mul(para_col))
                .is_some()
        })
        .ok_or_else(|| {
            RankAttnError::InvalidArgument(format!(
                "ParamHelp size overflows: ins_num={ins_num} MaxRank={max_rank} \
                 x_fea_dim={x_fea_dim} para_col={para_col}"
            ))
        })?;

    let dims = RankAttentionDims {
        ins_num,
        x_fea_dim,
        para_col,
        param_rows,
        max_rank,
        offset_cols,
        block_matrix_row,
    };
    tracing::debug!(?dims, "rank_attention shapes validated");
    Ok(dims)
}

/// Shapes of every tensor the gradient operator consumes.
#[derive(Debug, Clone, Copy)]
pub struct GradShapes<'a> {
    pub x: &'a Shape,
    pub rank_offset: &'a Shape,
    pub rank_param: &'a Shape,
    pub input_help: &'a Shape,
    pub param_help: &'a Shape,
    pub ins_rank: &'a Shape,
    pub grad_out: &'a Shape,
}

/// Validate the gradient inputs against the forward contract.
///
/// The gradient of RankParam has RankParam's shape; X and RankOffset get none.
pub fn validate_grad_shapes(shapes: GradShapes<'_>, max_rank: usize) -> Result<RankAttentionDims> {
    let dims = validate_shapes(shapes.x, shapes.rank_offset, shapes.rank_param, max_rank)?;

    let checks: [(&str, [usize; 2], &Shape); 4] = [
        ("InputHelp", dims.input_help_shape(), shapes.input_help),
        ("ParamHelp", dims.param_help_shape(), shapes.param_help),
        ("InsRank", dims.ins_rank_shape(), shapes.ins_rank),
        ("Out@GRAD", dims.out_shape(), shapes.grad_out),
    ];
    for (what, expected, got) in checks {
        if got.dims() != expected {
            return Err(RankAttnError::shape(what, &expected, got.dims()));
        }
    }
    Ok(dims)
}
