//! Parsed rank offset table.
//!
//! Raw layout per instance (`2 * max_rank + 1` i32 columns):
//!
//! ```text
//! [own_rank, rank_0, offset_0, rank_1, offset_1, ..., rank_{R-1}, offset_{R-1}]
//! ```
//!
//! `own_rank` is not read. A negative `rank_k` marks slot `k` as empty. Otherwise `offset_k` is the
//! first RankParam row of the `x_fea_dim`-row block the slot attends to.

use rankattn_core::{DType, RankAttnError, Result, Tensor};

use crate::shape_check::RankAttentionDims;

/// Rank offset table with every slot resolved to a checked row offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankOffsetTable {
    ins_num: usize,
    max_rank: usize,
    /// `ins_num * max_rank` slots; `None` for empty slots.
    slots: Vec<Option<usize>>,
}

impl RankOffsetTable {
    /// Parse and bounds-check an i32 RankOffset tensor.
    pub fn parse(rank_offset: &Tensor, dims: &RankAttentionDims) -> Result<Self> {
        let raw = rank_offset
            .as_i32_slice()
            .ok_or(RankAttnError::DTypeMismatch {
                expected: DType::I32,
                got: rank_offset.dtype(),
            })?;
        Self::from_raw(raw, dims)
    }

    /// Parse a row-major raw table. Every valid slot must address a block
    /// lying entirely inside RankParam.
    pub fn from_raw(raw: &[i32], dims: &RankAttentionDims) -> Result<Self> {
        let cols = dims.offset_cols;
        if raw.len() != dims.ins_num * cols {
            return Err(RankAttnError::shape(
                "RankOffset",
                &[dims.ins_num, cols],
                &[raw.len()],
            ));
        }

        let mut slots = Vec::with_capacity(dims.ins_num * dims.max_rank);

        for (instance, row) in raw.chunks_exact(cols.max(1)).enumerate() {
            for slot in 0..dims.max_rank {
                let rank_id = row[2 * slot + 1];
                let offset = row[2 * slot + 2];
                slots.push(resolve_slot(instance, slot, rank_id, offset, dims)?);
            }
        }

        Ok(Self {
            ins_num: dims.ins_num,
            max_rank: dims.max_rank,
            slots,
        })
    }

    pub fn ins_num(&self) -> usize {
        self.ins_num
    }

    /// Resolved slots of one instance, in priority order.
    pub fn slots(&self, instance: usize) -> &[Option<usize>] {
        let start = instance * self.max_rank;
        &self.slots[start..start + self.max_rank]
    }

    /// Number of non-empty slots of one instance.
    pub fn valid_count(&self, instance: usize) -> usize {
        self.slots(instance).iter().flatten().count()
    }
}

fn resolve_slot(
    instance: usize,
    slot: usize,
    rank_id: i32,
    offset: i32,
    dims: &RankAttentionDims,
) -> Result<Option<usize>> {
    if rank_id < 0 {
        return Ok(None);
    }
    let start = usize::try_from(offset).map_err(|_| RankAttnError::DataError {
        instance,
        slot,
        reason: format!("negative RankParam row offset {offset} for rank {rank_id}"),
    })?;
    let end = start + dims.x_fea_dim;
    if end > dims.param_rows {
        return Err(RankAttnError::DataError {
            instance,
            slot,
            reason: format!(
                "rows {start}..{end} for rank {rank_id} exceed RankParam rows {}",
                dims.param_rows
            ),
        });
    }
    Ok(Some(start))
}
