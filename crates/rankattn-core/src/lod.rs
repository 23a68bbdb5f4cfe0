//! Sequence-length metadata ("level of detail") for ragged batches.
//!
//! A LoD is a stack of offset vectors. The finest (last) level partitions the
//! rows of a tensor into sequences: sequence `s` spans rows
//! `offsets[s]..offsets[s + 1]`. Each coarser level partitions the sequences
//! of the level below it in the same way.
//!
//! For rows grouped as `[3, 1, 2]`: `Lod::from_lengths(&[3, 1, 2])` gives the
//! single level `[0, 3, 4, 6]`.

use crate::error::RankAttnError;
use crate::Result;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Lod {
    levels: Vec<Vec<usize>>,
}

impl Lod {
    /// Build a LoD from explicit offset levels, coarsest first.
    pub fn new(levels: Vec<Vec<usize>>) -> Result<Self> {
        for (l, level) in levels.iter().enumerate() {
            if level.first() != Some(&0) {
                return Err(RankAttnError::InvalidArgument(format!(
                    "LoD level {l} must start at 0, got {level:?}"
                )));
            }
            if level.windows(2).any(|w| w[1] < w[0]) {
                return Err(RankAttnError::InvalidArgument(format!(
                    "LoD level {l} offsets must be non-decreasing, got {level:?}"
                )));
            }
        }
        for l in 1..levels.len() {
            let coarse_end = levels[l - 1].last().copied().unwrap_or(0);
            let fine_sequences = levels[l].len() - 1;
            if coarse_end != fine_sequences {
                return Err(RankAttnError::InvalidArgument(format!(
                    "LoD level {} ends at {coarse_end} but level {l} has {fine_sequences} sequences",
                    l - 1
                )));
            }
        }
        Ok(Self { levels })
    }

    /// Single-level LoD from per-sequence row counts.
    pub fn from_lengths(lengths: &[usize]) -> Self {
        let mut offsets = Vec::with_capacity(lengths.len() + 1);
        offsets.push(0);
        let mut acc = 0;
        for &len in lengths {
            acc += len;
            offsets.push(acc);
        }
        Self { levels: vec![offsets] }
    }

    /// No sequence grouping.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn levels(&self) -> &[Vec<usize>] {
        &self.levels
    }

    /// Row count covered by the finest level, if any.
    pub fn num_rows(&self) -> Option<usize> {
        self.levels.last().and_then(|l| l.last().copied())
    }
}
