use crate::dtype::DType;

/// Errors raised by tensor construction and the rank attention kernels.
///
/// Every failure is deterministic: validation runs before any output buffer
/// is written, so an `Err` never leaves partial results behind.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RankAttnError {
    #[error("shape mismatch for {what}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        what: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("{kind} slot `{slot}` of operator `{op}` should not be null")]
    MissingSlot {
        op: &'static str,
        kind: SlotKind,
        slot: &'static str,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("data error at instance {instance}, slot {slot}: {reason}")]
    DataError {
        instance: usize,
        slot: usize,
        reason: String,
    },

    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch { expected: DType, got: DType },

    #[error("unsupported dtype: {0}")]
    UnsupportedDType(DType),

    #[error("storage error: {0}")]
    StorageError(String),
}

/// Direction of an operator slot, used in `MissingSlot` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Input,
    Output,
}

impl std::fmt::Display for SlotKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlotKind::Input => write!(f, "input"),
            SlotKind::Output => write!(f, "output"),
        }
    }
}

impl RankAttnError {
    /// Shorthand for a `ShapeMismatch` on a named tensor.
    pub fn shape(what: impl Into<String>, expected: &[usize], got: &[usize]) -> Self {
        RankAttnError::ShapeMismatch {
            what: what.into(),
            expected: expected.to_vec(),
            got: got.to_vec(),
        }
    }
}
