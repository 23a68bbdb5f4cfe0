//! Kernel configuration and the operator attribute map.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use rankattn_core::{RankAttnError, Result};

/// `MaxRank` used when the attribute map does not set one.
pub const DEFAULT_MAX_RANK: usize = 3;

/// Minimum instance (or parameter-row) count before the kernels go parallel.
pub const DEFAULT_PAR_THRESHOLD: usize = 16;

/// Attribute key carrying the maximum number of rank slots per instance.
pub const MAX_RANK_ATTR: &str = "MaxRank";

/// Settings shared by the forward and backward kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RankAttentionConfig {
    /// Number of (rank, offset) slots per instance. Must be at least 1.
    pub max_rank: usize,
    /// Work items below this count run on the calling thread.
    pub par_threshold: usize,
}

impl Default for RankAttentionConfig {
    fn default() -> Self {
        Self {
            max_rank: DEFAULT_MAX_RANK,
            par_threshold: DEFAULT_PAR_THRESHOLD,
        }
    }
}

impl RankAttentionConfig {
    /// Config with the given `max_rank` and default parallelism.
    pub fn new(max_rank: usize) -> Result<Self> {
        let cfg = Self {
            max_rank,
            ..Self::default()
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn with_par_threshold(mut self, par_threshold: usize) -> Self {
        self.par_threshold = par_threshold;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_rank < 1 {
            return Err(RankAttnError::InvalidArgument(format!(
                "{MAX_RANK_ATTR} must be >= 1, got {}",
                self.max_rank
            )));
        }
        Ok(())
    }

    /// Build from an operator attribute map (`MaxRank` defaults to 3).
    pub fn from_attrs(attrs: &Attrs) -> Result<Self> {
        let max_rank = attrs.get_int_or(MAX_RANK_ATTR, DEFAULT_MAX_RANK as i64)?;
        let max_rank = usize::try_from(max_rank).map_err(|_| {
            RankAttnError::InvalidArgument(format!(
                "{MAX_RANK_ATTR} must be >= 1, got {max_rank}"
            ))
        })?;
        Self::new(max_rank)
    }

    /// Parse from JSON; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(json)
            .map_err(|e| RankAttnError::InvalidArgument(format!("config: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }
}

/// A single operator attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

/// Operator attribute map, as handed over by the host executor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Attrs {
    values: BTreeMap<String, AttrValue>,
}

impl Attrs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: AttrValue) -> Self {
        self.values.insert(key.into(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&AttrValue> {
        self.values.get(key)
    }

    /// Integer attribute, or `default` when absent. A non-integer value is an error.
    pub fn get_int_or(&self, key: &str, default: i64) -> Result<i64> {
        match self.values.get(key) {
            None => Ok(default),
            Some(AttrValue::Int(v)) => Ok(*v),
            Some(other) => Err(RankAttnError::InvalidArgument(format!(
                "attribute {key} must be an integer, got {other:?}"
            ))),
        }
    }
}
