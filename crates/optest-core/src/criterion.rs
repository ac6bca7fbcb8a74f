use serde::{Deserialize, Serialize};

use crate::{DType, HostBuffer};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorFunc {
    Diff1,
    Diff2,
    Diff3,
    Diff3_2,
    Diff4,
}

/// An error metric, its threshold and whether it takes part in pass/fail.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct CriterionSpec {
    pub func: ErrorFunc,
    pub threshold: f64,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl CriterionSpec {
    pub fn new(func: ErrorFunc, threshold: f64) -> Self {
        Self {
            func,
            threshold,
            enabled: true,
        }
    }

    /// Reported only; never flips the verdict.
    pub fn informational(func: ErrorFunc) -> Self {
        Self {
            func,
            threshold: 0.0,
            enabled: false,
        }
    }
}

/// Criteria are unique per metric; the first one inserted wins.
pub fn insert_criterion(set: &mut Vec<CriterionSpec>, criterion: CriterionSpec) -> bool {
    if set.iter().any(|c| c.func == criterion.func) {
        return false;
    }
    set.push(criterion);
    set.sort_by_key(|c| c.func);
    true
}

/// One computed error value.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub tensor: String,
    pub func: ErrorFunc,
    pub value: f64,
    pub threshold: f64,
    pub passed: bool,
}

/// Numeric error metrics between reference and device output.
///
/// Both buffers hold reference-typed values (see [`DType::reference_dtype`]).
pub trait ErrorEvaluator {
    #[allow(clippy::too_many_arguments)]
    fn compute_error(
        &mut self,
        baseline: &HostBuffer,
        device: &HostBuffer,
        count: usize,
        criterion: &CriterionSpec,
        name: &str,
        dtype: DType,
        skip_nan_inf: bool,
    );
    fn errors(&self) -> Vec<ErrorRecord>;
    fn is_passed(&self) -> bool;
    fn what(&self) -> Vec<String>;
}
