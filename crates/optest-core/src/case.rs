use anyhow::Result;

use crate::{CriterionSpec, DType, HostBuffer, TensorDescriptor};

/// Where the expected output comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReferenceSource {
    /// Run the CPU reference of the operator on generated inputs.
    Compute,
    /// Outputs were recorded on a trusted device and stored with the case.
    Recorded,
}

/// A parsed test case.
pub trait CaseSource {
    fn op_name(&self) -> &str;
    fn inputs(&self) -> &[TensorDescriptor];
    fn outputs(&self) -> &[TensorDescriptor];
    fn reference_source(&self) -> ReferenceSource;

    /// One criterion set covers all outputs.
    fn common_threshold(&self) -> bool;
    /// Criteria for `output`, or the shared set when `None`.
    fn criteria(&self, output: Option<usize>) -> Vec<CriterionSpec>;
    /// Per-output flag: `false` excludes the output from comparison.
    fn threshold_use(&self) -> Vec<bool>;

    /// Input values are generated (random or from a data file) rather than
    /// literal; generated values are produced directly in the reference dtype.
    fn input_is_generated(&self, index: usize) -> bool;
    /// `count` values of input `index`, encoded as `dtype`.
    fn input_values(&self, index: usize, dtype: DType, count: usize) -> Result<HostBuffer>;
    /// `count` recorded values of output `index`, encoded as the output dtype.
    fn output_values(&self, index: usize, count: usize) -> Result<HostBuffer>;

    /// Operators that must not be fed zero inputs.
    fn zero_input_blocklist(&self) -> &[String] {
        &[]
    }
    /// Operators that must always run the full host-data path.
    fn mlu_only_fast_blocklist(&self) -> &[String] {
        &[]
    }

    fn theory_ops(&self) -> Option<i64> {
        None
    }
    fn theory_io(&self) -> Option<i64> {
        None
    }
}
