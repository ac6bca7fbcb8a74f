//! JSON test-case files.
//!
//! ```json
//! {
//!   "op": "add",
//!   "inputs": [
//!     { "name": "a", "shape": [2, 3], "dtype": "half", "random": { "lower": -1, "upper": 1, "seed": 7 } },
//!     { "name": "b", "shape": [2, 3], "stride": [1, 2], "dtype": "half", "values": [1, 2, 3, 4, 5, 6] }
//!   ],
//!   "outputs": [{ "name": "y", "shape": [2, 3], "dtype": "half" }],
//!   "criteria": [{ "func": "diff1", "threshold": 0.003 }, { "func": "diff2", "threshold": 0.003 }]
//! }
//! ```
//!
//! When every present output carries `values`, those recorded values are the
//! reference; otherwise the operator's CPU reference runs.

use std::path::Path;

use anyhow::{bail, ensure, Context, Result};
use optest_core::{
    CaseSource, CriterionSpec, DType, ErrorFunc, HostBuffer, QuantParams, ReferenceSource, Shape, Strides,
    TensorDescriptor, TensorRole,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::codec;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RandomSpec {
    pub lower: f64,
    pub upper: f64,
    #[serde(default)]
    pub seed: u64,
}

fn default_scale() -> f32 {
    1.0
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TensorEntry {
    pub name: String,
    #[serde(default)]
    pub shape: Vec<usize>,
    #[serde(default)]
    pub stride: Vec<usize>,
    #[serde(default = "default_dtype")]
    pub dtype: DType,
    #[serde(default)]
    pub onchip_dtype: Option<DType>,
    #[serde(default)]
    pub position: i32,
    #[serde(default = "default_scale")]
    pub scale: f32,
    #[serde(default)]
    pub offset: i32,
    /// The tensor slot is left out of the case.
    #[serde(default)]
    pub null: bool,
    #[serde(default)]
    pub values: Option<Vec<f64>>,
    #[serde(default)]
    pub random: Option<RandomSpec>,
}

fn default_dtype() -> DType {
    DType::Float
}

impl TensorEntry {
    fn descriptor(&self, role: TensorRole) -> TensorDescriptor {
        TensorDescriptor {
            name: self.name.clone(),
            role,
            shape: Shape::from_slice(&self.shape),
            stride: Strides::from_slice(&self.stride),
            dtype: self.dtype,
            onchip_dtype: self.onchip_dtype,
            quant: QuantParams {
                position: self.position,
                scale: self.scale,
                offset: self.offset,
            },
            null: self.null,
        }
    }

    /// `count` elements encoded as `dtype`.
    fn values(&self, dtype: DType, count: usize) -> Result<HostBuffer> {
        let scalars = count * codec::lanes(dtype);
        if let Some(random) = &self.random {
            ensure!(
                random.lower < random.upper,
                "tensor `{}`: empty random range [{}, {})",
                self.name,
                random.lower,
                random.upper
            );
            let mut rng = StdRng::seed_from_u64(random.seed);
            let values: Vec<f64> = (0..scalars)
                .map(|_| rng.random_range(random.lower..random.upper))
                .collect();
            return codec::encode(&values, dtype);
        }
        let Some(values) = &self.values else {
            bail!("tensor `{}` has neither values nor a random range", self.name);
        };
        ensure!(
            values.len() >= scalars,
            "tensor `{}` holds {} values, {scalars} needed",
            self.name,
            values.len()
        );
        codec::encode(&values[..scalars], dtype)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CaseFile {
    pub op: String,
    pub inputs: Vec<TensorEntry>,
    #[serde(default)]
    pub outputs: Vec<TensorEntry>,
    /// Shared criteria for every output.
    #[serde(default)]
    pub criteria: Vec<CriterionSpec>,
    /// Per-output criteria; used instead of `criteria` when present.
    #[serde(default)]
    pub output_criteria: Option<Vec<Vec<CriterionSpec>>>,
    #[serde(default)]
    pub threshold_use: Option<Vec<bool>>,
    #[serde(default)]
    pub zero_input_blocklist: Vec<String>,
    #[serde(default)]
    pub mlu_only_fast_blocklist: Vec<String>,
    #[serde(default)]
    pub theory_ops: Option<i64>,
    #[serde(default)]
    pub theory_io: Option<i64>,
}

/// A parsed case file.
pub struct JsonCase {
    file: CaseFile,
    inputs: Vec<TensorDescriptor>,
    outputs: Vec<TensorDescriptor>,
}

impl JsonCase {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading case {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("parsing case {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let file: CaseFile = serde_json::from_str(raw)?;
        Self::from_file(file)
    }

    pub fn from_file(file: CaseFile) -> Result<Self> {
        ensure!(!file.op.is_empty(), "case has no operator name");
        if let Some(per_output) = &file.output_criteria {
            ensure!(
                per_output.len() == file.outputs.len(),
                "{} output criteria sets for {} outputs",
                per_output.len(),
                file.outputs.len()
            );
        }
        let every_criterion = file
            .criteria
            .iter()
            .chain(file.output_criteria.iter().flatten().flatten());
        for c in every_criterion {
            ensure!(
                !(c.enabled && c.func == ErrorFunc::Diff4),
                "diff4 can only be listed as informational (`\"enabled\": false`); it is not computed"
            );
        }
        let inputs = file
            .inputs
            .iter()
            .map(|t| t.descriptor(TensorRole::Input))
            .collect();
        let outputs = file
            .outputs
            .iter()
            .map(|t| t.descriptor(TensorRole::Output))
            .collect();
        Ok(Self {
            file,
            inputs,
            outputs,
        })
    }

    pub fn file(&self) -> &CaseFile {
        &self.file
    }
}

impl CaseSource for JsonCase {
    fn op_name(&self) -> &str {
        &self.file.op
    }

    fn inputs(&self) -> &[TensorDescriptor] {
        &self.inputs
    }

    fn outputs(&self) -> &[TensorDescriptor] {
        &self.outputs
    }

    fn reference_source(&self) -> ReferenceSource {
        let recorded = self
            .file
            .outputs
            .iter()
            .filter(|t| !t.null)
            .all(|t| t.values.is_some());
        if recorded && !self.file.outputs.is_empty() {
            ReferenceSource::Recorded
        } else {
            ReferenceSource::Compute
        }
    }

    fn common_threshold(&self) -> bool {
        self.file.output_criteria.is_none()
    }

    fn criteria(&self, output: Option<usize>) -> Vec<CriterionSpec> {
        let mut set = Vec::new();
        let source = match (output, &self.file.output_criteria) {
            (Some(i), Some(per_output)) => per_output.get(i).map(Vec::as_slice).unwrap_or(&[]),
            _ => self.file.criteria.as_slice(),
        };
        for c in source {
            optest_core::insert_criterion(&mut set, *c);
        }
        set
    }

    fn threshold_use(&self) -> Vec<bool> {
        self.file
            .threshold_use
            .clone()
            .unwrap_or_else(|| vec![true; self.outputs.len()])
    }

    fn input_is_generated(&self, index: usize) -> bool {
        self.file
            .inputs
            .get(index)
            .is_some_and(|t| t.random.is_some())
    }

    fn input_values(&self, index: usize, dtype: DType, count: usize) -> Result<HostBuffer> {
        let entry = self
            .file
            .inputs
            .get(index)
            .with_context(|| format!("no input {index}"))?;
        entry.values(dtype, count)
    }

    fn output_values(&self, index: usize, count: usize) -> Result<HostBuffer> {
        let entry = self
            .file
            .outputs
            .get(index)
            .with_context(|| format!("no output {index}"))?;
        entry.values(entry.dtype, count)
    }

    fn zero_input_blocklist(&self) -> &[String] {
        &self.file.zero_input_blocklist
    }

    fn mlu_only_fast_blocklist(&self) -> &[String] {
        &self.file.mlu_only_fast_blocklist
    }

    fn theory_ops(&self) -> Option<i64> {
        self.file.theory_ops
    }

    fn theory_io(&self) -> Option<i64> {
        self.file.theory_io
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CASE: &str = r#"{
        "op": "abs",
        "inputs": [
            { "name": "x", "shape": [2, 2], "dtype": "half", "random": { "lower": -2, "upper": 2, "seed": 3 } },
            { "name": "skip", "null": true }
        ],
        "outputs": [{ "name": "y", "shape": [2, 2], "dtype": "half" }],
        "criteria": [{ "func": "diff2", "threshold": 0.01 }, { "func": "diff1", "threshold": 0.01 }]
    }"#;

    #[test]
    fn parses_descriptors_and_criteria() {
        let case = JsonCase::parse(CASE).unwrap();
        assert_eq!(case.op_name(), "abs");
        assert_eq!(case.inputs()[0].dtype, DType::Half);
        assert!(case.inputs()[1].is_empty());
        assert!(case.common_threshold());
        assert_eq!(case.reference_source(), ReferenceSource::Compute);
        let funcs: Vec<_> = case.criteria(None).iter().map(|c| c.func).collect();
        assert_eq!(funcs, [ErrorFunc::Diff1, ErrorFunc::Diff2]);
        assert_eq!(case.threshold_use(), vec![true]);
    }

    #[test]
    fn random_values_are_seeded_and_in_range() {
        let case = JsonCase::parse(CASE).unwrap();
        assert!(case.input_is_generated(0));
        let a = case.input_values(0, DType::Float, 4).unwrap().to_f32_vec();
        let b = case.input_values(0, DType::Float, 4).unwrap().to_f32_vec();
        assert_eq!(a, b);
        assert!(a.iter().all(|v| (-2.0..2.0).contains(v)));
    }

    #[test]
    fn short_literal_values_are_rejected() {
        let case = JsonCase::parse(
            r#"{ "op": "abs", "inputs": [{ "name": "x", "shape": [3], "values": [1, 2] }] }"#,
        )
        .unwrap();
        assert!(case.input_values(0, DType::Float, 3).is_err());
    }

    #[test]
    fn enabled_diff4_is_rejected_at_parse_time() {
        let shared = r#"{ "op": "abs", "inputs": [], "outputs": [{ "name": "y" }],
            "criteria": [{ "func": "diff4", "threshold": 0.1 }] }"#;
        let err = JsonCase::parse(shared).err().expect("diff4 accepted");
        assert!(format!("{err:#}").contains("diff4"));

        let per_output = r#"{ "op": "abs", "inputs": [], "outputs": [{ "name": "y" }],
            "output_criteria": [[{ "func": "diff1", "threshold": 0.1 }, { "func": "diff4", "threshold": 0.1 }]] }"#;
        assert!(JsonCase::parse(per_output).is_err());

        let informational = r#"{ "op": "abs", "inputs": [], "outputs": [{ "name": "y" }],
            "criteria": [{ "func": "diff4", "threshold": 0.1, "enabled": false }] }"#;
        let case = JsonCase::parse(informational).unwrap();
        assert!(!case.criteria(None)[0].enabled);
    }
}
