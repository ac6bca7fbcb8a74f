#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use anyhow::{bail, ensure, Result};
use optest_backend_host::HostRuntime;
use optest_core::{
    CaseSource, CriterionSpec, DType, DeviceRuntime, ErrorEvaluator, ErrorFunc, ErrorRecord,
    HostBuffer, Kernel, LaunchArgs, OpKernel, QuantParams, ReferenceSource, TensorDescriptor,
};
use optest_runtime::{dense_to_strided, strided_to_dense, ExecutionContext};

/// Element-wise sum of every present float input.
pub struct SumOp {
    pub workspace: usize,
    pub reuse: Vec<usize>,
}

impl SumOp {
    pub fn new() -> Self {
        Self {
            workspace: 0,
            reuse: Vec::new(),
        }
    }
}

fn to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

fn from_f32(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_ne_bytes()).collect()
}

fn densify(bytes: &[u8], desc: &TensorDescriptor) -> Result<Vec<f32>> {
    if !desc.is_strided() {
        return Ok(to_f32(&bytes[..desc.shape_count() * 4]));
    }
    let mut dense = vec![0u8; desc.shape_count() * 4];
    strided_to_dense(&mut dense, bytes, desc.shape.dims(), desc.stride.dims(), 4)?;
    Ok(to_f32(&dense))
}

impl OpKernel for SumOp {
    fn name(&self) -> &str {
        "sum"
    }

    fn reused_inputs(&self) -> &[usize] {
        &self.reuse
    }

    fn workspace_size(&self, _: &[TensorDescriptor], _: &[TensorDescriptor]) -> usize {
        self.workspace
    }

    fn compute(&mut self, args: &LaunchArgs<'_>) -> Result<()> {
        let inputs: Vec<_> = args
            .inputs
            .iter()
            .zip(&args.input_ptrs)
            .filter_map(|(d, p)| p.map(|p| (d.clone(), p)))
            .collect();
        let (Some(out_desc), Some(Some(out_ptr))) =
            (args.outputs.first().cloned(), args.output_ptrs.first().copied())
        else {
            return Ok(());
        };
        args.runtime.enqueue(Kernel::new("sum", move |mem| {
            let mut acc = vec![0f32; out_desc.shape_count()];
            for (desc, ptr) in &inputs {
                for (a, v) in acc.iter_mut().zip(densify(&mem.read(*ptr)?, desc)?) {
                    *a += v;
                }
            }
            let mut out = mem.read(out_ptr)?;
            if out_desc.is_strided() {
                dense_to_strided(
                    &mut out,
                    &from_f32(&acc),
                    out_desc.shape.dims(),
                    out_desc.stride.dims(),
                    4,
                )?;
            } else {
                out[..acc.len() * 4].copy_from_slice(&from_f32(&acc));
            }
            mem.write(out_ptr, 0, &out)
        }))
    }

    fn cpu_compute(
        &mut self,
        inputs: &[Option<&HostBuffer>],
        outputs: &mut [Option<HostBuffer>],
    ) -> Result<()> {
        let Some(Some(out)) = outputs.first_mut() else {
            return Ok(());
        };
        let mut acc = vec![0f32; out.count()];
        for input in inputs.iter().flatten() {
            for (a, v) in acc.iter_mut().zip(input.to_f32_vec()) {
                *a += v;
            }
        }
        *out = HostBuffer::from_f32(&acc);
        Ok(())
    }

    fn theory_ops(&self, _: &[TensorDescriptor], outputs: &[TensorDescriptor]) -> i64 {
        outputs.iter().map(|o| o.shape_count() as i64).sum()
    }
}

/// What a [`CaptureOp`] saw during one run.
#[derive(Default)]
pub struct Captured {
    /// Dense reference inputs handed to the CPU reference.
    pub reference: Vec<Vec<f64>>,
    /// Raw device bytes of every present input at kernel time.
    pub device: Vec<Vec<u8>>,
    /// Input quantization parameters passed to the launch.
    pub quant: Vec<QuantParams>,
}

/// Records its inputs and leaves the first output untouched on both sides.
pub struct CaptureOp {
    pub seen: Arc<Mutex<Captured>>,
}

impl CaptureOp {
    pub fn new() -> (Self, Arc<Mutex<Captured>>) {
        let seen = Arc::new(Mutex::new(Captured::default()));
        (
            Self {
                seen: Arc::clone(&seen),
            },
            seen,
        )
    }
}

impl OpKernel for CaptureOp {
    fn name(&self) -> &str {
        "capture"
    }

    fn compute(&mut self, args: &LaunchArgs<'_>) -> Result<()> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.quant = args.inputs.iter().map(|d| d.quant).collect();
        }
        let ptrs: Vec<_> = args.input_ptrs.iter().flatten().copied().collect();
        let seen = Arc::clone(&self.seen);
        args.runtime.enqueue(Kernel::new("capture", move |mem| {
            let mut bytes = Vec::with_capacity(ptrs.len());
            for ptr in ptrs {
                bytes.push(mem.read(ptr)?);
            }
            if let Ok(mut seen) = seen.lock() {
                seen.device = bytes;
            }
            Ok(())
        }))
    }

    fn cpu_compute(
        &mut self,
        inputs: &[Option<&HostBuffer>],
        _outputs: &mut [Option<HostBuffer>],
    ) -> Result<()> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.reference = inputs.iter().flatten().map(|b| b.to_f64_vec()).collect();
        }
        Ok(())
    }

    fn theory_ops(&self, _: &[TensorDescriptor], outputs: &[TensorDescriptor]) -> i64 {
        outputs.iter().map(|o| o.shape_count() as i64).sum()
    }
}

/// Literal values per input, served as float, double or (real-only) complex
/// float.
pub struct FixedCase {
    pub op: String,
    pub inputs: Vec<TensorDescriptor>,
    pub outputs: Vec<TensorDescriptor>,
    pub values: Vec<Vec<f32>>,
    pub criteria: Vec<CriterionSpec>,
    pub zero_input_blocklist: Vec<String>,
    pub mlu_only_fast_blocklist: Vec<String>,
}

impl FixedCase {
    pub fn new(inputs: Vec<TensorDescriptor>, outputs: Vec<TensorDescriptor>) -> Self {
        let values = inputs
            .iter()
            .enumerate()
            .map(|(i, d)| {
                (0..d.total_count())
                    .map(|k| (i + 1) as f32 * 0.5 + k as f32)
                    .collect()
            })
            .collect();
        Self {
            op: "sum".into(),
            inputs,
            outputs,
            values,
            criteria: vec![CriterionSpec::new(ErrorFunc::Diff1, 1e-6)],
            zero_input_blocklist: Vec::new(),
            mlu_only_fast_blocklist: Vec::new(),
        }
    }
}

impl CaseSource for FixedCase {
    fn op_name(&self) -> &str {
        &self.op
    }
    fn inputs(&self) -> &[TensorDescriptor] {
        &self.inputs
    }
    fn outputs(&self) -> &[TensorDescriptor] {
        &self.outputs
    }
    fn reference_source(&self) -> ReferenceSource {
        ReferenceSource::Compute
    }
    fn common_threshold(&self) -> bool {
        true
    }
    fn criteria(&self, _output: Option<usize>) -> Vec<CriterionSpec> {
        self.criteria.clone()
    }
    fn threshold_use(&self) -> Vec<bool> {
        vec![true; self.outputs.len()]
    }
    fn input_is_generated(&self, _index: usize) -> bool {
        true
    }
    fn input_values(&self, index: usize, dtype: DType, count: usize) -> Result<HostBuffer> {
        let values = &self.values[index];
        ensure!(values.len() >= count, "not enough values for input {index}");
        let values = &values[..count];
        match dtype {
            DType::Float => Ok(HostBuffer::from_f32(values)),
            DType::Double => {
                let wide: Vec<f64> = values.iter().map(|&v| f64::from(v)).collect();
                Ok(HostBuffer::from_f64(&wide))
            }
            DType::ComplexFloat => {
                let bytes: Vec<u8> = values
                    .iter()
                    .flat_map(|&v| [v, 0.0])
                    .flat_map(f32::to_ne_bytes)
                    .collect();
                Ok(HostBuffer::from_bytes(dtype, &bytes))
            }
            other => bail!("fixed case cannot serve {other} data"),
        }
    }
    fn output_values(&self, _index: usize, _count: usize) -> Result<HostBuffer> {
        bail!("fixed case has no recorded outputs")
    }
    fn zero_input_blocklist(&self) -> &[String] {
        &self.zero_input_blocklist
    }
    fn mlu_only_fast_blocklist(&self) -> &[String] {
        &self.mlu_only_fast_blocklist
    }
}

/// Max absolute difference under every criterion.
#[derive(Default)]
pub struct MaxAbsEvaluator {
    records: Vec<ErrorRecord>,
}

impl ErrorEvaluator for MaxAbsEvaluator {
    fn compute_error(
        &mut self,
        baseline: &HostBuffer,
        device: &HostBuffer,
        count: usize,
        criterion: &CriterionSpec,
        name: &str,
        _dtype: DType,
        _skip_nan_inf: bool,
    ) {
        let b = baseline.to_f64_vec();
        let d = device.to_f64_vec();
        let value = b
            .iter()
            .zip(&d)
            .take(count)
            .map(|(x, y)| (x - y).abs())
            .fold(0.0, f64::max);
        self.records.push(ErrorRecord {
            tensor: name.to_string(),
            func: criterion.func,
            value,
            threshold: criterion.threshold,
            passed: !criterion.enabled || value <= criterion.threshold,
        });
    }

    fn errors(&self) -> Vec<ErrorRecord> {
        self.records.clone()
    }

    fn is_passed(&self) -> bool {
        self.records.iter().all(|r| r.passed)
    }

    fn what(&self) -> Vec<String> {
        self.records
            .iter()
            .filter(|r| !r.passed)
            .map(|r| format!("{} {:?} = {}", r.tensor, r.func, r.value))
            .collect()
    }
}

pub fn host() -> (Arc<HostRuntime>, Arc<ExecutionContext>) {
    host_with(HostRuntime::new())
}

pub fn host_with(rt: HostRuntime) -> (Arc<HostRuntime>, Arc<ExecutionContext>) {
    let rt = Arc::new(rt);
    let dyn_rt: Arc<dyn DeviceRuntime> = rt.clone();
    let ctx = ExecutionContext::new(dyn_rt).map(Arc::new);
    (rt, ctx.unwrap())
}
