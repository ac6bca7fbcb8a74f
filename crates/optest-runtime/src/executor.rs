//! Lifecycle of one test case on the device.
//!
//! ```text
//! Uninitialized -> Initialized -> Configured -> Launched -> (Polling) -> Synced -> Evaluated
//!                                                                                    |
//!                     any state ---------------------------------------------> Released
//! ```
//!
//! Host data flow for a case whose reference is computed on the CPU:
//!
//! ```text
//!   reference input (float, strided)  --cast in-->  host input (device dtype)  --h2d-->  device
//!            | strided -> dense                                                            |
//!   cpu reference output (dense)                          host output  <------d2h----------+
//!            | dense -> strided                               | cast out
//!            +-----------------------> diff <-----------------+
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use optest_core::{
    insert_criterion, Arch, BaselineStore, CaseSource, ContractError, CriterionSpec, DType,
    DeviceHandle, DeviceRuntime, ErrorEvaluator, ErrorFunc, EvaluateResult, HostBuffer,
    LaunchArgs, Notifier, OpKernel, PerfInfo, QuantParams, QueueStatus, ReferenceSource,
    TensorDescriptor, TensorRole,
};
use tracing::{debug, info, warn};

use crate::baseline::{apply_baseline, BaselineThresholds};
use crate::capability::CapabilityConfig;
use crate::cast::{cast_in, cast_out, round_trip_half, CastOptions, QuantMode};
use crate::memory::{ActiveBuffer, CaseMemory};
use crate::perf::{compute_efficiency, io_bandwidth, io_efficiency, peak_compute_force};
use crate::stride::{dense_to_strided, strided_to_dense};

/// Architectures whose error metrics drop NaN/Inf positions.
pub const NAN_INF_SKIP_ARCHS: [Arch; 3] = [Arch::Mlu220, Arch::Mlu270, Arch::Mlu290];

#[derive(Clone, Debug)]
pub struct ExecuteConfig {
    /// Number of back-to-back launches timed after the correctness run.
    /// Values above 1 enable the perf buffers.
    pub perf_repeat: u32,
    /// Run the device side only; no reference and no diff.
    pub mlu_only: bool,
    pub zero_input: bool,
    /// Also report DIFF1..DIFF3 without letting them fail the case.
    pub fixed_criterion: bool,
    pub perf_baseline: bool,
    pub quant_mode: QuantMode,
    pub baseline_thresholds: BaselineThresholds,
    /// Read from the environment at setup when `None`.
    pub capability: Option<CapabilityConfig>,
}

impl Default for ExecuteConfig {
    fn default() -> Self {
        Self {
            perf_repeat: 1,
            mlu_only: false,
            zero_input: false,
            fixed_criterion: false,
            perf_baseline: false,
            quant_mode: QuantMode::NoQuant,
            baseline_thresholds: BaselineThresholds::default(),
            capability: None,
        }
    }
}

/// Device, queue and the pair of timing notifiers shared by every case run
/// on that device.
pub struct ExecutionContext {
    runtime: Arc<dyn DeviceRuntime>,
    start: Option<Notifier>,
    stop: Option<Notifier>,
}

impl ExecutionContext {
    pub fn new(runtime: Arc<dyn DeviceRuntime>) -> Result<Self> {
        let mut ctx = Self {
            runtime,
            start: None,
            stop: None,
        };
        ctx.start = Some(ctx.runtime.create_notifier().context("creating start notifier")?);
        ctx.stop = Some(ctx.runtime.create_notifier().context("creating stop notifier")?);
        debug!(runtime = ctx.runtime.name(), "execution context ready");
        Ok(ctx)
    }

    pub fn runtime(&self) -> &Arc<dyn DeviceRuntime> {
        &self.runtime
    }

    pub fn handle(&self) -> DeviceHandle {
        self.runtime.handle()
    }

    fn notifiers(&self) -> Result<(Notifier, Notifier)> {
        match (self.start, self.stop) {
            (Some(start), Some(stop)) => Ok((start, stop)),
            _ => Err(ContractError::InvalidTransition {
                action: "use timing notifiers",
                state: "destroyed context".into(),
            }
            .into()),
        }
    }

    pub fn destroy(&mut self) {
        for notifier in [self.start.take(), self.stop.take()].into_iter().flatten() {
            if let Err(err) = self.runtime.destroy_notifier(notifier) {
                warn!(error = ?err, ?notifier, "destroy notifier failed");
            }
        }
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecState {
    Uninitialized,
    Initialized,
    Configured,
    Launched,
    Polling,
    Synced,
    Evaluated,
    Released,
}

impl fmt::Display for ExecState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Drives one operator through one case.
pub struct Executor {
    op: Box<dyn OpKernel>,
    config: ExecuteConfig,
    state: ExecState,
    ctx: Option<Arc<ExecutionContext>>,
    evaluator: Option<Box<dyn ErrorEvaluator>>,
    case: Option<Box<dyn CaseSource>>,
    case_path: String,
    inputs: Vec<TensorDescriptor>,
    /// Under input reuse these describe the aliased inputs.
    outputs: Vec<TensorDescriptor>,
    memory: Option<CaseMemory>,
    /// Dense, reference-typed inputs for the CPU reference.
    reference_inputs: Vec<Option<HostBuffer>>,
    /// Strided reference inputs kept to seed reused outputs.
    strided_inputs: Vec<Option<HostBuffer>>,
    zero_input: bool,
    mlu_only_fast: bool,
    quant_mode: QuantMode,
    workspace_size: usize,
    interface_time: f64,
    hardware_time: f64,
}

impl Executor {
    pub fn new(op: Box<dyn OpKernel>, config: ExecuteConfig) -> Self {
        Self {
            op,
            quant_mode: config.quant_mode,
            config,
            state: ExecState::Uninitialized,
            ctx: None,
            evaluator: None,
            case: None,
            case_path: String::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            memory: None,
            reference_inputs: Vec::new(),
            strided_inputs: Vec::new(),
            zero_input: false,
            mlu_only_fast: false,
            workspace_size: 0,
            interface_time: -1.0,
            hardware_time: 0.0,
        }
    }

    pub fn state(&self) -> ExecState {
        self.state
    }

    pub fn config(&self) -> &ExecuteConfig {
        &self.config
    }

    /// Inputs as configured, with the quantization parameters chosen during
    /// setup.
    pub fn inputs(&self) -> &[TensorDescriptor] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TensorDescriptor] {
        &self.outputs
    }

    pub fn memory(&self) -> Option<&CaseMemory> {
        self.memory.as_ref()
    }

    /// Mean hardware time of the last measurement, in microseconds.
    pub fn hardware_time(&self) -> f64 {
        self.hardware_time
    }

    fn expect_state(&self, action: &'static str, allowed: &[ExecState]) -> Result<()> {
        if allowed.contains(&self.state) {
            return Ok(());
        }
        Err(ContractError::InvalidTransition {
            action,
            state: self.state.to_string(),
        }
        .into())
    }

    fn context(&self) -> Result<Arc<ExecutionContext>> {
        self.ctx.clone().ok_or_else(|| {
            ContractError::InvalidTransition {
                action: "reach the execution context",
                state: self.state.to_string(),
            }
            .into()
        })
    }

    pub fn init(
        &mut self,
        ctx: Arc<ExecutionContext>,
        evaluator: Box<dyn ErrorEvaluator>,
    ) -> Result<()> {
        self.expect_state("initialize", &[ExecState::Uninitialized])?;
        debug!(op = self.op.name(), runtime = ctx.runtime().name(), "executor init");
        self.ctx = Some(ctx);
        self.evaluator = Some(evaluator);
        self.state = ExecState::Initialized;
        Ok(())
    }

    /// Allocate and fill every buffer of `case`. On failure everything
    /// allocated so far is freed before returning.
    pub fn setup(&mut self, case_path: impl Into<String>, case: Box<dyn CaseSource>) -> Result<()> {
        self.expect_state("set up", &[ExecState::Initialized])?;
        let ctx = self.context()?;
        let runtime = Arc::clone(ctx.runtime());

        let capability = self.config.capability.unwrap_or_else(CapabilityConfig::from_env);
        capability.apply(runtime.as_ref())?;

        self.case_path = case_path.into();
        debug!(case = %self.case_path, "param check");
        if case.op_name().is_empty() {
            return Err(ContractError::MissingOpName("case setup").into());
        }
        if case.op_name() != self.op.name() {
            return Err(ContractError::CaseRejected {
                op: self.op.name().to_string(),
                reason: format!("case is for `{}`", case.op_name()),
            }
            .into());
        }
        for desc in case.inputs().iter().chain(case.outputs()) {
            desc.validate()
                .with_context(|| format!("tensor `{}`", desc.name))?;
        }
        self.op.param_check(case.as_ref())?;

        let op_name = case.op_name();
        self.zero_input = self.config.zero_input
            && !case.zero_input_blocklist().iter().any(|o| o == op_name);
        self.mlu_only_fast = self.config.mlu_only
            && !self.zero_input
            && !case.mlu_only_fast_blocklist().iter().any(|o| o == op_name);
        self.quant_mode = match case.reference_source() {
            ReferenceSource::Compute => self.config.quant_mode,
            ReferenceSource::Recorded => QuantMode::NoQuant,
        };
        debug!(
            zero_input = self.zero_input,
            mlu_only_fast = self.mlu_only_fast,
            quant_mode = ?self.quant_mode,
            "case policies"
        );

        debug!("create tensors");
        let mut inputs = case.inputs().to_vec();
        let case_outputs = case.outputs().to_vec();
        let reused = self.op.reused_inputs().to_vec();

        debug!("host malloc");
        let mut memory = CaseMemory::new(Arc::clone(&runtime));
        memory.host_malloc(&inputs, &case_outputs, &reused)?;

        self.reference_inputs = vec![None; inputs.len()];
        self.strided_inputs = vec![None; inputs.len()];
        if !self.mlu_only_fast {
            match case.reference_source() {
                ReferenceSource::Compute => {
                    debug!("init reference inputs and cast in");
                    self.init_reference_inputs(case.as_ref(), &mut inputs, &mut memory, !reused.is_empty())?;
                }
                ReferenceSource::Recorded => {
                    debug!("init host data from recorded values");
                    init_recorded_inputs(case.as_ref(), &inputs, &mut memory)?;
                }
            }
        }

        let outputs = if reused.is_empty() {
            case_outputs.clone()
        } else {
            reused
                .iter()
                .map(|&i| {
                    inputs
                        .get(i)
                        .map(|d| TensorDescriptor {
                            role: TensorRole::Output,
                            ..d.clone()
                        })
                        .ok_or(ContractError::CountMismatch {
                            what: "reusable inputs",
                            expected: i + 1,
                            actual: inputs.len(),
                        })
                })
                .collect::<Result<Vec<_>, _>>()?
        };

        debug!("device malloc");
        let with_perf = self.config.perf_repeat > 1;
        memory.device_malloc(case_outputs.len(), with_perf)?;
        debug!("copy host -> device");
        memory.copy_in(!self.mlu_only_fast, with_perf && !self.config.mlu_only)?;
        memory.switch_to(ActiveBuffer::Origin);

        debug!("workspace malloc");
        self.workspace_size = self.op.workspace_size(&inputs, &outputs);
        memory.workspace_malloc(self.workspace_size)?;

        self.inputs = inputs;
        self.outputs = outputs;
        self.memory = Some(memory);
        self.case = Some(case);
        self.state = ExecState::Configured;
        Ok(())
    }

    fn init_reference_inputs(
        &mut self,
        case: &dyn CaseSource,
        inputs: &mut [TensorDescriptor],
        memory: &mut CaseMemory,
        keep_strided: bool,
    ) -> Result<()> {
        for (i, desc) in inputs.iter_mut().enumerate() {
            if desc.is_empty() {
                debug!(name = %desc.name, "skip empty input");
                continue;
            }
            let ref_dtype = desc.reference_dtype();
            let count = desc.total_count();
            let mut reference = if self.zero_input {
                debug!(name = %desc.name, "input set to zero");
                HostBuffer::zeroed(ref_dtype, count)
            } else if case.input_is_generated(i) {
                case.input_values(i, ref_dtype, count)?
            } else {
                let raw = case.input_values(i, desc.dtype, count)?;
                let mut buf = HostBuffer::zeroed(ref_dtype, count);
                cast_out(
                    raw.as_bytes(),
                    desc.dtype,
                    buf.as_bytes_mut(),
                    ref_dtype,
                    count,
                    QuantMode::NoQuant,
                    desc.quant,
                )
                .with_context(|| format!("reading input `{}`", desc.name))?;
                buf
            };

            let host = memory
                .block_mut(i)
                .and_then(|b| b.host.as_mut())
                .ok_or(ContractError::CountMismatch {
                    what: "host input buffers",
                    expected: i + 1,
                    actual: i,
                })?;
            desc.quant = cast_reference_in(desc, &mut reference, host, self.quant_mode)
                .with_context(|| format!("casting input `{}`", desc.name))?;

            if !desc.is_strided() {
                self.reference_inputs[i] = Some(reference);
                continue;
            }
            let mut dense = HostBuffer::zeroed(ref_dtype, desc.shape_count());
            strided_to_dense(
                dense.as_bytes_mut(),
                reference.as_bytes(),
                desc.shape.dims(),
                desc.stride.dims(),
                ref_dtype.size_of(),
            )?;
            self.reference_inputs[i] = Some(dense);
            if keep_strided {
                self.strided_inputs[i] = Some(reference);
            }
        }
        Ok(())
    }

    /// Enqueue the warm-up invocation between the start and stop notifiers.
    pub fn launch(&mut self) -> Result<()> {
        self.expect_state("launch", &[ExecState::Configured])?;
        let ctx = self.context()?;
        let (start, stop) = ctx.notifiers()?;
        let runtime = ctx.runtime();

        debug!("compute once for warm up");
        runtime.place_notifier(start)?;
        let t0 = Instant::now();
        self.compute_once(runtime.as_ref())?;
        self.interface_time = t0.elapsed().as_secs_f64() * 1e6;
        runtime.place_notifier(stop)?;
        self.state = ExecState::Launched;
        Ok(())
    }

    fn compute_once(&mut self, runtime: &dyn DeviceRuntime) -> Result<()> {
        let memory = self.memory.as_ref().ok_or(ContractError::InvalidTransition {
            action: "launch without buffers",
            state: self.state.to_string(),
        })?;
        let args = LaunchArgs {
            runtime,
            inputs: &self.inputs,
            outputs: &self.outputs,
            input_ptrs: memory.input_blocks().map(|b| b.device_ptr()).collect(),
            output_ptrs: memory.output_blocks().map(|b| b.device_ptr()).collect(),
            workspace: memory.workspace_ptr(),
        };
        self.op
            .compute(&args)
            .with_context(|| format!("launching `{}`", self.op.name()))
    }

    /// Non-blocking check of the stop notifier.
    pub fn ready(&mut self) -> Result<bool> {
        self.expect_state("poll", &[ExecState::Launched, ExecState::Polling])?;
        let ctx = self.context()?;
        let (_, stop) = ctx.notifiers()?;
        let status = ctx
            .runtime()
            .query_notifier(stop)
            .context("kernel call failed while polling the queue")?;
        self.state = ExecState::Polling;
        Ok(status == QueueStatus::Ready)
    }

    /// Block until the queue drains and record the warm-up hardware time.
    pub fn sync(&mut self) -> Result<()> {
        self.expect_state("sync", &[ExecState::Launched, ExecState::Polling])?;
        self.hardware_time = self.sync_and_measure(1)?;
        self.state = ExecState::Synced;
        Ok(())
    }

    fn sync_and_measure(&self, repeat: u32) -> Result<f64> {
        let ctx = self.context()?;
        let (start, stop) = ctx.notifiers()?;
        ctx.runtime().sync_queue().context("syncing queue")?;
        let total = ctx.runtime().notifier_duration_us(start, stop)?;
        let mean = total / f64::from(repeat.max(1));
        debug!(hardware_time_us = mean, repeat, "hardware time");
        Ok(mean)
    }

    /// Perf repeat, copy back, reference, diff and performance metrics.
    pub fn teardown(&mut self, baseline: Option<&dyn BaselineStore>) -> Result<EvaluateResult> {
        self.expect_state("tear down", &[ExecState::Synced])?;
        let ctx = self.context()?;
        let runtime = Arc::clone(ctx.runtime());
        let (start, stop) = ctx.notifiers()?;
        let case = self.case.take().ok_or(ContractError::InvalidTransition {
            action: "tear down without a case",
            state: self.state.to_string(),
        })?;

        let repeat = self.config.perf_repeat;
        if repeat > 1 {
            debug!(repeat, "compute for perf test");
            self.switch_buffers(ActiveBuffer::Perf);
            runtime.place_notifier(start)?;
            for _ in 0..repeat {
                self.compute_once(runtime.as_ref())?;
            }
            runtime.place_notifier(stop)?;
            self.hardware_time = self.sync_and_measure(repeat)?;
            self.switch_buffers(ActiveBuffer::Origin);
        }

        let memory = self.memory.as_mut().ok_or(ContractError::InvalidTransition {
            action: "tear down without buffers",
            state: self.state.to_string(),
        })?;
        debug!("workspace free");
        memory.workspace_free();
        debug!("copy device -> host");
        memory.copy_out()?;

        let mut result = EvaluateResult {
            case_path: self.case_path.clone(),
            op_name: case.op_name().to_string(),
            is_passed: true,
            ..Default::default()
        };

        let handle = runtime.handle();
        if self.config.mlu_only {
            debug!("device only, skip reference and diff");
        } else {
            let reference = self.reference_outputs(case.as_ref())?;
            let device = self.device_outputs()?;
            let mut evaluator = self.evaluator.take().ok_or(ContractError::InvalidTransition {
                action: "evaluate without an error evaluator",
                state: self.state.to_string(),
            })?;
            debug!("calculate error between device and reference");
            self.compare(
                case.as_ref(),
                evaluator.as_mut(),
                &reference,
                &device,
                NAN_INF_SKIP_ARCHS.contains(&handle.arch),
            );
            result.errors = evaluator.errors();
            result.is_passed = evaluator.is_passed();
            result.what = evaluator.what();
            self.evaluator = Some(evaluator);
        }

        result.perf = self.perf_info(case.as_ref(), &handle)?;
        if self.config.perf_baseline {
            match baseline {
                Some(store) => {
                    apply_baseline(&mut result, store, &self.config.baseline_thresholds)?;
                }
                None => warn!("performance baseline requested but no store is available"),
            }
        }

        info!(
            case = %result.case_path,
            passed = result.is_passed,
            hardware_time_us = result.perf.hardware_time,
            "case evaluated"
        );
        self.case = Some(case);
        self.state = ExecState::Evaluated;
        Ok(result)
    }

    fn switch_buffers(&mut self, active: ActiveBuffer) {
        if let Some(memory) = self.memory.as_mut() {
            memory.switch_to(active);
        }
    }

    /// Reference outputs in reference dtype, laid out like the device
    /// outputs (`total_count` elements).
    fn reference_outputs(&mut self, case: &dyn CaseSource) -> Result<Vec<Option<HostBuffer>>> {
        let mut outputs: Vec<Option<HostBuffer>> = self
            .outputs
            .iter()
            .map(|d| (!d.is_empty()).then(|| HostBuffer::zeroed(d.reference_dtype(), d.shape_count())))
            .collect();

        match case.reference_source() {
            ReferenceSource::Compute => {
                debug!("begin cpu compute");
                let inputs: Vec<Option<&HostBuffer>> =
                    self.reference_inputs.iter().map(Option::as_ref).collect();
                self.op
                    .cpu_compute(&inputs, &mut outputs)
                    .with_context(|| format!("cpu reference of `{}`", self.op.name()))?;
                for (desc, buf) in self.outputs.iter().zip(outputs.iter_mut()) {
                    if let (DType::Half, Some(buf)) = (desc.dtype, buf.as_mut()) {
                        round_trip_half(buf.as_bytes_mut());
                    }
                }
            }
            ReferenceSource::Recorded => {
                debug!("read recorded reference outputs");
                for (i, (desc, buf)) in self.outputs.iter().zip(outputs.iter_mut()).enumerate() {
                    let Some(buf) = buf.as_mut() else {
                        continue;
                    };
                    let raw = case.output_values(i, desc.shape_count())?;
                    let ref_dtype = buf.dtype();
                    cast_out(
                        raw.as_bytes(),
                        desc.dtype,
                        buf.as_bytes_mut(),
                        ref_dtype,
                        desc.shape_count(),
                        QuantMode::NoQuant,
                        desc.quant,
                    )
                    .with_context(|| format!("reading reference output `{}`", desc.name))?;
                }
            }
        }

        let reused = self.op.reused_inputs();
        for (i, (desc, slot)) in self.outputs.iter().zip(outputs.iter_mut()).enumerate() {
            let Some(dense) = slot.as_ref() else {
                continue;
            };
            if !desc.is_strided() {
                continue;
            }
            debug!(name = %desc.name, "reference output strided out");
            let seed = reused
                .get(i)
                .and_then(|&j| self.strided_inputs.get(j))
                .and_then(Option::clone);
            let mut strided =
                seed.unwrap_or_else(|| HostBuffer::zeroed(dense.dtype(), desc.total_count()));
            dense_to_strided(
                strided.as_bytes_mut(),
                dense.as_bytes(),
                desc.shape.dims(),
                desc.stride.dims(),
                dense.dtype().size_of(),
            )?;
            *slot = Some(strided);
        }
        Ok(outputs)
    }

    /// Device outputs cast to reference dtype.
    fn device_outputs(&self) -> Result<Vec<Option<HostBuffer>>> {
        let memory = self.memory.as_ref().ok_or(ContractError::InvalidTransition {
            action: "read outputs without buffers",
            state: self.state.to_string(),
        })?;
        debug!("cast device output to reference dtype");
        self.outputs
            .iter()
            .enumerate()
            .map(|(i, desc)| {
                let Some(host) = memory.output_block(i).and_then(|b| b.host.as_ref()) else {
                    return Ok(None);
                };
                let count = desc.total_count();
                let ref_dtype = desc.reference_dtype();
                let mut buf = HostBuffer::zeroed(ref_dtype, count);
                cast_out(
                    host.as_bytes(),
                    desc.dtype,
                    buf.as_bytes_mut(),
                    ref_dtype,
                    count,
                    self.quant_mode,
                    desc.quant,
                )
                .with_context(|| format!("casting output `{}`", desc.name))?;
                Ok(Some(buf))
            })
            .collect()
    }

    fn compare(
        &self,
        case: &dyn CaseSource,
        evaluator: &mut dyn ErrorEvaluator,
        reference: &[Option<HostBuffer>],
        device: &[Option<HostBuffer>],
        skip_nan_inf: bool,
    ) {
        let common = case.common_threshold();
        let mut shared = Vec::new();
        if common {
            shared = case.criteria(None);
            if self.config.fixed_criterion {
                for func in [ErrorFunc::Diff1, ErrorFunc::Diff2, ErrorFunc::Diff3] {
                    insert_criterion(&mut shared, CriterionSpec::informational(func));
                }
            }
        }
        let threshold_use = case.threshold_use();

        for (i, desc) in self.outputs.iter().enumerate() {
            let (Some(base), Some(dev)) = (
                reference.get(i).and_then(Option::as_ref),
                device.get(i).and_then(Option::as_ref),
            ) else {
                continue;
            };
            if !threshold_use.get(i).copied().unwrap_or(true) {
                debug!(name = %desc.name, "output excluded from comparison");
                continue;
            }
            let criteria = if common {
                shared.clone()
            } else {
                case.criteria(Some(i))
            };
            for criterion in &criteria {
                evaluator.compute_error(
                    base,
                    dev,
                    desc.total_count(),
                    criterion,
                    &desc.name,
                    desc.dtype,
                    skip_nan_inf,
                );
            }
        }
    }

    fn perf_info(&self, case: &dyn CaseSource, handle: &DeviceHandle) -> Result<PerfInfo> {
        let times = self.memory.as_ref().map(CaseMemory::times).unwrap_or_default();
        let total_bytes = self.memory.as_ref().map_or(0, CaseMemory::total_bytes);

        let compute_force = peak_compute_force(handle, &self.inputs, self.op.uses_matrix_unit())?;
        let theory_ops = case
            .theory_ops()
            .unwrap_or_else(|| self.op.theory_ops(&self.inputs, &self.outputs));
        let bandwidth = io_bandwidth(handle.arch);
        let theory_io = case.theory_io().unwrap_or(total_bytes as i64);

        Ok(PerfInfo {
            interface_time: self.interface_time,
            hardware_time: self.hardware_time,
            hardware_time_base: 0.0,
            h2d_time: times.h2d_us,
            d2h_time: times.d2h_us,
            compute_force,
            theory_ops,
            compute_efficiency: compute_efficiency(theory_ops, self.hardware_time, compute_force),
            io_bandwidth: bandwidth,
            theory_io,
            io_efficiency: io_efficiency(theory_io, self.hardware_time, bandwidth),
            workspace_size: self.workspace_size as f64,
        })
    }

    /// Free every buffer of the case. Valid from any state, any number of
    /// times.
    pub fn release(&mut self) {
        if self.state == ExecState::Released {
            return;
        }
        if matches!(self.state, ExecState::Launched | ExecState::Polling) {
            if let Some(ctx) = self.ctx.as_ref() {
                if let Err(err) = ctx.runtime().sync_queue() {
                    warn!(error = ?err, "queue sync before release failed");
                }
            }
        }
        debug!(state = %self.state, "release case resources");
        if let Some(mut memory) = self.memory.take() {
            memory.release();
        }
        self.reference_inputs.clear();
        self.strided_inputs.clear();
        self.inputs.clear();
        self.outputs.clear();
        self.case = None;
        self.evaluator = None;
        self.ctx = None;
        self.state = ExecState::Released;
    }

    /// Setup through teardown, then release regardless of the outcome.
    pub fn run(
        &mut self,
        case_path: impl Into<String>,
        case: Box<dyn CaseSource>,
        baseline: Option<&dyn BaselineStore>,
    ) -> Result<EvaluateResult> {
        let outcome = self.run_steps(case_path.into(), case, baseline);
        self.release();
        outcome
    }

    fn run_steps(
        &mut self,
        case_path: String,
        case: Box<dyn CaseSource>,
        baseline: Option<&dyn BaselineStore>,
    ) -> Result<EvaluateResult> {
        self.setup(case_path, case)?;
        self.launch()?;
        while !self.ready()? {
            std::thread::yield_now();
        }
        self.sync()?;
        self.teardown(baseline)
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.release();
    }
}

/// Cast one reference input into its device dtype and return the
/// quantization parameters to store on the descriptor. With a distinct
/// on-chip dtype under software quantization, the reference is realigned to
/// the off-chip value and then to the on-chip value, and the on-chip cast
/// decides the parameters.
fn cast_reference_in(
    desc: &TensorDescriptor,
    reference: &mut HostBuffer,
    host: &mut HostBuffer,
    mode: QuantMode,
) -> Result<QuantParams> {
    let count = desc.total_count();
    let ref_dtype = reference.dtype();

    match desc.distinct_onchip_dtype() {
        Some(oc) if mode == QuantMode::Software => {
            if desc.dtype == DType::Double || desc.dtype.is_complex() {
                return Err(ContractError::QuantizationUnsupported(desc.dtype).into());
            }
            let opts = CastOptions {
                mode,
                params: None,
                dequantify: true,
            };
            cast_in(
                reference.as_bytes_mut(),
                ref_dtype,
                host.as_bytes_mut(),
                desc.dtype,
                count,
                &opts,
            )?;
            let mut scratch = HostBuffer::zeroed(oc, count);
            let params = cast_in(
                reference.as_bytes_mut(),
                ref_dtype,
                scratch.as_bytes_mut(),
                oc,
                count,
                &opts,
            )?;
            Ok(if oc.is_fixed_point() { params } else { desc.quant })
        }
        _ => {
            let params = cast_in(
                reference.as_bytes_mut(),
                ref_dtype,
                host.as_bytes_mut(),
                desc.dtype,
                count,
                &CastOptions {
                    mode,
                    params: None,
                    dequantify: true,
                },
            )?;
            Ok(if desc.dtype.is_fixed_point() { params } else { desc.quant })
        }
    }
}

/// Device-typed values copied straight into the host buffers.
fn init_recorded_inputs(
    case: &dyn CaseSource,
    inputs: &[TensorDescriptor],
    memory: &mut CaseMemory,
) -> Result<()> {
    for (i, desc) in inputs.iter().enumerate() {
        if desc.is_empty() {
            continue;
        }
        let values = case.input_values(i, desc.dtype, desc.total_count())?;
        let Some(host) = memory.block_mut(i).and_then(|b| b.host.as_mut()) else {
            continue;
        };
        let n = host.byte_len();
        if values.byte_len() < n {
            return Err(ContractError::BufferTooSmall {
                what: "recorded input",
                required: n,
                actual: values.byte_len(),
            }
            .into());
        }
        host.as_bytes_mut().copy_from_slice(&values.as_bytes()[..n]);
    }
    Ok(())
}
