//! Host and device buffers of one case.
//!
//! Every device allocation is an owning [`DeviceBuffer`] that frees itself on
//! drop, and all of a case's buffers live in one [`CaseMemory`] arena, so an
//! early return at any step still releases everything exactly once.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use optest_core::{
    ContractError, DType, DevicePtr, DeviceRuntime, HostBuffer, Strides, TensorDescriptor,
    TensorRole,
};
use tracing::{debug, warn};

/// A device allocation released on drop. Releasing twice is a no-op.
pub struct DeviceBuffer {
    runtime: Arc<dyn DeviceRuntime>,
    ptr: Option<DevicePtr>,
    bytes: usize,
}

impl DeviceBuffer {
    pub fn alloc(runtime: &Arc<dyn DeviceRuntime>, bytes: usize) -> Result<Self> {
        let ptr = runtime.malloc(bytes).context("device malloc")?;
        Ok(Self {
            runtime: Arc::clone(runtime),
            ptr: Some(ptr),
            bytes,
        })
    }

    pub fn ptr(&self) -> Option<DevicePtr> {
        self.ptr
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn release(&mut self) {
        if let Some(ptr) = self.ptr.take() {
            if let Err(err) = self.runtime.free(ptr) {
                warn!(error = ?err, ?ptr, "device free failed");
            }
        }
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("ptr", &self.ptr)
            .field("bytes", &self.bytes)
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActiveBuffer {
    /// The buffer of the single correctness run.
    Origin,
    /// The copy used by repeated performance runs.
    Perf,
}

/// Buffers of one tensor slot. Absent tensors keep a block with size zero
/// and no buffers, so indices line up with the case's tensor list.
#[derive(Debug)]
pub struct DataBlock {
    pub name: String,
    pub is_output: bool,
    pub dtype: DType,
    /// Strided element capacity.
    pub count: usize,
    pub size: usize,
    pub stride: Strides,
    pub host: Option<HostBuffer>,
    pub origin: Option<DeviceBuffer>,
    pub perf: Option<DeviceBuffer>,
    pub active: ActiveBuffer,
}

impl DataBlock {
    fn new(desc: &TensorDescriptor) -> Self {
        let count = if desc.is_empty() { 0 } else { desc.total_count() };
        Self {
            name: desc.name.clone(),
            is_output: desc.role == TensorRole::Output,
            dtype: desc.dtype,
            count,
            size: count * desc.dtype.size_of(),
            stride: desc.stride.clone(),
            host: None,
            origin: None,
            perf: None,
            active: ActiveBuffer::Origin,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Device pointer the operator currently sees.
    pub fn device_ptr(&self) -> Option<DevicePtr> {
        match self.active {
            ActiveBuffer::Origin => self.origin.as_ref().and_then(DeviceBuffer::ptr),
            ActiveBuffer::Perf => self.perf.as_ref().and_then(DeviceBuffer::ptr),
        }
    }

    fn release(&mut self) {
        if let Some(mut b) = self.origin.take() {
            b.release();
        }
        if let Some(mut b) = self.perf.take() {
            b.release();
        }
        self.host = None;
    }
}

/// Transfer timings in microseconds.
#[derive(Clone, Copy, Debug, Default)]
pub struct TransferTimes {
    pub h2d_us: f64,
    pub d2h_us: f64,
}

/// Owns every buffer of one case.
pub struct CaseMemory {
    runtime: Arc<dyn DeviceRuntime>,
    blocks: Vec<DataBlock>,
    /// Block index of each output, in output order.
    output_slots: Vec<usize>,
    n_inputs: usize,
    input_reuse: bool,
    workspace: Option<DeviceBuffer>,
    times: TransferTimes,
}

impl CaseMemory {
    pub fn new(runtime: Arc<dyn DeviceRuntime>) -> Self {
        Self {
            runtime,
            blocks: Vec::new(),
            output_slots: Vec::new(),
            n_inputs: 0,
            input_reuse: false,
            workspace: None,
            times: TransferTimes::default(),
        }
    }

    /// One zero-filled host buffer per non-empty tensor, sized to its strided
    /// capacity. With `reused_inputs` non-empty, output `i` aliases input
    /// `reused_inputs[i]` and no output blocks are created.
    pub fn host_malloc(
        &mut self,
        inputs: &[TensorDescriptor],
        outputs: &[TensorDescriptor],
        reused_inputs: &[usize],
    ) -> Result<()> {
        self.n_inputs = inputs.len();
        self.input_reuse = !reused_inputs.is_empty();
        for desc in inputs {
            self.push_block(desc);
        }
        if self.input_reuse {
            debug!("skip output host malloc, outputs reuse inputs");
            for &idx in reused_inputs {
                let block = self.blocks.get_mut(idx).ok_or(ContractError::CountMismatch {
                    what: "reusable inputs",
                    expected: idx + 1,
                    actual: inputs.len(),
                })?;
                block.is_output = true;
                self.output_slots.push(idx);
            }
            return Ok(());
        }
        for desc in outputs {
            self.output_slots.push(self.blocks.len());
            self.push_block(desc);
        }
        Ok(())
    }

    fn push_block(&mut self, desc: &TensorDescriptor) {
        let mut block = DataBlock::new(desc);
        if !block.is_empty() {
            block.host = Some(HostBuffer::zeroed(block.dtype, block.count));
        }
        self.blocks.push(block);
    }

    /// Mirror the host buffers on the device; `with_perf` adds an independent
    /// copy per tensor for repeated timing runs.
    pub fn device_malloc(&mut self, n_outputs: usize, with_perf: bool) -> Result<()> {
        let expected = if self.input_reuse {
            self.n_inputs
        } else {
            self.n_inputs + n_outputs
        };
        if self.blocks.len() != expected {
            return Err(ContractError::CountMismatch {
                what: "data blocks",
                expected,
                actual: self.blocks.len(),
            }
            .into());
        }
        for block in self.blocks.iter_mut().filter(|b| !b.is_empty()) {
            block.origin = Some(
                DeviceBuffer::alloc(&self.runtime, block.size)
                    .with_context(|| format!("allocating `{}`", block.name))?,
            );
            if with_perf {
                block.perf = Some(
                    DeviceBuffer::alloc(&self.runtime, block.size)
                        .with_context(|| format!("allocating perf copy of `{}`", block.name))?,
                );
            }
        }
        Ok(())
    }

    /// Host -> device for inputs. Strided outputs are zeroed on the device so
    /// positions the kernel never writes compare as zero. `fill_perf` also
    /// prepares the perf copies.
    pub fn copy_in(&mut self, copy_host_data: bool, fill_perf: bool) -> Result<()> {
        for block in self.blocks.iter().take(self.n_inputs) {
            if block.is_empty() {
                debug!(name = %block.name, "skip host -> device copy");
                continue;
            }
            let Some(host) = block.host.as_ref() else {
                continue;
            };
            if copy_host_data {
                if let Some(ptr) = block.origin.as_ref().and_then(DeviceBuffer::ptr) {
                    let t0 = Instant::now();
                    self.runtime.memcpy_h2d(ptr, host.as_bytes())?;
                    self.times.h2d_us += t0.elapsed().as_secs_f64() * 1e6;
                }
            }
            if fill_perf {
                if let Some(ptr) = block.perf.as_ref().and_then(DeviceBuffer::ptr) {
                    self.runtime.memcpy_h2d(ptr, host.as_bytes())?;
                }
            }
        }
        for &slot in &self.output_slots {
            let block = &self.blocks[slot];
            // reused outputs already hold their input data
            if self.input_reuse || block.stride.is_empty() || block.is_empty() {
                continue;
            }
            if let Some(ptr) = block.origin.as_ref().and_then(DeviceBuffer::ptr) {
                let t0 = Instant::now();
                self.runtime.memset(ptr, 0, block.size)?;
                self.times.h2d_us += t0.elapsed().as_secs_f64() * 1e6;
            }
            if fill_perf {
                if let Some(ptr) = block.perf.as_ref().and_then(DeviceBuffer::ptr) {
                    self.runtime.memset(ptr, 0, block.size)?;
                }
            }
        }
        Ok(())
    }

    /// Device -> host for outputs, from whichever buffer is active.
    pub fn copy_out(&mut self) -> Result<()> {
        for &slot in &self.output_slots {
            let block = &mut self.blocks[slot];
            if block.is_empty() {
                debug!(name = %block.name, "skip device -> host copy");
                continue;
            }
            let Some(ptr) = block.device_ptr() else {
                continue;
            };
            let Some(host) = block.host.as_mut() else {
                continue;
            };
            let t0 = Instant::now();
            self.runtime.memcpy_d2h(host.as_bytes_mut(), ptr)?;
            self.times.d2h_us += t0.elapsed().as_secs_f64() * 1e6;
        }
        Ok(())
    }

    pub fn switch_to(&mut self, active: ActiveBuffer) {
        for block in self.blocks.iter_mut().filter(|b| !b.is_empty()) {
            block.active = active;
        }
    }

    pub fn workspace_malloc(&mut self, bytes: usize) -> Result<()> {
        if bytes == 0 {
            return Ok(());
        }
        self.workspace = Some(DeviceBuffer::alloc(&self.runtime, bytes).context("workspace malloc")?);
        Ok(())
    }

    pub fn workspace_ptr(&self) -> Option<DevicePtr> {
        self.workspace.as_ref().and_then(DeviceBuffer::ptr)
    }

    pub fn workspace_free(&mut self) {
        if let Some(mut ws) = self.workspace.take() {
            ws.release();
        }
    }

    pub fn blocks(&self) -> &[DataBlock] {
        &self.blocks
    }

    pub fn block_mut(&mut self, index: usize) -> Option<&mut DataBlock> {
        self.blocks.get_mut(index)
    }

    pub fn input_blocks(&self) -> impl Iterator<Item = &DataBlock> {
        self.blocks.iter().take(self.n_inputs)
    }

    pub fn output_blocks(&self) -> impl Iterator<Item = &DataBlock> {
        self.output_slots.iter().map(|&i| &self.blocks[i])
    }

    pub fn output_block(&self, index: usize) -> Option<&DataBlock> {
        self.output_slots.get(index).map(|&i| &self.blocks[i])
    }

    pub fn output_count(&self) -> usize {
        self.output_slots.len()
    }

    pub fn input_reuse(&self) -> bool {
        self.input_reuse
    }

    pub fn times(&self) -> TransferTimes {
        self.times
    }

    /// Sum of all block sizes in bytes.
    pub fn total_bytes(&self) -> usize {
        self.blocks.iter().map(|b| b.size).sum()
    }

    /// Free every host and device buffer. Safe to call any number of times
    /// and at any point of setup.
    pub fn release(&mut self) {
        self.workspace_free();
        for block in &mut self.blocks {
            block.release();
        }
    }
}

impl Drop for CaseMemory {
    fn drop(&mut self) {
        self.release();
    }
}
