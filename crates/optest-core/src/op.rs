use anyhow::Result;

use crate::{CaseSource, DevicePtr, DeviceRuntime, HostBuffer, TensorDescriptor};

/// Device buffers bound for one invocation of the operator.
pub struct LaunchArgs<'a> {
    pub runtime: &'a dyn DeviceRuntime,
    pub inputs: &'a [TensorDescriptor],
    pub outputs: &'a [TensorDescriptor],
    /// `None` for absent tensors.
    pub input_ptrs: Vec<Option<DevicePtr>>,
    pub output_ptrs: Vec<Option<DevicePtr>>,
    pub workspace: Option<DevicePtr>,
}

/// The operator under test.
pub trait OpKernel {
    fn name(&self) -> &str;

    /// Reject cases the operator cannot run.
    fn param_check(&self, _case: &dyn CaseSource) -> Result<()> {
        Ok(())
    }

    /// Output `i` aliases input `reused_inputs()[i]`. Empty means outputs get
    /// their own buffers.
    fn reused_inputs(&self) -> &[usize] {
        &[]
    }

    fn workspace_size(&self, _inputs: &[TensorDescriptor], _outputs: &[TensorDescriptor]) -> usize {
        0
    }

    /// Enqueue one invocation. Must not wait for completion.
    fn compute(&mut self, args: &LaunchArgs<'_>) -> Result<()>;

    /// Reference implementation over dense, reference-typed host buffers.
    /// Absent tensors are `None`.
    fn cpu_compute(
        &mut self,
        inputs: &[Option<&HostBuffer>],
        outputs: &mut [Option<HostBuffer>],
    ) -> Result<()>;

    fn theory_ops(&self, _inputs: &[TensorDescriptor], _outputs: &[TensorDescriptor]) -> i64 {
        0
    }

    /// Runs on the matrix unit (selects the matrix peak-compute table).
    fn uses_matrix_unit(&self) -> bool {
        false
    }
}
