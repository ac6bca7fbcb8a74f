//! Element-wise operators runnable on the host backend.
//!
//! Device kernels read raw device-typed bytes (possibly strided) and write
//! device-typed results; the CPU references work on dense reference-typed
//! buffers.

use anyhow::{ensure, Context, Result};
use optest_core::{
    CaseSource, ContractError, DevicePtr, HostBuffer, Kernel, KernelMemory, LaunchArgs, OpKernel,
    TensorDescriptor,
};
use optest_runtime::{dense_to_strided, strided_to_dense};

use crate::codec;

/// Dense scalars of a device tensor.
fn load(mem: &dyn KernelMemory, ptr: DevicePtr, desc: &TensorDescriptor) -> Result<Vec<f64>> {
    let raw = mem.read(ptr)?;
    let elem = desc.dtype.size_of();
    let dense_len = desc.shape_count() * elem;
    if !desc.is_strided() {
        ensure!(raw.len() >= dense_len, "`{}` is shorter than its shape", desc.name);
        return Ok(codec::decode(&raw[..dense_len], desc.dtype));
    }
    let mut dense = vec![0u8; dense_len];
    strided_to_dense(&mut dense, &raw, desc.shape.dims(), desc.stride.dims(), elem)?;
    Ok(codec::decode(&dense, desc.dtype))
}

fn store(mem: &mut dyn KernelMemory, ptr: DevicePtr, desc: &TensorDescriptor, values: &[f64]) -> Result<()> {
    let dense = codec::encode(values, desc.dtype)?;
    if !desc.is_strided() {
        return mem.write(ptr, 0, dense.as_bytes());
    }
    let mut out = mem.read(ptr)?;
    dense_to_strided(
        &mut out,
        dense.as_bytes(),
        desc.shape.dims(),
        desc.stride.dims(),
        desc.dtype.size_of(),
    )?;
    mem.write(ptr, 0, &out)
}

fn reject_fixed_point(op: &str, case: &dyn CaseSource) -> Result<()> {
    for desc in case.inputs().iter().chain(case.outputs()) {
        if desc.dtype.is_fixed_point() {
            return Err(ContractError::CaseRejected {
                op: op.to_string(),
                reason: format!("`{}` has fixed-point dtype {}", desc.name, desc.dtype),
            }
            .into());
        }
    }
    Ok(())
}

/// Descriptor and device pointer of a present tensor.
fn bound(
    descs: &[TensorDescriptor],
    ptrs: &[Option<DevicePtr>],
    index: usize,
) -> Option<(TensorDescriptor, DevicePtr)> {
    let desc = descs.get(index)?;
    let ptr = ptrs.get(index).copied().flatten()?;
    Some((desc.clone(), ptr))
}

fn elementwise_ops(outputs: &[TensorDescriptor]) -> i64 {
    outputs.iter().map(|o| o.shape_count() as i64).sum()
}

/// `y = |x|`.
pub struct AbsOp;

impl OpKernel for AbsOp {
    fn name(&self) -> &str {
        "abs"
    }

    fn param_check(&self, case: &dyn CaseSource) -> Result<()> {
        ensure!(
            case.inputs().len() == 1 && case.outputs().len() == 1,
            "abs takes one input and one output"
        );
        reject_fixed_point("abs", case)?;
        let (x, y) = (&case.inputs()[0], &case.outputs()[0]);
        if x.dtype.is_complex() || y.dtype.is_complex() {
            return Err(ContractError::CaseRejected {
                op: "abs".into(),
                reason: "complex tensors are not supported".into(),
            }
            .into());
        }
        ensure!(x.shape == y.shape, "abs output shape differs from input");
        Ok(())
    }

    fn compute(&mut self, args: &LaunchArgs<'_>) -> Result<()> {
        let (Some((x, xp)), Some((y, yp))) = (
            bound(args.inputs, &args.input_ptrs, 0),
            bound(args.outputs, &args.output_ptrs, 0),
        ) else {
            return Ok(());
        };
        args.runtime.enqueue(Kernel::new("abs", move |mem| {
            let values: Vec<f64> = load(mem, xp, &x)?.into_iter().map(f64::abs).collect();
            store(mem, yp, &y, &values)
        }))
    }

    fn cpu_compute(
        &mut self,
        inputs: &[Option<&HostBuffer>],
        outputs: &mut [Option<HostBuffer>],
    ) -> Result<()> {
        let (Some(Some(x)), Some(Some(y))) = (inputs.first(), outputs.first_mut()) else {
            return Ok(());
        };
        let values: Vec<f64> = x.to_f64_vec().into_iter().map(f64::abs).collect();
        *y = codec::encode(&values[..y.count()], y.dtype()).context("abs reference")?;
        Ok(())
    }

    fn theory_ops(&self, _inputs: &[TensorDescriptor], outputs: &[TensorDescriptor]) -> i64 {
        elementwise_ops(outputs)
    }
}

/// `y = a + b` over equal shapes. An absent `b` is treated as zero.
pub struct AddOp;

impl OpKernel for AddOp {
    fn name(&self) -> &str {
        "add"
    }

    fn param_check(&self, case: &dyn CaseSource) -> Result<()> {
        ensure!(
            case.inputs().len() == 2 && case.outputs().len() == 1,
            "add takes two inputs and one output"
        );
        reject_fixed_point("add", case)?;
        let y = &case.outputs()[0];
        for x in case.inputs().iter().filter(|x| !x.null) {
            ensure!(
                x.shape == y.shape,
                "add input `{}` shape {:?} differs from output {:?}",
                x.name,
                x.shape.dims(),
                y.shape.dims()
            );
            ensure!(
                x.dtype.is_complex() == y.dtype.is_complex(),
                "add cannot mix complex and real tensors"
            );
        }
        Ok(())
    }

    fn compute(&mut self, args: &LaunchArgs<'_>) -> Result<()> {
        let Some((y, yp)) = bound(args.outputs, &args.output_ptrs, 0) else {
            return Ok(());
        };
        let addends: Vec<_> = (0..args.inputs.len())
            .filter_map(|i| bound(args.inputs, &args.input_ptrs, i))
            .collect();
        args.runtime.enqueue(Kernel::new("add", move |mem| {
            let mut acc = vec![0f64; y.shape_count() * codec::lanes(y.dtype)];
            for (desc, ptr) in &addends {
                for (a, v) in acc.iter_mut().zip(load(mem, *ptr, desc)?) {
                    *a += v;
                }
            }
            store(mem, yp, &y, &acc)
        }))
    }

    fn cpu_compute(
        &mut self,
        inputs: &[Option<&HostBuffer>],
        outputs: &mut [Option<HostBuffer>],
    ) -> Result<()> {
        let Some(Some(y)) = outputs.first_mut() else {
            return Ok(());
        };
        let mut acc = vec![0f64; y.count() * codec::lanes(y.dtype())];
        for x in inputs.iter().flatten() {
            for (a, v) in acc.iter_mut().zip(x.to_f64_vec()) {
                *a += v;
            }
        }
        *y = codec::encode(&acc, y.dtype()).context("add reference")?;
        Ok(())
    }

    fn theory_ops(&self, _inputs: &[TensorDescriptor], outputs: &[TensorDescriptor]) -> i64 {
        elementwise_ops(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use optest_core::DType;

    #[test]
    fn references_work_on_reference_buffers() {
        let x = HostBuffer::from_f32(&[-1.5, 2.0, -0.0]);
        let mut out = vec![Some(HostBuffer::zeroed(DType::Float, 3))];
        AbsOp.cpu_compute(&[Some(&x)], &mut out).unwrap();
        assert_eq!(out[0].as_ref().unwrap().to_f32_vec(), vec![1.5, 2.0, 0.0]);

        let b = HostBuffer::from_f32(&[1.0, 1.0, 1.0]);
        AddOp.cpu_compute(&[Some(&x), Some(&b)], &mut out).unwrap();
        assert_eq!(out[0].as_ref().unwrap().to_f32_vec(), vec![-0.5, 3.0, 1.0]);

        AddOp.cpu_compute(&[Some(&x), None], &mut out).unwrap();
        assert_eq!(out[0].as_ref().unwrap().to_f32_vec(), vec![-1.5, 2.0, 0.0]);
    }
}
