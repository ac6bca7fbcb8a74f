use anyhow::Result;
use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{ContractError, DType};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shape(pub SmallVec<[usize; 6]>);

impl Shape {
    pub fn from_slice(d: &[usize]) -> Self {
        Self(d.iter().copied().collect())
    }
    pub fn rank(&self) -> usize {
        self.0.len()
    }
    /// Logical element count. A zero extent anywhere yields zero.
    pub fn numel(&self) -> usize {
        self.0.iter().product::<usize>()
    }
    pub fn dims(&self) -> &[usize] {
        &self.0
    }
}

/// Per-dimension element step. Empty means dense.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Strides(pub SmallVec<[usize; 6]>);

impl Strides {
    pub fn from_slice(d: &[usize]) -> Self {
        Self(d.iter().copied().collect())
    }
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
    pub fn dims(&self) -> &[usize] {
        &self.0
    }
}

/// Affine fixed-point parameters: `x = (q - offset) * scale * 2^position`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuantParams {
    pub position: i32,
    pub scale: f32,
    pub offset: i32,
}

impl Default for QuantParams {
    fn default() -> Self {
        Self {
            position: 0,
            scale: 1.0,
            offset: 0,
        }
    }
}

impl QuantParams {
    /// Width of one quantization step in floating units.
    pub fn step(&self) -> f64 {
        f64::from(self.scale) * 2f64.powi(self.position)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TensorRole {
    Input,
    Output,
}

/// One tensor under test.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TensorDescriptor {
    pub name: String,
    pub role: TensorRole,
    pub shape: Shape,
    #[serde(default)]
    pub stride: Strides,
    pub dtype: DType,
    #[serde(default)]
    pub onchip_dtype: Option<DType>,
    #[serde(default)]
    pub quant: QuantParams,
    /// Tensor is absent from the case.
    #[serde(default)]
    pub null: bool,
}

impl TensorDescriptor {
    pub fn new(name: impl Into<String>, role: TensorRole, dtype: DType, shape: &[usize]) -> Self {
        Self {
            name: name.into(),
            role,
            shape: Shape::from_slice(shape),
            stride: Strides::default(),
            dtype,
            onchip_dtype: None,
            quant: QuantParams::default(),
            null: false,
        }
    }

    pub fn with_stride(mut self, stride: &[usize]) -> Self {
        self.stride = Strides::from_slice(stride);
        self
    }

    pub fn with_onchip_dtype(mut self, dtype: DType) -> Self {
        self.onchip_dtype = Some(dtype);
        self
    }

    /// A placeholder for a tensor slot the case leaves out.
    pub fn absent(name: impl Into<String>, role: TensorRole) -> Self {
        Self {
            null: true,
            ..Self::new(name, role, DType::Float, &[0])
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.stride.is_empty() && self.stride.0.len() != self.shape.rank() {
            return Err(ContractError::RankMismatch {
                shape: self.shape.rank(),
                stride: self.stride.0.len(),
            }
            .into());
        }
        Ok(())
    }

    pub fn is_strided(&self) -> bool {
        !self.stride.is_empty()
    }

    pub fn shape_count(&self) -> usize {
        if self.null {
            return 0;
        }
        self.shape.numel()
    }

    /// Element capacity of the strided layout (the logical count when dense).
    pub fn total_count(&self) -> usize {
        if !self.is_strided() {
            return self.shape_count();
        }
        if self.shape_count() == 0 {
            return 0;
        }
        1 + self
            .shape
            .0
            .iter()
            .zip(self.stride.0.iter())
            .map(|(&n, &s)| (n - 1) * s)
            .sum::<usize>()
    }

    /// Null or zero-sized: skipped by every per-tensor step.
    pub fn is_empty(&self) -> bool {
        self.null || self.total_count() == 0
    }

    pub fn byte_size(&self) -> usize {
        self.total_count() * self.dtype.size_of()
    }

    pub fn reference_dtype(&self) -> DType {
        self.dtype.reference_dtype()
    }

    /// On-chip dtype when it is set and differs from the off-chip dtype.
    pub fn distinct_onchip_dtype(&self) -> Option<DType> {
        self.onchip_dtype.filter(|&oc| oc != self.dtype)
    }
}

/// Zero-initialized host memory tagged with its element type.
#[derive(Clone, Debug)]
pub struct HostBuffer {
    dtype: DType,
    count: usize,
    bytes: BytesMut,
}

impl HostBuffer {
    pub fn zeroed(dtype: DType, count: usize) -> Self {
        Self {
            dtype,
            count,
            bytes: BytesMut::zeroed(count * dtype.size_of()),
        }
    }

    pub fn from_bytes(dtype: DType, bytes: &[u8]) -> Self {
        Self {
            dtype,
            count: bytes.len() / dtype.size_of(),
            bytes: BytesMut::from(bytes),
        }
    }

    pub fn from_f32(values: &[f32]) -> Self {
        let mut buf = Self::zeroed(DType::Float, values.len());
        for (chunk, v) in buf.bytes.chunks_exact_mut(4).zip(values) {
            chunk.copy_from_slice(&v.to_ne_bytes());
        }
        buf
    }

    pub fn from_f64(values: &[f64]) -> Self {
        let mut buf = Self::zeroed(DType::Double, values.len());
        for (chunk, v) in buf.bytes.chunks_exact_mut(8).zip(values) {
            chunk.copy_from_slice(&v.to_ne_bytes());
        }
        buf
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub fn fill_zero(&mut self) {
        self.bytes.fill(0);
    }

    /// Float-typed view. Complex float buffers yield interleaved (re, im) pairs.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        match self.dtype {
            DType::Float | DType::ComplexFloat => self
                .bytes
                .chunks_exact(4)
                .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
                .collect(),
            DType::Double => self.to_f64_vec().into_iter().map(|v| v as f32).collect(),
            _ => Vec::new(),
        }
    }

    /// Widened view of a reference-typed buffer (float, double or complex float).
    pub fn to_f64_vec(&self) -> Vec<f64> {
        match self.dtype {
            DType::Double => self
                .bytes
                .chunks_exact(8)
                .map(|b| f64::from_ne_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
                .collect(),
            DType::Float | DType::ComplexFloat => {
                self.to_f32_vec().into_iter().map(f64::from).collect()
            }
            _ => Vec::new(),
        }
    }
}
