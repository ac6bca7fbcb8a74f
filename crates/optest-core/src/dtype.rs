use serde::{Deserialize, Serialize};

/// Element type of a tensor, as seen by the device library.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    Half,
    Float,
    Double,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Bool,
    ComplexHalf,
    ComplexFloat,
}

impl DType {
    pub const ALL: [DType; 14] = [
        DType::Half,
        DType::Float,
        DType::Double,
        DType::Int8,
        DType::Int16,
        DType::Int32,
        DType::Int64,
        DType::Uint8,
        DType::Uint16,
        DType::Uint32,
        DType::Uint64,
        DType::Bool,
        DType::ComplexHalf,
        DType::ComplexFloat,
    ];

    /// Bytes per element. A complex element is a (real, imag) pair.
    pub fn size_of(self) -> usize {
        match self {
            DType::Int8 | DType::Uint8 | DType::Bool => 1,
            DType::Half | DType::Int16 | DType::Uint16 => 2,
            DType::Float | DType::Int32 | DType::Uint32 | DType::ComplexHalf => 4,
            DType::Double | DType::Int64 | DType::Uint64 | DType::ComplexFloat => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DType::Half => "half",
            DType::Float => "float",
            DType::Double => "double",
            DType::Int8 => "int8",
            DType::Int16 => "int16",
            DType::Int32 => "int32",
            DType::Int64 => "int64",
            DType::Uint8 => "uint8",
            DType::Uint16 => "uint16",
            DType::Uint32 => "uint32",
            DType::Uint64 => "uint64",
            DType::Bool => "bool",
            DType::ComplexHalf => "complex_half",
            DType::ComplexFloat => "complex_float",
        }
    }

    pub fn is_complex(self) -> bool {
        matches!(self, DType::ComplexHalf | DType::ComplexFloat)
    }

    /// Narrow signed fixed-point types that carry (position, scale, offset).
    pub fn is_fixed_point(self) -> bool {
        matches!(self, DType::Int8 | DType::Int16)
    }

    /// Storage type of host-side reference data for a tensor of this dtype.
    ///
    /// Double stays double, both complex variants are held as complex float,
    /// everything else is held as float. Every place that mixes device values
    /// with reference data goes through this rule.
    pub fn reference_dtype(self) -> DType {
        match self {
            DType::Double => DType::Double,
            DType::ComplexHalf | DType::ComplexFloat => DType::ComplexFloat,
            _ => DType::Float,
        }
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
