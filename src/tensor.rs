use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Named tensor values, keyed by tensor name.
pub type TensorMap = BTreeMap<String, Tensor>;

/// Element type of a tensor, using the model-server naming convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DataType {
    Bool,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Int8,
    Int16,
    Int32,
    Int64,
    Fp16,
    Bf16,
    Fp32,
    Fp64,
    /// Variable-length byte strings.
    Bytes,
}

impl DataType {
    /// Size of one element in bytes, or `None` for variable-length types.
    pub const fn element_size(self) -> Option<usize> {
        match self {
            DataType::Bool | DataType::Uint8 | DataType::Int8 => Some(1),
            DataType::Uint16 | DataType::Int16 | DataType::Fp16 | DataType::Bf16 => Some(2),
            DataType::Uint32 | DataType::Int32 | DataType::Fp32 => Some(4),
            DataType::Uint64 | DataType::Int64 | DataType::Fp64 => Some(8),
            DataType::Bytes => None,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DataType::Bool => "BOOL",
            DataType::Uint8 => "UINT8",
            DataType::Uint16 => "UINT16",
            DataType::Uint32 => "UINT32",
            DataType::Uint64 => "UINT64",
            DataType::Int8 => "INT8",
            DataType::Int16 => "INT16",
            DataType::Int32 => "INT32",
            DataType::Int64 => "INT64",
            DataType::Fp16 => "FP16",
            DataType::Bf16 => "BF16",
            DataType::Fp32 => "FP32",
            DataType::Fp64 => "FP64",
            DataType::Bytes => "BYTES",
        };
        f.write_str(s)
    }
}

/// One dimension of a declared tensor shape.
///
/// Serialized as an integer; `-1` marks a dynamic dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum Dim {
    Fixed(usize),
    Dynamic,
}

impl From<i64> for Dim {
    fn from(v: i64) -> Self {
        if v < 0 {
            Dim::Dynamic
        } else {
            Dim::Fixed(v as usize)
        }
    }
}

impl From<Dim> for i64 {
    fn from(d: Dim) -> Self {
        match d {
            Dim::Fixed(n) => n as i64,
            Dim::Dynamic => -1,
        }
    }
}

impl Dim {
    pub fn accepts(self, actual: usize) -> bool {
        match self {
            Dim::Fixed(n) => n == actual,
            Dim::Dynamic => true,
        }
    }
}

/// Declared signature of a single module input or output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorSpec {
    pub name: String,
    pub datatype: DataType,
    pub shape: Vec<Dim>,
}

impl TensorSpec {
    pub fn new(name: impl Into<String>, datatype: DataType, shape: &[i64]) -> Self {
        Self {
            name: name.into(),
            datatype,
            shape: shape.iter().map(|&d| Dim::from(d)).collect(),
        }
    }

    /// Check a concrete tensor against this spec.
    ///
    /// Returns a human-readable reason on mismatch.
    pub fn check(&self, tensor: &Tensor) -> std::result::Result<(), String> {
        if tensor.datatype != self.datatype {
            return Err(format!(
                "tensor '{}' has datatype {}, expected {}",
                self.name, tensor.datatype, self.datatype
            ));
        }
        if tensor.shape.len() != self.shape.len() {
            return Err(format!(
                "tensor '{}' has rank {}, expected {}",
                self.name,
                tensor.shape.len(),
                self.shape.len()
            ));
        }
        for (i, (dim, &actual)) in self.shape.iter().zip(&tensor.shape).enumerate() {
            if !dim.accepts(actual) {
                return Err(format!(
                    "tensor '{}' dimension {i} is {actual}, expected {}",
                    self.name,
                    i64::from(*dim)
                ));
            }
        }
        if let Some(size) = tensor.datatype.element_size() {
            let expected = tensor.expected_byte_len(size).ok_or_else(|| {
                format!("tensor '{}' shape {:?} overflows", self.name, tensor.shape)
            })?;
            if tensor.data.len() != expected {
                return Err(format!(
                    "tensor '{}' carries {} bytes, shape {:?} of {} needs {expected}",
                    self.name,
                    tensor.data.len(),
                    tensor.shape,
                    tensor.datatype
                ));
            }
        }
        Ok(())
    }
}

/// A concrete tensor value flowing between stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tensor {
    pub datatype: DataType,
    pub shape: Vec<usize>,
    #[serde(with = "hex_bytes")]
    pub data: Bytes,
}

impl Tensor {
    pub fn new(datatype: DataType, shape: Vec<usize>, data: impl Into<Bytes>) -> Self {
        Self {
            datatype,
            shape,
            data: data.into(),
        }
    }

    /// Build an FP32 tensor from host values (little-endian).
    pub fn from_f32(shape: Vec<usize>, values: &[f32]) -> Self {
        let data: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(DataType::Fp32, shape, data)
    }

    /// Number of elements implied by the shape, or `None` if it overflows `usize`.
    pub fn numel(&self) -> Option<usize> {
        self.shape.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
    }

    /// Payload length for elements of `element_size` bytes, or `None` on overflow.
    fn expected_byte_len(&self, element_size: usize) -> Option<usize> {
        self.numel()?.checked_mul(element_size)
    }
}

/// Serde adapter encoding tensor payloads as hex strings.
mod hex_bytes {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
