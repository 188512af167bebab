//! GGUF v3 container: metadata values, reader, and streaming writer.
//!
//! Layout (all little-endian):
//!
//! ```text
//! magic u32 | version u32 | tensor_count u64 | kv_count u64
//! kv_count x (key string, value_type u32, value)
//! tensor_count x (name string, n_dims u32, dims u64 x n_dims, type u32, offset u64)
//! padding to alignment
//! tensor data, each tensor padded to alignment
//! ```
//!
//! Strings are a u64 byte length followed by UTF-8 bytes. Tensor offsets are
//! relative to the start of the data section.

pub mod reader;
pub mod writer;

use crate::element_type::ElementType;

pub use reader::{read_gguf, GgufFile, GgufTensorInfo};
pub use writer::{write_gguf, WriteOptions, WriteSummary};

/// Metadata key holding the data alignment.
pub const KEY_ALIGNMENT: &str = "general.alignment";
pub const KEY_ARCHITECTURE: &str = "general.architecture";
pub const KEY_NAME: &str = "general.name";
pub const KEY_FILE_TYPE: &str = "general.file_type";
pub const KEY_QUANTIZATION_VERSION: &str = "general.quantization_version";
pub const KEY_MODEL_VERSION: &str = "sdconv.model_version";

/// GGUF metadata value types.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GgufValueType {
    Uint8 = 0,
    Int8 = 1,
    Uint16 = 2,
    Int16 = 3,
    Uint32 = 4,
    Int32 = 5,
    Float32 = 6,
    Bool = 7,
    String = 8,
    Array = 9,
    Uint64 = 10,
    Int64 = 11,
    Float64 = 12,
}

impl GgufValueType {
    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            0 => Self::Uint8,
            1 => Self::Int8,
            2 => Self::Uint16,
            3 => Self::Int16,
            4 => Self::Uint32,
            5 => Self::Int32,
            6 => Self::Float32,
            7 => Self::Bool,
            8 => Self::String,
            9 => Self::Array,
            10 => Self::Uint64,
            11 => Self::Int64,
            12 => Self::Float64,
            _ => return None,
        })
    }
}

/// GGUF metadata value.
#[derive(Debug, Clone, PartialEq)]
pub enum GgufValue {
    Uint8(u8),
    Int8(i8),
    Uint16(u16),
    Int16(i16),
    Uint32(u32),
    Int32(i32),
    Float32(f32),
    Bool(bool),
    String(String),
    /// Element type and items; items all share that type
    Array(GgufValueType, Vec<GgufValue>),
    Uint64(u64),
    Int64(i64),
    Float64(f64),
}

impl GgufValue {
    pub fn value_type(&self) -> GgufValueType {
        match self {
            Self::Uint8(_) => GgufValueType::Uint8,
            Self::Int8(_) => GgufValueType::Int8,
            Self::Uint16(_) => GgufValueType::Uint16,
            Self::Int16(_) => GgufValueType::Int16,
            Self::Uint32(_) => GgufValueType::Uint32,
            Self::Int32(_) => GgufValueType::Int32,
            Self::Float32(_) => GgufValueType::Float32,
            Self::Bool(_) => GgufValueType::Bool,
            Self::String(_) => GgufValueType::String,
            Self::Array(..) => GgufValueType::Array,
            Self::Uint64(_) => GgufValueType::Uint64,
            Self::Int64(_) => GgufValueType::Int64,
            Self::Float64(_) => GgufValueType::Float64,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Any unsigned or non-negative signed integer, widened.
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Self::Uint8(v) => Some(v as u64),
            Self::Uint16(v) => Some(v as u64),
            Self::Uint32(v) => Some(v as u64),
            Self::Uint64(v) => Some(v),
            Self::Int8(v) if v >= 0 => Some(v as u64),
            Self::Int16(v) if v >= 0 => Some(v as u64),
            Self::Int32(v) if v >= 0 => Some(v as u64),
            Self::Int64(v) if v >= 0 => Some(v as u64),
            _ => None,
        }
    }
}

/// `general.file_type` value describing the dominant output type.
pub fn file_type_id(element_type: ElementType) -> u32 {
    match element_type {
        ElementType::F32 => 0,
        ElementType::F16 => 1,
        ElementType::Q4_0 => 2,
        ElementType::Q4_1 => 3,
        ElementType::Q8_0 => 7,
        ElementType::Q5_0 => 8,
        ElementType::Q5_1 => 9,
        ElementType::Q2_K => 10,
        ElementType::Q3_K => 11,
        ElementType::Q4_K => 14,
        ElementType::Q5_K => 16,
        ElementType::Q6_K => 18,
        ElementType::BF16 => 32,
        // Not a whole-file type; report as mixed
        _ => 0,
    }
}

/// Calculate padding bytes needed for alignment.
pub const fn padding_for_alignment(offset: u64, alignment: u64) -> u64 {
    let remainder = offset % alignment;
    if remainder == 0 {
        0
    } else {
        alignment - remainder
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_padding() {
        assert_eq!(padding_for_alignment(0, 32), 0);
        assert_eq!(padding_for_alignment(1, 32), 31);
        assert_eq!(padding_for_alignment(64, 32), 0);
        assert_eq!(padding_for_alignment(65, 32), 31);
    }

    #[test]
    fn test_value_type_ids() {
        for id in 0..=12 {
            assert_eq!(GgufValueType::from_u32(id).map(|t| t as u32), Some(id));
        }
        assert_eq!(GgufValueType::from_u32(13), None);
        assert_eq!(
            GgufValue::Array(GgufValueType::String, vec![]).value_type(),
            GgufValueType::Array
        );
    }

    #[test]
    fn test_as_u64() {
        assert_eq!(GgufValue::Uint32(32).as_u64(), Some(32));
        assert_eq!(GgufValue::Int32(-1).as_u64(), None);
        assert_eq!(GgufValue::String("x".into()).as_u64(), None);
    }
}
