//! Tensor type conversion and quantization.
//!
//! [`convert_tensor_data`] is the only entry point the writer needs: it turns
//! one tensor's source bytes into the bytes of its output type. Everything
//! goes through f32 except identical types (copied) and integer narrowing.
//!
//! Which output type a tensor gets is decided by [`resolve_output_type`].

pub mod blocks;
pub mod kquants;

use crate::element_type::ElementType;
use crate::error::{ConvertError, Result};
use crate::registry::TensorDescriptor;
use half::{bf16, f16};

/// Name fragments of embedding, input and output projections that stay in
/// their source precision.
const UNCONVERTED_MARKERS: &[&str] = &[
    "img_in.",
    "txt_in.",
    "time_in.",
    "vector_in.",
    "guidance_in.",
    "final_layer.",
    "x_embedder.",
    "t_embedder.",
    "y_embedder.",
    "pos_embed",
    "context_embedder.",
    "time_embed.",
    "label_emb.",
];

fn is_integer(ty: ElementType) -> bool {
    matches!(
        ty,
        ElementType::I8 | ElementType::I16 | ElementType::I32 | ElementType::I64
    )
}

/// Whether a tensor named `name` with GGUF shape `shape` takes `target`.
pub fn tensor_should_be_converted(name: &str, shape: &[u64], target: ElementType) -> bool {
    let block = target.block_size() as u64;
    if target.is_quantized() && shape.first().map_or(true, |ne0| ne0 % block != 0) {
        return false;
    }
    if name.ends_with(".bias") || name.ends_with(".scale") {
        return false;
    }
    !UNCONVERTED_MARKERS.iter().any(|marker| name.contains(marker))
}

/// Output type of a tensor that keeps its source precision.
///
/// BF16 and F64 become F32, I64 becomes I32; everything else is unchanged.
pub fn natural_output_type(source: ElementType) -> ElementType {
    match source {
        ElementType::BF16 | ElementType::F64 => ElementType::F32,
        ElementType::I64 => ElementType::I32,
        other => other,
    }
}

/// Final output type of a registered tensor given the run's default type.
pub fn resolve_output_type(tensor: &TensorDescriptor, default_type: ElementType) -> ElementType {
    let source = tensor.element_type;
    if !source.can_decode() {
        return source;
    }
    if is_integer(source) {
        return natural_output_type(source);
    }
    let target = tensor.group_type.unwrap_or(default_type);
    if tensor_should_be_converted(&tensor.full_name, &tensor.shape, target) {
        target
    } else {
        natural_output_type(source)
    }
}

/// Convert `n_elements` values stored as `from` into the byte layout of `to`.
pub fn convert_tensor_data(
    data: &[u8],
    from: ElementType,
    to: ElementType,
    n_elements: u64,
) -> Result<Vec<u8>> {
    check_len(data, from, n_elements)?;
    if from == to {
        return Ok(data.to_vec());
    }
    if is_integer(from) && is_integer(to) {
        return Ok(narrow_integers(data, from, to));
    }
    let values = decode_to_f32(data, from, n_elements)?;
    encode_from_f32(&values, to)
}

fn check_len(data: &[u8], ty: ElementType, n_elements: u64) -> Result<()> {
    match ty.byte_size(n_elements) {
        Some(expected) if expected == data.len() as u64 => Ok(()),
        expected => Err(ConvertError::InvalidTensorData {
            message: format!(
                "{} bytes for {n_elements} {ty} elements (expected {expected:?})",
                data.len()
            ),
        }),
    }
}

fn read_integers(data: &[u8], ty: ElementType) -> Vec<i64> {
    match ty {
        ElementType::I8 => data.iter().map(|&b| b as i8 as i64).collect(),
        ElementType::I16 => data
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]) as i64)
            .collect(),
        ElementType::I32 => data
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as i64)
            .collect(),
        _ => data
            .chunks_exact(8)
            .map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
            .collect(),
    }
}

/// Integer to integer, truncating like a C cast.
fn narrow_integers(data: &[u8], from: ElementType, to: ElementType) -> Vec<u8> {
    let values = read_integers(data, from);
    let mut out = Vec::with_capacity(values.len() * to.type_size());
    for v in values {
        match to {
            ElementType::I8 => out.push(v as i8 as u8),
            ElementType::I16 => out.extend_from_slice(&(v as i16).to_le_bytes()),
            ElementType::I32 => out.extend_from_slice(&(v as i32).to_le_bytes()),
            _ => out.extend_from_slice(&v.to_le_bytes()),
        }
    }
    out
}

/// Decode any readable element type to f32.
pub fn decode_to_f32(data: &[u8], from: ElementType, n_elements: u64) -> Result<Vec<f32>> {
    check_len(data, from, n_elements)?;
    let mut out = Vec::with_capacity(n_elements as usize);
    match from {
        ElementType::F32 => out.extend(
            data.chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])),
        ),
        ElementType::F16 => out.extend(
            data.chunks_exact(2)
                .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32()),
        ),
        ElementType::BF16 => out.extend(
            data.chunks_exact(2)
                .map(|c| bf16::from_le_bytes([c[0], c[1]]).to_f32()),
        ),
        ElementType::F64 => out.extend(data.chunks_exact(8).map(|c| {
            f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f32
        })),
        ElementType::I8 | ElementType::I16 | ElementType::I32 | ElementType::I64 => {
            out.extend(read_integers(data, from).into_iter().map(|v| v as f32))
        }
        ElementType::Q4_0 => blocks::dequantize_q4_0(data, &mut out),
        ElementType::Q4_1 => blocks::dequantize_q4_1(data, &mut out),
        ElementType::Q5_0 => blocks::dequantize_q5_0(data, &mut out),
        ElementType::Q5_1 => blocks::dequantize_q5_1(data, &mut out),
        ElementType::Q8_0 => blocks::dequantize_q8_0(data, &mut out),
        ElementType::Q2_K => kquants::dequantize_q2_k(data, &mut out),
        ElementType::Q3_K => kquants::dequantize_q3_k(data, &mut out),
        ElementType::Q4_K => kquants::dequantize_q4_k(data, &mut out),
        ElementType::Q5_K | ElementType::Q6_K | ElementType::Q8_K => {
            return Err(ConvertError::UnsupportedConversion {
                from: from.to_string(),
                to: ElementType::F32.to_string(),
            })
        }
    }
    Ok(out)
}

/// Encode f32 values into one of the output element types.
pub fn encode_from_f32(values: &[f32], to: ElementType) -> Result<Vec<u8>> {
    if !to.can_encode() {
        return Err(ConvertError::UnsupportedConversion {
            from: ElementType::F32.to_string(),
            to: to.to_string(),
        });
    }
    if values.len() % to.block_size() != 0 {
        return Err(ConvertError::InvalidTensorData {
            message: format!(
                "{} values are not a whole number of {to} blocks",
                values.len()
            ),
        });
    }

    let n_blocks = values.len() / to.block_size();
    let mut out = Vec::with_capacity(n_blocks * to.type_size());
    match to {
        ElementType::F32 => {
            for v in values {
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
        ElementType::F16 => {
            for v in values {
                out.extend_from_slice(&f16::from_f32(*v).to_le_bytes());
            }
        }
        ElementType::Q4_0 => blocks::quantize_q4_0(values, &mut out),
        ElementType::Q4_1 => blocks::quantize_q4_1(values, &mut out),
        ElementType::Q5_0 => blocks::quantize_q5_0(values, &mut out),
        ElementType::Q5_1 => blocks::quantize_q5_1(values, &mut out),
        ElementType::Q8_0 => blocks::quantize_q8_0(values, &mut out),
        ElementType::Q2_K => kquants::quantize_q2_k(values, &mut out),
        ElementType::Q3_K => kquants::quantize_q3_k(values, &mut out),
        ElementType::Q4_K => kquants::quantize_q4_k(values, &mut out),
        // can_encode rules out the rest
        _ => {
            return Err(ConvertError::UnsupportedConversion {
                from: ElementType::F32.to_string(),
                to: to.to_string(),
            })
        }
    }
    Ok(out)
}
