//! GGML element types and the output type tokens accepted on the command line.

use std::fmt;

/// Element type of a tensor, as stored in a GGUF container.
///
/// Discriminants are not used; [`ElementType::gguf_id`] carries the on-disk id.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    F32,
    F16,
    Q4_0,
    Q4_1,
    Q5_0,
    Q5_1,
    Q8_0,
    Q2_K,
    Q3_K,
    Q4_K,
    Q5_K,
    Q6_K,
    Q8_K,
    I8,
    I16,
    I32,
    I64,
    F64,
    BF16,
}

/// Output type tokens, in the order they are listed in help text.
pub const OUTPUT_TOKENS: &[(&str, ElementType)] = &[
    ("fp32", ElementType::F32),
    ("fp16", ElementType::F16),
    ("q8_0", ElementType::Q8_0),
    ("q5_1", ElementType::Q5_1),
    ("q5_0", ElementType::Q5_0),
    ("q4_1", ElementType::Q4_1),
    ("q4_0", ElementType::Q4_0),
    ("q4_k", ElementType::Q4_K),
    ("q3_k", ElementType::Q3_K),
    ("q2_k", ElementType::Q2_K),
];

const ALL: [ElementType; 19] = [
    ElementType::F32,
    ElementType::F16,
    ElementType::Q4_0,
    ElementType::Q4_1,
    ElementType::Q5_0,
    ElementType::Q5_1,
    ElementType::Q8_0,
    ElementType::Q2_K,
    ElementType::Q3_K,
    ElementType::Q4_K,
    ElementType::Q5_K,
    ElementType::Q6_K,
    ElementType::Q8_K,
    ElementType::I8,
    ElementType::I16,
    ElementType::I32,
    ElementType::I64,
    ElementType::F64,
    ElementType::BF16,
];

impl ElementType {
    /// Resolve a command-line token. `None` means the token is not recognized.
    pub fn from_token(token: &str) -> Option<Self> {
        OUTPUT_TOKENS
            .iter()
            .find(|(t, _)| *t == token)
            .map(|(_, ty)| *ty)
    }

    /// GGML type id written into tensor infos.
    pub fn gguf_id(self) -> u32 {
        match self {
            ElementType::F32 => 0,
            ElementType::F16 => 1,
            ElementType::Q4_0 => 2,
            ElementType::Q4_1 => 3,
            ElementType::Q5_0 => 6,
            ElementType::Q5_1 => 7,
            ElementType::Q8_0 => 8,
            ElementType::Q2_K => 10,
            ElementType::Q3_K => 11,
            ElementType::Q4_K => 12,
            ElementType::Q5_K => 13,
            ElementType::Q6_K => 14,
            ElementType::Q8_K => 15,
            ElementType::I8 => 24,
            ElementType::I16 => 25,
            ElementType::I32 => 26,
            ElementType::I64 => 27,
            ElementType::F64 => 28,
            ElementType::BF16 => 30,
        }
    }

    pub fn from_gguf_id(id: u32) -> Option<Self> {
        ALL.iter().copied().find(|ty| ty.gguf_id() == id)
    }

    /// Lowercase GGML type name (`f16`, `q4_K`, ...).
    pub fn name(self) -> &'static str {
        match self {
            ElementType::F32 => "f32",
            ElementType::F16 => "f16",
            ElementType::Q4_0 => "q4_0",
            ElementType::Q4_1 => "q4_1",
            ElementType::Q5_0 => "q5_0",
            ElementType::Q5_1 => "q5_1",
            ElementType::Q8_0 => "q8_0",
            ElementType::Q2_K => "q2_K",
            ElementType::Q3_K => "q3_K",
            ElementType::Q4_K => "q4_K",
            ElementType::Q5_K => "q5_K",
            ElementType::Q6_K => "q6_K",
            ElementType::Q8_K => "q8_K",
            ElementType::I8 => "i8",
            ElementType::I16 => "i16",
            ElementType::I32 => "i32",
            ElementType::I64 => "i64",
            ElementType::F64 => "f64",
            ElementType::BF16 => "bf16",
        }
    }

    /// Number of elements per block (1 for plain types).
    pub fn block_size(self) -> usize {
        match self {
            ElementType::Q4_0
            | ElementType::Q4_1
            | ElementType::Q5_0
            | ElementType::Q5_1
            | ElementType::Q8_0 => 32,
            ElementType::Q2_K
            | ElementType::Q3_K
            | ElementType::Q4_K
            | ElementType::Q5_K
            | ElementType::Q6_K
            | ElementType::Q8_K => 256,
            _ => 1,
        }
    }

    /// Bytes per block.
    pub fn type_size(self) -> usize {
        match self {
            ElementType::F32 | ElementType::I32 => 4,
            ElementType::F16 | ElementType::BF16 | ElementType::I16 => 2,
            ElementType::I8 => 1,
            ElementType::I64 | ElementType::F64 => 8,
            ElementType::Q4_0 => 18,
            ElementType::Q4_1 => 20,
            ElementType::Q5_0 => 22,
            ElementType::Q5_1 => 24,
            ElementType::Q8_0 => 34,
            ElementType::Q2_K => 84,
            ElementType::Q3_K => 110,
            ElementType::Q4_K => 144,
            ElementType::Q5_K => 176,
            ElementType::Q6_K => 210,
            ElementType::Q8_K => 292,
        }
    }

    pub fn is_quantized(self) -> bool {
        self.block_size() > 1
    }

    /// Storage size of `n_elements` values, or `None` if `n_elements` is not a
    /// whole number of blocks or the size overflows.
    pub fn byte_size(self, n_elements: u64) -> Option<u64> {
        let block = self.block_size() as u64;
        if n_elements % block != 0 {
            return None;
        }
        (n_elements / block).checked_mul(self.type_size() as u64)
    }

    /// Types the quantizer can produce.
    pub fn can_encode(self) -> bool {
        matches!(
            self,
            ElementType::F32
                | ElementType::F16
                | ElementType::Q8_0
                | ElementType::Q5_1
                | ElementType::Q5_0
                | ElementType::Q4_1
                | ElementType::Q4_0
                | ElementType::Q4_K
                | ElementType::Q3_K
                | ElementType::Q2_K
        )
    }

    /// Types the quantizer can read back into f32.
    pub fn can_decode(self) -> bool {
        !matches!(self, ElementType::Q5_K | ElementType::Q6_K | ElementType::Q8_K)
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Check the token table: tokens and types pairwise distinct, every type encodable.
pub fn validate_token_table() -> Result<(), String> {
    for (i, (token, ty)) in OUTPUT_TOKENS.iter().enumerate() {
        if !ty.can_encode() {
            return Err(format!("output type {token} maps to non-encodable {ty}"));
        }
        for (other_token, other_ty) in &OUTPUT_TOKENS[i + 1..] {
            if token == other_token {
                return Err(format!("duplicate output token {token}"));
            }
            if ty == other_ty {
                return Err(format!("tokens {token} and {other_token} both map to {ty}"));
            }
        }
    }
    Ok(())
}
