//! Safetensors header parsing.
//!
//! Layout: an 8-byte little-endian header length, a JSON object mapping tensor
//! names to `{dtype, shape, data_offsets}`, then the raw data. Offsets are
//! relative to the end of the header. Only the header is read here; payloads
//! are read later by the writer through [`TensorSource`].

use crate::config::LoaderConfig;
use crate::element_type::ElementType;
use crate::error::{ConvertError, Result};
use crate::registry::{RawTensor, TensorSource};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct HeaderEntry {
    dtype: String,
    shape: Vec<u64>,
    data_offsets: [u64; 2],
}

/// Map a safetensors dtype string to an element type.
pub fn element_type_for_dtype(dtype: &str) -> Option<ElementType> {
    match dtype {
        "F32" => Some(ElementType::F32),
        "F16" => Some(ElementType::F16),
        "BF16" => Some(ElementType::BF16),
        "F64" => Some(ElementType::F64),
        "I8" => Some(ElementType::I8),
        "I16" => Some(ElementType::I16),
        "I32" => Some(ElementType::I32),
        "I64" => Some(ElementType::I64),
        _ => None,
    }
}

/// Read the tensor table of a safetensors file.
///
/// Tensors come back sorted by name, which keeps the output order stable.
pub fn read_safetensors(path: &Path) -> Result<Vec<RawTensor>> {
    let mut file = File::open(path).map_err(|e| ConvertError::io("opening safetensors", path, e))?;
    let file_len = file
        .metadata()
        .map_err(|e| ConvertError::io("reading metadata", path, e))?
        .len();

    let mut len_buf = [0u8; 8];
    file.read_exact(&mut len_buf)
        .map_err(|_| ConvertError::corrupt(path, "file shorter than the 8-byte header length"))?;
    let header_len = u64::from_le_bytes(len_buf);
    if header_len > LoaderConfig::MAX_SAFETENSORS_HEADER || 8 + header_len > file_len {
        return Err(ConvertError::corrupt(
            path,
            format!("header length {header_len} does not fit in a {file_len}-byte file"),
        ));
    }

    let mut header = vec![0u8; header_len as usize];
    file.read_exact(&mut header)
        .map_err(|e| ConvertError::io("reading safetensors header", path, e))?;

    let entries: BTreeMap<String, serde_json::Value> =
        serde_json::from_slice(&header).map_err(|e| {
            ConvertError::corrupt(path, format!("header is not a JSON object: {e}"))
        })?;

    let data_start = 8 + header_len;
    let data_len = file_len - data_start;
    let shared_path = Arc::new(path.to_path_buf());
    let mut tensors = Vec::with_capacity(entries.len());

    for (name, value) in entries {
        if name == "__metadata__" {
            continue;
        }
        let entry: HeaderEntry = serde_json::from_value(value).map_err(|e| {
            ConvertError::corrupt(path, format!("bad header entry for '{name}': {e}"))
        })?;
        tensors.push(to_raw_tensor(path, &shared_path, name, entry, data_start, data_len)?);
    }

    debug!("Read {} tensor headers from {}", tensors.len(), path.display());
    Ok(tensors)
}

fn to_raw_tensor(
    path: &Path,
    shared_path: &Arc<PathBuf>,
    name: String,
    entry: HeaderEntry,
    data_start: u64,
    data_len: u64,
) -> Result<RawTensor> {
    let element_type =
        element_type_for_dtype(&entry.dtype).ok_or_else(|| ConvertError::UnsupportedDtype {
            path: path.to_path_buf(),
            tensor: name.clone(),
            dtype: entry.dtype.clone(),
        })?;

    if entry.shape.len() > LoaderConfig::MAX_DIMS as usize {
        return Err(ConvertError::corrupt(
            path,
            format!("tensor '{name}' has {} dimensions", entry.shape.len()),
        ));
    }

    let [begin, end] = entry.data_offsets;
    if begin > end || end > data_len {
        return Err(ConvertError::corrupt(
            path,
            format!("tensor '{name}' offsets [{begin}, {end}) exceed data length {data_len}"),
        ));
    }

    let n_elements = entry
        .shape
        .iter()
        .try_fold(1u64, |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| ConvertError::corrupt(path, format!("tensor '{name}' is too large")))?;
    let expected = element_type.byte_size(n_elements);
    if expected != Some(end - begin) {
        return Err(ConvertError::corrupt(
            path,
            format!(
                "tensor '{name}' holds {} bytes but shape {:?} of {} needs {:?}",
                end - begin,
                entry.shape,
                entry.dtype,
                expected
            ),
        ));
    }

    Ok(RawTensor {
        name,
        shape: gguf_shape(&entry.shape),
        element_type,
        source: TensorSource {
            path: Arc::clone(shared_path),
            offset: data_start + begin,
            len: end - begin,
        },
    })
}

/// Row-major sizes (outermost first) to GGUF order (innermost first).
///
/// Scalars become a single dimension of 1.
pub fn gguf_shape(row_major: &[u64]) -> Vec<u64> {
    if row_major.is_empty() {
        return vec![1];
    }
    row_major.iter().rev().copied().collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Build a safetensors file from (name, dtype, shape, bytes) entries.
    pub(crate) fn safetensors_bytes(tensors: &[(&str, &str, &[u64], &[u8])]) -> Vec<u8> {
        let mut header = serde_json::Map::new();
        let mut data = Vec::new();
        for (name, dtype, shape, bytes) in tensors {
            let begin = data.len();
            data.extend_from_slice(bytes);
            header.insert(
                name.to_string(),
                serde_json::json!({
                    "dtype": dtype,
                    "shape": shape,
                    "data_offsets": [begin, data.len()],
                }),
            );
        }
        header.insert(
            "__metadata__".to_string(),
            serde_json::json!({"format": "pt"}),
        );
        let header = serde_json::to_vec(&header).unwrap();
        let mut out = (header.len() as u64).to_le_bytes().to_vec();
        out.extend_from_slice(&header);
        out.extend_from_slice(&data);
        out
    }

    fn f32_bytes(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn test_reads_headers_and_offsets() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.safetensors");
        let a = f32_bytes(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let b = vec![0u8; 4];
        std::fs::write(
            &path,
            safetensors_bytes(&[("a.weight", "F32", &[2, 3], &a), ("b.bias", "F16", &[2], &b)]),
        )
        .unwrap();

        let tensors = read_safetensors(&path).unwrap();
        assert_eq!(tensors.len(), 2);

        let a_tensor = &tensors[0];
        assert_eq!(a_tensor.name, "a.weight");
        assert_eq!(a_tensor.shape, vec![3, 2]);
        assert_eq!(a_tensor.element_type, ElementType::F32);
        assert_eq!(a_tensor.source.len, 24);

        let raw = std::fs::read(&path).unwrap();
        let start = a_tensor.source.offset as usize;
        assert_eq!(&raw[start..start + 24], a.as_slice());
        assert_eq!(tensors[1].element_type, ElementType::F16);
    }

    #[test]
    fn test_unsupported_dtype() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.safetensors");
        std::fs::write(&path, safetensors_bytes(&[("x", "U8", &[4], &[0, 1, 2, 3])])).unwrap();

        let err = read_safetensors(&path).unwrap_err();
        assert!(
            matches!(err, ConvertError::UnsupportedDtype { ref dtype, .. } if dtype == "U8")
        );
    }

    #[test]
    fn test_offsets_outside_file_are_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.safetensors");
        let mut bytes = safetensors_bytes(&[("x", "F32", &[4], &[0u8; 16])]);
        bytes.truncate(bytes.len() - 8);
        std::fs::write(&path, bytes).unwrap();

        let err = read_safetensors(&path).unwrap_err();
        assert!(matches!(err, ConvertError::CorruptFile { .. }));
    }

    #[test]
    fn test_truncated_header() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.safetensors");
        std::fs::write(&path, 4096u64.to_le_bytes()).unwrap();
        assert!(matches!(
            read_safetensors(&path).unwrap_err(),
            ConvertError::CorruptFile { .. }
        ));
    }

    #[test]
    fn test_scalar_shape() {
        assert_eq!(gguf_shape(&[]), vec![1]);
        assert_eq!(gguf_shape(&[320, 4, 3, 3]), vec![3, 3, 4, 320]);
    }
}
