//! PyTorch zip checkpoints (`.ckpt`, `.pt`, `.pth`).
//!
//! `torch.save` writes a zip archive with `<name>/data.pkl` describing the
//! object graph and one `<name>/data/<key>` entry per storage. Storages must
//! be stored without compression so tensors can be read in place later.

use super::pickle::{self, Object, TensorRef};
use super::safetensors::gguf_shape;
use crate::element_type::ElementType;
use crate::error::{ConvertError, Result};
use crate::registry::{RawTensor, TensorSource};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;
use zip::{CompressionMethod, ZipArchive};

/// Element type for a torch storage class name.
pub fn element_type_for_storage(storage_type: &str) -> Option<ElementType> {
    match storage_type {
        "FloatStorage" => Some(ElementType::F32),
        "HalfStorage" => Some(ElementType::F16),
        "BFloat16Storage" => Some(ElementType::BF16),
        "DoubleStorage" => Some(ElementType::F64),
        "LongStorage" => Some(ElementType::I64),
        "IntStorage" => Some(ElementType::I32),
        "ShortStorage" => Some(ElementType::I16),
        "CharStorage" => Some(ElementType::I8),
        _ => None,
    }
}

/// Read the tensor table of a zip checkpoint, in state-dict order.
pub fn read_torch_zip(path: &Path) -> Result<Vec<RawTensor>> {
    let file = File::open(path).map_err(|e| ConvertError::io("opening checkpoint", path, e))?;
    let mut archive = ZipArchive::new(BufReader::new(file)).map_err(|e| {
        ConvertError::corrupt(path, format!("failed to open checkpoint as zip archive: {e}"))
    })?;

    let pickle_name = archive
        .file_names()
        .find(|name| name.ends_with("data.pkl"))
        .map(str::to_string)
        .ok_or_else(|| ConvertError::UnsupportedFormat {
            path: path.to_path_buf(),
            reason: "zip archive has no data.pkl".to_string(),
        })?;
    let archive_dir = pickle_name.trim_end_matches("data.pkl").to_string();

    let mut pickle_bytes = Vec::new();
    archive
        .by_name(&pickle_name)
        .map_err(|e| ConvertError::corrupt(path, format!("cannot open {pickle_name}: {e}")))?
        .read_to_end(&mut pickle_bytes)
        .map_err(|e| ConvertError::io("reading data.pkl", path, e))?;

    let root = pickle::unpickle(&pickle_bytes)
        .map_err(|e| ConvertError::corrupt(path, e.to_string()))?;
    let state_dict = match root.get("state_dict") {
        Some(inner @ Object::Dict(_)) => inner,
        _ => &root,
    };
    let Object::Dict(entries) = state_dict else {
        return Err(ConvertError::UnsupportedFormat {
            path: path.to_path_buf(),
            reason: "checkpoint does not contain a state dict".to_string(),
        });
    };

    let shared_path = Arc::new(path.to_path_buf());
    let mut tensors = Vec::new();
    let mut skipped = 0usize;

    for (key, value) in entries {
        let (Some(name), Object::Tensor(tensor)) = (key.as_str(), value) else {
            skipped += 1;
            continue;
        };
        let element_type = element_type_for_storage(&tensor.storage.storage_type).ok_or_else(
            || ConvertError::UnsupportedDtype {
                path: path.to_path_buf(),
                tensor: name.to_string(),
                dtype: tensor.storage.storage_type.clone(),
            },
        )?;
        let (offset, len) =
            locate_tensor(path, &mut archive, &archive_dir, name, tensor, element_type)?;
        tensors.push(RawTensor {
            name: name.to_string(),
            shape: gguf_shape(&tensor.size),
            element_type,
            source: TensorSource {
                path: Arc::clone(&shared_path),
                offset,
                len,
            },
        });
    }

    debug!(
        "Read {} tensors from checkpoint {} ({} non-tensor entries skipped)",
        tensors.len(),
        path.display(),
        skipped
    );
    Ok(tensors)
}

/// Absolute byte range of a tensor inside its storage entry.
fn locate_tensor<R: Read + std::io::Seek>(
    path: &Path,
    archive: &mut ZipArchive<R>,
    archive_dir: &str,
    name: &str,
    tensor: &TensorRef,
    element_type: ElementType,
) -> Result<(u64, u64)> {
    if !tensor.is_contiguous() {
        return Err(ConvertError::UnsupportedFormat {
            path: path.to_path_buf(),
            reason: format!(
                "tensor '{name}' is not contiguous (size {:?}, stride {:?})",
                tensor.size, tensor.stride
            ),
        });
    }

    let entry_name = format!("{archive_dir}data/{}", tensor.storage.key);
    let entry = archive.by_name(&entry_name).map_err(|e| {
        ConvertError::corrupt(path, format!("missing storage {entry_name} for '{name}': {e}"))
    })?;
    if entry.compression() != CompressionMethod::Stored {
        return Err(ConvertError::UnsupportedFormat {
            path: path.to_path_buf(),
            reason: format!("storage {entry_name} is compressed"),
        });
    }

    let element_size = element_type.type_size() as u64;
    let start = tensor.storage_offset.checked_mul(element_size);
    let len = tensor.numel().and_then(|n| n.checked_mul(element_size));
    let (Some(start), Some(len)) = (start, len) else {
        return Err(ConvertError::corrupt(path, format!("tensor '{name}' is too large")));
    };
    if start.checked_add(len).map_or(true, |end| end > entry.size()) {
        return Err(ConvertError::corrupt(
            path,
            format!(
                "tensor '{name}' needs bytes [{start}, {}) but storage {entry_name} has {}",
                start.saturating_add(len),
                entry.size()
            ),
        ));
    }

    Ok((entry.data_start() + start, len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::pickle::tests::PickleWriter;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;

    fn write_checkpoint(path: &Path, pickle: &[u8], storages: &[(&str, Vec<u8>)], method: CompressionMethod) {
        let file = File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = SimpleFileOptions::default().compression_method(method);
        zip.start_file("archive/data.pkl", options).unwrap();
        zip.write_all(pickle).unwrap();
        for (key, bytes) in storages {
            zip.start_file(format!("archive/data/{key}"), options).unwrap();
            zip.write_all(bytes).unwrap();
        }
        zip.finish().unwrap();
    }

    fn state_dict_pickle() -> Vec<u8> {
        let mut w = PickleWriter::new();
        w.op(b'}').op(b'(');
        w.string("state_dict").op(b'}').op(b'(');
        w.string("model.w").tensor("FloatStorage", "0", 2, &[2, 2], &[2, 1]);
        w.string("model.h").tensor("HalfStorage", "1", 0, &[3], &[1]);
        w.op(b'u');
        w.string("epoch").int(3);
        w.op(b'u');
        w.finish()
    }

    #[test]
    fn test_reads_state_dict_tensors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.ckpt");
        let floats: Vec<u8> = (0..6).flat_map(|i| (i as f32).to_le_bytes()).collect();
        let halves = vec![0u8; 6];
        write_checkpoint(
            &path,
            &state_dict_pickle(),
            &[("0", floats), ("1", halves)],
            CompressionMethod::Stored,
        );

        let tensors = read_torch_zip(&path).unwrap();
        assert_eq!(tensors.len(), 2);
        assert_eq!(tensors[0].name, "model.w");
        assert_eq!(tensors[0].element_type, ElementType::F32);
        assert_eq!(tensors[0].shape, vec![2, 2]);
        assert_eq!(tensors[0].source.len, 16);

        // storage offset 2 skips two floats
        let raw = std::fs::read(&path).unwrap();
        let start = tensors[0].source.offset as usize;
        let first = f32::from_le_bytes(raw[start..start + 4].try_into().unwrap());
        assert_eq!(first, 2.0);

        assert_eq!(tensors[1].name, "model.h");
        assert_eq!(tensors[1].element_type, ElementType::F16);
    }

    #[test]
    fn test_compressed_storage_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.ckpt");
        write_checkpoint(
            &path,
            &state_dict_pickle(),
            &[("0", vec![0u8; 24]), ("1", vec![0u8; 6])],
            CompressionMethod::Deflated,
        );
        let err = read_torch_zip(&path).unwrap_err();
        assert!(matches!(err, ConvertError::UnsupportedFormat { .. }));
    }

    #[test]
    fn test_storage_too_small_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.ckpt");
        write_checkpoint(
            &path,
            &state_dict_pickle(),
            &[("0", vec![0u8; 8]), ("1", vec![0u8; 6])],
            CompressionMethod::Stored,
        );
        let err = read_torch_zip(&path).unwrap_err();
        assert!(matches!(err, ConvertError::CorruptFile { .. }));
    }

    #[test]
    fn test_overflowing_sizes_are_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.ckpt");
        let mut w = PickleWriter::new();
        w.op(b'}').op(b'(');
        w.string("w").tensor(
            "FloatStorage",
            "0",
            0,
            &[65536; 4],
            &[1 << 48, 1 << 32, 65536, 1],
        );
        w.op(b'u');
        write_checkpoint(&path, &w.finish(), &[("0", vec![0u8; 16])], CompressionMethod::Stored);

        let err = read_torch_zip(&path).unwrap_err();
        assert!(matches!(err, ConvertError::CorruptFile { .. }), "{err:?}");
        assert!(err.to_string().contains("too large"), "{err}");
    }

    #[test]
    fn test_storage_type_mapping() {
        assert_eq!(element_type_for_storage("LongStorage"), Some(ElementType::I64));
        assert_eq!(element_type_for_storage("BFloat16Storage"), Some(ElementType::BF16));
        assert_eq!(element_type_for_storage("ByteStorage"), None);
    }
}
