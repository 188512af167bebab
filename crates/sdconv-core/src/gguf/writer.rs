//! Streaming GGUF writer.
//!
//! The header is assembled in memory, then tensors are read from their source
//! files, converted and appended one at a time. Output goes to a temporary
//! file next to the destination which is fsynced and renamed into place only
//! after the last byte is written; on any error the temporary file is removed
//! and an existing destination is left as it was.

use super::{
    file_type_id, padding_for_alignment, GgufValue, KEY_ALIGNMENT, KEY_ARCHITECTURE,
    KEY_FILE_TYPE, KEY_MODEL_VERSION, KEY_NAME, KEY_QUANTIZATION_VERSION,
};
use crate::config::ContainerConfig;
use crate::element_type::ElementType;
use crate::error::{ConvertError, Result};
use crate::quant::{convert_tensor_data, resolve_output_type};
use crate::registry::{TensorDescriptor, TensorRegistry};
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Options for one container write.
#[derive(Debug, Clone)]
pub struct WriteOptions {
    /// Output type for tensors whose group has none
    pub default_type: ElementType,
    /// `general.name`; defaults to [`ContainerConfig::DEFAULT_NAME`]
    pub name: Option<String>,
    /// Detected model version, written as `sdconv.model_version`
    pub model_version: Option<String>,
}

impl WriteOptions {
    pub fn new(default_type: ElementType) -> Self {
        Self {
            default_type,
            name: None,
            model_version: None,
        }
    }
}

/// What a finished write produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteSummary {
    pub path: PathBuf,
    pub tensor_count: usize,
    /// Tensors whose output type differs from their source type
    pub converted_count: usize,
    pub file_size: u64,
}

/// A tensor's place in the output.
struct PlannedTensor<'a> {
    tensor: &'a TensorDescriptor,
    output_type: ElementType,
    /// Relative to the data section
    offset: u64,
    size: u64,
}

fn plan_tensors(registry: &TensorRegistry, default_type: ElementType) -> Result<Vec<PlannedTensor<'_>>> {
    let mut offset = 0u64;
    let mut planned = Vec::with_capacity(registry.len());
    for tensor in registry.iter() {
        let output_type = resolve_output_type(tensor, default_type);
        let size = output_type
            .byte_size(tensor.n_elements())
            .ok_or_else(|| ConvertError::InvalidTensorData {
                message: format!(
                    "tensor '{}' with shape {:?} cannot be stored as {}",
                    tensor.full_name, tensor.shape, output_type
                ),
            })?;
        planned.push(PlannedTensor {
            tensor,
            output_type,
            offset,
            size,
        });
        offset += size + padding_for_alignment(size, ContainerConfig::ALIGNMENT);
    }
    Ok(planned)
}

fn put_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u64).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn put_value(buf: &mut Vec<u8>, value: &GgufValue) {
    match value {
        GgufValue::Uint8(v) => buf.push(*v),
        GgufValue::Int8(v) => buf.push(*v as u8),
        GgufValue::Uint16(v) => buf.extend_from_slice(&v.to_le_bytes()),
        GgufValue::Int16(v) => buf.extend_from_slice(&v.to_le_bytes()),
        GgufValue::Uint32(v) => buf.extend_from_slice(&v.to_le_bytes()),
        GgufValue::Int32(v) => buf.extend_from_slice(&v.to_le_bytes()),
        GgufValue::Float32(v) => buf.extend_from_slice(&v.to_le_bytes()),
        GgufValue::Bool(v) => buf.push(u8::from(*v)),
        GgufValue::String(s) => put_string(buf, s),
        GgufValue::Array(item_type, items) => {
            buf.extend_from_slice(&(*item_type as u32).to_le_bytes());
            buf.extend_from_slice(&(items.len() as u64).to_le_bytes());
            for item in items {
                put_value(buf, item);
            }
        }
        GgufValue::Uint64(v) => buf.extend_from_slice(&v.to_le_bytes()),
        GgufValue::Int64(v) => buf.extend_from_slice(&v.to_le_bytes()),
        GgufValue::Float64(v) => buf.extend_from_slice(&v.to_le_bytes()),
    }
}

fn metadata(options: &WriteOptions) -> Vec<(&'static str, GgufValue)> {
    let mut kv = vec![
        (
            KEY_ARCHITECTURE,
            GgufValue::String(ContainerConfig::ARCHITECTURE.to_string()),
        ),
        (
            KEY_NAME,
            GgufValue::String(
                options
                    .name
                    .clone()
                    .unwrap_or_else(|| ContainerConfig::DEFAULT_NAME.to_string()),
            ),
        ),
        (
            KEY_FILE_TYPE,
            GgufValue::Uint32(file_type_id(options.default_type)),
        ),
        (
            KEY_QUANTIZATION_VERSION,
            GgufValue::Uint32(ContainerConfig::QUANTIZATION_VERSION),
        ),
        (
            KEY_ALIGNMENT,
            GgufValue::Uint32(ContainerConfig::ALIGNMENT as u32),
        ),
    ];
    if let Some(version) = &options.model_version {
        kv.push((KEY_MODEL_VERSION, GgufValue::String(version.clone())));
    }
    kv
}

/// Header, metadata and tensor infos, padded up to the data section.
fn encode_header(options: &WriteOptions, planned: &[PlannedTensor<'_>]) -> Vec<u8> {
    let kv = metadata(options);
    let mut buf = Vec::new();
    buf.extend_from_slice(&ContainerConfig::MAGIC.to_le_bytes());
    buf.extend_from_slice(&ContainerConfig::VERSION.to_le_bytes());
    buf.extend_from_slice(&(planned.len() as u64).to_le_bytes());
    buf.extend_from_slice(&(kv.len() as u64).to_le_bytes());

    for (key, value) in &kv {
        put_string(&mut buf, key);
        buf.extend_from_slice(&(value.value_type() as u32).to_le_bytes());
        put_value(&mut buf, value);
    }

    for entry in planned {
        put_string(&mut buf, &entry.tensor.full_name);
        buf.extend_from_slice(&(entry.tensor.shape.len() as u32).to_le_bytes());
        for dim in &entry.tensor.shape {
            buf.extend_from_slice(&dim.to_le_bytes());
        }
        buf.extend_from_slice(&entry.output_type.gguf_id().to_le_bytes());
        buf.extend_from_slice(&entry.offset.to_le_bytes());
    }

    let pad = padding_for_alignment(buf.len() as u64, ContainerConfig::ALIGNMENT) as usize;
    buf.resize(buf.len() + pad, 0);
    buf
}

/// Keeps the most recently used source file open; tensors from one file are
/// adjacent in the registry.
#[derive(Default)]
struct SourceReader {
    current: Option<(Arc<PathBuf>, File)>,
}

impl SourceReader {
    fn read(&mut self, tensor: &TensorDescriptor) -> Result<Vec<u8>> {
        let source = &tensor.source;
        let open = match self.current.take() {
            Some((path, file)) if *path == *source.path => (path, file),
            _ => {
                let file = File::open(source.path.as_path()).map_err(|e| {
                    ConvertError::io("opening tensor source", source.path.as_path(), e)
                })?;
                (Arc::clone(&source.path), file)
            }
        };
        let (_, file) = self.current.insert(open);

        file.seek(SeekFrom::Start(source.offset))
            .map_err(|e| ConvertError::io("seeking tensor data", source.path.as_path(), e))?;
        let mut data = vec![0u8; source.len as usize];
        file.read_exact(&mut data).map_err(|e| {
            ConvertError::io(
                &format!("reading tensor '{}'", tensor.name),
                source.path.as_path(),
                e,
            )
        })?;
        Ok(data)
    }
}

fn write_error(path: &Path, message: impl Into<String>, err: std::io::Error) -> ConvertError {
    ConvertError::Write {
        path: path.to_path_buf(),
        message: message.into(),
        source: Some(err),
    }
}

/// Write every tensor of `registry` into a GGUF container at `path`.
pub fn write_gguf(
    registry: &TensorRegistry,
    options: &WriteOptions,
    path: &Path,
) -> Result<WriteSummary> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| ConvertError::InvalidParameter {
            field: "outfile".to_string(),
            message: format!("{} has no file name", path.display()),
        })?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let planned = plan_tensors(registry, options.default_type)?;
    let header = encode_header(options, &planned);
    info!(
        "Writing {} tensors to {} (default type {})",
        planned.len(),
        path.display(),
        options.default_type
    );

    let temp = tempfile::Builder::new()
        .prefix(&format!(".{file_name}."))
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(|e| write_error(path, format!("cannot create temporary file in {}", dir.display()), e))?;

    let mut written = 0u64;
    let mut converted_count = 0usize;
    {
        let mut out = BufWriter::new(temp.as_file());
        out.write_all(&header)
            .map_err(|e| write_error(path, "writing header", e))?;
        written += header.len() as u64;

        let mut sources = SourceReader::default();
        for entry in &planned {
            let tensor = entry.tensor;
            let raw = sources.read(tensor)?;
            let data = convert_tensor_data(
                &raw,
                tensor.element_type,
                entry.output_type,
                tensor.n_elements(),
            )?;
            if data.len() as u64 != entry.size {
                return Err(ConvertError::InvalidTensorData {
                    message: format!(
                        "tensor '{}' converted to {} bytes, expected {}",
                        tensor.full_name,
                        data.len(),
                        entry.size
                    ),
                });
            }
            if entry.output_type != tensor.element_type {
                converted_count += 1;
            }
            debug!(
                "{} {:?} {} -> {}",
                tensor.full_name, tensor.shape, tensor.element_type, entry.output_type
            );

            let pad = padding_for_alignment(entry.size, ContainerConfig::ALIGNMENT) as usize;
            out.write_all(&data)
                .and_then(|()| out.write_all(&[0u8; ContainerConfig::ALIGNMENT as usize][..pad]))
                .map_err(|e| write_error(path, format!("writing tensor '{}'", tensor.full_name), e))?;
            written += entry.size + pad as u64;
        }

        out.flush().map_err(|e| write_error(path, "flushing output", e))?;
    }

    temp.as_file()
        .sync_all()
        .map_err(|e| write_error(path, "syncing output", e))?;
    temp.persist(path)
        .map_err(|e| write_error(path, "renaming temporary file into place", e.error))?;

    info!(
        "Wrote {} ({} tensors, {} converted, {} bytes)",
        path.display(),
        planned.len(),
        converted_count,
        written
    );

    Ok(WriteSummary {
        path: path.to_path_buf(),
        tensor_count: planned.len(),
        converted_count,
        file_size: written,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gguf::read_gguf;
    use crate::registry::{RawTensor, TensorSource};
    use tempfile::TempDir;

    fn f32_source(dir: &Path, name: &str, values: &[f32]) -> TensorSource {
        let path = dir.join(name);
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        std::fs::write(&path, &bytes).unwrap();
        TensorSource {
            path: Arc::new(path),
            offset: 0,
            len: bytes.len() as u64,
        }
    }

    #[test]
    fn test_writes_readable_container() {
        let dir = TempDir::new().unwrap();
        let values: Vec<f32> = (0..64).map(|i| i as f32 / 8.0).collect();
        let mut registry = TensorRegistry::new();
        registry
            .insert_batch(
                "unet.",
                vec![
                    RawTensor {
                        name: "w".to_string(),
                        shape: vec![32, 2],
                        element_type: ElementType::F32,
                        source: f32_source(dir.path(), "w.bin", &values),
                    },
                    RawTensor {
                        name: "b.bias".to_string(),
                        shape: vec![3],
                        element_type: ElementType::F32,
                        source: f32_source(dir.path(), "b.bin", &[1.0, 2.0, 3.0]),
                    },
                ],
            )
            .unwrap();

        let out = dir.path().join("out.gguf");
        let mut options = WriteOptions::new(ElementType::Q8_0);
        options.model_version = Some("SD1".to_string());
        let summary = write_gguf(&registry, &options, &out).unwrap();
        assert_eq!(summary.tensor_count, 2);
        assert_eq!(summary.converted_count, 1);
        assert_eq!(summary.file_size, std::fs::metadata(&out).unwrap().len());

        let gguf = read_gguf(&out).unwrap();
        assert_eq!(gguf.metadata_str(KEY_ARCHITECTURE), Some("stable-diffusion"));
        assert_eq!(gguf.metadata_str(KEY_NAME), Some("output"));
        assert_eq!(gguf.metadata_str(KEY_MODEL_VERSION), Some("SD1"));
        assert_eq!(gguf.metadata.get(KEY_FILE_TYPE), Some(&GgufValue::Uint32(7)));

        let w = gguf.tensor("unet.w").unwrap();
        assert_eq!(w.element_type, ElementType::Q8_0);
        assert_eq!(w.offset % 32, 0);
        let bias = gguf.tensor("unet.b.bias").unwrap();
        assert_eq!(bias.element_type, ElementType::F32);
        assert_eq!(bias.offset % 32, 0);
        let bias_data = gguf.read_tensor_data(&out, bias).unwrap();
        assert_eq!(&bias_data[8..12], &3.0f32.to_le_bytes());

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_failed_write_keeps_existing_destination() {
        let dir = TempDir::new().unwrap();
        let mut registry = TensorRegistry::new();
        let mut source = f32_source(dir.path(), "short.bin", &[1.0, 2.0]);
        // Claims more bytes than the file holds
        source.len = 64;
        registry
            .insert_batch(
                "",
                vec![RawTensor {
                    name: "w".to_string(),
                    shape: vec![16],
                    element_type: ElementType::F32,
                    source,
                }],
            )
            .unwrap();

        let out = dir.path().join("model.gguf");
        std::fs::write(&out, b"previous").unwrap();
        assert!(write_gguf(&registry, &WriteOptions::new(ElementType::F16), &out).is_err());
        assert_eq!(std::fs::read(&out).unwrap(), b"previous");

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().all(|n| !n.ends_with(".tmp")), "{names:?}");
    }

    #[test]
    fn test_empty_registry_is_valid() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("empty.gguf");
        write_gguf(&TensorRegistry::new(), &WriteOptions::new(ElementType::F16), &out).unwrap();
        let gguf = read_gguf(&out).unwrap();
        assert!(gguf.tensors.is_empty());
        assert_eq!(gguf.data_offset % 32, 0);
    }
}
