//! GGUF reader.
//!
//! Parses the header, metadata and tensor infos. Tensor payloads are not read;
//! callers use [`GgufFile::data_offset`] plus a tensor's offset to locate them.

use super::{padding_for_alignment, GgufValue, GgufValueType, KEY_ALIGNMENT};
use crate::config::{ContainerConfig, LoaderConfig};
use crate::element_type::ElementType;
use crate::error::{ConvertError, Result};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::debug;

/// One entry of the tensor info table.
#[derive(Debug, Clone, PartialEq)]
pub struct GgufTensorInfo {
    pub name: String,
    /// Innermost first
    pub dims: Vec<u64>,
    pub element_type: ElementType,
    /// Relative to the start of the data section
    pub offset: u64,
}

impl GgufTensorInfo {
    /// `None` if the product of the dims overflows.
    pub fn n_elements(&self) -> Option<u64> {
        self.dims.iter().try_fold(1u64, |acc, &d| acc.checked_mul(d))
    }

    /// Payload size; `None` for an overflowing count or a partial block.
    pub fn byte_size(&self) -> Option<u64> {
        self.n_elements()
            .and_then(|n| self.element_type.byte_size(n))
    }
}

/// Parsed GGUF header.
#[derive(Debug, Clone)]
pub struct GgufFile {
    pub version: u32,
    pub alignment: u64,
    pub metadata: BTreeMap<String, GgufValue>,
    pub tensors: Vec<GgufTensorInfo>,
    /// Absolute offset of the data section
    pub data_offset: u64,
    pub file_len: u64,
}

impl GgufFile {
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(GgufValue::as_str)
    }

    pub fn tensor(&self, name: &str) -> Option<&GgufTensorInfo> {
        self.tensors.iter().find(|t| t.name == name)
    }

    /// Read the payload of `info` from `path`.
    pub fn read_tensor_data(&self, path: &Path, info: &GgufTensorInfo) -> Result<Vec<u8>> {
        let len = info.byte_size().ok_or_else(|| {
            ConvertError::corrupt(path, format!("tensor '{}' has an invalid size", info.name))
        })?;
        let start = match self.data_offset.checked_add(info.offset) {
            Some(start) if start.checked_add(len).is_some_and(|end| end <= self.file_len) => start,
            _ => {
                return Err(ConvertError::corrupt(
                    path,
                    format!("tensor '{}' extends past end of file", info.name),
                ))
            }
        };

        let mut file = File::open(path).map_err(|e| ConvertError::io("opening gguf", path, e))?;
        file.seek(SeekFrom::Start(start))
            .map_err(|e| ConvertError::io("seeking tensor data", path, e))?;
        let mut data = vec![0u8; len as usize];
        file.read_exact(&mut data)
            .map_err(|e| ConvertError::io("reading tensor data", path, e))?;
        Ok(data)
    }
}

/// Little-endian cursor that tracks its position for the data offset.
struct HeaderReader<R> {
    inner: R,
    pos: u64,
    path: PathBuf,
}

impl<R: Read> HeaderReader<R> {
    fn bytes<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.inner
            .read_exact(&mut buf)
            .map_err(|_| ConvertError::corrupt(&self.path, format!("truncated at byte {}", self.pos)))?;
        self.pos += N as u64;
        Ok(buf)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        self.bytes().map(u16::from_le_bytes)
    }

    fn u32(&mut self) -> Result<u32> {
        self.bytes().map(u32::from_le_bytes)
    }

    fn u64(&mut self) -> Result<u64> {
        self.bytes().map(u64::from_le_bytes)
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u64()?;
        if len > LoaderConfig::MAX_GGUF_STRING {
            return Err(ConvertError::corrupt(
                &self.path,
                format!("string of {len} bytes at byte {}", self.pos),
            ));
        }
        let mut buf = vec![0u8; len as usize];
        self.inner
            .read_exact(&mut buf)
            .map_err(|_| ConvertError::corrupt(&self.path, "truncated string"))?;
        self.pos += len;
        String::from_utf8(buf).map_err(|_| ConvertError::corrupt(&self.path, "string is not UTF-8"))
    }

    fn value(&mut self, value_type: GgufValueType, depth: usize) -> Result<GgufValue> {
        Ok(match value_type {
            GgufValueType::Uint8 => GgufValue::Uint8(self.u8()?),
            GgufValueType::Int8 => GgufValue::Int8(self.u8()? as i8),
            GgufValueType::Uint16 => GgufValue::Uint16(self.u16()?),
            GgufValueType::Int16 => GgufValue::Int16(self.u16()? as i16),
            GgufValueType::Uint32 => GgufValue::Uint32(self.u32()?),
            GgufValueType::Int32 => GgufValue::Int32(self.u32()? as i32),
            GgufValueType::Float32 => GgufValue::Float32(f32::from_bits(self.u32()?)),
            GgufValueType::Bool => GgufValue::Bool(self.u8()? != 0),
            GgufValueType::String => GgufValue::String(self.string()?),
            GgufValueType::Uint64 => GgufValue::Uint64(self.u64()?),
            GgufValueType::Int64 => GgufValue::Int64(self.u64()? as i64),
            GgufValueType::Float64 => GgufValue::Float64(f64::from_bits(self.u64()?)),
            GgufValueType::Array => {
                if depth >= LoaderConfig::MAX_NESTING_DEPTH {
                    return Err(ConvertError::corrupt(&self.path, "arrays nested too deeply"));
                }
                let item_type = self.value_type()?;
                let count = self.u64()?;
                if count > LoaderConfig::MAX_GGUF_STRING {
                    return Err(ConvertError::corrupt(
                        &self.path,
                        format!("array of {count} items"),
                    ));
                }
                let mut items = Vec::with_capacity(count.min(4096) as usize);
                for _ in 0..count {
                    items.push(self.value(item_type, depth + 1)?);
                }
                GgufValue::Array(item_type, items)
            }
        })
    }

    fn value_type(&mut self) -> Result<GgufValueType> {
        let raw = self.u32()?;
        GgufValueType::from_u32(raw)
            .ok_or_else(|| ConvertError::corrupt(&self.path, format!("unknown value type {raw}")))
    }
}

/// Parse the header of a GGUF file.
pub fn read_gguf(path: &Path) -> Result<GgufFile> {
    let file = File::open(path).map_err(|e| ConvertError::io("opening gguf", path, e))?;
    let file_len = file
        .metadata()
        .map_err(|e| ConvertError::io("reading metadata", path, e))?
        .len();
    let mut reader = HeaderReader {
        inner: BufReader::new(file),
        pos: 0,
        path: path.to_path_buf(),
    };

    let magic = reader.u32()?;
    if magic != ContainerConfig::MAGIC {
        return Err(ConvertError::UnsupportedFormat {
            path: path.to_path_buf(),
            reason: format!("bad GGUF magic {magic:#010x}"),
        });
    }
    let version = reader.u32()?;
    if !(2..=ContainerConfig::VERSION).contains(&version) {
        return Err(ConvertError::UnsupportedFormat {
            path: path.to_path_buf(),
            reason: format!("GGUF version {version} is not supported"),
        });
    }

    let tensor_count = reader.u64()?;
    let kv_count = reader.u64()?;
    if tensor_count > LoaderConfig::MAX_TENSOR_COUNT || kv_count > LoaderConfig::MAX_METADATA_COUNT {
        return Err(ConvertError::corrupt(
            path,
            format!("{tensor_count} tensors and {kv_count} metadata entries"),
        ));
    }

    let mut metadata = BTreeMap::new();
    for _ in 0..kv_count {
        let key = reader.string()?;
        let value_type = reader.value_type()?;
        let value = reader.value(value_type, 0)?;
        metadata.insert(key, value);
    }

    let alignment = match metadata.get(KEY_ALIGNMENT) {
        None => ContainerConfig::ALIGNMENT,
        Some(value) => match value.as_u64() {
            Some(a) if a > 0 && a.is_power_of_two() => a,
            _ => return Err(ConvertError::corrupt(path, format!("invalid alignment {value:?}"))),
        },
    };

    let mut tensors = Vec::with_capacity(tensor_count as usize);
    for _ in 0..tensor_count {
        let name = reader.string()?;
        let n_dims = reader.u32()?;
        if n_dims == 0 || n_dims > LoaderConfig::MAX_DIMS {
            return Err(ConvertError::corrupt(
                path,
                format!("tensor '{name}' has {n_dims} dimensions"),
            ));
        }
        let dims = (0..n_dims).map(|_| reader.u64()).collect::<Result<Vec<_>>>()?;
        let type_id = reader.u32()?;
        let element_type = ElementType::from_gguf_id(type_id).ok_or_else(|| {
            ConvertError::UnsupportedDtype {
                path: path.to_path_buf(),
                tensor: name.clone(),
                dtype: format!("ggml type {type_id}"),
            }
        })?;
        let offset = reader.u64()?;
        tensors.push(GgufTensorInfo {
            name,
            dims,
            element_type,
            offset,
        });
    }

    let data_offset = reader.pos + padding_for_alignment(reader.pos, alignment);
    for info in &tensors {
        if info.n_elements().is_none() {
            return Err(ConvertError::corrupt(
                path,
                format!("tensor '{}' dims {:?} overflow the element count", info.name, info.dims),
            ));
        }
        let fits = info
            .byte_size()
            .and_then(|len| data_offset.checked_add(info.offset)?.checked_add(len))
            .is_some_and(|end| end <= file_len);
        if !fits {
            return Err(ConvertError::corrupt(
                path,
                format!("tensor '{}' lies outside the data section", info.name),
            ));
        }
    }

    debug!(
        "Read GGUF v{} header from {}: {} tensors, {} metadata keys",
        version,
        path.display(),
        tensors.len(),
        metadata.len()
    );

    Ok(GgufFile {
        version,
        alignment,
        metadata,
        tensors,
        data_offset,
        file_len,
    })
}
