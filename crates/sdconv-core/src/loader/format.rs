//! Source file format detection.
//!
//! Magic bytes decide first; the file extension is only a fallback for
//! headers that carry no signature.

use crate::config::LoaderConfig;
use crate::error::{ConvertError, Result};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Formats a model file can arrive in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Gguf,
    Safetensors,
    /// Zip archive written by `torch.save`
    TorchZip,
    /// Pre-1.6 bare pickle checkpoint
    LegacyPickle,
    Unknown,
}

impl FileFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileFormat::Gguf => "gguf",
            FileFormat::Safetensors => "safetensors",
            FileFormat::TorchZip => "torch-zip",
            FileFormat::LegacyPickle => "legacy-pickle",
            FileFormat::Unknown => "unknown",
        }
    }
}

/// Magic bytes for file format detection.
mod magic {
    pub const GGUF: &[u8; 4] = b"GGUF";
    /// Local file header of a zip archive
    pub const ZIP: &[u8; 4] = &[0x50, 0x4B, 0x03, 0x04];
    pub const PICKLE_PROTO: u8 = 0x80;
    pub const PICKLE_PROTO_MIN: u8 = 2;
    pub const PICKLE_PROTO_MAX: u8 = 5;
}

/// Read the first bytes of `path` and classify it.
pub fn sniff_format(path: &Path) -> Result<FileFormat> {
    let mut file = File::open(path).map_err(|e| ConvertError::io("opening model file", path, e))?;
    let mut header = [0u8; 16];
    let mut filled = 0;
    while filled < header.len() {
        let n = file
            .read(&mut header[filled..])
            .map_err(|e| ConvertError::io("reading file header", path, e))?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|s| s.to_lowercase())
        .unwrap_or_default();

    Ok(detect_format(&header[..filled], &extension))
}

/// Detect file format from magic bytes, falling back to the extension.
pub fn detect_format(header: &[u8], extension: &str) -> FileFormat {
    if header.len() >= 4 {
        if &header[..4] == magic::GGUF {
            return FileFormat::Gguf;
        }
        if &header[..4] == magic::ZIP {
            return FileFormat::TorchZip;
        }
    }

    if header.len() >= 2
        && header[0] == magic::PICKLE_PROTO
        && (magic::PICKLE_PROTO_MIN..=magic::PICKLE_PROTO_MAX).contains(&header[1])
    {
        return FileFormat::LegacyPickle;
    }

    // Safetensors: 8-byte little-endian header size followed by JSON starting with '{'
    if header.len() >= 9 {
        let mut size = [0u8; 8];
        size.copy_from_slice(&header[..8]);
        let header_size = u64::from_le_bytes(size);
        if header_size > 0
            && header_size < LoaderConfig::MAX_SAFETENSORS_HEADER
            && header[8] == b'{'
        {
            return FileFormat::Safetensors;
        }
    }

    match extension {
        "gguf" => FileFormat::Gguf,
        "safetensors" | "sft" => FileFormat::Safetensors,
        "ckpt" | "pt" | "pth" => FileFormat::TorchZip,
        _ => FileFormat::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_format_safetensors() {
        let json = b"{}";
        let mut header = (json.len() as u64).to_le_bytes().to_vec();
        header.extend_from_slice(json);
        assert_eq!(detect_format(&header, ""), FileFormat::Safetensors);
    }

    #[test]
    fn test_detect_format_gguf() {
        let mut header = vec![0u8; 16];
        header[..4].copy_from_slice(magic::GGUF);
        assert_eq!(detect_format(&header, "safetensors"), FileFormat::Gguf);
    }

    #[test]
    fn test_detect_format_zip() {
        let mut header = vec![0u8; 16];
        header[..4].copy_from_slice(magic::ZIP);
        assert_eq!(detect_format(&header, "ckpt"), FileFormat::TorchZip);
    }

    #[test]
    fn test_detect_format_legacy_pickle() {
        assert_eq!(detect_format(&[0x80, 0x02, b'}'], "ckpt"), FileFormat::LegacyPickle);
    }

    #[test]
    fn test_detect_format_extension_fallback() {
        let header = vec![0u8; 16];
        assert_eq!(detect_format(&header, "sft"), FileFormat::Safetensors);
        assert_eq!(detect_format(&header, "bin"), FileFormat::Unknown);
        assert_eq!(detect_format(&[], "gguf"), FileFormat::Gguf);
    }
}
