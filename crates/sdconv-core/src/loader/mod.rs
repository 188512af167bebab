//! Tensor loading.
//!
//! Turns model files into registry entries without reading tensor payloads.
//! Each load produces a batch that is inserted under a prefix in one step, so
//! a failed load leaves the registry unchanged.
//!
//! # Sub-model resolution
//!
//! ```text
//! <root>/<subpath>.safetensors
//! <root>/<subpath>.safetensors.index.json   -> shards named in weight_map
//! <root>/<stem>-NNNNN-of-NNNNN.safetensors  -> complete shard set
//! <root>/<subpath>.fp16.safetensors
//! <root>/<subpath>/*.safetensors
//! ```
//!
//! The first that exists wins. If none does the load is [`LoadOutcome::Absent`].

pub mod checkpoint;
pub mod format;
pub mod pickle;
pub mod safetensors;
pub mod sharding;

use crate::element_type::ElementType;
use crate::error::{ConvertError, Result};
use crate::gguf::read_gguf;
use crate::registry::{RawTensor, TensorRegistry, TensorSource};
use format::{sniff_format, FileFormat};
use sharding::ShardIndex;
use std::collections::HashSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Result of a directory sub-model load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Number of tensors inserted
    Loaded(usize),
    /// Nothing at the subpath
    Absent,
}

/// Where a subpath resolved to.
#[derive(Debug)]
enum SubpathSource {
    File(PathBuf),
    Indexed { index_path: PathBuf, index: ShardIndex },
    Shards(Vec<PathBuf>),
    Directory(Vec<PathBuf>),
}

impl SubpathSource {
    fn files(&self) -> Vec<PathBuf> {
        match self {
            SubpathSource::File(path) => vec![path.clone()],
            SubpathSource::Indexed { index_path, index } => index.shard_paths(index_path),
            SubpathSource::Shards(paths) | SubpathSource::Directory(paths) => paths.clone(),
        }
    }
}

/// Loads tensors from model files into one [`TensorRegistry`].
#[derive(Debug, Default)]
pub struct ModelLoader {
    registry: TensorRegistry,
}

impl ModelLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(&self) -> &TensorRegistry {
        &self.registry
    }

    pub fn into_registry(self) -> TensorRegistry {
        self.registry
    }

    /// Record the output type for tensors inserted under `prefix` afterward.
    pub fn set_group_output_type(&mut self, prefix: &str, element_type: ElementType) {
        debug!("Output type for '{}' tensors: {}", prefix, element_type);
        self.registry.set_group_output_type(prefix, element_type);
    }

    /// Load every tensor of one model file under `prefix`.
    pub fn load_from_single_file(&mut self, path: &Path, prefix: &str) -> Result<usize> {
        if !path.exists() {
            return Err(ConvertError::FileNotFound(path.to_path_buf()));
        }
        if path.is_dir() {
            return Err(ConvertError::UnsupportedFormat {
                path: path.to_path_buf(),
                reason: "expected a model file, found a directory".to_string(),
            });
        }

        let tensors = read_tensors(path)?;
        let count = self.registry.insert_batch(prefix, tensors)?;
        info!("Loaded {} tensors from {} as '{}'", count, path.display(), prefix);
        Ok(count)
    }

    /// Resolve `subpath` under `root` and load what it names under `prefix`.
    ///
    /// `target_type`, when given, becomes the group output type of `prefix`
    /// before anything is inserted.
    pub fn load_from_subpath(
        &mut self,
        root: &Path,
        subpath: &str,
        target_type: Option<ElementType>,
        prefix: &str,
    ) -> Result<LoadOutcome> {
        if let Some(element_type) = target_type {
            self.set_group_output_type(prefix, element_type);
        }

        let base = root.join(subpath);
        let Some(source) = resolve_subpath(&base)? else {
            debug!("Nothing found for {}", base.display());
            return Ok(LoadOutcome::Absent);
        };
        debug!("Resolved {} to {:?}", base.display(), source);

        let files = source.files();
        let mut batch = Vec::new();
        for file in &files {
            if !file.is_file() {
                return Err(ConvertError::FileNotFound(file.clone()));
            }
            batch.extend(read_tensors(file)?);
        }

        if let SubpathSource::Indexed { index_path, index } = &source {
            let loaded: HashSet<&str> = batch.iter().map(|t| t.name.as_str()).collect();
            let missing = index.missing_from(&loaded);
            if let Some(first) = missing.first() {
                return Err(ConvertError::corrupt(
                    index_path,
                    format!(
                        "{} indexed tensors are not in any shard (first: '{}')",
                        missing.len(),
                        first
                    ),
                ));
            }
        }

        let count = self.registry.insert_batch(prefix, batch)?;
        info!(
            "Loaded {} tensors from {} file(s) at {} as '{}'",
            count,
            files.len(),
            base.display(),
            prefix
        );
        Ok(LoadOutcome::Loaded(count))
    }
}

/// `base` with `suffix` appended to its last component.
fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(base.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

fn resolve_subpath(base: &Path) -> Result<Option<SubpathSource>> {
    let single = with_suffix(base, ".safetensors");
    if single.is_file() {
        return Ok(Some(SubpathSource::File(single)));
    }

    let index_path = with_suffix(base, ".safetensors.index.json");
    if index_path.is_file() {
        let index = ShardIndex::read(&index_path)?;
        return Ok(Some(SubpathSource::Indexed { index_path, index }));
    }

    if let (Some(dir), Some(stem)) = (base.parent(), base.file_name().and_then(|s| s.to_str())) {
        let shards = sharding::find_shards(dir, stem)?;
        if !shards.is_empty() {
            let validation = sharding::validate_shard_completeness(&shards);
            if !validation.is_complete {
                return Err(ConvertError::IncompleteShards {
                    path: base.to_path_buf(),
                    total: validation.total_shards,
                    found: validation.found_shards,
                    missing: validation.missing_shards,
                    reason: validation.error,
                });
            }
            return Ok(Some(SubpathSource::Shards(shards)));
        }
    }

    let fp16 = with_suffix(base, ".fp16.safetensors");
    if fp16.is_file() {
        return Ok(Some(SubpathSource::File(fp16)));
    }

    if base.is_dir() {
        let files = safetensors_in_dir(base)?;
        if !files.is_empty() {
            return Ok(Some(SubpathSource::Directory(files)));
        }
    }

    Ok(None)
}

fn safetensors_in_dir(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| ConvertError::Io {
            message: format!("Failed to list {}: {}", dir.display(), e),
            path: Some(dir.to_path_buf()),
            source: e.into_io_error(),
        })?;
        let is_safetensors = entry.path().extension().is_some_and(|ext| ext == "safetensors");
        if entry.file_type().is_file() && is_safetensors {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

/// Read the tensor table of one file, whatever its format.
pub fn read_tensors(path: &Path) -> Result<Vec<RawTensor>> {
    let format = sniff_format(path)?;
    debug!("{} looks like {}", path.display(), format.as_str());
    match format {
        FileFormat::Safetensors => safetensors::read_safetensors(path),
        FileFormat::TorchZip => checkpoint::read_torch_zip(path),
        FileFormat::Gguf => read_gguf_tensors(path),
        FileFormat::LegacyPickle => Err(ConvertError::UnsupportedFormat {
            path: path.to_path_buf(),
            reason: "pre-zip pickle checkpoints are not supported".to_string(),
        }),
        FileFormat::Unknown => Err(ConvertError::UnsupportedFormat {
            path: path.to_path_buf(),
            reason: "unrecognized file format".to_string(),
        }),
    }
}

fn read_gguf_tensors(path: &Path) -> Result<Vec<RawTensor>> {
    let gguf = read_gguf(path)?;
    let shared_path = Arc::new(path.to_path_buf());
    gguf.tensors
        .iter()
        .map(|info| {
            let len = info.byte_size().ok_or_else(|| {
                ConvertError::corrupt(path, format!("tensor '{}' has a partial block", info.name))
            })?;
            Ok(RawTensor {
                name: info.name.clone(),
                shape: info.dims.clone(),
                element_type: info.element_type,
                source: TensorSource {
                    path: Arc::clone(&shared_path),
                    offset: gguf.data_offset + info.offset,
                    len,
                },
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::safetensors::tests::safetensors_bytes;
    use tempfile::TempDir;

    const SHAPE: &[u64] = &[2];

    fn write_model(path: &Path, names: &[&str]) {
        let data = [0u8; 8];
        let entries: Vec<(&str, &str, &[u64], &[u8])> = names
            .iter()
            .map(|&n| (n, "F32", SHAPE, &data[..]))
            .collect();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, safetensors_bytes(&entries)).unwrap();
    }

    fn names(loader: &ModelLoader) -> Vec<String> {
        loader.registry().names().map(str::to_string).collect()
    }

    #[test]
    fn test_single_file_under_prefix() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.safetensors");
        write_model(&path, &["b", "a"]);

        let mut loader = ModelLoader::new();
        assert_eq!(loader.load_from_single_file(&path, "unet.").unwrap(), 2);
        assert_eq!(names(&loader), vec!["unet.a", "unet.b"]);
    }

    #[test]
    fn test_single_file_missing_or_directory() {
        let dir = TempDir::new().unwrap();
        let mut loader = ModelLoader::new();
        assert!(matches!(
            loader.load_from_single_file(&dir.path().join("nope.safetensors"), ""),
            Err(ConvertError::FileNotFound(_))
        ));
        assert!(matches!(
            loader.load_from_single_file(dir.path(), ""),
            Err(ConvertError::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn test_plain_safetensors_wins() {
        let dir = TempDir::new().unwrap();
        write_model(&dir.path().join("vae/model.safetensors"), &["plain"]);
        write_model(&dir.path().join("vae/model.fp16.safetensors"), &["half"]);

        let mut loader = ModelLoader::new();
        let outcome = loader
            .load_from_subpath(dir.path(), "vae/model", Some(ElementType::F32), "vae.")
            .unwrap();
        assert_eq!(outcome, LoadOutcome::Loaded(1));
        assert_eq!(names(&loader), vec!["vae.plain"]);
        assert_eq!(
            loader.registry().get("vae.plain").unwrap().group_type,
            Some(ElementType::F32)
        );
    }

    #[test]
    fn test_fp16_variant_fallback() {
        let dir = TempDir::new().unwrap();
        write_model(&dir.path().join("vae/model.fp16.safetensors"), &["half"]);
        let mut loader = ModelLoader::new();
        assert_eq!(
            loader.load_from_subpath(dir.path(), "vae/model", None, "vae.").unwrap(),
            LoadOutcome::Loaded(1)
        );
    }

    #[test]
    fn test_index_loads_all_shards() {
        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("transformer");
        write_model(&sub.join("model-00001-of-00002.safetensors"), &["a", "b"]);
        write_model(&sub.join("model-00002-of-00002.safetensors"), &["c"]);
        std::fs::write(
            sub.join("model.safetensors.index.json"),
            r#"{"weight_map": {
                "a": "model-00001-of-00002.safetensors",
                "b": "model-00001-of-00002.safetensors",
                "c": "model-00002-of-00002.safetensors"
            }}"#,
        )
        .unwrap();

        let mut loader = ModelLoader::new();
        let outcome = loader
            .load_from_subpath(dir.path(), "transformer/model", None, "transformer.")
            .unwrap();
        assert_eq!(outcome, LoadOutcome::Loaded(3));
        assert!(loader.registry().contains("transformer.c"));
    }

    #[test]
    fn test_index_with_missing_shard_fails() {
        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("unet");
        write_model(&sub.join("m-00001-of-00002.safetensors"), &["a"]);
        std::fs::write(
            sub.join("m.safetensors.index.json"),
            r#"{"weight_map": {"a": "m-00001-of-00002.safetensors", "b": "m-00002-of-00002.safetensors"}}"#,
        )
        .unwrap();

        let mut loader = ModelLoader::new();
        let err = loader.load_from_subpath(dir.path(), "unet/m", None, "unet.").unwrap_err();
        assert!(matches!(err, ConvertError::FileNotFound(_)));
        assert!(loader.registry().is_empty());
    }

    #[test]
    fn test_shards_without_index() {
        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("unet");
        write_model(&sub.join("m-00002-of-00002.safetensors"), &["z"]);
        write_model(&sub.join("m-00001-of-00002.safetensors"), &["y"]);

        let mut loader = ModelLoader::new();
        loader.load_from_subpath(dir.path(), "unet/m", None, "unet.").unwrap();
        assert_eq!(names(&loader), vec!["unet.y", "unet.z"]);
    }

    #[test]
    fn test_incomplete_shards_fail() {
        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("unet");
        write_model(&sub.join("m-00001-of-00003.safetensors"), &["a"]);
        write_model(&sub.join("m-00003-of-00003.safetensors"), &["c"]);

        let mut loader = ModelLoader::new();
        let err = loader.load_from_subpath(dir.path(), "unet/m", None, "unet.").unwrap_err();
        match &err {
            ConvertError::IncompleteShards {
                total,
                found,
                missing,
                ..
            } => {
                assert_eq!(*total, 3);
                assert_eq!(found, &[1, 3]);
                assert_eq!(missing, &[2]);
            }
            other => panic!("expected IncompleteShards, got {other:?}"),
        }
        assert!(err.to_string().contains("missing shards [2]"), "{err}");
    }

    #[test]
    fn test_directory_scan_sorted() {
        let dir = TempDir::new().unwrap();
        write_model(&dir.path().join("text_encoder/model/b.safetensors"), &["from_b"]);
        write_model(&dir.path().join("text_encoder/model/a.safetensors"), &["from_a"]);
        std::fs::write(dir.path().join("text_encoder/model/notes.txt"), "x").unwrap();

        let mut loader = ModelLoader::new();
        loader
            .load_from_subpath(dir.path(), "text_encoder/model", None, "te.")
            .unwrap();
        assert_eq!(names(&loader), vec!["te.from_a", "te.from_b"]);
    }

    #[test]
    fn test_absent_subpath() {
        let dir = TempDir::new().unwrap();
        let mut loader = ModelLoader::new();
        assert_eq!(
            loader.load_from_subpath(dir.path(), "vae/model", None, "vae.").unwrap(),
            LoadOutcome::Absent
        );
    }

    #[test]
    fn test_failed_subpath_load_inserts_nothing() {
        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("te");
        write_model(&sub.join("a.safetensors"), &["ok"]);
        std::fs::write(sub.join("b.safetensors"), b"not a model at all").unwrap();

        let mut loader = ModelLoader::new();
        assert!(loader.load_from_subpath(dir.path(), "te", None, "te.").is_err());
        assert!(loader.registry().is_empty());
    }

    #[test]
    fn test_gguf_input_offsets() {
        use crate::gguf::{write_gguf, WriteOptions};

        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src.safetensors");
        let values: Vec<u8> = [1.0f32, 2.0].iter().flat_map(|v| v.to_le_bytes()).collect();
        std::fs::write(&src, safetensors_bytes(&[("x.bias", "F32", &[2], &values)])).unwrap();

        let mut first = ModelLoader::new();
        first.load_from_single_file(&src, "").unwrap();
        let gguf_path = dir.path().join("model.gguf");
        write_gguf(first.registry(), &WriteOptions::new(ElementType::F16), &gguf_path).unwrap();

        let mut second = ModelLoader::new();
        second.load_from_single_file(&gguf_path, "").unwrap();
        let tensor = second.registry().get("x.bias").unwrap();
        assert_eq!(tensor.element_type, ElementType::F32);
        let raw = std::fs::read(&gguf_path).unwrap();
        let start = tensor.source.offset as usize;
        assert_eq!(&raw[start..start + 8], values.as_slice());
    }
}
