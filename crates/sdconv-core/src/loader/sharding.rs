//! Sharded safetensors detection and validation.
//!
//! Large sub-models are often split into `model-00001-of-00003.safetensors`
//! style shards, optionally with a `model.safetensors.index.json` whose
//! `weight_map` names the shard holding each tensor.

use crate::error::{ConvertError, Result};
use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Result of shard completeness validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardValidation {
    /// Whether the shard set is complete
    pub is_complete: bool,
    /// Total number of expected shards (from filename pattern)
    pub total_shards: usize,
    /// Indices of shards that were found
    pub found_shards: Vec<usize>,
    /// Indices of shards that are missing
    pub missing_shards: Vec<usize>,
    /// Why the set is incomplete; empty when complete
    pub error: String,
}

/// `model-00001-of-00005.safetensors`
/// Captures: (base_name, shard_index, total_count)
static SHARD_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.+)-(\d+)-of-(\d+)\.safetensors$").expect("shard pattern is a valid regex")
});

/// Extract `(base_name, shard_index, total_count)` from a shard file name.
pub fn extract_shard_info(filename: &str) -> Option<(String, usize, usize)> {
    let caps = SHARD_PATTERN.captures(filename)?;
    let index: usize = caps[2].parse().ok()?;
    let total: usize = caps[3].parse().ok()?;
    Some((caps[1].to_string(), index, total))
}

/// Find the shards of `stem` inside `dir`, sorted by file name.
///
/// Returns an empty list when the directory holds no shard of that stem.
pub fn find_shards(dir: &Path, stem: &str) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut shards = Vec::new();
    for entry in walkdir::WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| ConvertError::Io {
            message: format!("Failed to list {}: {}", dir.display(), e),
            path: Some(dir.to_path_buf()),
            source: e.into_io_error(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(filename) = entry.file_name().to_str() else {
            continue;
        };
        if matches!(extract_shard_info(filename), Some((base, _, _)) if base == stem) {
            shards.push(entry.into_path());
        }
    }

    shards.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(shards)
}

/// Validate that a sharded set is complete.
///
/// Shards are 1-indexed; every file must agree on the total count.
pub fn validate_shard_completeness(shard_files: &[PathBuf]) -> ShardValidation {
    let mut found: BTreeSet<usize> = BTreeSet::new();
    let mut expected_total: Option<usize> = None;

    for file_path in shard_files {
        let Some((_, index, total)) = file_path
            .file_name()
            .and_then(|s| s.to_str())
            .and_then(extract_shard_info)
        else {
            continue;
        };

        match expected_total {
            None => expected_total = Some(total),
            Some(existing) if existing != total => {
                return ShardValidation {
                    is_complete: false,
                    total_shards: existing,
                    found_shards: found.into_iter().collect(),
                    missing_shards: Vec::new(),
                    error: "Inconsistent shard counts in filenames".to_string(),
                };
            }
            _ => {}
        }
        found.insert(index);
    }

    let Some(total) = expected_total else {
        return ShardValidation {
            is_complete: false,
            total_shards: 0,
            found_shards: Vec::new(),
            missing_shards: Vec::new(),
            error: "No shard files".to_string(),
        };
    };

    let missing: Vec<usize> = (1..=total).filter(|i| !found.contains(i)).collect();
    let out_of_range = found.iter().any(|&i| i == 0 || i > total);

    let error = if out_of_range {
        "Shard index outside 1..=total".to_string()
    } else if !missing.is_empty() {
        format!("missing shards {missing:?}")
    } else {
        String::new()
    };

    ShardValidation {
        is_complete: error.is_empty(),
        total_shards: total,
        found_shards: found.into_iter().collect(),
        missing_shards: missing,
        error,
    }
}

/// `*.safetensors.index.json`
#[derive(Debug, Deserialize)]
pub struct ShardIndex {
    /// Tensor name to shard file name
    pub weight_map: BTreeMap<String, String>,
}

impl ShardIndex {
    pub fn read(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConvertError::io("reading shard index", path, e))?;
        serde_json::from_str(&contents).map_err(|e| ConvertError::Json {
            message: format!("Failed to parse {}: {}", path.display(), e),
            source: Some(e),
        })
    }

    /// Distinct shard files, sorted, resolved next to the index.
    pub fn shard_paths(&self, index_path: &Path) -> Vec<PathBuf> {
        let dir = index_path.parent().unwrap_or_else(|| Path::new("."));
        let names: BTreeSet<&str> = self.weight_map.values().map(String::as_str).collect();
        names.into_iter().map(|name| dir.join(name)).collect()
    }

    /// Tensor names listed in the index but absent from `loaded`.
    pub fn missing_from<'a>(&'a self, loaded: &HashSet<&str>) -> Vec<&'a str> {
        self.weight_map
            .keys()
            .map(String::as_str)
            .filter(|name| !loaded.contains(name))
            .collect()
    }
}
