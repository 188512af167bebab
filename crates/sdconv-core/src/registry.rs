//! Merged tensor registry.
//!
//! Every sub-model load inserts its tensors under a prefix. The registry keeps
//! insertion order (which becomes the write order of the container) and
//! rejects a whole batch if any of its fully-qualified names is already taken.

use crate::element_type::ElementType;
use crate::error::{ConvertError, Result};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Where a tensor's payload lives on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorSource {
    /// File holding the payload; shared by every tensor from that file
    pub path: Arc<PathBuf>,
    /// Absolute byte offset of the first payload byte
    pub offset: u64,
    /// Payload length in bytes
    pub len: u64,
}

/// A tensor as produced by a format reader, before prefixing.
#[derive(Debug, Clone)]
pub struct RawTensor {
    pub name: String,
    /// Dimensions, innermost first
    pub shape: Vec<u64>,
    pub element_type: ElementType,
    pub source: TensorSource,
}

/// A registered tensor.
#[derive(Debug, Clone)]
pub struct TensorDescriptor {
    /// Name inside its source file
    pub name: String,
    /// Prefix + name; unique within the registry
    pub full_name: String,
    /// Dimensions, innermost first
    pub shape: Vec<u64>,
    pub element_type: ElementType,
    pub source: TensorSource,
    /// Output type of the group this tensor was inserted under, if one was set
    pub group_type: Option<ElementType>,
}

impl TensorDescriptor {
    pub fn n_elements(&self) -> u64 {
        self.shape.iter().product()
    }

    pub fn source_path(&self) -> &Path {
        self.source.path.as_path()
    }
}

/// Insertion-ordered map from fully-qualified name to descriptor.
#[derive(Debug, Default)]
pub struct TensorRegistry {
    tensors: Vec<TensorDescriptor>,
    index: HashMap<String, usize>,
    group_types: HashMap<String, ElementType>,
}

impl TensorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the output type for tensors inserted under `prefix` from now on.
    pub fn set_group_output_type(&mut self, prefix: &str, element_type: ElementType) {
        self.group_types.insert(prefix.to_string(), element_type);
    }

    pub fn group_output_type(&self, prefix: &str) -> Option<ElementType> {
        self.group_types.get(prefix).copied()
    }

    /// Insert every tensor of one load under `prefix`.
    ///
    /// Either all tensors are inserted or, on a name collision (against the
    /// registry or inside the batch), none are.
    pub fn insert_batch(&mut self, prefix: &str, batch: Vec<RawTensor>) -> Result<usize> {
        let mut seen = HashSet::with_capacity(batch.len());
        for tensor in &batch {
            let full_name = format!("{prefix}{}", tensor.name);
            if self.index.contains_key(&full_name) || !seen.insert(full_name.clone()) {
                return Err(ConvertError::NameCollision { name: full_name });
            }
        }

        let group_type = self.group_output_type(prefix);
        let count = batch.len();
        self.tensors.reserve(count);
        for tensor in batch {
            let full_name = format!("{prefix}{}", tensor.name);
            self.index.insert(full_name.clone(), self.tensors.len());
            self.tensors.push(TensorDescriptor {
                name: tensor.name,
                full_name,
                shape: tensor.shape,
                element_type: tensor.element_type,
                source: tensor.source,
                group_type,
            });
        }
        Ok(count)
    }

    pub fn get(&self, full_name: &str) -> Option<&TensorDescriptor> {
        self.index.get(full_name).map(|&i| &self.tensors[i])
    }

    pub fn contains(&self, full_name: &str) -> bool {
        self.index.contains_key(full_name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TensorDescriptor> {
        self.tensors.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.iter().map(|t| t.full_name.as_str())
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(name: &str) -> RawTensor {
        RawTensor {
            name: name.to_string(),
            shape: vec![4, 2],
            element_type: ElementType::F32,
            source: TensorSource {
                path: Arc::new(PathBuf::from("/models/a.safetensors")),
                offset: 0,
                len: 32,
            },
        }
    }

    #[test]
    fn test_distinct_prefixes_never_collide() {
        let mut registry = TensorRegistry::new();
        for prefix in ["te.", "te1.", "te2.", "vae.", "transformer."] {
            registry
                .insert_batch(prefix, vec![raw("weight"), raw("bias")])
                .unwrap();
        }
        assert_eq!(registry.len(), 10);
        assert!(registry.contains("te1.weight"));
        assert_eq!(registry.get("vae.bias").unwrap().name, "bias");
    }

    #[test]
    fn test_same_prefix_overlap_fails_without_partial_insert() {
        let mut registry = TensorRegistry::new();
        registry.insert_batch("unet.", vec![raw("a"), raw("b")]).unwrap();

        let err = registry
            .insert_batch("unet.", vec![raw("c"), raw("b")])
            .unwrap_err();
        assert!(matches!(err, ConvertError::NameCollision { ref name } if name == "unet.b"));
        assert_eq!(registry.len(), 2);
        assert!(!registry.contains("unet.c"));
    }

    #[test]
    fn test_collision_inside_one_batch() {
        let mut registry = TensorRegistry::new();
        let err = registry
            .insert_batch("", vec![raw("x"), raw("x")])
            .unwrap_err();
        assert!(matches!(err, ConvertError::NameCollision { .. }));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_insertion_order_is_kept() {
        let mut registry = TensorRegistry::new();
        registry.insert_batch("b.", vec![raw("z"), raw("a")]).unwrap();
        registry.insert_batch("a.", vec![raw("m")]).unwrap();
        let names: Vec<&str> = registry.names().collect();
        assert_eq!(names, vec!["b.z", "b.a", "a.m"]);
    }

    #[test]
    fn test_group_type_applies_to_later_inserts() {
        let mut registry = TensorRegistry::new();
        registry.insert_batch("vae.", vec![raw("early")]).unwrap();
        registry.set_group_output_type("vae.", ElementType::Q8_0);
        registry.insert_batch("vae.", vec![raw("late")]).unwrap();
        registry.insert_batch("unet.", vec![raw("w")]).unwrap();

        assert_eq!(registry.get("vae.early").unwrap().group_type, None);
        assert_eq!(
            registry.get("vae.late").unwrap().group_type,
            Some(ElementType::Q8_0)
        );
        assert_eq!(registry.get("unet.w").unwrap().group_type, None);
        assert_eq!(registry.get("unet.w").unwrap().n_elements(), 8);
    }
}
