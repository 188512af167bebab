//! Parameters of one conversion run.

use crate::config::{ContainerConfig, LayoutConfig};
use crate::element_type::ElementType;
use std::path::{Path, PathBuf};

/// Everything a conversion needs, built once by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvertParameters {
    /// Model file or diffusers-style directory
    pub model_path: PathBuf,
    pub diffusion_model_path: Option<PathBuf>,
    pub vae_path: Option<PathBuf>,
    pub clip_l_path: Option<PathBuf>,
    pub clip_g_path: Option<PathBuf>,
    pub t5xxl_path: Option<PathBuf>,
    /// `None` derives the name with [`default_output_path`]
    pub output_path: Option<PathBuf>,
    /// Default type; also used for groups without their own type
    pub output_type: ElementType,
    pub vae_output_type: Option<ElementType>,
    pub clip_l_output_type: Option<ElementType>,
    pub clip_g_output_type: Option<ElementType>,
    pub t5xxl_output_type: Option<ElementType>,
}

impl ConvertParameters {
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            diffusion_model_path: None,
            vae_path: None,
            clip_l_path: None,
            clip_g_path: None,
            t5xxl_path: None,
            output_path: None,
            output_type: ElementType::F16,
            vae_output_type: None,
            clip_l_output_type: None,
            clip_g_output_type: None,
            t5xxl_output_type: None,
        }
    }

    /// Where the container will be written.
    pub fn resolved_output_path(&self) -> PathBuf {
        self.output_path
            .clone()
            .unwrap_or_else(|| default_output_path(&self.model_path, self.output_type))
    }
}

/// `<stem>-<TYPE>.gguf` in the current directory.
///
/// The stem is the last path component with a known model extension removed;
/// a path without a last component gives `output`.
pub fn default_output_path(model_path: &Path, output_type: ElementType) -> PathBuf {
    let stem = model_stem(model_path).unwrap_or(ContainerConfig::DEFAULT_NAME);
    PathBuf::from(format!(
        "{}-{}.gguf",
        stem,
        output_type.name().to_uppercase()
    ))
}

/// Last path component without a known model extension.
pub fn model_stem(model_path: &Path) -> Option<&str> {
    model_path
        .file_name()
        .and_then(|n| n.to_str())
        .map(strip_model_extension)
}

fn strip_model_extension(name: &str) -> &str {
    match name.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty()
                && LayoutConfig::MODEL_EXTENSIONS
                    .iter()
                    .any(|known| known.eq_ignore_ascii_case(ext)) =>
        {
            stem
        }
        _ => name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_output_path() {
        assert_eq!(
            default_output_path(Path::new("foo/bar.safetensors"), ElementType::F16),
            PathBuf::from("bar-F16.gguf")
        );
        assert_eq!(
            default_output_path(Path::new("/models/sd-v1-5.ckpt"), ElementType::Q4_K),
            PathBuf::from("sd-v1-5-Q4_K.gguf")
        );
        assert_eq!(
            default_output_path(Path::new("models/flux.1-dev/"), ElementType::Q8_0),
            PathBuf::from("flux.1-dev-Q8_0.gguf")
        );
        assert_eq!(
            default_output_path(Path::new("/"), ElementType::F32),
            PathBuf::from("output-F32.gguf")
        );
    }

    #[test]
    fn test_explicit_output_path_wins() {
        let mut params = ConvertParameters::new("model.safetensors");
        assert_eq!(params.resolved_output_path(), PathBuf::from("model-F16.gguf"));
        params.output_path = Some(PathBuf::from("/tmp/x.gguf"));
        assert_eq!(params.resolved_output_path(), PathBuf::from("/tmp/x.gguf"));
    }
}
