//! Model version detection for diffusers-style directories.
//!
//! A pipeline directory carries a `model_index.json` whose `_class_name`
//! names the pipeline. Some families need one more config file to tell their
//! variants apart:
//!
//! | Pipeline class | Extra file | Field(s) |
//! |---|---|---|
//! | `StableDiffusion3Pipeline` | `transformer/config.json` | `num_layers`, `pos_embed_max_size` |
//! | `FluxPipeline` | `transformer/config.json` | `guidance_embeds`, `num_layers` |
//! | `StableDiffusionXLPipeline` | none | |
//! | `StableDiffusionXLImg2ImgPipeline` | none | |
//! | `StableDiffusionPipeline` | `text_encoder/config.json` | `hidden_size` |

use crate::config::LayoutConfig;
use crate::error::{ConvertError, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Diffusion architecture and variant.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelVersion {
    Sd1,
    Sd2,
    Sdxl,
    SdxlRefiner,
    Sd3_2B,
    Sd3_5_2B,
    Sd3_5_8B,
    FluxDev,
    FluxSchnell,
    FluxLite,
}

/// Architecture class shared by several versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelFamily {
    Sd,
    Sdxl,
    Sd3,
    Flux,
}

impl ModelVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelVersion::Sd1 => "SD1",
            ModelVersion::Sd2 => "SD2",
            ModelVersion::Sdxl => "SDXL",
            ModelVersion::SdxlRefiner => "SDXL-refiner",
            ModelVersion::Sd3_2B => "SD3-2B",
            ModelVersion::Sd3_5_2B => "SD3.5-2B",
            ModelVersion::Sd3_5_8B => "SD3.5-8B",
            ModelVersion::FluxDev => "Flux-dev",
            ModelVersion::FluxSchnell => "Flux-schnell",
            ModelVersion::FluxLite => "Flux-lite",
        }
    }

    pub fn family(&self) -> ModelFamily {
        match self {
            ModelVersion::Sd1 | ModelVersion::Sd2 => ModelFamily::Sd,
            ModelVersion::Sdxl | ModelVersion::SdxlRefiner => ModelFamily::Sdxl,
            ModelVersion::Sd3_2B | ModelVersion::Sd3_5_2B | ModelVersion::Sd3_5_8B => {
                ModelFamily::Sd3
            }
            ModelVersion::FluxDev | ModelVersion::FluxSchnell | ModelVersion::FluxLite => {
                ModelFamily::Flux
            }
        }
    }
}

impl fmt::Display for ModelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Values read from the pipeline's JSON files during classification.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectionEvidence {
    pub class_name: String,
    pub num_layers: Option<i64>,
    pub pos_embed_max_size: Option<i64>,
    pub guidance_embeds: Option<bool>,
    pub hidden_size: Option<i64>,
}

/// A parsed JSON config file that remembers where it came from.
struct ConfigFile {
    path: PathBuf,
    value: serde_json::Value,
}

impl ConfigFile {
    fn open(root: &Path, relative: &str) -> Result<Self> {
        let path = root.join(relative);
        if !path.is_file() {
            return Err(ConvertError::MissingConfig { path });
        }
        let contents =
            std::fs::read_to_string(&path).map_err(|e| ConvertError::io("reading config", &path, e))?;
        let value = serde_json::from_str(&contents).map_err(|e| ConvertError::Json {
            message: format!("Failed to parse {}: {}", path.display(), e),
            source: Some(e),
        })?;
        Ok(Self { path, value })
    }

    fn missing_field(&self, field: &str) -> ConvertError {
        ConvertError::MissingConfigField {
            path: self.path.clone(),
            field: field.to_string(),
        }
    }

    fn required_str(&self, field: &str) -> Result<String> {
        self.value
            .get(field)
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| self.missing_field(field))
    }

    fn required_i64(&self, field: &str) -> Result<i64> {
        self.value
            .get(field)
            .and_then(|v| v.as_i64())
            .ok_or_else(|| self.missing_field(field))
    }

    /// Absent is fine; present with a non-boolean value is an error.
    fn optional_bool(&self, field: &str) -> Result<Option<bool>> {
        match self.value.get(field) {
            None => Ok(None),
            Some(v) => v.as_bool().map(Some).ok_or_else(|| self.missing_field(field)),
        }
    }
}

/// Classify the pipeline directory at `root`.
pub fn detect_version(root: &Path) -> Result<ModelVersion> {
    let (version, evidence) = detect_version_with_evidence(root)?;
    debug!(?evidence, "Detected {} at {}", version, root.display());
    Ok(version)
}

/// Same as [`detect_version`], also returning the fields that decided it.
pub fn detect_version_with_evidence(root: &Path) -> Result<(ModelVersion, DetectionEvidence)> {
    let index = ConfigFile::open(root, LayoutConfig::MODEL_INDEX)?;
    let mut evidence = DetectionEvidence {
        class_name: index.required_str("_class_name")?,
        ..Default::default()
    };

    let version = match evidence.class_name.as_str() {
        "StableDiffusion3Pipeline" => {
            let transformer = ConfigFile::open(root, LayoutConfig::TRANSFORMER_CONFIG)?;
            let num_layers = transformer.required_i64("num_layers")?;
            evidence.num_layers = Some(num_layers);
            if num_layers == 38 {
                ModelVersion::Sd3_5_8B
            } else {
                let pos_embed_max_size = transformer.required_i64("pos_embed_max_size")?;
                evidence.pos_embed_max_size = Some(pos_embed_max_size);
                if pos_embed_max_size == 384 {
                    ModelVersion::Sd3_5_2B
                } else {
                    ModelVersion::Sd3_2B
                }
            }
        }
        "FluxPipeline" => {
            let transformer = ConfigFile::open(root, LayoutConfig::TRANSFORMER_CONFIG)?;
            evidence.guidance_embeds = transformer.optional_bool("guidance_embeds")?;
            if evidence.guidance_embeds == Some(true) {
                let num_layers = transformer.required_i64("num_layers")?;
                evidence.num_layers = Some(num_layers);
                if num_layers == 8 {
                    ModelVersion::FluxLite
                } else {
                    ModelVersion::FluxDev
                }
            } else {
                ModelVersion::FluxSchnell
            }
        }
        "StableDiffusionXLPipeline" => ModelVersion::Sdxl,
        "StableDiffusionXLImg2ImgPipeline" => ModelVersion::SdxlRefiner,
        "StableDiffusionPipeline" => {
            let text_encoder = ConfigFile::open(root, LayoutConfig::TEXT_ENCODER_CONFIG)?;
            let hidden_size = text_encoder.required_i64("hidden_size")?;
            evidence.hidden_size = Some(hidden_size);
            if hidden_size == 1024 {
                ModelVersion::Sd2
            } else {
                ModelVersion::Sd1
            }
        }
        other => {
            return Err(ConvertError::UnknownModelVersion {
                class_name: other.to_string(),
            })
        }
    };

    Ok((version, evidence))
}
