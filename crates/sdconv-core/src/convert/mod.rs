//! Conversion pipeline.
//!
//! # Flow
//!
//! ```text
//! ConvertParameters
//!     │
//!     ├── model is a file ──────► load under "" ─────────────┐
//!     │                                                      │
//!     └── model is a directory ─► detect_version             │
//!                                   └─► family orchestrator  │
//!                                         (text encoders,    │
//!                                          vae, backbone)    │
//!                                                            ▼
//!                                                      write_gguf
//! ```

pub mod orchestrators;
pub mod params;

pub use orchestrators::{orchestrator_for, Orchestrator, FAMILY_ORCHESTRATORS};
pub use params::{default_output_path, ConvertParameters};

use crate::detect::{detect_version_with_evidence, ModelVersion};
use crate::error::{ConvertError, Result};
use crate::gguf::{write_gguf, WriteOptions, WriteSummary};
use crate::loader::ModelLoader;
use tracing::info;

/// Outcome of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertSummary {
    /// `None` for single-file input
    pub version: Option<ModelVersion>,
    pub output: WriteSummary,
}

fn write_options(params: &ConvertParameters, version: Option<ModelVersion>) -> WriteOptions {
    WriteOptions {
        default_type: params.output_type,
        name: params::model_stem(&params.model_path).map(str::to_string),
        model_version: version.map(|v| v.as_str().to_string()),
    }
}

/// Run one conversion. Nothing is written unless every load succeeds.
pub fn convert(params: &ConvertParameters) -> Result<ConvertSummary> {
    let model_path = &params.model_path;
    if !model_path.exists() {
        return Err(ConvertError::FileNotFound(model_path.clone()));
    }
    if !model_path.is_dir() {
        return convert_file(params);
    }

    let (version, evidence) = detect_version_with_evidence(model_path)?;
    info!("Detected {} ({:?})", version, evidence);

    let orchestrator =
        orchestrator_for(version.family()).ok_or_else(|| ConvertError::UnknownModelVersion {
            class_name: evidence.class_name.clone(),
        })?;
    let mut loader = ModelLoader::new();
    orchestrator(params, version, &mut loader)?;

    let output_path = params.resolved_output_path();
    let output = write_gguf(
        loader.registry(),
        &write_options(params, Some(version)),
        &output_path,
    )?;
    Ok(ConvertSummary {
        version: Some(version),
        output,
    })
}

/// Convert a single model file with the default type for every tensor.
pub fn convert_file(params: &ConvertParameters) -> Result<ConvertSummary> {
    let mut loader = ModelLoader::new();
    loader.load_from_single_file(&params.model_path, "")?;

    let output_path = params.resolved_output_path();
    let output = write_gguf(loader.registry(), &write_options(params, None), &output_path)?;
    Ok(ConvertSummary {
        version: None,
        output,
    })
}
