//! Per-family load scripts.
//!
//! Each orchestrator loads the sub-models of one architecture family into the
//! shared [`ModelLoader`], in a fixed order. Text encoders come first, then the
//! autoencoder, then the diffusion backbone; that order is also the tensor
//! order of the output file.

use super::params::ConvertParameters;
use crate::config::LayoutConfig;
use crate::detect::{ModelFamily, ModelVersion};
use crate::element_type::ElementType;
use crate::error::{ConvertError, Result};
use crate::loader::{LoadOutcome, ModelLoader};
use std::path::Path;
use tracing::{debug, info};

/// Loads every sub-model of one family.
pub type Orchestrator = fn(&ConvertParameters, ModelVersion, &mut ModelLoader) -> Result<()>;

/// Family dispatch table.
pub const FAMILY_ORCHESTRATORS: &[(ModelFamily, Orchestrator)] = &[
    (ModelFamily::Sd, load_sd),
    (ModelFamily::Sdxl, load_sdxl),
    (ModelFamily::Sd3, load_sd3),
    (ModelFamily::Flux, load_flux),
];

pub fn orchestrator_for(family: ModelFamily) -> Option<Orchestrator> {
    FAMILY_ORCHESTRATORS
        .iter()
        .find(|(f, _)| *f == family)
        .map(|(_, orchestrator)| *orchestrator)
}

/// One sub-model load.
struct SubModel<'a> {
    /// Used in log lines and errors
    label: &'static str,
    prefix: &'static str,
    subpath: &'a str,
    output_type: Option<ElementType>,
    /// Explicit file replacing the directory lookup
    explicit: Option<&'a Path>,
    /// Prefix for the explicit file, when it differs from `prefix`
    explicit_prefix: Option<&'static str>,
}

impl<'a> SubModel<'a> {
    fn new(
        label: &'static str,
        prefix: &'static str,
        subpath: &'a str,
        output_type: Option<ElementType>,
        explicit: Option<&'a Path>,
    ) -> Self {
        Self {
            label,
            prefix,
            subpath,
            output_type,
            explicit,
            explicit_prefix: None,
        }
    }

    fn with_explicit_prefix(mut self, prefix: &'static str) -> Self {
        self.explicit_prefix = Some(prefix);
        self
    }
}

/// Load one sub-model, from its explicit file or from the model directory.
///
/// A directory lookup that finds nothing is an error.
fn load_sub_model(loader: &mut ModelLoader, root: &Path, sub: SubModel<'_>) -> Result<()> {
    match sub.explicit {
        Some(path) => {
            let prefix = sub.explicit_prefix.unwrap_or(sub.prefix);
            if let Some(element_type) = sub.output_type {
                loader.set_group_output_type(prefix, element_type);
            }
            debug!("Loading {} from {}", sub.label, path.display());
            loader
                .load_from_single_file(path, prefix)
                .map(|_| ())
                .map_err(|e| e.in_sub_model(sub.label))
        }
        None => {
            let outcome = loader
                .load_from_subpath(root, sub.subpath, sub.output_type, sub.prefix)
                .map_err(|e| e.in_sub_model(sub.label))?;
            match outcome {
                LoadOutcome::Loaded(_) => Ok(()),
                LoadOutcome::Absent => Err(ConvertError::MissingSubModel {
                    sub_model: sub.label.to_string(),
                    root: root.to_path_buf(),
                    subpath: sub.subpath.to_string(),
                }),
            }
        }
    }
}

/// The autoencoder is skipped when an explicit backbone file is given
/// without an explicit autoencoder file.
fn load_vae(params: &ConvertParameters, loader: &mut ModelLoader) -> Result<()> {
    if params.diffusion_model_path.is_some() && params.vae_path.is_none() {
        info!("Explicit diffusion model given without --vae-model; skipping vae");
        return Ok(());
    }
    load_sub_model(
        loader,
        &params.model_path,
        SubModel::new(
            "vae",
            LayoutConfig::VAE_PREFIX,
            LayoutConfig::VAE_SUBPATH,
            params.vae_output_type,
            params.vae_path.as_deref(),
        ),
    )
}

fn clip_l(params: &ConvertParameters) -> SubModel<'_> {
    SubModel::new(
        "clip-l text encoder",
        LayoutConfig::CLIP_L_PREFIX,
        LayoutConfig::CLIP_L_SUBPATH,
        params.clip_l_output_type,
        params.clip_l_path.as_deref(),
    )
}

/// UNet backbone of the SD and SDXL families; explicit files keep their own names.
fn unet(params: &ConvertParameters) -> SubModel<'_> {
    SubModel::new(
        "unet",
        LayoutConfig::UNET_PREFIX,
        LayoutConfig::UNET_SUBPATH,
        Some(params.output_type),
        params.diffusion_model_path.as_deref(),
    )
    .with_explicit_prefix("")
}

pub fn load_sd(
    params: &ConvertParameters,
    _version: ModelVersion,
    loader: &mut ModelLoader,
) -> Result<()> {
    let root = params.model_path.as_path();
    load_sub_model(loader, root, clip_l(params))?;
    load_vae(params, loader)?;
    load_sub_model(loader, root, unet(params))
}

pub fn load_sdxl(
    params: &ConvertParameters,
    _version: ModelVersion,
    loader: &mut ModelLoader,
) -> Result<()> {
    let root = params.model_path.as_path();

    // The refiner ships without the clip-l encoder
    if params.clip_l_path.is_some() || root.join(LayoutConfig::TEXT_ENCODER_DIR).is_dir() {
        load_sub_model(loader, root, clip_l(params))?;
    } else {
        debug!("No {} directory; skipping clip-l", LayoutConfig::TEXT_ENCODER_DIR);
    }

    load_sub_model(
        loader,
        root,
        SubModel::new(
            "clip-g text encoder",
            LayoutConfig::SECOND_ENCODER_PREFIX,
            LayoutConfig::CLIP_G_SUBPATH,
            params.clip_g_output_type,
            params.clip_g_path.as_deref(),
        ),
    )?;
    load_vae(params, loader)?;
    load_sub_model(loader, root, unet(params))
}

pub fn load_sd3(
    params: &ConvertParameters,
    _version: ModelVersion,
    loader: &mut ModelLoader,
) -> Result<()> {
    let root = params.model_path.as_path();
    load_sub_model(loader, root, clip_l(params))?;
    load_sub_model(
        loader,
        root,
        SubModel::new(
            "clip-g text encoder",
            LayoutConfig::SECOND_ENCODER_PREFIX,
            LayoutConfig::CLIP_G_SUBPATH,
            params.clip_g_output_type,
            params.clip_g_path.as_deref(),
        ),
    )?;
    load_sub_model(
        loader,
        root,
        SubModel::new(
            "t5xxl text encoder",
            LayoutConfig::THIRD_ENCODER_PREFIX,
            LayoutConfig::SD3_T5XXL_SUBPATH,
            params.t5xxl_output_type,
            params.t5xxl_path.as_deref(),
        ),
    )?;
    load_vae(params, loader)?;
    load_sub_model(
        loader,
        root,
        SubModel::new(
            "transformer",
            LayoutConfig::TRANSFORMER_PREFIX,
            LayoutConfig::TRANSFORMER_SUBPATH,
            Some(params.output_type),
            params.diffusion_model_path.as_deref(),
        )
        .with_explicit_prefix(""),
    )
}

pub fn load_flux(
    params: &ConvertParameters,
    version: ModelVersion,
    loader: &mut ModelLoader,
) -> Result<()> {
    let root = params.model_path.as_path();
    load_sub_model(loader, root, clip_l(params))?;
    load_sub_model(
        loader,
        root,
        SubModel::new(
            "t5xxl text encoder",
            LayoutConfig::SECOND_ENCODER_PREFIX,
            LayoutConfig::FLUX_T5XXL_SUBPATH,
            params.t5xxl_output_type,
            params.t5xxl_path.as_deref(),
        ),
    )?;
    load_vae(params, loader)?;

    let backbone = match version {
        ModelVersion::FluxDev => LayoutConfig::FLUX_DEV_SUBPATH,
        _ => LayoutConfig::FLUX_SCHNELL_SUBPATH,
    };
    load_sub_model(
        loader,
        root,
        SubModel::new(
            "transformer",
            LayoutConfig::TRANSFORMER_PREFIX,
            backbone,
            Some(params.output_type),
            params.diffusion_model_path.as_deref(),
        )
        .with_explicit_prefix(LayoutConfig::FLUX_BACKBONE_FILE_PREFIX),
    )
}
