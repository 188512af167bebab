//! Centralized configuration for sdconv.
//!
//! The converter has no configuration file. Everything that would otherwise be
//! a magic number lives here: container constants, the diffusers folder
//! layout, and sanity limits applied while parsing untrusted headers.

/// GGUF container constants.
pub struct ContainerConfig;

impl ContainerConfig {
    /// "GGUF" read as a little-endian u32.
    pub const MAGIC: u32 = 0x4655_4747;
    pub const VERSION: u32 = 3;
    pub const ALIGNMENT: u64 = 32;
    pub const QUANTIZATION_VERSION: u32 = 2;
    pub const ARCHITECTURE: &'static str = "stable-diffusion";
    pub const DEFAULT_NAME: &'static str = "output";
}

/// Diffusers-style directory layout.
pub struct LayoutConfig;

impl LayoutConfig {
    pub const MODEL_INDEX: &'static str = "model_index.json";
    pub const TRANSFORMER_CONFIG: &'static str = "transformer/config.json";
    pub const TEXT_ENCODER_CONFIG: &'static str = "text_encoder/config.json";
    pub const TEXT_ENCODER_DIR: &'static str = "text_encoder";

    // Sub-model locations relative to the model root
    pub const CLIP_L_SUBPATH: &'static str = "text_encoder/model";
    pub const CLIP_G_SUBPATH: &'static str = "text_encoder_2/model";
    pub const SD3_T5XXL_SUBPATH: &'static str = "text_encoder_3/model";
    pub const FLUX_T5XXL_SUBPATH: &'static str = "text_encoder_2/model";
    pub const VAE_SUBPATH: &'static str = "vae/diffusion_pytorch_model";
    pub const UNET_SUBPATH: &'static str = "unet/diffusion_pytorch_model";
    pub const TRANSFORMER_SUBPATH: &'static str = "transformer/diffusion_pytorch_model";
    pub const FLUX_DEV_SUBPATH: &'static str = "flux1-dev";
    pub const FLUX_SCHNELL_SUBPATH: &'static str = "flux1-schnell";

    // Tensor name prefixes
    pub const CLIP_L_PREFIX: &'static str = "te.";
    pub const SECOND_ENCODER_PREFIX: &'static str = "te1.";
    pub const THIRD_ENCODER_PREFIX: &'static str = "te2.";
    pub const VAE_PREFIX: &'static str = "vae.";
    pub const UNET_PREFIX: &'static str = "unet.";
    pub const TRANSFORMER_PREFIX: &'static str = "transformer.";
    pub const FLUX_BACKBONE_FILE_PREFIX: &'static str = "model.diffusion_model.";

    /// Extensions stripped when deriving the default output file name.
    pub const MODEL_EXTENSIONS: &'static [&'static str] =
        &["safetensors", "sft", "ckpt", "pt", "pth", "bin", "gguf"];
}

/// Limits applied while parsing file headers.
pub struct LoaderConfig;

impl LoaderConfig {
    pub const MAX_SAFETENSORS_HEADER: u64 = 100 * 1024 * 1024; // 100MB
    pub const MAX_GGUF_STRING: u64 = 16 * 1024 * 1024;
    pub const MAX_TENSOR_COUNT: u64 = 1_000_000;
    pub const MAX_METADATA_COUNT: u64 = 100_000;
    pub const MAX_DIMS: u32 = 4;
    pub const MAX_PICKLE_BYTES: u64 = 512 * 1024 * 1024;
    pub const MAX_NESTING_DEPTH: usize = 16;
}
