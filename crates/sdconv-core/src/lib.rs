//! sdconv core - diffusion model checkpoints to GGUF.
//!
//! This crate holds everything the `sd-convert` binary does, usable without
//! the command line: version detection for diffusers-style directories, tensor
//! loading from safetensors, PyTorch zip checkpoints and GGUF files, per-group
//! quantization, and a streaming GGUF writer.
//!
//! # Example
//!
//! ```rust,no_run
//! use sdconv_core::{convert, ConvertParameters, ElementType};
//!
//! fn main() -> sdconv_core::Result<()> {
//!     let mut params = ConvertParameters::new("/models/stable-diffusion-v1-5");
//!     params.output_type = ElementType::Q8_0;
//!     params.vae_output_type = Some(ElementType::F16);
//!
//!     let summary = convert(&params)?;
//!     println!(
//!         "Wrote {} tensors to {}",
//!         summary.output.tensor_count,
//!         summary.output.path.display()
//!     );
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod convert;
pub mod detect;
pub mod element_type;
pub mod error;
pub mod gguf;
pub mod loader;
pub mod quant;
pub mod registry;

// Re-export commonly used types
pub use config::{ContainerConfig, LayoutConfig, LoaderConfig};
pub use convert::{convert, convert_file, default_output_path, ConvertParameters, ConvertSummary};
pub use detect::{detect_version, DetectionEvidence, ModelFamily, ModelVersion};
pub use element_type::{validate_token_table, ElementType, OUTPUT_TOKENS};
pub use error::{ConvertError, ErrorKind, Result};
pub use gguf::{read_gguf, write_gguf, GgufFile, WriteOptions, WriteSummary};
pub use loader::{LoadOutcome, ModelLoader};
pub use quant::convert_tensor_data;
pub use registry::{TensorDescriptor, TensorRegistry};
