//! Command-line arguments.

use clap::{CommandFactory, Parser};
use sdconv_core::{ConvertParameters, ElementType, OUTPUT_TOKENS};
use std::ffi::OsString;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "sd-convert", version)]
#[command(about = "Convert diffusion model checkpoints to GGUF")]
#[command(after_help = type_help())]
pub struct Cli {
    /// Model file or diffusers-style model directory
    #[arg(value_name = "MODEL")]
    pub model: PathBuf,

    /// Diffusion backbone file, replacing the one in MODEL
    #[arg(long, value_name = "PATH", allow_hyphen_values = true)]
    pub diffusion_model: Option<PathBuf>,

    /// Autoencoder file, replacing the one in MODEL
    #[arg(long, value_name = "PATH", allow_hyphen_values = true)]
    pub vae_model: Option<PathBuf>,

    #[arg(long, value_name = "PATH", allow_hyphen_values = true)]
    pub clip_l_model: Option<PathBuf>,

    #[arg(long, value_name = "PATH", allow_hyphen_values = true)]
    pub clip_g_model: Option<PathBuf>,

    #[arg(long, value_name = "PATH", allow_hyphen_values = true)]
    pub t5xxl_model: Option<PathBuf>,

    /// Output file [default: <MODEL stem>-<TYPE>.gguf]
    #[arg(long, value_name = "PATH", allow_hyphen_values = true)]
    pub outfile: Option<PathBuf>,

    /// Default output type
    #[arg(long, value_name = "TYPE", default_value = "fp16", value_parser = parse_outtype)]
    pub outtype: ElementType,

    /// Autoencoder output type [default: --outtype]
    #[arg(long, value_name = "TYPE", value_parser = parse_outtype)]
    pub vae_outtype: Option<ElementType>,

    #[arg(long, value_name = "TYPE", value_parser = parse_outtype)]
    pub clip_l_outtype: Option<ElementType>,

    #[arg(long, value_name = "TYPE", value_parser = parse_outtype)]
    pub clip_g_outtype: Option<ElementType>,

    #[arg(long, value_name = "TYPE", value_parser = parse_outtype)]
    pub t5xxl_outtype: Option<ElementType>,

    /// Enable debug logging (RUST_LOG takes precedence)
    #[arg(short, long)]
    pub verbose: bool,

    /// Extra positional arguments; reported and ignored
    #[arg(hide = true)]
    pub ignored: Vec<String>,
}

impl Cli {
    pub fn to_parameters(&self) -> ConvertParameters {
        let mut params = ConvertParameters::new(&self.model);
        params.diffusion_model_path = self.diffusion_model.clone();
        params.vae_path = self.vae_model.clone();
        params.clip_l_path = self.clip_l_model.clone();
        params.clip_g_path = self.clip_g_model.clone();
        params.t5xxl_path = self.t5xxl_model.clone();
        params.output_path = self.outfile.clone();
        params.output_type = self.outtype;
        params.vae_output_type = self.vae_outtype;
        params.clip_l_output_type = self.clip_l_outtype;
        params.clip_g_output_type = self.clip_g_outtype;
        params.t5xxl_output_type = self.t5xxl_outtype;
        params
    }
}

fn token_list() -> String {
    let tokens: Vec<&str> = OUTPUT_TOKENS.iter().map(|(token, _)| *token).collect();
    tokens.join(", ")
}

fn type_help() -> String {
    format!("Output types: {}", token_list())
}

fn parse_outtype(token: &str) -> Result<ElementType, String> {
    ElementType::from_token(token)
        .ok_or_else(|| format!("unknown output type (expected one of: {})", token_list()))
}

/// Drop flags the parser does not know, returning the kept arguments and the
/// dropped ones.
///
/// The first element is the program name and is always kept. Values of known
/// flags are kept even when they start with `-`; everything after `--` is
/// positional.
pub fn filter_unknown_flags<I>(args: I) -> (Vec<OsString>, Vec<String>)
where
    I: IntoIterator<Item = OsString>,
{
    let mut command = Cli::command();
    command.build();

    let mut long_flags: Vec<(String, bool)> = Vec::new();
    let mut short_flags: Vec<(char, bool)> = Vec::new();
    for arg in command.get_arguments() {
        let takes_value = arg.get_action().takes_values();
        if let Some(long) = arg.get_long() {
            long_flags.push((long.to_string(), takes_value));
        }
        if let Some(short) = arg.get_short() {
            short_flags.push((short, takes_value));
        }
    }

    let mut kept = Vec::new();
    let mut dropped = Vec::new();
    let mut args = args.into_iter();
    kept.extend(args.next());

    let mut expecting_value = false;
    let mut positional_only = false;
    for arg in args {
        if expecting_value || positional_only {
            expecting_value = false;
            kept.push(arg);
            continue;
        }
        let Some(text) = arg.to_str() else {
            kept.push(arg);
            continue;
        };

        if text == "--" {
            positional_only = true;
            kept.push(arg);
        } else if let Some(long) = text.strip_prefix("--") {
            let (name, inline_value) = match long.split_once('=') {
                Some((name, _)) => (name, true),
                None => (long, false),
            };
            match long_flags.iter().find(|(known, _)| known == name) {
                Some((_, takes_value)) => {
                    expecting_value = *takes_value && !inline_value;
                    kept.push(arg);
                }
                None => dropped.push(text.to_string()),
            }
        } else if let Some(cluster) = text.strip_prefix('-').filter(|c| !c.is_empty()) {
            // Only whole clusters of known short flags survive
            let mut chars = cluster.chars();
            let first = chars.next().and_then(|c| short_flags.iter().find(|(s, _)| *s == c));
            match first {
                Some((_, true)) => {
                    expecting_value = chars.as_str().is_empty();
                    kept.push(arg);
                }
                Some((_, false))
                    if chars.all(|c| short_flags.iter().any(|(s, v)| *s == c && !v)) =>
                {
                    kept.push(arg);
                }
                _ => dropped.push(text.to_string()),
            }
        } else {
            kept.push(arg);
        }
    }
    (kept, dropped)
}
