//! sd-convert - convert diffusion model checkpoints to GGUF.
//!
//! Accepts a single model file or a diffusers-style pipeline directory and
//! writes one GGUF container holding every sub-model.

mod cli;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use cli::{filter_unknown_flags, Cli};
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let (args, dropped) = filter_unknown_flags(std::env::args_os());

    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(err) => {
            // Help and version are "errors" that go to stdout
            let code = if err.use_stderr() { 1 } else { 0 };
            // Nothing left to report to if the terminal stream is closed
            err.print().ok();
            return ExitCode::from(code);
        }
    };

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();

    tracing::subscriber::with_default(subscriber, || {
        for flag in &dropped {
            warn!("Ignoring unknown option {}", flag);
        }
        for extra in &cli.ignored {
            warn!("Ignoring extra argument {}", extra);
        }

        match run(&cli) {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                error!("{:#}", err);
                ExitCode::from(1)
            }
        }
    })
}

fn run(cli: &Cli) -> Result<()> {
    sdconv_core::validate_token_table().map_err(|e| anyhow!(e))?;

    let params = cli.to_parameters();
    info!(
        "Converting {} (default type {})",
        params.model_path.display(),
        params.output_type
    );

    let summary = sdconv_core::convert(&params)
        .with_context(|| format!("Failed to convert {}", params.model_path.display()))?;

    match summary.version {
        Some(version) => info!(
            "Wrote {} model: {} tensors ({} converted) to {}",
            version,
            summary.output.tensor_count,
            summary.output.converted_count,
            summary.output.path.display()
        ),
        None => info!(
            "Wrote {} tensors ({} converted) to {}",
            summary.output.tensor_count,
            summary.output.converted_count,
            summary.output.path.display()
        ),
    }
    Ok(())
}
