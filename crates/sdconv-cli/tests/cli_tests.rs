//! Integration tests for the `sd-convert` binary.

use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

fn sd_convert(args: &[&str], cwd: &Path) -> Output {
    Command::new(env!("CARGO_BIN_EXE_sd-convert"))
        .args(args)
        .current_dir(cwd)
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to run sd-convert")
}

/// One F32 tensor `weight` of shape [2, 32].
fn write_model(path: &Path) {
    let values: Vec<u8> = (0..64)
        .flat_map(|i| (i as f32 / 64.0).to_le_bytes())
        .collect();
    let header = serde_json::json!({
        "weight": {"dtype": "F32", "shape": [2, 32], "data_offsets": [0, values.len()]}
    });
    let header = serde_json::to_vec(&header).unwrap();
    let mut bytes = (header.len() as u64).to_le_bytes().to_vec();
    bytes.extend_from_slice(&header);
    bytes.extend_from_slice(&values);
    std::fs::write(path, bytes).unwrap();
}

#[test]
fn test_help_exits_zero() {
    let dir = TempDir::new().unwrap();
    let output = sd_convert(&["--help"], dir.path());
    assert_eq!(output.status.code(), Some(0));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("--outtype"));
    assert!(stdout.contains("q4_k"));
}

#[test]
fn test_version_exits_zero() {
    let dir = TempDir::new().unwrap();
    let output = sd_convert(&["--version"], dir.path());
    assert_eq!(output.status.code(), Some(0));
    assert!(String::from_utf8_lossy(&output.stdout).contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_missing_model_is_usage_error() {
    let dir = TempDir::new().unwrap();
    let output = sd_convert(&[], dir.path());
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Usage"));
}

#[test]
fn test_invalid_outtype_names_the_flag() {
    let dir = TempDir::new().unwrap();
    let output = sd_convert(&["model.safetensors", "--vae-outtype", "q6_k"], dir.path());
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("--vae-outtype"), "{stderr}");
    assert!(stderr.contains("q6_k"), "{stderr}");
}

#[test]
fn test_nonexistent_model_fails() {
    let dir = TempDir::new().unwrap();
    let output = sd_convert(&["does-not-exist.safetensors"], dir.path());
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("does-not-exist.safetensors"));
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn test_converts_with_default_output_name() {
    let dir = TempDir::new().unwrap();
    write_model(&dir.path().join("tiny.safetensors"));

    let output = sd_convert(&["tiny.safetensors", "--outtype", "q8_0"], dir.path());
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let written = std::fs::read(dir.path().join("tiny-Q8_0.gguf")).unwrap();
    assert_eq!(&written[..4], b"GGUF");
}

#[test]
fn test_unknown_flags_and_extra_arguments_are_not_fatal() {
    let dir = TempDir::new().unwrap();
    write_model(&dir.path().join("tiny.safetensors"));

    let output = sd_convert(
        &["tiny.safetensors", "--threads", "extra", "--outfile", "out.gguf", "-v"],
        dir.path(),
    );
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("--threads"), "{stderr}");
    assert!(stderr.contains("extra"), "{stderr}");
    assert!(dir.path().join("out.gguf").is_file());
}
