//! Tempfile helpers for configuration tests

use std::path::PathBuf;

use anyhow::Context;
use memforge::MemoryConfig;

pub fn create_temp_dir() -> anyhow::Result<tempfile::TempDir> {
    tempfile::tempdir().context("Failed to create temporary directory for test")
}

/// Write `json` to `memory.json` inside `dir`
pub fn write_config_json(dir: &tempfile::TempDir, json: &str) -> anyhow::Result<PathBuf> {
    let path = dir.path().join("memory.json");
    std::fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

/// Serialize `config` into `dir` and return the file path
pub fn write_config(dir: &tempfile::TempDir, config: &MemoryConfig) -> anyhow::Result<PathBuf> {
    let json = config.to_json_pretty()?;
    write_config_json(dir, &json)
}
