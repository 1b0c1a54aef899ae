//! Subcommand handlers.
//!
//! Every handler loads the configuration the same way: `--config` file (or
//! defaults), then environment overrides, then its own flags, then
//! validation.

pub mod index;
pub mod pretrain;
pub mod retrieve;
pub mod train;

use std::path::PathBuf;

use anyhow::{Context, Result};
use candle_core::Device;
use tracing::info;
use xlmr_colbert::ColbertConfig;

/// Flags shared by every subcommand.
pub struct GlobalArgs {
    pub config: Option<PathBuf>,
    pub gpu: bool,
}

impl GlobalArgs {
    /// File (or defaults) plus `COLBERT_*` overrides. Not validated yet.
    pub fn load_config(&self) -> Result<ColbertConfig> {
        let config = match &self.config {
            Some(path) => ColbertConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => ColbertConfig::default(),
        };
        Ok(config.with_env_overrides())
    }

    pub fn device(&self) -> Result<Device> {
        let device = if self.gpu {
            Device::cuda_if_available(0).context("selecting CUDA device")?
        } else {
            Device::Cpu
        };
        info!(?device, "Using device");
        Ok(device)
    }
}

/// Validate and write the effective configuration next to the run output.
pub fn finalize_config(config: ColbertConfig, output_dir: &std::path::Path) -> Result<ColbertConfig> {
    config.validate().context("invalid configuration")?;
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("creating {}", output_dir.display()))?;
    let path = output_dir.join("config.toml");
    std::fs::write(&path, config.to_toml_string()?)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(config)
}
