use std::path::Path;

use anyhow::{Context, Result};
use config::{Config as ConfigSource, Environment, File};
use tracing::info;
use uptermd_common::config::{Config, ConfigStore};

use crate::cli::Cli;

pub fn load_config(path: &Path) -> Result<Config> {
    let mut builder = ConfigSource::builder();
    if path.exists() {
        builder = builder.add_source(File::with_name(&path.to_string_lossy()));
    }
    let store: ConfigStore = builder
        .add_source(Environment::with_prefix("UPTERMD").separator("__"))
        .build()
        .context("loading configuration")?
        .try_deserialize()
        .context("parsing configuration")?;

    let paths_relative_to = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| Path::new(".").to_path_buf());

    info!(path = %path.display(), "loaded configuration");
    Ok(Config {
        store,
        paths_relative_to,
    })
}

pub fn apply_cli_overrides(mut config: Config, cli: &Cli) -> Config {
    if let Some(format) = cli.log_format {
        config.store.log_format = format;
    }
    config
}
