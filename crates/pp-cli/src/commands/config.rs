//! `pty-proxy config`

use std::path::Path;

use anyhow::{Context, Result};

use pp_core::config::{default_config_path, save_config};
use pp_core::ProxyConfig;

use crate::output::print_info;

/// Print the effective configuration as TOML
pub fn config_show(config: &ProxyConfig) -> Result<()> {
    let rendered = toml::to_string_pretty(config).context("Failed to render config")?;
    println!("{}", rendered.trim_end());
    Ok(())
}

/// Print the default configuration file path
pub fn config_path() {
    println!("{}", default_config_path().display());
}

/// Write a default configuration file
pub fn config_init(path: Option<&Path>, force: bool) -> Result<()> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }

    save_config(&path, &ProxyConfig::default())
        .with_context(|| format!("Failed to write {}", path.display()))?;
    print_info(&format!("Wrote {}", path.display()));
    Ok(())
}

