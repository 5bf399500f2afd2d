//! First-run initialization: create the configuration directory and a default
//! config file.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::config::Config;

/// Create the config directory and write a default `config.json` when missing.
/// Returns the configuration directory. An existing config file is left
/// untouched.
pub fn init_config_dir(config_path: &Path) -> Result<PathBuf> {
    let dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("creating config directory {}", dir.display()))?;
    if !config_path.exists() {
        let defaults = serde_json::to_string_pretty(&Config::default())
            .context("serializing default config")?;
        std::fs::write(config_path, defaults)
            .with_context(|| format!("writing default config to {}", config_path.display()))?;
        log::info!("wrote default config to {}", config_path.display());
    }
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_default_config_once() {
        let dir = std::env::temp_dir().join(format!("cabline-init-test-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let config_path = dir.join("config.json");

        init_config_dir(&config_path).unwrap();
        let written = std::fs::read_to_string(&config_path).unwrap();
        let parsed: Config = serde_json::from_str(&written).unwrap();
        assert_eq!(parsed.connection.max_attempts, 5);

        // Re-running must not clobber an edited file.
        std::fs::write(&config_path, r#"{"backend":{"baseUrl":"http://edited:1"}}"#).unwrap();
        init_config_dir(&config_path).unwrap();
        let kept = std::fs::read_to_string(&config_path).unwrap();
        assert!(kept.contains("edited"));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
