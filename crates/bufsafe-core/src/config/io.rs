//! Generic YAML configuration I/O

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Write;
use std::path::Path;

/// Load configuration from a YAML file, falling back to defaults
///
/// A missing file yields `T::default()`. An unreadable or invalid file is
/// logged and also yields the default.
///
/// ```ignore
/// let config: BufsafeConfig = load_config(&default_config_path());
/// ```
pub fn load_config<T>(path: &Path) -> T
where
    T: DeserializeOwned + Default,
{
    if !path.exists() {
        log::info!("load_config: {:?} doesn't exist, using defaults", path);
        return T::default();
    }

    match try_load_config(path) {
        Ok(config) => {
            log::info!("load_config: Loaded {:?}", path);
            config
        }
        Err(e) => {
            log::warn!("load_config: {:#}, using defaults", e);
            T::default()
        }
    }
}

/// Load configuration from a YAML file, failing on any problem
///
/// Used when the user named the file explicitly, where silently running with
/// defaults would hide a typo.
pub fn try_load_config<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned,
{
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {:?}", path))?;
    serde_yaml::from_str(&contents).with_context(|| format!("Failed to parse config file {:?}", path))
}

/// Save configuration to a YAML file
///
/// Creates parent directories as needed and writes through a temporary file
/// in the same directory, so readers never see a half-written config.
pub fn save_config<T>(config: &T, path: &Path) -> Result<()>
where
    T: Serialize,
{
    log::info!("save_config: Saving to {:?}", path);

    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)
        .with_context(|| format!("Failed to create config directory {:?}", parent))?;

    let yaml = serde_yaml::to_string(config).context("Failed to serialize config to YAML")?;

    let mut file = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("Failed to create temporary file in {:?}", parent))?;
    file.write_all(yaml.as_bytes())
        .context("Failed to write temporary config file")?;
    file.persist(path)
        .with_context(|| format!("Failed to replace config file {:?}", path))?;

    Ok(())
}
