//! Default locations for bufsafe configuration files

use std::path::PathBuf;

/// Name of the config file inside the config directory
pub const CONFIG_FILE_NAME: &str = "bufsafe.yaml";

/// Per-user config directory
///
/// Returns: `~/.config/bufsafe` on Linux (platform equivalent elsewhere),
/// or `./bufsafe` if no config directory is known
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("bufsafe")
}

/// Returns: `<config dir>/bufsafe/bufsafe.yaml`
pub fn default_config_path() -> PathBuf {
    default_config_dir().join(CONFIG_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_path_layout() {
        let path = default_config_path();
        assert!(path.ends_with("bufsafe/bufsafe.yaml"));
    }
}
