//! Standard locations for hearamp files

use std::path::PathBuf;

const APP_DIR: &str = "hearamp";

/// Per-user configuration directory
///
/// Returns: `<config_dir>/hearamp` (e.g. `~/.config/hearamp` on Linux),
/// or `./hearamp` when the platform has no config directory.
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

/// Default path of a file inside [`config_dir`]
pub fn default_config_path(filename: &str) -> PathBuf {
    config_dir().join(filename)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_dir_ends_with_app_name() {
        assert!(config_dir().ends_with("hearamp"));
    }

    #[test]
    fn test_config_path_includes_filename() {
        let path = default_config_path("config.yaml");
        assert!(path.ends_with("hearamp/config.yaml"));
    }
}
