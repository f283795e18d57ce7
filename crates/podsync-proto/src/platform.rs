use std::path::PathBuf;

const APP_DIR: &str = "podsync";

/// Log file location. `~/.local/share/podsync` on unix.
pub fn data_dir() -> PathBuf {
    #[cfg(unix)]
    let base = dirs::home_dir().map(|home| home.join(".local").join("share"));
    #[cfg(not(unix))]
    let base = dirs::data_local_dir();

    base.unwrap_or_else(std::env::temp_dir).join(APP_DIR)
}

/// Holds `config.toml`. `~/.config/podsync` on unix.
pub fn config_dir() -> PathBuf {
    #[cfg(unix)]
    let base = dirs::home_dir().map(|home| home.join(".config"));
    #[cfg(not(unix))]
    let base = dirs::config_dir();

    base.unwrap_or_else(|| PathBuf::from(".")).join(APP_DIR)
}
