use std::path::PathBuf;

pub const DEFAULT_CONTROL_PORT: u16 = 4321;

pub fn data_dir() -> PathBuf {
    // On macOS and Linux, use ~/.local/share/hqp/ (XDG standard)
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".local")
            .join("share")
            .join("hqp")
    }
    #[cfg(windows)]
    {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("hqp")
    }
}

pub fn config_dir() -> PathBuf {
    // On macOS and Linux, always use ~/.config/hqp/
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join("hqp")
    }
    #[cfg(windows)]
    {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("hqp")
    }
}

pub fn log_file() -> PathBuf {
    data_dir().join("hqp.log")
}
