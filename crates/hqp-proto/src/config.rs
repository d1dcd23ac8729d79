use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::platform;
use crate::error::ControlError;
use crate::status::{VolumeBounds, VolumeDb};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub hqplayer: HqplayerConfig,
    #[serde(default)]
    pub profiles: ProfilesConfig,
    #[serde(default)]
    pub switch: SwitchConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

/// Control port of the HQPlayer daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HqplayerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_control_port")]
    pub port: u16,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Reuse one connection across calls instead of reconnecting each time.
    #[serde(default)]
    pub keep_alive: bool,
    #[serde(default = "default_volume_min")]
    pub volume_min: f64,
    #[serde(default = "default_volume_max")]
    pub volume_max: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileMode {
    Ssh,
    Local,
}

/// Where profile files live and how they get activated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfilesConfig {
    #[serde(default = "default_profile_mode")]
    pub mode: ProfileMode,
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    #[serde(default)]
    pub ssh_key_path: Option<PathBuf>,
    /// Active configuration file read by the daemon on startup.
    #[serde(default = "default_config_path")]
    pub config_path: PathBuf,
    #[serde(default = "default_profiles_path")]
    pub profiles_path: PathBuf,
    #[serde(default = "default_restart_command")]
    pub restart_command: String,
    #[serde(default = "default_exec_timeout_ms")]
    pub exec_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchConfig {
    #[serde(default = "default_wait_budget_ms")]
    pub wait_budget_ms: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
}

impl Default for HqplayerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_control_port(),
            timeout_ms: default_timeout_ms(),
            keep_alive: false,
            volume_min: default_volume_min(),
            volume_max: default_volume_max(),
        }
    }
}

impl HqplayerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn volume_bounds(&self) -> Result<VolumeBounds, ControlError> {
        let db = |value: f64, key: &str| {
            VolumeDb::from_f64(value)
                .ok_or_else(|| ControlError::invalid_argument(format!("invalid {key} {value}")))
        };
        VolumeBounds::new(
            db(self.volume_min, "volume_min")?,
            db(self.volume_max, "volume_max")?,
        )
    }
}

impl Default for ProfilesConfig {
    fn default() -> Self {
        Self {
            mode: default_profile_mode(),
            ssh_user: default_ssh_user(),
            ssh_key_path: None,
            config_path: default_config_path(),
            profiles_path: default_profiles_path(),
            restart_command: default_restart_command(),
            exec_timeout_ms: default_exec_timeout_ms(),
        }
    }
}

impl ProfilesConfig {
    pub fn exec_timeout(&self) -> Duration {
        Duration::from_millis(self.exec_timeout_ms)
    }
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            wait_budget_ms: default_wait_budget_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            max_poll_interval_ms: default_max_poll_interval_ms(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_http_port(),
        }
    }
}

impl HttpConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_control_port() -> u16 {
    platform::DEFAULT_CONTROL_PORT
}

fn default_timeout_ms() -> u64 {
    3000
}

fn default_volume_min() -> f64 {
    -40.0
}

fn default_volume_max() -> f64 {
    0.0
}

fn default_profile_mode() -> ProfileMode {
    ProfileMode::Ssh
}

fn default_ssh_user() -> String {
    "hqplayer".to_string()
}

fn default_config_path() -> PathBuf {
    PathBuf::from("/etc/hqplayer/hqplayerd.xml")
}

fn default_profiles_path() -> PathBuf {
    PathBuf::from("/var/lib/hqplayer/home/cfgs")
}

fn default_restart_command() -> String {
    "sudo systemctl restart hqplayerd".to_string()
}

fn default_exec_timeout_ms() -> u64 {
    15_000
}

fn default_wait_budget_ms() -> u64 {
    30_000
}

fn default_probe_timeout_ms() -> u64 {
    500
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_max_poll_interval_ms() -> u64 {
    1000
}

// The control protocol has no authentication; never bind publicly by default.
fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_http_port() -> u16 {
    9100
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load from `path`, writing a default file there first if none exists.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            let config = Self::default();
            config.save_to(path)?;
            tracing::info!("wrote default config to {}", path.display());
            return Ok(config);
        }

        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.hqplayer.address(), "localhost:4321");
        assert_eq!(config.hqplayer.timeout(), Duration::from_millis(3000));
        assert!(!config.hqplayer.keep_alive);
        assert_eq!(config.profiles.mode, ProfileMode::Ssh);
        assert_eq!(config.switch.wait_budget_ms, 30_000);
        assert_eq!(config.http.bind_address, "127.0.0.1");
        let bounds = config.hqplayer.volume_bounds().unwrap();
        assert_eq!(bounds, VolumeBounds::default());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [hqplayer]
            host = "10.0.0.5"
            volume_min = -60

            [profiles]
            mode = "local"
            "#,
        )
        .unwrap();
        assert_eq!(config.hqplayer.address(), "10.0.0.5:4321");
        assert_eq!(
            config.hqplayer.volume_bounds().unwrap().min,
            VolumeDb::from_db(-60)
        );
        assert_eq!(config.profiles.mode, ProfileMode::Local);
        assert_eq!(config.profiles.restart_command, "sudo systemctl restart hqplayerd");
        assert_eq!(config.switch.probe_timeout_ms, 500);
    }

    #[test]
    fn test_load_writes_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.http.port, 9100);

        std::fs::write(&path, "[http]\nport = 9200\n").unwrap();
        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.http.port, 9200);
        assert_eq!(config.hqplayer.port, 4321);
    }

    #[test]
    fn test_inverted_bounds_rejected() {
        let config = HqplayerConfig {
            volume_min: 0.0,
            volume_max: -10.0,
            ..Default::default()
        };
        assert!(config.volume_bounds().is_err());
    }
}
