use std::fs;
use std::path::PathBuf;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("error while reading TOML config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("error while deserializing TOML: {0}")]
    Deserialize(#[from] toml::de::Error),
}

#[derive(Debug, Deserialize)]
pub struct RawConfig {
    #[serde(default = "default_sys_root")]
    sys_root: String,
    #[serde(default = "default_recv_buf_size")]
    recv_buf_size: usize,
    #[serde(default)]
    bus_name: Option<String>,
}

fn default_sys_root() -> String {
    device::record::DEFAULT_SYS_ROOT.to_string()
}

/// 16 MiB, per the route-netlink socket's `SO_RCVBUFFORCE` (§6).
fn default_recv_buf_size() -> usize {
    16 * 1024 * 1024
}

#[derive(Debug, Clone)]
pub struct Config {
    pub sys_root: String,
    pub recv_buf_size: usize,
    pub bus_name: String,
}

impl TryFrom<RawConfig> for Config {
    type Error = ConfigError;

    fn try_from(value: RawConfig) -> Result<Self, Self::Error> {
        Ok(Self {
            sys_root: value.sys_root,
            recv_buf_size: value.recv_buf_size,
            bus_name: value.bus_name.unwrap_or_else(|| "org.freedesktop.device1".to_string()),
        })
    }
}

impl Config {
    pub fn from_file(path: PathBuf) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        let raw: RawConfig = toml::from_str(&raw)?;
        Self::try_from(raw)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sys_root: default_sys_root(),
            recv_buf_size: default_recv_buf_size(),
            bus_name: "org.freedesktop.device1".to_string(),
        }
    }
}
