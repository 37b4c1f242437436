use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

const DEFAULT_CONFIG_PATH: &str = "/etc/scrutiny/server.toml";
const ENV_CONFIG_PATH: &str = "SCRUTINY_CONFIG";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub link: LinkConfig,
    #[serde(default)]
    pub comm: CommConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub device: DeviceDefaultsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            link: LinkConfig::default(),
            comm: CommConfig::default(),
            dispatcher: DispatcherConfig::default(),
            device: DeviceDefaultsConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file. The path can be overridden with the
    /// `SCRUTINY_CONFIG` environment variable. A missing file yields defaults;
    /// an explicit path passed by the caller that fails to read or parse is an
    /// error, since that's a mistake the caller can act on immediately.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let path = match explicit_path {
            Some(p) => p.to_path_buf(),
            None => match std::env::var(ENV_CONFIG_PATH) {
                Ok(p) => PathBuf::from(p),
                Err(_) => PathBuf::from(DEFAULT_CONFIG_PATH),
            },
        };

        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(source) => {
                if explicit_path.is_some() {
                    return Err(Error::ConfigRead { path, source });
                }
                return Ok(Config::default());
            }
        };

        toml::from_str(&contents).map_err(|source| Error::ConfigParse { path, source })
    }
}

/// How the core reaches the target. This enum is the data contract the core
/// accepts; `crate::link` supplies reference implementations for a subset of
/// variants, with Serial/Rtt drivers left for a deployment to provide.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LinkConfig {
    None,
    Serial {
        port: String,
        #[serde(default = "default_baudrate")]
        baudrate: u32,
        #[serde(default = "default_stopbits")]
        stopbits: u8,
        #[serde(default = "default_databits")]
        databits: u8,
        #[serde(default)]
        parity: Parity,
        #[serde(default)]
        start_delay_sec: f64,
    },
    Udp {
        host: String,
        port: u16,
    },
    Tcp {
        host: String,
        port: u16,
    },
    Rtt {
        target_device: String,
        jlink_interface: JlinkInterface,
    },
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig::None
    }
}

fn default_baudrate() -> u32 {
    115_200
}
fn default_stopbits() -> u8 {
    1
}
fn default_databits() -> u8 {
    8
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JlinkInterface {
    Swd,
    Jtag,
    Icsp,
    Fine,
    Spi,
    C2,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CommConfig {
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    #[serde(default)]
    pub throttling_enabled: bool,
    #[serde(default = "default_max_bitrate")]
    pub max_bitrate_bps: u32,
}

impl Default for CommConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: default_response_timeout_ms(),
            throttling_enabled: false,
            max_bitrate_bps: default_max_bitrate(),
        }
    }
}

impl CommConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

fn default_response_timeout_ms() -> u64 {
    1_000
}
fn default_max_bitrate() -> u32 {
    100_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct DispatcherConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
        }
    }
}

fn default_queue_capacity() -> usize {
    256
}

/// Defaults used before the target's own `GetCommParams` response is known.
#[derive(Debug, Deserialize, Clone)]
pub struct DeviceDefaultsConfig {
    #[serde(default = "default_address_size_bits")]
    pub address_size_bits: u8,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

impl Default for DeviceDefaultsConfig {
    fn default() -> Self {
        Self {
            address_size_bits: default_address_size_bits(),
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

impl DeviceDefaultsConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

fn default_address_size_bits() -> u8 {
    32
}
fn default_tick_interval_ms() -> u64 {
    10
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn defaults_when_file_missing() {
        let cfg = Config::load(Some(Path::new("/nonexistent/scrutiny.toml")));
        assert!(matches!(cfg, Err(Error::ConfigRead { .. })));
    }

    #[test]
    fn env_override_missing_falls_back_to_default() {
        unsafe {
            std::env::remove_var(ENV_CONFIG_PATH);
        }
        let cfg = Config::load(None).unwrap();
        assert_eq!(cfg.device.address_size_bits, 32);
        assert!(matches!(cfg.link, LinkConfig::None));
    }

    #[test]
    fn parse_tcp_link() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[link]
kind = "tcp"
host = "127.0.0.1"
port = 8765

[comm]
response_timeout_ms = 500
throttling_enabled = true
max_bitrate_bps = 5000
"#
        )
        .unwrap();
        let cfg = Config::load(Some(file.path())).unwrap();
        assert_eq!(
            cfg.link,
            LinkConfig::Tcp {
                host: "127.0.0.1".to_string(),
                port: 8765
            }
        );
        assert_eq!(cfg.comm.response_timeout_ms, 500);
        assert!(cfg.comm.throttling_enabled);
        assert_eq!(cfg.comm.max_bitrate_bps, 5000);
    }
}
