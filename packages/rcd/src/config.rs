use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::device::DevicePaths;

/// Default plain-text port (ASCII "RC").
pub const DEFAULT_PORT: u16 = 0x5243;

// =============================================================================
// File config (figment-deserialized from defaults / rcd.toml / env vars)
// =============================================================================
//
//   rcd.toml:   [compression]
//               dictionary = "/lib/minstrel-rcd/dictionary.zdict"
//
//   env var:    RCD_COMPRESSION__DICTIONARY=/lib/minstrel-rcd/dictionary.zdict
//
// Double underscore nests into a section; single underscores stay in the
// field name (RCD_SERVER__COMPRESSED_PORT).

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub compression: CompressionFileConfig,
    #[serde(default)]
    pub devices: DevicesFileConfig,
    #[serde(default)]
    pub monitor: MonitorFileConfig,
}

/// Primary listeners (`[server]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_hosts")]
    pub hosts: Vec<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Defaults to `port + 1`.
    #[serde(default)]
    pub compressed_port: Option<u16>,
    /// Outbound messages queued per subscriber before it is dropped.
    #[serde(default = "default_send_queue")]
    pub send_queue: usize,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            hosts: default_hosts(),
            port: default_port(),
            compressed_port: None,
            send_queue: default_send_queue(),
        }
    }
}

/// Compressed stream settings (`[compression]`). Without a dictionary the
/// compressed port is not opened.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompressionFileConfig {
    #[serde(default)]
    pub dictionary: Option<PathBuf>,
    #[serde(default = "default_level")]
    pub level: i32,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for CompressionFileConfig {
    fn default() -> Self {
        Self {
            dictionary: None,
            level: default_level(),
            buffer_size: default_buffer_size(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

/// Where devices are found (`[devices]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DevicesFileConfig {
    #[serde(default = "default_class_dir")]
    pub class_dir: PathBuf,
    #[serde(default = "default_debugfs_dir")]
    pub debugfs_dir: PathBuf,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for DevicesFileConfig {
    fn default() -> Self {
        Self {
            class_dir: default_class_dir(),
            debugfs_dir: default_debugfs_dir(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Monitoring sessions (`[monitor]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MonitorFileConfig {
    #[serde(default = "default_monitor_bind")]
    pub bind: String,
}

impl Default for MonitorFileConfig {
    fn default() -> Self {
        Self {
            bind: default_monitor_bind(),
        }
    }
}

fn default_hosts() -> Vec<String> {
    vec!["0.0.0.0".to_string()]
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_send_queue() -> usize {
    1024
}
fn default_level() -> i32 {
    stream_codec::DEFAULT_LEVEL
}
fn default_buffer_size() -> usize {
    stream_codec::DEFAULT_CAPACITY
}
fn default_timeout_ms() -> u64 {
    stream_codec::DEFAULT_TIMEOUT.as_millis() as u64
}
fn default_class_dir() -> PathBuf {
    PathBuf::from("/sys/class/ieee80211")
}
fn default_debugfs_dir() -> PathBuf {
    PathBuf::from("/sys/kernel/debug/ieee80211")
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_monitor_bind() -> String {
    "0.0.0.0".to_string()
}

/// Build a figment that layers: defaults → `config_file` → RCD_* env vars.
///
/// A missing config file is not an error.
pub fn load_config(config_file: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_file))
        .merge(Env::prefixed("RCD_").split("__"))
}

// =============================================================================
// Runtime config (validated view of FileConfig)
// =============================================================================

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub server: ServerConfig,
    pub compression: CompressionConfig,
    pub devices: DevicesConfig,
    pub monitor: MonitorConfig,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub hosts: Vec<IpAddr>,
    pub port: u16,
    pub compressed_port: u16,
    pub send_queue: usize,
}

#[derive(Clone, Debug)]
pub struct CompressionConfig {
    pub dictionary: Option<PathBuf>,
    pub level: i32,
    pub buffer_size: usize,
    pub timeout: Duration,
}

impl CompressionConfig {
    pub fn enabled(&self) -> bool {
        self.dictionary.is_some()
    }
}

#[derive(Clone, Debug)]
pub struct DevicesConfig {
    pub paths: DevicePaths,
    pub poll_interval: Duration,
}

#[derive(Clone, Debug)]
pub struct MonitorConfig {
    pub bind: IpAddr,
}

impl DaemonConfig {
    pub fn from_file(fc: &FileConfig) -> Result<Self> {
        let hosts = fc
            .server
            .hosts
            .iter()
            .map(|h| h.parse::<IpAddr>().with_context(|| format!("invalid listen address {h:?}")))
            .collect::<Result<Vec<IpAddr>>>()?;
        if hosts.is_empty() {
            anyhow::bail!("no listen addresses configured");
        }
        if fc.compression.buffer_size == 0 {
            anyhow::bail!("compression.buffer_size must be greater than zero");
        }

        let bind: IpAddr = fc
            .monitor
            .bind
            .parse()
            .with_context(|| format!("invalid monitor bind address {:?}", fc.monitor.bind))?;

        Ok(Self {
            server: ServerConfig {
                hosts,
                port: fc.server.port,
                compressed_port: fc
                    .server
                    .compressed_port
                    .unwrap_or_else(|| fc.server.port.wrapping_add(1)),
                send_queue: fc.server.send_queue.max(1),
            },
            compression: CompressionConfig {
                dictionary: fc.compression.dictionary.clone(),
                level: fc.compression.level,
                buffer_size: fc.compression.buffer_size,
                timeout: Duration::from_millis(fc.compression.timeout_ms),
            },
            devices: DevicesConfig {
                paths: DevicePaths {
                    class_dir: fc.devices.class_dir.clone(),
                    debugfs_dir: fc.devices.debugfs_dir.clone(),
                },
                poll_interval: Duration::from_millis(fc.devices.poll_interval_ms.max(1)),
            },
            monitor: MonitorConfig { bind },
        })
    }
}
