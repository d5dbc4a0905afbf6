use std::fs;
use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use tracing::info;

/// Query transport. The numeric values are fixed for compatibility with
/// downstream consumers reading the enum; only `UdpOnly` is implemented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Transport {
    UdpOnly = 255,
    Udp = 254,
    Tcp = 253,
    Tls = 252,
}

/// Replay run configuration. Every field has a default so an empty `{}`
/// file (or no file at all) yields a runnable local setup.
#[derive(Debug, Clone, Deserialize)]
pub struct SimConfig {
    /// 目标解析器 IP（v4 或 v6 字面量） / target resolver IP literal.
    #[serde(default = "default_target")]
    pub target: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Local source addresses rotated through during query creation.
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default = "default_transport")]
    pub transport: Transport,
    /// Client accounting slots; keys at or past this are discarded.
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    /// Per-request timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Stats snapshot interval in milliseconds; 0 disables collection.
    #[serde(default = "default_stats_interval_ms")]
    pub stats_interval_ms: u64,
    /// Number of synthetic queries the driver replays.
    #[serde(default = "default_count")]
    pub count: u64,
    /// Queries admitted per loop step; crude pacing for the driver.
    #[serde(default = "default_batch")]
    pub batch: u64,
    /// Query name the driver asks for.
    #[serde(default = "default_qname")]
    pub qname: String,
    /// Engine recycles decoded chain objects as soon as the payload is out.
    #[serde(default = "default_free_after_use")]
    pub free_after_use: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults deserialize")
    }
}

pub fn load_config(path: &Path) -> Result<SimConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config file: {}", path.display()))?;
    let cfg: SimConfig = serde_json::from_str(&raw)
        .with_context(|| format!("parse config file: {}", path.display()))?;

    if cfg.max_clients == 0 {
        anyhow::bail!("max_clients must be at least 1");
    }
    info!(target = %cfg.target, port = cfg.port, count = cfg.count, "config loaded");

    Ok(cfg)
}

fn default_target() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    53
}

fn default_transport() -> Transport {
    Transport::UdpOnly
}

fn default_max_clients() -> usize {
    256
}

fn default_timeout_ms() -> u64 {
    2000
}

fn default_stats_interval_ms() -> u64 {
    1000
}

fn default_count() -> u64 {
    100
}

fn default_batch() -> u64 {
    10
}

fn default_qname() -> String {
    "test.example.com.".to_string()
}

fn default_free_after_use() -> bool {
    true
}
