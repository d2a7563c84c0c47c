use anyhow::Result;
use serde::Deserialize;
use std::collections::HashMap;

/// CatchMole configuration loaded from a TOML file or defaults.
///
/// CLI flags (see `Cli` in `main.rs`) are applied on top of this after
/// loading, overwriting whichever fields were explicitly passed.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// HTTP bind address.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Monitored interface name. `None` means no interface filter is
    /// applied and WAN attribution runs against every observed event.
    #[serde(default)]
    pub interface: Option<String>,

    /// When true, traffic between two LAN endpoints is not accounted.
    #[serde(default = "default_ignore_lan")]
    pub ignore_lan: bool,

    /// Aggregator tick interval, in seconds.
    #[serde(default = "default_interval")]
    pub interval: u64,

    /// Flow tracker eviction age, in seconds.
    #[serde(default = "default_flow_ttl")]
    pub flow_ttl: u64,

    /// Lower-cased MAC -> display name.
    #[serde(default)]
    pub devices: HashMap<String, String>,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_ignore_lan() -> bool {
    true
}

fn default_interval() -> u64 {
    1
}

fn default_flow_ttl() -> u64 {
    60
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            interface: None,
            ignore_lan: default_ignore_lan(),
            interval: default_interval(),
            flow_ttl: default_flow_ttl(),
            devices: HashMap::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::de::from_str(&contents)?;
        Ok(config)
    }
}
