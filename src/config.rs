// Agent configuration: defaults, config file, environment

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_DIR: &str = "hostpulse";
const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: String,
    pub port: u16,

    /// `tcpdump`, `pnet`, or anything else to disable capture
    pub capture_method: String,

    /// Empty means auto-select
    pub capture_interfaces: Vec<String>,

    pub tcpdump_path: String,

    /// Primary geolocation provider; `{ip}` and `{api_key}` are substituted
    pub geoip_api_url: String,
    pub geoip_api_key: Option<String>,
    pub geoip_fallback_urls: Vec<String>,
    pub geo_timeout_ms: u64,

    /// 0 disables negative caching
    pub geo_failure_ttl_secs: u64,

    pub network_kwh_per_gb: f64,

    /// 0 = unbounded
    pub max_flow_keys: usize,

    pub latency_target: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            capture_method: "tcpdump".to_string(),
            capture_interfaces: Vec::new(),
            tcpdump_path: "tcpdump".to_string(),
            geoip_api_url: "https://ipapi.co/{ip}/json/".to_string(),
            geoip_api_key: None,
            geoip_fallback_urls: vec!["https://ipinfo.io/{ip}/json".to_string()],
            geo_timeout_ms: 2500,
            geo_failure_ttl_secs: 60,
            network_kwh_per_gb: 0.06,
            max_flow_keys: 4096,
            latency_target: "8.8.8.8".to_string(),
        }
    }
}

impl Config {
    /// Default config file location
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    /// Load from `path` (or the default location) and apply the process
    /// environment on top
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::config_path() {
                Some(path) => Self::from_file(&path)?,
                None => Config::default(),
            },
        };
        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Missing file means defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("Config file {:?} not found, using defaults", path);
            return Ok(Config::default());
        }

        let contents =
            fs::read_to_string(path).context(format!("Failed to read config file: {:?}", path))?;
        let config: Config = serde_json::from_str(&contents)
            .context(format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Override fields from environment variables
    ///
    /// Unparseable numbers are ignored with a warning.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(method) = non_empty("CAPTURE_METHOD") {
            self.capture_method = method.trim().to_ascii_lowercase();
        }
        if let Some(list) = non_empty("CAPTURE_INTERFACES").or_else(|| non_empty("SNIFFER_INTERFACES"))
        {
            self.capture_interfaces = split_list(&list);
        }
        if let Some(path) = non_empty("TCPDUMP_PATH") {
            self.tcpdump_path = path.trim().to_string();
        }
        if let Some(url) = non_empty("GEOIP_API_URL") {
            self.geoip_api_url = url.trim().to_string();
        }
        if let Some(key) = non_empty("GEOIP_API_KEY") {
            self.geoip_api_key = Some(key.trim().to_string());
        }
        if let Some(list) = non_empty("GEOIP_FALLBACK_URLS") {
            self.geoip_fallback_urls = split_list(&list);
        }
        if let Some(target) = non_empty("LATENCY_TARGET") {
            self.latency_target = target.trim().to_string();
        }

        parse_into(&non_empty, "NETWORK_KWH_PER_GB", &mut self.network_kwh_per_gb);
        parse_into(&non_empty, "MAX_FLOW_KEYS", &mut self.max_flow_keys);
        parse_into(&non_empty, "GEO_FAILURE_TTL_SECS", &mut self.geo_failure_ttl_secs);
    }

    pub fn geo_timeout(&self) -> Duration {
        Duration::from_millis(self.geo_timeout_ms)
    }

    pub fn geo_failure_ttl(&self) -> Duration {
        Duration::from_secs(self.geo_failure_ttl_secs)
    }
}

fn parse_into<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    field: &mut T,
) {
    let Some(raw) = lookup(name) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *field = value,
        Err(_) => log::warn!("Ignoring {}={:?}: not a number", name, raw),
    }
}

fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}
