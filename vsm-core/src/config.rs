//! Configuration file management for the VSM gateway.
//!
//! Reads/writes `~/.vsm-gateway/config.yaml` with solver credentials,
//! store path, HTTP listener, downlink/publisher endpoints and rule tuning.

use std::path::PathBuf;

use crate::rules::DEFAULT_CLOCK_DRIFT_THRESHOLD_S;
use crate::types::VsmError;

/// Default solver base URL.
pub const DEFAULT_SOLVER_URL: &str = "https://lw.traxmate.io";

/// Full configuration structure.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub solver: SolverConfig,
    pub store: StoreConfig,
    pub server: ServerConfig,
    pub downlink: DownlinkConfig,
    pub publisher: PublisherConfig,
    pub rules: RulesConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SolverConfig {
    pub url: String,
    pub api_key: Option<String>,
    /// Skip position solving entirely.
    pub disabled: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DownlinkConfig {
    /// Network server downlink webhook. `None` logs downlinks only.
    pub url: Option<String>,
    /// Delay between consecutive almanac frames.
    pub pacing_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublisherConfig {
    pub webhook: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RulesConfig {
    pub clock_drift_threshold_s: f64,
    /// Max downlink payload when the network did not report one.
    pub default_max_size: usize,
    /// Only process devices whose id starts with this (case-insensitive).
    pub device_prefix: Option<String>,
    /// Ignore network timestamps and use local receipt time.
    pub distrust_network_time: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            solver: SolverConfig {
                url: DEFAULT_SOLVER_URL.into(),
                api_key: None,
                disabled: false,
            },
            store: StoreConfig {
                path: "data/vsm.db".into(),
            },
            server: ServerConfig {
                host: "127.0.0.1".into(),
                port: 8080,
                auth_token: None,
            },
            downlink: DownlinkConfig {
                url: None,
                pacing_ms: 1000,
            },
            publisher: PublisherConfig { webhook: None },
            rules: RulesConfig {
                clock_drift_threshold_s: DEFAULT_CLOCK_DRIFT_THRESHOLD_S,
                default_max_size: 40,
                device_prefix: None,
                distrust_network_time: false,
            },
        }
    }
}

/// Get the config directory path (`~/.vsm-gateway/`).
pub fn config_dir() -> PathBuf {
    dirs_home().join(".vsm-gateway")
}

/// Get the config file path.
pub fn config_file() -> PathBuf {
    config_dir().join("config.yaml")
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Load config from `~/.vsm-gateway/config.yaml`.
///
/// Returns default config if file doesn't exist.
pub fn load_config() -> Config {
    let path = config_file();
    if !path.exists() {
        return Config::default();
    }

    match std::fs::read_to_string(&path) {
        Ok(text) => parse_config(&text),
        Err(_) => Config::default(),
    }
}

/// Save config to `~/.vsm-gateway/config.yaml`.
pub fn save_config(config: &Config) -> Result<PathBuf, VsmError> {
    let dir = config_dir();
    std::fs::create_dir_all(&dir).map_err(|e| VsmError::Config(e.to_string()))?;

    let path = config_file();
    std::fs::write(&path, serialize_config(config)).map_err(|e| VsmError::Config(e.to_string()))?;

    Ok(path)
}

/// Parse simple YAML-like config text. Unknown keys are ignored.
pub fn parse_config(text: &str) -> Config {
    let mut config = Config::default();
    let mut current_section: Option<String> = None;

    for line in text.lines() {
        let stripped = line.trim();
        if stripped.is_empty() || stripped.starts_with('#') {
            continue;
        }

        let is_indented = line.starts_with("  ") || line.starts_with('\t');

        let Some((key, val)) = stripped.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let val = val.trim();

        if !is_indented {
            current_section = if val.is_empty() {
                Some(key.to_string())
            } else {
                None
            };
            continue;
        }

        let Some(section) = current_section.as_deref() else {
            continue;
        };
        match (section, key) {
            ("solver", "url") => {
                if let Some(v) = parse_string_value(val) {
                    config.solver.url = v;
                }
            }
            ("solver", "api_key") => config.solver.api_key = parse_string_value(val),
            ("solver", "disabled") => {
                config.solver.disabled = parse_bool_value(val).unwrap_or(false)
            }
            ("store", "path") => {
                if let Some(v) = parse_string_value(val) {
                    config.store.path = v;
                }
            }
            ("server", "host") => {
                if let Some(v) = parse_string_value(val) {
                    config.server.host = v;
                }
            }
            ("server", "port") => {
                if let Ok(v) = val.parse::<u16>() {
                    config.server.port = v;
                }
            }
            ("server", "auth_token") => config.server.auth_token = parse_string_value(val),
            ("downlink", "url") => config.downlink.url = parse_string_value(val),
            ("downlink", "pacing_ms") => {
                if let Ok(v) = val.parse::<u64>() {
                    config.downlink.pacing_ms = v;
                }
            }
            ("publisher", "webhook") => config.publisher.webhook = parse_string_value(val),
            ("rules", "clock_drift_threshold_s") => {
                if let Ok(v) = val.parse::<f64>() {
                    config.rules.clock_drift_threshold_s = v;
                }
            }
            ("rules", "default_max_size") => {
                if let Ok(v) = val.parse::<usize>() {
                    config.rules.default_max_size = v;
                }
            }
            ("rules", "device_prefix") => config.rules.device_prefix = parse_string_value(val),
            ("rules", "distrust_network_time") => {
                config.rules.distrust_network_time = parse_bool_value(val).unwrap_or(false)
            }
            _ => {}
        }
    }

    config
}

fn parse_string_value(val: &str) -> Option<String> {
    if val == "null" || val == "~" || val.is_empty() {
        return None;
    }
    // Strip quotes
    if val.len() >= 2
        && ((val.starts_with('"') && val.ends_with('"'))
            || (val.starts_with('\'') && val.ends_with('\'')))
    {
        return Some(val[1..val.len() - 1].to_string());
    }
    Some(val.to_string())
}

fn parse_bool_value(val: &str) -> Option<bool> {
    match val {
        "true" | "yes" | "on" => Some(true),
        "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn opt_line(key: &str, val: &Option<String>) -> String {
    match val {
        Some(v) => format!("  {key}: \"{v}\""),
        None => format!("  {key}: null"),
    }
}

/// Serialize config to YAML-like text.
pub fn serialize_config(config: &Config) -> String {
    let mut lines = vec!["# vsm-gateway configuration".to_string(), String::new()];

    lines.push("solver:".into());
    lines.push(format!("  url: \"{}\"", config.solver.url));
    lines.push(opt_line("api_key", &config.solver.api_key));
    lines.push(format!("  disabled: {}", config.solver.disabled));
    lines.push(String::new());

    lines.push("store:".into());
    lines.push(format!("  path: \"{}\"", config.store.path));
    lines.push(String::new());

    lines.push("server:".into());
    lines.push(format!("  host: \"{}\"", config.server.host));
    lines.push(format!("  port: {}", config.server.port));
    lines.push(opt_line("auth_token", &config.server.auth_token));
    lines.push(String::new());

    lines.push("downlink:".into());
    lines.push(opt_line("url", &config.downlink.url));
    lines.push(format!("  pacing_ms: {}", config.downlink.pacing_ms));
    lines.push(String::new());

    lines.push("publisher:".into());
    lines.push(opt_line("webhook", &config.publisher.webhook));
    lines.push(String::new());

    lines.push("rules:".into());
    lines.push(format!(
        "  clock_drift_threshold_s: {}",
        config.rules.clock_drift_threshold_s
    ));
    lines.push(format!("  default_max_size: {}", config.rules.default_max_size));
    lines.push(opt_line("device_prefix", &config.rules.device_prefix));
    lines.push(format!(
        "  distrust_network_time: {}",
        config.rules.distrust_network_time
    ));

    lines.join("\n") + "\n"
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
