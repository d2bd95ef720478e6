//! CLI arguments and the JSON configuration document.
//!
//! The config document selects the front-end and back-end protocols by URL
//! and the routing mode:
//!
//! ```json
//! {
//!   "local":  "socks5://127.0.0.1:1080",
//!   "route":  "whitelist",
//!   "remote": "socks5://198.51.100.7:1080",
//!   "rules":  "rules.txt"
//! }
//! ```

use anyhow::{anyhow, Result};
use clap::Parser;
use serde::Deserialize;

use crate::logger::log;
use crate::matcher::resolve_rule_path;

/// CLI arguments, env fallbacks under WAYGATE_
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Pluggable TCP proxy gateway")]
pub struct CliArgs {
    /// Config file name (looked up next to the executable first)
    #[arg(
        short = 'c',
        long = "config-file",
        env = "WAYGATE_CONFIG_FILE",
        default_value = "client.json"
    )]
    pub config_file: String,

    /// Log mode: trace, debug, info, warn, error
    #[arg(long, env = "WAYGATE_LOG_MODE", default_value = "info")]
    pub log_mode: String,
}

impl CliArgs {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

/// Routing mode from the config document. Anything unrecognized collapses to
/// `None` (proxy everything through the remote client).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RouteMode {
    #[default]
    None,
    Whitelist,
    Blacklist,
}

impl RouteMode {
    pub fn parse(s: &str) -> Self {
        match s {
            "whitelist" => RouteMode::Whitelist,
            "blacklist" => RouteMode::Blacklist,
            _ => RouteMode::None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RouteMode::None => "none",
            RouteMode::Whitelist => "whitelist",
            RouteMode::Blacklist => "blacklist",
        }
    }
}

/// The JSON configuration document.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Front-end protocol URL, e.g. "socks5://127.0.0.1:1080"
    pub local: String,

    /// "none" | "whitelist" | "blacklist"; absent means "none"
    #[serde(default)]
    pub route: String,

    /// Back-end proxy protocol URL
    pub remote: String,

    /// Route rule file name, resolved like the config file itself
    #[serde(default)]
    pub rules: Option<String>,
}

impl Config {
    pub fn route_mode(&self) -> RouteMode {
        RouteMode::parse(&self.route)
    }
}

/// Load the configuration document, searching the executable directory first.
pub fn load_config(name: &str) -> Result<Config> {
    let path =
        resolve_rule_path(name).ok_or_else(|| anyhow!("can not find config file {}", name))?;
    log::info!(config = %path.display(), "Using config file");

    let content = std::fs::read_to_string(&path)
        .map_err(|e| anyhow!("can not open config file {}: {}", path.display(), e))?;
    let config: Config = serde_json::from_str(&content)
        .map_err(|e| anyhow!("can not parse config file {}: {}", path.display(), e))?;

    if config.local.is_empty() {
        return Err(anyhow!("config field 'local' must be set"));
    }
    if config.remote.is_empty() {
        return Err(anyhow!("config field 'remote' must be set"));
    }
    Ok(config)
}
