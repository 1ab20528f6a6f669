pub mod parser;

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Which repository backend answers and records requests.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default, PartialEq, Eq)]
pub enum StoreKind {
    /// Embedded SQLite file (or `:memory:`).
    #[default]
    Sqlite,
    /// External Redis-protocol key-value server.
    Redis,
}

/// The global application configuration state.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    pub listen: String,
    pub workers: usize,
    pub store: StoreKind,
    /// Prepended to every repository key.
    pub key_prefix: String,
    /// Log cache misses at info level.
    pub log_not_found: bool,

    pub redis_addr: String,
    pub redis_password: String,
    pub redis_db: i64,
    pub redis_timeout_ms: u64,

    pub sqlite_path: String,
    pub sqlite_timeout_ms: u64,

    /// Base origin URL for cache misses. Empty disables upstream fetch and
    /// misses answer 404.
    pub upstream: String,
    pub upstream_timeout_ms: u64,

    /// Replace existing entries when recording.
    pub record_overwrite: bool,
    /// Upstream statuses that are never recorded.
    pub record_ignore_statuses: Vec<u16>,

    /// Enable the content-encoding decoder plugin.
    pub decode_responses: bool,
    /// Append request/response dumps to this file. Empty disables.
    pub dump_file: String,
    /// 0 = headers, 1 = headers + bodies.
    pub dump_level: u8,
    /// JSON config files for the optional plugins. Empty disables each.
    pub rules_file: String,
    pub map_local_file: String,
    pub map_remote_file: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8090".to_string(),
            workers: 4,
            store: StoreKind::Sqlite,
            key_prefix: String::new(),
            log_not_found: false,
            redis_addr: "127.0.0.1:6379".to_string(),
            redis_password: String::new(),
            redis_db: 0,
            redis_timeout_ms: 5_000,
            sqlite_path: "replayd.sqlite".to_string(),
            sqlite_timeout_ms: 5_000,
            upstream: String::new(),
            upstream_timeout_ms: 30_000,
            record_overwrite: false,
            record_ignore_statuses: vec![429],
            decode_responses: false,
            dump_file: String::new(),
            dump_level: 0,
            rules_file: String::new(),
            map_local_file: String::new(),
            map_remote_file: String::new(),
        }
    }
}

impl AppConfig {
    pub fn redis_timeout(&self) -> Duration {
        Duration::from_millis(self.redis_timeout_ms)
    }

    pub fn sqlite_timeout(&self) -> Duration {
        Duration::from_millis(self.sqlite_timeout_ms)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_timeout_ms)
    }
}

/// Synchronously loads and parses the given config path from the disk.
/// Panics immediately with a descriptive error if the config file is
/// malformed (missing semicolons, unknown directives, bad values).
pub fn load_config(conf_path: &str) -> AppConfig {
    if let Ok(content) = std::fs::read_to_string(conf_path) {
        let cfg = apply_directives(&content)
            .unwrap_or_else(|e| panic!("Configuration error in '{conf_path}': {e}"));
        tracing::info!("Loaded config from {}", conf_path);
        cfg
    } else {
        tracing::warn!("Could not find {}, using default config", conf_path);
        AppConfig::default()
    }
}

fn apply_directives(content: &str) -> Result<AppConfig, String> {
    let mut cfg = AppConfig::default();

    for (name, value) in parser::parse_directives(content)? {
        match name.as_str() {
            "listen" => cfg.listen = value,
            "workers" => cfg.workers = parse_number(&name, &value)?,
            "store" => {
                cfg.store = match value.as_str() {
                    "sqlite" => StoreKind::Sqlite,
                    "redis" => StoreKind::Redis,
                    other => return Err(format!("Unknown store backend '{other}'")),
                }
            }
            "key_prefix" => cfg.key_prefix = value,
            "log_not_found" => cfg.log_not_found = parse_bool(&name, &value)?,
            "redis_addr" => cfg.redis_addr = value,
            "redis_password" => cfg.redis_password = value,
            "redis_db" => cfg.redis_db = parse_number(&name, &value)?,
            "redis_timeout_ms" => cfg.redis_timeout_ms = parse_number(&name, &value)?,
            "sqlite_path" => cfg.sqlite_path = value,
            "sqlite_timeout_ms" => cfg.sqlite_timeout_ms = parse_number(&name, &value)?,
            "upstream" => cfg.upstream = value,
            "upstream_timeout_ms" => cfg.upstream_timeout_ms = parse_number(&name, &value)?,
            "record_overwrite" => cfg.record_overwrite = parse_bool(&name, &value)?,
            "record_ignore_status" => {
                cfg.record_ignore_statuses = value
                    .split(',')
                    .map(str::trim)
                    .filter(|status| !status.is_empty())
                    .map(|status| {
                        status.parse::<u16>().map_err(|_| {
                            format!("Invalid status '{status}' for 'record_ignore_status'")
                        })
                    })
                    .collect::<Result<_, _>>()?
            }
            "decode_responses" => cfg.decode_responses = parse_bool(&name, &value)?,
            "dump_file" => cfg.dump_file = value,
            "dump_level" => cfg.dump_level = parse_number(&name, &value)?,
            "rules_file" => cfg.rules_file = value,
            "map_local_file" => cfg.map_local_file = value,
            "map_remote_file" => cfg.map_remote_file = value,
            other => return Err(format!("Unknown directive '{other}'")),
        }
    }

    Ok(cfg)
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, String> {
    value
        .parse::<T>()
        .map_err(|_| format!("Invalid value '{value}' for directive '{name}': expected a number"))
}

fn parse_bool(name: &str, value: &str) -> Result<bool, String> {
    match value {
        "true" | "on" | "1" => Ok(true),
        "false" | "off" | "0" => Ok(false),
        other => Err(format!(
            "Invalid value '{other}' for directive '{name}': expected true or false"
        )),
    }
}
