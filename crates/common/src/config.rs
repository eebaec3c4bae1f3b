use std::path::PathBuf;
use std::str::FromStr;

use serde::Deserialize;

use crate::error::ConfigError;

/// Default rules file location, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "notify.yaml";

/// Output format for the process log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "text" | "plain" => Ok(LogFormat::Text),
            other => Err(format!("unknown log format {other:?} (expected json or text)")),
        }
    }
}

/// Process-wide knobs shared by every rule's reconciliation loop.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EngineConfig {
    /// Number of trailing log lines fetched per pod (default: 20)
    pub tail_lines: i64,

    /// Byte cap applied to each pod's logs (default: 65535)
    pub logs_bytes: i64,

    /// Capacity of the per-rule deduplication cache (default: 8192)
    pub dedup_cache: usize,

    /// Skip seeding the dedup cache with already failed jobs at startup.
    /// May cause duplicate notifications after a restart.
    pub skip_preload: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tail_lines: 20,
            logs_bytes: 65535,
            dedup_cache: 8192,
            skip_preload: false,
        }
    }
}

impl EngineConfig {
    /// Build the engine config from a variable lookup, falling back to
    /// defaults for anything unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Ok(Self {
            tail_lines: parse_var(&lookup, "ENGINE_TAIL", defaults.tail_lines)?,
            logs_bytes: parse_var(&lookup, "ENGINE_LOGS_BYTES", defaults.logs_bytes)?,
            dedup_cache: parse_var(&lookup, "ENGINE_DEDUP_CACHE", defaults.dedup_cache)?,
            skip_preload: parse_bool(&lookup, "ENGINE_SKIP_PRELOAD", defaults.skip_preload)?,
        })
    }
}

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Path to the multi-document YAML rules file
    pub config_path: PathBuf,

    /// Kubernetes API server URL override (kubeconfig / in-cluster otherwise)
    pub master_url: Option<String>,

    /// Log output format
    pub log_format: LogFormat,

    /// Reconciliation engine settings
    pub engine: EngineConfig,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            config_path: lookup("CONFIG")
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
                .into(),
            master_url: lookup("MASTER_URL").filter(|v| !v.is_empty()),
            log_format: parse_var(&lookup, "LOG_FORMAT", LogFormat::default())?,
            engine: EngineConfig::from_lookup(&lookup)?,
        })
    }
}

fn parse_var<F, T>(lookup: &F, var: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        Some(raw) if !raw.trim().is_empty() => {
            raw.trim().parse().map_err(|e: T::Err| ConfigError::Env {
                var,
                reason: e.to_string(),
            })
        }
        _ => Ok(default),
    }
}

fn parse_bool<F>(lookup: &F, var: &'static str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(var) else {
        return Ok(default);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "" => Ok(default),
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::Env {
            var,
            reason: format!("{other:?} is not a boolean"),
        }),
    }
}
