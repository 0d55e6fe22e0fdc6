//! Configuration loading from environment variables.

use crate::constants::{
    DEFAULT_FLUSH_DEBOUNCE_MS, DEFAULT_MAX_CONTENT_SIZE, DEFAULT_MAX_RETRY_INTERVAL_MS,
    DEFAULT_MIN_FLUSH_INTERVAL_MS, DEFAULT_PORT, DEFAULT_RATE_LIMIT_PER_MINUTE,
    DEFAULT_RETRY_INTERVAL_MS, DEFAULT_SERVER_URL,
};
use crate::text::normalize_optional_nonempty;
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration for the document server.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub db_path: String,
    pub port: u16,
    pub max_content_size: usize,
    pub api_token: Option<String>,
    pub rate_limit_per_minute: u32,
}

/// Runtime configuration for a client sync session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub server_url: String,
    pub api_token: Option<String>,
    pub flush_debounce: Duration,
    pub min_flush_interval: Duration,
    pub retry_interval: Duration,
    pub max_retry_interval: Duration,
    pub max_content_size: usize,
    pub prefs_path: String,
}

/// Expand tilde (~) in paths to the user's home directory
fn expand_tilde(path: String) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = resolve_home_dir() {
            return home.join(rest).to_string_lossy().to_string();
        }
    }
    path
}

fn resolve_home_dir() -> Option<PathBuf> {
    if let Ok(home) = env::var("HOME") {
        if !home.trim().is_empty() {
            return Some(PathBuf::from(home));
        }
    }

    if let Ok(profile) = env::var("USERPROFILE") {
        if !profile.trim().is_empty() {
            return Some(PathBuf::from(profile));
        }
    }

    std::env::current_dir().ok()
}

fn default_cache_path(file: &str) -> String {
    let home = resolve_home_dir().unwrap_or_else(|| PathBuf::from("."));
    home.join(".cache")
        .join("scriptsync")
        .join(file)
        .to_string_lossy()
        .to_string()
}

fn env_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|raw| raw.trim().parse().ok())
}

fn env_millis(name: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_parsed(name).unwrap_or(default_ms))
}

/// Parse a boolean-like environment flag value.
///
/// # Supported Values
/// - Truthy: `1`, `true`, `yes`, `on`
/// - Falsy: `0`, `false`, `no`, `off`, empty string
///
/// Matching is case-insensitive and ignores surrounding whitespace.
///
/// # Returns
/// `Some(bool)` when the value is recognized, otherwise `None`.
pub fn parse_env_flag(value: &str) -> Option<bool> {
    let normalized = value.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "" | "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Read a boolean flag from the environment.
///
/// Missing or unrecognized values are treated as `false`.
pub fn env_flag_enabled(name: &str) -> bool {
    env::var(name)
        .ok()
        .and_then(|value| parse_env_flag(&value))
        .unwrap_or(false)
}

impl Config {
    /// Load server configuration from environment variables.
    ///
    /// # Returns
    /// A populated [`Config`] with defaults applied when env vars are missing.
    pub fn from_env() -> Self {
        Self {
            db_path: env::var("DB_PATH")
                .map(expand_tilde)
                .unwrap_or_else(|_| default_cache_path("db")),
            port: env_parsed("PORT").unwrap_or(DEFAULT_PORT),
            max_content_size: env_parsed("MAX_CONTENT_SIZE").unwrap_or(DEFAULT_MAX_CONTENT_SIZE),
            api_token: normalize_optional_nonempty(env::var("API_TOKEN").ok()),
            rate_limit_per_minute: env_parsed("RATE_LIMIT_PER_MINUTE")
                .unwrap_or(DEFAULT_RATE_LIMIT_PER_MINUTE),
        }
    }
}

impl SyncConfig {
    /// Load client configuration from environment variables.
    ///
    /// A `MAX_RETRY_INTERVAL_MS` below `RETRY_INTERVAL_MS` is raised to match it
    /// so the backoff cap never undercuts the base delay.
    pub fn from_env() -> Self {
        let retry_interval = env_millis("RETRY_INTERVAL_MS", DEFAULT_RETRY_INTERVAL_MS);
        let max_retry_interval =
            env_millis("MAX_RETRY_INTERVAL_MS", DEFAULT_MAX_RETRY_INTERVAL_MS).max(retry_interval);
        Self {
            server_url: normalize_optional_nonempty(env::var("SCRIPTSYNC_SERVER").ok())
                .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string()),
            api_token: normalize_optional_nonempty(env::var("API_TOKEN").ok()),
            flush_debounce: env_millis("FLUSH_DEBOUNCE_MS", DEFAULT_FLUSH_DEBOUNCE_MS),
            min_flush_interval: env_millis("MIN_FLUSH_INTERVAL_MS", DEFAULT_MIN_FLUSH_INTERVAL_MS),
            retry_interval,
            max_retry_interval,
            max_content_size: env_parsed("MAX_CONTENT_SIZE").unwrap_or(DEFAULT_MAX_CONTENT_SIZE),
            prefs_path: env::var("PREFS_PATH")
                .map(expand_tilde)
                .unwrap_or_else(|_| default_cache_path("prefs.json")),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            api_token: None,
            flush_debounce: Duration::from_millis(DEFAULT_FLUSH_DEBOUNCE_MS),
            min_flush_interval: Duration::from_millis(DEFAULT_MIN_FLUSH_INTERVAL_MS),
            retry_interval: Duration::from_millis(DEFAULT_RETRY_INTERVAL_MS),
            max_retry_interval: Duration::from_millis(DEFAULT_MAX_RETRY_INTERVAL_MS),
            max_content_size: DEFAULT_MAX_CONTENT_SIZE,
            prefs_path: default_cache_path("prefs.json"),
        }
    }
}
