use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_REFRESH_MINUTES: u32 = 60;
pub const MIN_REFRESH_MINUTES: u32 = 1;
pub const MAX_REFRESH_MINUTES: u32 = 1440;

/// Public client id of the Claude Code OAuth application.
pub const DEFAULT_OAUTH_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";

#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    pub window: Duration,
    pub max_requests: u32,
    pub max_entries: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_requests: 30,
            max_entries: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub db_path: PathBuf,
    pub port: u16,
    pub refresh_interval_minutes: u32,
    pub oauth_client_id: String,
    pub github_client_id: Option<String>,
    pub trusted_proxy_header: String,
    pub http_timeout: Duration,
    pub rate_limit: RateLimitConfig,
    pub github_api_base: String,
    pub github_web_base: String,
    pub anthropic_api_base: String,
    pub anthropic_token_url: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            db_path: crate::models::tally_path("tally.db"),
            port: 7420,
            refresh_interval_minutes: DEFAULT_REFRESH_MINUTES,
            oauth_client_id: DEFAULT_OAUTH_CLIENT_ID.to_string(),
            github_client_id: None,
            trusted_proxy_header: "x-forwarded-for".to_string(),
            http_timeout: Duration::from_secs(15),
            rate_limit: RateLimitConfig::default(),
            github_api_base: "https://api.github.com".to_string(),
            github_web_base: "https://github.com".to_string(),
            anthropic_api_base: "https://api.anthropic.com".to_string(),
            anthropic_token_url: "https://platform.claude.com/v1/oauth/token".to_string(),
        }
    }
}

impl Settings {
    /// Defaults, then `~/.tally/config`, then `TALLY_*` environment variables.
    pub fn load() -> Self {
        let mut values = load_config();
        for (key, value) in std::env::vars() {
            if let Some(name) = key.strip_prefix("TALLY_") {
                values.insert(name.to_string(), value);
            }
        }
        Self::from_map(&values)
    }

    pub fn from_map(values: &HashMap<String, String>) -> Self {
        let mut s = Self::default();
        let get = |k: &str| values.get(k).map(|v| v.trim()).filter(|v| !v.is_empty());
        let parse_u64 = |k: &str| get(k).and_then(|v| v.parse::<u64>().ok());

        if let Some(v) = get("DB_PATH") {
            s.db_path = PathBuf::from(v);
        }
        if let Some(v) = get("PORT").and_then(|v| v.parse().ok()) {
            s.port = v;
        }
        if let Some(v) = get("REFRESH_INTERVAL_MINUTES").and_then(|v| v.parse().ok()) {
            s.refresh_interval_minutes = clamp_interval(v);
        }
        if let Some(v) = get("OAUTH_CLIENT_ID") {
            s.oauth_client_id = v.to_string();
        }
        s.github_client_id = get("GITHUB_CLIENT_ID").map(String::from);
        if let Some(v) = get("TRUSTED_PROXY_HEADER") {
            s.trusted_proxy_header = v.to_ascii_lowercase();
        }
        if let Some(v) = parse_u64("HTTP_TIMEOUT_SECS").filter(|v| *v > 0) {
            s.http_timeout = Duration::from_secs(v);
        }
        if let Some(v) = parse_u64("RATE_LIMIT_WINDOW_SECS").filter(|v| *v > 0) {
            s.rate_limit.window = Duration::from_secs(v);
        }
        if let Some(v) = parse_u64("RATE_LIMIT_MAX").filter(|v| *v > 0) {
            s.rate_limit.max_requests = v.min(u32::MAX as u64) as u32;
        }
        if let Some(v) = parse_u64("RATE_LIMIT_MAX_ENTRIES").filter(|v| *v > 0) {
            s.rate_limit.max_entries = v as usize;
        }
        if let Some(v) = get("GITHUB_API_BASE") {
            s.github_api_base = v.trim_end_matches('/').to_string();
        }
        if let Some(v) = get("GITHUB_WEB_BASE") {
            s.github_web_base = v.trim_end_matches('/').to_string();
        }
        if let Some(v) = get("ANTHROPIC_API_BASE") {
            s.anthropic_api_base = v.trim_end_matches('/').to_string();
        }
        if let Some(v) = get("ANTHROPIC_TOKEN_URL") {
            s.anthropic_token_url = v.to_string();
        }
        s
    }

    /// Apply settings persisted by the settings subsystem on top of file/env values.
    pub fn apply_persisted(&mut self, store: &crate::store::Store) -> anyhow::Result<()> {
        if let Some(v) = store.get_setting(SETTING_REFRESH_INTERVAL)? {
            if let Ok(minutes) = v.parse() {
                self.refresh_interval_minutes = clamp_interval(minutes);
            }
        }
        if let Some(v) = store.get_setting(SETTING_OAUTH_CLIENT_ID)? {
            if !v.trim().is_empty() {
                self.oauth_client_id = v.trim().to_string();
            }
        }
        if let Some(v) = store.get_setting(SETTING_GITHUB_CLIENT_ID)? {
            if !v.trim().is_empty() {
                self.github_client_id = Some(v.trim().to_string());
            }
        }
        Ok(())
    }
}

pub const SETTING_REFRESH_INTERVAL: &str = "refresh_interval_minutes";
pub const SETTING_OAUTH_CLIENT_ID: &str = "oauth_client_id";
pub const SETTING_GITHUB_CLIENT_ID: &str = "github_client_id";

pub fn clamp_interval(minutes: u32) -> u32 {
    minutes.clamp(MIN_REFRESH_MINUTES, MAX_REFRESH_MINUTES)
}

/// Read `~/.tally/config` as `KEY=VALUE` lines; `#` starts a comment.
pub fn load_config() -> HashMap<String, String> {
    let Ok(content) = std::fs::read_to_string(crate::models::tally_path("config")) else {
        return HashMap::new();
    };
    parse_config(&content)
}

fn parse_config(content: &str) -> HashMap<String, String> {
    content
        .lines()
        .filter(|l| !l.trim_start().starts_with('#') && !l.trim().is_empty())
        .filter_map(|l| {
            let (k, v) = l.split_once('=')?;
            Some((k.trim().to_string(), v.trim().to_string()))
        })
        .collect()
}
