//! Configuration module
//!
//! All options are loaded from environment variables so the proxy can be
//! dropped into a container without a config file. Durations are given as
//! integer seconds.

use std::time::Duration;

/// Main proxy configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP acceptance port shared by devices and clients
    pub port: u16,
    /// HTTP status API port
    pub api_port: u16,
    /// Shared auth token; empty disables authentication
    pub auth_token: String,
    /// HTTP basic auth user for the mutating API endpoints
    pub web_user: String,
    /// HTTP basic auth password
    pub web_pass: String,
    /// TCP keepalive idle time applied to device sockets
    pub keepalive: Duration,
    /// Read deadline for the first command on a new connection
    pub init_timeout: Duration,
    /// Read deadline after a tolerated `ATDT`/`ATDP`
    pub post_connect_timeout: Duration,
    /// Idle period after which a NOP keepalive is sent; zero disables
    pub idle_timeout: Duration,
    pub debug: bool,
    pub debug_http: bool,
    /// Expect a PROXY protocol v1/v2 header on accepted connections
    pub proxy_protocol: bool,
}

impl Config {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            port: get_u16_env("PORT", 2217),
            api_port: get_u16_env("API_PORT", 8080),
            auth_token: get_env("AUTH_TOKEN", ""),
            web_user: get_env("WEB_USER", "admin"),
            web_pass: get_env("WEB_PASS", "admin"),
            keepalive: get_duration_env("KEEPALIVE", Duration::from_secs(30)),
            init_timeout: get_duration_env("INIT_TIMEOUT", Duration::from_secs(5)),
            post_connect_timeout: get_duration_env("POST_CONNECT_TIMEOUT", Duration::from_secs(60)),
            idle_timeout: get_duration_env("IDLE_TIMEOUT", Duration::from_secs(30)),
            debug: get_bool_env("DEBUG", false),
            debug_http: get_bool_env("DEBUG_HTTP", false),
            proxy_protocol: get_bool_env("PROXY_PROTOCOL", false),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 2217,
            api_port: 8080,
            auth_token: String::new(),
            web_user: "admin".to_string(),
            web_pass: "admin".to_string(),
            keepalive: Duration::from_secs(30),
            init_timeout: Duration::from_secs(5),
            post_connect_timeout: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(30),
            debug: false,
            debug_http: false,
            proxy_protocol: false,
        }
    }
}

fn get_env(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(val) if !val.is_empty() => val,
        _ => default.to_string(),
    }
}

fn get_u16_env(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(default)
}

fn get_bool_env(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) if !val.is_empty() => parse_bool(&val),
        _ => default,
    }
}

fn get_duration_env(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn parse_bool(val: &str) -> bool {
    val == "1" || val == "true" || val == "yes"
}
