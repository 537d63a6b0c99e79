//! Process configuration, built once at startup from the environment and
//! passed by reference from then on. No ambient global/singleton config.

use std::path::PathBuf;

use crate::error::{Error, Result};

fn d_db_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".reeve").join("pulse_queue.db")
}

fn d_api_host() -> String {
    "127.0.0.1".to_string()
}

fn d_api_port() -> u16 {
    8765
}

fn d_max_concurrent() -> usize {
    1
}

fn d_batch_limit() -> usize {
    10
}

fn d_tick_ms() -> u64 {
    1000
}

fn d_shutdown_grace_secs() -> u64 {
    30
}

fn d_executor_timeout_secs() -> u64 {
    3600
}

fn d_stale_processing_secs() -> i64 {
    300
}

fn d_runner_command() -> String {
    "hapi".to_string()
}

fn d_desk_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join("reeve-desk")
}

fn d_chatpoll_offset_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".reeve").join("chatpoll_offset")
}

/// Storage location configuration. `PULSE_DB_PATH` takes precedence over
/// `PULSE_DB_URL` when both are set (the latter exists for deployments
/// that prefer a URL-shaped value, e.g. `file:///…`).
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub db_path: PathBuf,
}

impl StoreConfig {
    pub fn from_env() -> Self {
        let db_path = std::env::var("PULSE_DB_PATH")
            .map(PathBuf::from)
            .or_else(|_| {
                std::env::var("PULSE_DB_URL").map(|url| {
                    PathBuf::from(url.strip_prefix("file://").unwrap_or(&url).to_string())
                })
            })
            .unwrap_or_else(|_| d_db_path());
        Self { db_path }
    }
}

/// HTTP Ingress bind + auth configuration.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
    /// Bearer token required of every authenticated request. Its absence is
    /// a startup error for any binary that builds this config — there is no
    /// unauthenticated "dev mode" baked into the core.
    pub api_token: String,
}

impl HttpConfig {
    pub fn from_env() -> Result<Self> {
        let host = std::env::var("PULSE_API_HOST").unwrap_or_else(|_| d_api_host());
        let port = std::env::var("PULSE_API_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(d_api_port);
        let api_token = std::env::var("PULSE_API_TOKEN").map_err(|_| {
            Error::Config(
                "PULSE_API_TOKEN is required: the HTTP ingress refuses to start unauthenticated"
                    .to_string(),
            )
        })?;
        if api_token.is_empty() {
            return Err(Error::Config("PULSE_API_TOKEN must not be empty".to_string()));
        }
        Ok(Self { host, port, api_token })
    }
}

/// Daemon scheduling-loop configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub max_concurrent: usize,
    pub batch_limit: usize,
    pub tick_ms: u64,
    pub shutdown_grace_secs: u64,
    pub executor_timeout_secs: u64,
    pub stale_processing_secs: i64,
    pub runner_command: String,
    pub desk_path: PathBuf,
}

impl DaemonConfig {
    pub fn from_env() -> Self {
        Self {
            max_concurrent: std::env::var("PULSE_MAX_CONCURRENT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or_else(d_max_concurrent),
            batch_limit: d_batch_limit(),
            tick_ms: d_tick_ms(),
            shutdown_grace_secs: d_shutdown_grace_secs(),
            executor_timeout_secs: d_executor_timeout_secs(),
            stale_processing_secs: d_stale_processing_secs(),
            runner_command: std::env::var("HAPI_COMMAND").unwrap_or_else(|_| d_runner_command()),
            desk_path: std::env::var("REEVE_DESK_PATH")
                .map(expand_path)
                .unwrap_or_else(|_| d_desk_path()),
        }
    }
}

/// Expand a leading `~` and `$VAR`/`${VAR}` environment references in a path.
pub fn expand_path(raw: String) -> PathBuf {
    let mut s = raw;
    if let Some(rest) = s.strip_prefix('~') {
        if let Ok(home) = std::env::var("HOME") {
            s = format!("{home}{rest}");
        }
    }
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '$' {
            let mut name = String::new();
            if chars.peek() == Some(&'{') {
                chars.next();
                for c2 in chars.by_ref() {
                    if c2 == '}' {
                        break;
                    }
                    name.push(c2);
                }
            } else {
                while let Some(&c2) = chars.peek() {
                    if c2.is_alphanumeric() || c2 == '_' {
                        name.push(c2);
                        chars.next();
                    } else {
                        break;
                    }
                }
            }
            if let Ok(val) = std::env::var(&name) {
                out.push_str(&val);
            }
        } else {
            out.push(c);
        }
    }
    PathBuf::from(out)
}

/// Chat-Poll Ingress configuration.
#[derive(Debug, Clone)]
pub struct ChatPollConfig {
    pub chat_api_token: String,
    pub chat_authorized_peer: String,
    pub pulse_api_url: String,
    pub pulse_api_token: String,
    pub offset_path: PathBuf,
}

impl ChatPollConfig {
    pub fn from_env() -> Result<Self> {
        let chat_api_token = std::env::var("CHAT_API_TOKEN")
            .map_err(|_| Error::Config("CHAT_API_TOKEN is required".to_string()))?;
        let chat_authorized_peer = std::env::var("CHAT_AUTHORIZED_PEER")
            .map_err(|_| Error::Config("CHAT_AUTHORIZED_PEER is required".to_string()))?;
        let pulse_api_url = std::env::var("PULSE_API_URL")
            .map_err(|_| Error::Config("PULSE_API_URL is required".to_string()))?;
        let pulse_api_token = std::env::var("PULSE_API_TOKEN")
            .map_err(|_| Error::Config("PULSE_API_TOKEN is required".to_string()))?;
        let offset_path = std::env::var("PULSE_CHATPOLL_OFFSET_PATH")
            .map(expand_path)
            .unwrap_or_else(|_| d_chatpoll_offset_path());
        Ok(Self {
            chat_api_token,
            chat_authorized_peer,
            pulse_api_url,
            pulse_api_token,
            offset_path,
        })
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: String,
    pub file: Option<PathBuf>,
}

impl LogConfig {
    pub fn from_env() -> Self {
        Self {
            level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            file: std::env::var("LOG_FILE").ok().map(PathBuf::from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_path_tilde_and_env() {
        std::env::set_var("PULSE_TEST_VAR", "world");
        let p = expand_path("$PULSE_TEST_VAR/hello".to_string());
        assert_eq!(p, PathBuf::from("world/hello"));
        let p2 = expand_path("${PULSE_TEST_VAR}/hi".to_string());
        assert_eq!(p2, PathBuf::from("world/hi"));
    }

    #[test]
    fn http_config_requires_nonempty_token() {
        // Single test (rather than split across two) since env vars are
        // process-global and cargo runs tests in the same binary concurrently.
        std::env::remove_var("PULSE_API_TOKEN");
        assert!(HttpConfig::from_env().is_err());

        std::env::set_var("PULSE_API_TOKEN", "");
        assert!(HttpConfig::from_env().is_err());

        std::env::set_var("PULSE_API_TOKEN", "secret");
        assert!(HttpConfig::from_env().is_ok());
        std::env::remove_var("PULSE_API_TOKEN");
    }
}
