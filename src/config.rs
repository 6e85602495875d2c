use std::{str::FromStr, time::Duration};

use tracing::Level;

pub const DEFAULT_GEMINI_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(thiserror::Error, Debug)]
#[error("Invalid value for {key}: {value}")]
pub struct ConfigError {
    pub key: &'static str,
    pub value: String,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub static_dir: String,
    pub body_limit: usize,
    pub log_level: Level,

    /* ── room lifecycle ── */
    pub grace_period: Duration,
    pub reaper_interval: Duration,
    pub chat_replay: usize,
    pub default_max_users: usize,

    /* ── AI backend ── */
    pub gemini_key: Option<String>,
    pub gemini_base: String,
    pub gemini_model: String,
    pub ai_timeout: Duration,
    pub ai_max_retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 5002,
            static_dir: "static".into(),
            body_limit: 100 * 1024 * 1024,
            log_level: Level::INFO,
            grace_period: Duration::from_secs(300),
            reaper_interval: Duration::from_secs(60),
            chat_replay: 50,
            default_max_users: 10,
            gemini_key: None,
            gemini_base: DEFAULT_GEMINI_BASE.into(),
            gemini_model: "gemini-2.5-flash".into(),
            ai_timeout: Duration::from_secs(300),
            ai_max_retries: 2,
        }
    }
}

impl Config {
    /// Reads the process environment on top of [`Config::default`].
    /// Call `dotenvy::dotenv()` first if a `.env` file should count.
    pub fn from_environment() -> Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            host: var("HOST").unwrap_or(d.host),
            port: parsed("PORT")?.unwrap_or(d.port),
            static_dir: var("STATIC_DIR").unwrap_or(d.static_dir),
            body_limit: parsed("BODY_LIMIT_BYTES")?.unwrap_or(d.body_limit),
            log_level: parsed("LOG_LEVEL")?.unwrap_or(d.log_level),
            grace_period: secs("ROOM_GRACE_SECS")?.unwrap_or(d.grace_period),
            reaper_interval: nonzero_secs("REAPER_INTERVAL_SECS")?.unwrap_or(d.reaper_interval),
            chat_replay: parsed("CHAT_REPLAY_LIMIT")?.unwrap_or(d.chat_replay),
            default_max_users: parsed("DEFAULT_MAX_USERS")?.unwrap_or(d.default_max_users),
            gemini_key: var("GEMINI_API_KEY").or_else(|| var("API_KEY")),
            gemini_base: var("GEMINI_API_BASE").unwrap_or(d.gemini_base),
            gemini_model: var("GEMINI_MODEL").unwrap_or(d.gemini_model),
            ai_timeout: secs("AI_TIMEOUT_SECS")?.unwrap_or(d.ai_timeout),
            ai_max_retries: parsed("AI_MAX_RETRIES")?.unwrap_or(d.ai_max_retries),
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parsed<T: FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    var(key)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError { key, value: value.clone() })
        })
        .transpose()
}

fn secs(key: &'static str) -> Result<Option<Duration>, ConfigError> {
    Ok(parsed::<u64>(key)?.map(Duration::from_secs))
}

/// Like [`secs`], but zero is refused: a timer period must be positive.
fn nonzero_secs(key: &'static str) -> Result<Option<Duration>, ConfigError> {
    match secs(key)? {
        Some(d) if d.is_zero() => Err(ConfigError { key, value: "0".into() }),
        other => Ok(other),
    }
}

/// `AIza…tTE` style masking so keys never hit the log in full.
pub fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() < 8 {
        return "unset".into();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}…{tail}")
}
