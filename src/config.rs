//! Configuration loader and validator for the schedule bot.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::parser::ParserOptions;
use crate::site::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub telegram: Telegram,
    pub site: Site,
    #[serde(default)]
    pub parser: Parser,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub check_interval_secs: u64,
    pub request_timeout_secs: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    2000
}

/// Telegram bot settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Telegram {
    pub bot_token: String,
    /// Operator chat: receives digests and may run `/update`.
    #[serde(default)]
    pub admin_id: Option<i64>,
}

/// Where the schedule is published.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Site {
    pub schedule_url: String,
    pub origin: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Parser {
    #[serde(default)]
    pub wide_split_rooms: bool,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// `DATABASE_URL` if set, else a file in `app.data_dir`.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/schedule.db", self.app.data_dir))
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.app.check_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.app.request_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.app.retry_attempts,
            delay: Duration::from_millis(self.app.retry_delay_ms),
        }
    }

    pub fn parser_options(&self) -> ParserOptions {
        ParserOptions {
            wide_split_rooms: self.parser.wide_split_rooms,
        }
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

fn is_absolute_url(raw: &str) -> bool {
    reqwest::Url::parse(raw.trim()).is_ok_and(|u| u.has_host())
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.check_interval_secs == 0 {
        return Err(ConfigError::Invalid("app.check_interval_secs must be > 0"));
    }
    if cfg.app.request_timeout_secs == 0 {
        return Err(ConfigError::Invalid("app.request_timeout_secs must be > 0"));
    }
    if cfg.app.retry_attempts == 0 {
        return Err(ConfigError::Invalid("app.retry_attempts must be > 0"));
    }

    if cfg.telegram.bot_token.trim().is_empty() {
        return Err(ConfigError::Invalid("telegram.bot_token must be non-empty"));
    }

    if cfg.site.schedule_url.trim().is_empty() {
        return Err(ConfigError::Invalid("site.schedule_url must be non-empty"));
    }
    if !is_absolute_url(&cfg.site.schedule_url) {
        return Err(ConfigError::Invalid("site.schedule_url must be an absolute URL"));
    }
    if !is_absolute_url(&cfg.site.origin) {
        return Err(ConfigError::Invalid("site.origin must be an absolute URL"));
    }

    Ok(())
}

/// Complete sample configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  check_interval_secs: 1800
  request_timeout_secs: 10
  retry_attempts: 3
  retry_delay_ms: 2000

telegram:
  bot_token: "YOUR_TELEGRAM_BOT_TOKEN"
  admin_id: 123456789

site:
  schedule_url: "https://edu.tatar.ru/nchelny/page2525.htm"
  origin: "https://edu.tatar.ru"

parser:
  wide_split_rooms: false
"#
}
