//! Configuration types.
//!
//! Everything is read from the environment once at startup. Tests go through
//! [`TriageConfig::from_lookup`] so they never touch the process environment.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::pipeline::worker::{DEFAULT_MAX_IN_FLIGHT, DEFAULT_SHUTDOWN_GRACE};

/// Default number of messages kept per conversation.
pub const DEFAULT_CONTEXT_WINDOW: usize = 5;

/// Default minimum confidence for an escalation.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.75;

const DEFAULT_MODEL: &str = "gpt-4o";
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_DB_PATH: &str = "./data/emergency-triage.db";
const DEFAULT_LOG_DIR: &str = "logs";

/// Log verbosity accepted by `TRIAGE_LOG_LEVEL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(Self::Error),
            "warn" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            other => Err(format!("expected error|warn|info|debug, got '{other}'")),
        }
    }
}

/// Classifier endpoint settings.
#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub api_key: SecretString,
    pub model: String,
    pub base_url: String,
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct TriageConfig {
    pub llm: LlmSettings,
    /// Telegram bot token. When absent the stdin transport is used.
    pub telegram_bot_token: Option<SecretString>,
    /// Address that receives alerts.
    pub alert_recipient: String,
    pub monitored_conversations: HashSet<String>,
    /// Parsed and validated; only applied when `enforce_threshold` is set.
    pub confidence_threshold: f64,
    pub enforce_threshold: bool,
    pub context_window: usize,
    pub db_path: PathBuf,
    pub classify_timeout: Duration,
    pub dispatch_timeout: Duration,
    pub max_in_flight: usize,
    pub shutdown_grace: Duration,
    pub log_level: LogLevel,
    pub log_dir: PathBuf,
}

impl TriageConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let require =
            |key: &str| get(key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()));

        let api_key = require("OPENAI_API_KEY")?;
        let alert_recipient = require("TRIAGE_ALERT_RECIPIENT")?;

        let monitored_conversations: HashSet<String> = require("TRIAGE_MONITORED_CONVERSATIONS")?
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if monitored_conversations.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "TRIAGE_MONITORED_CONVERSATIONS".into(),
                message: "at least one conversation id is required".into(),
            });
        }

        let confidence_threshold: f64 = parse_or(
            get("TRIAGE_CONFIDENCE_THRESHOLD"),
            "TRIAGE_CONFIDENCE_THRESHOLD",
            DEFAULT_CONFIDENCE_THRESHOLD,
        )?;
        if !(0.0..=1.0).contains(&confidence_threshold) {
            return Err(ConfigError::InvalidValue {
                key: "TRIAGE_CONFIDENCE_THRESHOLD".into(),
                message: format!("{confidence_threshold} is outside [0, 1]"),
            });
        }

        let context_window: usize = parse_or(
            get("TRIAGE_CONTEXT_WINDOW"),
            "TRIAGE_CONTEXT_WINDOW",
            DEFAULT_CONTEXT_WINDOW,
        )?;
        if context_window == 0 {
            return Err(ConfigError::InvalidValue {
                key: "TRIAGE_CONTEXT_WINDOW".into(),
                message: "must be at least 1".into(),
            });
        }

        let max_in_flight: usize =
            parse_or(get("TRIAGE_MAX_IN_FLIGHT"), "TRIAGE_MAX_IN_FLIGHT", DEFAULT_MAX_IN_FLIGHT)?;
        if max_in_flight == 0 {
            return Err(ConfigError::InvalidValue {
                key: "TRIAGE_MAX_IN_FLIGHT".into(),
                message: "must be at least 1".into(),
            });
        }

        let enforce_threshold = match get("TRIAGE_ENFORCE_THRESHOLD") {
            None => false,
            Some(raw) => parse_bool(&raw).ok_or_else(|| ConfigError::InvalidValue {
                key: "TRIAGE_ENFORCE_THRESHOLD".into(),
                message: format!("expected a boolean, got '{raw}'"),
            })?,
        };

        let log_level = match get("TRIAGE_LOG_LEVEL") {
            None => LogLevel::Info,
            Some(raw) => raw.parse::<LogLevel>().map_err(|message| ConfigError::InvalidValue {
                key: "TRIAGE_LOG_LEVEL".into(),
                message,
            })?,
        };

        let classify_secs: u64 = parse_or(
            get("TRIAGE_CLASSIFY_TIMEOUT_SECS"),
            "TRIAGE_CLASSIFY_TIMEOUT_SECS",
            30,
        )?;
        let dispatch_secs: u64 = parse_or(
            get("TRIAGE_DISPATCH_TIMEOUT_SECS"),
            "TRIAGE_DISPATCH_TIMEOUT_SECS",
            15,
        )?;

        Ok(Self {
            llm: LlmSettings {
                api_key: SecretString::from(api_key),
                model: get("TRIAGE_LLM_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
                base_url: get("TRIAGE_LLM_BASE_URL")
                    .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            },
            telegram_bot_token: get("TELEGRAM_BOT_TOKEN").map(SecretString::from),
            alert_recipient,
            monitored_conversations,
            confidence_threshold,
            enforce_threshold,
            context_window,
            db_path: PathBuf::from(
                get("TRIAGE_DB_PATH").unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            ),
            classify_timeout: Duration::from_secs(classify_secs),
            dispatch_timeout: Duration::from_secs(dispatch_secs),
            max_in_flight,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            log_level,
            log_dir: PathBuf::from(
                get("TRIAGE_LOG_DIR").unwrap_or_else(|| DEFAULT_LOG_DIR.to_string()),
            ),
        })
    }
}

fn parse_or<T>(raw: Option<String>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{raw}': {e}"),
        }),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
