//! Configuration for the journal sync client.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::core::errors::{SyncError, SyncResult};

/// Environment variable overriding [`ApiConfig::base_url`].
pub const ENV_API_URL: &str = "JOURNAL_SYNC_API_URL";
/// Environment variable overriding [`PollingConfig::interval_ms`].
pub const ENV_POLL_INTERVAL_MS: &str = "JOURNAL_SYNC_POLL_INTERVAL_MS";
/// Environment variable overriding [`PollingConfig::max_attempts`].
pub const ENV_POLL_MAX_ATTEMPTS: &str = "JOURNAL_SYNC_POLL_MAX_ATTEMPTS";
/// Environment variable overriding [`SpeechConfig::synthesize_replies`].
pub const ENV_SPEAK_REPLIES: &str = "JOURNAL_SYNC_SPEAK_REPLIES";

/// Top-level configuration for the client.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Backend endpoint settings.
    pub api: ApiConfig,
    /// Poll loop settings.
    pub polling: PollingConfig,
    /// Speech settings.
    pub speech: SpeechConfig,
}

impl ClientConfig {
    /// Build a configuration from defaults plus `JOURNAL_SYNC_*` environment variables.
    ///
    /// # Errors
    /// Returns an error if an override cannot be parsed or the result is invalid.
    pub fn from_env() -> SyncResult<Self> {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a key lookup (normally the process environment).
    ///
    /// # Errors
    /// Returns an error if a numeric or boolean override cannot be parsed.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> SyncResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_API_URL) {
            self.api.base_url = url;
        }
        if let Some(raw) = lookup(ENV_POLL_INTERVAL_MS) {
            self.polling.interval_ms = parse_override(ENV_POLL_INTERVAL_MS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_POLL_MAX_ATTEMPTS) {
            self.polling.max_attempts = match raw.trim() {
                "" | "none" | "unbounded" => None,
                value => Some(parse_override(ENV_POLL_MAX_ATTEMPTS, value)?),
            };
        }
        if let Some(raw) = lookup(ENV_SPEAK_REPLIES) {
            self.speech.synthesize_replies = match raw.trim() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                other => {
                    return Err(SyncError::InvalidConfig(format!(
                        "{ENV_SPEAK_REPLIES} must be a boolean, got {other:?}"
                    )));
                }
            };
        }
        Ok(())
    }

    /// Validate configuration invariants.
    ///
    /// # Errors
    /// Returns an error if any values are out of range or invalid.
    pub fn validate(&self) -> SyncResult<()> {
        self.api.base_url()?;

        for (name, path) in [
            ("api.chat_path", &self.api.chat_path),
            ("api.ocr_path", &self.api.ocr_path),
            ("api.entry_path", &self.api.entry_path),
            ("api.entries_path", &self.api.entries_path),
            ("api.tts_path", &self.api.tts_path),
            ("api.suggestions_path", &self.api.suggestions_path),
        ] {
            if !path.starts_with('/') {
                return Err(SyncError::InvalidConfig(format!(
                    "{name} must start with '/', got {path:?}"
                )));
            }
        }

        if self.api.connect_timeout_seconds == 0 {
            return Err(SyncError::InvalidConfig(
                "api.connect_timeout_seconds must be > 0".to_string(),
            ));
        }

        if self.polling.interval_ms == 0 {
            return Err(SyncError::InvalidConfig(
                "polling.interval_ms must be > 0".to_string(),
            ));
        }

        if self.polling.max_attempts == Some(0) {
            return Err(SyncError::InvalidConfig(
                "polling.max_attempts must be > 0 when set".to_string(),
            ));
        }

        Ok(())
    }
}

fn parse_override<T: std::str::FromStr>(key: &str, raw: &str) -> SyncResult<T> {
    raw.trim()
        .parse()
        .map_err(|_| SyncError::InvalidConfig(format!("{key} has invalid value {raw:?}")))
}

/// Backend endpoint settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL of the journaling backend.
    pub base_url: String,
    /// Streamed mind-search chat endpoint.
    pub chat_path: String,
    /// Streamed OCR endpoint.
    pub ocr_path: String,
    /// Journal entry creation endpoint.
    pub entry_path: String,
    /// Journal entries collection (single entries live under `{entries_path}/{id}`).
    pub entries_path: String,
    /// Speech synthesis endpoint.
    pub tts_path: String,
    /// Reply suggestions endpoint.
    pub suggestions_path: String,
    /// TCP connect timeout.
    pub connect_timeout_seconds: u64,
    /// Whole-request timeout for non-streamed calls.
    pub request_timeout_seconds: Option<u64>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            chat_path: "/query/chat".to_string(),
            ocr_path: "/journal/ocr".to_string(),
            entry_path: "/journal/entry".to_string(),
            entries_path: "/journal/entries".to_string(),
            tts_path: "/tts/synthesize".to_string(),
            suggestions_path: "/suggestions".to_string(),
            connect_timeout_seconds: 10,
            request_timeout_seconds: Some(30),
        }
    }
}

impl ApiConfig {
    /// Parse the configured base URL.
    ///
    /// # Errors
    /// Returns an error if the URL is malformed or not http(s).
    pub fn base_url(&self) -> SyncResult<Url> {
        let url = Url::parse(&self.base_url)?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(SyncError::InvalidConfig(format!(
                "api.base_url must be http or https, got {other}"
            ))),
        }
    }

    /// Connect timeout as a `Duration`.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    /// Request timeout for non-streamed calls, if any.
    #[must_use]
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_seconds.map(Duration::from_secs)
    }
}

/// Poll loop settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Interval between fetches in milliseconds.
    pub interval_ms: u64,
    /// Optional cap on fetches per session; `None` polls until settled.
    pub max_attempts: Option<u64>,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: 2000,
            max_attempts: None,
        }
    }
}

impl PollingConfig {
    /// Poll interval as a `Duration`.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Builder for poll configuration.
#[derive(Debug, Clone, Default)]
pub struct PollingConfigBuilder {
    interval_ms: Option<u64>,
    max_attempts: Option<u64>,
}

impl PollingConfigBuilder {
    /// Create a new builder with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the interval between fetches.
    #[must_use]
    pub const fn interval_ms(mut self, ms: u64) -> Self {
        self.interval_ms = Some(ms);
        self
    }

    /// Cap the number of fetches per session.
    #[must_use]
    pub const fn max_attempts(mut self, attempts: u64) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Build the poll configuration.
    #[must_use]
    pub fn build(self) -> PollingConfig {
        let default = PollingConfig::default();
        PollingConfig {
            interval_ms: self.interval_ms.unwrap_or(default.interval_ms),
            max_attempts: self.max_attempts.or(default.max_attempts),
        }
    }
}

/// Speech settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechConfig {
    /// Synthesize audio for each completed assistant reply.
    pub synthesize_replies: bool,
    /// Dictation language tag.
    pub language: String,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            synthesize_replies: true,
            language: "en-US".to_string(),
        }
    }
}
