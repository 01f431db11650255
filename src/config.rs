use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ReviewError;

/// Environment variable naming an explicit TOML config file.
pub const CONFIG_PATH_ENV: &str = "CRITIQUE_CONFIG";

/// Config file picked up from the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "critique.toml";

const DEFAULT_TIMEOUT_SECS: f64 = 30.0;

/// Runtime settings for the client, buffer, and task layer.
///
/// Every field has a default, so a config file only needs the keys it changes.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Chat endpoint, e.g. `http://localhost:11434/api/chat`.
    pub api_url: String,
    pub model: String,
    /// Tokens accumulated before a size-triggered flush.
    pub buffer_size: usize,
    /// Idle flush interval. Zero disables the time trigger.
    pub flush_interval_ms: u64,
    /// Character budget for one request; code and prior review each get half.
    pub max_conversation_length: usize,
    pub request_timeout_secs: f64,
    pub max_retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:11434/api/chat".to_string(),
            model: "qwen2.5-coder".to_string(),
            buffer_size: 20,
            flush_interval_ms: 100,
            max_conversation_length: 50_000,
            request_timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_retries: 3,
        }
    }
}

impl Config {
    /// Defaults, then the TOML file (if any), then environment overrides.
    ///
    /// A missing or broken file is not fatal: it is logged and skipped.
    pub fn load() -> Self {
        let path = env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE));

        let mut config = if path.exists() {
            match Self::from_file(&path) {
                Ok(config) => {
                    tracing::info!(path = %path.display(), "loaded config file");
                    config
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), "ignoring config file: {e}");
                    Self::default()
                }
            }
        } else {
            Self::default()
        };

        config.apply_overrides(|key| env::var(key).ok());
        config
    }

    pub fn from_file(path: &Path) -> Result<Self, ReviewError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ReviewError::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ReviewError> {
        toml::from_str(text).map_err(|e| ReviewError::Config(e.to_string()))
    }

    /// Apply environment-style overrides. `lookup` returns the raw value for a
    /// variable name; values that fail to parse are logged and ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("OLLAMA_API_URL") {
            self.api_url = url;
        }
        if let Some(model) = lookup("MODEL_NAME") {
            self.model = model;
        }
        override_parsed(&lookup, "BUFFER_SIZE", &mut self.buffer_size);
        override_parsed(&lookup, "FLUSH_INTERVAL_MS", &mut self.flush_interval_ms);
        override_parsed(
            &lookup,
            "MAX_CONVERSATION_LENGTH",
            &mut self.max_conversation_length,
        );
        override_parsed(&lookup, "REQUEST_TIMEOUT", &mut self.request_timeout_secs);
        override_parsed(&lookup, "MAX_RETRIES", &mut self.max_retries);
    }

    pub fn validate(&self) -> Result<(), ReviewError> {
        if !(self.api_url.starts_with("http://") || self.api_url.starts_with("https://")) {
            return Err(ReviewError::Config(format!(
                "api_url must be an http(s) URL, got {:?}",
                self.api_url
            )));
        }
        if self.model.trim().is_empty() {
            return Err(ReviewError::Config("model must not be empty".to_string()));
        }
        if self.buffer_size == 0 {
            return Err(ReviewError::Config("buffer_size must be at least 1".to_string()));
        }
        if self.max_conversation_length < 2 {
            return Err(ReviewError::Config(
                "max_conversation_length must be at least 2".to_string(),
            ));
        }
        if !(self.request_timeout_secs.is_finite() && self.request_timeout_secs > 0.0) {
            return Err(ReviewError::Config(format!(
                "request_timeout_secs must be positive, got {}",
                self.request_timeout_secs
            )));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.request_timeout_secs)
            .ok()
            .filter(|d| !d.is_zero())
            .unwrap_or(Duration::from_secs_f64(DEFAULT_TIMEOUT_SECS))
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

fn override_parsed<F, T>(lookup: &F, key: &str, slot: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *slot = value,
        Err(e) => tracing::warn!(key, value = %raw, "invalid config override: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.api_url, "http://localhost:11434/api/chat");
        assert_eq!(config.model, "qwen2.5-coder");
        assert_eq!(config.buffer_size, 20);
        assert_eq!(config.flush_interval_ms, 100);
        assert_eq!(config.max_conversation_length, 50_000);
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.max_retries, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let config = Config::from_toml_str("model = \"llama3\"\nbuffer_size = 5\n").unwrap();
        assert_eq!(config.model, "llama3");
        assert_eq!(config.buffer_size, 5);
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn malformed_toml_is_config_error() {
        let err = Config::from_toml_str("buffer_size = \"many\"").unwrap_err();
        assert!(matches!(err, ReviewError::Config(_)));
    }

    #[test]
    fn env_overrides_win() {
        let mut config = Config::default();
        config.apply_overrides(lookup_from(&[
            ("OLLAMA_API_URL", "http://gpu-box:11434/api/chat"),
            ("MODEL_NAME", "codellama"),
            ("FLUSH_INTERVAL_MS", "250"),
            ("REQUEST_TIMEOUT", "12.5"),
            ("MAX_RETRIES", "0"),
        ]));
        assert_eq!(config.api_url, "http://gpu-box:11434/api/chat");
        assert_eq!(config.model, "codellama");
        assert_eq!(config.flush_interval_ms, 250);
        assert_eq!(config.request_timeout(), Duration::from_millis(12_500));
        assert_eq!(config.max_retries, 0);
    }

    #[test]
    fn unparsable_override_is_ignored() {
        let mut config = Config::default();
        config.apply_overrides(lookup_from(&[("BUFFER_SIZE", "lots"), ("MAX_RETRIES", "-1")]));
        assert_eq!(config.buffer_size, 20);
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let bad = [
            Config {
                buffer_size: 0,
                ..Config::default()
            },
            Config {
                max_conversation_length: 1,
                ..Config::default()
            },
            Config {
                request_timeout_secs: 0.0,
                ..Config::default()
            },
            Config {
                request_timeout_secs: f64::NAN,
                ..Config::default()
            },
            Config {
                api_url: "localhost:11434/api/chat".to_string(),
                ..Config::default()
            },
        ];
        for config in bad {
            assert!(config.validate().is_err(), "{config:?} should be rejected");
        }
    }
}
