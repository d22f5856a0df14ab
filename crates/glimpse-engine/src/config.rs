use std::env;
use std::time::Duration;

use anyhow::{anyhow, Result};

const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_REQUEST_TIMEOUT_S: f64 = 90.0;
const MIN_REQUEST_TIMEOUT_S: f64 = 15.0;
const MAX_REQUEST_TIMEOUT_S: f64 = 300.0;

/// Settings for the remote analysis client, read from the environment.
///
/// | variable | meaning |
/// |---|---|
/// | `GEMINI_API_KEY` / `GOOGLE_API_KEY` | API key |
/// | `GEMINI_API_BASE` | API base URL |
/// | `GLIMPSE_MODEL` | requested model |
/// | `GLIMPSE_REQUEST_TIMEOUT` | request timeout in seconds |
#[derive(Debug, Clone, PartialEq)]
pub struct AnalyzerConfig {
    pub api_key: Option<String>,
    pub api_base: String,
    pub model: Option<String>,
    pub request_timeout_s: f64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base: DEFAULT_API_BASE.to_string(),
            model: None,
            request_timeout_s: DEFAULT_REQUEST_TIMEOUT_S,
        }
    }
}

impl AnalyzerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        Self {
            api_key: non_empty("GEMINI_API_KEY").or_else(|| non_empty("GOOGLE_API_KEY")),
            api_base: non_empty("GEMINI_API_BASE")
                .map(|value| value.trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            model: non_empty("GLIMPSE_MODEL"),
            request_timeout_s: clamp_timeout(non_empty("GLIMPSE_REQUEST_TIMEOUT").as_deref()),
        }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        if let Some(model) = model.filter(|value| !value.trim().is_empty()) {
            self.model = Some(model.trim().to_string());
        }
        self
    }

    pub fn with_request_timeout(mut self, seconds: Option<f64>) -> Self {
        if let Some(seconds) = seconds {
            self.request_timeout_s = seconds.clamp(MIN_REQUEST_TIMEOUT_S, MAX_REQUEST_TIMEOUT_S);
        }
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.request_timeout_s)
    }

    pub fn require_api_key(&self) -> Result<&str> {
        self.api_key
            .as_deref()
            .ok_or_else(|| anyhow!("GEMINI_API_KEY or GOOGLE_API_KEY not set"))
    }
}

fn clamp_timeout(raw: Option<&str>) -> f64 {
    raw.and_then(|value| value.trim().parse::<f64>().ok())
        .filter(|value| value.is_finite())
        .unwrap_or(DEFAULT_REQUEST_TIMEOUT_S)
        .clamp(MIN_REQUEST_TIMEOUT_S, MAX_REQUEST_TIMEOUT_S)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_environment_is_empty() {
        let config = AnalyzerConfig::from_lookup(lookup_from(&[]));
        assert_eq!(config, AnalyzerConfig::default());
        assert!(config.require_api_key().is_err());
    }

    #[test]
    fn google_key_is_a_fallback_and_blank_values_are_ignored() {
        let config = AnalyzerConfig::from_lookup(lookup_from(&[
            ("GEMINI_API_KEY", "   "),
            ("GOOGLE_API_KEY", " g-key "),
            ("GEMINI_API_BASE", "https://proxy.test/v1beta/"),
            ("GLIMPSE_MODEL", "gemini-2.5-pro"),
        ]));
        assert_eq!(config.require_api_key().ok(), Some("g-key"));
        assert_eq!(config.api_base, "https://proxy.test/v1beta");
        assert_eq!(config.model.as_deref(), Some("gemini-2.5-pro"));
    }

    #[test]
    fn missing_key_message_names_both_variables() {
        let err = AnalyzerConfig::default()
            .require_api_key()
            .err()
            .map(|err| err.to_string())
            .unwrap_or_default();
        assert_eq!(err, "GEMINI_API_KEY or GOOGLE_API_KEY not set");
    }

    #[test]
    fn timeout_is_clamped() {
        let parse = |raw: &str| {
            AnalyzerConfig::from_lookup(lookup_from(&[("GLIMPSE_REQUEST_TIMEOUT", raw)]))
                .request_timeout_s
        };
        assert_eq!(parse("120"), 120.0);
        assert_eq!(parse("1"), 15.0);
        assert_eq!(parse("9000"), 300.0);
        assert_eq!(parse("soon"), 90.0);
        assert_eq!(
            AnalyzerConfig::default()
                .with_request_timeout(Some(5.0))
                .request_timeout(),
            Duration::from_secs(15)
        );
    }

    #[test]
    fn flag_model_overrides_environment() {
        let config = AnalyzerConfig::from_lookup(lookup_from(&[("GLIMPSE_MODEL", "a")]))
            .with_model(Some(" b ".to_string()))
            .with_model(None);
        assert_eq!(config.model.as_deref(), Some("b"));
    }
}
