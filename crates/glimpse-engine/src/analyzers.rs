use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use glimpse_contracts::analysis::{AnalyzeCall, AnalyzeReply};
use glimpse_contracts::models::{ModelSelector, ModelSpec, VISION_CAPABILITY};
use reqwest::blocking::{Client as HttpClient, RequestBuilder};
use serde_json::{json, Value};

use crate::config::AnalyzerConfig;
use crate::response_json_or_error;

const API_KEY_HEADER: &str = "x-goog-api-key";

/// The external analysis contract: one call in, text (possibly empty) or an
/// error out. Implementations hold no per-call state and are shared across
/// worker threads.
pub trait ImageAnalyzer: Send + Sync {
    fn name(&self) -> &str;
    fn analyze(&self, call: &AnalyzeCall) -> Result<AnalyzeReply>;
}

#[derive(Default)]
pub struct AnalyzerRegistry {
    analyzers: BTreeMap<String, Arc<dyn ImageAnalyzer>>,
}

impl AnalyzerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<A: ImageAnalyzer + 'static>(&mut self, analyzer: A) {
        self.register_shared(Arc::new(analyzer));
    }

    pub fn register_shared(&mut self, analyzer: Arc<dyn ImageAnalyzer>) {
        self.analyzers
            .insert(analyzer.name().to_string(), analyzer);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ImageAnalyzer>> {
        self.analyzers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.analyzers.keys().cloned().collect()
    }
}

/// Registers the offline analyzer, plus Gemini when an API key is configured.
pub fn default_analyzer_registry(config: &AnalyzerConfig) -> Result<AnalyzerRegistry> {
    let mut analyzers = AnalyzerRegistry::new();
    analyzers.register(DryrunAnalyzer);
    if config.api_key.is_some() {
        analyzers.register(GeminiAnalyzer::from_config(config)?);
    }
    Ok(analyzers)
}

pub struct ResolvedAnalyzer {
    pub analyzer: Arc<dyn ImageAnalyzer>,
    pub model: ModelSpec,
    pub fallback_reason: Option<String>,
}

/// Picks the vision model for `requested` (or the configured default) and the
/// analyzer serving its provider. A Gemini model without an API key is an
/// error.
pub fn resolve_analyzer(
    config: &AnalyzerConfig,
    registry: &AnalyzerRegistry,
    requested: Option<&str>,
) -> Result<ResolvedAnalyzer> {
    let requested = requested.or(config.model.as_deref());
    let selection = ModelSelector::new(None)
        .select(requested, VISION_CAPABILITY)
        .map_err(|message| anyhow!(message))?;
    let provider = selection.model.provider.as_str();
    let analyzer = match registry.get(provider) {
        Some(analyzer) => analyzer,
        None if provider == "gemini" => {
            config.require_api_key()?;
            return Err(anyhow!("gemini analyzer is not registered"));
        }
        None => return Err(anyhow!("no analyzer registered for provider '{provider}'")),
    };
    Ok(ResolvedAnalyzer {
        analyzer,
        model: selection.model,
        fallback_reason: selection.fallback_reason,
    })
}

/// Offline analyzer. Answers deterministically from the call itself.
pub struct DryrunAnalyzer;

impl ImageAnalyzer for DryrunAnalyzer {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn analyze(&self, call: &AnalyzeCall) -> Result<AnalyzeReply> {
        let prompt = call.prompt.trim();
        let text = format!(
            "Dry run analysis ({}, {} base64 chars). Prompt: {}",
            call.mime_type,
            call.image_data.len(),
            if prompt.is_empty() { "(empty)" } else { prompt }
        );
        Ok(AnalyzeReply {
            text: Some(text),
            model: call.model.clone(),
            input_tokens: None,
            output_tokens: None,
        })
    }
}

pub struct GeminiAnalyzer {
    api_base: String,
    api_key: String,
    timeout: Duration,
    http: HttpClient,
}

impl GeminiAnalyzer {
    pub fn from_config(config: &AnalyzerConfig) -> Result<Self> {
        let api_key = config.require_api_key()?.to_string();
        let http = HttpClient::builder()
            .timeout(config.request_timeout())
            .build()
            .context("failed to build Gemini HTTP client")?;
        Ok(Self {
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key,
            timeout: config.request_timeout(),
            http,
        })
    }

    fn endpoint_for_model(&self, model: &str) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    /// generateContent request for `call`. The API key is sent only as a header.
    fn request(&self, endpoint: &str, call: &AnalyzeCall) -> RequestBuilder {
        self.http
            .post(endpoint)
            .header(API_KEY_HEADER, &self.api_key)
            .timeout(self.timeout)
            .json(&Self::build_payload(call))
    }

    fn build_payload(call: &AnalyzeCall) -> Value {
        json!({
            "contents": [{
                "role": "user",
                "parts": [
                    {
                        "inlineData": {
                            "mimeType": call.mime_type,
                            "data": call.image_data,
                        }
                    },
                    { "text": call.prompt },
                ],
            }],
        })
    }

    /// Text of the first candidate, parts joined in order. Thought parts are
    /// skipped. `None` when there is no text at all.
    fn extract_text(response: &Value) -> Option<String> {
        let parts = response
            .get("candidates")
            .and_then(Value::as_array)
            .and_then(|candidates| candidates.first())
            .and_then(|candidate| candidate.get("content"))
            .and_then(|content| content.get("parts"))
            .and_then(Value::as_array)?;
        let text = parts
            .iter()
            .filter(|part| !part.get("thought").and_then(Value::as_bool).unwrap_or(false))
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<String>();
        if text.is_empty() {
            return None;
        }
        Some(text)
    }

    fn extract_token_usage(response: &Value) -> (Option<i64>, Option<i64>) {
        let Some(usage) = response.get("usageMetadata").and_then(Value::as_object) else {
            return (None, None);
        };
        (
            usage.get("promptTokenCount").and_then(Value::as_i64),
            usage.get("candidatesTokenCount").and_then(Value::as_i64),
        )
    }
}

impl ImageAnalyzer for GeminiAnalyzer {
    fn name(&self) -> &str {
        "gemini"
    }

    fn analyze(&self, call: &AnalyzeCall) -> Result<AnalyzeReply> {
        let endpoint = self.endpoint_for_model(&call.model);
        let response = self
            .request(&endpoint, call)
            .send()
            .map_err(reqwest::Error::without_url)
            .with_context(|| format!("Gemini request failed ({endpoint})"))?;
        let payload = response_json_or_error("Gemini", response)?;
        let text = Self::extract_text(&payload);
        if text.is_none() {
            let block_reason = payload
                .get("promptFeedback")
                .and_then(|feedback| feedback.get("blockReason"))
                .and_then(Value::as_str);
            tracing::warn!(model = %call.model, ?block_reason, "Gemini returned no text");
        }
        let (input_tokens, output_tokens) = Self::extract_token_usage(&payload);
        Ok(AnalyzeReply {
            text,
            model: payload
                .get("modelVersion")
                .and_then(Value::as_str)
                .unwrap_or(call.model.as_str())
                .to_string(),
            input_tokens,
            output_tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn call_for_test() -> AnalyzeCall {
        AnalyzeCall {
            prompt: "What is this?".to_string(),
            image_data: "aGVsbG8=".to_string(),
            mime_type: "image/png".to_string(),
            model: "gemini-2.5-flash".to_string(),
        }
    }

    fn config_with_key() -> AnalyzerConfig {
        AnalyzerConfig {
            api_key: Some("test-key".to_string()),
            api_base: "https://example.test/v1beta/".to_string(),
            ..AnalyzerConfig::default()
        }
    }

    #[test]
    fn gemini_payload_puts_image_before_prompt() {
        let payload = GeminiAnalyzer::build_payload(&call_for_test());
        assert_eq!(
            payload,
            json!({
                "contents": [{
                    "role": "user",
                    "parts": [
                        {"inlineData": {"mimeType": "image/png", "data": "aGVsbG8="}},
                        {"text": "What is this?"},
                    ],
                }],
            })
        );
    }

    #[test]
    fn gemini_endpoint_accepts_bare_and_prefixed_models() -> anyhow::Result<()> {
        let analyzer = GeminiAnalyzer::from_config(&config_with_key())?;
        assert_eq!(
            analyzer.endpoint_for_model("gemini-2.5-flash"),
            "https://example.test/v1beta/models/gemini-2.5-flash:generateContent"
        );
        assert_eq!(
            analyzer.endpoint_for_model(" models/gemini-2.5-pro "),
            "https://example.test/v1beta/models/gemini-2.5-pro:generateContent"
        );
        Ok(())
    }

    #[test]
    fn gemini_api_key_goes_in_a_header_not_the_url() -> anyhow::Result<()> {
        let analyzer = GeminiAnalyzer::from_config(&config_with_key())?;
        let endpoint = analyzer.endpoint_for_model("gemini-2.5-flash");
        let request = analyzer.request(&endpoint, &call_for_test()).build()?;

        assert_eq!(request.url().query(), None);
        assert!(!request.url().as_str().contains("test-key"));
        assert_eq!(
            request
                .headers()
                .get("x-goog-api-key")
                .and_then(|value| value.to_str().ok()),
            Some("test-key")
        );
        Ok(())
    }

    #[test]
    fn connect_failure_does_not_reveal_the_api_key() -> anyhow::Result<()> {
        let config = AnalyzerConfig {
            api_key: Some("SECRET-KEY-123".to_string()),
            api_base: "http://127.0.0.1:1/v1beta".to_string(),
            ..AnalyzerConfig::default()
        };
        let analyzer = GeminiAnalyzer::from_config(&config)?;
        let err = match analyzer.analyze(&call_for_test()) {
            Ok(_) => panic!("nothing listens on port 1"),
            Err(err) => err,
        };

        let message = crate::error_chain_text(&err, 1200);
        assert!(message.starts_with("Gemini request failed"), "{message}");
        assert!(!message.contains("SECRET-KEY-123"), "{message}");
        assert!(!format!("{err:#}").contains("SECRET-KEY-123"));
        Ok(())
    }

    #[test]
    fn gemini_text_joins_first_candidate_parts() {
        let response = json!({
            "candidates": [
                {"content": {"parts": [
                    {"text": "planning", "thought": true},
                    {"text": "A cat "},
                    {"text": "on a mat."},
                ]}},
                {"content": {"parts": [{"text": "ignored"}]}},
            ],
            "usageMetadata": {"promptTokenCount": 258, "candidatesTokenCount": 6},
        });
        assert_eq!(
            GeminiAnalyzer::extract_text(&response).as_deref(),
            Some("A cat on a mat.")
        );
        assert_eq!(
            GeminiAnalyzer::extract_token_usage(&response),
            (Some(258), Some(6))
        );
    }

    #[test]
    fn gemini_text_is_absent_for_blocked_or_empty_responses() {
        let blocked = json!({"promptFeedback": {"blockReason": "SAFETY"}});
        assert_eq!(GeminiAnalyzer::extract_text(&blocked), None);
        assert_eq!(GeminiAnalyzer::extract_token_usage(&blocked), (None, None));

        let empty = json!({"candidates": [{"content": {"parts": [{"text": ""}]}}]});
        assert_eq!(GeminiAnalyzer::extract_text(&empty), None);
    }

    #[test]
    fn dryrun_echoes_prompt_and_media_type() -> anyhow::Result<()> {
        let reply = DryrunAnalyzer.analyze(&call_for_test())?;
        assert_eq!(
            reply.text.as_deref(),
            Some("Dry run analysis (image/png, 8 base64 chars). Prompt: What is this?")
        );
        assert_eq!(reply.model, "gemini-2.5-flash");
        Ok(())
    }

    #[test]
    fn registry_without_key_only_has_dryrun() -> anyhow::Result<()> {
        let registry = default_analyzer_registry(&AnalyzerConfig::default())?;
        assert_eq!(registry.names(), vec!["dryrun"]);

        let with_key = default_analyzer_registry(&config_with_key())?;
        assert_eq!(with_key.names(), vec!["dryrun", "gemini"]);
        Ok(())
    }

    #[test]
    fn resolving_gemini_without_key_is_fatal() -> anyhow::Result<()> {
        let config = AnalyzerConfig::default();
        let registry = default_analyzer_registry(&config)?;
        let err = resolve_analyzer(&config, &registry, None)
            .err()
            .map(|err| err.to_string())
            .unwrap_or_default();
        assert_eq!(err, "GEMINI_API_KEY or GOOGLE_API_KEY not set");

        let resolved = resolve_analyzer(&config, &registry, Some("dryrun-vision-1"))?;
        assert_eq!(resolved.analyzer.name(), "dryrun");
        assert_eq!(resolved.model.name, "dryrun-vision-1");
        assert!(resolved.fallback_reason.is_none());
        Ok(())
    }

    #[test]
    fn resolving_uses_configured_model_and_reports_fallback() -> anyhow::Result<()> {
        let config = AnalyzerConfig {
            model: Some("dryrun-vision-1".to_string()),
            ..config_with_key()
        };
        let registry = default_analyzer_registry(&config)?;
        let resolved = resolve_analyzer(&config, &registry, None)?;
        assert_eq!(resolved.analyzer.name(), "dryrun");

        let fallback = resolve_analyzer(&config, &registry, Some("gemini-9-ultra"))?;
        assert_eq!(fallback.analyzer.name(), "gemini");
        assert_eq!(fallback.model.name, "gemini-2.5-flash");
        assert!(fallback.fallback_reason.is_some());
        Ok(())
    }
}
