//! LLM oracle client.
//!
//! Speaks the OpenAI chat-completions wire format against whatever endpoint
//! is configured. The oracle never gets raw provider payloads; callers build
//! an [`OracleRequest`] and the response contract is parsed strictly, so a
//! model that drifts off-vocabulary degrades into [`OracleError::Contract`]
//! rather than a bad label in the store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::debug;

use shared_types::{OracleRequest, OracleResponse};

use crate::config::AppConfig;

#[derive(Debug, Error)]
pub enum OracleError {
    /// Endpoint unreachable, timed out, or returned a non-success status.
    /// The pipeline falls back to the deterministic verdict.
    #[error("oracle unavailable: {0}")]
    Unavailable(String),
    /// The endpoint answered but the payload violated the response contract
    /// (not JSON, unknown label, confidence out of range).
    #[error("oracle contract violation: {0}")]
    Contract(String),
}

#[async_trait]
pub trait ClassificationOracle: Send + Sync {
    async fn classify(&self, request: &OracleRequest) -> Result<OracleResponse, OracleError>;
}

const SYSTEM_PROMPT: &str = "You triage a venture capital partner's inbox. \
Classify the email into exactly one label: dealflow (a founder raising money \
or a warm intro to one), hiring (recruiting in either direction), networking \
(relationship building with no live deal), spam (phishing or scams), or \
general (receipts, newsletters, service notifications). Respond with a JSON \
object only: {\"label\": string, \"confidence\": number between 0 and 1, \
\"rationale\": string, \"signals\": [string]}.";

/// HTTP oracle with a process-wide concurrency cap. Clones share the
/// semaphore, so worker count never multiplies in-flight LLM calls.
#[derive(Clone)]
pub struct LlmOracle {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    timeout: Duration,
    permits: Arc<Semaphore>,
}

impl LlmOracle {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: config.oracle_endpoint.clone(),
            model: config.oracle_model.clone(),
            api_key: config.oracle_api_key.clone(),
            timeout: config.oracle_timeout,
            permits: Arc::new(Semaphore::new(config.llm_concurrency)),
        }
    }
}

#[async_trait]
impl ClassificationOracle for LlmOracle {
    async fn classify(&self, request: &OracleRequest) -> Result<OracleResponse, OracleError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| OracleError::Unavailable(e.to_string()))?;

        let user_prompt = serde_json::to_string(request)
            .map_err(|e| OracleError::Contract(e.to_string()))?;

        let payload = json!({
            "model": self.model,
            "temperature": 0.0,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": user_prompt },
            ],
        });

        let mut req = self
            .client
            .post(&self.endpoint)
            .timeout(self.timeout)
            .json(&payload);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let response = req
            .send()
            .await
            .map_err(|e| OracleError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(OracleError::Unavailable(format!("http status {status}")));
        }

        let body: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| OracleError::Contract(e.to_string()))?;

        let content = body
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or_else(|| OracleError::Contract("empty choices".to_string()))?;

        let parsed = parse_oracle_content(content)?;
        debug!(label = %parsed.label.as_str(), confidence = parsed.confidence, "oracle verdict");
        Ok(parsed)
    }
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

/// Parse the model's message content into the response contract. Tolerates
/// a fenced code block around the JSON but nothing else.
fn parse_oracle_content(content: &str) -> Result<OracleResponse, OracleError> {
    let trimmed = content.trim();
    let trimmed = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|s| s.trim_end_matches("```").trim())
        .unwrap_or(trimmed);

    let parsed: OracleResponse = serde_json::from_str(trimmed)
        .map_err(|e| OracleError::Contract(e.to_string()))?;

    if !(0.0..=1.0).contains(&parsed.confidence) {
        return Err(OracleError::Contract(format!(
            "confidence {} out of range",
            parsed.confidence
        )));
    }

    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_types::OracleLabel;

    #[test]
    fn plain_json_content_parses() {
        let content = r#"{"label":"dealflow","confidence":0.91,"rationale":"founder raising seed","signals":["raising","deck link"]}"#;
        let parsed = parse_oracle_content(content).unwrap();
        assert_eq!(parsed.label, OracleLabel::Dealflow);
        assert_eq!(parsed.confidence, 0.91);
        assert_eq!(parsed.signals.len(), 2);
    }

    #[test]
    fn fenced_json_content_parses() {
        let content = "```json\n{\"label\":\"spam\",\"confidence\":0.99,\"rationale\":\"phishing\"}\n```";
        let parsed = parse_oracle_content(content).unwrap();
        assert_eq!(parsed.label, OracleLabel::Spam);
        assert!(parsed.signals.is_empty());
    }

    #[test]
    fn off_vocabulary_label_is_contract_error() {
        let content = r#"{"label":"investment","confidence":0.9,"rationale":"x"}"#;
        assert!(matches!(
            parse_oracle_content(content),
            Err(OracleError::Contract(_))
        ));
    }

    #[test]
    fn out_of_range_confidence_is_contract_error() {
        let content = r#"{"label":"general","confidence":1.4,"rationale":"x"}"#;
        assert!(matches!(
            parse_oracle_content(content),
            Err(OracleError::Contract(_))
        ));
    }

    #[test]
    fn prose_is_contract_error() {
        assert!(matches!(
            parse_oracle_content("This looks like deal flow to me."),
            Err(OracleError::Contract(_))
        ));
    }
}
