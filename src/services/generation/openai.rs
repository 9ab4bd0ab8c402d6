//! OpenAI-compatible chat completions client (OpenAI, OpenRouter, vLLM, ...).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use super::{Completion, Generator};
use crate::error::GenerationError;
use crate::models::{GenerationConfig, Message};
use crate::utils::text::estimate_tokens;

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct OpenAiGenerator {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    temperature: f32,
    max_tokens: u32,
}

impl OpenAiGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self, GenerationError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| GenerationError::ConnectionError(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

/// Map a non-success HTTP status onto a typed error.
fn status_error(status: StatusCode, retry_after: Option<u64>, body: String) -> GenerationError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => GenerationError::AuthError(body),
        StatusCode::TOO_MANY_REQUESTS => GenerationError::Throttled {
            message: body,
            retry_after_secs: retry_after,
        },
        s if s.is_server_error() => GenerationError::ServerError {
            status: s.as_u16(),
            message: body,
        },
        _ => GenerationError::InvalidRequest(format!("status {}: {}", status, body)),
    }
}

fn parse_completion(
    response: ChatResponse,
    messages: &[Message],
) -> Result<Completion, GenerationError> {
    let text = response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .filter(|t| !t.trim().is_empty())
        .ok_or(GenerationError::EmptyResponse)?;

    // Some gateways omit usage; fall back to an estimate so cost is never zero
    let (prompt_tokens, completion_tokens) = match response.usage {
        Some(usage) => (usage.prompt_tokens, usage.completion_tokens),
        None => (
            messages
                .iter()
                .map(|m| estimate_tokens(&m.content) as u32)
                .sum(),
            estimate_tokens(&text) as u32,
        ),
    };

    Ok(Completion {
        text,
        prompt_tokens,
        completion_tokens,
    })
}

#[async_trait]
impl Generator for OpenAiGenerator {
    async fn complete(&self, messages: &[Message]) -> Result<Completion, GenerationError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut request = self.client.post(&url).json(&ChatRequest {
            model: &self.model,
            messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            stream: false,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        tracing::debug!(model = %self.model, messages = messages.len(), "requesting completion");

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                GenerationError::Timeout
            } else if e.is_connect() {
                GenerationError::ConnectionError(e.to_string())
            } else {
                GenerationError::RequestError(e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, retry_after, body));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::InvalidResponse(e.to_string()))?;

        parse_completion(parsed, messages)
    }

    fn model(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::retry::Retryable;

    #[test]
    fn test_client_creation() {
        let config = GenerationConfig {
            url: "https://openrouter.ai/api/v1/".to_string(),
            ..Default::default()
        };
        let generator = OpenAiGenerator::new(&config).unwrap();
        assert_eq!(generator.base_url(), "https://openrouter.ai/api/v1");
        assert_eq!(generator.model(), "gpt-4o-mini");
    }

    #[test]
    fn test_status_mapping() {
        let throttled = status_error(StatusCode::TOO_MANY_REQUESTS, Some(7), "slow".into());
        assert!(matches!(
            throttled,
            GenerationError::Throttled {
                retry_after_secs: Some(7),
                ..
            }
        ));
        assert!(throttled.is_retryable());

        let unavailable = status_error(StatusCode::SERVICE_UNAVAILABLE, None, "down".into());
        assert!(unavailable.is_retryable());

        let auth = status_error(StatusCode::UNAUTHORIZED, None, "bad key".into());
        assert!(matches!(auth, GenerationError::AuthError(_)));
        assert!(!auth.is_retryable());

        let bad = status_error(StatusCode::BAD_REQUEST, None, "context too long".into());
        assert!(matches!(bad, GenerationError::InvalidRequest(_)));
    }

    #[test]
    fn test_parse_completion_with_usage() {
        let response: ChatResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"role":"assistant","content":"Hold reset [S1]."}}],
                "usage":{"prompt_tokens":120,"completion_tokens":8,"total_tokens":128}}"#,
        )
        .unwrap();
        let completion = parse_completion(response, &[]).unwrap();
        assert_eq!(completion.text, "Hold reset [S1].");
        assert_eq!(completion.prompt_tokens, 120);
        assert_eq!(completion.completion_tokens, 8);
    }

    #[test]
    fn test_parse_completion_estimates_missing_usage() {
        let response: ChatResponse =
            serde_json::from_str(r#"{"choices":[{"message":{"content":"12345678"}}]}"#).unwrap();
        let completion = parse_completion(response, &[Message::user("abcd")]).unwrap();
        assert_eq!(completion.prompt_tokens, 1);
        assert_eq!(completion.completion_tokens, 2);
    }

    #[test]
    fn test_empty_completion_is_an_error() {
        let response: ChatResponse =
            serde_json::from_str(r#"{"choices":[{"message":{"content":"  "}}]}"#).unwrap();
        assert!(matches!(
            parse_completion(response, &[]),
            Err(GenerationError::EmptyResponse)
        ));

        let response: ChatResponse = serde_json::from_str(r#"{"choices":[]}"#).unwrap();
        assert!(parse_completion(response, &[]).is_err());
    }
}
