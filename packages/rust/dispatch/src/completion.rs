//! The external completion API behind the call controller.

use std::time::Duration;

use async_trait::async_trait;
use feedforge_shared::{AppConfig, FeedforgeError};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::error::{CompletionError, ErrorClass};
use crate::tier::{ModelTier, TierTable};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// One prompt for the completion API.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub prompt: String,
    pub system: Option<String>,
    pub tier: ModelTier,
}

/// Generated text plus usage counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub text: String,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// A rate-limited, occasionally failing request/response call.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, CompletionError>;
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct MessageRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: Vec<Message<'a>>,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    #[serde(default)]
    model: String,
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

/// Messages-style HTTP completion client.
pub struct HttpCompletionClient {
    client: Client,
    endpoint: String,
    api_key: String,
    tiers: TierTable,
}

impl HttpCompletionClient {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        tiers: TierTable,
        timeout: Duration,
    ) -> Result<Self, FeedforgeError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("feedforge/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FeedforgeError::Network(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            tiers,
        })
    }

    /// Build from the `[completion]` section with an already resolved key.
    pub fn from_config(config: &AppConfig, api_key: String) -> Result<Self, FeedforgeError> {
        Self::new(
            config.completion.endpoint.clone(),
            api_key,
            TierTable::from(&config.completion.models),
            Duration::from_secs(config.completion.call_timeout_secs),
        )
    }
}

#[async_trait]
impl CompletionClient for HttpCompletionClient {
    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, CompletionError> {
        let params = self.tiers.params(request.tier);
        let body = MessageRequest {
            model: &params.model,
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            system: request.system.as_deref(),
            messages: vec![Message {
                role: "user",
                content: &request.prompt,
            }],
        };

        let response = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &text, retry_after));
        }

        let parsed: MessageResponse = response.json().await.map_err(|e| {
            CompletionError::new(ErrorClass::Upstream5xx, format!("malformed response: {e}"))
        })?;

        let text = parsed
            .content
            .into_iter()
            .filter_map(|block| block.text)
            .collect::<Vec<_>>()
            .join("\n");

        tracing::debug!(
            model = %parsed.model,
            input_tokens = parsed.usage.input_tokens,
            output_tokens = parsed.usage.output_tokens,
            "completion received"
        );

        Ok(CompletionResponse {
            text,
            model: if parsed.model.is_empty() {
                params.model.clone()
            } else {
                parsed.model
            },
            input_tokens: parsed.usage.input_tokens,
            output_tokens: parsed.usage.output_tokens,
        })
    }
}

fn classify_transport(err: reqwest::Error) -> CompletionError {
    if err.is_timeout() {
        CompletionError::new(ErrorClass::Timeout, err.to_string())
    } else {
        CompletionError::new(ErrorClass::TransientNetwork, err.to_string())
    }
}

/// Map a non-2xx response onto the failure taxonomy.
fn classify_status(
    status: StatusCode,
    body: &str,
    retry_after: Option<Duration>,
) -> CompletionError {
    let message = format!("HTTP {}: {}", status.as_u16(), truncate(body, 300));
    let lowered = body.to_ascii_lowercase();
    let quota = lowered.contains("quota") || lowered.contains("credit balance");

    match status.as_u16() {
        401 | 403 => CompletionError::new(ErrorClass::Authentication, message),
        400 | 404 | 422 => CompletionError::new(ErrorClass::Validation, message),
        402 => CompletionError::new(ErrorClass::QuotaExhausted, message),
        429 if quota => CompletionError::new(ErrorClass::QuotaExhausted, message),
        429 => CompletionError::rate_limited(message, retry_after),
        500..=599 => CompletionError::new(ErrorClass::Upstream5xx, message),
        _ => CompletionError::new(ErrorClass::Validation, message),
    }
}

fn truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use feedforge_shared::ModelsSection;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> HttpCompletionClient {
        let models = ModelsSection {
            fast: "fast-model".into(),
            balanced: "balanced-model".into(),
            accurate: "accurate-model".into(),
        };
        HttpCompletionClient::new(
            format!("{}/v1/messages", server.uri()),
            "test-key",
            TierTable::from(&models),
            Duration::from_secs(5),
        )
        .expect("client")
    }

    fn request() -> CompletionRequest {
        CompletionRequest {
            prompt: "Summarize this".into(),
            system: Some("You summarize news.".into()),
            tier: ModelTier::Fast,
        }
    }

    #[tokio::test]
    async fn parses_successful_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "test-key"))
            .and(header("anthropic-version", ANTHROPIC_VERSION))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "model": "fast-model",
                "content": [
                    { "type": "text", "text": "First." },
                    { "type": "text", "text": "Second." }
                ],
                "usage": { "input_tokens": 12, "output_tokens": 7 }
            })))
            .mount(&server)
            .await;

        let response = client(&server).complete(&request()).await.expect("complete");
        assert_eq!(response.text, "First.\nSecond.");
        assert_eq!(response.model, "fast-model");
        assert_eq!(response.input_tokens, 12);
        assert_eq!(response.output_tokens, 7);
    }

    #[tokio::test]
    async fn rate_limit_carries_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("retry-after", "7")
                    .set_body_string(r#"{"error":{"type":"rate_limit_error"}}"#),
            )
            .mount(&server)
            .await;

        let err = client(&server).complete(&request()).await.unwrap_err();
        assert_eq!(err.class, ErrorClass::RateLimited);
        assert_eq!(err.retry_after, Some(Duration::from_secs(7)));
    }

    #[tokio::test]
    async fn status_mapping() {
        let cases = [
            (401, "", ErrorClass::Authentication),
            (403, "", ErrorClass::Authentication),
            (400, "bad request", ErrorClass::Validation),
            (422, "", ErrorClass::Validation),
            (402, "", ErrorClass::QuotaExhausted),
            (429, "monthly quota exceeded", ErrorClass::QuotaExhausted),
            (500, "", ErrorClass::Upstream5xx),
            (529, "overloaded", ErrorClass::Upstream5xx),
        ];
        for (status, body, expected) in cases {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .respond_with(ResponseTemplate::new(status).set_body_string(body))
                .mount(&server)
                .await;
            let err = client(&server).complete(&request()).await.unwrap_err();
            assert_eq!(err.class, expected, "status {status}");
        }
    }

    #[tokio::test]
    async fn connection_failure_is_transient() {
        let models = ModelsSection {
            fast: "f".into(),
            balanced: "b".into(),
            accurate: "a".into(),
        };
        // Port 9 (discard) on localhost is expected to refuse connections.
        let client = HttpCompletionClient::new(
            "http://127.0.0.1:9/v1/messages",
            "k",
            TierTable::from(&models),
            Duration::from_secs(2),
        )
        .expect("client");
        let err = client.complete(&request()).await.unwrap_err();
        assert!(err.class.is_retryable());
    }

    #[tokio::test]
    async fn slow_server_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "content": [] }))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let models = ModelsSection {
            fast: "f".into(),
            balanced: "b".into(),
            accurate: "a".into(),
        };
        let client = HttpCompletionClient::new(
            format!("{}/v1/messages", server.uri()),
            "k",
            TierTable::from(&models),
            Duration::from_millis(100),
        )
        .expect("client");
        let err = client.complete(&request()).await.unwrap_err();
        assert_eq!(err.class, ErrorClass::Timeout);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("hi", 10), "hi");
    }
}
