//! Adapter for OpenAI-compatible `/chat/completions` and `/embeddings` endpoints.
//!
//! OpenRouter, DashScope compatible-mode and vLLM all speak this dialect, so
//! one adapter covers them; the base URL picks the provider.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use serde::{Deserialize, Serialize};

use super::error::{Endpoint, ProviderError};
use super::types::*;

/// Maximum allowed response body (8MB; embedding batches are large).
const MAX_RESPONSE_LEN: usize = 8 * 1_024 * 1_024;

/// Maximum allowed input characters (~125k tokens).
const MAX_INPUT_CHARS: usize = 500_000;

pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct CompatAdapter {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl CompatAdapter {
    pub fn new(api_key: impl Into<String>) -> Result<Self, ProviderError> {
        Self::with_config(api_key, DEFAULT_BASE_URL, DEFAULT_TIMEOUT)
    }

    /// Read `TAXONOMY_API_KEY`, `TAXONOMY_BASE_URL` and `TAXONOMY_TIMEOUT_SECONDS`.
    pub fn from_env() -> Result<Self, ProviderError> {
        let api_key = std::env::var("TAXONOMY_API_KEY")
            .map_err(|_| ProviderError::config("TAXONOMY_API_KEY not set"))?;

        let base_url =
            std::env::var("TAXONOMY_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.into());

        let timeout = std::env::var("TAXONOMY_TIMEOUT_SECONDS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TIMEOUT);

        Self::with_config(api_key, base_url, timeout)
    }

    pub fn with_config(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let api_key = api_key.into();
        let base_url = base_url.into().trim_end_matches('/').to_string();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let auth_value = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|_| ProviderError::config("Invalid API key format"))?;
        headers.insert(AUTHORIZATION, auth_value);

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .gzip(true)
            .build()
            .map_err(|e| ProviderError::config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn extract_request_id(headers: &HeaderMap) -> Option<String> {
        headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    }

    /// `Retry-After` in delta-seconds; HTTP-date values are ignored.
    fn extract_retry_after(headers: &HeaderMap) -> Option<Duration> {
        headers
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }

    fn is_refusal(msg: &str) -> bool {
        let l = msg.trim_start().to_lowercase();
        let first_line = l.lines().next().unwrap_or("");

        const PREFIXES: &[&str] = &[
            "i cannot",
            "i can't",
            "i won't",
            "i will not",
            "i am unable to",
            "i'm unable to",
            "unable to comply",
            "unable to assist",
        ];

        PREFIXES.iter().any(|p| first_line.starts_with(p)) || l.contains("request was refused")
    }

    /// POST a JSON body and return the status-checked response text.
    async fn post<B: Serialize + ?Sized>(
        &self,
        endpoint: Endpoint,
        body: &B,
    ) -> Result<String, ProviderError> {
        let mut response = self
            .client
            .post(format!("{}/{}", self.base_url, endpoint.path()))
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(self.timeout)
                } else {
                    ProviderError::Http(e)
                }
            })?;

        let status = response.status();
        let request_id = Self::extract_request_id(response.headers());
        let retry_after = Self::extract_retry_after(response.headers());

        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            let new_len = bytes.len() + chunk.len();
            if new_len > MAX_RESPONSE_LEN {
                return Err(ProviderError::malformed(
                    endpoint,
                    format!("response too large: {new_len} bytes"),
                ));
            }
            bytes.extend_from_slice(&chunk);
        }
        let body = String::from_utf8_lossy(&bytes).to_string();

        if status.is_success() {
            return Ok(body);
        }

        let status = status.as_u16();
        let mut message = format!("HTTP {status}");
        let mut code = None;
        if let Some(error) = serde_json::from_str::<ErrorEnvelope>(&body).ok().and_then(|e| e.error) {
            code = error
                .code
                .map(|c| c.as_str().map(str::to_string).unwrap_or_else(|| c.to_string()));
            if let Some(m) = error.message.filter(|m| !m.is_empty()) {
                message = m;
            }
        }

        Err(match status {
            429 => ProviderError::RateLimited {
                endpoint,
                retry_after,
                request_id,
            },
            408 | 500..=u16::MAX => ProviderError::Unavailable {
                endpoint,
                status,
                message,
                request_id,
            },
            _ => ProviderError::Rejected {
                endpoint,
                status,
                code,
                message,
                request_id,
            },
        })
    }

    /// One chat completion, no retries.
    pub async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let total_chars: usize = req.messages.iter().map(|m| m.content.len()).sum();
        if total_chars > MAX_INPUT_CHARS {
            return Err(ProviderError::InputTooLarge {
                chars: total_chars,
                max: MAX_INPUT_CHARS,
            });
        }

        let api_req = ChatApiRequest {
            model: &req.model,
            messages: &req.messages,
            temperature: req.temperature,
            max_tokens: req.max_tokens,
            response_format: req.json_mode.then_some(ResponseFormat {
                format_type: "json_object",
            }),
        };

        let body = self.post(Endpoint::Chat, &api_req).await?;
        let parsed: ChatApiResponse = serde_json::from_str(&body)
            .map_err(|e| ProviderError::malformed(Endpoint::Chat, format!("invalid JSON: {e}")))?;

        if let Some(error) = parsed.error {
            let message = error.message.unwrap_or_default();
            if Self::is_refusal(&message) {
                return Err(ProviderError::Refused(message));
            }
            return Err(ProviderError::malformed(Endpoint::Chat, message));
        }

        let choice = parsed
            .choices
            .and_then(|c| c.into_iter().next())
            .ok_or_else(|| ProviderError::malformed(Endpoint::Chat, "no choices in response"))?;

        let content = choice
            .message
            .map(|m| {
                let content = m.content.unwrap_or_default();
                if !content.trim().is_empty() {
                    return content;
                }
                // Some models answer json_object requests through a tool call.
                m.tool_calls
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|tc| tc.function.and_then(|f| f.arguments))
                    .find(|s| !s.trim().is_empty())
                    .unwrap_or_default()
            })
            .unwrap_or_default();

        if Self::is_refusal(&content) {
            return Err(ProviderError::Refused(content));
        }

        let usage = parsed.usage.unwrap_or_default();

        Ok(ChatResponse {
            content,
            input_tokens: usage.prompt_tokens.unwrap_or(0),
            output_tokens: usage.completion_tokens.unwrap_or(0),
            truncated: choice.finish_reason.as_deref() == Some("length"),
        })
    }

    /// One embedding call, no retries. Vectors come back in input order
    /// even when the provider shuffles `data`.
    pub async fn embed(&self, req: &EmbedRequest) -> Result<EmbedResponse, ProviderError> {
        if req.texts.is_empty() {
            return Ok(EmbedResponse {
                embeddings: Vec::new(),
                tokens: 0,
            });
        }

        let api_req = EmbedApiRequest {
            model: &req.model,
            input: &req.texts,
            encoding_format: "float",
        };

        let body = self.post(Endpoint::Embeddings, &api_req).await?;
        let parsed: EmbedApiResponse = serde_json::from_str(&body).map_err(|e| {
            ProviderError::malformed(Endpoint::Embeddings, format!("invalid JSON: {e}"))
        })?;

        let mut slots: Vec<Option<Vec<f32>>> = vec![None; req.texts.len()];
        for (pos, item) in parsed.data.into_iter().enumerate() {
            let idx = item.index.unwrap_or(pos);
            match slots.get_mut(idx) {
                Some(slot) if slot.is_none() => *slot = Some(item.embedding),
                _ => {
                    return Err(ProviderError::malformed(
                        Endpoint::Embeddings,
                        format!("unexpected embedding index {idx}"),
                    ))
                }
            }
        }

        let embeddings = slots
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| {
                ProviderError::malformed(
                    Endpoint::Embeddings,
                    format!("expected {} embeddings", req.texts.len()),
                )
            })?;

        Ok(EmbedResponse {
            embeddings,
            tokens: parsed.usage.and_then(|u| u.prompt_tokens).unwrap_or(0),
        })
    }
}

// =============================================================================
// API TYPES
// =============================================================================

#[derive(Serialize)]
struct ChatApiRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Deserialize)]
struct ChatApiResponse {
    choices: Option<Vec<Choice>>,
    usage: Option<Usage>,
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Deserialize)]
struct ToolCall {
    function: Option<ToolFunction>,
}

#[derive(Deserialize)]
struct ToolFunction {
    arguments: Option<String>,
}

#[derive(Deserialize, Default)]
struct Usage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

#[derive(Serialize)]
struct EmbedApiRequest<'a> {
    model: &'a str,
    input: &'a [String],
    encoding_format: &'static str,
}

#[derive(Deserialize)]
struct EmbedApiResponse {
    #[serde(default)]
    data: Vec<EmbedDatum>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct EmbedDatum {
    embedding: Vec<f32>,
    index: Option<usize>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct ApiError {
    message: Option<String>,
    /// Some providers send numeric codes, others strings.
    code: Option<serde_json::Value>,
}
