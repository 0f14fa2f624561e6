//! Anthropic native provider implementation.
//!
//! Uses Anthropic's Messages API directly.
//!
//! Features:
//! - `x-api-key` header authentication (not Bearer)
//! - `anthropic-version` header, plus per-request extra headers (beta flags)
//! - Native tool use with `tool_use` / `tool_result` content blocks
//! - Streaming via SSE, forwarded as typed [`StreamEvent`]s
//! - Extended thinking, with signatures and redacted blocks preserved

use async_trait::async_trait;
use futures::StreamExt;
use revloop_core::error::ProviderError;
use revloop_core::message::ContentBlock;
use revloop_core::provider::*;
use revloop_core::stream::StreamEvent;
use revloop_core::tool::ToolCall;
use serde::Deserialize;
use tracing::{debug, trace, warn};

use crate::sse::SseParser;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

/// Anthropic native Messages API provider.
pub struct AnthropicProvider {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl AnthropicProvider {
    /// Create a new Anthropic provider.
    pub fn new(api_key: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(600)) // thinking turns can be slow
            .build()
            .unwrap_or_default();

        Self {
            name: "anthropic".into(),
            base_url: DEFAULT_BASE_URL.into(),
            api_key: api_key.into(),
            client,
        }
    }

    /// Create with a custom base URL (e.g., for testing or proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Build the JSON body for a request.
    fn request_body(request: &ProviderRequest, stream: bool) -> Result<serde_json::Value, ProviderError> {
        let mut body = serde_json::to_value(request)
            .map_err(|e| ProviderError::InvalidResponse(format!("Failed to encode request: {e}")))?;
        if stream {
            body["stream"] = serde_json::Value::Bool(true);
        } else if let Some(obj) = body.as_object_mut() {
            obj.remove("stream");
        }
        Ok(body)
    }

    fn post(&self, request: &ProviderRequest, body: &serde_json::Value) -> reqwest::RequestBuilder {
        let url = format!("{}/v1/messages", self.base_url);
        let mut builder = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json");
        for (name, value) in &request.extra_headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder.json(body)
    }

    /// Map a non-success HTTP status into a provider error.
    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
        let status = response.status().as_u16();

        if status == 429 {
            let retry_after_secs = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(5);
            return Err(ProviderError::RateLimited { retry_after_secs });
        }
        if status == 401 || status == 403 {
            return Err(ProviderError::AuthenticationFailed(
                "Invalid Anthropic API key".into(),
            ));
        }
        if !response.status().is_success() {
            let error_body = response.text().await.unwrap_or_default();
            warn!(status, body = %error_body, "Anthropic API error");
            return Err(ProviderError::ApiError {
                status_code: status,
                message: error_body,
            });
        }
        Ok(response)
    }

    /// Convert a full Messages API response into a [`Response`].
    fn parse_response(resp: AnthropicResponse) -> Response {
        let mut text = String::new();
        let mut tool_calls = Vec::new();
        let mut thinking_blocks = Vec::new();

        for block in resp.content {
            match block {
                ResponseContentBlock::Text { text: t } => text.push_str(&t),
                ResponseContentBlock::ToolUse { id, name, input } => {
                    tool_calls.push(ToolCall { id, name, input });
                }
                ResponseContentBlock::Thinking { thinking, signature } => {
                    thinking_blocks.push(ContentBlock::Thinking { thinking, signature });
                }
                ResponseContentBlock::RedactedThinking { data } => {
                    thinking_blocks.push(ContentBlock::RedactedThinking { data });
                }
                ResponseContentBlock::Other => {
                    trace!("Skipping unsupported response block");
                }
            }
        }

        let stop_reason = resp
            .stop_reason
            .as_deref()
            .map(StopReason::from_wire)
            .unwrap_or(StopReason::EndTurn);

        Response {
            text,
            tool_calls,
            stop_reason,
            usage: resp.usage,
            thinking_blocks,
        }
    }
}

/// Decode one SSE payload into a stream item.
///
/// Unparseable payloads are skipped (`None`); an `error` event becomes an
/// interrupted-stream error.
fn decode_payload(data: &str) -> Option<Result<StreamEvent, ProviderError>> {
    match serde_json::from_str::<StreamEvent>(data) {
        Ok(StreamEvent::Error { error }) => Some(Err(ProviderError::StreamInterrupted(format!(
            "{}: {}",
            error.kind, error.message
        )))),
        Ok(event) => Some(Ok(event)),
        Err(e) => {
            trace!(error = %e, data = %data, "Ignoring unparseable Anthropic SSE");
            None
        }
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: ProviderRequest) -> Result<Response, ProviderError> {
        let body = Self::request_body(&request, false)?;

        debug!(provider = "anthropic", model = %request.model, "Sending completion request");

        let response = self
            .post(&request, &body)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;
        let response = Self::check_status(response).await?;

        let api_resp: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(format!("Failed to parse Anthropic response: {e}")))?;

        Ok(Self::parse_response(api_resp))
    }

    async fn stream(
        &self,
        request: ProviderRequest,
    ) -> Result<tokio::sync::mpsc::Receiver<Result<StreamEvent, ProviderError>>, ProviderError> {
        let body = Self::request_body(&request, true)?;

        debug!(provider = "anthropic", model = %request.model, "Sending streaming request");

        let response = self
            .post(&request, &body)
            .header("Accept", "text/event-stream")
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;
        let response = Self::check_status(response).await?;

        let (tx, rx) = tokio::sync::mpsc::channel(64);

        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut parser = SseParser::new();

            while let Some(chunk_result) = byte_stream.next().await {
                let bytes = match chunk_result {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx
                            .send(Err(ProviderError::StreamInterrupted(e.to_string())))
                            .await;
                        return;
                    }
                };

                for event in parser.push(&bytes) {
                    let Some(item) = decode_payload(&event.data) else {
                        continue;
                    };
                    let stop = matches!(item, Ok(StreamEvent::MessageStop) | Err(_));
                    if tx.send(item).await.is_err() {
                        // Receiver dropped (turn abandoned)
                        return;
                    }
                    if stop {
                        return;
                    }
                }
            }

            if let Some(event) = parser.finish() {
                if let Some(item) = decode_payload(&event.data) {
                    let _ = tx.send(item).await;
                }
            }
        });

        Ok(rx)
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, ProviderError> {
        let url = format!("{}/v1/models?limit=100", self.base_url);

        let response = self
            .client
            .get(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;
        let response = Self::check_status(response).await?;

        let page: ModelPage = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(format!("Failed to parse model list: {e}")))?;
        Ok(page.data)
    }
}

// --- Anthropic API types ---

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<ResponseContentBlock>,
    #[serde(default)]
    usage: Usage,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    Thinking {
        thinking: String,
        #[serde(default)]
        signature: String,
    },
    RedactedThinking {
        data: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ModelPage {
    data: Vec<ModelInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use revloop_core::message::{Message, Role};

    fn request() -> ProviderRequest {
        ProviderRequest {
            model: "claude-sonnet-4-20250514".into(),
            max_tokens: 1024,
            messages: vec![RequestMessage {
                role: Role::User,
                content: RequestContent::Text("hi".into()),
            }],
            tools: vec![],
            system: None,
            thinking: None,
            stream: false,
            extra_headers: vec![],
        }
    }

    #[test]
    fn constructor() {
        let provider = AnthropicProvider::new("sk-ant-test");
        assert_eq!(provider.name(), "anthropic");
        assert_eq!(provider.base_url, DEFAULT_BASE_URL);
    }

    #[test]
    fn constructor_with_base_url() {
        let provider = AnthropicProvider::new("sk-ant-test")
            .with_base_url("https://custom.proxy.com/");
        assert_eq!(provider.base_url, "https://custom.proxy.com");
    }

    #[test]
    fn stream_flag_only_in_streaming_body() {
        let streaming = AnthropicProvider::request_body(&request(), true).unwrap();
        assert_eq!(streaming["stream"], true);
        let blocking = AnthropicProvider::request_body(&request(), false).unwrap();
        assert!(blocking.get("stream").is_none());
        assert_eq!(blocking["messages"][0]["content"], "hi");
    }

    #[test]
    fn history_blocks_survive_encoding() {
        let assistant = Message::assistant(vec![
            ContentBlock::Thinking {
                thinking: "check xrefs".into(),
                signature: "sig==".into(),
            },
            ContentBlock::ToolUse {
                id: "toolu_1".into(),
                name: "xrefs_to".into(),
                input: serde_json::json!({"ea": "0x401000"}),
            },
        ]);
        let mut req = request();
        req.messages.push(RequestMessage {
            role: assistant.role,
            content: RequestContent::Blocks(
                assistant.content.to_blocks().into_iter().map(RequestBlock::from).collect(),
            ),
        });
        let body = AnthropicProvider::request_body(&req, true).unwrap();
        assert_eq!(body["messages"][1]["content"][0]["signature"], "sig==");
        assert_eq!(body["messages"][1]["content"][1]["input"]["ea"], "0x401000");
    }

    #[test]
    fn parse_text_response() {
        let resp: AnthropicResponse = serde_json::from_str(
            r#"{
                "id": "msg_01",
                "model": "claude-sonnet-4-20250514",
                "content": [{"type": "text", "text": "Hello"}, {"type": "text", "text": " there"}],
                "usage": {"input_tokens": 10, "output_tokens": 5},
                "stop_reason": "end_turn"
            }"#,
        )
        .unwrap();

        let response = AnthropicProvider::parse_response(resp);
        assert_eq!(response.text, "Hello there");
        assert!(response.tool_calls.is_empty());
        assert_eq!(response.stop_reason, StopReason::EndTurn);
        assert_eq!(response.usage.total(), 15);
    }

    #[test]
    fn parse_tool_use_response() {
        let resp: AnthropicResponse = serde_json::from_str(
            r#"{
                "content": [
                    {"type": "text", "text": "Let me look"},
                    {"type": "tool_use", "id": "toolu_abc", "name": "decompile", "input": {"ea": "0x401000"}}
                ],
                "usage": {"input_tokens": 20, "output_tokens": 10, "cache_read_input_tokens": 900},
                "stop_reason": "tool_use"
            }"#,
        )
        .unwrap();

        let response = AnthropicProvider::parse_response(resp);
        assert_eq!(response.stop_reason, StopReason::ToolUse);
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].name, "decompile");
        assert_eq!(response.tool_calls[0].input["ea"], "0x401000");
        assert_eq!(response.usage.cache_read_tokens, 900);
    }

    #[test]
    fn parse_thinking_response_preserves_blocks() {
        let resp: AnthropicResponse = serde_json::from_str(
            r#"{
                "content": [
                    {"type": "thinking", "thinking": "I need to consider...", "signature": "EqQB"},
                    {"type": "redacted_thinking", "data": "EmwKAhgB"},
                    {"type": "server_tool_use", "id": "x", "name": "web", "input": {}},
                    {"type": "text", "text": "Here's my answer."}
                ],
                "usage": {"input_tokens": 15, "output_tokens": 25},
                "stop_reason": "max_tokens"
            }"#,
        )
        .unwrap();

        let response = AnthropicProvider::parse_response(resp);
        assert_eq!(response.text, "Here's my answer.");
        assert_eq!(response.stop_reason, StopReason::MaxTokens);
        assert_eq!(
            response.thinking_blocks,
            vec![
                ContentBlock::Thinking {
                    thinking: "I need to consider...".into(),
                    signature: "EqQB".into(),
                },
                ContentBlock::RedactedThinking { data: "EmwKAhgB".into() },
            ]
        );
    }

    #[test]
    fn decode_payload_maps_error_events() {
        let err = decode_payload(r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#)
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, ProviderError::StreamInterrupted(ref m) if m.contains("overloaded_error")));

        assert!(matches!(decode_payload(r#"{"type":"ping"}"#), Some(Ok(StreamEvent::Ping))));
        assert!(decode_payload("not json").is_none());
        assert!(decode_payload(r#"{"type":"some_future_event"}"#).is_none());
    }

    #[test]
    fn sse_bytes_to_events() {
        let raw = concat!(
            "event: message_start\n",
            "data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":3,\"output_tokens\":1}}}\n\n",
            "event: content_block_start\n",
            "data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"hi\"}}\n\n",
            "event: message_stop\n",
            "data: {\"type\":\"message_stop\"}\n\n",
        );
        let mut parser = SseParser::new();
        let events: Vec<StreamEvent> = parser
            .push(raw.as_bytes())
            .iter()
            .filter_map(|e| decode_payload(&e.data))
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(events.len(), 4);
        assert!(matches!(events[0], StreamEvent::MessageStart { .. }));
        assert_eq!(events[3], StreamEvent::MessageStop);
    }

    #[test]
    fn model_page_parsing() {
        let page: ModelPage = serde_json::from_str(
            r#"{"data":[{"type":"model","id":"claude-sonnet-4-20250514","display_name":"Claude Sonnet 4","created_at":"2025-05-14T00:00:00Z"}],"has_more":false}"#,
        )
        .unwrap();
        assert_eq!(page.data[0].id, "claude-sonnet-4-20250514");
        assert_eq!(page.data[0].display_name, "Claude Sonnet 4");
    }
}
