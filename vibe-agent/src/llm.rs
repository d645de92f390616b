//! Claude API client with streaming tool use.
//!
//! The orchestrator only sees [`CompletionClient`]: hand it a conversation
//! and a tool set, get back a consumable-once stream of [`GenerationUnit`]s.
//! [`AnthropicClient`] is the production implementation; it decodes the
//! Messages API event stream incrementally so text reaches the browser as the
//! model produces it.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use futures::stream::{BoxStream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: MessageContent,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: MessageContent::Text(text.into()),
        }
    }
}

/// Message content: a plain string or structured blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    /// Extract plain text from the content.
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }

    /// Extract all tool-use blocks.
    pub fn tool_uses(&self) -> Vec<&ToolUseBlock> {
        match self {
            MessageContent::Text(_) => vec![],
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolUse(tu) => Some(tu),
                    _ => None,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse(ToolUseBlock),
    #[serde(rename = "tool_result")]
    ToolResult(ToolResultBlock),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUseBlock {
    pub id: String,
    pub name: String,
    pub input: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultBlock {
    pub tool_use_id: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

/// Tool definition for Claude.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// One unit of model output, in the order the model produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationUnit {
    Text(String),
    ToolCall(ToolUseBlock),
    Finish(FinishReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    ToolUse,
    MaxTokens,
    Other,
}

impl FinishReason {
    fn from_stop_reason(reason: Option<&str>) -> Self {
        match reason {
            Some("end_turn") | Some("stop_sequence") => FinishReason::Stop,
            Some("tool_use") => FinishReason::ToolUse,
            Some("max_tokens") => FinishReason::MaxTokens,
            _ => FinishReason::Other,
        }
    }
}

/// Anything that goes wrong talking to the model. Always fatal to a stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("request to model provider failed: {0}")]
    Transport(String),
    #[error("model provider returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("model provider error: {0}")]
    Stream(String),
    #[error("malformed model stream: {0}")]
    Decode(String),
}

pub type UnitStream = BoxStream<'static, Result<GenerationUnit, ProviderError>>;

/// A model that can be asked for one step of generation.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn stream(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[ToolDef],
    ) -> Result<UnitStream, ProviderError>;
}

pub const API_URL: &str = "https://api.anthropic.com/v1/messages";
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

/// Claude API client.
#[derive(Clone)]
pub struct AnthropicClient {
    api_key: String,
    model: String,
    max_tokens: u32,
    url: String,
    http: reqwest::Client,
}

impl AnthropicClient {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            model: DEFAULT_MODEL.to_string(),
            max_tokens: 8192,
            url: API_URL.to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Point at a different Messages endpoint (proxies, local mocks).
    pub fn with_url(mut self, url: &str) -> Self {
        self.url = url.to_string();
        self
    }
}

#[async_trait]
impl CompletionClient for AnthropicClient {
    async fn stream(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[ToolDef],
    ) -> Result<UnitStream, ProviderError> {
        let mut body = serde_json::json!({
            "model": &self.model,
            "max_tokens": self.max_tokens,
            "system": system,
            "messages": messages,
            "stream": true,
        });

        if !tools.is_empty() {
            body["tools"] =
                serde_json::to_value(tools).map_err(|e| ProviderError::Decode(e.to_string()))?;
        }

        let resp = self
            .http
            .post(&self.url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(decode_stream(resp.bytes_stream()))
    }
}

/// Turn a raw SSE byte stream into generation units.
///
/// The first error ends the stream. A body that stops before `message_stop`
/// is reported as an error rather than a silent finish.
pub fn decode_stream<S, B, E>(bytes: S) -> UnitStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    struct State<S> {
        bytes: std::pin::Pin<Box<S>>,
        decoder: StreamDecoder,
        pending: VecDeque<Result<GenerationUnit, ProviderError>>,
        done: bool,
    }

    let state = State {
        bytes: Box::pin(bytes),
        decoder: StreamDecoder::default(),
        pending: VecDeque::new(),
        done: false,
    };

    futures::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(item) = st.pending.pop_front() {
                if item.is_err() {
                    st.pending.clear();
                    st.done = true;
                }
                return Some((item, st));
            }
            if st.done {
                return None;
            }
            match st.bytes.next().await {
                Some(Ok(chunk)) => {
                    let (units, error) = st.decoder.push(chunk.as_ref());
                    st.pending.extend(units.into_iter().map(Ok));
                    if let Some(e) = error {
                        st.pending.push_back(Err(e));
                    }
                }
                Some(Err(e)) => st
                    .pending
                    .push_back(Err(ProviderError::Transport(e.to_string()))),
                None => {
                    st.done = true;
                    if !st.decoder.finished() {
                        st.pending.push_back(Err(ProviderError::Stream(
                            "stream ended before message_stop".to_string(),
                        )));
                    }
                }
            }
        }
    })
    .boxed()
}

#[derive(Debug)]
enum OpenBlock {
    Text,
    ToolUse { id: String, name: String, json: String },
}

/// Incremental decoder for the Messages API event stream.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    buf: Vec<u8>,
    blocks: HashMap<u64, OpenBlock>,
    stop_reason: Option<String>,
    finished: bool,
}

impl StreamDecoder {
    /// Whether `message_stop` has been seen.
    pub fn finished(&self) -> bool {
        self.finished
    }

    /// Feed raw bytes; returns every unit completed by them.
    ///
    /// Decoding stops at the first bad frame. Units completed before it are
    /// still returned, ahead of the error.
    pub fn push(&mut self, chunk: &[u8]) -> (Vec<GenerationUnit>, Option<ProviderError>) {
        self.buf.extend(chunk.iter().copied().filter(|b| *b != b'\r'));
        let mut units = Vec::new();
        while let Some(pos) = self.buf.windows(2).position(|w| w == b"\n\n") {
            let frame: Vec<u8> = self.buf.drain(..pos + 2).collect();
            let frame = String::from_utf8_lossy(&frame[..pos]);
            let Some(data) = sse_data(&frame) else {
                continue;
            };
            if let Err(e) = self.handle(&data, &mut units) {
                return (units, Some(e));
            }
        }
        (units, None)
    }

    fn handle(&mut self, data: &str, units: &mut Vec<GenerationUnit>) -> Result<(), ProviderError> {
        if self.finished {
            return Ok(());
        }
        let event: Value =
            serde_json::from_str(data).map_err(|e| ProviderError::Decode(e.to_string()))?;
        let index = event["index"].as_u64().unwrap_or(0);

        match event["type"].as_str().unwrap_or_default() {
            "content_block_start" => {
                let block = &event["content_block"];
                match block["type"].as_str() {
                    Some("text") => {
                        self.blocks.insert(index, OpenBlock::Text);
                        push_text(units, block["text"].as_str());
                    }
                    Some("tool_use") => {
                        self.blocks.insert(
                            index,
                            OpenBlock::ToolUse {
                                id: block["id"].as_str().unwrap_or_default().to_string(),
                                name: block["name"].as_str().unwrap_or_default().to_string(),
                                json: String::new(),
                            },
                        );
                    }
                    _ => {}
                }
            }
            "content_block_delta" => {
                let delta = &event["delta"];
                match delta["type"].as_str() {
                    Some("text_delta") => push_text(units, delta["text"].as_str()),
                    Some("input_json_delta") => {
                        if let Some(OpenBlock::ToolUse { json, .. }) = self.blocks.get_mut(&index) {
                            json.push_str(delta["partial_json"].as_str().unwrap_or_default());
                        }
                    }
                    _ => {}
                }
            }
            "content_block_stop" => {
                if let Some(OpenBlock::ToolUse { id, name, json }) = self.blocks.remove(&index) {
                    let input = if json.trim().is_empty() {
                        Value::Object(Default::default())
                    } else {
                        serde_json::from_str(&json).map_err(|e| {
                            ProviderError::Decode(format!("tool input for {name}: {e}"))
                        })?
                    };
                    units.push(GenerationUnit::ToolCall(ToolUseBlock { id, name, input }));
                }
            }
            "message_delta" => {
                if let Some(reason) = event["delta"]["stop_reason"].as_str() {
                    self.stop_reason = Some(reason.to_string());
                }
            }
            "message_stop" => {
                self.finished = true;
                units.push(GenerationUnit::Finish(FinishReason::from_stop_reason(
                    self.stop_reason.as_deref(),
                )));
            }
            "error" => {
                let message = event["error"]["message"]
                    .as_str()
                    .unwrap_or("unknown error")
                    .to_string();
                return Err(ProviderError::Stream(message));
            }
            // message_start, ping, and anything newer than this decoder
            _ => {}
        }
        Ok(())
    }
}

fn push_text(units: &mut Vec<GenerationUnit>, text: Option<&str>) {
    if let Some(text) = text.filter(|t| !t.is_empty()) {
        units.push(GenerationUnit::Text(text.to_string()));
    }
}

/// The joined `data:` lines of one SSE frame, if it has any.
fn sse_data(frame: &str) -> Option<String> {
    let lines: Vec<&str> = frame
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|rest| rest.strip_prefix(' ').unwrap_or(rest))
        .collect();
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(event: &str, data: Value) -> String {
        format!("event: {event}\ndata: {data}\n\n")
    }

    fn tool_turn() -> String {
        [
            frame("message_start", serde_json::json!({"type": "message_start", "message": {"id": "msg_1"}})),
            frame("content_block_start", serde_json::json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}})),
            frame("content_block_delta", serde_json::json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Writing "}})),
            frame("content_block_delta", serde_json::json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "the page."}})),
            frame("content_block_stop", serde_json::json!({"type": "content_block_stop", "index": 0})),
            frame("ping", serde_json::json!({"type": "ping"})),
            frame("content_block_start", serde_json::json!({"type": "content_block_start", "index": 1, "content_block": {"type": "tool_use", "id": "toolu_1", "name": "writeFile", "input": {}}})),
            frame("content_block_delta", serde_json::json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": "{\"path\": \"index"}})),
            frame("content_block_delta", serde_json::json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": ".html\", \"content\": \"<html></html>\"}"}})),
            frame("content_block_stop", serde_json::json!({"type": "content_block_stop", "index": 1})),
            frame("message_delta", serde_json::json!({"type": "message_delta", "delta": {"stop_reason": "tool_use"}})),
            frame("message_stop", serde_json::json!({"type": "message_stop"})),
        ]
        .concat()
    }

    fn expected_tool_turn() -> Vec<GenerationUnit> {
        vec![
            GenerationUnit::Text("Writing ".to_string()),
            GenerationUnit::Text("the page.".to_string()),
            GenerationUnit::ToolCall(ToolUseBlock {
                id: "toolu_1".to_string(),
                name: "writeFile".to_string(),
                input: serde_json::json!({"path": "index.html", "content": "<html></html>"}),
            }),
            GenerationUnit::Finish(FinishReason::ToolUse),
        ]
    }

    #[test]
    fn decodes_text_and_tool_use_in_order() {
        let mut decoder = StreamDecoder::default();
        let (units, error) = decoder.push(tool_turn().as_bytes());
        assert_eq!(error, None);
        assert_eq!(units, expected_tool_turn());
        assert!(decoder.finished());
    }

    #[test]
    fn frames_split_across_chunks_and_crlf() {
        let body = tool_turn().replace('\n', "\r\n");
        let mut decoder = StreamDecoder::default();
        let mut units = Vec::new();
        for chunk in body.as_bytes().chunks(7) {
            let (decoded, error) = decoder.push(chunk);
            assert_eq!(error, None);
            units.extend(decoded);
        }
        assert_eq!(units, expected_tool_turn());
    }

    #[test]
    fn tool_use_without_input_gets_empty_object() {
        let body = [
            frame("content_block_start", serde_json::json!({"type": "content_block_start", "index": 0, "content_block": {"type": "tool_use", "id": "t", "name": "listFiles", "input": {}}})),
            frame("content_block_stop", serde_json::json!({"type": "content_block_stop", "index": 0})),
        ]
        .concat();
        let (units, _) = StreamDecoder::default().push(body.as_bytes());
        assert_eq!(
            units,
            vec![GenerationUnit::ToolCall(ToolUseBlock {
                id: "t".to_string(),
                name: "listFiles".to_string(),
                input: serde_json::json!({}),
            })]
        );
    }

    #[test]
    fn error_event_is_provider_error() {
        let body = frame("error", serde_json::json!({"type": "error", "error": {"type": "overloaded_error", "message": "Overloaded"}}));
        let (units, error) = StreamDecoder::default().push(body.as_bytes());
        assert!(units.is_empty());
        assert_eq!(error, Some(ProviderError::Stream("Overloaded".to_string())));
    }

    #[tokio::test]
    async fn units_before_an_error_in_the_same_chunk_are_kept() {
        let body = [
            frame("content_block_start", serde_json::json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}})),
            frame("content_block_delta", serde_json::json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Building your site"}})),
            frame("content_block_stop", serde_json::json!({"type": "content_block_stop", "index": 0})),
            frame("content_block_start", serde_json::json!({"type": "content_block_start", "index": 1, "content_block": {"type": "tool_use", "id": "toolu_9", "name": "writeFile", "input": {}}})),
            frame("content_block_delta", serde_json::json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": "{\"path\": \"index.html\", \"content\": \"hi\"}"}})),
            frame("content_block_stop", serde_json::json!({"type": "content_block_stop", "index": 1})),
            frame("error", serde_json::json!({"type": "error", "error": {"type": "overloaded_error", "message": "Overloaded"}})),
            frame("content_block_delta", serde_json::json!({"type": "content_block_delta", "index": 2, "delta": {"type": "text_delta", "text": "never"}})),
        ]
        .concat();
        let chunks: Vec<Result<Vec<u8>, std::io::Error>> = vec![Ok(body.into_bytes())];
        let units: Vec<_> = decode_stream(futures::stream::iter(chunks)).collect().await;
        assert_eq!(
            units,
            vec![
                Ok(GenerationUnit::Text("Building your site".to_string())),
                Ok(GenerationUnit::ToolCall(ToolUseBlock {
                    id: "toolu_9".to_string(),
                    name: "writeFile".to_string(),
                    input: serde_json::json!({"path": "index.html", "content": "hi"}),
                })),
                Err(ProviderError::Stream("Overloaded".to_string())),
            ]
        );
    }

    #[tokio::test]
    async fn truncated_stream_ends_with_error() {
        let body = frame("content_block_delta", serde_json::json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "hi"}}));
        let chunks: Vec<Result<Vec<u8>, std::io::Error>> = vec![Ok(body.into_bytes())];
        let units: Vec<_> = decode_stream(futures::stream::iter(chunks)).collect().await;
        assert_eq!(units.len(), 2);
        assert_eq!(units[0], Ok(GenerationUnit::Text("hi".to_string())));
        assert!(matches!(units[1], Err(ProviderError::Stream(_))));
    }

    #[tokio::test]
    async fn transport_error_stops_the_stream() {
        let chunks: Vec<Result<Vec<u8>, std::io::Error>> = vec![
            Err(std::io::Error::other("connection reset")),
            Ok(tool_turn().into_bytes()),
        ];
        let units: Vec<_> = decode_stream(futures::stream::iter(chunks)).collect().await;
        assert_eq!(units.len(), 1);
        assert!(matches!(units[0], Err(ProviderError::Transport(_))));
    }

    // ── AnthropicClient against a local Messages endpoint ──

    struct MockApi {
        status: u16,
        body: String,
        requests: parking_lot::Mutex<Vec<(Option<String>, Value)>>,
    }

    async fn messages(
        axum::extract::State(mock): axum::extract::State<std::sync::Arc<MockApi>>,
        headers: axum::http::HeaderMap,
        axum::Json(request): axum::Json<Value>,
    ) -> axum::response::Response {
        let key = headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        mock.requests.lock().push((key, request));
        axum::response::Response::builder()
            .status(mock.status)
            .header("content-type", "text/event-stream")
            .body(axum::body::Body::from(mock.body.clone()))
            .unwrap()
    }

    async fn mock_api(status: u16, body: String) -> (AnthropicClient, std::sync::Arc<MockApi>) {
        let mock = std::sync::Arc::new(MockApi {
            status,
            body,
            requests: parking_lot::Mutex::new(Vec::new()),
        });
        let app = axum::Router::new()
            .route("/v1/messages", axum::routing::post(messages))
            .with_state(mock.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        let client = AnthropicClient::new("test-key".to_string())
            .with_max_tokens(1024)
            .with_url(&format!("http://{addr}/v1/messages"));
        (client, mock)
    }

    #[tokio::test]
    async fn overloaded_status_is_a_provider_error() {
        let body = r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#;
        let (client, mock) = mock_api(529, body.to_string()).await;

        let Err(err) = client.stream("Be brief.", &[Message::user("hi")], &[]).await else {
            panic!("a 529 should fail before streaming");
        };
        assert_eq!(
            err,
            ProviderError::Status {
                status: 529,
                body: body.to_string(),
            }
        );

        let requests = mock.requests.lock();
        assert_eq!(requests.len(), 1);
        let (key, request) = &requests[0];
        assert_eq!(key.as_deref(), Some("test-key"));
        assert_eq!(request["model"], DEFAULT_MODEL);
        assert_eq!(request["max_tokens"], 1024);
        assert_eq!(request["system"], "Be brief.");
        assert_eq!(request["stream"], true);
        assert_eq!(request["messages"][0]["content"], "hi");
        assert!(request.get("tools").is_none());
    }

    #[tokio::test]
    async fn streams_a_tool_turn_from_the_endpoint() {
        let (client, mock) = mock_api(200, tool_turn()).await;
        let tools = [ToolDef {
            name: "writeFile".to_string(),
            description: "Write a file".to_string(),
            input_schema: serde_json::json!({"type": "object"}),
        }];

        let stream = client
            .stream("Build sites.", &[Message::user("a bakery")], &tools)
            .await
            .unwrap();
        let units: Vec<_> = stream.collect().await;
        let units: Vec<_> = units.into_iter().collect::<Result<_, _>>().unwrap();
        assert_eq!(units, expected_tool_turn());

        let requests = mock.requests.lock();
        assert_eq!(requests[0].1["tools"][0]["name"], "writeFile");
        assert_eq!(requests[0].1["tools"][0]["input_schema"]["type"], "object");
    }

    #[test]
    fn message_content_helpers() {
        let content = MessageContent::Blocks(vec![
            ContentBlock::Text { text: "a".to_string() },
            ContentBlock::ToolUse(ToolUseBlock {
                id: "1".to_string(),
                name: "readFile".to_string(),
                input: serde_json::json!({"path": "index.html"}),
            }),
            ContentBlock::Text { text: "b".to_string() },
        ]);
        assert_eq!(content.text(), "ab");
        assert_eq!(content.tool_uses().len(), 1);
    }
}
