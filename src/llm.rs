use crate::config::Config;
use crate::session::{AssistantSession, DeltaStream};
use crate::streaming::sse_deltas;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_MODEL: &str = "gemini-1.5-flash";

/// Connection settings for a Gemini chat session
#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub request_timeout: Duration,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
    pub system_instruction: Option<String>,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            request_timeout: Duration::from_secs(60),
            temperature: None,
            max_output_tokens: None,
            system_instruction: None,
        }
    }
}

impl From<&Config> for GeminiConfig {
    fn from(config: &Config) -> Self {
        Self {
            api_key: config.get_api_key(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            temperature: config.temperature,
            max_output_tokens: config.max_output_tokens,
            system_instruction: config.system_instruction.clone(),
        }
    }
}

/// One turn as the Gemini API represents it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Content {
    pub fn user(text: impl Into<String>) -> Self {
        Self::with_role("user", text)
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self::with_role("model", text)
    }

    fn with_role(role: &str, text: impl Into<String>) -> Self {
        Self {
            role: Some(role.to_string()),
            parts: vec![Part { text: Some(text.into()) }],
        }
    }

    /// Concatenated text of every text part
    pub fn text(&self) -> String {
        self.parts.iter().filter_map(|p| p.text.as_deref()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    code: u16,
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: String,
}

impl GenerateContentResponse {
    /// Text of the first candidate, if it carries any content
    fn text(&self) -> Option<String> {
        self.candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(Content::text)
    }

    fn describe_empty(&self) -> String {
        if let Some(reason) = self.prompt_feedback.as_ref().and_then(|f| f.block_reason.as_deref()) {
            return format!("prompt blocked: {reason}");
        }
        match self.candidates.first().and_then(|c| c.finish_reason.as_deref()) {
            Some(reason) => format!("no text in response (finish reason {reason})"),
            None => "no candidates in response".to_string(),
        }
    }
}

/// Map one streamed `data:` payload to a text delta
fn parse_stream_payload(payload: &str) -> Option<Result<String>> {
    if let Ok(body) = serde_json::from_str::<ApiErrorBody>(payload) {
        return Some(Err(api_error(body.error)));
    }
    match serde_json::from_str::<GenerateContentResponse>(payload) {
        Ok(chunk) => match chunk.text() {
            Some(text) if !text.is_empty() => Some(Ok(text)),
            Some(_) => None,
            None if chunk.prompt_feedback.as_ref().is_some_and(|f| f.block_reason.is_some()) => Some(Err(anyhow!(
                "Gemini stream returned {}",
                chunk.describe_empty()
            ))),
            None => None,
        },
        Err(e) => Some(Err(anyhow!(e).context("Malformed Gemini stream chunk"))),
    }
}

fn api_error(error: ApiError) -> anyhow::Error {
    anyhow!("Gemini API error {} {}: {}", error.code, error.status, error.message)
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let error_text = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ApiErrorBody>(&error_text) {
        Ok(body) => Err(api_error(body.error)),
        Err(_) => Err(anyhow!("Gemini API error {}: {}", status, error_text)),
    }
}

/// Chat session with a Gemini model.
///
/// Conversation history lives here and is sent with every request; a turn is
/// only recorded once its reply has arrived in full.
#[derive(Clone)]
pub struct GeminiSession {
    client: reqwest::Client,
    config: GeminiConfig,
    history: Arc<Mutex<Vec<Content>>>,
}

impl GeminiSession {
    /// Build the HTTP client and check that the configured model exists
    pub async fn connect(config: GeminiConfig) -> Result<Self> {
        let session = Self::new(config)?;
        session.verify_model().await?;
        tracing::info!(model = %session.config.model, "connected to Gemini");
        Ok(session)
    }

    /// Build a session without contacting the API
    pub fn new(mut config: GeminiConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .context("No API key configured. Set GEMINI_API_KEY or add api_key to the config file.")?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            "x-goog-api-key",
            HeaderValue::from_str(api_key.trim()).context("API key is not a valid header value")?,
        );

        // Whole-request deadlines are set per call; a streamed body may run longer
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(config.request_timeout)
            .build()
            .context("Failed to create HTTP client")?;

        config.model = config.model.trim_start_matches("models/").to_string();

        Ok(Self {
            client,
            config,
            history: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    /// Turns recorded so far
    pub async fn history(&self) -> Vec<Content> {
        self.history.lock().await.clone()
    }

    fn model_url(&self, method: &str) -> String {
        format!("{}/models/{}:{}", self.config.base_url, self.config.model, method)
    }

    async fn verify_model(&self) -> Result<()> {
        let url = format!("{}/models/{}", self.config.base_url, self.config.model);
        let response = self
            .client
            .get(&url)
            .timeout(self.config.request_timeout)
            .send()
            .await
            .context("Failed to reach Gemini API")?;
        check_status(response)
            .await
            .with_context(|| format!("Model '{}' is not available", self.config.model))?;
        Ok(())
    }

    fn build_request(&self, history: &[Content], user: &Content) -> GenerateContentRequest {
        let mut contents = history.to_vec();
        contents.push(user.clone());

        let generation_config = if self.config.temperature.is_some() || self.config.max_output_tokens.is_some() {
            Some(GenerationConfig {
                temperature: self.config.temperature,
                max_output_tokens: self.config.max_output_tokens,
            })
        } else {
            None
        };

        GenerateContentRequest {
            contents,
            system_instruction: self
                .config
                .system_instruction
                .as_ref()
                .filter(|s| !s.trim().is_empty())
                .map(|s| Content {
                    role: None,
                    parts: vec![Part { text: Some(s.clone()) }],
                }),
            generation_config,
        }
    }
}

#[async_trait]
impl AssistantSession for GeminiSession {
    #[tracing::instrument(level = "debug", skip_all, fields(model = %self.config.model))]
    async fn send_atomic(&self, text: &str) -> Result<String> {
        let user = Content::user(text);
        let request = {
            let history = self.history.lock().await;
            self.build_request(&history, &user)
        };

        let response = self
            .client
            .post(self.model_url("generateContent"))
            .json(&request)
            .timeout(self.config.request_timeout)
            .send()
            .await
            .context("Failed to send request to Gemini")?;
        let response: GenerateContentResponse = check_status(response)
            .await?
            .json()
            .await
            .context("Malformed Gemini response")?;

        let reply = response
            .text()
            .ok_or_else(|| anyhow!("Gemini returned {}", response.describe_empty()))?;
        tracing::debug!(chars = reply.len(), "received reply");

        self.history.lock().await.extend([user, Content::model(reply.clone())]);
        Ok(reply)
    }

    #[tracing::instrument(level = "debug", skip_all, fields(model = %self.config.model))]
    async fn send_streaming(&self, text: &str) -> Result<DeltaStream> {
        let user = Content::user(text);
        let request = {
            let history = self.history.lock().await;
            self.build_request(&history, &user)
        };

        let pending = self
            .client
            .post(format!("{}?alt=sse", self.model_url("streamGenerateContent")))
            .json(&request)
            .send();
        let response = tokio::time::timeout(self.config.request_timeout, pending)
            .await
            .map_err(|_| anyhow!("Gemini did not start streaming within {:?}", self.config.request_timeout))?
            .context("Failed to send request to Gemini")?;
        let response = check_status(response).await?;

        let deltas = sse_deltas(
            Box::pin(response.bytes_stream()),
            parse_stream_payload,
            self.config.request_timeout,
        );
        Ok(record_turn(Box::pin(deltas), user, self.history.clone()))
    }
}

struct TurnState {
    deltas: DeltaStream,
    reply: String,
    user: Content,
    history: Arc<Mutex<Vec<Content>>>,
}

/// Pass deltas through, adding the turn to `history` once the stream ends cleanly
fn record_turn(deltas: DeltaStream, user: Content, history: Arc<Mutex<Vec<Content>>>) -> DeltaStream {
    let state = TurnState {
        deltas,
        reply: String::new(),
        user,
        history,
    };

    Box::pin(stream::unfold(Some(state), |state| async move {
        let mut state = state?;
        match state.deltas.next().await {
            Some(Ok(delta)) => {
                state.reply.push_str(&delta);
                Some((Ok(delta), Some(state)))
            }
            Some(Err(e)) => Some((Err(e), None)),
            None => {
                tracing::debug!(chars = state.reply.len(), "stream complete");
                state
                    .history
                    .lock()
                    .await
                    .extend([state.user, Content::model(state.reply)]);
                None
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(config: GeminiConfig) -> GeminiSession {
        GeminiSession::new(GeminiConfig {
            api_key: Some("test-key".to_string()),
            ..config
        })
        .unwrap()
    }

    #[test]
    fn new_requires_api_key() {
        let err = GeminiSession::new(GeminiConfig::default()).err().unwrap();
        assert!(err.to_string().contains("No API key"));

        let blank = GeminiConfig {
            api_key: Some("   ".to_string()),
            ..GeminiConfig::default()
        };
        assert!(GeminiSession::new(blank).is_err());
    }

    #[test]
    fn model_prefix_is_normalized() {
        let session = session(GeminiConfig {
            model: "models/gemini-1.5-pro".to_string(),
            ..GeminiConfig::default()
        });
        assert_eq!(session.model(), "gemini-1.5-pro");
        assert_eq!(
            session.model_url("generateContent"),
            format!("{DEFAULT_BASE_URL}/models/gemini-1.5-pro:generateContent")
        );
    }

    #[test]
    fn request_serializes_history_and_options() {
        let session = session(GeminiConfig {
            temperature: Some(0.5),
            max_output_tokens: Some(256),
            system_instruction: Some("Be brief.".to_string()),
            ..GeminiConfig::default()
        });
        let history = vec![Content::user("hi"), Content::model("hello")];
        let request = session.build_request(&history, &Content::user("2+2?"));

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "contents": [
                    {"role": "user", "parts": [{"text": "hi"}]},
                    {"role": "model", "parts": [{"text": "hello"}]},
                    {"role": "user", "parts": [{"text": "2+2?"}]}
                ],
                "systemInstruction": {"parts": [{"text": "Be brief."}]},
                "generationConfig": {"temperature": 0.5, "maxOutputTokens": 256}
            })
        );
    }

    #[test]
    fn request_omits_unset_options() {
        let session = session(GeminiConfig::default());
        let json = serde_json::to_value(session.build_request(&[], &Content::user("x"))).unwrap();
        assert!(json.get("systemInstruction").is_none());
        assert!(json.get("generationConfig").is_none());
    }

    #[test]
    fn response_text_joins_parts_of_first_candidate() {
        let response: GenerateContentResponse = serde_json::from_str(
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"4"},{"text":"!"}]},"finishReason":"STOP"}]}"#,
        )
        .unwrap();
        assert_eq!(response.text().as_deref(), Some("4!"));
    }

    #[test]
    fn blocked_prompt_is_described() {
        let response: GenerateContentResponse =
            serde_json::from_str(r#"{"promptFeedback":{"blockReason":"SAFETY"}}"#).unwrap();
        assert_eq!(response.text(), None);
        assert_eq!(response.describe_empty(), "prompt blocked: SAFETY");
    }

    #[test]
    fn stream_payloads_map_to_deltas() {
        let delta = parse_stream_payload(r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Hel"}]}}]}"#);
        assert_eq!(delta.unwrap().unwrap(), "Hel");

        let finish_only = parse_stream_payload(r#"{"candidates":[{"finishReason":"STOP"}]}"#);
        assert!(finish_only.is_none());

        let usage_only = parse_stream_payload(r#"{"usageMetadata":{"totalTokenCount":12}}"#);
        assert!(usage_only.is_none());

        let blocked = parse_stream_payload(r#"{"promptFeedback":{"blockReason":"SAFETY"}}"#);
        assert!(blocked.unwrap().unwrap_err().to_string().contains("SAFETY"));

        let malformed = parse_stream_payload("{not json");
        assert!(malformed.unwrap().is_err());

        let api = parse_stream_payload(r#"{"error":{"code":429,"message":"quota","status":"RESOURCE_EXHAUSTED"}}"#);
        let err = api.unwrap().unwrap_err().to_string();
        assert!(err.contains("429") && err.contains("quota"));
    }

    #[tokio::test]
    async fn record_turn_updates_history_on_clean_end() {
        let history = Arc::new(Mutex::new(Vec::new()));
        let deltas: DeltaStream = Box::pin(stream::iter(vec![Ok("Hel".to_string()), Ok("lo".to_string())]));

        let out: Vec<String> = record_turn(deltas, Content::user("hi"), history.clone())
            .map(|d| d.unwrap())
            .collect()
            .await;

        assert_eq!(out, vec!["Hel", "lo"]);
        assert_eq!(*history.lock().await, vec![Content::user("hi"), Content::model("Hello")]);
    }

    #[tokio::test]
    async fn record_turn_skips_history_on_failure() {
        let history = Arc::new(Mutex::new(Vec::new()));
        let deltas: DeltaStream = Box::pin(stream::iter(vec![
            Ok("Hel".to_string()),
            Err(anyhow!("connection reset")),
        ]));

        let out: Vec<Result<String>> = record_turn(deltas, Content::user("hi"), history.clone())
            .collect()
            .await;

        assert_eq!(out.len(), 2);
        assert!(out[1].is_err());
        assert!(history.lock().await.is_empty());
    }

    /// Serve one SSE response, writing each chunk `gap` after the previous one
    async fn slow_sse_server(chunks: Vec<String>, gap: Duration) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();

            // Read the whole request before answering
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    return;
                }
                request.extend_from_slice(&buf[..n]);
                if let Some(end) = request.windows(4).position(|w| w == b"\r\n\r\n") {
                    let head = String::from_utf8_lossy(&request[..end]).to_lowercase();
                    let length = head
                        .lines()
                        .find_map(|line| line.strip_prefix("content-length:"))
                        .and_then(|v| v.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    if request.len() >= end + 4 + length {
                        break;
                    }
                }
            }

            socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\nconnection: close\r\n\r\n")
                .await
                .unwrap();
            for chunk in chunks {
                socket.write_all(chunk.as_bytes()).await.unwrap();
                socket.flush().await.unwrap();
                tokio::time::sleep(gap).await;
            }
            socket.shutdown().await.unwrap();
        });

        format!("http://{addr}")
    }

    fn sse_text_chunk(text: &str) -> String {
        format!("data: {{\"candidates\":[{{\"content\":{{\"role\":\"model\",\"parts\":[{{\"text\":\"{text}\"}}]}}}}]}}\n\n")
    }

    #[tokio::test]
    async fn streamed_reply_may_outlast_request_timeout() {
        let chunks = ["Hel", "lo, ", "wor", "ld"].into_iter().map(sse_text_chunk).collect();
        let base_url = slow_sse_server(chunks, Duration::from_millis(600)).await;
        let session = session(GeminiConfig {
            base_url,
            request_timeout: Duration::from_secs(1),
            ..GeminiConfig::default()
        });

        let deltas: Vec<Result<String>> = session.send_streaming("hi").await.unwrap().collect().await;
        let reply: String = deltas.into_iter().map(|d| d.unwrap()).collect();

        assert_eq!(reply, "Hello, world");
        assert_eq!(session.history().await, vec![Content::user("hi"), Content::model("Hello, world")]);
    }
}
