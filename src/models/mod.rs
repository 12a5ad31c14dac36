//! LM capability abstractions.
//!
//! Defines the [`LmClient`] trait (one `chat` capability with a
//! tool-calling variant), the [`ChatMessage`] type, the [`RetryPolicy`]
//! backoff wrapper, and response post-processing (reasoning-span
//! stripping, fenced-JSON extraction).  Two concrete backends exist,
//! [`self_hosted::SelfHostedProvider`] and [`nvidia::NvidiaProvider`],
//! chosen at construction via [`build_lm_client`].

pub mod nvidia;
pub mod self_hosted;

use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub use nvidia::NvidiaProvider;
pub use self_hosted::SelfHostedProvider;

// ---------------------------------------------------------------------------
// ChatMessage – shared message representation
// ---------------------------------------------------------------------------

/// A single chat message with a role and content.
///
/// Optionally carries OpenAI tool-calling metadata so that `tool` role
/// messages and assistant `tool_calls` turns serialise correctly.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    /// For assistant messages that invoke tools: the raw `tool_calls` array.
    pub tool_calls: Option<Vec<serde_json::Value>>,
    /// For `role: "tool"` messages: the id of the tool call answered.
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    /// Convenience constructor for a plain message (no tool metadata).
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

/// Serialise messages into the OpenAI-compatible JSON array format,
/// including `tool_calls` and `tool_call_id` when present.
pub fn serialize_messages(messages: &[ChatMessage]) -> Vec<serde_json::Value> {
    messages
        .iter()
        .map(|m| {
            let mut msg = serde_json::json!({ "role": m.role });
            if let Some(ref tcs) = m.tool_calls {
                msg["tool_calls"] = serde_json::json!(tcs);
                // The API expects null content on assistant messages that
                // carry tool_calls.
                if m.content.is_empty() {
                    msg["content"] = serde_json::Value::Null;
                } else {
                    msg["content"] = serde_json::json!(m.content);
                }
            } else {
                msg["content"] = serde_json::json!(m.content);
            }
            if let Some(ref tcid) = m.tool_call_id {
                msg["tool_call_id"] = serde_json::json!(tcid);
            }
            msg
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Options / replies
// ---------------------------------------------------------------------------

/// Per-call options conveyed to the backend.
#[derive(Debug, Clone)]
pub struct ChatOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Cooperative cancellation hook; checked between retry attempts.
    pub cancel: CancellationToken,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            temperature: Some(0.3),
            max_tokens: None,
            cancel: CancellationToken::new(),
        }
    }
}

impl ChatOptions {
    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self { cancel, ..Self::default() }
    }
}

/// Token usage statistics reported by the API.
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Response metadata; everything optional.
#[derive(Debug, Clone, Default)]
pub struct ChatMetadata {
    pub model: Option<String>,
    pub usage: Option<TokenUsage>,
    /// Incremental prefix-cache hit rate reported by the backend, 0–100.
    pub cache_hit_rate: Option<f64>,
}

/// A completed chat reply.
#[derive(Debug, Clone)]
pub struct ChatReply {
    pub content: String,
    pub metadata: ChatMetadata,
}

/// A single requested tool call.
#[derive(Debug, Clone)]
pub struct ToolCallItem {
    /// Tool-call id assigned by the API (may be empty).
    pub id: String,
    pub name: String,
    /// Raw JSON-encoded arguments string.
    pub arguments: String,
}

/// Response from a tool-aware chat: either a final text reply or one or
/// more tool-call requests.
#[derive(Debug, Clone)]
pub enum ToolChatReply {
    Final(ChatReply),
    ToolCalls(Vec<ToolCallItem>),
}

// ---------------------------------------------------------------------------
// LmClient trait
// ---------------------------------------------------------------------------

/// The single LM capability: chat completion over role-tagged messages.
#[async_trait]
pub trait LmClient: Send + Sync {
    /// Send messages, return the assistant reply (reasoning spans
    /// already stripped).
    async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> anyhow::Result<ChatReply>;

    /// Send messages with tool definitions; the model may answer with
    /// tool calls instead of text.  The default delegates to [`chat`]
    /// for backends without tool support.
    ///
    /// [`chat`]: LmClient::chat
    async fn chat_with_tools(
        &self,
        messages: &[ChatMessage],
        _tools: &[serde_json::Value],
        options: &ChatOptions,
    ) -> anyhow::Result<ToolChatReply> {
        Ok(ToolChatReply::Final(self.chat(messages, options).await?))
    }
}

/// Build the configured backend.
///
/// `self-hosted` (or `USE_SELF_HOSTED_LLM=true`, resolved by the config
/// layer) selects the local OpenAI-compatible endpoint; anything else is
/// the vendor API.
pub fn build_lm_client(model: &crate::config::ModelConfig) -> anyhow::Result<Arc<dyn LmClient>> {
    match model.provider.as_str() {
        "self-hosted" | "self_hosted" => Ok(Arc::new(SelfHostedProvider::new(
            model.model.clone(),
            model.endpoint.clone(),
        ))),
        _ => {
            let key = model.resolved_api_key();
            if key.is_empty() {
                anyhow::bail!(
                    "vendor LM backend requires an api key (set NVIDIA_API_KEY or model.api_key)"
                );
            }
            Ok(Arc::new(NvidiaProvider::new(
                model.model.clone(),
                key,
                model.endpoint.clone(),
            )))
        }
    }
}

// ---------------------------------------------------------------------------
// Failure markers
// ---------------------------------------------------------------------------

/// Marker error: the LM call failed after the retry policy was exhausted.
#[derive(Debug)]
pub struct LmFailure(pub String);

impl std::fmt::Display for LmFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LM call failed after retries: {}", self.0)
    }
}

impl std::error::Error for LmFailure {}

/// Marker error: the request was cancelled.
#[derive(Debug)]
pub struct Cancelled;

impl std::fmt::Display for Cancelled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("cancelled")
    }
}

impl std::error::Error for Cancelled {}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Bounded retry with exponential backoff and ±20% jitter.
///
/// Retryable: HTTP 429/502/503/504, connection reset/refused/timeout,
/// DNS failures.  Everything else fails fast.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// `chat` with retries; terminal failures carry an [`LmFailure`]
    /// marker, cancellation a [`Cancelled`] marker.
    pub async fn chat(
        &self,
        client: &dyn LmClient,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> anyhow::Result<ChatReply> {
        self.run(options, || client.chat(messages, options)).await
    }

    /// Tool-aware variant of [`chat`](RetryPolicy::chat).
    pub async fn chat_with_tools(
        &self,
        client: &dyn LmClient,
        messages: &[ChatMessage],
        tools: &[serde_json::Value],
        options: &ChatOptions,
    ) -> anyhow::Result<ToolChatReply> {
        self.run(options, || client.chat_with_tools(messages, tools, options))
            .await
    }

    async fn run<T, F, Fut>(&self, options: &ChatOptions, mut call: F) -> anyhow::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<T>>,
    {
        let mut delay = self.initial_delay;
        let mut attempt = 0usize;
        loop {
            if options.cancel.is_cancelled() {
                return Err(anyhow::Error::new(Cancelled));
            }
            match call().await {
                Ok(reply) => return Ok(reply),
                Err(e) => {
                    let retryable = is_retryable_error(&e);
                    warn!(
                        attempt = attempt + 1,
                        retryable,
                        error = %e,
                        "LM call failed"
                    );
                    if !retryable || attempt >= self.max_retries {
                        return Err(anyhow::Error::new(LmFailure(e.to_string())));
                    }
                    attempt += 1;
                    tokio::select! {
                        _ = tokio::time::sleep(jittered(delay)) => {}
                        _ = options.cancel.cancelled() => {
                            return Err(anyhow::Error::new(Cancelled));
                        }
                    }
                    delay = Duration::from_secs_f64(
                        (delay.as_secs_f64() * self.multiplier)
                            .min(self.max_delay.as_secs_f64()),
                    );
                }
            }
        }
    }
}

/// Apply ±20% uniform jitter to a delay.
fn jittered(d: Duration) -> Duration {
    use rand::Rng;
    let factor = rand::thread_rng().gen_range(0.8..=1.2);
    Duration::from_secs_f64(d.as_secs_f64() * factor)
}

/// Classify an error as transient (worth retrying).
///
/// Parses status codes out of messages like `"… returned 503: …"` the
/// same way the providers format them.
pub fn is_retryable_error(err: &anyhow::Error) -> bool {
    for cause in err.chain() {
        if let Some(re) = cause.downcast_ref::<reqwest::Error>() {
            if re.is_connect() || re.is_timeout() {
                return true;
            }
        }
    }
    let msg = err.to_string().to_lowercase();
    for code in ["429", "502", "503", "504"] {
        if msg.contains(&format!("returned {code}")) || msg.contains(&format!("status: {code}")) {
            return true;
        }
    }
    msg.contains("connection reset")
        || msg.contains("connection refused")
        || msg.contains("connection closed")
        || msg.contains("timed out")
        || msg.contains("dns error")
        || msg.contains("failed to lookup")
}

// ---------------------------------------------------------------------------
// Response post-processing
// ---------------------------------------------------------------------------

fn reasoning_tag_pattern() -> &'static regex::Regex {
    static TAG: OnceLock<regex::Regex> = OnceLock::new();
    TAG.get_or_init(|| {
        regex::Regex::new(
            r"(?i)</?(?:redacted_reasoning|thinking|think|reasoning|thought)[^>]*>",
        )
        .expect("reasoning tag pattern compiles")
    })
}

/// Remove reasoning spans (`<think>…</think>` and friends) from an LM
/// reply.
///
/// Case-insensitive, spans may contain newlines and nest; the tag
/// families are interchangeable so mismatched pairs like
/// `<redacted_reasoning>…</think>` still close.  Text inside an
/// unterminated span is dropped, orphan closing tags are discarded.
pub fn strip_reasoning_spans(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut depth = 0usize;
    let mut last = 0;
    for m in reasoning_tag_pattern().find_iter(content) {
        if depth == 0 {
            out.push_str(&content[last..m.start()]);
        }
        if content[m.start()..m.end()].starts_with("</") {
            depth = depth.saturating_sub(1);
        } else {
            depth += 1;
        }
        last = m.end();
    }
    if depth == 0 {
        out.push_str(&content[last..]);
    }
    out.trim().to_string()
}

/// Extract the inner content of the first fenced code block
/// (```` ```json ```` or a bare ```` ``` ````).  Returns the trimmed
/// input when no fence is present.
pub fn extract_fenced_json(reply: &str) -> String {
    let text = reply.replace("\r\n", "\n");
    for tag in ["```json", "```"] {
        if let Some(open) = text.find(tag) {
            let after_tag = &text[open + tag.len()..];
            let Some(nl) = after_tag.find('\n') else { continue };
            let inner = &after_tag[nl + 1..];
            if let Some(close) = inner.find("\n```") {
                return inner[..close].trim().to_string();
            }
        }
    }
    text.trim().to_string()
}

/// Extract token usage from an OpenAI-style response JSON.
pub fn parse_token_usage(json: &serde_json::Value) -> Option<TokenUsage> {
    let usage = json.get("usage")?;
    Some(TokenUsage {
        prompt_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0),
        completion_tokens: usage["completion_tokens"].as_u64().unwrap_or(0),
        total_tokens: usage["total_tokens"].as_u64().unwrap_or(0),
    })
}

/// Parse `tool_calls` (or the legacy `function_call`) from an
/// OpenAI-style chat completion response.
pub fn parse_tool_calls(json: &serde_json::Value) -> Option<Vec<ToolCallItem>> {
    let message = json.get("choices")?.get(0)?.get("message")?;

    if let Some(tool_calls) = message.get("tool_calls").and_then(|v| v.as_array()) {
        let items: Vec<ToolCallItem> = tool_calls
            .iter()
            .filter_map(|tc| {
                let func = tc.get("function")?;
                let name = func.get("name")?.as_str()?.to_string();
                let arguments = func
                    .get("arguments")
                    .and_then(|a| a.as_str())
                    .unwrap_or("{}")
                    .to_string();
                let id = tc
                    .get("id")
                    .and_then(|i| i.as_str())
                    .unwrap_or("")
                    .to_string();
                Some(ToolCallItem { id, name, arguments })
            })
            .collect();
        if !items.is_empty() {
            return Some(items);
        }
    }

    if let Some(fc) = message.get("function_call").and_then(|v| v.as_object()) {
        let name = fc
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let arguments = fc
            .get("arguments")
            .and_then(|v| v.as_str())
            .unwrap_or("{}")
            .to_string();
        return Some(vec![ToolCallItem { id: String::new(), name, arguments }]);
    }

    None
}
