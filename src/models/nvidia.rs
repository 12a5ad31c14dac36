//! Vendor API backend (NVIDIA build.nvidia.com integrate endpoint).
//!
//! Talks the OpenAI chat-completions dialect with bearer-token auth.
//! Requires an API key; construction fails without one (see
//! [`build_lm_client`](super::build_lm_client)).

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

use super::{
    parse_token_usage, parse_tool_calls, serialize_messages, strip_reasoning_spans, ChatMessage,
    ChatMetadata, ChatOptions, ChatReply, LmClient, ToolChatReply,
};

pub const DEFAULT_ENDPOINT: &str = "https://integrate.api.nvidia.com/v1/chat/completions";

/// Provider for the hosted NVIDIA API.
pub struct NvidiaProvider {
    model: String,
    api_key: String,
    endpoint: String,
    client: Client,
}

impl NvidiaProvider {
    /// Create a provider; `endpoint` overrides the default
    /// chat-completions URL when set.
    pub fn new(model: String, api_key: String, endpoint: Option<String>) -> Self {
        Self {
            model,
            api_key,
            endpoint: endpoint.unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            client: http_client(),
        }
    }

    fn body(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> serde_json::Value {
        let mut body = json!({
            "model": self.model,
            "messages": serialize_messages(messages),
        });
        if let Some(t) = options.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(m) = options.max_tokens {
            body["max_tokens"] = json!(m);
        }
        body
    }

    async fn post(&self, body: serde_json::Value) -> anyhow::Result<serde_json::Value> {
        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("NVIDIA API returned {}: {text}", status.as_u16());
        }
        Ok(resp.json().await?)
    }
}

pub(super) fn http_client() -> Client {
    Client::builder()
        .timeout(std::time::Duration::from_secs(90))
        .connect_timeout(std::time::Duration::from_secs(10))
        .build()
        .unwrap_or_default()
}

pub(super) fn reply_from_json(json: &serde_json::Value) -> ChatReply {
    let content = json["choices"][0]["message"]["content"]
        .as_str()
        .unwrap_or("")
        .to_string();
    ChatReply {
        content: strip_reasoning_spans(&content),
        metadata: ChatMetadata {
            model: json["model"].as_str().map(String::from),
            usage: parse_token_usage(json),
            cache_hit_rate: None,
        },
    }
}

/// Wrap plain function definitions into the modern `tools` array shape.
pub(super) fn wrap_tools(tools: &[serde_json::Value]) -> Vec<serde_json::Value> {
    tools
        .iter()
        .map(|t| {
            if t.get("type").is_some() {
                t.clone()
            } else {
                json!({ "type": "function", "function": t })
            }
        })
        .collect()
}

#[async_trait]
impl LmClient for NvidiaProvider {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> anyhow::Result<ChatReply> {
        let json = self.post(self.body(messages, options)).await?;
        Ok(reply_from_json(&json))
    }

    async fn chat_with_tools(
        &self,
        messages: &[ChatMessage],
        tools: &[serde_json::Value],
        options: &ChatOptions,
    ) -> anyhow::Result<ToolChatReply> {
        let mut body = self.body(messages, options);
        if !tools.is_empty() {
            body["tools"] = serde_json::Value::Array(wrap_tools(tools));
            body["tool_choice"] = json!("auto");
        }
        let json = self.post(body).await?;
        if let Some(calls) = parse_tool_calls(&json) {
            return Ok(ToolChatReply::ToolCalls(calls));
        }
        Ok(ToolChatReply::Final(reply_from_json(&json)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_endpoint_used_without_override() {
        let p = NvidiaProvider::new("nvidia/llama-3.1-nemotron-nano-8b-v1".into(), "k".into(), None);
        assert_eq!(p.endpoint, DEFAULT_ENDPOINT);
    }

    #[test]
    fn wrap_tools_adds_function_envelope() {
        let raw = vec![serde_json::json!({"name": "f", "parameters": {}})];
        let wrapped = wrap_tools(&raw);
        assert_eq!(wrapped[0]["type"], "function");
        assert_eq!(wrapped[0]["function"]["name"], "f");
    }

    #[test]
    fn wrap_tools_keeps_pre_wrapped_entries() {
        let raw = vec![serde_json::json!({"type": "function", "function": {"name": "g"}})];
        let wrapped = wrap_tools(&raw);
        assert_eq!(wrapped[0]["function"]["name"], "g");
    }

    #[tokio::test]
    async fn chat_fails_without_server() {
        let p = NvidiaProvider::new(
            "test".into(),
            "k".into(),
            Some("http://127.0.0.1:1/v1/chat/completions".into()),
        );
        let msgs = vec![ChatMessage::new("user", "hi")];
        assert!(p.chat(&msgs, &ChatOptions::default()).await.is_err());
    }
}
