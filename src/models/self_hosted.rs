//! Self-hosted backend: an OpenAI-compatible endpoint served locally by
//! a NIM / vLLM container.
//!
//! Needs no auth.  When the server exposes a Prometheus `/metrics`
//! endpoint, the provider scrapes the vLLM prefix-cache counters around
//! each call and reports the incremental hit rate in [`ChatMetadata`],
//! the signal the stable-prompt mode exists to maximise.
//!
//! [`ChatMetadata`]: super::ChatMetadata

use std::sync::Mutex;
use std::sync::OnceLock;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::debug;

use super::nvidia::{http_client, reply_from_json, wrap_tools};
use super::{parse_tool_calls, ChatMessage, ChatOptions, ChatReply, LmClient, ToolChatReply};

pub const DEFAULT_ENDPOINT: &str = "http://localhost:8000/v1/chat/completions";

/// Provider for a self-hosted OpenAI-compatible server.
pub struct SelfHostedProvider {
    model: String,
    endpoint: String,
    metrics_url: Option<String>,
    client: Client,
    /// Last observed (queries_total, hits_total) counters.
    baseline: Mutex<Option<(f64, f64)>>,
}

impl SelfHostedProvider {
    /// Create a provider; `endpoint` overrides the default local URL.
    ///
    /// The metrics URL is derived from the endpoint origin when the
    /// path looks like a standard `/v1/chat/completions`.
    pub fn new(model: String, endpoint: Option<String>) -> Self {
        let endpoint = endpoint.unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());
        let metrics_url = endpoint
            .strip_suffix("/v1/chat/completions")
            .map(|origin| format!("{origin}/metrics"));
        Self {
            model,
            endpoint,
            metrics_url,
            client: http_client(),
            baseline: Mutex::new(None),
        }
    }

    fn body(&self, messages: &[ChatMessage], options: &ChatOptions) -> serde_json::Value {
        let mut body = json!({
            "model": self.model,
            "messages": super::serialize_messages(messages),
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
        let resp = self.client.post(&self.endpoint).json(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("self-hosted LM returned {}: {text}", status.as_u16());
        }
        Ok(resp.json().await?)
    }

    /// Scrape the prefix-cache counters and return the hit rate (0–100)
    /// accumulated since the previous scrape.  Best effort: any failure
    /// yields `None` and leaves the baseline untouched.
    async fn incremental_cache_hit_rate(&self) -> Option<f64> {
        let url = self.metrics_url.as_ref()?;
        let text = self
            .client
            .get(url)
            .timeout(std::time::Duration::from_secs(2))
            .send()
            .await
            .ok()?
            .text()
            .await
            .ok()?;
        let (queries, hits) = parse_prefix_cache_counters(&text)?;

        let mut baseline = self.baseline.lock().ok()?;
        let rate = match *baseline {
            Some((q0, h0)) if queries > q0 => Some((hits - h0) / (queries - q0) * 100.0),
            _ => None,
        };
        *baseline = Some((queries, hits));
        rate
    }
}

/// Extract `vllm:prefix_cache_queries_total` / `…_hits_total` from a
/// Prometheus exposition body.  Labels between the metric name and the
/// value are tolerated.
fn parse_prefix_cache_counters(text: &str) -> Option<(f64, f64)> {
    static QUERIES: OnceLock<regex::Regex> = OnceLock::new();
    static HITS: OnceLock<regex::Regex> = OnceLock::new();
    let queries_re = QUERIES.get_or_init(|| {
        regex::Regex::new(r"(?m)^vllm:prefix_cache_queries_total(?:\{[^}]*\})?\s+([\d.eE+-]+)")
            .expect("queries pattern compiles")
    });
    let hits_re = HITS.get_or_init(|| {
        regex::Regex::new(r"(?m)^vllm:prefix_cache_hits_total(?:\{[^}]*\})?\s+([\d.eE+-]+)")
            .expect("hits pattern compiles")
    });

    let queries: f64 = queries_re.captures(text)?.get(1)?.as_str().parse().ok()?;
    let hits: f64 = hits_re.captures(text)?.get(1)?.as_str().parse().ok()?;
    Some((queries, hits))
}

#[async_trait]
impl LmClient for SelfHostedProvider {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> anyhow::Result<ChatReply> {
        let json = self.post(self.body(messages, options)).await?;
        let mut reply = reply_from_json(&json);
        reply.metadata.cache_hit_rate = self.incremental_cache_hit_rate().await;
        if let Some(rate) = reply.metadata.cache_hit_rate {
            debug!(cache_hit_rate = rate, "prefix cache scrape");
        }
        Ok(reply)
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
        let mut reply = reply_from_json(&json);
        reply.metadata.cache_hit_rate = self.incremental_cache_hit_rate().await;
        Ok(ToolChatReply::Final(reply))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_url_derived_from_endpoint() {
        let p = SelfHostedProvider::new("m".into(), None);
        assert_eq!(p.metrics_url.as_deref(), Some("http://localhost:8000/metrics"));
    }

    #[test]
    fn metrics_url_absent_for_custom_paths() {
        let p = SelfHostedProvider::new("m".into(), Some("http://host:9/custom".into()));
        assert!(p.metrics_url.is_none());
    }

    #[test]
    fn counters_parse_with_and_without_labels() {
        let body = "\
# HELP vllm:prefix_cache_queries_total …
vllm:prefix_cache_queries_total{model=\"m\"} 1200
vllm:prefix_cache_hits_total 900
";
        let (q, h) = parse_prefix_cache_counters(body).unwrap();
        assert_eq!(q, 1200.0);
        assert_eq!(h, 900.0);
    }

    #[test]
    fn counters_absent_yields_none() {
        assert!(parse_prefix_cache_counters("nothing relevant").is_none());
    }
}
