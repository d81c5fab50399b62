//! HTTP reasoning collaborator.
//!
//! The engine core only knows the advisor traits; this client ships the
//! assembled context to the reasoning service and returns its raw text.
//! Decisions must be deterministic for identical contexts, so the service is
//! expected to run its models at temperature zero.

use anyhow::{Context, Result};
use async_trait::async_trait;
use procflow_core::advisor::{
    AgentRequestBuilder, AgentResponseNormalizer, CompensationSynthesizer, DecisionContext,
    NextStepAdvisor,
};
use procflow_core::logwriter::LogSink;
use procflow_core::types::WorkItem;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

pub struct HttpReasoner {
    client: reqwest::Client,
    base_url: String,
}

impl HttpReasoner {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    async fn post_text(&self, path: &str, body: Value) -> Result<String> {
        let response = self
            .client
            .post(format!("{}{path}", self.base_url))
            .json(&body)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("reasoning request to {path} failed"))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .with_context(|| format!("reasoning response from {path} unreadable"))?;
        if !status.is_success() {
            anyhow::bail!("reasoning service returned {status} for {path}: {text}");
        }
        // Either a bare string body or `{"response": "..."}`.
        if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(&text) {
            if let Some(Value::String(inner)) = obj.get("response") {
                return Ok(inner.clone());
            }
        }
        Ok(text)
    }
}

#[async_trait]
impl NextStepAdvisor for HttpReasoner {
    async fn advise(&self, context: &DecisionContext, sink: &LogSink) -> Result<String> {
        let body = serde_json::to_value(context)?;
        let text = self.post_text("/next-step", body).await?;
        sink.append(text.clone());
        Ok(text)
    }
}

#[async_trait]
impl AgentRequestBuilder for HttpReasoner {
    async fn build_request(&self, workitem: &WorkItem, previous_outputs: &Value) -> Result<String> {
        self.post_text(
            "/agent-request",
            serde_json::json!({
                "workitem": workitem,
                "previous_outputs": previous_outputs,
            }),
        )
        .await
    }
}

#[async_trait]
impl AgentResponseNormalizer for HttpReasoner {
    async fn normalize(&self, agent_response: &str) -> Result<String> {
        self.post_text(
            "/agent-normalize",
            serde_json::json!({"agent_response": agent_response}),
        )
        .await
    }
}

#[async_trait]
impl CompensationSynthesizer for HttpReasoner {
    async fn synthesize(
        &self,
        tool_map: &BTreeMap<String, String>,
        event_logs: &[Value],
        user_query: &str,
    ) -> Result<String> {
        self.post_text(
            "/compensation",
            serde_json::json!({
                "tool_map": tool_map,
                "event_logs": event_logs,
                "user_input_query": user_query,
            }),
        )
        .await
    }
}
