//! A2A agent dispatch.
//!
//! A claimed `IN_PROGRESS` + `A2A` item goes through three steps (build the
//! request text, send it over the agent channel, normalize the response),
//! each retried up to three times. The normalized output lands on the work
//! item as `SUBMITTED` so the LLM path advances the process next cycle.

use crate::advisor::{AgentRequestBuilder, AgentResponseNormalizer};
use crate::handler::RETRY_LIMIT;
use crate::store::{resolve_assignee, ProcessStore};
use crate::types::*;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;

const STEP_ATTEMPTS: u32 = 3;

/// Transport to the external agent chat endpoint.
#[async_trait]
pub trait AgentChannel: Send + Sync {
    async fn send(
        &self,
        agent_url: &str,
        request_text: &str,
        chat_room_id: &str,
        task_id: &str,
    ) -> Result<String>;
}

/// HTTP transport posting to the execution service's multi-agent chat API.
pub struct HttpAgentChannel {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAgentChannel {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl AgentChannel for HttpAgentChannel {
    async fn send(
        &self,
        agent_url: &str,
        request_text: &str,
        chat_room_id: &str,
        task_id: &str,
    ) -> Result<String> {
        let response = self
            .client
            .post(format!("{}/multi-agent/chat", self.base_url))
            .json(&serde_json::json!({
                "text": request_text,
                "type": "a2a",
                "chat_room_id": chat_room_id,
                "options": {
                    "agent_url": agent_url,
                    "task_id": task_id,
                    "is_stream": false,
                },
            }))
            .timeout(std::time::Duration::from_secs(60))
            .send()
            .await
            .context("agent chat request failed")?;
        let status = response.status();
        let body: Value = response
            .json()
            .await
            .context("agent chat response was not JSON")?;
        if !status.is_success() {
            anyhow::bail!("agent chat endpoint returned {status}: {body}");
        }
        // The chat API wraps the agent's reply in a `response` field.
        let reply = body
            .get("response")
            .cloned()
            .unwrap_or(body);
        Ok(match reply {
            Value::String(s) => s,
            other => other.to_string(),
        })
    }
}

pub struct AgentDispatcher {
    store: Arc<dyn ProcessStore>,
    request_builder: Arc<dyn AgentRequestBuilder>,
    normalizer: Arc<dyn AgentResponseNormalizer>,
    channel: Arc<dyn AgentChannel>,
}

impl AgentDispatcher {
    pub fn new(
        store: Arc<dyn ProcessStore>,
        request_builder: Arc<dyn AgentRequestBuilder>,
        normalizer: Arc<dyn AgentResponseNormalizer>,
        channel: Arc<dyn AgentChannel>,
    ) -> Self {
        Self {
            store,
            request_builder,
            normalizer,
            channel,
        }
    }

    pub async fn handle(&self, workitem: &WorkItem) -> Result<()> {
        let tenant_id = workitem.tenant_id.clone();
        if workitem.retry >= RETRY_LIMIT {
            return Ok(());
        }
        let proc_inst_id = workitem
            .proc_inst_id
            .clone()
            .context("agent work item has no instance id")?;

        // First assignee with a usable A2A endpoint wins.
        let user_id = workitem.user_id.clone().unwrap_or_default();
        let mut agent: Option<AssigneeProfile> = None;
        for part in user_id.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let profile = resolve_assignee(self.store.as_ref(), part).await;
            if profile.kind == AssigneeKind::A2a && profile.url.is_some() {
                agent = Some(profile);
                break;
            }
        }
        let Some(agent) = agent else {
            self.finalize_failure(
                workitem,
                &tenant_id,
                &format!("no reachable A2A agent among assignees '{user_id}'"),
            )
            .await?;
            return Ok(());
        };
        let agent_url = agent.url.clone().unwrap_or_default();

        let previous_outputs = self.previous_outputs(&proc_inst_id, &tenant_id).await?;

        // Step 1: request text.
        self.notify(&proc_inst_id, &tenant_id, &format!("'{}' is starting work...", agent.name))
            .await;
        let Some(request_text) = self
            .attempt(STEP_ATTEMPTS, || {
                self.request_builder.build_request(workitem, &previous_outputs)
            })
            .await
        else {
            self.finalize_failure(workitem, &tenant_id, "failed to build agent request text")
                .await?;
            return Ok(());
        };
        self.log(workitem, &tenant_id, "agent request text prepared").await;

        // Step 2: transport.
        let workitem_id_str = workitem.id.to_string();
        let Some(agent_response) = self
            .attempt(STEP_ATTEMPTS, || {
                self.channel
                    .send(&agent_url, &request_text, &proc_inst_id, &workitem_id_str)
            })
            .await
        else {
            self.finalize_failure(workitem, &tenant_id, "agent transport failed")
                .await?;
            return Ok(());
        };
        self.log(workitem, &tenant_id, "agent response received").await;

        // Step 3: normalization.
        let Some(normalized) = self
            .attempt(STEP_ATTEMPTS, || self.normalizer.normalize(&agent_response))
            .await
        else {
            self.finalize_failure(workitem, &tenant_id, "agent response normalization failed")
                .await?;
            return Ok(());
        };

        let output = parse_normalized_output(&normalized);

        let mut patch = WorkItemPatch::status(WorkItemStatus::Submitted);
        patch.consumer = Some(None);
        patch.output = Some(output.clone());
        patch.log = Some("agent processing completed".to_string());
        self.store
            .patch_workitem(workitem.id, &patch, &tenant_id)
            .await?;

        self.store
            .upsert_chat_message(
                &proc_inst_id,
                serde_json::json!({
                    "role": "agent",
                    "name": format!("[A2A] {} results", agent.name),
                    "content": format!("results from '{}'", agent.name),
                    "jsonContent": output.get("table_data").cloned().unwrap_or(Value::Null),
                    "htmlContent": output.get("html").cloned().unwrap_or(Value::Null),
                    "contentType": if output.get("html").is_some() { "html" } else { "text" },
                }),
                &tenant_id,
            )
            .await?;
        Ok(())
    }

    async fn attempt<T, F, Fut>(&self, attempts: u32, mut operation: F) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        for attempt in 1..=attempts {
            match operation().await {
                Ok(value) => return Some(value),
                Err(error) => {
                    tracing::warn!(attempt, %error, "agent step failed");
                }
            }
        }
        None
    }

    /// Three strikes on any step finalize the item with a failure log.
    async fn finalize_failure(
        &self,
        workitem: &WorkItem,
        tenant_id: &str,
        reason: &str,
    ) -> Result<()> {
        let mut patch = WorkItemPatch::status(WorkItemStatus::Done);
        patch.consumer = Some(None);
        patch.log = Some(format!("agent processing failed: {reason}"));
        self.store
            .patch_workitem(workitem.id, &patch, tenant_id)
            .await?;
        if let Some(proc_inst_id) = &workitem.proc_inst_id {
            self.notify(proc_inst_id, tenant_id, &format!("agent step failed: {reason}"))
                .await;
        }
        Ok(())
    }

    async fn previous_outputs(&self, proc_inst_id: &str, tenant_id: &str) -> Result<Value> {
        let todolist = self.store.fetch_todolist(proc_inst_id, tenant_id).await?;
        let mut outputs = Map::new();
        for item in todolist {
            if !item.output.is_null() {
                outputs.insert(item.activity_id.clone(), item.output.clone());
            }
        }
        Ok(Value::Object(outputs))
    }

    async fn log(&self, workitem: &WorkItem, tenant_id: &str, line: &str) {
        if let Err(error) = self
            .store
            .patch_workitem(workitem.id, &WorkItemPatch::log(line), tenant_id)
            .await
        {
            tracing::warn!(workitem = %workitem.id, %error, "failed to write agent log");
        }
    }

    async fn notify(&self, proc_inst_id: &str, tenant_id: &str, content: &str) {
        let message = serde_json::json!({"role": "system", "content": content});
        if let Err(error) = self
            .store
            .upsert_chat_message(proc_inst_id, message, tenant_id)
            .await
        {
            tracing::warn!(%proc_inst_id, %error, "failed to write agent chat message");
        }
    }
}

/// Strip comment lines, parse, and unwrap `agent_result`; anything hopeless
/// degrades to an empty object.
pub fn parse_normalized_output(normalized: &str) -> Value {
    let cleaned: String = normalized
        .lines()
        .filter(|line| {
            let trimmed = line.trim();
            !trimmed.is_empty() && !trimmed.starts_with("//") && !trimmed.starts_with('#')
        })
        .collect::<Vec<_>>()
        .join("\n");

    let parsed = crate::extract::extract_json(&cleaned).unwrap_or(Value::Object(Map::new()));
    match parsed {
        Value::Object(mut obj) => obj
            .remove("agent_result")
            .unwrap_or(Value::Object(obj)),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_memory::MemoryStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct StaticBuilder;
    #[async_trait]
    impl AgentRequestBuilder for StaticBuilder {
        async fn build_request(&self, workitem: &WorkItem, _prev: &Value) -> Result<String> {
            Ok(format!("please handle {}", workitem.activity_name))
        }
    }

    struct StaticNormalizer {
        response: String,
    }
    #[async_trait]
    impl AgentResponseNormalizer for StaticNormalizer {
        async fn normalize(&self, _agent_response: &str) -> Result<String> {
            Ok(self.response.clone())
        }
    }

    struct RecordingChannel {
        calls: AtomicU32,
        fail_times: u32,
    }
    #[async_trait]
    impl AgentChannel for RecordingChannel {
        async fn send(&self, _url: &str, _text: &str, _room: &str, _task: &str) -> Result<String> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.fail_times {
                anyhow::bail!("transport glitch");
            }
            Ok("agent says: two options found".to_string())
        }
    }

    async fn seeded(store: &MemoryStore) -> WorkItem {
        store
            .seed_agent(AgentRecord {
                id: "agent-7".into(),
                name: Some("Scout".into()),
                url: Some("https://agents.test/scout".into()),
            })
            .await;
        let mut item = WorkItem::new(
            "trip.a1",
            "trip",
            "search_hotels",
            "Search Hotels",
            WorkItemStatus::InProgress,
            "t1",
        );
        item.user_id = Some("agent-7".into());
        item.agent_mode = Some(AgentMode::A2a);
        store.upsert_workitem(&item).await.unwrap();
        item
    }

    fn dispatcher(
        store: Arc<MemoryStore>,
        channel: Arc<dyn AgentChannel>,
        normalized: &str,
    ) -> AgentDispatcher {
        AgentDispatcher::new(
            store,
            Arc::new(StaticBuilder),
            Arc::new(StaticNormalizer {
                response: normalized.to_string(),
            }),
            channel,
        )
    }

    #[tokio::test]
    async fn successful_dispatch_submits_the_item() {
        let store = Arc::new(MemoryStore::new());
        let item = seeded(&store).await;
        let channel = Arc::new(RecordingChannel {
            calls: AtomicU32::new(0),
            fail_times: 0,
        });
        let normalized = r#"{"agent_result": {"html": "<table></table>", "table_data": [{"name": "Inn"}]}}"#;

        dispatcher(store.clone(), channel, normalized)
            .handle(&item)
            .await
            .unwrap();

        let after = store.fetch_workitem(item.id).await.unwrap().unwrap();
        assert_eq!(after.status, WorkItemStatus::Submitted);
        assert!(after.consumer.is_none());
        assert_eq!(after.output["html"], "<table></table>");
        assert!(!store.chat_messages("trip.a1").await.is_empty());
    }

    #[tokio::test]
    async fn transport_retries_then_succeeds() {
        let store = Arc::new(MemoryStore::new());
        let item = seeded(&store).await;
        let channel = Arc::new(RecordingChannel {
            calls: AtomicU32::new(0),
            fail_times: 2,
        });

        dispatcher(store.clone(), channel.clone(), r#"{"agent_result": {}}"#)
            .handle(&item)
            .await
            .unwrap();

        assert_eq!(channel.calls.load(Ordering::SeqCst), 3);
        let after = store.fetch_workitem(item.id).await.unwrap().unwrap();
        assert_eq!(after.status, WorkItemStatus::Submitted);
    }

    #[tokio::test]
    async fn three_transport_failures_finalize_the_item() {
        let store = Arc::new(MemoryStore::new());
        let item = seeded(&store).await;
        let channel = Arc::new(RecordingChannel {
            calls: AtomicU32::new(0),
            fail_times: 10,
        });

        dispatcher(store.clone(), channel, "{}").handle(&item).await.unwrap();

        let after = store.fetch_workitem(item.id).await.unwrap().unwrap();
        assert_eq!(after.status, WorkItemStatus::Done);
        assert!(after.log.unwrap().contains("agent processing failed"));
        assert!(after.consumer.is_none());
    }

    #[tokio::test]
    async fn unknown_assignee_finalizes_with_reason() {
        let store = Arc::new(MemoryStore::new());
        let mut item = WorkItem::new(
            "trip.a2",
            "trip",
            "search",
            "Search",
            WorkItemStatus::InProgress,
            "t1",
        );
        item.user_id = Some("nobody".into());
        item.agent_mode = Some(AgentMode::A2a);
        store.upsert_workitem(&item).await.unwrap();

        let channel = Arc::new(RecordingChannel {
            calls: AtomicU32::new(0),
            fail_times: 0,
        });
        dispatcher(store.clone(), channel, "{}").handle(&item).await.unwrap();

        let after = store.fetch_workitem(item.id).await.unwrap().unwrap();
        assert_eq!(after.status, WorkItemStatus::Done);
        assert!(after.log.unwrap().contains("no reachable A2A agent"));
    }

    #[test]
    fn normalized_output_strips_comments_and_unwraps() {
        let text = "// model note\n{\"agent_result\": {\"html\": \"<p>x</p>\", \"table_data\": []}}";
        let output = parse_normalized_output(text);
        assert_eq!(output["html"], "<p>x</p>");

        assert_eq!(parse_normalized_output("not json"), serde_json::json!({}));
    }
}
