//! Interfaces to the reasoning layer.
//!
//! Every place the engine consults an LLM is behind one of these traits, so
//! the core stays testable with deterministic stubs and the transport (HTTP,
//! in-process, whatever) is a worker concern.

use crate::logwriter::LogSink;
use crate::types::{RoleBinding, WorkItem};
use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Everything the handler gathered for one next-step decision.
#[derive(Clone, Debug, Serialize)]
pub struct DecisionContext {
    pub instance_id: String,
    pub process_definition_id: String,
    pub activity_id: String,
    /// The full definition document (activities, gateways, events, sequences).
    pub definition: Value,
    pub user_email: String,
    pub role_bindings: Vec<RoleBinding>,
    /// The output the submitter posted, unwrapped to the activity's form.
    pub output: Value,
    /// Candidate next node ids, events included.
    pub next_activity_ids: Vec<String>,
    /// Previous outputs grouped as `{formId: {field: value}}`.
    pub previous_outputs: Value,
    /// Condition data for candidate gateways, grouped the same way.
    pub gateway_condition_data: Value,
    pub user_feedback: Option<String>,
    pub instance_name_pattern: Option<String>,
    pub today: String,
}

/// Produces the raw next-step decision text for a claimed work item.
/// Implementations stream; each chunk goes to `sink` as it arrives so the
/// work item's `log` column follows the response. The upstream must be
/// configured deterministically: same context, same decision.
#[async_trait]
pub trait NextStepAdvisor: Send + Sync {
    async fn advise(&self, context: &DecisionContext, sink: &LogSink) -> Result<String>;
}

/// Builds the free-form request text sent to an autonomous agent.
#[async_trait]
pub trait AgentRequestBuilder: Send + Sync {
    async fn build_request(
        &self,
        workitem: &WorkItem,
        previous_outputs: &Value,
    ) -> Result<String>;
}

/// Normalizes a free-form agent response into the engine's output schema
/// (`{html, table_data}`), returned as raw text for the caller to parse.
#[async_trait]
pub trait AgentResponseNormalizer: Send + Sync {
    async fn normalize(&self, agent_response: &str) -> Result<String>;
}

/// Synthesizes a deterministic reverse-action script from filtered event
/// logs. The script may only call tools present in `tool_map`
/// (`tool_name → server_key`).
#[async_trait]
pub trait CompensationSynthesizer: Send + Sync {
    async fn synthesize(
        &self,
        tool_map: &BTreeMap<String, String>,
        event_logs: &[Value],
        user_query: &str,
    ) -> Result<String>;
}

/// Enumerates the tools an MCP server exposes; used to build the
/// tool-to-server map for the compensation planner.
#[async_trait]
pub trait McpCatalog: Send + Sync {
    async fn list_tools(&self, server_key: &str, server_config: &Value) -> Result<Vec<String>>;
}
