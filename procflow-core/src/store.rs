use crate::types::*;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

/// Persistence trait for all engine state.
///
/// The handler, resolver, dispatcher, and planner operate exclusively through
/// this trait, enabling pluggable backends (MemoryStore for tests, Postgres
/// for production). Every query is tenant-scoped.
#[async_trait]
pub trait ProcessStore: Send + Sync {
    // ── Definitions ──

    async fn fetch_process_definition(
        &self,
        def_id: &str,
        tenant_id: &str,
    ) -> Result<Option<Value>>;

    /// Latest archive pointer (`arcv_id`) for a definition, if any.
    async fn fetch_latest_definition_version(
        &self,
        def_id: &str,
        tenant_id: &str,
    ) -> Result<Option<String>>;

    async fn fetch_form_definition(
        &self,
        proc_def_id: &str,
        activity_id: &str,
        tenant_id: &str,
    ) -> Result<Option<FormDefinition>>;

    // ── Instances ──

    async fn fetch_process_instance(
        &self,
        proc_inst_id: &str,
        tenant_id: &str,
    ) -> Result<Option<ProcessInstance>>;

    async fn upsert_process_instance(&self, instance: &ProcessInstance) -> Result<()>;

    // ── Work items ──

    async fn fetch_workitem(&self, id: Uuid) -> Result<Option<WorkItem>>;

    /// The *current* row for `(instance, activity)`: rework loops may leave
    /// several, ordered by highest `(updated_at, rework_count)`.
    async fn fetch_workitem_by_instance_and_activity(
        &self,
        proc_inst_id: &str,
        activity_id: &str,
        tenant_id: &str,
    ) -> Result<Option<WorkItem>>;

    async fn fetch_todolist(&self, proc_inst_id: &str, tenant_id: &str) -> Result<Vec<WorkItem>>;

    async fn upsert_workitem(&self, item: &WorkItem) -> Result<()>;

    async fn patch_workitem(&self, id: Uuid, patch: &WorkItemPatch, tenant_id: &str) -> Result<()>;

    async fn delete_workitem(&self, id: Uuid, tenant_id: &str) -> Result<()>;

    // ── Claim protocol ──

    /// Atomically claim up to `limit` unowned `SUBMITTED` rows for `consumer`.
    /// Concurrent claimers racing for the same row see exactly one winner.
    async fn claim_submitted(&self, limit: i64, consumer: &str) -> Result<Vec<WorkItem>>;

    /// Same protocol over unowned `IN_PROGRESS` rows with `agent_mode = 'A2A'`.
    async fn claim_agent_in_progress(&self, limit: i64, consumer: &str) -> Result<Vec<WorkItem>>;

    /// Null the consumer of `IN_PROGRESS` rows whose `start_date` is older
    /// than `max_age`. Returns the number of leases released.
    async fn release_stale_claims(&self, max_age: chrono::Duration) -> Result<u64>;

    // ── Directory ──

    async fn fetch_user(&self, email: &str) -> Result<Option<UserRecord>>;

    async fn fetch_agent(&self, agent_id: &str) -> Result<Option<AgentRecord>>;

    // ── Event log ──

    async fn append_event(&self, event: &EventEntry) -> Result<()>;

    /// All events of an instance, oldest first.
    async fn fetch_events(&self, proc_inst_id: &str, tenant_id: &str) -> Result<Vec<EventEntry>>;

    // ── Compensation artifacts ──

    async fn fetch_compensation(
        &self,
        proc_def_id: &str,
        activity_id: &str,
        tenant_id: &str,
    ) -> Result<Option<CompensationArtifact>>;

    async fn upsert_compensation(&self, artifact: &CompensationArtifact) -> Result<()>;

    // ── Chat + tenant configuration ──

    async fn upsert_chat_message(
        &self,
        room_id: &str,
        message: Value,
        tenant_id: &str,
    ) -> Result<()>;

    async fn fetch_tenant_mcp_config(&self, tenant_id: &str) -> Result<Option<Value>>;
}

/// Resolve an assignee id against the directory: users first, then agents
/// (an agent with a non-empty URL speaks A2A). Unknown ids degrade to an
/// `unknown` profile instead of failing the handler.
pub async fn resolve_assignee(store: &dyn ProcessStore, assignee_id: &str) -> AssigneeProfile {
    if assignee_id == EXTERNAL_CUSTOMER {
        return AssigneeProfile {
            kind: AssigneeKind::ExternalCustomer,
            id: assignee_id.to_string(),
            name: "External Customer".to_string(),
            email: assignee_id.to_string(),
            url: None,
        };
    }

    match store.fetch_user(assignee_id).await {
        Ok(Some(user)) => {
            return AssigneeProfile {
                kind: AssigneeKind::User,
                id: user.id,
                name: user.username.unwrap_or_else(|| assignee_id.to_string()),
                email: user.email,
                url: None,
            }
        }
        Ok(None) => {}
        Err(error) => {
            tracing::warn!(%assignee_id, %error, "user lookup failed, trying agents");
        }
    }

    match store.fetch_agent(assignee_id).await {
        Ok(Some(agent)) => {
            let is_a2a = agent
                .url
                .as_deref()
                .map(|u| !u.trim().is_empty())
                .unwrap_or(false);
            AssigneeProfile {
                kind: if is_a2a {
                    AssigneeKind::A2a
                } else {
                    AssigneeKind::Agent
                },
                id: agent.id,
                name: agent.name.unwrap_or_else(|| assignee_id.to_string()),
                email: assignee_id.to_string(),
                url: agent.url,
            }
        }
        _ => AssigneeProfile {
            kind: AssigneeKind::Unknown,
            id: assignee_id.to_string(),
            name: assignee_id.to_string(),
            email: assignee_id.to_string(),
            url: None,
        },
    }
}
