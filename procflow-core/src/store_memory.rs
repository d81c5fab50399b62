use crate::store::ProcessStore;
use crate::types::*;
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    /// `(def_id, tenant_id)` → definition JSON.
    definitions: HashMap<(String, String), Value>,
    /// `(def_id, tenant_id)` → latest archive id.
    definition_versions: HashMap<(String, String), String>,
    /// `(proc_def_id, activity_id, tenant_id)` → form definition.
    forms: HashMap<(String, String, String), FormDefinition>,
    /// `(proc_inst_id, tenant_id)` → instance.
    instances: HashMap<(String, String), ProcessInstance>,
    workitems: HashMap<Uuid, WorkItem>,
    users: HashMap<String, UserRecord>,
    agents: HashMap<String, AgentRecord>,
    events: Vec<EventEntry>,
    /// `(proc_def_id, activity_id, tenant_id)` → artifact.
    compensations: HashMap<(String, String, String), CompensationArtifact>,
    /// `(room_id, message, tenant_id)` append log.
    chats: Vec<(String, Value, String)>,
    mcp_configs: HashMap<String, Value>,
}

/// In-memory implementation of `ProcessStore` for tests.
///
/// Claims take the single write lock, so the skip-locked semantics of the
/// Postgres backend degenerate to plain mutual exclusion: racing claimers
/// still see exactly one winner per row.
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    // ── Seeding helpers for tests ──

    pub async fn seed_definition(&self, def_id: &str, tenant_id: &str, definition: Value) {
        let mut w = self.inner.write().await;
        w.definitions
            .insert((def_id.to_lowercase(), tenant_id.to_string()), definition);
    }

    pub async fn seed_definition_version(&self, def_id: &str, tenant_id: &str, arcv_id: &str) {
        let mut w = self.inner.write().await;
        w.definition_versions.insert(
            (def_id.to_lowercase(), tenant_id.to_string()),
            arcv_id.to_string(),
        );
    }

    pub async fn seed_form(&self, form: FormDefinition, tenant_id: &str) {
        let mut w = self.inner.write().await;
        w.forms.insert(
            (
                form.proc_def_id.clone().unwrap_or_default(),
                form.activity_id.clone().unwrap_or_default(),
                tenant_id.to_string(),
            ),
            form,
        );
    }

    pub async fn seed_user(&self, user: UserRecord) {
        let mut w = self.inner.write().await;
        w.users.insert(user.email.clone(), user);
    }

    pub async fn seed_agent(&self, agent: AgentRecord) {
        let mut w = self.inner.write().await;
        w.agents.insert(agent.id.clone(), agent);
    }

    pub async fn seed_mcp_config(&self, tenant_id: &str, config: Value) {
        let mut w = self.inner.write().await;
        w.mcp_configs.insert(tenant_id.to_string(), config);
    }

    pub async fn chat_messages(&self, room_id: &str) -> Vec<Value> {
        let r = self.inner.read().await;
        r.chats
            .iter()
            .filter(|(room, _, _)| room == room_id)
            .map(|(_, msg, _)| msg.clone())
            .collect()
    }

    pub async fn all_workitems(&self) -> Vec<WorkItem> {
        let r = self.inner.read().await;
        r.workitems.values().cloned().collect()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Ordering key for the "current row" rule on `(instance, activity)`.
fn current_row_key(item: &WorkItem) -> (chrono::DateTime<Utc>, i32) {
    (
        item.updated_at.unwrap_or(chrono::DateTime::<Utc>::MIN_UTC),
        item.rework_count,
    )
}

fn apply_patch(item: &mut WorkItem, patch: &WorkItemPatch) {
    if let Some(status) = patch.status {
        item.status = status;
    }
    if let Some(consumer) = &patch.consumer {
        item.consumer = consumer.clone();
    }
    if let Some(log) = &patch.log {
        item.log = Some(log.clone());
    }
    if let Some(output) = &patch.output {
        item.output = output.clone();
    }
    if let Some(retry) = patch.retry {
        item.retry = retry;
    }
    if let Some(user_id) = &patch.user_id {
        item.user_id = Some(user_id.clone());
    }
    if let Some(username) = &patch.username {
        item.username = Some(username.clone());
    }
    if let Some(agent_mode) = patch.agent_mode {
        item.agent_mode = Some(agent_mode);
    }
    if let Some(agent_orch) = &patch.agent_orch {
        item.agent_orch = Some(agent_orch.clone());
    }
    if let Some(end_date) = &patch.end_date {
        item.end_date = *end_date;
    }
    item.updated_at = Some(Utc::now());
}

#[async_trait]
impl ProcessStore for MemoryStore {
    // ── Definitions ──

    async fn fetch_process_definition(
        &self,
        def_id: &str,
        tenant_id: &str,
    ) -> Result<Option<Value>> {
        let r = self.inner.read().await;
        Ok(r.definitions
            .get(&(def_id.to_lowercase(), tenant_id.to_string()))
            .cloned())
    }

    async fn fetch_latest_definition_version(
        &self,
        def_id: &str,
        tenant_id: &str,
    ) -> Result<Option<String>> {
        let r = self.inner.read().await;
        Ok(r.definition_versions
            .get(&(def_id.to_lowercase(), tenant_id.to_string()))
            .cloned())
    }

    async fn fetch_form_definition(
        &self,
        proc_def_id: &str,
        activity_id: &str,
        tenant_id: &str,
    ) -> Result<Option<FormDefinition>> {
        let r = self.inner.read().await;
        Ok(r.forms
            .get(&(
                proc_def_id.to_string(),
                activity_id.to_string(),
                tenant_id.to_string(),
            ))
            .cloned())
    }

    // ── Instances ──

    async fn fetch_process_instance(
        &self,
        proc_inst_id: &str,
        tenant_id: &str,
    ) -> Result<Option<ProcessInstance>> {
        let r = self.inner.read().await;
        Ok(r.instances
            .get(&(proc_inst_id.to_string(), tenant_id.to_string()))
            .cloned())
    }

    async fn upsert_process_instance(&self, instance: &ProcessInstance) -> Result<()> {
        let mut w = self.inner.write().await;
        w.instances.insert(
            (instance.proc_inst_id.clone(), instance.tenant_id.clone()),
            instance.clone(),
        );
        Ok(())
    }

    // ── Work items ──

    async fn fetch_workitem(&self, id: Uuid) -> Result<Option<WorkItem>> {
        let r = self.inner.read().await;
        Ok(r.workitems.get(&id).cloned())
    }

    async fn fetch_workitem_by_instance_and_activity(
        &self,
        proc_inst_id: &str,
        activity_id: &str,
        tenant_id: &str,
    ) -> Result<Option<WorkItem>> {
        let r = self.inner.read().await;
        Ok(r.workitems
            .values()
            .filter(|w| {
                w.proc_inst_id.as_deref() == Some(proc_inst_id)
                    && w.activity_id == activity_id
                    && w.tenant_id == tenant_id
            })
            .max_by_key(|w| current_row_key(w))
            .cloned())
    }

    async fn fetch_todolist(&self, proc_inst_id: &str, tenant_id: &str) -> Result<Vec<WorkItem>> {
        let r = self.inner.read().await;
        let mut items: Vec<WorkItem> = r
            .workitems
            .values()
            .filter(|w| {
                w.proc_inst_id.as_deref() == Some(proc_inst_id) && w.tenant_id == tenant_id
            })
            .cloned()
            .collect();
        items.sort_by_key(|w| w.start_date);
        Ok(items)
    }

    async fn upsert_workitem(&self, item: &WorkItem) -> Result<()> {
        let mut w = self.inner.write().await;
        let mut item = item.clone();
        item.updated_at = Some(Utc::now());
        w.workitems.insert(item.id, item);
        Ok(())
    }

    async fn patch_workitem(&self, id: Uuid, patch: &WorkItemPatch, _tenant_id: &str) -> Result<()> {
        let mut w = self.inner.write().await;
        if let Some(item) = w.workitems.get_mut(&id) {
            apply_patch(item, patch);
        }
        Ok(())
    }

    async fn delete_workitem(&self, id: Uuid, _tenant_id: &str) -> Result<()> {
        let mut w = self.inner.write().await;
        w.workitems.remove(&id);
        Ok(())
    }

    // ── Claim protocol ──

    async fn claim_submitted(&self, limit: i64, consumer: &str) -> Result<Vec<WorkItem>> {
        let mut w = self.inner.write().await;
        let mut ids: Vec<Uuid> = w
            .workitems
            .values()
            .filter(|item| item.status == WorkItemStatus::Submitted && item.consumer.is_none())
            .map(|item| item.id)
            .collect();
        ids.sort();
        ids.truncate(limit.max(0) as usize);

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(item) = w.workitems.get_mut(&id) {
                item.consumer = Some(consumer.to_string());
                claimed.push(item.clone());
            }
        }
        Ok(claimed)
    }

    async fn claim_agent_in_progress(&self, limit: i64, consumer: &str) -> Result<Vec<WorkItem>> {
        let mut w = self.inner.write().await;
        let mut ids: Vec<Uuid> = w
            .workitems
            .values()
            .filter(|item| {
                item.status == WorkItemStatus::InProgress
                    && item.consumer.is_none()
                    && item.agent_mode == Some(AgentMode::A2a)
            })
            .map(|item| item.id)
            .collect();
        ids.sort();
        ids.truncate(limit.max(0) as usize);

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(item) = w.workitems.get_mut(&id) {
                item.consumer = Some(consumer.to_string());
                claimed.push(item.clone());
            }
        }
        Ok(claimed)
    }

    async fn release_stale_claims(&self, max_age: chrono::Duration) -> Result<u64> {
        let cutoff = Utc::now() - max_age;
        let mut released = 0u64;
        let mut w = self.inner.write().await;
        for item in w.workitems.values_mut() {
            if item.status == WorkItemStatus::InProgress
                && item.consumer.is_some()
                && item.start_date.map(|d| d < cutoff).unwrap_or(false)
            {
                item.consumer = None;
                released += 1;
            }
        }
        Ok(released)
    }

    // ── Directory ──

    async fn fetch_user(&self, email: &str) -> Result<Option<UserRecord>> {
        let r = self.inner.read().await;
        Ok(r.users.get(email).cloned())
    }

    async fn fetch_agent(&self, agent_id: &str) -> Result<Option<AgentRecord>> {
        let r = self.inner.read().await;
        Ok(r.agents.get(agent_id).cloned())
    }

    // ── Event log ──

    async fn append_event(&self, event: &EventEntry) -> Result<()> {
        let mut w = self.inner.write().await;
        w.events.push(event.clone());
        Ok(())
    }

    async fn fetch_events(&self, proc_inst_id: &str, _tenant_id: &str) -> Result<Vec<EventEntry>> {
        let r = self.inner.read().await;
        let mut events: Vec<EventEntry> = r
            .events
            .iter()
            .filter(|e| e.proc_inst_id.as_deref() == Some(proc_inst_id))
            .cloned()
            .collect();
        events.sort_by_key(|e| e.timestamp);
        Ok(events)
    }

    // ── Compensation artifacts ──

    async fn fetch_compensation(
        &self,
        proc_def_id: &str,
        activity_id: &str,
        tenant_id: &str,
    ) -> Result<Option<CompensationArtifact>> {
        let r = self.inner.read().await;
        Ok(r.compensations
            .get(&(
                proc_def_id.to_string(),
                activity_id.to_string(),
                tenant_id.to_string(),
            ))
            .cloned())
    }

    async fn upsert_compensation(&self, artifact: &CompensationArtifact) -> Result<()> {
        let mut w = self.inner.write().await;
        w.compensations.insert(
            (
                artifact.proc_def_id.clone(),
                artifact.activity_id.clone(),
                artifact.tenant_id.clone(),
            ),
            artifact.clone(),
        );
        Ok(())
    }

    // ── Chat + tenant configuration ──

    async fn upsert_chat_message(
        &self,
        room_id: &str,
        message: Value,
        tenant_id: &str,
    ) -> Result<()> {
        let mut message = message;
        if let Some(obj) = message.as_object_mut() {
            obj.entry("role").or_insert(Value::String("system".into()));
            obj.entry("timeStamp")
                .or_insert(Value::from(Utc::now().timestamp_millis()));
        }
        let mut w = self.inner.write().await;
        w.chats
            .push((room_id.to_string(), message, tenant_id.to_string()));
        Ok(())
    }

    async fn fetch_tenant_mcp_config(&self, tenant_id: &str) -> Result<Option<Value>> {
        let r = self.inner.read().await;
        Ok(r.mcp_configs.get(tenant_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn submitted_item(tenant: &str) -> WorkItem {
        WorkItem::new(
            "order.inst-1",
            "order",
            "confirm",
            "Confirm",
            WorkItemStatus::Submitted,
            tenant,
        )
    }

    #[tokio::test]
    async fn claim_is_exclusive_per_row() {
        let store = Arc::new(MemoryStore::new());
        store.upsert_workitem(&submitted_item("t1")).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..100 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.claim_submitted(5, &format!("pod-{i}")).await.unwrap()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if !handle.await.unwrap().is_empty() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn claim_respects_selector_and_limit() {
        let store = MemoryStore::new();
        for _ in 0..8 {
            store.upsert_workitem(&submitted_item("t1")).await.unwrap();
        }
        let mut agent_item = submitted_item("t1");
        agent_item.status = WorkItemStatus::InProgress;
        agent_item.agent_mode = Some(AgentMode::A2a);
        store.upsert_workitem(&agent_item).await.unwrap();

        let claimed = store.claim_submitted(5, "pod-a").await.unwrap();
        assert_eq!(claimed.len(), 5);
        assert!(claimed.iter().all(|w| w.consumer.as_deref() == Some("pod-a")));

        let agent_claimed = store.claim_agent_in_progress(5, "pod-a").await.unwrap();
        assert_eq!(agent_claimed.len(), 1);
        assert_eq!(agent_claimed[0].id, agent_item.id);

        // Remaining unclaimed SUBMITTED rows.
        let rest = store.claim_submitted(5, "pod-b").await.unwrap();
        assert_eq!(rest.len(), 3);
    }

    #[tokio::test]
    async fn stale_claims_are_released() {
        let store = MemoryStore::new();
        let mut stale = submitted_item("t1");
        stale.status = WorkItemStatus::InProgress;
        stale.consumer = Some("pod-dead".to_string());
        stale.start_date = Some(Utc::now() - chrono::Duration::minutes(45));
        store.upsert_workitem(&stale).await.unwrap();

        let mut fresh = submitted_item("t1");
        fresh.status = WorkItemStatus::InProgress;
        fresh.consumer = Some("pod-alive".to_string());
        fresh.start_date = Some(Utc::now());
        store.upsert_workitem(&fresh).await.unwrap();

        let released = store
            .release_stale_claims(chrono::Duration::minutes(30))
            .await
            .unwrap();
        assert_eq!(released, 1);

        let stale_after = store.fetch_workitem(stale.id).await.unwrap().unwrap();
        assert!(stale_after.consumer.is_none());
        let fresh_after = store.fetch_workitem(fresh.id).await.unwrap().unwrap();
        assert_eq!(fresh_after.consumer.as_deref(), Some("pod-alive"));
    }

    #[tokio::test]
    async fn current_row_prefers_highest_rework() {
        let store = MemoryStore::new();
        let mut first = submitted_item("t1");
        first.status = WorkItemStatus::Done;
        store.upsert_workitem(&first).await.unwrap();

        let mut rework = submitted_item("t1");
        rework.rework_count = 1;
        store.upsert_workitem(&rework).await.unwrap();

        let current = store
            .fetch_workitem_by_instance_and_activity("order.inst-1", "confirm", "t1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current.id, rework.id);
    }

    #[tokio::test]
    async fn patch_updates_only_named_columns() {
        let store = MemoryStore::new();
        let item = submitted_item("t1");
        store.upsert_workitem(&item).await.unwrap();

        let mut patch = WorkItemPatch::status(WorkItemStatus::Done);
        patch.consumer = Some(None);
        patch.log = Some("finished".to_string());
        store.patch_workitem(item.id, &patch, "t1").await.unwrap();

        let after = store.fetch_workitem(item.id).await.unwrap().unwrap();
        assert_eq!(after.status, WorkItemStatus::Done);
        assert!(after.consumer.is_none());
        assert_eq!(after.log.as_deref(), Some("finished"));
        assert_eq!(after.activity_id, item.activity_id);
    }
}
