//! Compensation planning: synthesize an idempotent undo script from the
//! event log of an instance, up to a chosen activity.
//!
//! Artifacts are generated once per `(proc_def, activity, tenant)` and
//! cached; re-triggering compensation for the same activity in any instance
//! of the same definition reuses the stored code.

use crate::advisor::{CompensationSynthesizer, McpCatalog};
use crate::definition::load_process_definition;
use crate::graph::BlockFinder;
use crate::store::ProcessStore;
use crate::types::*;
use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

/// Tools that must never appear in a compensation script.
const EXCLUDED_TOOLS: [&str; 4] = ["mem0", "memento", "human_asked", "dmn_rule"];

pub struct CompensationPlanner {
    store: Arc<dyn ProcessStore>,
    synthesizer: Arc<dyn CompensationSynthesizer>,
    catalog: Option<Arc<dyn McpCatalog>>,
}

impl CompensationPlanner {
    pub fn new(
        store: Arc<dyn ProcessStore>,
        synthesizer: Arc<dyn CompensationSynthesizer>,
        catalog: Option<Arc<dyn McpCatalog>>,
    ) -> Self {
        Self {
            store,
            synthesizer,
            catalog,
        }
    }

    /// Ensure a compensation artifact exists for the work item's activity,
    /// then stage `rework_item_id` as the action-runner work item.
    ///
    /// Returns the artifact code, or `None` when there is nothing to undo.
    pub async fn plan(&self, workitem: &WorkItem, rework_item_id: Uuid) -> Result<Option<String>> {
        let proc_def_id = workitem
            .proc_def_id
            .clone()
            .context("compensation target has no definition id")?;
        let proc_inst_id = workitem
            .proc_inst_id
            .clone()
            .context("compensation target has no instance id")?;
        let tenant_id = workitem.tenant_id.clone();

        // Generated once per key; the cache is authoritative.
        if let Some(existing) = self
            .store
            .fetch_compensation(&proc_def_id, &workitem.activity_id, &tenant_id)
            .await?
        {
            if let Some(code) = existing.compensation {
                self.stage_rework_item(workitem, rework_item_id, &tenant_id)
                    .await?;
                return Ok(Some(code));
            }
        }

        let event_logs = self
            .action_event_logs(&proc_def_id, &proc_inst_id, &workitem.activity_id, &tenant_id)
            .await?;
        if event_logs.is_empty() {
            return Ok(None);
        }

        let tool_map = self.build_tool_index(&tenant_id).await?;
        let user_query = workitem.query.clone().unwrap_or_default();
        let code = self
            .synthesizer
            .synthesize(&tool_map, &event_logs, &user_query)
            .await
            .context("compensation synthesis failed")?;
        if code.trim().is_empty() {
            anyhow::bail!("compensation synthesis produced an empty artifact");
        }

        self.store
            .upsert_compensation(&CompensationArtifact {
                proc_def_id: proc_def_id.clone(),
                activity_id: workitem.activity_id.clone(),
                tenant_id: tenant_id.clone(),
                compensation: Some(code.clone()),
                created_at: Some(chrono::Utc::now()),
            })
            .await?;

        self.stage_rework_item(workitem, rework_item_id, &tenant_id)
            .await?;
        Ok(Some(code))
    }

    /// The side-effectful slice of the event log: `tool_usage_finished`
    /// action events up to the target activity, minus memory/human/dmn tools
    /// and read-only SQL.
    ///
    /// The activity cut is block-aware. It walks the process graph's
    /// non-feedback upstream closure of the target (so a loop cannot fold
    /// downstream work into the set) and, when the target sits inside a
    /// split/join block, widens the cut to the block's members: sibling
    /// branches of the same block execution are undone together.
    async fn action_event_logs(
        &self,
        proc_def_id: &str,
        proc_inst_id: &str,
        activity_id: &str,
        tenant_id: &str,
    ) -> Result<Vec<Value>> {
        let allowed: Option<HashSet<String>> = match self
            .store
            .fetch_process_definition(proc_def_id, tenant_id)
            .await?
        {
            Some(json) => {
                let def = load_process_definition(json)?;
                let finder = BlockFinder::new(&def);
                let mut allowed: HashSet<String> = finder
                    .graph
                    .upstream_nodes(activity_id)
                    .into_iter()
                    .collect();
                allowed.insert(activity_id.to_string());

                if let Some(join_id) = finder.graph.find_nearest_join(activity_id) {
                    if let Some(block) = finder.find_block(&join_id) {
                        if block.block_members.iter().any(|m| m == activity_id) {
                            for member in &block.block_members {
                                if def.find_activity_by_id(member).is_some()
                                    || def.find_sub_process_by_id(member).is_some()
                                {
                                    allowed.insert(member.clone());
                                }
                            }
                        }
                    }
                }
                Some(allowed)
            }
            None => None,
        };

        let events = self.store.fetch_events(proc_inst_id, tenant_id).await?;
        let mut logs = Vec::new();
        for event in events {
            if event.event_type != "tool_usage_finished" {
                continue;
            }
            if event.crew_type.as_deref() != Some("action") {
                continue;
            }
            if let (Some(allowed), Some(todo_id)) = (&allowed, event.todo_id) {
                if let Some(item) = self.store.fetch_workitem(todo_id).await? {
                    if !allowed.contains(&item.activity_id) {
                        continue;
                    }
                }
            }

            let data = match &event.data {
                Value::String(raw) => serde_json::from_str::<Value>(raw).unwrap_or(Value::Null),
                other => other.clone(),
            };
            let Some(tool_name) = data.get("tool_name").and_then(|v| v.as_str()) else {
                continue;
            };
            if EXCLUDED_TOOLS.contains(&tool_name) {
                continue;
            }
            if tool_name == "execute_sql" {
                let query = data
                    .get("args")
                    .and_then(|a| a.get("query"))
                    .and_then(|q| q.as_str())
                    .unwrap_or("");
                if query.trim().to_uppercase().starts_with("SELECT") {
                    continue;
                }
            }
            logs.push(serde_json::json!({
                "timestamp": event.timestamp,
                "log_data": data,
            }));
        }
        Ok(logs)
    }

    /// `tool_name → server_key` from the tenant MCP configuration. When no
    /// catalog is wired, fall back to mapping the mail tool onto the first
    /// gmail-looking server.
    pub async fn build_tool_index(&self, tenant_id: &str) -> Result<BTreeMap<String, String>> {
        let mut tool_map = BTreeMap::new();
        let Some(config) = self.store.fetch_tenant_mcp_config(tenant_id).await? else {
            return Ok(tool_map);
        };
        let servers = config
            .get("mcpServers")
            .and_then(|v| v.as_object())
            .cloned()
            .or_else(|| config.as_object().cloned())
            .unwrap_or_default();

        if let Some(catalog) = &self.catalog {
            for (server_key, server_config) in &servers {
                match catalog.list_tools(server_key, server_config).await {
                    Ok(tools) => {
                        for tool in tools {
                            tool_map.insert(tool, server_key.clone());
                        }
                    }
                    Err(error) => {
                        tracing::warn!(%server_key, %error, "MCP tool listing failed");
                    }
                }
            }
        }
        if tool_map.is_empty() && !servers.is_empty() {
            let fallback = servers
                .keys()
                .find(|k| k.to_lowercase().contains("gmail"))
                .or_else(|| servers.keys().next())
                .cloned();
            if let Some(server) = fallback {
                tool_map.insert("send_email_tool".to_string(), server);
            }
        }
        Ok(tool_map)
    }

    /// The rework item goes `IN_PROGRESS` under the original assignees with
    /// the action-runner orchestration tag, ready for the runner to claim.
    async fn stage_rework_item(
        &self,
        original: &WorkItem,
        rework_item_id: Uuid,
        tenant_id: &str,
    ) -> Result<()> {
        let mut patch = WorkItemPatch::status(WorkItemStatus::InProgress);
        patch.agent_orch = Some(ORCH_ACTION_RUNNER.to_string());
        patch.log = Some("Compensation Handling...".to_string());

        if let Some(binding) = original.assignees.first() {
            if let Some(endpoint) = &binding.endpoint {
                let ids: Vec<String> = match endpoint {
                    Endpoint::One(id) => vec![id.clone()],
                    Endpoint::Many(ids) => ids.clone(),
                };
                let mut user_ids = Vec::new();
                let mut usernames = Vec::new();
                for id in ids {
                    if let Ok(Some(user)) = self.store.fetch_user(&id).await {
                        user_ids.push(user.id);
                        if let Some(name) = user.username {
                            usernames.push(name);
                        }
                    } else {
                        user_ids.push(id);
                    }
                }
                patch.user_id = Some(user_ids.join(","));
                if !usernames.is_empty() {
                    patch.username = Some(usernames.join(","));
                }
            }
        } else {
            patch.user_id = original.user_id.clone();
            patch.username = original.username.clone();
        }

        self.store
            .patch_workitem(rework_item_id, &patch, tenant_id)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_memory::MemoryStore;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingSynthesizer {
        calls: AtomicU32,
    }

    #[async_trait]
    impl CompensationSynthesizer for CountingSynthesizer {
        async fn synthesize(
            &self,
            tool_map: &BTreeMap<String, String>,
            event_logs: &[Value],
            _user_query: &str,
        ) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!(
                "# reverse script over {} events via {:?}",
                event_logs.len(),
                tool_map.keys().collect::<Vec<_>>()
            ))
        }
    }

    fn action_event(inst: &str, todo_id: Option<Uuid>, tool: &str, args: Value) -> EventEntry {
        EventEntry {
            id: Uuid::new_v4(),
            run_id: Some("run-1".into()),
            job_id: Some("task-1".into()),
            todo_id,
            proc_inst_id: Some(inst.to_string()),
            event_type: "tool_usage_finished".into(),
            crew_type: Some("action".into()),
            data: json!({"tool_name": tool, "args": args}),
            timestamp: Utc::now(),
        }
    }

    fn order_definition() -> Value {
        json!({
            "processDefinitionName": "Order",
            "processDefinitionId": "order",
            "roles": [{"name": "worker", "endpoint": "w@x.test"}],
            "activities": [
                {"id": "reserve_stock", "name": "Reserve Stock", "type": "serviceTask", "role": "worker"},
                {"id": "notify", "name": "Notify", "type": "serviceTask", "role": "worker"}
            ],
            "sequences": [
                {"source": "start_event", "target": "reserve_stock"},
                {"source": "reserve_stock", "target": "notify"},
                {"source": "notify", "target": "end_event"}
            ],
            "events": [
                {"id": "start_event", "type": "startEvent"},
                {"id": "end_event", "type": "endEvent"}
            ]
        })
    }

    async fn seeded() -> (Arc<MemoryStore>, WorkItem, WorkItem) {
        let store = Arc::new(MemoryStore::new());
        store.seed_definition("order", "t1", order_definition()).await;
        store
            .seed_mcp_config(
                "t1",
                json!({"mcpServers": {"gmail-bridge": {"url": "http://mcp"}, "db": {"url": "http://db"}}}),
            )
            .await;

        let mut target = WorkItem::new(
            "order.c1",
            "order",
            "reserve_stock",
            "Reserve Stock",
            WorkItemStatus::Done,
            "t1",
        );
        target.query = Some("undo the reservation".into());
        store.upsert_workitem(&target).await.unwrap();

        let rework = WorkItem::new(
            "order.c1",
            "order",
            "reserve_stock",
            "Reserve Stock",
            WorkItemStatus::Todo,
            "t1",
        );
        store.upsert_workitem(&rework).await.unwrap();

        store
            .append_event(&action_event(
                "order.c1",
                Some(target.id),
                "execute_sql",
                json!({"query": "UPDATE product SET stock = stock - 20 WHERE name='A'"}),
            ))
            .await
            .unwrap();
        store
            .append_event(&action_event(
                "order.c1",
                Some(target.id),
                "execute_sql",
                json!({"query": "SELECT * FROM product"}),
            ))
            .await
            .unwrap();
        store
            .append_event(&action_event(
                "order.c1",
                Some(target.id),
                "send_email_tool",
                json!({"to": "x@y.z", "subject": "reserved"}),
            ))
            .await
            .unwrap();
        store
            .append_event(&action_event(
                "order.c1",
                Some(target.id),
                "mem0",
                json!({"note": "remember"}),
            ))
            .await
            .unwrap();

        (store, target, rework)
    }

    #[tokio::test]
    async fn filters_events_and_stages_the_rework_item() {
        let (store, target, rework) = seeded().await;
        let synthesizer = Arc::new(CountingSynthesizer {
            calls: AtomicU32::new(0),
        });
        let planner = CompensationPlanner::new(store.clone(), synthesizer.clone(), None);

        let code = planner.plan(&target, rework.id).await.unwrap().unwrap();
        // SELECT and memory-tool events were dropped; the UPDATE and the
        // email survive.
        assert!(code.contains("2 events"));
        assert_eq!(synthesizer.calls.load(Ordering::SeqCst), 1);

        let staged = store.fetch_workitem(rework.id).await.unwrap().unwrap();
        assert_eq!(staged.status, WorkItemStatus::InProgress);
        assert_eq!(staged.agent_orch.as_deref(), Some(ORCH_ACTION_RUNNER));
        assert!(staged.log.unwrap().starts_with("Compensation Handling"));

        let artifact = store
            .fetch_compensation("order", "reserve_stock", "t1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(artifact.compensation.as_deref(), Some(code.as_str()));
    }

    #[tokio::test]
    async fn second_request_reuses_the_cached_artifact() {
        let (store, target, rework) = seeded().await;
        let synthesizer = Arc::new(CountingSynthesizer {
            calls: AtomicU32::new(0),
        });
        let planner = CompensationPlanner::new(store.clone(), synthesizer.clone(), None);

        let first = planner.plan(&target, rework.id).await.unwrap().unwrap();
        let second = planner.plan(&target, rework.id).await.unwrap().unwrap();

        assert_eq!(first, second);
        assert_eq!(synthesizer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn no_action_events_means_nothing_to_undo() {
        let store = Arc::new(MemoryStore::new());
        store.seed_definition("order", "t1", order_definition()).await;
        let target = WorkItem::new(
            "order.c2",
            "order",
            "reserve_stock",
            "Reserve Stock",
            WorkItemStatus::Done,
            "t1",
        );
        store.upsert_workitem(&target).await.unwrap();

        let planner = CompensationPlanner::new(
            store.clone(),
            Arc::new(CountingSynthesizer {
                calls: AtomicU32::new(0),
            }),
            None,
        );
        let result = planner.plan(&target, Uuid::new_v4()).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn tool_index_falls_back_to_the_gmail_server() {
        let (store, _, _) = seeded().await;
        let planner = CompensationPlanner::new(
            store,
            Arc::new(CountingSynthesizer {
                calls: AtomicU32::new(0),
            }),
            None,
        );
        let index = planner.build_tool_index("t1").await.unwrap();
        assert_eq!(
            index.get("send_email_tool").map(String::as_str),
            Some("gmail-bridge")
        );
    }

    #[tokio::test]
    async fn sibling_actions_inside_the_same_block_are_included() {
        let store = Arc::new(MemoryStore::new());
        store
            .seed_definition(
                "fanout",
                "t1",
                json!({
                    "processDefinitionName": "Fanout",
                    "processDefinitionId": "fanout",
                    "roles": [{"name": "worker", "endpoint": "w@x.test"}],
                    "activities": [
                        {"id": "intake", "name": "Intake", "type": "userTask", "role": "worker"},
                        {"id": "reserve_stock", "name": "Reserve Stock", "type": "serviceTask", "role": "worker"},
                        {"id": "send_notice", "name": "Send Notice", "type": "serviceTask", "role": "worker"},
                        {"id": "wrap_up", "name": "Wrap Up", "type": "userTask", "role": "worker"}
                    ],
                    "sequences": [
                        {"source": "start_event", "target": "intake"},
                        {"source": "intake", "target": "gw_split"},
                        {"source": "gw_split", "target": "reserve_stock"},
                        {"source": "gw_split", "target": "send_notice"},
                        {"source": "reserve_stock", "target": "gw_join"},
                        {"source": "send_notice", "target": "gw_join"},
                        {"source": "gw_join", "target": "wrap_up"},
                        {"source": "wrap_up", "target": "end_event"}
                    ],
                    "gateways": [
                        {"id": "gw_split", "type": "parallelGateway"},
                        {"id": "gw_join", "type": "parallelGateway"}
                    ],
                    "events": [
                        {"id": "start_event", "type": "startEvent"},
                        {"id": "end_event", "type": "endEvent"}
                    ]
                }),
            )
            .await;
        store
            .seed_mcp_config("t1", json!({"mcpServers": {"gmail-main": {}}}))
            .await;

        let inst = "fanout.c3";
        let target = WorkItem::new(inst, "fanout", "reserve_stock", "Reserve Stock", WorkItemStatus::Done, "t1");
        store.upsert_workitem(&target).await.unwrap();
        let sibling = WorkItem::new(inst, "fanout", "send_notice", "Send Notice", WorkItemStatus::Done, "t1");
        store.upsert_workitem(&sibling).await.unwrap();
        let downstream = WorkItem::new(inst, "fanout", "wrap_up", "Wrap Up", WorkItemStatus::Done, "t1");
        store.upsert_workitem(&downstream).await.unwrap();

        store
            .append_event(&action_event(
                inst,
                Some(target.id),
                "execute_sql",
                json!({"query": "UPDATE product SET stock = stock - 5 WHERE name='B'"}),
            ))
            .await
            .unwrap();
        // Same block, sibling branch: part of the cut.
        store
            .append_event(&action_event(
                inst,
                Some(sibling.id),
                "send_email_tool",
                json!({"to": "x@y.z"}),
            ))
            .await
            .unwrap();
        // Past the join: excluded.
        store
            .append_event(&action_event(
                inst,
                Some(downstream.id),
                "send_email_tool",
                json!({"to": "later@y.z"}),
            ))
            .await
            .unwrap();

        let rework = WorkItem::new(inst, "fanout", "reserve_stock", "Reserve Stock", WorkItemStatus::Todo, "t1");
        store.upsert_workitem(&rework).await.unwrap();

        let synthesizer = Arc::new(CountingSynthesizer {
            calls: AtomicU32::new(0),
        });
        let planner = CompensationPlanner::new(store.clone(), synthesizer, None);
        let code = planner.plan(&target, rework.id).await.unwrap().unwrap();
        assert!(code.contains("2 events"));
    }

    #[tokio::test]
    async fn events_past_the_target_activity_are_cut() {
        let (store, target, rework) = seeded().await;
        // An action recorded on the downstream activity must not leak into
        // the target's compensation input.
        let mut downstream = WorkItem::new(
            "order.c1",
            "order",
            "notify",
            "Notify",
            WorkItemStatus::Done,
            "t1",
        );
        downstream.start_date = Some(Utc::now());
        store.upsert_workitem(&downstream).await.unwrap();
        store
            .append_event(&action_event(
                "order.c1",
                Some(downstream.id),
                "send_email_tool",
                json!({"to": "later@y.z"}),
            ))
            .await
            .unwrap();

        let synthesizer = Arc::new(CountingSynthesizer {
            calls: AtomicU32::new(0),
        });
        let planner = CompensationPlanner::new(store.clone(), synthesizer, None);
        let code = planner.plan(&target, rework.id).await.unwrap().unwrap();
        assert!(code.contains("2 events"));
    }
}
