//! LLM-driven work-item handler.
//!
//! For a claimed `SUBMITTED` item: gather the decision context (definition,
//! previous form outputs, gateway condition data), stream the reasoning
//! layer's response into the work item's log, parse the decision, and apply
//! it through the resolver.

use crate::advisor::{DecisionContext, NextStepAdvisor};
use crate::definition::{load_process_definition, ProcessDefinition};
use crate::extract::extract_json;
use crate::logwriter::spawn_log_writer;
use crate::resolver::NextStepResolver;
use crate::store::ProcessStore;
use crate::types::*;
use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

/// Handler failures release the claim and retry; the third failure is final.
pub const RETRY_LIMIT: i32 = 3;
const PARSE_ATTEMPTS: u32 = 3;
const PARSE_BACKOFF: Duration = Duration::from_millis(500);

pub struct WorkItemHandler {
    store: Arc<dyn ProcessStore>,
    advisor: Arc<dyn NextStepAdvisor>,
    resolver: Arc<NextStepResolver>,
}

impl WorkItemHandler {
    pub fn new(
        store: Arc<dyn ProcessStore>,
        advisor: Arc<dyn NextStepAdvisor>,
        resolver: Arc<NextStepResolver>,
    ) -> Self {
        Self {
            store,
            advisor,
            resolver,
        }
    }

    pub async fn handle(&self, workitem: &WorkItem) -> Result<()> {
        let tenant_id = workitem.tenant_id.clone();
        let (is_first, is_last) = self.workitem_position(workitem).await;

        if workitem.retry >= RETRY_LIMIT {
            self.nudge_instance_status(workitem, is_first, is_last).await;
            return Ok(());
        }

        let proc_def_id = workitem
            .proc_def_id
            .clone()
            .context("work item has no process definition id")?;
        let proc_inst_id = workitem
            .proc_inst_id
            .clone()
            .context("work item has no instance id")?;

        let definition_json = self
            .store
            .fetch_process_definition(&proc_def_id, &tenant_id)
            .await?
            .with_context(|| format!("process definition not found: {proc_def_id}"))?;
        let def = load_process_definition(definition_json.clone())?;

        let output = self
            .unwrap_output(workitem, &proc_def_id, &tenant_id)
            .await?;

        let next_activity_ids: Vec<String> = def
            .find_next_activities(&workitem.activity_id, true)
            .iter()
            .map(|n| n.id().to_string())
            .collect();

        let mut gateway_condition_data = Value::Null;
        for candidate in &next_activity_ids {
            if def.find_gateway_by_id(candidate).is_some() {
                match self
                    .gateway_condition_data(workitem, &def, candidate)
                    .await
                {
                    Ok(Some(data)) => gateway_condition_data = data,
                    Ok(None) => {}
                    Err(error) => {
                        tracing::warn!(workitem = %workitem.id, %error,
                            "failed to gather gateway condition data");
                    }
                }
            }
        }

        let previous_outputs = self
            .input_data(workitem, &def)
            .await
            .unwrap_or_else(|error| {
                tracing::warn!(workitem = %workitem.id, %error,
                    "failed to gather previous outputs");
                Value::Object(Map::new())
            });

        let context = DecisionContext {
            instance_id: proc_inst_id.clone(),
            process_definition_id: proc_def_id.clone(),
            activity_id: workitem.activity_id.clone(),
            definition: definition_json,
            user_email: workitem.user_id.clone().unwrap_or_default(),
            role_bindings: workitem.assignees.clone(),
            output,
            next_activity_ids,
            previous_outputs,
            gateway_condition_data,
            user_feedback: workitem.temp_feedback.clone(),
            instance_name_pattern: def.instance_name_pattern.clone(),
            today: Utc::now().format("%Y-%m-%d").to_string(),
        };

        let (sink, writer) = spawn_log_writer(self.store.clone(), workitem.id, tenant_id.clone());
        let advised = self.advisor.advise(&context, &sink).await;
        drop(sink);
        let _ = writer.await;
        let raw = advised?;

        let decision = self
            .parse_with_retries(&raw, workitem, &proc_inst_id, &tenant_id)
            .await?;
        let mut payload: DecisionPayload =
            serde_json::from_value(decision).context("decision payload failed validation")?;
        if payload.instance_id.is_empty() {
            payload.instance_id = proc_inst_id.clone();
        }

        let outcome = self.resolver.apply(&mut payload, &tenant_id).await?;

        // Proceed errors return the item to a human; success finalizes it.
        let final_status = if outcome.cannot_proceed.is_empty() {
            WorkItemStatus::Done
        } else {
            WorkItemStatus::InProgress
        };
        self.store
            .patch_workitem(
                workitem.id,
                &WorkItemPatch::status(final_status),
                &tenant_id,
            )
            .await?;
        Ok(())
    }

    /// Parse retries are bounded; the final failure marks the item `ERROR`
    /// and surfaces a chat message with the tail of the raw response.
    async fn parse_with_retries(
        &self,
        raw: &str,
        workitem: &WorkItem,
        proc_inst_id: &str,
        tenant_id: &str,
    ) -> Result<Value> {
        let mut last_error = None;
        for attempt in 1..=PARSE_ATTEMPTS {
            match extract_json(raw) {
                Ok(value) => return Ok(value),
                Err(error) => {
                    tracing::warn!(workitem = %workitem.id, attempt, %error,
                        "decision parse attempt failed");
                    last_error = Some(error);
                    if attempt < PARSE_ATTEMPTS {
                        tokio::time::sleep(PARSE_BACKOFF).await;
                    }
                }
            }
        }
        let error = last_error.expect("at least one parse attempt");

        let tail: String = raw.chars().rev().take(200).collect::<Vec<_>>().into_iter().rev().collect();
        let mut patch = WorkItemPatch::status(WorkItemStatus::Error);
        patch.log = Some(format!(
            "decision parsing failed after {PARSE_ATTEMPTS} attempts: {error}"
        ));
        self.store
            .patch_workitem(workitem.id, &patch, tenant_id)
            .await?;
        self.store
            .upsert_chat_message(
                proc_inst_id,
                serde_json::json!({
                    "role": "system",
                    "content": format!("decision parsing failed: {error}\n…{tail}"),
                }),
                tenant_id,
            )
            .await?;
        Err(error)
    }

    /// `(is_first, is_last)`: first when wired straight from the start
    /// event, last when feeding the end event. Probe failures degrade to
    /// `(false, false)`.
    pub async fn workitem_position(&self, workitem: &WorkItem) -> (bool, bool) {
        let (Some(proc_inst_id), Some(proc_def_id)) =
            (&workitem.proc_inst_id, &workitem.proc_def_id)
        else {
            return (false, false);
        };
        if proc_inst_id == "new" {
            return (false, false);
        }
        let def = match self
            .store
            .fetch_process_definition(proc_def_id, &workitem.tenant_id)
            .await
        {
            Ok(Some(json)) => match load_process_definition(json) {
                Ok(def) => def,
                Err(_) => return (false, false),
            },
            _ => return (false, false),
        };
        let is_first = def.is_starting_activity(&workitem.activity_id);
        let is_last = def
            .find_end_activity()
            .map(|end| end.id == workitem.activity_id)
            .unwrap_or(false);
        (is_first, is_last)
    }

    /// After the retry cap, a first work item leaves the instance `RUNNING`
    /// and a last one closes it out.
    pub async fn nudge_instance_status(&self, workitem: &WorkItem, is_first: bool, is_last: bool) {
        let Some(proc_inst_id) = &workitem.proc_inst_id else {
            return;
        };
        if proc_inst_id == "new" || (!is_first && !is_last) {
            return;
        }
        let result: Result<()> = async {
            let Some(mut instance) = self
                .store
                .fetch_process_instance(proc_inst_id, &workitem.tenant_id)
                .await?
            else {
                return Ok(());
            };
            if is_first {
                instance.status = InstanceStatus::Running;
            } else {
                instance.status = InstanceStatus::Completed;
                instance.current_activity_ids.clear();
            }
            self.store.upsert_process_instance(&instance).await
        }
        .await;
        if let Err(error) = result {
            tracing::error!(workitem = %workitem.id, %error,
                "failed to update instance status after retry cap");
        }
    }

    /// The submitted output, unwrapped to this activity's form when one is
    /// registered.
    async fn unwrap_output(
        &self,
        workitem: &WorkItem,
        proc_def_id: &str,
        tenant_id: &str,
    ) -> Result<Value> {
        let mut output = match &workitem.output {
            Value::String(s) => serde_json::from_str(s).unwrap_or(Value::String(s.clone())),
            other => other.clone(),
        };
        if let Some(form) = self
            .store
            .fetch_form_definition(proc_def_id, &workitem.activity_id, tenant_id)
            .await?
        {
            if let Some(inner) = output.get(&form.id) {
                output = inner.clone();
            }
        }
        Ok(output)
    }

    /// Latest value of one dotted `form.field` reference, read from the
    /// `DONE` work item of the form's activity.
    async fn field_value(
        &self,
        field_ref: &str,
        def: &ProcessDefinition,
        proc_inst_id: &str,
        tenant_id: &str,
    ) -> Result<Option<Value>> {
        let Some((form_id, field_id)) = field_ref.split_once('.') else {
            return Ok(None);
        };
        let def_prefix = format!("{}_", def.process_definition_id.to_lowercase());
        let activity_id = form_id.replace("_form", "").replace(&def_prefix, "");

        let Some(workitem) = self
            .store
            .fetch_workitem_by_instance_and_activity(proc_inst_id, &activity_id, tenant_id)
            .await?
        else {
            return Ok(None);
        };
        let value = workitem
            .output
            .get(form_id)
            .and_then(|form| form.get(field_id))
            .cloned();
        Ok(value.map(|v| {
            serde_json::json!({ form_id: { field_id: v } })
        }))
    }

    /// The `inputData` references of the current activity, grouped back to
    /// `{formId: {field: value}}`.
    async fn input_data(&self, workitem: &WorkItem, def: &ProcessDefinition) -> Result<Value> {
        let Some(activity) = def.find_activity_by_id(&workitem.activity_id) else {
            return Ok(Value::Object(Map::new()));
        };
        self.collect_field_refs(&activity.input_data, workitem, def)
            .await
    }

    /// Condition data references of a candidate gateway, grouped the same way.
    async fn gateway_condition_data(
        &self,
        workitem: &WorkItem,
        def: &ProcessDefinition,
        gateway_id: &str,
    ) -> Result<Option<Value>> {
        let Some(gateway) = def.find_gateway_by_id(gateway_id) else {
            return Ok(None);
        };
        if gateway.condition_data.is_empty() {
            return Ok(None);
        }
        Ok(Some(
            self.collect_field_refs(&gateway.condition_data, workitem, def)
                .await?,
        ))
    }

    async fn collect_field_refs(
        &self,
        refs: &[String],
        workitem: &WorkItem,
        def: &ProcessDefinition,
    ) -> Result<Value> {
        let Some(proc_inst_id) = &workitem.proc_inst_id else {
            return Ok(Value::Object(Map::new()));
        };
        let mut values: Vec<(String, Value)> = Vec::new();
        for field_ref in refs {
            if let Some(value) = self
                .field_value(field_ref, def, proc_inst_id, &workitem.tenant_id)
                .await?
            {
                values.push((field_ref.clone(), value));
            }
        }
        Ok(group_fields_by_form(&values))
    }
}

/// Group `form.field → {form: {field: value}}` lookups into one
/// `{form: {field: value, …}}` map; empty forms are dropped.
pub fn group_fields_by_form(field_values: &[(String, Value)]) -> Value {
    let mut groups: Map<String, Value> = Map::new();
    for (field_ref, value) in field_values {
        let form_id = field_ref.split('.').next().unwrap_or(field_ref);
        let field_id = field_ref.split('.').nth(1).unwrap_or(field_ref);
        let Some(actual) = value.get(form_id).and_then(|form| form.get(field_id)) else {
            continue;
        };
        if let Some(form) = groups
            .entry(form_id.to_string())
            .or_insert_with(|| Value::Object(Map::new()))
            .as_object_mut()
        {
            form.insert(field_id.to_string(), actual.clone());
        }
    }
    groups.retain(|_, form| form.as_object().map(|f| !f.is_empty()).unwrap_or(false));
    Value::Object(groups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisor::NextStepAdvisor;
    use crate::logwriter::LogSink;
    use crate::store_memory::MemoryStore;
    use async_trait::async_trait;
    use serde_json::json;

    struct ScriptedAdvisor {
        response: String,
    }

    #[async_trait]
    impl NextStepAdvisor for ScriptedAdvisor {
        async fn advise(&self, _context: &DecisionContext, sink: &LogSink) -> Result<String> {
            sink.append(self.response.clone());
            Ok(self.response.clone())
        }
    }

    fn simple_definition() -> Value {
        json!({
            "processDefinitionName": "Simple",
            "processDefinitionId": "simple",
            "roles": [{"name": "worker", "endpoint": "w@x.test"}],
            "activities": [
                {"id": "draft", "name": "Draft", "type": "userTask", "role": "worker",
                 "tool": "formHandler:simple_draft_form"},
                {"id": "review", "name": "Review", "type": "userTask", "role": "worker",
                 "inputData": ["simple_draft_form.summary"]}
            ],
            "sequences": [
                {"source": "start_event", "target": "draft"},
                {"source": "draft", "target": "review"},
                {"source": "review", "target": "end_event"}
            ],
            "events": [
                {"id": "start_event", "type": "startEvent"},
                {"id": "end_event", "type": "endEvent"}
            ]
        })
    }

    async fn seeded_store() -> (Arc<MemoryStore>, WorkItem) {
        let store = Arc::new(MemoryStore::new());
        store.seed_definition("simple", "t1", simple_definition()).await;
        store
            .upsert_process_instance(&ProcessInstance {
                proc_inst_id: "simple.h1".into(),
                proc_inst_name: Some("case".into()),
                proc_def_id: "simple".into(),
                proc_def_version: None,
                status: InstanceStatus::Running,
                current_activity_ids: vec!["draft".into()],
                current_user_ids: vec![],
                participants: vec![],
                role_bindings: vec![],
                variables_data: vec![],
                tenant_id: "t1".into(),
            })
            .await
            .unwrap();

        let mut item = WorkItem::new(
            "simple.h1",
            "simple",
            "draft",
            "Draft",
            WorkItemStatus::Submitted,
            "t1",
        );
        item.user_id = Some("w@x.test".into());
        item.output = json!({"simple_draft_form": {"summary": "all good"}});
        item.start_date = Some(Utc::now());
        store.upsert_workitem(&item).await.unwrap();
        (store, item)
    }

    fn handler(store: Arc<MemoryStore>, response: &str) -> WorkItemHandler {
        let resolver = Arc::new(NextStepResolver::new(store.clone(), None, None));
        WorkItemHandler::new(
            store,
            Arc::new(ScriptedAdvisor {
                response: response.to_string(),
            }),
            resolver,
        )
    }

    #[tokio::test]
    async fn happy_path_finalizes_the_item() {
        let (store, item) = seeded_store().await;
        let response = r#"```json
{
  "instanceId": "simple.h1",
  "instanceName": "case",
  "processDefinitionId": "simple",
  "roleBindings": [{"name": "worker", "endpoint": "w@x.test"}],
  "completedActivities": [{
    "completedActivityId": "draft",
    "completedUserEmail": "w@x.test",
    "result": "DONE"
  }],
  "nextActivities": [{
    "nextActivityId": "review",
    "nextUserEmail": "w@x.test",
    "result": "IN_PROGRESS"
  }]
}
```"#;
        handler(store.clone(), response).handle(&item).await.unwrap();

        let after = store.fetch_workitem(item.id).await.unwrap().unwrap();
        assert_eq!(after.status, WorkItemStatus::Done);
        let review = store
            .fetch_workitem_by_instance_and_activity("simple.h1", "review", "t1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(review.status, WorkItemStatus::InProgress);
        let instance = store
            .fetch_process_instance("simple.h1", "t1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(instance.current_activity_ids, vec!["review"]);
    }

    #[tokio::test]
    async fn unparseable_response_marks_the_item_error() {
        let (store, item) = seeded_store().await;
        let result = handler(store.clone(), "I could not decide, sorry.")
            .handle(&item)
            .await;
        assert!(result.is_err());

        let after = store.fetch_workitem(item.id).await.unwrap().unwrap();
        assert_eq!(after.status, WorkItemStatus::Error);
        assert!(after.log.unwrap().contains("decision parsing failed"));
        assert!(!store.chat_messages("simple.h1").await.is_empty());
    }

    #[tokio::test]
    async fn retry_cap_skips_the_decision_entirely() {
        let (store, mut item) = seeded_store().await;
        item.retry = RETRY_LIMIT;
        store.upsert_workitem(&item).await.unwrap();

        // The advisor would panic the test if invoked.
        struct PanicAdvisor;
        #[async_trait]
        impl NextStepAdvisor for PanicAdvisor {
            async fn advise(&self, _: &DecisionContext, _: &LogSink) -> Result<String> {
                panic!("advisor must not run past the retry cap");
            }
        }
        let resolver = Arc::new(NextStepResolver::new(store.clone(), None, None));
        let handler = WorkItemHandler::new(store.clone(), Arc::new(PanicAdvisor), resolver);
        handler.handle(&item).await.unwrap();

        // Draft is the first activity, so the instance stays RUNNING.
        let instance = store
            .fetch_process_instance("simple.h1", "t1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(instance.status, InstanceStatus::Running);
    }

    #[tokio::test]
    async fn retry_cap_on_last_activity_completes_the_instance() {
        let (store, _) = seeded_store().await;
        let mut last = WorkItem::new(
            "simple.h1",
            "simple",
            "review",
            "Review",
            WorkItemStatus::Submitted,
            "t1",
        );
        last.retry = RETRY_LIMIT;
        store.upsert_workitem(&last).await.unwrap();

        let h = handler(store.clone(), "unused");
        h.handle(&last).await.unwrap();

        let instance = store
            .fetch_process_instance("simple.h1", "t1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(instance.status, InstanceStatus::Completed);
        assert!(instance.current_activity_ids.is_empty());
    }

    #[test]
    fn fields_group_back_by_form() {
        let values = vec![
            (
                "order_form.qty".to_string(),
                json!({"order_form": {"qty": 3}}),
            ),
            (
                "order_form.item".to_string(),
                json!({"order_form": {"item": "laptop"}}),
            ),
            (
                "other_form.note".to_string(),
                json!({"other_form": {"note": "hi"}}),
            ),
        ];
        let grouped = group_fields_by_form(&values);
        assert_eq!(
            grouped,
            json!({
                "order_form": {"qty": 3, "item": "laptop"},
                "other_form": {"note": "hi"},
            })
        );
    }

    #[tokio::test]
    async fn input_data_reads_previous_done_outputs() {
        let (store, _) = seeded_store().await;
        // Mark draft DONE so its output is readable as a previous output.
        let draft = store
            .fetch_workitem_by_instance_and_activity("simple.h1", "draft", "t1")
            .await
            .unwrap()
            .unwrap();
        let mut patch = WorkItemPatch::status(WorkItemStatus::Done);
        patch.output = Some(json!({"simple_draft_form": {"summary": "all good"}}));
        store.patch_workitem(draft.id, &patch, "t1").await.unwrap();

        let review = WorkItem::new(
            "simple.h1",
            "simple",
            "review",
            "Review",
            WorkItemStatus::Submitted,
            "t1",
        );
        let h = handler(store.clone(), "unused");
        let def = load_process_definition(simple_definition()).unwrap();
        let data = h.input_data(&review, &def).await.unwrap();
        assert_eq!(
            data,
            json!({"simple_draft_form": {"summary": "all good"}})
        );
    }
}
