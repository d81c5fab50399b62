//! Next-step resolver: applies a validated decision payload to an instance.
//!
//! Everything here is deterministic. The payload names completed and next
//! activities; the resolver gates them through join semantics, advances the
//! activity frontier, runs script tasks, materializes work items, and
//! persists the instance together with a system chat message.

use crate::definition::{load_process_definition, ProcessActivity, ProcessDefinition};
use crate::graph::BlockFinder;
use crate::join::{join_may_proceed, resolve_branch_status, JoinKind};
use crate::mailer::{external_form_url, task_invitation_html, Mailer};
use crate::script::{variables_as_env, ScriptRunner};
use crate::store::{resolve_assignee, ProcessStore};
use crate::types::*;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

pub struct DecisionOutcome {
    pub instance: ProcessInstance,
    pub cannot_proceed: Vec<ProceedError>,
    pub created_workitem_ids: Vec<Uuid>,
}

pub struct NextStepResolver {
    store: Arc<dyn ProcessStore>,
    mailer: Option<Arc<dyn Mailer>>,
    script_runner: Option<Arc<dyn ScriptRunner>>,
}

impl NextStepResolver {
    pub fn new(
        store: Arc<dyn ProcessStore>,
        mailer: Option<Arc<dyn Mailer>>,
        script_runner: Option<Arc<dyn ScriptRunner>>,
    ) -> Self {
        Self {
            store,
            mailer,
            script_runner,
        }
    }

    /// Apply one decision payload. Mutates the payload in place (gateway
    /// expansion rewrites `nextActivities`; script tasks append completions).
    pub async fn apply(
        &self,
        payload: &mut DecisionPayload,
        tenant_id: &str,
    ) -> Result<DecisionOutcome> {
        let def_json = self
            .store
            .fetch_process_definition(&payload.process_definition_id, tenant_id)
            .await?
            .with_context(|| {
                format!(
                    "process definition not found: {}",
                    payload.process_definition_id
                )
            })?;
        let def = load_process_definition(def_json)?;
        let finder = BlockFinder::new(&def);

        let mut instance = self.create_or_load_instance(payload, tenant_id).await?;
        payload.instance_id = instance.proc_inst_id.clone();

        self.gate_through_joins(payload, &instance, &def, &finder)
            .await?;

        // A fully blocked decision leaves the instance untouched; the chat
        // message is the only trace.
        if payload.next_activities.is_empty() && !payload.cannot_proceed_errors.is_empty() {
            self.write_chat_message(payload, &instance, tenant_id).await?;
            return Ok(DecisionOutcome {
                cannot_proceed: payload.cannot_proceed_errors.clone(),
                instance,
                created_workitem_ids: vec![],
            });
        }

        merge_field_mappings(&mut instance, &payload.field_mappings);

        self.advance_frontier(payload, &mut instance, &def, tenant_id)
            .await?;

        self.run_script_tasks(payload, &mut instance, &def).await?;

        let created = self.persist(payload, &mut instance, tenant_id, &def).await?;

        self.submit_service_tasks(payload, &instance, &def, tenant_id)
            .await?;

        Ok(DecisionOutcome {
            cannot_proceed: payload.cannot_proceed_errors.clone(),
            instance,
            created_workitem_ids: created,
        })
    }

    async fn create_or_load_instance(
        &self,
        payload: &DecisionPayload,
        tenant_id: &str,
    ) -> Result<ProcessInstance> {
        if payload.instance_id != "new" && payload.instance_id.contains('.') {
            if let Some(mut existing) = self
                .store
                .fetch_process_instance(&payload.instance_id, tenant_id)
                .await?
            {
                if existing.status == InstanceStatus::New {
                    existing.proc_inst_name = payload.instance_name.clone();
                    existing.status = InstanceStatus::Running;
                }
                return Ok(existing);
            }
        }

        let proc_inst_id = if payload.instance_id == "new" || !payload.instance_id.contains('.') {
            ProcessInstance::mint_id(&payload.process_definition_id)
        } else {
            payload.instance_id.clone()
        };
        Ok(ProcessInstance {
            proc_inst_id,
            proc_inst_name: payload.instance_name.clone(),
            proc_def_id: payload.process_definition_id.to_lowercase(),
            proc_def_version: self
                .store
                .fetch_latest_definition_version(&payload.process_definition_id, tenant_id)
                .await?,
            status: InstanceStatus::Running,
            current_activity_ids: vec![],
            current_user_ids: vec![],
            participants: vec![],
            role_bindings: payload.role_bindings.clone(),
            variables_data: vec![],
            tenant_id: tenant_id.to_string(),
        })
    }

    /// Join gate: drop next activities whose join may not proceed yet, and
    /// reject conflicting exclusive branches.
    ///
    /// The gate walks the whole gateway chain in front of each completed
    /// activity and evaluates every join on it against the block finder's
    /// branch structure, so a nested join (say an exclusive merge feeding a
    /// parallel one) counts as one branch that settles under its own policy
    /// instead of flattening into sibling activities that may never run.
    async fn gate_through_joins(
        &self,
        payload: &mut DecisionPayload,
        instance: &ProcessInstance,
        def: &ProcessDefinition,
        finder: &BlockFinder,
    ) -> Result<()> {
        // Branch statuses as currently stored, overlaid with the payload's
        // own completions.
        let mut overlay: HashMap<String, WorkItemStatus> = HashMap::new();
        for completed in &payload.completed_activities {
            overlay.insert(completed.completed_activity_id.clone(), completed.result);
        }

        let feedback: HashSet<(String, String)> =
            finder.graph.feedback_flows().into_iter().collect();
        let is_feedback = |source: &str, target: &str| {
            feedback.contains(&(source.to_string(), target.to_string()))
        };

        let mut blocked: HashSet<String> = HashSet::new();

        for completed in &payload.completed_activities {
            let source_id = completed.completed_activity_id.as_str();

            let mut chain: Vec<String> = def
                .find_sequences(Some(source_id), None)
                .iter()
                .filter(|s| !is_feedback(&s.source, &s.target))
                .filter(|s| def.find_gateway_by_id(&s.target).is_some())
                .map(|s| s.target.clone())
                .collect();
            let mut walked: HashSet<String> = HashSet::new();

            while let Some(gateway_id) = chain.pop() {
                if !walked.insert(gateway_id.clone()) {
                    continue;
                }
                for seq in def.find_sequences(Some(&gateway_id), None) {
                    if is_feedback(&seq.source, &seq.target) {
                        continue;
                    }
                    if def.find_gateway_by_id(&seq.target).is_some() {
                        chain.push(seq.target.clone());
                    }
                }

                let Some(gateway) = def.find_gateway_by_id(&gateway_id) else {
                    continue;
                };
                if finder.graph.non_feedback_in_degree(&gateway_id) < 2 {
                    continue;
                }
                let Some(kind) = JoinKind::from_gateway_type(gateway.type_str()) else {
                    continue;
                };

                let branches = finder.join_branches(&gateway_id);
                let mut leaves: Vec<String> = Vec::new();
                for branch in &branches {
                    branch.collect_leaves(&mut leaves);
                }
                let mut leaf_statuses: HashMap<String, String> = HashMap::new();
                for leaf in leaves {
                    if let Some(status) = overlay.get(&leaf) {
                        leaf_statuses.insert(leaf, status.as_str().to_string());
                        continue;
                    }
                    let stored = self
                        .store
                        .fetch_workitem_by_instance_and_activity(
                            &instance.proc_inst_id,
                            &leaf,
                            &instance.tenant_id,
                        )
                        .await?;
                    let status = stored
                        .map(|w| w.status.as_str().to_string())
                        .unwrap_or_else(|| "TODO".to_string());
                    leaf_statuses.insert(leaf, status);
                }
                let statuses: Vec<String> = branches
                    .iter()
                    .map(|branch| resolve_branch_status(branch, &leaf_statuses))
                    .collect();
                let status_refs: Vec<&str> = statuses.iter().map(String::as_str).collect();

                if join_may_proceed(kind, &status_refs) {
                    continue;
                }

                let downstream: HashSet<String> = def
                    .find_next_activities(&gateway_id, true)
                    .iter()
                    .map(|n| n.id().to_string())
                    .collect();
                let mut any_dropped = false;
                for next in &payload.next_activities {
                    if next.next_activity_id == gateway_id
                        || downstream.contains(&next.next_activity_id)
                    {
                        blocked.insert(next.next_activity_id.clone());
                        any_dropped = true;
                    }
                }
                if any_dropped {
                    let branch_count = finder
                        .find_block(&gateway_id)
                        .map(|b| b.branch_count)
                        .unwrap_or(statuses.len());
                    payload.cannot_proceed_errors.push(ProceedError::new(
                        ProceedErrorKind::ProceedConditionNotMet,
                        format!(
                            "join '{gateway_id}' is still waiting on its {branch_count} branches ({})",
                            statuses.join(", ")
                        ),
                    ));
                }
            }

            // A single decision must not take two branches of the same
            // exclusive gateway.
            for seq in def.find_sequences(Some(&completed.completed_activity_id), None) {
                let Some(gateway) = def.find_gateway_by_id(&seq.target) else {
                    continue;
                };
                if JoinKind::from_gateway_type(gateway.type_str()) != Some(JoinKind::Exclusive) {
                    continue;
                }
                let gateway_id = gateway.id.as_deref().unwrap_or("");
                let branch_targets: HashSet<&str> = def
                    .find_sequences(Some(gateway_id), None)
                    .iter()
                    .map(|s| s.target.as_str())
                    .collect();
                if branch_targets.len() < 2 {
                    continue;
                }
                let taken: Vec<String> = payload
                    .next_activities
                    .iter()
                    .map(|n| n.next_activity_id.clone())
                    .filter(|id| branch_targets.contains(id.as_str()))
                    .collect();
                if taken.len() > 1 {
                    for id in &taken {
                        blocked.insert(id.clone());
                    }
                    payload.cannot_proceed_errors.push(ProceedError::new(
                        ProceedErrorKind::ProceedConditionNotMet,
                        format!(
                            "exclusive gateway '{gateway_id}' cannot take {} branches at once",
                            taken.len()
                        ),
                    ));
                }
            }
        }

        payload
            .next_activities
            .retain(|n| !blocked.contains(&n.next_activity_id));
        Ok(())
    }

    async fn advance_frontier(
        &self,
        payload: &mut DecisionPayload,
        instance: &mut ProcessInstance,
        def: &ProcessDefinition,
        tenant_id: &str,
    ) -> Result<()> {
        let completed_ids: HashSet<&str> = payload
            .completed_activities
            .iter()
            .map(|c| c.completed_activity_id.as_str())
            .collect();
        instance
            .current_activity_ids
            .retain(|id| !completed_ids.contains(id.as_str()));

        for entry in payload.next_activities.clone() {
            let id = entry.next_activity_id.as_str();

            if is_end_marker(id) {
                instance.current_activity_ids.clear();
                break;
            }

            if def.find_gateway_by_id(id).is_some() {
                let expansion = def.find_next_activities(id, false);
                if expansion.is_empty() {
                    instance.current_activity_ids.clear();
                    payload.next_activities.clear();
                    break;
                }
                instance.current_activity_ids =
                    expansion.iter().map(|n| n.id().to_string()).collect();
                payload.next_activities = expansion
                    .iter()
                    .map(|n| NextActivity {
                        next_activity_id: n.id().to_string(),
                        next_activity_name: Some(n.name().to_string()),
                        next_user_email: entry.next_user_email.clone(),
                        result: WorkItemStatus::InProgress,
                        description: None,
                    })
                    .collect();
            } else if entry.result == WorkItemStatus::InProgress
                && !instance.current_activity_ids.iter().any(|x| x == id)
            {
                instance.current_activity_ids = vec![id.to_string()];
            } else if !instance.current_activity_ids.iter().any(|x| x == id) {
                instance.current_activity_ids.push(id.to_string());
            }

            if let Some(activity) = def.find_activity_by_id(id) {
                self.notify_external_customer(activity, payload, instance, def, tenant_id)
                    .await?;
            }
        }
        Ok(())
    }

    /// When the next activity's role is bound to an external customer, mail
    /// them a link to the external form. A missing address is a data-field
    /// error, not a crash.
    async fn notify_external_customer(
        &self,
        activity: &ProcessActivity,
        payload: &mut DecisionPayload,
        instance: &ProcessInstance,
        def: &ProcessDefinition,
        tenant_id: &str,
    ) -> Result<()> {
        let bound_external = def
            .roles
            .iter()
            .find(|r| r.name == activity.role)
            .and_then(|r| r.endpoint.as_ref())
            .and_then(|e| e.as_str())
            .map(|e| e == EXTERNAL_CUSTOMER)
            .unwrap_or(false)
            || payload
                .role_bindings
                .iter()
                .find(|r| r.name == activity.role)
                .and_then(|r| r.endpoint.as_ref())
                .map(|e| e.joined() == EXTERNAL_CUSTOMER)
                .unwrap_or(false);
        if !bound_external {
            return Ok(());
        }

        let todolist = self
            .store
            .fetch_todolist(&instance.proc_inst_id, tenant_id)
            .await?;
        let customer_email = todolist
            .iter()
            .filter(|w| w.status == WorkItemStatus::Done)
            .filter_map(|w| w.output.as_object())
            .flat_map(|forms| forms.values())
            .filter_map(|form| form.as_object())
            .find_map(|form| form.get("customer_email").and_then(|v| v.as_str()))
            .map(str::to_string);

        let Some(customer_email) = customer_email else {
            payload.cannot_proceed_errors.push(ProceedError::new(
                ProceedErrorKind::DataFieldNotExist,
                format!(
                    "no customer_email found in completed outputs for '{}'",
                    activity.id
                ),
            ));
            return Ok(());
        };

        let Some(mailer) = &self.mailer else {
            tracing::warn!(activity = %activity.id, "external customer step without a mailer");
            return Ok(());
        };
        let form_id = activity.form_id().unwrap_or(&activity.id);
        let url = external_form_url(
            tenant_id,
            form_id,
            &def.process_definition_id,
            &activity.id,
            &instance.proc_inst_id,
        );
        let subject = format!("Please complete '{}'", activity.name);
        let body = task_invitation_html(activity, &url);
        mailer
            .send(&customer_email, &subject, &body)
            .await
            .with_context(|| format!("failed to mail external customer {customer_email}"))?;
        Ok(())
    }

    /// Script tasks run synchronously through the external executor. A
    /// non-zero exit advances the frontier past the task with stderr as the
    /// result; success completes the task immediately.
    async fn run_script_tasks(
        &self,
        payload: &mut DecisionPayload,
        instance: &mut ProcessInstance,
        def: &ProcessDefinition,
    ) -> Result<()> {
        for entry in payload.next_activities.clone() {
            let Some(activity) = def.find_activity_by_id(&entry.next_activity_id) else {
                continue;
            };
            if !activity.is_script_task() {
                continue;
            }
            let runner = self
                .script_runner
                .as_ref()
                .with_context(|| format!("script task '{}' but no runner configured", activity.id))?;
            let code = activity.script_code.clone().unwrap_or_default();
            let env = variables_as_env(&instance.variables_data);
            let outcome = runner.run(&code, &env).await?;

            if !outcome.success {
                instance.current_activity_ids = def
                    .find_next_activities(&activity.id, false)
                    .iter()
                    .map(|n| n.id().to_string())
                    .collect();
                payload.result = Some(outcome.stderr);
            } else {
                payload.result = Some(outcome.stdout);
                instance
                    .current_activity_ids
                    .retain(|id| id != &activity.id);
                payload
                    .next_activities
                    .retain(|n| n.next_activity_id != activity.id);
                payload.completed_activities.push(CompletedActivity {
                    completed_activity_id: activity.id.clone(),
                    completed_activity_name: Some(activity.name.clone()),
                    completed_user_email: entry.next_user_email.clone(),
                    result: WorkItemStatus::Done,
                    description: None,
                });
            }
        }
        Ok(())
    }

    async fn persist(
        &self,
        payload: &mut DecisionPayload,
        instance: &mut ProcessInstance,
        tenant_id: &str,
        def: &ProcessDefinition,
    ) -> Result<Vec<Uuid>> {
        self.materialize_todo_workitems(payload, instance, def, tenant_id)
            .await?;
        self.upsert_completed_workitems(payload, instance, def, tenant_id)
            .await?;
        let created = self
            .upsert_next_workitems(payload, instance, def, tenant_id)
            .await?;

        // Instance status follows the end activity's work item.
        let completed = match def.find_end_activity() {
            Some(end) => self
                .store
                .fetch_workitem_by_instance_and_activity(
                    &instance.proc_inst_id,
                    &end.id,
                    tenant_id,
                )
                .await?
                .map(|w| w.status == WorkItemStatus::Done)
                .unwrap_or(false),
            None => false,
        };
        if completed
            || (instance.current_activity_ids.is_empty() && !payload.next_activities.is_empty())
        {
            instance.status = InstanceStatus::Completed;
        } else if instance.status != InstanceStatus::Completed {
            instance.status = InstanceStatus::Running;
        }
        if instance.status == InstanceStatus::Completed {
            instance.current_activity_ids.clear();
        }

        instance.current_user_ids = self.collect_current_user_ids(instance, tenant_id).await?;

        self.store.upsert_process_instance(instance).await?;
        self.write_chat_message(payload, instance, tenant_id).await?;
        Ok(created)
    }

    /// Every non-initial activity gets a `TODO` row up front, keyed by
    /// `(instance, activity)`; existing rows are left alone.
    async fn materialize_todo_workitems(
        &self,
        payload: &DecisionPayload,
        instance: &ProcessInstance,
        def: &ProcessDefinition,
        tenant_id: &str,
    ) -> Result<()> {
        let initial = def.find_initial_activity()?;
        for activity in def.activities.iter().filter(|a| a.id != initial.id) {
            let existing = self
                .store
                .fetch_workitem_by_instance_and_activity(
                    &instance.proc_inst_id,
                    &activity.id,
                    tenant_id,
                )
                .await?;
            if existing.is_some() {
                continue;
            }

            let (start_date, due_date) = planned_dates(def, activity);
            let (user_id, assignees) = bound_assignees(&payload.role_bindings, &activity.role);
            let mut agent_mode = activity
                .agent_mode
                .as_deref()
                .and_then(AgentMode::parse);
            if let Some(uid) = &user_id {
                let profile = resolve_assignee(self.store.as_ref(), uid).await;
                if profile.kind == AssigneeKind::A2a {
                    agent_mode = Some(AgentMode::A2a);
                }
            }

            let mut item = WorkItem::new(
                &instance.proc_inst_id,
                &payload.process_definition_id,
                &activity.id,
                &activity.name,
                WorkItemStatus::Todo,
                tenant_id,
            );
            item.user_id = user_id;
            item.assignees = assignees;
            item.reference_ids = def
                .find_immediate_prev_activities(&activity.id)
                .iter()
                .map(|a| a.id.clone())
                .collect();
            item.duration = activity.duration.map(|d| d as i32);
            item.tool = activity.tool.clone();
            item.start_date = Some(start_date);
            item.due_date = due_date;
            item.agent_mode = agent_mode;
            self.store.upsert_workitem(&item).await?;
        }
        Ok(())
    }

    async fn upsert_completed_workitems(
        &self,
        payload: &DecisionPayload,
        instance: &ProcessInstance,
        def: &ProcessDefinition,
        tenant_id: &str,
    ) -> Result<()> {
        for completed in &payload.completed_activities {
            let existing = self
                .store
                .fetch_workitem_by_instance_and_activity(
                    &instance.proc_inst_id,
                    &completed.completed_activity_id,
                    tenant_id,
                )
                .await?;

            if let Some(mut item) = existing {
                item.status = completed.result;
                item.end_date = Some(Utc::now());
                if let Some(email) = &completed.completed_user_email {
                    item.user_id = Some(email.clone());
                }
                self.store.upsert_workitem(&item).await?;
                continue;
            }

            let Some(activity) = def.find_activity_by_id(&completed.completed_activity_id) else {
                continue;
            };
            let (start_date, due_date) = planned_dates(def, activity);
            let (_, assignees) = bound_assignees(&instance.role_bindings, &activity.role);
            let mut item = WorkItem::new(
                &instance.proc_inst_id,
                &payload.process_definition_id,
                &activity.id,
                &activity.name,
                completed.result,
                tenant_id,
            );
            item.user_id = completed.completed_user_email.clone();
            item.assignees = assignees;
            item.duration = activity.duration.map(|d| d as i32);
            item.tool = activity.tool.clone();
            item.start_date = Some(start_date);
            item.due_date = due_date;
            item.end_date = (completed.result == WorkItemStatus::Done).then(Utc::now);
            self.store.upsert_workitem(&item).await?;
        }
        Ok(())
    }

    async fn upsert_next_workitems(
        &self,
        payload: &DecisionPayload,
        instance: &ProcessInstance,
        def: &ProcessDefinition,
        tenant_id: &str,
    ) -> Result<Vec<Uuid>> {
        let mut touched = Vec::new();
        for next in &payload.next_activities {
            if is_end_marker(&next.next_activity_id) {
                continue;
            }
            let existing = self
                .store
                .fetch_workitem_by_instance_and_activity(
                    &instance.proc_inst_id,
                    &next.next_activity_id,
                    tenant_id,
                )
                .await?;

            let mut item = match existing {
                Some(existing) if existing.status.is_terminal() && !next.result.is_terminal() => {
                    // Re-entry through a loop: terminal rows never move
                    // backwards, a fresh row carries the rework.
                    let mut rework = existing.clone();
                    rework.id = Uuid::new_v4();
                    rework.rework_count = existing.rework_count + 1;
                    rework.status = next.result;
                    rework.consumer = None;
                    rework.retry = 0;
                    rework.output = Value::Null;
                    rework.start_date = Some(Utc::now());
                    rework.end_date = None;
                    rework
                }
                Some(mut existing) => {
                    existing.status = next.result;
                    existing.end_date = (next.result == WorkItemStatus::Done).then(Utc::now);
                    existing
                }
                None => {
                    let Some(activity) = def.find_activity_by_id(&next.next_activity_id) else {
                        continue;
                    };
                    let (start_date, due_date) = planned_dates(def, activity);
                    let mut item = WorkItem::new(
                        &instance.proc_inst_id,
                        &payload.process_definition_id,
                        &activity.id,
                        &activity.name,
                        next.result,
                        tenant_id,
                    );
                    item.duration = activity.duration.map(|d| d as i32);
                    item.tool = activity.tool.clone();
                    item.start_date = Some(start_date);
                    item.due_date = due_date;
                    item
                }
            };

            if let Some(email) = &next.next_user_email {
                item.user_id = Some(email.clone());
                if item.agent_mode != Some(AgentMode::A2a) {
                    let profile = resolve_assignee(self.store.as_ref(), email).await;
                    if profile.kind == AssigneeKind::A2a {
                        item.agent_mode = Some(AgentMode::A2a);
                    }
                }
            }
            touched.push(item.id);
            self.store.upsert_workitem(&item).await?;
        }
        Ok(touched)
    }

    async fn collect_current_user_ids(
        &self,
        instance: &ProcessInstance,
        tenant_id: &str,
    ) -> Result<Vec<String>> {
        let mut user_ids: Vec<String> = Vec::new();
        for activity_id in &instance.current_activity_ids {
            let Some(item) = self
                .store
                .fetch_workitem_by_instance_and_activity(
                    &instance.proc_inst_id,
                    activity_id,
                    tenant_id,
                )
                .await?
            else {
                continue;
            };
            let Some(user_id) = item.user_id.filter(|u| !u.trim().is_empty()) else {
                continue;
            };
            for part in user_id.split(',') {
                let part = part.trim();
                if part.is_empty() || part == "undefined" || user_ids.iter().any(|u| u == part) {
                    continue;
                }
                if part == EXTERNAL_CUSTOMER {
                    user_ids.push(part.to_string());
                    continue;
                }
                let profile = resolve_assignee(self.store.as_ref(), part).await;
                if profile.kind != AssigneeKind::Unknown {
                    user_ids.push(part.to_string());
                }
            }
        }
        Ok(user_ids)
    }

    async fn submit_service_tasks(
        &self,
        payload: &DecisionPayload,
        instance: &ProcessInstance,
        def: &ProcessDefinition,
        tenant_id: &str,
    ) -> Result<()> {
        for next in &payload.next_activities {
            let Some(activity) = def.find_activity_by_id(&next.next_activity_id) else {
                continue;
            };
            if !activity.is_service_task() {
                continue;
            }
            if let Some(item) = self
                .store
                .fetch_workitem_by_instance_and_activity(
                    &instance.proc_inst_id,
                    &activity.id,
                    tenant_id,
                )
                .await?
            {
                self.store
                    .patch_workitem(
                        item.id,
                        &WorkItemPatch::status(WorkItemStatus::Submitted),
                        tenant_id,
                    )
                    .await?;
            }
        }
        Ok(())
    }

    async fn write_chat_message(
        &self,
        payload: &DecisionPayload,
        instance: &ProcessInstance,
        tenant_id: &str,
    ) -> Result<()> {
        let message = if payload.cannot_proceed_errors.is_empty() {
            serde_json::json!({
                "role": "system",
                "contentType": "json",
                "jsonContent": {
                    "referenceInfo": payload.reference_info,
                    "completedActivities": payload.completed_activities,
                    "nextActivities": payload.next_activities,
                },
            })
        } else {
            let reasons: Vec<String> = payload
                .cannot_proceed_errors
                .iter()
                .map(ProceedError::reason_text)
                .collect();
            serde_json::json!({
                "role": "system",
                "content": reasons.join("\n"),
            })
        };
        self.store
            .upsert_chat_message(&instance.proc_inst_id, message, tenant_id)
            .await
    }
}

// ─── Pure helpers ─────────────────────────────────────────────

/// Merge decision field mappings into the instance's variable store.
/// Form-shaped variables (object values) merge key-by-key.
pub fn merge_field_mappings(instance: &mut ProcessInstance, mappings: &[FieldMapping]) {
    for mapping in mappings {
        if let Some(form_entry) = instance.variables_data.iter_mut().find(|entry| {
            entry
                .value
                .as_object()
                .map(|o| o.contains_key(&mapping.key))
                .unwrap_or(false)
        }) {
            if let Some(form) = form_entry.value.as_object_mut() {
                form.insert(mapping.key.clone(), mapping.value.clone());
            }
            continue;
        }
        if let Some(existing) = instance
            .variables_data
            .iter_mut()
            .find(|entry| entry.key == mapping.key)
        {
            existing.name = mapping.name.clone().or(existing.name.take());
            existing.value = mapping.value.clone();
            continue;
        }
        instance.variables_data.push(VariableEntry {
            key: mapping.key.clone(),
            name: mapping.name.clone(),
            value: mapping.value.clone(),
        });
    }
}

/// Candidate next-activity payloads computed from the definition alone.
/// `condition_eval` maps sequence ids to an evaluated boolean; an absent or
/// empty condition counts as true.
pub fn resolve_next_activity_payloads(
    def: &ProcessDefinition,
    activity_id: &str,
    assignees: &[RoleBinding],
    condition_eval: &HashMap<String, bool>,
) -> Vec<NextActivity> {
    let mut payloads = Vec::new();
    let mut queue: Vec<&crate::definition::ProcessSequence> =
        def.find_sequences(Some(activity_id), None);
    let mut visited: HashSet<String> = HashSet::new();

    while let Some(seq) = queue.pop() {
        let seq_id = seq
            .id
            .clone()
            .unwrap_or_else(|| format!("{}->{}", seq.source, seq.target));
        if !visited.insert(seq_id.clone()) {
            continue;
        }
        if seq.has_condition() {
            if let Some(false) = condition_eval.get(&seq_id) {
                continue;
            }
        }

        if let Some(activity) = def.find_activity_by_id(&seq.target) {
            let user = bound_assignees(assignees, &activity.role).0;
            payloads.push(NextActivity {
                next_activity_id: activity.id.clone(),
                next_activity_name: Some(activity.name.clone()),
                next_user_email: user,
                result: WorkItemStatus::InProgress,
                description: None,
            });
            continue;
        }
        if let Some(event) = def.find_event_by_id(&seq.target) {
            payloads.push(NextActivity {
                next_activity_id: event.id.clone().unwrap_or_default(),
                next_activity_name: event.name.clone(),
                next_user_email: None,
                result: WorkItemStatus::InProgress,
                description: None,
            });
            continue;
        }
        if def.find_gateway_by_id(&seq.target).is_some() {
            queue.extend(def.find_sequences(Some(&seq.target), None));
        }
    }
    payloads
}

/// `(user_id, assignees)` for a role, from the decision's role bindings.
fn bound_assignees(
    role_bindings: &[RoleBinding],
    role_name: &str,
) -> (Option<String>, Vec<RoleBinding>) {
    let mut user_id = None;
    let mut assignees = Vec::new();
    for binding in role_bindings {
        if binding.name != role_name {
            continue;
        }
        if let Some(endpoint) = &binding.endpoint {
            user_id = Some(endpoint.joined());
        }
        assignees.push(binding.clone());
    }
    (user_id.filter(|u| !u.is_empty()), assignees)
}

/// Planned start/due dates: the start shifts by the longest-duration
/// predecessor per `srcTrg` group, the due date adds the activity's own
/// duration in days.
fn planned_dates(
    def: &ProcessDefinition,
    activity: &ProcessActivity,
) -> (DateTime<Utc>, Option<DateTime<Utc>>) {
    let mut start = Utc::now();
    let prev = def.find_prev_activities(&activity.id);
    if !prev.is_empty() {
        let mut by_src: HashMap<&str, i64> = HashMap::new();
        for p in &prev {
            let key = p.src_trg.as_deref().unwrap_or("");
            let duration = p.duration.unwrap_or(0);
            let slot = by_src.entry(key).or_insert(0);
            if duration > *slot {
                *slot = duration;
            }
        }
        for duration in by_src.values() {
            start += Duration::days(*duration);
        }
    }
    let due = activity.duration.map(|d| start + Duration::days(d));
    (start, due)
}
