use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ─── Status vocabulary ────────────────────────────────────────

/// Work-item lifecycle status. Canonical wire strings are SCREAMING_SNAKE.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkItemStatus {
    Todo,
    InProgress,
    Submitted,
    Done,
    Error,
    Pending,
}

impl WorkItemStatus {
    /// Terminal states never transition forward again; rework creates a new row.
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkItemStatus::Done | WorkItemStatus::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkItemStatus::Todo => "TODO",
            WorkItemStatus::InProgress => "IN_PROGRESS",
            WorkItemStatus::Submitted => "SUBMITTED",
            WorkItemStatus::Done => "DONE",
            WorkItemStatus::Error => "ERROR",
            WorkItemStatus::Pending => "PENDING",
        }
    }

    pub fn parse(s: &str) -> Option<WorkItemStatus> {
        match s {
            "TODO" => Some(WorkItemStatus::Todo),
            "IN_PROGRESS" => Some(WorkItemStatus::InProgress),
            "SUBMITTED" => Some(WorkItemStatus::Submitted),
            "DONE" => Some(WorkItemStatus::Done),
            "ERROR" => Some(WorkItemStatus::Error),
            "PENDING" => Some(WorkItemStatus::Pending),
            _ => None,
        }
    }
}

/// Process-instance status. `NEW → RUNNING → COMPLETED`, never demoted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    New,
    Running,
    Completed,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::New => "NEW",
            InstanceStatus::Running => "RUNNING",
            InstanceStatus::Completed => "COMPLETED",
        }
    }

    pub fn parse(s: &str) -> Option<InstanceStatus> {
        match s {
            "NEW" => Some(InstanceStatus::New),
            "RUNNING" => Some(InstanceStatus::Running),
            "COMPLETED" => Some(InstanceStatus::Completed),
            _ => None,
        }
    }
}

/// Agent dispatch mode on a work item.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentMode {
    #[serde(rename = "A2A")]
    A2a,
    #[serde(rename = "none")]
    None,
}

impl AgentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentMode::A2a => "A2A",
            AgentMode::None => "none",
        }
    }

    pub fn parse(s: &str) -> Option<AgentMode> {
        match s {
            "A2A" => Some(AgentMode::A2a),
            "none" => Some(AgentMode::None),
            _ => None,
        }
    }
}

/// Orchestration tag for action-runner work items (compensation rework).
pub const ORCH_ACTION_RUNNER: &str = "crewai-action";

// ─── Role bindings and assignees ──────────────────────────────

/// A role endpoint is either a single user/agent id or a list of them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Endpoint {
    One(String),
    Many(Vec<String>),
}

impl Endpoint {
    /// Comma-joined form used for the denormalized `user_id` column.
    pub fn joined(&self) -> String {
        match self {
            Endpoint::One(s) => s.clone(),
            Endpoint::Many(v) => v.join(","),
        }
    }
}

/// Mapping from a process-definition role name to concrete endpoints.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleBinding {
    pub name: String,
    #[serde(default)]
    pub endpoint: Option<Endpoint>,
    #[serde(default)]
    pub resolution_rule: Option<String>,
}

/// What kind of principal an assignee id resolves to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssigneeKind {
    User,
    Agent,
    A2a,
    ExternalCustomer,
    Unknown,
}

/// Resolution result for one assignee id; unknown ids degrade instead of failing.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AssigneeProfile {
    #[serde(rename = "type")]
    pub kind: AssigneeKind,
    pub id: String,
    pub name: String,
    pub email: String,
    /// Agent endpoint URL when the id resolved to an A2A agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// The reserved endpoint marking an externally-mailed participant.
pub const EXTERNAL_CUSTOMER: &str = "external_customer";

// ─── Work item ────────────────────────────────────────────────

/// A materialized execution record for one activity in one instance:
/// the unit the dispatcher claims (`todolist` row).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: Uuid,
    pub proc_inst_id: Option<String>,
    pub proc_def_id: Option<String>,
    pub activity_id: String,
    pub activity_name: String,
    pub status: WorkItemStatus,
    pub user_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub assignees: Vec<RoleBinding>,
    #[serde(default)]
    pub reference_ids: Vec<String>,
    #[serde(default)]
    pub duration: Option<i32>,
    #[serde(default)]
    pub tool: Option<String>,
    /// Arbitrary submitted output, typically `{formId: {field: value}}`.
    #[serde(default)]
    pub output: Value,
    #[serde(default)]
    pub draft: Option<Value>,
    #[serde(default)]
    pub feedback: Option<Value>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry: i32,
    /// Owning replica identifier; null when unclaimed.
    #[serde(default)]
    pub consumer: Option<String>,
    #[serde(default)]
    pub log: Option<String>,
    #[serde(default)]
    pub agent_mode: Option<AgentMode>,
    #[serde(default)]
    pub agent_orch: Option<String>,
    #[serde(default)]
    pub temp_feedback: Option<String>,
    /// Incremented each time the same activity is re-entered via a loop.
    #[serde(default)]
    pub rework_count: i32,
    #[serde(default)]
    pub query: Option<String>,
    pub tenant_id: String,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl WorkItem {
    /// Minimal constructor; callers fill in the optional columns they own.
    pub fn new(
        proc_inst_id: &str,
        proc_def_id: &str,
        activity_id: &str,
        activity_name: &str,
        status: WorkItemStatus,
        tenant_id: &str,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            proc_inst_id: Some(proc_inst_id.to_string()),
            proc_def_id: Some(proc_def_id.to_lowercase()),
            activity_id: activity_id.to_string(),
            activity_name: activity_name.to_string(),
            status,
            user_id: None,
            username: None,
            assignees: Vec::new(),
            reference_ids: Vec::new(),
            duration: None,
            tool: None,
            output: Value::Null,
            draft: None,
            feedback: None,
            start_date: None,
            end_date: None,
            due_date: None,
            retry: 0,
            consumer: None,
            log: None,
            agent_mode: None,
            agent_orch: None,
            temp_feedback: None,
            rework_count: 0,
            query: None,
            tenant_id: tenant_id.to_string(),
            updated_at: None,
        }
    }

    pub fn is_claimed(&self) -> bool {
        self.consumer.is_some()
    }
}

/// Partial work-item update applied through the store. `None` leaves the
/// column untouched; the double-Option fields can null a nullable column.
#[derive(Clone, Debug, Default)]
pub struct WorkItemPatch {
    pub status: Option<WorkItemStatus>,
    pub consumer: Option<Option<String>>,
    pub log: Option<String>,
    pub output: Option<Value>,
    pub retry: Option<i32>,
    pub user_id: Option<String>,
    pub username: Option<String>,
    pub agent_mode: Option<AgentMode>,
    pub agent_orch: Option<String>,
    pub end_date: Option<Option<DateTime<Utc>>>,
}

impl WorkItemPatch {
    pub fn status(status: WorkItemStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn log(text: impl Into<String>) -> Self {
        Self {
            log: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn release_consumer() -> Self {
        Self {
            consumer: Some(None),
            ..Default::default()
        }
    }
}

// ─── Process instance ─────────────────────────────────────────

/// One process variable: key, display name, declared-type value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VariableEntry {
    pub key: String,
    #[serde(default)]
    pub name: Option<String>,
    pub value: Value,
}

/// Mutable execution state of one process (`bpm_proc_inst` row).
/// The id has the shape `<defId>.<uuid>`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessInstance {
    pub proc_inst_id: String,
    pub proc_inst_name: Option<String>,
    pub proc_def_id: String,
    #[serde(default)]
    pub proc_def_version: Option<String>,
    pub status: InstanceStatus,
    #[serde(default)]
    pub current_activity_ids: Vec<String>,
    #[serde(default)]
    pub current_user_ids: Vec<String>,
    #[serde(default)]
    pub participants: Vec<String>,
    #[serde(default)]
    pub role_bindings: Vec<RoleBinding>,
    #[serde(default)]
    pub variables_data: Vec<VariableEntry>,
    pub tenant_id: String,
}

impl ProcessInstance {
    /// The definition id is everything before the first dot of the instance id.
    pub fn def_id(&self) -> &str {
        self.proc_inst_id
            .split_once('.')
            .map(|(d, _)| d)
            .unwrap_or(&self.proc_inst_id)
    }

    /// Mint a fresh instance id for a definition.
    pub fn mint_id(def_id: &str) -> String {
        format!("{}.{}", def_id.to_lowercase(), Uuid::new_v4())
    }

    /// Process variables as a flat `{key: value}` map.
    pub fn variables_map(&self) -> serde_json::Map<String, Value> {
        self.variables_data
            .iter()
            .map(|v| (v.key.clone(), v.value.clone()))
            .collect()
    }
}

// ─── Event log ────────────────────────────────────────────────

/// Append-only audit entry (`events` row). Consumed by the compensation
/// planner and by external observers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventEntry {
    pub id: Uuid,
    #[serde(default)]
    pub run_id: Option<String>,
    /// `task.id` of the producing job.
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub todo_id: Option<Uuid>,
    #[serde(default)]
    pub proc_inst_id: Option<String>,
    pub event_type: String,
    #[serde(default)]
    pub crew_type: Option<String>,
    #[serde(default)]
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

// ─── Compensation artifact ────────────────────────────────────

/// Synthesized undo script keyed by `(proc_def, activity, tenant)`
/// (`mcp_python_code` row). Generated once and reused.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompensationArtifact {
    pub proc_def_id: String,
    pub activity_id: String,
    pub tenant_id: String,
    pub compensation: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

// ─── Directory records ────────────────────────────────────────

/// A row of the `users` table, as much of it as the engine reads.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub username: Option<String>,
}

/// A row of the `agents` table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Non-empty URL marks the agent as reachable over the A2A channel.
    #[serde(default)]
    pub url: Option<String>,
}

/// Stored form definition (`form_def` row); the engine only reads the id
/// and the field keys for output unwrapping.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FormDefinition {
    pub id: String,
    #[serde(default)]
    pub html: Option<String>,
    #[serde(default)]
    pub proc_def_id: Option<String>,
    #[serde(default)]
    pub activity_id: Option<String>,
    #[serde(default)]
    pub fields_json: Option<Value>,
}

// ─── Decision payload (wire format) ───────────────────────────

/// Error taxonomy carried in the wire payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProceedErrorKind {
    ProceedConditionNotMet,
    SystemError,
    DataFieldNotExist,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProceedError {
    #[serde(rename = "type")]
    pub kind: ProceedErrorKind,
    pub reason: Value,
}

impl ProceedError {
    pub fn new(kind: ProceedErrorKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: Value::String(reason.into()),
        }
    }

    pub fn reason_text(&self) -> String {
        match &self.reason {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// A process variable the decision wants merged.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FieldMapping {
    pub key: String,
    #[serde(default)]
    pub name: Option<String>,
    pub value: Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedActivity {
    pub completed_activity_id: String,
    #[serde(default)]
    pub completed_activity_name: Option<String>,
    #[serde(default)]
    pub completed_user_email: Option<String>,
    pub result: WorkItemStatus,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextActivity {
    pub next_activity_id: String,
    #[serde(default)]
    pub next_activity_name: Option<String>,
    #[serde(default)]
    pub next_user_email: Option<String>,
    pub result: WorkItemStatus,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReferenceInfo {
    pub key: String,
    pub value: Value,
}

/// The validated decision DTO returned by the reasoning layer. Parsed into
/// this shape first; never unpacked directly into the instance.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionPayload {
    pub instance_id: String,
    #[serde(default)]
    pub instance_name: Option<String>,
    pub process_definition_id: String,
    #[serde(default)]
    pub field_mappings: Vec<FieldMapping>,
    #[serde(default)]
    pub role_bindings: Vec<RoleBinding>,
    #[serde(default)]
    pub completed_activities: Vec<CompletedActivity>,
    #[serde(default)]
    pub next_activities: Vec<NextActivity>,
    #[serde(default)]
    pub cannot_proceed_errors: Vec<ProceedError>,
    #[serde(default)]
    pub reference_info: Vec<ReferenceInfo>,
    /// Script-task stdout/stderr captured by the resolver.
    #[serde(default)]
    pub result: Option<String>,
}

/// `nextActivityId` values that terminate the instance instead of naming a node.
pub const END_MARKERS: [&str; 3] = ["endEvent", "END_PROCESS", "end_event"];

pub fn is_end_marker(id: &str) -> bool {
    END_MARKERS.contains(&id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_canonical_strings() {
        for (status, s) in [
            (WorkItemStatus::Todo, "\"TODO\""),
            (WorkItemStatus::InProgress, "\"IN_PROGRESS\""),
            (WorkItemStatus::Submitted, "\"SUBMITTED\""),
            (WorkItemStatus::Done, "\"DONE\""),
            (WorkItemStatus::Error, "\"ERROR\""),
            (WorkItemStatus::Pending, "\"PENDING\""),
        ] {
            assert_eq!(serde_json::to_string(&status).unwrap(), s);
            let back: WorkItemStatus = serde_json::from_str(s).unwrap();
            assert_eq!(back, status);
        }
    }

    #[test]
    fn endpoint_accepts_string_or_list() {
        let one: RoleBinding =
            serde_json::from_str(r#"{"name":"seller","endpoint":"a@x.com"}"#).unwrap();
        assert_eq!(one.endpoint.unwrap().joined(), "a@x.com");

        let many: RoleBinding =
            serde_json::from_str(r#"{"name":"review","endpoint":["a@x.com","b@x.com"]}"#).unwrap();
        assert_eq!(many.endpoint.unwrap().joined(), "a@x.com,b@x.com");
    }

    #[test]
    fn decision_payload_parses_wire_shape() {
        let raw = r#"{
            "instanceId": "order.abc",
            "instanceName": "order-1",
            "processDefinitionId": "order",
            "fieldMappings": [{"key": "qty", "name": "Quantity", "value": 3}],
            "roleBindings": [{"name": "seller", "endpoint": "s@x.com"}],
            "completedActivities": [{
                "completedActivityId": "confirm",
                "completedUserEmail": "s@x.com",
                "result": "DONE"
            }],
            "nextActivities": [{
                "nextActivityId": "ship",
                "nextUserEmail": "w@x.com",
                "result": "IN_PROGRESS"
            }],
            "cannotProceedErrors": [],
            "referenceInfo": [{"key": "item", "value": "laptop"}]
        }"#;
        let payload: DecisionPayload = serde_json::from_str(raw).unwrap();
        assert_eq!(payload.instance_id, "order.abc");
        assert_eq!(payload.next_activities[0].result, WorkItemStatus::InProgress);
        assert_eq!(payload.completed_activities[0].result, WorkItemStatus::Done);
    }

    #[test]
    fn instance_def_id_splits_on_first_dot() {
        let inst = ProcessInstance {
            proc_inst_id: "company_entrance.123e4567".to_string(),
            proc_inst_name: None,
            proc_def_id: "company_entrance".to_string(),
            proc_def_version: None,
            status: InstanceStatus::Running,
            current_activity_ids: vec![],
            current_user_ids: vec![],
            participants: vec![],
            role_bindings: vec![],
            variables_data: vec![],
            tenant_id: "localhost".to_string(),
        };
        assert_eq!(inst.def_id(), "company_entrance");
    }
}
