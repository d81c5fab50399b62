//! Typed process-definition model and its graph queries.
//!
//! A definition arrives as JSON. At load time the event collection is folded
//! into the gateway collection (a gateway carries a `type` tag distinguishing
//! true gateways from start/end/boundary/timer events) and every node records
//! `srcTrg`, the id of the single immediate predecessor used during creation.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("definition JSON did not match the expected shape: {0}")]
    Shape(#[from] serde_json::Error),
    #[error("definition must contain exactly one start event, found {0}")]
    StartEventCount(usize),
    #[error("definition must contain at least one end event")]
    MissingEndEvent,
    #[error("end event '{0}' must not have outgoing flows")]
    EndEventHasOutgoing(String),
    #[error("sequence endpoint '{0}' does not resolve to any node")]
    DanglingSequence(String),
    #[error("attached event '{0}' resolves to a gateway, which is not allowed")]
    BoundaryOnGateway(String),
    #[error("no initial activity reachable from the start event")]
    NoInitialActivity,
}

// ─── Model ────────────────────────────────────────────────────

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSource {
    #[serde(rename = "type")]
    pub source_type: String,
    #[serde(default)]
    pub sql: Option<String>,
}

/// A process-level data declaration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessData {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub data_source: Option<DataSource>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRole {
    pub name: String,
    #[serde(default)]
    pub endpoint: Option<Value>,
    #[serde(default)]
    pub resolution_rule: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessActivity {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub activity_type: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub instruction: Option<String>,
    #[serde(default, rename = "attachedEvents")]
    pub attached_events: Vec<String>,
    pub role: String,
    #[serde(default, rename = "inputData")]
    pub input_data: Vec<String>,
    #[serde(default, rename = "outputData")]
    pub output_data: Vec<String>,
    #[serde(default)]
    pub checkpoints: Vec<String>,
    /// Script body for `scriptTask` activities.
    #[serde(default, rename = "pythonCode")]
    pub script_code: Option<String>,
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub properties: Option<String>,
    /// Expected duration in days.
    #[serde(default)]
    pub duration: Option<i64>,
    #[serde(default, rename = "srcTrg")]
    pub src_trg: Option<String>,
    #[serde(default, rename = "agentMode")]
    pub agent_mode: Option<String>,
    #[serde(default)]
    pub orchestration: Option<String>,
}

impl ProcessActivity {
    pub fn is_script_task(&self) -> bool {
        self.activity_type == "scriptTask" || self.activity_type == "ScriptActivity"
    }

    pub fn is_service_task(&self) -> bool {
        self.activity_type == "serviceTask"
    }

    /// The form id from a `formHandler:<formId>` tool descriptor.
    pub fn form_id(&self) -> Option<&str> {
        self.tool.as_deref()?.strip_prefix("formHandler:")
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubProcess {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub sub_process_type: String,
    pub role: String,
    #[serde(default)]
    pub attached_events: Vec<String>,
    #[serde(default)]
    pub properties: Option<String>,
    #[serde(default)]
    pub duration: Option<i64>,
    #[serde(default)]
    pub src_trg: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessSequence {
    #[serde(default)]
    pub id: Option<String>,
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub condition: Option<String>,
    /// Structured and free-form hints (including the `feedback` flag);
    /// arrives as either a JSON object or an embedded JSON string.
    #[serde(default)]
    pub properties: Option<Value>,
}

impl ProcessSequence {
    /// A condition is trivially true when absent or blank.
    pub fn has_condition(&self) -> bool {
        self.condition
            .as_deref()
            .map(|c| !c.trim().is_empty())
            .unwrap_or(false)
    }
}

/// A routing node. Events are folded into this collection at load time,
/// so `gateway_type` also carries `startEvent`, `endEvent`, timer tags, etc.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessGateway {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(rename = "type", default)]
    pub gateway_type: Option<String>,
    #[serde(default)]
    pub process: Option<String>,
    #[serde(default)]
    pub condition: Option<Value>,
    #[serde(default, rename = "conditionData")]
    pub condition_data: Vec<String>,
    #[serde(default)]
    pub properties: Option<Value>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub duration: Option<i64>,
    #[serde(default, rename = "srcTrg")]
    pub src_trg: Option<String>,
}

impl ProcessGateway {
    pub fn type_str(&self) -> &str {
        self.gateway_type.as_deref().unwrap_or("")
    }

    pub fn is_event(&self) -> bool {
        self.type_str().contains("event") || self.type_str().contains("Event")
    }

    pub fn is_start_event(&self) -> bool {
        self.type_str() == "startEvent"
    }

    pub fn is_end_event(&self) -> bool {
        self.type_str() == "endEvent"
    }
}

/// A node reference returned by forward expansion: gateways are never
/// returned, so the possible shapes are activity, sub-process, or event.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FlowNode<'a> {
    Activity(&'a ProcessActivity),
    SubProcess(&'a SubProcess),
    Event(&'a ProcessGateway),
}

impl<'a> FlowNode<'a> {
    pub fn id(&self) -> &'a str {
        match self {
            FlowNode::Activity(a) => &a.id,
            FlowNode::SubProcess(s) => &s.id,
            FlowNode::Event(e) => e.id.as_deref().unwrap_or(""),
        }
    }

    pub fn name(&self) -> &'a str {
        match self {
            FlowNode::Activity(a) => &a.name,
            FlowNode::SubProcess(s) => &s.name,
            FlowNode::Event(e) => e.name.as_deref().unwrap_or(""),
        }
    }

    pub fn as_activity(&self) -> Option<&'a ProcessActivity> {
        match self {
            FlowNode::Activity(a) => Some(a),
            _ => None,
        }
    }
}

/// Immutable, versioned process definition.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessDefinition {
    pub process_definition_name: String,
    pub process_definition_id: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub data: Vec<ProcessData>,
    #[serde(default)]
    pub roles: Vec<ProcessRole>,
    #[serde(default)]
    pub activities: Vec<ProcessActivity>,
    #[serde(default, rename = "subProcesses")]
    pub sub_processes: Vec<SubProcess>,
    #[serde(default)]
    pub sequences: Vec<ProcessSequence>,
    #[serde(default)]
    pub gateways: Vec<ProcessGateway>,
    #[serde(default, rename = "instanceNamePattern")]
    pub instance_name_pattern: Option<String>,
}

// ─── Loading ──────────────────────────────────────────────────

/// Load a definition from its JSON document: fold `events` into the gateway
/// collection, wire `srcTrg` back-pointers, and check structural invariants.
pub fn load_process_definition(mut json: Value) -> Result<ProcessDefinition, DefinitionError> {
    if let Some(Value::Array(events)) = json.get("events").cloned() {
        if let Some(gateways) = json.as_object_mut().and_then(|o| {
            o.entry("gateways")
                .or_insert_with(|| Value::Array(vec![]))
                .as_array_mut()
        }) {
            for event in events {
                let mut gw = serde_json::Map::new();
                for key in [
                    "id",
                    "name",
                    "role",
                    "type",
                    "process",
                    "condition",
                    "properties",
                    "description",
                ] {
                    if let Some(v) = event.get(key) {
                        gw.insert(key.to_string(), v.clone());
                    }
                }
                gateways.push(Value::Object(gw));
            }
        }
    }

    let mut def: ProcessDefinition = serde_json::from_value(json)?;

    for i in 0..def.sequences.len() {
        let (source, target) = (def.sequences[i].source.clone(), def.sequences[i].target.clone());
        if let Some(act) = def.activities.iter_mut().find(|a| a.id == target) {
            act.src_trg = Some(source);
        } else if let Some(gw) = def
            .gateways
            .iter_mut()
            .find(|g| g.id.as_deref() == Some(target.as_str()))
        {
            gw.src_trg = Some(source);
        }
    }

    validate(&def)?;
    Ok(def)
}

fn validate(def: &ProcessDefinition) -> Result<(), DefinitionError> {
    let start_count = def.gateways.iter().filter(|g| g.is_start_event()).count();
    if start_count != 1 {
        return Err(DefinitionError::StartEventCount(start_count));
    }
    let end_events: Vec<&ProcessGateway> =
        def.gateways.iter().filter(|g| g.is_end_event()).collect();
    if end_events.is_empty() {
        return Err(DefinitionError::MissingEndEvent);
    }
    for end in &end_events {
        let id = end.id.as_deref().unwrap_or("");
        if def.sequences.iter().any(|s| s.source == id) {
            return Err(DefinitionError::EndEventHasOutgoing(id.to_string()));
        }
    }

    let known: HashSet<&str> = def
        .activities
        .iter()
        .map(|a| a.id.as_str())
        .chain(def.sub_processes.iter().map(|s| s.id.as_str()))
        .chain(def.gateways.iter().filter_map(|g| g.id.as_deref()))
        .collect();
    for seq in &def.sequences {
        for endpoint in [&seq.source, &seq.target] {
            if !known.contains(endpoint.as_str()) {
                return Err(DefinitionError::DanglingSequence(endpoint.clone()));
            }
        }
    }

    for activity in &def.activities {
        for attached in &activity.attached_events {
            let is_event = def
                .find_event_by_id(attached)
                .map(|_| true)
                .unwrap_or(false);
            let is_sub = def.find_sub_process_by_id(attached).is_some();
            let is_activity = def.find_activity_by_id(attached).is_some();
            if !is_event && !is_sub && !is_activity && def.find_gateway_by_id(attached).is_some() {
                return Err(DefinitionError::BoundaryOnGateway(attached.clone()));
            }
        }
    }

    Ok(())
}

// ─── Graph queries ────────────────────────────────────────────

impl ProcessDefinition {
    pub fn find_activity_by_id(&self, id: &str) -> Option<&ProcessActivity> {
        self.activities.iter().find(|a| a.id == id)
    }

    pub fn find_sub_process_by_id(&self, id: &str) -> Option<&SubProcess> {
        self.sub_processes.iter().find(|s| s.id == id)
    }

    pub fn find_gateway_by_id(&self, id: &str) -> Option<&ProcessGateway> {
        self.gateways.iter().find(|g| g.id.as_deref() == Some(id))
    }

    /// Events live in the gateway collection; a node counts as an event when
    /// its type tag mentions one.
    pub fn find_event_by_id(&self, id: &str) -> Option<&ProcessGateway> {
        self.gateways
            .iter()
            .find(|g| g.id.as_deref() == Some(id) && g.is_event())
    }

    pub fn start_event(&self) -> Option<&ProcessGateway> {
        self.gateways.iter().find(|g| g.is_start_event())
    }

    /// Flows matching either endpoint; both filters optional.
    pub fn find_sequences(&self, source: Option<&str>, target: Option<&str>) -> Vec<&ProcessSequence> {
        self.sequences
            .iter()
            .filter(|s| {
                source.map(|src| s.source == src).unwrap_or(true)
                    && target.map(|tgt| s.target == tgt).unwrap_or(true)
            })
            .collect()
    }

    /// True iff the start event has a flow directly to `activity_id`.
    pub fn is_starting_activity(&self, activity_id: &str) -> bool {
        let Some(start) = self.start_event() else {
            return false;
        };
        let start_id = start.id.as_deref().unwrap_or("");
        self.sequences
            .iter()
            .any(|s| s.source == start_id && s.target == activity_id)
    }

    /// The unique activity reached by the start event's outgoing flow.
    /// Execution cannot begin without it, so absence is fatal.
    pub fn find_initial_activity(&self) -> Result<&ProcessActivity, DefinitionError> {
        let start = self
            .start_event()
            .ok_or(DefinitionError::StartEventCount(0))?;
        let start_id = start.id.as_deref().unwrap_or("");
        self.sequences
            .iter()
            .find(|s| s.source.contains(start_id))
            .and_then(|s| self.find_activity_by_id(&s.target))
            .ok_or(DefinitionError::NoInitialActivity)
    }

    /// The activity whose outgoing flow targets an end event.
    pub fn find_end_activity(&self) -> Option<&ProcessActivity> {
        let end_seq = self.sequences.iter().find(|s| {
            self.find_gateway_by_id(&s.target)
                .map(|g| g.is_end_event())
                .unwrap_or(false)
                || s.target.to_lowercase().contains("end_event")
        })?;
        self.find_activity_by_id(&end_seq.source)
    }

    /// Full transitive set of upstream activities, skipping gateways.
    /// Cycle-safe via the visited set.
    pub fn find_prev_activities(&self, activity_id: &str) -> Vec<&ProcessActivity> {
        let mut result: Vec<&ProcessActivity> = Vec::new();
        let mut visited: HashSet<&str> = HashSet::new();
        self.collect_prev(activity_id, &mut result, &mut visited);
        result
    }

    fn collect_prev<'a>(
        &'a self,
        node_id: &str,
        result: &mut Vec<&'a ProcessActivity>,
        visited: &mut HashSet<&'a str>,
    ) {
        let Some(node_id) = self.own_id(node_id) else {
            return;
        };
        if !visited.insert(node_id) {
            return;
        }
        for seq in self.sequences.iter().filter(|s| s.target == node_id) {
            if let Some(source) = self.find_activity_by_id(&seq.source) {
                if !visited.contains(source.id.as_str()) {
                    if !result.iter().any(|a| a.id == source.id) {
                        result.push(source);
                    }
                    self.collect_prev(&source.id, result, visited);
                }
            } else if self.find_gateway_by_id(&seq.source).is_some()
                && !visited.contains(seq.source.as_str())
            {
                self.collect_prev(&seq.source, result, visited);
            }
        }
    }

    /// Canonicalize a node id to the stored `&str` so the visited set can
    /// borrow from the definition instead of the query argument.
    fn own_id(&self, id: &str) -> Option<&str> {
        self.find_activity_by_id(id)
            .map(|a| a.id.as_str())
            .or_else(|| self.find_gateway_by_id(id).and_then(|g| g.id.as_deref()))
            .or_else(|| self.find_sub_process_by_id(id).map(|s| s.id.as_str()))
    }

    /// Direct predecessors; when the immediate source is a gateway, the
    /// activities feeding into that gateway are returned instead.
    pub fn find_immediate_prev_activities(&self, activity_id: &str) -> Vec<&ProcessActivity> {
        let mut prev: Vec<&ProcessActivity> = Vec::new();
        for seq in self.sequences.iter().filter(|s| s.target == activity_id) {
            if seq.source.to_lowercase().contains("start_event") {
                continue;
            }
            if let Some(activity) = self.find_activity_by_id(&seq.source) {
                if !prev.iter().any(|a| a.id == activity.id) {
                    prev.push(activity);
                }
            } else if let Some(gw) = self.find_gateway_by_id(&seq.source) {
                let gw_id = gw.id.as_deref().unwrap_or("");
                for gw_seq in self.sequences.iter().filter(|s| s.target == gw_id) {
                    if let Some(activity) = self.find_activity_by_id(&gw_seq.source) {
                        if !prev.iter().any(|a| a.id == activity.id) {
                            prev.push(activity);
                        }
                    }
                }
            }
        }
        prev
    }

    /// The activity or sub-process owning a boundary event.
    pub fn find_attached_activity(&self, event_id: &str) -> Option<&ProcessActivity> {
        self.activities
            .iter()
            .find(|a| a.attached_events.iter().any(|e| e == event_id))
    }

    /// Forward expansion from `current_id`. Gateways are never returned:
    /// they expand. A gateway with directly connected events surfaces those
    /// events (when `include_events`) instead of expanding further.
    /// Activities and sub-processes are returned as-is, with boundary events
    /// of returned nodes appended at the same level; sub-process internals
    /// are never entered.
    pub fn find_next_activities(&self, current_id: &str, include_events: bool) -> Vec<FlowNode<'_>> {
        let mut results: Vec<FlowNode<'_>> = Vec::new();
        let mut visited: HashSet<&str> = HashSet::new();

        let mut stack: Vec<&str> = self
            .sequences
            .iter()
            .filter(|s| s.source == current_id)
            .map(|s| s.target.as_str())
            .collect();

        while let Some(node_id) = stack.pop() {
            if let Some(sub) = self.find_sub_process_by_id(node_id) {
                push_unique(&mut results, FlowNode::SubProcess(sub));
                self.append_attached_events(&sub.attached_events, &mut results, &visited);
                self.expand_beyond(node_id, &mut results, include_events, &mut visited);
                continue;
            }
            if let Some(act) = self.find_activity_by_id(node_id) {
                push_unique(&mut results, FlowNode::Activity(act));
                self.append_attached_events(&act.attached_events, &mut results, &visited);
                self.expand_beyond(node_id, &mut results, include_events, &mut visited);
                continue;
            }
            if let Some(gw) = self.find_gateway_by_id(node_id) {
                let gw_id = gw.id.as_deref().unwrap_or("");
                let mut has_event = false;
                for seq in self.sequences.iter().filter(|s| s.source == gw_id) {
                    if let Some(event) = self.find_event_by_id(&seq.target) {
                        if include_events {
                            push_unique(&mut results, FlowNode::Event(event));
                            has_event = true;
                        }
                    }
                }
                if !has_event {
                    for seq in self.sequences.iter().filter(|s| s.source == gw_id) {
                        stack.push(seq.target.as_str());
                    }
                }
            }
        }
        results
    }

    /// Expansion step used past the first hop: gateways expand through every
    /// branch unless an event is directly connected, in which case the walk
    /// stops at the gateway (events are surfaced only when requested).
    fn expand_beyond<'a>(
        &'a self,
        node_id: &str,
        results: &mut Vec<FlowNode<'a>>,
        include_events: bool,
        visited: &mut HashSet<&'a str>,
    ) {
        let Some(node_id) = self.own_id(node_id) else {
            return;
        };
        if !visited.insert(node_id) {
            return;
        }

        for seq in self.sequences.iter().filter(|s| s.source == node_id) {
            let target_id = seq.target.as_str();

            if let Some(sub) = self.find_sub_process_by_id(target_id) {
                push_unique(results, FlowNode::SubProcess(sub));
                self.append_attached_events(&sub.attached_events, results, visited);
                self.expand_beyond(target_id, results, include_events, visited);
                continue;
            }
            if let Some(act) = self.find_activity_by_id(target_id) {
                push_unique(results, FlowNode::Activity(act));
                self.append_attached_events(&act.attached_events, results, visited);
                self.expand_beyond(target_id, results, include_events, visited);
                continue;
            }
            if let Some(gw) = self.find_gateway_by_id(target_id) {
                let gw_id = gw.id.as_deref().unwrap_or("");
                let mut has_event = false;
                for gw_seq in self.sequences.iter().filter(|s| s.source == gw_id) {
                    if let Some(event) = self.find_event_by_id(&gw_seq.target) {
                        has_event = true;
                        if include_events {
                            push_unique(results, FlowNode::Event(event));
                        }
                    }
                }
                if !has_event {
                    self.expand_beyond(gw_id, results, include_events, visited);
                }
            }
        }
    }

    /// Boundary events attach activities or sub-processes at the same level;
    /// gateways cannot appear here, so unknown ids are ignored.
    fn append_attached_events<'a>(
        &'a self,
        attached: &[String],
        results: &mut Vec<FlowNode<'a>>,
        visited: &HashSet<&str>,
    ) {
        for attach_id in attached {
            if visited.contains(attach_id.as_str()) {
                continue;
            }
            if let Some(sub) = self.find_sub_process_by_id(attach_id) {
                push_unique(results, FlowNode::SubProcess(sub));
                continue;
            }
            if let Some(act) = self.find_activity_by_id(attach_id) {
                push_unique(results, FlowNode::Activity(act));
                if !act.attached_events.is_empty() {
                    self.append_attached_events(&act.attached_events, results, visited);
                }
            }
        }
    }

    /// Transitive forward closure of activities and sub-processes downstream
    /// of `activity_id`, expanding through gateways and events.
    pub fn find_all_following_activities(&self, activity_id: &str) -> Vec<&ProcessActivity> {
        let mut result: Vec<&ProcessActivity> = Vec::new();
        let mut visited: HashSet<&str> = HashSet::new();
        let mut queue: Vec<&str> = self
            .sequences
            .iter()
            .filter(|s| s.source == activity_id)
            .map(|s| s.target.as_str())
            .collect();

        while let Some(node_id) = queue.pop() {
            let Some(node_id) = self.own_id(node_id) else {
                continue;
            };
            if !visited.insert(node_id) {
                continue;
            }
            if let Some(act) = self.find_activity_by_id(node_id) {
                if !result.iter().any(|a| a.id == act.id) {
                    result.push(act);
                }
            }
            for seq in self.sequences.iter().filter(|s| s.source == node_id) {
                queue.push(seq.target.as_str());
            }
        }
        result
    }
}

fn push_unique<'a>(results: &mut Vec<FlowNode<'a>>, node: FlowNode<'a>) {
    if !results.iter().any(|n| n.id() == node.id()) {
        results.push(node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn order_process() -> Value {
        json!({
            "processDefinitionName": "Order Handling",
            "processDefinitionId": "order_handling",
            "data": [
                {"name": "order_quantity", "type": "number"},
                {"name": "customer_email", "type": "string"}
            ],
            "roles": [
                {"name": "sales", "endpoint": "sales@acme.test"},
                {"name": "warehouse", "endpoint": "wh@acme.test"}
            ],
            "activities": [
                {"id": "receive_order", "name": "Receive Order", "type": "userTask",
                 "role": "sales", "duration": 1,
                 "tool": "formHandler:order_handling_receive_order_form"},
                {"id": "check_stock", "name": "Check Stock", "type": "userTask",
                 "role": "warehouse", "duration": 2,
                 "inputData": ["order_handling_receive_order_form.order_quantity"]},
                {"id": "ship_order", "name": "Ship Order", "type": "userTask",
                 "role": "warehouse", "duration": 1}
            ],
            "sequences": [
                {"source": "start_event", "target": "receive_order"},
                {"source": "receive_order", "target": "gw_stock"},
                {"source": "gw_stock", "target": "check_stock", "condition": "order_quantity > 0"},
                {"source": "check_stock", "target": "ship_order"},
                {"source": "ship_order", "target": "end_event"}
            ],
            "gateways": [
                {"id": "gw_stock", "name": "Stock?", "type": "exclusiveGateway",
                 "conditionData": ["order_handling_receive_order_form.order_quantity"]}
            ],
            "events": [
                {"id": "start_event", "name": "Start", "type": "startEvent"},
                {"id": "end_event", "name": "End", "type": "endEvent"}
            ]
        })
    }

    #[test]
    fn load_folds_events_into_gateways_and_sets_src_trg() {
        let def = load_process_definition(order_process()).unwrap();
        assert!(def.find_gateway_by_id("start_event").is_some());
        assert!(def.find_event_by_id("end_event").is_some());

        let receive = def.find_activity_by_id("receive_order").unwrap();
        assert_eq!(receive.src_trg.as_deref(), Some("start_event"));
        let gw = def.find_gateway_by_id("gw_stock").unwrap();
        assert_eq!(gw.src_trg.as_deref(), Some("receive_order"));
    }

    #[test]
    fn load_round_trip_preserves_graph() {
        let def = load_process_definition(order_process()).unwrap();
        let serialized = serde_json::to_value(&def).unwrap();
        let reloaded: ProcessDefinition = serde_json::from_value(serialized).unwrap();
        assert_eq!(reloaded.activities.len(), def.activities.len());
        assert_eq!(reloaded.sequences.len(), def.sequences.len());
        assert_eq!(reloaded.gateways.len(), def.gateways.len());
        for (a, b) in def.activities.iter().zip(reloaded.activities.iter()) {
            assert_eq!(a.id, b.id);
            assert_eq!(a.src_trg, b.src_trg);
        }
    }

    #[test]
    fn initial_and_end_activity_discovery() {
        let def = load_process_definition(order_process()).unwrap();
        assert_eq!(def.find_initial_activity().unwrap().id, "receive_order");
        assert!(def.is_starting_activity("receive_order"));
        assert!(!def.is_starting_activity("check_stock"));
        assert_eq!(def.find_end_activity().unwrap().id, "ship_order");
    }

    #[test]
    fn missing_start_event_is_fatal() {
        let mut doc = order_process();
        doc["events"] = json!([{"id": "end_event", "type": "endEvent"}]);
        // The start_event sequence endpoint now dangles too, but the start
        // event count check fires first.
        let err = load_process_definition(doc).unwrap_err();
        assert!(matches!(err, DefinitionError::StartEventCount(0)));
    }

    #[test]
    fn end_event_with_outgoing_flow_is_rejected() {
        let mut doc = order_process();
        doc["sequences"]
            .as_array_mut()
            .unwrap()
            .push(json!({"source": "end_event", "target": "receive_order"}));
        let err = load_process_definition(doc).unwrap_err();
        assert!(matches!(err, DefinitionError::EndEventHasOutgoing(_)));
    }

    #[test]
    fn next_activities_expand_through_gateways() {
        let def = load_process_definition(order_process()).unwrap();
        let next = def.find_next_activities("receive_order", true);
        let ids: Vec<&str> = next.iter().map(|n| n.id()).collect();
        assert!(ids.contains(&"check_stock"));
        // Gateways are expansion-only.
        assert!(!ids.contains(&"gw_stock"));
    }

    #[test]
    fn next_activities_stop_at_the_process_edge() {
        let def = load_process_definition(order_process()).unwrap();
        // The end event is reached through the trailing hop and yields no
        // further work nodes.
        assert!(def.find_next_activities("ship_order", true).is_empty());
        assert!(def.find_next_activities("ship_order", false).is_empty());
    }

    #[test]
    fn event_based_gateways_surface_their_events() {
        let doc = json!({
            "processDefinitionName": "Waits",
            "processDefinitionId": "waits",
            "activities": [
                {"id": "ask", "name": "Ask", "type": "userTask", "role": "r"},
                {"id": "remind", "name": "Remind", "type": "userTask", "role": "r"}
            ],
            "sequences": [
                {"source": "start_event", "target": "ask"},
                {"source": "ask", "target": "gw_wait"},
                {"source": "gw_wait", "target": "reply_timer"},
                {"source": "reply_timer", "target": "remind"},
                {"source": "remind", "target": "end_event"}
            ],
            "gateways": [
                {"id": "gw_wait", "type": "eventBasedGateway"}
            ],
            "events": [
                {"id": "start_event", "type": "startEvent"},
                {"id": "reply_timer", "type": "timerEvent"},
                {"id": "end_event", "type": "endEvent"}
            ]
        });
        let def = load_process_definition(doc).unwrap();

        // With events requested, the walk stops at the directly connected
        // event; without them, it expands through to the activity behind.
        let with_events = def.find_next_activities("ask", true);
        assert_eq!(with_events.len(), 1);
        assert_eq!(with_events[0].id(), "reply_timer");

        let without_events = def.find_next_activities("ask", false);
        let ids: Vec<&str> = without_events.iter().map(|n| n.id()).collect();
        assert_eq!(ids, vec!["remind"]);
    }

    #[test]
    fn prev_activities_skip_gateways_transitively() {
        let def = load_process_definition(order_process()).unwrap();
        let prev = def.find_prev_activities("ship_order");
        let ids: Vec<&str> = prev.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["check_stock", "receive_order"]);
    }

    #[test]
    fn immediate_prev_looks_through_one_gateway() {
        let def = load_process_definition(order_process()).unwrap();
        let prev = def.find_immediate_prev_activities("check_stock");
        let ids: Vec<&str> = prev.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["receive_order"]);
    }

    #[test]
    fn prev_activities_survive_loops() {
        let doc = json!({
            "processDefinitionName": "Loop",
            "processDefinitionId": "loop",
            "activities": [
                {"id": "a", "name": "A", "type": "userTask", "role": "r"},
                {"id": "b", "name": "B", "type": "userTask", "role": "r"}
            ],
            "sequences": [
                {"source": "start_event", "target": "a"},
                {"source": "a", "target": "b"},
                {"source": "b", "target": "a"},
                {"source": "b", "target": "end_event"}
            ],
            "events": [
                {"id": "start_event", "type": "startEvent"},
                {"id": "end_event", "type": "endEvent"}
            ]
        });
        let def = load_process_definition(doc).unwrap();
        let prev = def.find_prev_activities("a");
        assert_eq!(prev.len(), 1);
        assert_eq!(prev[0].id, "b");
    }

    #[test]
    fn boundary_events_surface_with_their_owner() {
        let doc = json!({
            "processDefinitionName": "Boundary",
            "processDefinitionId": "boundary",
            "activities": [
                {"id": "work", "name": "Work", "type": "userTask", "role": "r",
                 "attachedEvents": ["escalate"]},
                {"id": "escalate", "name": "Escalate", "type": "userTask", "role": "r"},
                {"id": "next", "name": "Next", "type": "userTask", "role": "r"}
            ],
            "sequences": [
                {"source": "start_event", "target": "work"},
                {"source": "work", "target": "next"},
                {"source": "next", "target": "end_event"}
            ],
            "events": [
                {"id": "start_event", "type": "startEvent"},
                {"id": "end_event", "type": "endEvent"}
            ]
        });
        let def = load_process_definition(doc).unwrap();
        let next = def.find_next_activities("start_event", false);
        let ids: Vec<&str> = next.iter().map(|n| n.id()).collect();
        assert!(ids.contains(&"work"));
        assert!(ids.contains(&"escalate"));
        assert_eq!(def.find_attached_activity("escalate").unwrap().id, "work");
    }

    #[test]
    fn following_activities_is_transitive() {
        let def = load_process_definition(order_process()).unwrap();
        let following = def.find_all_following_activities("receive_order");
        let ids: Vec<&str> = following.iter().map(|a| a.id.as_str()).collect();
        assert!(ids.contains(&"check_stock"));
        assert!(ids.contains(&"ship_order"));
        assert!(!ids.contains(&"receive_order"));
    }

    #[test]
    fn find_sequences_filters_by_endpoint() {
        let def = load_process_definition(order_process()).unwrap();
        assert_eq!(def.find_sequences(Some("receive_order"), None).len(), 1);
        assert_eq!(def.find_sequences(None, Some("receive_order")).len(), 1);
        assert_eq!(
            def.find_sequences(Some("gw_stock"), Some("check_stock")).len(),
            1
        );
    }
}
