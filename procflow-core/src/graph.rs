//! Process graph, feedback-edge inference, and block discovery.
//!
//! The definition is a general directed graph with loops. It is materialized
//! into a petgraph `StableDiGraph` keyed by node id; traversals carry explicit
//! visited sets and never rely on reference identity.
//!
//! A *feedback* flow closes a cycle and is excluded from forward traversals.
//! Inference marks such flows with an internal flag so the block finder and
//! the join evaluator see an acyclic forward view.

use crate::definition::ProcessDefinition;
use petgraph::stable_graph::{EdgeIndex, NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet, VecDeque};

// ─── Options ──────────────────────────────────────────────────

/// Cycle-breaking strategy for feedback inference.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeedbackStrategy {
    /// BFS level labels from the start nodes; a flow `s → t` with
    /// `level(s) ≥ level(t)` that closes a cycle is feedback.
    LevelBased,
    /// Mark exactly one back-edge: the candidate farthest from the start
    /// and closest to the end.
    SingleBest,
    /// Repeatedly mark one back-edge and recompute until acyclic.
    IterativeBreak,
    /// Mark every edge participating in a cycle.
    AllBackEdges,
}

#[derive(Clone, Copy, Debug)]
pub struct FeedbackOptions {
    pub strategy: FeedbackStrategy,
    /// Deterministic candidate ordering by `(source id, target id)`.
    pub stable_tiebreak: bool,
}

impl Default for FeedbackOptions {
    fn default() -> Self {
        Self {
            strategy: FeedbackStrategy::LevelBased,
            stable_tiebreak: true,
        }
    }
}

// ─── Graph node / flow weights ────────────────────────────────

#[derive(Clone, Debug)]
pub struct GraphNode {
    pub id: String,
    pub node_type: Option<String>,
}

impl GraphNode {
    fn type_lower(&self) -> String {
        self.node_type.as_deref().unwrap_or("").to_lowercase()
    }
}

#[derive(Clone, Debug)]
pub struct GraphFlow {
    pub id: String,
    pub properties: Map<String, Value>,
    pub inferred_feedback: bool,
}

impl GraphFlow {
    /// Explicit feedback hint from the sequence properties: the
    /// `isFeedback`/`feedback` keys, or a `type` of feedback/back/rollback.
    fn explicit_feedback(&self) -> bool {
        for key in ["isFeedback", "feedback"] {
            if let Some(v) = self.properties.get(key) {
                if is_truthy(v) || is_feedback_word(v) {
                    return true;
                }
            }
        }
        self.properties
            .get("type")
            .map(is_feedback_word)
            .unwrap_or(false)
    }

    pub fn is_feedback(&self) -> bool {
        self.inferred_feedback || self.explicit_feedback()
    }
}

fn is_truthy(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::String(s) => matches!(s.trim().to_lowercase().as_str(), "true" | "1" | "yes" | "y"),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        _ => false,
    }
}

fn is_feedback_word(v: &Value) -> bool {
    matches!(
        v.as_str().map(|s| s.trim().to_lowercase()),
        Some(ref s) if matches!(s.as_str(), "feedback" | "back" | "rollback")
    )
}

fn normalize_properties(props: Option<&Value>) -> Map<String, Value> {
    match props {
        Some(Value::Object(m)) => m.clone(),
        Some(Value::String(s)) if !s.trim().is_empty() => {
            serde_json::from_str::<Value>(s)
                .ok()
                .and_then(|v| v.as_object().cloned())
                .unwrap_or_default()
        }
        _ => Map::new(),
    }
}

// ─── Process graph ────────────────────────────────────────────

pub struct ProcessGraph {
    graph: StableDiGraph<GraphNode, GraphFlow>,
    index: HashMap<String, NodeIndex>,
    pub options: FeedbackOptions,
}

impl ProcessGraph {
    pub fn from_definition(def: &ProcessDefinition) -> Self {
        Self::from_definition_with(def, FeedbackOptions::default())
    }

    pub fn from_definition_with(def: &ProcessDefinition, options: FeedbackOptions) -> Self {
        let mut g = Self {
            graph: StableDiGraph::new(),
            index: HashMap::new(),
            options,
        };
        for a in &def.activities {
            g.ensure_node(&a.id, Some(&a.activity_type));
        }
        for gw in &def.gateways {
            if let Some(id) = gw.id.as_deref() {
                g.ensure_node(id, gw.gateway_type.as_deref());
            }
        }
        for sp in &def.sub_processes {
            g.ensure_node(&sp.id, Some(&sp.sub_process_type));
        }
        for seq in &def.sequences {
            let flow_id = seq
                .id
                .clone()
                .unwrap_or_else(|| format!("{}->{}", seq.source, seq.target));
            g.add_flow(&seq.source, &seq.target, &flow_id, seq.properties.as_ref());
        }
        g.recompute_feedback();
        g
    }

    /// Build directly from `(id, type)` nodes and `(source, target)` edges.
    pub fn from_parts(nodes: &[(&str, &str)], edges: &[(&str, &str)]) -> Self {
        Self::from_parts_with(nodes, edges, FeedbackOptions::default())
    }

    pub fn from_parts_with(
        nodes: &[(&str, &str)],
        edges: &[(&str, &str)],
        options: FeedbackOptions,
    ) -> Self {
        let mut g = Self {
            graph: StableDiGraph::new(),
            index: HashMap::new(),
            options,
        };
        for (id, ty) in nodes {
            g.ensure_node(id, Some(*ty));
        }
        for (src, tgt) in edges {
            g.add_flow(src, tgt, &format!("{src}->{tgt}"), None);
        }
        g.recompute_feedback();
        g
    }

    fn ensure_node(&mut self, id: &str, node_type: Option<&str>) -> NodeIndex {
        if let Some(&idx) = self.index.get(id) {
            if self.graph[idx].node_type.is_none() {
                self.graph[idx].node_type = node_type.map(str::to_string);
            }
            return idx;
        }
        let idx = self.graph.add_node(GraphNode {
            id: id.to_string(),
            node_type: node_type.map(str::to_string),
        });
        self.index.insert(id.to_string(), idx);
        idx
    }

    fn add_flow(&mut self, source: &str, target: &str, flow_id: &str, props: Option<&Value>) {
        let s = self.ensure_node(source, None);
        let t = self.ensure_node(target, None);
        self.graph.add_edge(
            s,
            t,
            GraphFlow {
                id: flow_id.to_string(),
                properties: normalize_properties(props),
                inferred_feedback: false,
            },
        );
    }

    pub fn resolve(&self, id: &str) -> Option<NodeIndex> {
        self.index.get(id).copied()
    }

    pub fn node(&self, idx: NodeIndex) -> &GraphNode {
        &self.graph[idx]
    }

    pub fn is_gateway(&self, idx: NodeIndex) -> bool {
        self.graph[idx].type_lower().contains("gateway")
    }

    pub fn is_event(&self, idx: NodeIndex) -> bool {
        self.graph[idx].type_lower().contains("event")
    }

    fn is_start(&self, idx: NodeIndex) -> bool {
        self.graph[idx].type_lower().contains("start")
    }

    fn is_end_event(&self, idx: NodeIndex) -> bool {
        let t = self.graph[idx].type_lower();
        t.contains("end") && t.contains("event")
    }

    fn flow(&self, edge: EdgeIndex) -> &GraphFlow {
        &self.graph[edge]
    }

    /// All feedback flows (explicit plus inferred) as `(source, target)` ids.
    pub fn feedback_flows(&self) -> Vec<(String, String)> {
        self.graph
            .edge_indices()
            .filter(|&e| self.flow(e).is_feedback())
            .filter_map(|e| self.graph.edge_endpoints(e))
            .map(|(s, t)| (self.graph[s].id.clone(), self.graph[t].id.clone()))
            .collect()
    }

    /// Only the flows marked by inference.
    pub fn inferred_feedback_flows(&self) -> Vec<(String, String)> {
        self.graph
            .edge_indices()
            .filter(|&e| self.flow(e).inferred_feedback)
            .filter_map(|e| self.graph.edge_endpoints(e))
            .map(|(s, t)| (self.graph[s].id.clone(), self.graph[t].id.clone()))
            .collect()
    }

    pub fn non_feedback_in_degree(&self, id: &str) -> usize {
        self.resolve(id)
            .map(|idx| self.incoming_non_feedback(idx).len())
            .unwrap_or(0)
    }

    fn incoming_non_feedback(&self, idx: NodeIndex) -> Vec<(EdgeIndex, NodeIndex)> {
        self.graph
            .edges_directed(idx, Direction::Incoming)
            .filter(|e| !e.weight().is_feedback())
            .map(|e| (e.id(), e.source()))
            .collect()
    }

    fn outgoing_non_feedback(&self, idx: NodeIndex) -> Vec<(EdgeIndex, NodeIndex)> {
        self.graph
            .edges_directed(idx, Direction::Outgoing)
            .filter(|e| !e.weight().is_feedback())
            .map(|e| (e.id(), e.target()))
            .collect()
    }

    /// Forward BFS to the nearest gateway with ≥2 non-feedback incoming flows.
    pub fn find_nearest_join(&self, id: &str) -> Option<String> {
        const MAX_DEPTH: usize = 1000;
        let start = self.resolve(id)?;
        let mut visited = HashSet::from([start]);
        let mut queue = VecDeque::from([(start, 0usize)]);
        while let Some((current, depth)) = queue.pop_front() {
            if depth > 0
                && self.is_gateway(current)
                && self.incoming_non_feedback(current).len() >= 2
            {
                return Some(self.graph[current].id.clone());
            }
            if depth >= MAX_DEPTH {
                continue;
            }
            for (_, next) in self.outgoing_non_feedback(current) {
                if visited.insert(next) {
                    queue.push_back((next, depth + 1));
                }
            }
        }
        None
    }

    /// Activity and sub-process nodes upstream of `id`, walking only
    /// non-feedback flows so a loop cannot fold downstream work into the
    /// set. Gateways and events are traversed but not collected.
    pub fn upstream_nodes(&self, id: &str) -> Vec<String> {
        let Some(start) = self.resolve(id) else {
            return vec![];
        };
        let mut visited = HashSet::from([start]);
        let mut queue = VecDeque::from([start]);
        let mut upstream = Vec::new();
        while let Some(current) = queue.pop_front() {
            for (_, source) in self.incoming_non_feedback(current) {
                if !visited.insert(source) {
                    continue;
                }
                if !self.is_gateway(source) && !self.is_event(source) {
                    upstream.push(self.graph[source].id.clone());
                }
                queue.push_back(source);
            }
        }
        upstream
    }

    // ── Distance maps ──

    fn start_seeds(&self) -> Vec<NodeIndex> {
        let typed: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|&n| self.is_start(n))
            .collect();
        if !typed.is_empty() {
            return typed;
        }
        let rootless: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|&n| self.incoming_non_feedback(n).is_empty())
            .collect();
        if !rootless.is_empty() {
            return rootless;
        }
        self.graph.node_indices().collect()
    }

    fn end_seeds(&self) -> Vec<NodeIndex> {
        let typed: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|&n| self.is_end_event(n))
            .collect();
        if !typed.is_empty() {
            return typed;
        }
        let sinks: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|&n| self.outgoing_non_feedback(n).is_empty())
            .collect();
        if !sinks.is_empty() {
            return sinks;
        }
        self.graph.node_indices().collect()
    }

    fn bfs_levels(&self, seeds: &[NodeIndex], direction: Direction) -> HashMap<NodeIndex, usize> {
        let mut level: HashMap<NodeIndex, usize> = HashMap::new();
        let mut queue: VecDeque<NodeIndex> = VecDeque::new();
        for &s in seeds {
            level.insert(s, 0);
            queue.push_back(s);
        }
        while let Some(current) = queue.pop_front() {
            let next_level = level[&current] + 1;
            let neighbours: Vec<NodeIndex> = match direction {
                Direction::Outgoing => self
                    .outgoing_non_feedback(current)
                    .into_iter()
                    .map(|(_, n)| n)
                    .collect(),
                Direction::Incoming => self
                    .incoming_non_feedback(current)
                    .into_iter()
                    .map(|(_, n)| n)
                    .collect(),
            };
            for n in neighbours {
                if level.get(&n).map(|&l| l > next_level).unwrap_or(true) {
                    level.insert(n, next_level);
                    queue.push_back(n);
                }
            }
        }
        level
    }

    /// BFS distance from the start nodes along non-feedback flows.
    pub fn distance_from_start(&self, id: &str) -> Option<usize> {
        let idx = self.resolve(id)?;
        self.bfs_levels(&self.start_seeds(), Direction::Outgoing)
            .get(&idx)
            .copied()
    }

    /// Reverse-BFS distance to the end nodes along non-feedback flows.
    pub fn distance_to_end(&self, id: &str) -> Option<usize> {
        let idx = self.resolve(id)?;
        self.bfs_levels(&self.end_seeds(), Direction::Incoming)
            .get(&idx)
            .copied()
    }

    // ── Feedback inference ──

    /// Clear previous inference and re-mark according to the current options.
    pub fn recompute_feedback(&mut self) {
        let edges: Vec<EdgeIndex> = self.graph.edge_indices().collect();
        for e in &edges {
            self.graph[*e].inferred_feedback = false;
        }
        match self.options.strategy {
            FeedbackStrategy::LevelBased => self.mark_level_based(),
            FeedbackStrategy::SingleBest => {
                if let Some(e) = self.best_candidate() {
                    self.graph[e].inferred_feedback = true;
                }
            }
            FeedbackStrategy::IterativeBreak => loop {
                if !self.has_cycle() {
                    break;
                }
                // A cycle routed through an event node has no candidates;
                // bail out instead of spinning.
                let Some(e) = self.best_candidate() else { break };
                self.graph[e].inferred_feedback = true;
            },
            FeedbackStrategy::AllBackEdges => {
                for e in edges {
                    if self.is_cycle_edge(e) {
                        self.graph[e].inferred_feedback = true;
                    }
                }
            }
        }
    }

    fn mark_level_based(&mut self) {
        let level = self.bfs_levels(&self.start_seeds(), Direction::Outgoing);
        // Marks are applied as candidates confirm, so a flow cut earlier in
        // the stable order no longer offers a return path to later ones.
        for e in self.candidate_edges() {
            let (s, t) = match self.graph.edge_endpoints(e) {
                Some(pair) => pair,
                None => continue,
            };
            let back_level = matches!(
                (level.get(&s), level.get(&t)),
                (Some(&ls), Some(&lt)) if ls >= lt
            );
            if back_level && self.closes_cycle(e) {
                self.graph[e].inferred_feedback = true;
            }
        }
    }

    /// Candidate back-edges: not already feedback, and neither endpoint is an
    /// event node (timer and message events must never be cut).
    fn candidate_edges(&self) -> Vec<EdgeIndex> {
        let mut edges: Vec<EdgeIndex> = self
            .graph
            .edge_indices()
            .filter(|&e| !self.flow(e).is_feedback())
            .filter(|&e| {
                let (s, t) = self.graph.edge_endpoints(e).expect("edge exists");
                !self.is_event(s) && !self.is_event(t)
            })
            .collect();
        if self.options.stable_tiebreak {
            edges.sort_by(|&a, &b| {
                let (sa, ta) = self.graph.edge_endpoints(a).expect("edge exists");
                let (sb, tb) = self.graph.edge_endpoints(b).expect("edge exists");
                (&self.graph[sa].id, &self.graph[ta].id).cmp(&(&self.graph[sb].id, &self.graph[tb].id))
            });
        }
        edges
    }

    /// The highest-scoring cycle-closing candidate: farthest source from the
    /// start, then nearest target to the end, then stable id order.
    fn best_candidate(&self) -> Option<EdgeIndex> {
        let from_start = self.bfs_levels(&self.start_seeds(), Direction::Outgoing);
        let to_end = self.bfs_levels(&self.end_seeds(), Direction::Incoming);
        self.candidate_edges()
            .into_iter()
            .filter(|&e| self.closes_cycle(e))
            .min_by_key(|&e| {
                let (s, t) = self.graph.edge_endpoints(e).expect("edge exists");
                let ds = from_start.get(&s).copied().unwrap_or(0);
                let de = to_end.get(&t).copied().unwrap_or(usize::MAX);
                (usize::MAX - ds, de)
            })
    }

    /// True when removing `edge` still leaves a non-feedback, event-free path
    /// from its target back to its source, i.e. the edge closes a cycle.
    fn closes_cycle(&self, edge: EdgeIndex) -> bool {
        let (source, target) = match self.graph.edge_endpoints(edge) {
            Some(pair) => pair,
            None => return false,
        };
        self.reaches(target, source, Some(edge), true)
    }

    /// True when the edge participates in any cycle (its target reaches its
    /// source without using feedback flows or passing through events).
    fn is_cycle_edge(&self, edge: EdgeIndex) -> bool {
        let (source, target) = match self.graph.edge_endpoints(edge) {
            Some(pair) => pair,
            None => return false,
        };
        self.reaches(target, source, None, true)
    }

    fn reaches(
        &self,
        from: NodeIndex,
        to: NodeIndex,
        skip_edge: Option<EdgeIndex>,
        avoid_events: bool,
    ) -> bool {
        if from == to {
            return true;
        }
        let mut seen = HashSet::from([from]);
        let mut queue = VecDeque::from([from]);
        while let Some(current) = queue.pop_front() {
            for e in self.graph.edges_directed(current, Direction::Outgoing) {
                if Some(e.id()) == skip_edge || e.weight().is_feedback() {
                    continue;
                }
                let next = e.target();
                if next == to {
                    return true;
                }
                if avoid_events && self.is_event(next) {
                    continue;
                }
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        false
    }

    /// Kahn's algorithm over the non-feedback view.
    pub fn has_cycle(&self) -> bool {
        let mut indegree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|n| (n, self.incoming_non_feedback(n).len()))
            .collect();
        let mut queue: VecDeque<NodeIndex> = indegree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(&n, _)| n)
            .collect();
        let mut seen = 0usize;
        while let Some(current) = queue.pop_front() {
            seen += 1;
            for (_, next) in self.outgoing_non_feedback(current) {
                let d = indegree.get_mut(&next).expect("node present");
                *d -= 1;
                if *d == 0 {
                    queue.push_back(next);
                }
            }
        }
        seen < self.graph.node_count()
    }
}

// ─── Block discovery ──────────────────────────────────────────

/// The sub-graph between a split gateway and its matching join.
#[derive(Clone, Debug, PartialEq)]
pub struct BlockResult {
    pub start_container_id: Option<String>,
    pub end_container_id: String,
    pub branch_count: usize,
    pub block_members: Vec<String>,
    pub possible_block_members: Vec<String>,
}

impl BlockResult {
    /// Split, members, possible members, and the join itself, deduped in order.
    pub fn node_ids(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut ordered = Vec::new();
        let mut push = |id: &str, seen: &mut HashSet<String>, ordered: &mut Vec<String>| {
            if seen.insert(id.to_string()) {
                ordered.push(id.to_string());
            }
        };
        if let Some(start) = &self.start_container_id {
            push(start, &mut seen, &mut ordered);
        }
        for id in &self.block_members {
            push(id, &mut seen, &mut ordered);
        }
        for id in &self.possible_block_members {
            push(id, &mut seen, &mut ordered);
        }
        push(&self.end_container_id, &mut seen, &mut ordered);
        ordered
    }
}

pub struct BlockFinder {
    pub graph: ProcessGraph,
}

impl BlockFinder {
    pub fn new(def: &ProcessDefinition) -> Self {
        Self {
            graph: ProcessGraph::from_definition(def),
        }
    }

    pub fn with_graph(graph: ProcessGraph) -> Self {
        Self { graph }
    }

    /// Identify the split matching `join_id` and everything between them.
    ///
    /// The returned block never contains start or end events; when no split
    /// can be found the result still carries the join and branch count with
    /// empty member lists.
    pub fn find_block(&self, join_id: &str) -> Option<BlockResult> {
        let g = &self.graph;
        let join = g.resolve(join_id)?;

        let incoming = g.incoming_non_feedback(join);
        let mut branch_count = incoming.len();
        if branch_count < 2 {
            if let Some(&(_, gw)) = incoming.iter().find(|&&(_, src)| g.is_gateway(src)) {
                branch_count = g.incoming_non_feedback(gw).len();
            }
        }

        // Walk backwards: the nearest node whose non-feedback outgoing flows
        // that still reach the join number exactly branch_count is the split.
        let mut visited: HashSet<NodeIndex> = HashSet::new();
        let mut queue = VecDeque::from([join]);
        let mut split: Option<NodeIndex> = None;

        while let Some(node) = queue.pop_front() {
            if !visited.insert(node) {
                continue;
            }
            let outs = g.outgoing_non_feedback(node);
            let out_to_join = outs
                .iter()
                .filter(|&&(_, target)| g.reaches(target, join, None, false))
                .count();
            if out_to_join == branch_count && !outs.is_empty() {
                split = Some(node);
                break;
            }
            for (_, src) in g.incoming_non_feedback(node) {
                if !visited.contains(&src) {
                    queue.push_back(src);
                }
            }
        }

        let Some(split) = split else {
            return Some(BlockResult {
                start_container_id: None,
                end_container_id: g.node(join).id.clone(),
                branch_count,
                block_members: vec![],
                possible_block_members: vec![],
            });
        };

        // Immediate non-gateway children of the split that can reach the join.
        let mut possible: Vec<String> = Vec::new();
        if g.is_gateway(split) {
            for (_, target) in g.outgoing_non_feedback(split) {
                if !g.is_gateway(target) && g.reaches(target, join, None, false) {
                    let id = g.node(target).id.clone();
                    if !possible.contains(&id) {
                        possible.push(id);
                    }
                }
            }
        }

        // Forward sweep from the split over nodes that can still reach the join.
        let mut members: Vec<String> = Vec::new();
        let mut fwd_visited: HashSet<NodeIndex> = HashSet::new();
        let mut fwd_queue = VecDeque::from([split]);
        while let Some(current) = fwd_queue.pop_front() {
            if !fwd_visited.insert(current) {
                continue;
            }
            if current != split && current != join {
                members.push(g.node(current).id.clone());
            }
            if current == join {
                continue;
            }
            for (_, next) in g.outgoing_non_feedback(current) {
                if (next == join || g.reaches(next, join, None, false))
                    && !fwd_visited.contains(&next)
                {
                    fwd_queue.push_back(next);
                }
            }
        }
        for id in &possible {
            if !members.contains(id) {
                members.push(id.clone());
            }
        }

        Some(BlockResult {
            start_container_id: Some(g.node(split).id.clone()),
            end_container_id: g.node(join).id.clone(),
            branch_count,
            block_members: members,
            possible_block_members: possible,
        })
    }

    /// The incoming branch structure of a join: one entry per non-feedback
    /// inflow, recursing through nested gateways so a join fed by another
    /// join sees that join's branches under its own semantics. Events pass
    /// through transparently (they hold no work).
    pub fn join_branches(&self, join_id: &str) -> Vec<JoinBranch> {
        let Some(join) = self.graph.resolve(join_id) else {
            return vec![];
        };
        let mut visited = HashSet::from([join]);
        self.branches_into(join, &mut visited)
    }

    fn branches_into(
        &self,
        node: NodeIndex,
        visited: &mut HashSet<NodeIndex>,
    ) -> Vec<JoinBranch> {
        let g = &self.graph;
        let mut branches = Vec::new();
        for (_, source) in g.incoming_non_feedback(node) {
            if !visited.insert(source) {
                continue;
            }
            if g.is_gateway(source) {
                branches.push(JoinBranch::Nested {
                    gateway_type: g.node(source).node_type.clone().unwrap_or_default(),
                    branches: self.branches_into(source, visited),
                });
            } else if g.is_event(source) {
                branches.extend(self.branches_into(source, visited));
            } else {
                branches.push(JoinBranch::Node(g.node(source).id.clone()));
            }
        }
        branches
    }
}

/// One incoming branch of a join: a concrete work node, or a nested gateway
/// whose own branches combine under that gateway's join semantics.
#[derive(Clone, Debug, PartialEq)]
pub enum JoinBranch {
    Node(String),
    Nested {
        gateway_type: String,
        branches: Vec<JoinBranch>,
    },
}

impl JoinBranch {
    /// All concrete node ids under this branch, depth first.
    pub fn collect_leaves(&self, out: &mut Vec<String>) {
        match self {
            JoinBranch::Node(id) => out.push(id.clone()),
            JoinBranch::Nested { branches, .. } => {
                for branch in branches {
                    branch.collect_leaves(out);
                }
            }
        }
    }
}
