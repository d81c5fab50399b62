//! Join-gateway semantics: may the branch after a join proceed, given the
//! statuses of the sibling branches feeding it?

use crate::graph::JoinBranch;
use crate::types::WorkItemStatus;
use std::collections::HashMap;

/// Join flavour of a gateway, derived from its type tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinKind {
    Parallel,
    Inclusive,
    Exclusive,
}

impl JoinKind {
    pub fn from_gateway_type(gateway_type: &str) -> Option<JoinKind> {
        let t = gateway_type.to_lowercase();
        if t.contains("parallel") {
            Some(JoinKind::Parallel)
        } else if t.contains("inclusive") {
            Some(JoinKind::Inclusive)
        } else if t.contains("exclusive") || t == "xor" || t == "xorgateway" {
            Some(JoinKind::Exclusive)
        } else {
            None
        }
    }
}

/// A branch is settled once its work item reached `DONE`/`SUBMITTED`, or the
/// sibling instance reports `COMPLETED`.
fn is_settled(status: &str) -> bool {
    matches!(status, "DONE" | "SUBMITTED" | "COMPLETED")
}

fn is_in_progress(status: &str) -> bool {
    status == "IN_PROGRESS"
}

/// The proceed policy, over the sibling branches' current status strings:
///
/// - parallel: every branch settled; any `TODO`/`PENDING`/`IN_PROGRESS` blocks.
/// - inclusive: at least one branch settled and none `IN_PROGRESS`; a `TODO`
///   elsewhere does not block once another branch is done.
/// - exclusive: single-path semantics, sibling states are ignored.
pub fn join_may_proceed(kind: JoinKind, branch_statuses: &[&str]) -> bool {
    match kind {
        JoinKind::Parallel => branch_statuses.iter().all(|s| is_settled(s)),
        JoinKind::Inclusive => {
            branch_statuses.iter().any(|s| is_settled(s))
                && !branch_statuses.iter().any(|s| is_in_progress(s))
        }
        JoinKind::Exclusive => true,
    }
}

/// Typed convenience over work-item statuses.
pub fn join_may_proceed_statuses(kind: JoinKind, statuses: &[WorkItemStatus]) -> bool {
    let strs: Vec<&str> = statuses.iter().map(|s| s.as_str()).collect();
    join_may_proceed(kind, &strs)
}

/// Representative status of one join branch, given the leaf statuses.
///
/// A plain node reports its work item's status (`TODO` when none exists).
/// A nested gateway settles to `DONE` once its own policy proceeds with at
/// least one settled sub-branch; otherwise it reports `IN_PROGRESS` while
/// any sub-branch runs, and `TODO` before anything started. This is what
/// lets an exclusive sub-block inside a parallel join settle without a work
/// item ever existing on its untaken branch.
pub fn resolve_branch_status(branch: &JoinBranch, statuses: &HashMap<String, String>) -> String {
    match branch {
        JoinBranch::Node(id) => statuses
            .get(id)
            .cloned()
            .unwrap_or_else(|| "TODO".to_string()),
        JoinBranch::Nested {
            gateway_type,
            branches,
        } => {
            let subs: Vec<String> = branches
                .iter()
                .map(|b| resolve_branch_status(b, statuses))
                .collect();
            let refs: Vec<&str> = subs.iter().map(String::as_str).collect();
            let kind = JoinKind::from_gateway_type(gateway_type).unwrap_or(JoinKind::Exclusive);
            if join_may_proceed(kind, &refs) && refs.iter().any(|s| is_settled(s)) {
                "DONE".to_string()
            } else if refs.iter().any(|s| is_in_progress(s)) {
                "IN_PROGRESS".to_string()
            } else {
                "TODO".to_string()
            }
        }
    }
}
