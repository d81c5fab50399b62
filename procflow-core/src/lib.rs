//! procflow-core: a BPMN-style process orchestration engine.
//!
//! Process definitions are declarative graphs; progress happens through
//! polled work items in a shared relational store, so many worker replicas
//! cooperate through row-level claims rather than in-process coordination.
//! The reasoning layer, agent transport, and script executor are external
//! collaborators behind the traits in [`advisor`] and [`script`].

pub mod advisor;
pub mod agent;
pub mod compensation;
pub mod config;
pub mod definition;
pub mod dispatcher;
pub mod extract;
pub mod graph;
pub mod handler;
pub mod join;
pub mod logwriter;
pub mod mailer;
pub mod resolver;
pub mod script;
pub mod store;
pub mod store_memory;
#[cfg(feature = "postgres")]
pub mod store_postgres;
pub mod types;

pub use store::ProcessStore;
pub use types::{
    AgentMode, DecisionPayload, InstanceStatus, ProcessInstance, WorkItem, WorkItemStatus,
};
