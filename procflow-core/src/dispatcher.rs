//! Polling dispatcher: the long-running loop each worker replica drives.
//!
//! Every cycle claims due work items (SUBMITTED for the LLM path, A2A
//! IN_PROGRESS for the agent path), runs their handlers concurrently, waits
//! for the batch, and sleeps. A sibling loop releases stale leases. Shutdown
//! is cooperative: no new claims after the signal, in-flight handlers drain.

use crate::agent::AgentDispatcher;
use crate::handler::{WorkItemHandler, RETRY_LIMIT};
use crate::store::ProcessStore;
use crate::types::*;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;

#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    pub consumer_id: String,
    pub poll_interval: Duration,
    pub cleanup_interval: Duration,
    pub stale_claim_age: chrono::Duration,
    pub claim_batch: i64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            consumer_id: "procflow-worker".to_string(),
            poll_interval: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(300),
            stale_claim_age: chrono::Duration::minutes(30),
            claim_batch: 5,
        }
    }
}

pub struct Dispatcher {
    store: Arc<dyn ProcessStore>,
    handler: Arc<WorkItemHandler>,
    agent: Arc<AgentDispatcher>,
    config: DispatcherConfig,
    shutdown: watch::Receiver<bool>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn ProcessStore>,
        handler: Arc<WorkItemHandler>,
        agent: Arc<AgentDispatcher>,
        config: DispatcherConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            handler,
            agent,
            config,
            shutdown,
        }
    }

    /// The main polling loop. Returns once shutdown is signalled and the
    /// current batch has drained.
    pub async fn run(&self) -> Result<()> {
        tracing::info!(consumer = %self.config.consumer_id, "dispatcher started");
        let mut shutdown = self.shutdown.clone();
        while !*shutdown.borrow() {
            if let Err(error) = self.poll_once().await {
                tracing::error!(%error, "polling cycle failed");
            }
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }
        tracing::info!("dispatcher stopped");
        Ok(())
    }

    /// One claim cycle: claim both selectors, spawn a handler per item,
    /// await the whole batch.
    pub async fn poll_once(&self) -> Result<usize> {
        let mut items = self
            .store
            .claim_submitted(self.config.claim_batch, &self.config.consumer_id)
            .await?;
        items.extend(
            self.store
                .claim_agent_in_progress(self.config.claim_batch, &self.config.consumer_id)
                .await?,
        );
        if items.is_empty() {
            return Ok(0);
        }

        let mut batch: JoinSet<()> = JoinSet::new();
        let mut spawned = 0usize;
        for item in items {
            if *self.shutdown.borrow() {
                tracing::info!("shutdown in progress, skipping remaining claims");
                // Claimed but never started: give the lease back right away.
                let _ = self
                    .store
                    .patch_workitem(item.id, &WorkItemPatch::release_consumer(), &item.tenant_id)
                    .await;
                continue;
            }
            let store = self.store.clone();
            let handler = self.handler.clone();
            let agent = self.agent.clone();
            batch.spawn(async move {
                run_one(store, handler, agent, item).await;
            });
            spawned += 1;
        }
        while batch.join_next().await.is_some() {}
        Ok(spawned)
    }

    /// The stale-lease sweeper; runs at its own cadence until shutdown.
    pub async fn run_cleanup(&self) {
        let mut shutdown = self.shutdown.clone();
        while !*shutdown.borrow() {
            match self
                .store
                .release_stale_claims(self.config.stale_claim_age)
                .await
            {
                Ok(0) => {}
                Ok(released) => tracing::info!(released, "released stale consumers"),
                Err(error) => tracing::error!(%error, "stale-consumer cleanup failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.cleanup_interval) => {}
                _ = shutdown.changed() => {}
            }
        }
    }
}

/// Per-item wrapper: route to the right handler, convert failures into
/// retries, and always release the lease.
async fn run_one(
    store: Arc<dyn ProcessStore>,
    handler: Arc<WorkItemHandler>,
    agent: Arc<AgentDispatcher>,
    item: WorkItem,
) {
    let tenant_id = item.tenant_id.clone();
    if let Err(error) = store
        .patch_workitem(
            item.id,
            &WorkItemPatch::log(format!("Executing '{}'...", item.activity_name)),
            &tenant_id,
        )
        .await
    {
        tracing::warn!(workitem = %item.id, %error, "failed to write start log");
    }

    let outcome = match (item.status, item.agent_mode) {
        (WorkItemStatus::Submitted, _) => handler.handle(&item).await,
        (WorkItemStatus::InProgress, Some(AgentMode::A2a)) => agent.handle(&item).await,
        _ => {
            tracing::warn!(workitem = %item.id, status = ?item.status,
                "claimed item matches no handler");
            Ok(())
        }
    };

    if let Err(error) = outcome {
        let retry = item.retry + 1;
        let mut patch = WorkItemPatch::default();
        patch.retry = Some(retry);
        patch.consumer = Some(None);
        if retry >= RETRY_LIMIT {
            // The retry cap collapses failures into terminal state; the item
            // becomes a compensation candidate rather than a zombie.
            patch.status = Some(WorkItemStatus::Done);
            patch.log = Some(format!("[Error] handler failed for '{}': {error}", item.id));
        } else {
            patch.log = Some("execution failed, will retry".to_string());
        }
        if let Err(patch_error) = store.patch_workitem(item.id, &patch, &tenant_id).await {
            tracing::error!(workitem = %item.id, %patch_error, "failed to record handler failure");
        }
        tracing::error!(workitem = %item.id, %error, retry, "handler failed");
    }

    // Lease release happens in every outcome.
    if let Err(error) = store
        .patch_workitem(item.id, &WorkItemPatch::release_consumer(), &tenant_id)
        .await
    {
        tracing::error!(workitem = %item.id, %error, "failed to release consumer lease");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisor::{
        AgentRequestBuilder, AgentResponseNormalizer, DecisionContext, NextStepAdvisor,
    };
    use crate::agent::AgentChannel;
    use crate::logwriter::LogSink;
    use crate::resolver::NextStepResolver;
    use crate::store_memory::MemoryStore;
    use async_trait::async_trait;
    use serde_json::json;

    struct FailingAdvisor;
    #[async_trait]
    impl NextStepAdvisor for FailingAdvisor {
        async fn advise(&self, _: &DecisionContext, _: &LogSink) -> Result<String> {
            anyhow::bail!("reasoning layer unavailable")
        }
    }

    struct NullBuilder;
    #[async_trait]
    impl AgentRequestBuilder for NullBuilder {
        async fn build_request(&self, _: &WorkItem, _: &serde_json::Value) -> Result<String> {
            Ok(String::new())
        }
    }
    struct NullNormalizer;
    #[async_trait]
    impl AgentResponseNormalizer for NullNormalizer {
        async fn normalize(&self, _: &str) -> Result<String> {
            Ok("{}".to_string())
        }
    }
    struct NullChannel;
    #[async_trait]
    impl AgentChannel for NullChannel {
        async fn send(&self, _: &str, _: &str, _: &str, _: &str) -> Result<String> {
            Ok(String::new())
        }
    }

    fn simple_definition() -> serde_json::Value {
        json!({
            "processDefinitionName": "Simple",
            "processDefinitionId": "simple",
            "roles": [{"name": "worker", "endpoint": "w@x.test"}],
            "activities": [
                {"id": "draft", "name": "Draft", "type": "userTask", "role": "worker"},
                {"id": "review", "name": "Review", "type": "userTask", "role": "worker"}
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

    async fn dispatcher_with(
        store: Arc<MemoryStore>,
        shutdown: watch::Receiver<bool>,
    ) -> Dispatcher {
        store.seed_definition("simple", "t1", simple_definition()).await;
        let resolver = Arc::new(NextStepResolver::new(store.clone(), None, None));
        let handler = Arc::new(WorkItemHandler::new(
            store.clone(),
            Arc::new(FailingAdvisor),
            resolver,
        ));
        let agent = Arc::new(AgentDispatcher::new(
            store.clone(),
            Arc::new(NullBuilder),
            Arc::new(NullNormalizer),
            Arc::new(NullChannel),
        ));
        Dispatcher::new(
            store,
            handler,
            agent,
            DispatcherConfig {
                consumer_id: "pod-test".to_string(),
                poll_interval: Duration::from_millis(10),
                cleanup_interval: Duration::from_millis(10),
                ..DispatcherConfig::default()
            },
            shutdown,
        )
    }

    fn submitted(retry: i32) -> WorkItem {
        let mut item = WorkItem::new(
            "simple.d1",
            "simple",
            "draft",
            "Draft",
            WorkItemStatus::Submitted,
            "t1",
        );
        item.retry = retry;
        item
    }

    #[tokio::test]
    async fn handler_failure_bumps_retry_and_releases_the_lease() {
        let store = Arc::new(MemoryStore::new());
        let item = submitted(0);
        store.upsert_workitem(&item).await.unwrap();

        let (_tx, rx) = watch::channel(false);
        let dispatcher = dispatcher_with(store.clone(), rx).await;
        let handled = dispatcher.poll_once().await.unwrap();
        assert_eq!(handled, 1);

        let after = store.fetch_workitem(item.id).await.unwrap().unwrap();
        assert_eq!(after.retry, 1);
        assert!(after.consumer.is_none());
        assert_eq!(after.status, WorkItemStatus::Submitted);
    }

    #[tokio::test]
    async fn third_failure_is_terminal() {
        let store = Arc::new(MemoryStore::new());
        let item = submitted(2);
        store.upsert_workitem(&item).await.unwrap();

        let (_tx, rx) = watch::channel(false);
        let dispatcher = dispatcher_with(store.clone(), rx).await;
        dispatcher.poll_once().await.unwrap();

        let after = store.fetch_workitem(item.id).await.unwrap().unwrap();
        assert_eq!(after.retry, 3);
        assert_eq!(after.status, WorkItemStatus::Done);
        assert!(after.log.unwrap().starts_with("[Error]"));
        assert!(after.consumer.is_none());
    }

    #[tokio::test]
    async fn capped_items_are_left_alone_by_the_handler() {
        let store = Arc::new(MemoryStore::new());
        let item = submitted(RETRY_LIMIT);
        store.upsert_workitem(&item).await.unwrap();

        let (_tx, rx) = watch::channel(false);
        let dispatcher = dispatcher_with(store.clone(), rx).await;
        dispatcher.poll_once().await.unwrap();

        // The claimed item hits the retry-cap early return; the lease is
        // still released.
        let after = store.fetch_workitem(item.id).await.unwrap().unwrap();
        assert!(after.consumer.is_none());
        assert_eq!(after.retry, RETRY_LIMIT);
    }

    #[tokio::test]
    async fn shutdown_stops_new_claims_and_releases_unstarted_ones() {
        let store = Arc::new(MemoryStore::new());
        for _ in 0..3 {
            store.upsert_workitem(&submitted(0)).await.unwrap();
        }

        let (tx, rx) = watch::channel(false);
        let dispatcher = dispatcher_with(store.clone(), rx).await;
        tx.send(true).unwrap();

        let spawned = dispatcher.poll_once().await.unwrap();
        assert_eq!(spawned, 0);
        for item in store.all_workitems().await {
            assert!(item.consumer.is_none(), "lease must be given back");
            assert_eq!(item.status, WorkItemStatus::Submitted);
        }

        // And the run loop exits promptly.
        dispatcher.run().await.unwrap();
    }

    #[tokio::test]
    async fn run_loop_drains_and_exits_on_signal() {
        let store = Arc::new(MemoryStore::new());
        store.upsert_workitem(&submitted(0)).await.unwrap();

        let (tx, rx) = watch::channel(false);
        let dispatcher = Arc::new(dispatcher_with(store.clone(), rx).await);
        let runner = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.run().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), runner)
            .await
            .expect("dispatcher must stop after the signal")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn cleanup_loop_reclaims_stale_leases() {
        let store = Arc::new(MemoryStore::new());
        let mut stale = submitted(0);
        stale.status = WorkItemStatus::InProgress;
        stale.consumer = Some("pod-dead".to_string());
        stale.start_date = Some(chrono::Utc::now() - chrono::Duration::hours(1));
        store.upsert_workitem(&stale).await.unwrap();

        let (tx, rx) = watch::channel(false);
        let dispatcher = Arc::new(dispatcher_with(store.clone(), rx).await);
        let cleanup = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.run_cleanup().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(2), cleanup).await;

        let after = store.fetch_workitem(stale.id).await.unwrap().unwrap();
        assert!(after.consumer.is_none());
    }
}
