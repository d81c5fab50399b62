//! Debounced streaming-log writer.
//!
//! Token streams must not turn into one UPDATE per token: a single task
//! consumes a channel of log snapshots and writes the latest one at most
//! once per second, plus a final flush when the sender side closes.

use crate::store::ProcessStore;
use crate::types::WorkItemPatch;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

const DEBOUNCE: Duration = Duration::from_secs(1);

/// Cheap-to-clone handle; send the full accumulated text, not deltas.
#[derive(Clone)]
pub struct LogSink {
    tx: mpsc::UnboundedSender<String>,
}

impl LogSink {
    pub fn append(&self, snapshot: String) {
        // Receiver gone means the writer task already flushed and exited.
        let _ = self.tx.send(snapshot);
    }

    /// A sink wired to nothing, for callers that do not stream.
    pub fn disconnected() -> LogSink {
        let (tx, _rx) = mpsc::unbounded_channel();
        LogSink { tx }
    }
}

/// Spawn the writer task for one work item. Dropping every `LogSink` clone
/// ends the task after a final flush; await the handle to be sure the last
/// snapshot reached the store.
pub fn spawn_log_writer(
    store: Arc<dyn ProcessStore>,
    workitem_id: Uuid,
    tenant_id: String,
) -> (LogSink, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let handle = tokio::spawn(async move {
        let mut pending: Option<String> = None;
        let mut ticker = tokio::time::interval(DEBOUNCE);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; swallow it.
        ticker.tick().await;

        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Some(snapshot) => pending = Some(snapshot),
                    None => break,
                },
                _ = ticker.tick() => {
                    if let Some(snapshot) = pending.take() {
                        flush(&store, workitem_id, &tenant_id, snapshot).await;
                    }
                }
            }
        }
        if let Some(snapshot) = pending.take() {
            flush(&store, workitem_id, &tenant_id, snapshot).await;
        }
    });

    (LogSink { tx }, handle)
}

async fn flush(store: &Arc<dyn ProcessStore>, id: Uuid, tenant_id: &str, snapshot: String) {
    if let Err(error) = store
        .patch_workitem(id, &WorkItemPatch::log(snapshot), tenant_id)
        .await
    {
        tracing::warn!(%id, %error, "failed to flush streamed log");
    }
}
