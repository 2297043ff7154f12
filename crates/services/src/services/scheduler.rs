//! Periodic tick that drains the pending-conversation queue into the
//! executor. Shutting the scheduler down stops new admissions only; workers
//! already running continue to completion unless independently cancelled.

use std::{sync::Arc, time::Duration};

use db::{DBService, models::task_conversation::TaskConversation};
use tokio::{task::JoinHandle, time::interval};
use tokio_util::sync::CancellationToken;

use crate::services::{
    execution_manager::ExecutionManager,
    executor::{ConversationExecutor, ExecutorError},
};

pub struct Scheduler {
    db: DBService,
    executor: Arc<ConversationExecutor>,
    manager: Arc<ExecutionManager>,
    poll_interval: Duration,
}

impl Scheduler {
    pub fn new(db: DBService, executor: Arc<ConversationExecutor>, poll_interval: Duration) -> Self {
        let manager = executor.manager();
        Self {
            db,
            executor,
            manager,
            poll_interval,
        }
    }

    /// Spawn the tick loop as a background task.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run(shutdown).await;
        })
    }

    async fn run(self, shutdown: CancellationToken) {
        tracing::info!(
            "Starting scheduler with interval {:?}, max concurrency {}",
            self.poll_interval,
            self.manager.max_concurrency()
        );
        let mut ticker = interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Scheduler shutting down; running conversations continue");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.process_pending_conversations().await {
                        tracing::error!("Failed to process pending conversations: {e}");
                    }
                }
            }
        }
    }

    /// One tick: fetch pending conversations in creation order and hand each
    /// admissible one to the executor. `process` returns once the worker is
    /// launched, so a long agent run never blocks the tick.
    async fn process_pending_conversations(&self) -> Result<(), ExecutorError> {
        let pending = TaskConversation::find_pending_with_details(&self.db.pool).await?;
        if pending.is_empty() {
            return Ok(());
        }

        tracing::info!(
            "Found {} pending conversations ({} running, cap {})",
            pending.len(),
            self.manager.running_count(),
            self.manager.max_concurrency()
        );

        let mut processed = 0usize;
        let mut skipped = 0usize;
        for ctx in pending {
            let conv_id = ctx.conversation.id;
            if !self.manager.can_admit() {
                skipped += 1;
                tracing::warn!("Concurrency cap reached, skipping conversation {conv_id}");
                continue;
            }
            if self.manager.is_running(conv_id) {
                skipped += 1;
                tracing::warn!("Conversation {conv_id} already running, skipping");
                continue;
            }
            match self.executor.process(ctx).await {
                Ok(()) => processed += 1,
                Err(e) => {
                    tracing::error!("Failed to process conversation {conv_id}: {e}");
                }
            }
        }

        tracing::info!("Scheduler tick done: {processed} launched, {skipped} skipped");
        Ok(())
    }
}
