//! Per-conversation orchestration.
//!
//! Drives a conversation through its whole lifecycle: precondition checks,
//! the pending→running transition, workspace preparation, clone, container
//! run, commit, and the unconditional cleanup that records the terminal
//! state. Errors never escape a worker; the scheduler is fire-and-forget.

use std::{path::Path, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use db::{
    DBService,
    models::{
        conversation_result::ConversationResult,
        dev_environment::DevEnvironment,
        execution_log::{ExecutionLog, ExecutionLogMetadata},
        git_credential::GitCredential,
        project::Project,
        task::Task,
        task_conversation::{ConversationContext, ConversationStatus, TaskConversation},
    },
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use utils::log_stream::LogBroadcaster;
use uuid::Uuid;

use crate::services::{
    config::Config,
    credentials::{CredentialError, CredentialMaterializer, GitCredentialInfo},
    docker::{AgentRunSpec, DockerError, DockerRunner, LogSink},
    execution_manager::ExecutionManager,
    result_parser::ResultParser,
    workspace::{WorkspaceError, WorkspaceManager},
};

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("conversation not found: {0}")]
    NotFound(Uuid),
    #[error("{0}")]
    Validation(String),
    #[error("conversation is already running")]
    AlreadyRunning,
    #[error("concurrency limit reached")]
    ConcurrencyLimit,
    #[error("only failed or cancelled conversations can be retried")]
    NotRetryable,
    #[error("only pending or running conversations can be cancelled")]
    NotCancellable,
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Durable log append followed by a live publish. Shared between the
/// executor and the docker runner's pipe readers; the database write is the
/// serialization point for concurrent appends.
pub struct ExecutionLogSink {
    db: DBService,
    broadcaster: Arc<LogBroadcaster>,
}

#[async_trait]
impl LogSink for ExecutionLogSink {
    async fn append(&self, exec_log_id: Uuid, conversation_id: Uuid, content: &str) {
        if let Err(e) = ExecutionLog::append_log(&self.db.pool, exec_log_id, content).await {
            tracing::error!("Failed to append to execution log {exec_log_id}: {e}");
            return;
        }
        self.broadcaster.broadcast_log(conversation_id, content);
    }
}

/// A conversation that passed the precondition checks: every reference it
/// needs is present.
struct ExecutionContext {
    conversation: TaskConversation,
    task: Task,
    project: Project,
    dev_environment: DevEnvironment,
    credential: Option<GitCredential>,
}

struct StageOutcome {
    status: ConversationStatus,
    error_message: Option<String>,
    commit_hash: Option<String>,
}

impl StageOutcome {
    fn failed(message: String) -> Self {
        Self {
            status: ConversationStatus::Failed,
            error_message: Some(message),
            commit_hash: None,
        }
    }

    fn cancelled() -> Self {
        Self {
            status: ConversationStatus::Cancelled,
            error_message: Some("task was cancelled".to_string()),
            commit_hash: None,
        }
    }

    fn success(commit_hash: Option<String>) -> Self {
        Self {
            status: ConversationStatus::Success,
            error_message: None,
            commit_hash,
        }
    }
}

#[derive(Clone)]
pub struct ConversationExecutor {
    db: DBService,
    config: Arc<Config>,
    workspace: Arc<WorkspaceManager>,
    docker: Arc<DockerRunner>,
    manager: Arc<ExecutionManager>,
    credentials: CredentialMaterializer,
    broadcaster: Arc<LogBroadcaster>,
    sink: Arc<ExecutionLogSink>,
    parser: ResultParser,
}

impl ConversationExecutor {
    pub fn new(db: DBService, config: Arc<Config>, broadcaster: Arc<LogBroadcaster>) -> Self {
        let sink = Arc::new(ExecutionLogSink {
            db: db.clone(),
            broadcaster: Arc::clone(&broadcaster),
        });
        let workspace = Arc::new(WorkspaceManager::new(
            &config.workspace_base_dir,
            config.git_clone_timeout(),
        ));
        let docker = Arc::new(DockerRunner::new(
            db.clone(),
            Arc::clone(&sink) as Arc<dyn LogSink>,
            config.docker_execution_timeout(),
        ));
        let manager = Arc::new(ExecutionManager::new(config.max_concurrent_tasks));
        let credentials = CredentialMaterializer::new(&config.aes_key);
        let parser = ResultParser::new(db.clone());
        Self {
            db,
            config,
            workspace,
            docker,
            manager,
            credentials,
            broadcaster,
            sink,
            parser,
        }
    }

    pub fn manager(&self) -> Arc<ExecutionManager> {
        Arc::clone(&self.manager)
    }

    /// Validate, transition pending→running, take a concurrency slot, and
    /// launch the worker. Returns as soon as the worker is spawned; the
    /// worker itself never reports errors upward.
    pub async fn process(&self, ctx: ConversationContext) -> Result<(), ExecutorError> {
        let conversation = ctx.conversation;
        let conv_id = conversation.id;

        let Some(task) = ctx.task else {
            self.fail_before_launch(conv_id, "missing task info").await;
            return Err(ExecutorError::Validation("missing task info".into()));
        };
        let Some(project) = ctx.project else {
            self.fail_before_launch(conv_id, "missing project info").await;
            return Err(ExecutorError::Validation("missing project info".into()));
        };
        let Some(dev_environment) = ctx.dev_environment else {
            let msg = "task has no development environment configured, cannot execute";
            self.fail_before_launch(conv_id, msg).await;
            return Err(ExecutorError::Validation(msg.into()));
        };

        if let Err(e) =
            TaskConversation::update_status(&self.db.pool, conv_id, ConversationStatus::Running)
                .await
        {
            self.fail_before_launch(conv_id, &format!("failed to update conversation status: {e}"))
                .await;
            return Err(e.into());
        }
        // a row left over from an admission rollback would violate the
        // one-log-per-conversation rule once the new one is created
        if let Err(e) = ExecutionLog::delete_by_conversation_id(&self.db.pool, conv_id).await {
            tracing::warn!("Failed to clear prior execution logs for {conv_id}: {e}");
        }
        let exec_log = match ExecutionLog::create(&self.db.pool, conv_id, None).await {
            Ok(log) => log,
            Err(e) => {
                self.fail_before_launch(conv_id, &format!("failed to create execution log: {e}"))
                    .await;
                return Err(e.into());
            }
        };

        let token = CancellationToken::new();
        if !self.manager.admit(conv_id, token.clone()) {
            // back to pending so the next scheduler tick retries the admission
            if let Err(e) =
                TaskConversation::update_status(&self.db.pool, conv_id, ConversationStatus::Pending)
                    .await
            {
                tracing::error!("Failed to roll conversation {conv_id} back to pending: {e}");
            }
            let metadata = ExecutionLogMetadata {
                error_message: Some("concurrency limit".to_string()),
                ..Default::default()
            };
            if let Err(e) = ExecutionLog::update_metadata(&self.db.pool, exec_log.id, &metadata).await
            {
                tracing::error!("Failed to record admission refusal for {conv_id}: {e}");
            }
            return Err(ExecutorError::ConcurrencyLimit);
        }

        let ectx = ExecutionContext {
            conversation,
            task,
            project,
            dev_environment,
            credential: ctx.credential,
        };
        let executor = self.clone();
        tokio::spawn(async move {
            executor.execute_task(token, ectx, exec_log).await;
        });
        Ok(())
    }

    async fn execute_task(
        &self,
        token: CancellationToken,
        mut ectx: ExecutionContext,
        exec_log: ExecutionLog,
    ) {
        let outcome = self.run_stages(&token, &mut ectx, &exec_log).await;
        self.finalize(&ectx, &exec_log, outcome).await;
    }

    async fn run_stages(
        &self,
        token: &CancellationToken,
        ectx: &mut ExecutionContext,
        exec_log: &ExecutionLog,
    ) -> StageOutcome {
        let conv_id = ectx.conversation.id;

        if token.is_cancelled() {
            self.append(exec_log.id, conv_id, "task cancelled by user\n").await;
            return StageOutcome::cancelled();
        }

        // 1. task workspace, recorded on first assignment
        let workspace = match self
            .workspace
            .get_or_create(ectx.task.id, ectx.task.workspace_path.as_deref())
            .await
        {
            Ok(path) => path,
            Err(e) => return StageOutcome::failed(format!("failed to prepare workspace: {e}")),
        };
        if ectx.task.workspace_path.as_deref().is_none_or(str::is_empty) {
            let path_str = workspace.to_string_lossy().to_string();
            if let Err(e) = Task::update_workspace_path(&self.db.pool, ectx.task.id, &path_str).await
            {
                // the conversation can still run in this workspace
                tracing::error!("Failed to record workspace path for task {}: {e}", ectx.task.id);
            }
            ectx.task.workspace_path = Some(path_str);
        }

        // 2. execution start time
        let metadata = ExecutionLogMetadata {
            started_at: Some(Utc::now()),
            ..Default::default()
        };
        if let Err(e) = ExecutionLog::update_metadata(&self.db.pool, exec_log.id, &metadata).await {
            tracing::error!("Failed to record started_at for {conv_id}: {e}");
        }

        if token.is_cancelled() {
            self.append(exec_log.id, conv_id, "task cancelled during preparation\n").await;
            return StageOutcome::cancelled();
        }

        // 3. clone unless the workspace already holds a repository
        if self.workspace.has_git_repo(&workspace) {
            self.append(
                exec_log.id,
                conv_id,
                &format!("repository exists, skipping clone: {}\n", workspace.display()),
            )
            .await;
        } else {
            let credential = match self.materialize_credential(ectx.credential.as_ref()) {
                Ok(credential) => credential,
                Err(e) => {
                    return StageOutcome::failed(format!("failed to prepare git credential: {e}"))
                }
            };
            if let Err(e) = self
                .workspace
                .clone_repository(
                    &workspace,
                    &ectx.project.repo_url,
                    &ectx.task.start_branch,
                    credential.as_ref(),
                    self.config.git_ssl_verify,
                    &self.config.git_proxy,
                )
                .await
            {
                return StageOutcome::failed(format!("failed to clone repository: {e}"));
            }
            self.append(
                exec_log.id,
                conv_id,
                &format!("cloned repository into {}\n", workspace.display()),
            )
            .await;
        }

        if token.is_cancelled() {
            self.append(exec_log.id, conv_id, "task cancelled during preparation\n").await;
            return StageOutcome::cancelled();
        }

        // 4. container command; the masked rendering is the audit record
        let spec = AgentRunSpec {
            task_id: ectx.task.id,
            conversation_id: conv_id,
            exec_log_id: exec_log.id,
            prompt: &ectx.conversation.content,
            dev_environment: &ectx.dev_environment,
            workspace: &workspace,
        };
        let prepared = self.docker.prepare(&spec).await;
        let metadata = ExecutionLogMetadata {
            docker_command: Some(prepared.audit_command.clone()),
            ..Default::default()
        };
        if let Err(e) = ExecutionLog::update_metadata(&self.db.pool, exec_log.id, &metadata).await {
            tracing::error!("Failed to record docker command for {conv_id}: {e}");
        }
        self.append(
            exec_log.id,
            conv_id,
            &format!("executing: {}\n", prepared.audit_command),
        )
        .await;

        // 5. run the agent
        match self.docker.execute(token, &spec, &prepared).await {
            Ok(()) => {}
            Err(DockerError::Cancelled) => {
                self.append(exec_log.id, conv_id, "task cancelled during execution\n").await;
                return StageOutcome::cancelled();
            }
            Err(e) if token.is_cancelled() => {
                tracing::debug!("Container run for {conv_id} failed after cancellation: {e}");
                self.append(exec_log.id, conv_id, "task cancelled during execution\n").await;
                return StageOutcome::cancelled();
            }
            Err(e) => return StageOutcome::failed(format!("docker execution failed: {e}")),
        }

        // 6. commit whatever the agent produced; an empty tree is not a failure
        let mut commit_hash = None;
        match self
            .workspace
            .commit(
                &workspace,
                &format!("AI generated changes for conversation {conv_id}"),
            )
            .await
        {
            Ok(hash) => {
                self.append(exec_log.id, conv_id, &format!("committed changes: {hash}\n")).await;
                commit_hash = Some(hash);
            }
            Err(WorkspaceError::NothingToCommit) => {
                self.append(exec_log.id, conv_id, "no changes to commit\n").await;
            }
            Err(e) => {
                self.append(
                    exec_log.id,
                    conv_id,
                    &format!("warning: failed to commit changes: {e}\n"),
                )
                .await;
            }
        }

        StageOutcome::success(commit_hash)
    }

    /// Unconditional cleanup: free the slot, persist the terminal state,
    /// reset a dirty workspace on failure/cancel, stamp the log metadata,
    /// broadcast, and hand the fresh log to the result parser.
    async fn finalize(
        &self,
        ectx: &ExecutionContext,
        exec_log: &ExecutionLog,
        outcome: StageOutcome,
    ) {
        let conv_id = ectx.conversation.id;
        self.manager.release(conv_id);

        if let Err(e) = TaskConversation::update_status(&self.db.pool, conv_id, outcome.status).await
        {
            tracing::error!("Failed to persist final status for {conv_id}: {e}");
        }

        if matches!(
            outcome.status,
            ConversationStatus::Failed | ConversationStatus::Cancelled
        ) {
            if let Some(path) = ectx.task.workspace_path.as_deref().filter(|p| !p.is_empty()) {
                self.cleanup_workspace(Path::new(path)).await;
            }
        }

        if let Some(hash) = &outcome.commit_hash {
            if let Err(e) = TaskConversation::update_commit_hash(&self.db.pool, conv_id, hash).await
            {
                tracing::error!("Failed to record commit hash for {conv_id}: {e}");
            }
        }

        let metadata = ExecutionLogMetadata {
            completed_at: Some(Utc::now()),
            error_message: outcome.error_message.clone(),
            ..Default::default()
        };
        if let Err(e) = ExecutionLog::update_metadata(&self.db.pool, exec_log.id, &metadata).await {
            tracing::error!("Failed to record completion metadata for {conv_id}: {e}");
        }

        let mut status_message = format!("execution completed: {}", outcome.status);
        if let Some(error) = &outcome.error_message {
            status_message.push_str(&format!(" - {error}"));
        }
        self.broadcaster
            .broadcast_status(conv_id, &format!("{} - {status_message}", outcome.status));

        self.parser.parse_and_store_result(conv_id, exec_log.id).await;

        tracing::info!("Conversation {conv_id} finished with status {}", outcome.status);
    }

    /// Cancel a pending or running conversation. For a running one the
    /// stored token is fired and the runner tears the container down; the
    /// status write here is what makes a pending cancel instantaneous.
    pub async fn cancel(&self, conversation_id: Uuid) -> Result<(), ExecutorError> {
        let conversation = TaskConversation::find_by_id(&self.db.pool, conversation_id)
            .await?
            .ok_or(ExecutorError::NotFound(conversation_id))?;
        if !matches!(
            conversation.status,
            ConversationStatus::Pending | ConversationStatus::Running
        ) {
            return Err(ExecutorError::NotCancellable);
        }

        if self.manager.cancel(conversation_id) {
            tracing::info!("Cancelling running conversation {conversation_id}");
        }

        TaskConversation::update_status(&self.db.pool, conversation_id, ConversationStatus::Cancelled)
            .await?;

        if let Some(task) = Task::find_by_id(&self.db.pool, conversation.task_id).await? {
            if let Some(path) = task.workspace_path.as_deref().filter(|p| !p.is_empty()) {
                self.cleanup_workspace(Path::new(path)).await;
            }
        }
        Ok(())
    }

    /// Re-run a failed or cancelled conversation from scratch. Prior
    /// execution logs and any stale result are removed first so the retry
    /// owns its whole record.
    pub async fn retry(&self, conversation_id: Uuid) -> Result<(), ExecutorError> {
        let conversation = TaskConversation::find_by_id(&self.db.pool, conversation_id)
            .await?
            .ok_or(ExecutorError::NotFound(conversation_id))?;
        if !matches!(
            conversation.status,
            ConversationStatus::Failed | ConversationStatus::Cancelled
        ) {
            return Err(ExecutorError::NotRetryable);
        }
        if self.manager.is_running(conversation_id) {
            return Err(ExecutorError::AlreadyRunning);
        }
        if !self.manager.can_admit() {
            return Err(ExecutorError::ConcurrencyLimit);
        }

        ExecutionLog::delete_by_conversation_id(&self.db.pool, conversation_id).await?;
        let removed =
            ConversationResult::delete_by_conversation_id(&self.db.pool, conversation_id).await?;
        if removed > 0 {
            tracing::info!("Removed stale result for conversation {conversation_id} before retry");
        }
        TaskConversation::update_status(&self.db.pool, conversation_id, ConversationStatus::Pending)
            .await?;

        let conversation = TaskConversation::find_by_id(&self.db.pool, conversation_id)
            .await?
            .ok_or(ExecutorError::NotFound(conversation_id))?;
        let ctx = TaskConversation::load_context(&self.db.pool, conversation).await?;
        match self.process(ctx).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Err(rollback) = TaskConversation::update_status(
                    &self.db.pool,
                    conversation_id,
                    ConversationStatus::Failed,
                )
                .await
                {
                    tracing::error!(
                        "Failed to roll back retried conversation {conversation_id}: {rollback}"
                    );
                }
                Err(e)
            }
        }
    }

    /// Startup reconciliation: a `running` row without a live worker was
    /// orphaned by a process restart. Returns how many were repaired.
    pub async fn recover_orphaned_conversations(&self) -> Result<usize, ExecutorError> {
        let orphaned = TaskConversation::fail_orphaned_running(&self.db.pool).await?;
        for conv_id in &orphaned {
            let metadata = ExecutionLogMetadata {
                completed_at: Some(Utc::now()),
                error_message: Some("orphaned by restart".to_string()),
                ..Default::default()
            };
            match ExecutionLog::find_by_conversation_id(&self.db.pool, *conv_id).await {
                Ok(Some(log)) => {
                    if let Err(e) =
                        ExecutionLog::update_metadata(&self.db.pool, log.id, &metadata).await
                    {
                        tracing::error!("Failed to mark execution log of orphan {conv_id}: {e}");
                    }
                }
                Ok(None) => {
                    if let Err(e) =
                        ExecutionLog::create(&self.db.pool, *conv_id, Some("orphaned by restart"))
                            .await
                    {
                        tracing::error!("Failed to create log for orphan {conv_id}: {e}");
                    }
                }
                Err(e) => tracing::error!("Failed to load execution log of orphan {conv_id}: {e}"),
            }
            tracing::warn!("Conversation {conv_id} marked failed: orphaned by restart");
        }
        Ok(orphaned.len())
    }

    /// Best-effort reset of a workspace the agent may have dirtied. Never
    /// changes the conversation's outcome.
    async fn cleanup_workspace(&self, workspace: &Path) {
        let dirty = match self.workspace.is_dirty(workspace).await {
            Ok(false) => {
                tracing::info!("Workspace already clean: {}", workspace.display());
                return;
            }
            Ok(true) => true,
            Err(e) => {
                tracing::error!("Failed to check workspace state {}: {e}", workspace.display());
                // attempt the reset anyway
                true
            }
        };
        if dirty {
            if let Err(e) = self.workspace.reset_clean(workspace).await {
                tracing::error!("Failed to reset workspace {}: {e}", workspace.display());
            }
        }
    }

    fn materialize_credential(
        &self,
        credential: Option<&GitCredential>,
    ) -> Result<Option<GitCredentialInfo>, CredentialError> {
        credential
            .map(|credential| self.credentials.materialize(credential))
            .transpose()
    }

    /// Record a failure that happened before any worker was launched: the
    /// conversation goes to `failed` and a log row carries the reason.
    async fn fail_before_launch(&self, conversation_id: Uuid, message: &str) {
        if let Err(e) = TaskConversation::update_status(
            &self.db.pool,
            conversation_id,
            ConversationStatus::Failed,
        )
        .await
        {
            tracing::error!("Failed to mark conversation {conversation_id} failed: {e}");
        }
        if let Err(e) = ExecutionLog::create(&self.db.pool, conversation_id, Some(message)).await {
            tracing::error!("Failed to create failure log for {conversation_id}: {e}");
        }
    }

    async fn append(&self, exec_log_id: Uuid, conversation_id: Uuid, content: &str) {
        self.sink.append(exec_log_id, conversation_id, content).await;
    }
}
