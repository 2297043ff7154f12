use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool, Type};
use strum_macros::{Display, EnumString};
use uuid::Uuid;

use super::{
    dev_environment::DevEnvironment, git_credential::GitCredential, project::Project, task::Task,
};

#[derive(
    Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq, EnumString, Display, Default,
)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ConversationStatus {
    #[default]
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl ConversationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled)
    }
}

/// One prompt executed against a task. Created by the API layer in `pending`;
/// status and commit hash are mutated exclusively by the executor.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TaskConversation {
    pub id: Uuid,
    pub task_id: Uuid,
    pub content: String,
    pub status: ConversationStatus,
    pub commit_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A pending conversation with its related rows eagerly loaded. Missing
/// references surface as `None` and are rejected by the executor's
/// precondition checks rather than here.
#[derive(Debug, Clone)]
pub struct ConversationContext {
    pub conversation: TaskConversation,
    pub task: Option<Task>,
    pub project: Option<Project>,
    pub dev_environment: Option<DevEnvironment>,
    pub credential: Option<GitCredential>,
}

const SELECT_COLUMNS: &str =
    "id, task_id, content, status, commit_hash, created_at, updated_at";

impl TaskConversation {
    pub async fn create(
        pool: &SqlitePool,
        task_id: Uuid,
        content: &str,
    ) -> Result<Self, sqlx::Error> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query_as::<_, TaskConversation>(
            r#"INSERT INTO task_conversations (id, task_id, content, status, created_at, updated_at)
               VALUES ($1, $2, $3, 'pending', $4, $4)
               RETURNING id, task_id, content, status, commit_hash, created_at, updated_at"#,
        )
        .bind(id)
        .bind(task_id)
        .bind(content)
        .bind(now)
        .fetch_one(pool)
        .await
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, TaskConversation>(&format!(
            "SELECT {SELECT_COLUMNS} FROM task_conversations WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await
    }

    pub async fn update_status(
        pool: &SqlitePool,
        id: Uuid,
        status: ConversationStatus,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE task_conversations SET status = $2, updated_at = $3 WHERE id = $1")
            .bind(id)
            .bind(status)
            .bind(Utc::now())
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn update_commit_hash(
        pool: &SqlitePool,
        id: Uuid,
        commit_hash: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE task_conversations SET commit_hash = $2, updated_at = $3 WHERE id = $1")
            .bind(id)
            .bind(commit_hash)
            .bind(Utc::now())
            .execute(pool)
            .await?;
        Ok(())
    }

    /// All pending conversations with task, project, dev environment, and
    /// credential eagerly loaded, oldest first.
    pub async fn find_pending_with_details(
        pool: &SqlitePool,
    ) -> Result<Vec<ConversationContext>, sqlx::Error> {
        let pending = sqlx::query_as::<_, TaskConversation>(&format!(
            "SELECT {SELECT_COLUMNS} FROM task_conversations
             WHERE status = 'pending' ORDER BY created_at ASC"
        ))
        .fetch_all(pool)
        .await?;

        let mut contexts = Vec::with_capacity(pending.len());
        for conversation in pending {
            contexts.push(Self::load_context(pool, conversation).await?);
        }
        Ok(contexts)
    }

    /// Eagerly load a conversation's related rows.
    pub async fn load_context(
        pool: &SqlitePool,
        conversation: TaskConversation,
    ) -> Result<ConversationContext, sqlx::Error> {
        let task = Task::find_by_id(pool, conversation.task_id).await?;
        let (project, dev_environment, credential) = match &task {
            Some(task) => {
                let project = Project::find_by_id(pool, task.project_id).await?;
                let dev_environment = match task.dev_environment_id {
                    Some(env_id) => DevEnvironment::find_by_id(pool, env_id).await?,
                    None => None,
                };
                let credential = match project.as_ref().and_then(|p| p.credential_id) {
                    Some(cred_id) => GitCredential::find_by_id(pool, cred_id).await?,
                    None => None,
                };
                (project, dev_environment, credential)
            }
            None => (None, None, None),
        };
        Ok(ConversationContext {
            conversation,
            task,
            project,
            dev_environment,
            credential,
        })
    }

    /// Restart reconciliation: conversations left in `running` by a dead
    /// process have no worker and would otherwise stay running forever.
    /// Returns the ids that were flipped to `failed`.
    pub async fn fail_orphaned_running(pool: &SqlitePool) -> Result<Vec<Uuid>, sqlx::Error> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "UPDATE task_conversations
             SET status = 'failed', updated_at = $1
             WHERE status = 'running'
             RETURNING id",
        )
        .bind(Utc::now())
        .fetch_all(pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}
