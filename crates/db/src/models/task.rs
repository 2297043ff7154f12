use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use uuid::Uuid;

/// A unit of work bound to one project, branch, and dev environment.
/// The workspace path is owned by the conversation executor: assigned on the
/// first execution and reused by every later conversation of the task.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub project_id: Uuid,
    pub dev_environment_id: Option<Uuid>,
    pub title: String,
    pub start_branch: String,
    pub workspace_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateTask {
    pub project_id: Uuid,
    pub dev_environment_id: Option<Uuid>,
    pub title: String,
    pub start_branch: String,
}

impl Task {
    pub async fn create(pool: &SqlitePool, data: &CreateTask) -> Result<Self, sqlx::Error> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query_as::<_, Task>(
            r#"INSERT INTO tasks (id, project_id, dev_environment_id, title, start_branch, created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $6)
               RETURNING id, project_id, dev_environment_id, title, start_branch, workspace_path, created_at, updated_at"#,
        )
        .bind(id)
        .bind(data.project_id)
        .bind(data.dev_environment_id)
        .bind(&data.title)
        .bind(&data.start_branch)
        .bind(now)
        .fetch_one(pool)
        .await
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Task>(
            "SELECT id, project_id, dev_environment_id, title, start_branch, workspace_path, created_at, updated_at
             FROM tasks WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(pool)
        .await
    }

    pub async fn update_workspace_path(
        pool: &SqlitePool,
        id: Uuid,
        workspace_path: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE tasks SET workspace_path = $2, updated_at = $3 WHERE id = $1")
            .bind(id)
            .bind(workspace_path)
            .bind(Utc::now())
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Gate for creating a new conversation: the per-task workspace is only
    /// safe because at most one conversation per task is pending-or-running.
    pub async fn has_pending_or_running_conversations(
        pool: &SqlitePool,
        task_id: Uuid,
    ) -> Result<bool, sqlx::Error> {
        let (exists,): (i64,) = sqlx::query_as(
            r#"SELECT EXISTS (
                   SELECT 1 FROM task_conversations
                   WHERE task_id = $1 AND status IN ('pending', 'running')
               )"#,
        )
        .bind(task_id)
        .fetch_one(pool)
        .await?;
        Ok(exists != 0)
    }
}
