use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use uuid::Uuid;

/// 1:1 with a conversation while it exists: the append-only log blob plus
/// execution metadata. Retry deletes and recreates the row.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub execution_logs: String,
    pub docker_command: Option<String>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Field-scoped metadata update. Only fields set to `Some` are written;
/// the `execution_logs` blob is never touched by this path, so it stays safe
/// against the concurrent pipe-reader appends.
#[derive(Debug, Clone, Default)]
pub struct ExecutionLogMetadata {
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub docker_command: Option<String>,
}

const SELECT_COLUMNS: &str = "id, conversation_id, execution_logs, docker_command, error_message, started_at, completed_at, created_at";

impl ExecutionLog {
    /// Create the log row with an empty blob (never NULL) and an optional
    /// error message for conversations that failed before launching.
    pub async fn create(
        pool: &SqlitePool,
        conversation_id: Uuid,
        error_message: Option<&str>,
    ) -> Result<Self, sqlx::Error> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query_as::<_, ExecutionLog>(&format!(
            r#"INSERT INTO execution_logs (id, conversation_id, execution_logs, error_message, created_at)
               VALUES ($1, $2, '', $3, $4)
               RETURNING {SELECT_COLUMNS}"#
        ))
        .bind(id)
        .bind(conversation_id)
        .bind(error_message)
        .bind(now)
        .fetch_one(pool)
        .await
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, ExecutionLog>(&format!(
            "SELECT {SELECT_COLUMNS} FROM execution_logs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await
    }

    /// Latest log row for a conversation.
    pub async fn find_by_conversation_id(
        pool: &SqlitePool,
        conversation_id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, ExecutionLog>(&format!(
            "SELECT {SELECT_COLUMNS} FROM execution_logs
             WHERE conversation_id = $1 ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(conversation_id)
        .fetch_optional(pool)
        .await
    }

    /// Atomic append to the log blob. Serialization of concurrent appends
    /// happens here, at the database write.
    pub async fn append_log(
        pool: &SqlitePool,
        id: Uuid,
        content: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE execution_logs SET execution_logs = execution_logs || $2 WHERE id = $1",
        )
        .bind(id)
        .bind(content)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn update_metadata(
        pool: &SqlitePool,
        id: Uuid,
        metadata: &ExecutionLogMetadata,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"UPDATE execution_logs SET
                   started_at     = COALESCE($2, started_at),
                   completed_at   = COALESCE($3, completed_at),
                   error_message  = COALESCE($4, error_message),
                   docker_command = COALESCE($5, docker_command)
               WHERE id = $1"#,
        )
        .bind(id)
        .bind(metadata.started_at)
        .bind(metadata.completed_at)
        .bind(&metadata.error_message)
        .bind(&metadata.docker_command)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn delete_by_conversation_id(
        pool: &SqlitePool,
        conversation_id: Uuid,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM execution_logs WHERE conversation_id = $1")
            .bind(conversation_id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        DBService,
        models::{
            project::{CreateProject, GitProtocol, Project},
            task::{CreateTask, Task},
            task_conversation::TaskConversation,
        },
    };

    async fn conversation_fixture(db: &DBService) -> Uuid {
        let project = Project::create(
            &db.pool,
            &CreateProject {
                name: "p".into(),
                repo_url: "https://example.com/repo.git".into(),
                protocol: GitProtocol::Https,
                credential_id: None,
            },
        )
        .await
        .unwrap();
        let task = Task::create(
            &db.pool,
            &CreateTask {
                project_id: project.id,
                dev_environment_id: None,
                title: "t".into(),
                start_branch: "main".into(),
            },
        )
        .await
        .unwrap();
        TaskConversation::create(&db.pool, task.id, "prompt")
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn append_concatenates_in_order() {
        let db = DBService::new_in_memory().await.unwrap();
        let conv_id = conversation_fixture(&db).await;
        let log = ExecutionLog::create(&db.pool, conv_id, None).await.unwrap();
        assert_eq!(log.execution_logs, "");

        ExecutionLog::append_log(&db.pool, log.id, "first\n").await.unwrap();
        ExecutionLog::append_log(&db.pool, log.id, "second\n").await.unwrap();

        let fresh = ExecutionLog::find_by_id(&db.pool, log.id).await.unwrap().unwrap();
        assert_eq!(fresh.execution_logs, "first\nsecond\n");
    }

    #[tokio::test]
    async fn metadata_update_leaves_log_blob_alone() {
        let db = DBService::new_in_memory().await.unwrap();
        let conv_id = conversation_fixture(&db).await;
        let log = ExecutionLog::create(&db.pool, conv_id, None).await.unwrap();
        ExecutionLog::append_log(&db.pool, log.id, "payload\n").await.unwrap();

        ExecutionLog::update_metadata(
            &db.pool,
            log.id,
            &ExecutionLogMetadata {
                completed_at: Some(Utc::now()),
                error_message: Some("boom".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let fresh = ExecutionLog::find_by_id(&db.pool, log.id).await.unwrap().unwrap();
        assert_eq!(fresh.execution_logs, "payload\n");
        assert_eq!(fresh.error_message.as_deref(), Some("boom"));
        assert!(fresh.completed_at.is_some());
        assert!(fresh.started_at.is_none());
    }

    #[tokio::test]
    async fn delete_by_conversation_removes_all_rows() {
        let db = DBService::new_in_memory().await.unwrap();
        let conv_id = conversation_fixture(&db).await;
        ExecutionLog::create(&db.pool, conv_id, None).await.unwrap();
        ExecutionLog::create(&db.pool, conv_id, Some("old failure")).await.unwrap();

        let removed = ExecutionLog::delete_by_conversation_id(&db.pool, conv_id)
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert!(ExecutionLog::find_by_conversation_id(&db.pool, conv_id)
            .await
            .unwrap()
            .is_none());
    }
}
