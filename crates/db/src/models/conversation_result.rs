use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::{FromRow, SqlitePool};
use uuid::Uuid;

/// The agent's final structured result, parsed out of the execution log.
/// At most one per conversation; never updated once created.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ConversationResult {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub result_type: String,
    pub subtype: String,
    pub is_error: bool,
    pub session_id: String,
    /// Full parsed result object, including free-form additional fields.
    pub payload: String,
    pub created_at: DateTime<Utc>,
}

const SELECT_COLUMNS: &str =
    "id, conversation_id, result_type, subtype, is_error, session_id, payload, created_at";

impl ConversationResult {
    /// Persist a validated result object. The caller has already checked the
    /// shape (`type == "result"`, `subtype`, boolean `is_error`, non-empty
    /// `session_id`); extraction here mirrors that contract.
    pub async fn create(
        pool: &SqlitePool,
        conversation_id: Uuid,
        data: &Map<String, Value>,
    ) -> Result<Self, sqlx::Error> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let result_type = data.get("type").and_then(Value::as_str).unwrap_or_default();
        let subtype = data.get("subtype").and_then(Value::as_str).unwrap_or_default();
        let is_error = data.get("is_error").and_then(Value::as_bool).unwrap_or(false);
        let session_id = data
            .get("session_id")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let payload = Value::Object(data.clone()).to_string();

        sqlx::query_as::<_, ConversationResult>(&format!(
            r#"INSERT INTO conversation_results
                   (id, conversation_id, result_type, subtype, is_error, session_id, payload, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
               RETURNING {SELECT_COLUMNS}"#
        ))
        .bind(id)
        .bind(conversation_id)
        .bind(result_type)
        .bind(subtype)
        .bind(is_error)
        .bind(session_id)
        .bind(payload)
        .bind(now)
        .fetch_one(pool)
        .await
    }

    pub async fn exists_by_conversation_id(
        pool: &SqlitePool,
        conversation_id: Uuid,
    ) -> Result<bool, sqlx::Error> {
        let (exists,): (i64,) = sqlx::query_as(
            "SELECT EXISTS (SELECT 1 FROM conversation_results WHERE conversation_id = $1)",
        )
        .bind(conversation_id)
        .fetch_one(pool)
        .await?;
        Ok(exists != 0)
    }

    pub async fn find_by_conversation_id(
        pool: &SqlitePool,
        conversation_id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, ConversationResult>(&format!(
            "SELECT {SELECT_COLUMNS} FROM conversation_results WHERE conversation_id = $1"
        ))
        .bind(conversation_id)
        .fetch_optional(pool)
        .await
    }

    /// Used by retry so a stale result from a prior run cannot shadow the
    /// retry's own result.
    pub async fn delete_by_conversation_id(
        pool: &SqlitePool,
        conversation_id: Uuid,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM conversation_results WHERE conversation_id = $1")
            .bind(conversation_id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }
}
