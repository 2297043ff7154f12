use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

pub const DEV_ENVIRONMENT_TYPES_KEY: &str = "dev_environment_types";

/// Default agent-type to container-image mapping, seeded on first startup.
pub const DEFAULT_DEV_ENVIRONMENT_TYPES: &str = r#"[
  {"key": "claude_code", "image": "claude-code:latest"},
  {"key": "opencode", "image": "opencode:latest"},
  {"key": "gemini_cli", "image": "gemini-cli:latest"}
]"#;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SystemConfig {
    pub key: String,
    pub value: String,
    pub description: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl SystemConfig {
    pub async fn get_value(pool: &SqlitePool, key: &str) -> Result<Option<String>, sqlx::Error> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM system_configs WHERE key = $1")
                .bind(key)
                .fetch_optional(pool)
                .await?;
        Ok(row.map(|(value,)| value))
    }

    pub async fn set_value(
        pool: &SqlitePool,
        key: &str,
        value: &str,
        description: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"INSERT INTO system_configs (key, value, description, updated_at)
               VALUES ($1, $2, $3, $4)
               ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at"#,
        )
        .bind(key)
        .bind(value)
        .bind(description)
        .bind(Utc::now())
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Seed defaults without overwriting operator-edited values.
    pub async fn initialize_defaults(pool: &SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"INSERT INTO system_configs (key, value, description, updated_at)
               VALUES ($1, $2, $3, $4)
               ON CONFLICT(key) DO NOTHING"#,
        )
        .bind(DEV_ENVIRONMENT_TYPES_KEY)
        .bind(DEFAULT_DEV_ENVIRONMENT_TYPES)
        .bind("Agent environment types and their container images")
        .bind(Utc::now())
        .execute(pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DBService;

    #[tokio::test]
    async fn initialize_defaults_is_idempotent_and_preserves_edits() {
        let db = DBService::new_in_memory().await.unwrap();
        SystemConfig::initialize_defaults(&db.pool).await.unwrap();
        let seeded = SystemConfig::get_value(&db.pool, DEV_ENVIRONMENT_TYPES_KEY)
            .await
            .unwrap()
            .unwrap();
        assert!(seeded.contains("claude-code:latest"));

        SystemConfig::set_value(&db.pool, DEV_ENVIRONMENT_TYPES_KEY, "[]", None)
            .await
            .unwrap();
        SystemConfig::initialize_defaults(&db.pool).await.unwrap();
        let kept = SystemConfig::get_value(&db.pool, DEV_ENVIRONMENT_TYPES_KEY)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(kept, "[]");
    }

    #[tokio::test]
    async fn missing_key_returns_none() {
        let db = DBService::new_in_memory().await.unwrap();
        assert!(SystemConfig::get_value(&db.pool, "nope").await.unwrap().is_none());
    }
}
