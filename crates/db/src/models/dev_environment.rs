use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use uuid::Uuid;

/// Named agent flavor: container image key, resource limits, and the
/// environment variables injected into the agent container.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DevEnvironment {
    pub id: Uuid,
    pub name: String,
    /// Agent type key, e.g. `claude_code`, `opencode`, `gemini_cli`.
    pub env_type: String,
    /// CPU cores handed to the container; 0 disables the limit.
    pub cpu_limit: f64,
    /// Memory limit in MiB; 0 disables the limit.
    pub memory_limit: i64,
    /// JSON object of env vars, stored as text.
    pub env_vars: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateDevEnvironment {
    pub name: String,
    pub env_type: String,
    pub cpu_limit: f64,
    pub memory_limit: i64,
    pub env_vars: String,
}

impl DevEnvironment {
    /// Parse the stored env-var document. Malformed JSON yields an empty map
    /// rather than failing the execution.
    pub fn env_vars_map(&self) -> HashMap<String, String> {
        serde_json::from_str(&self.env_vars).unwrap_or_default()
    }

    pub async fn create(pool: &SqlitePool, data: &CreateDevEnvironment) -> Result<Self, sqlx::Error> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query_as::<_, DevEnvironment>(
            r#"INSERT INTO dev_environments (id, name, env_type, cpu_limit, memory_limit, env_vars, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7)
               RETURNING id, name, env_type, cpu_limit, memory_limit, env_vars, created_at"#,
        )
        .bind(id)
        .bind(&data.name)
        .bind(&data.env_type)
        .bind(data.cpu_limit)
        .bind(data.memory_limit)
        .bind(&data.env_vars)
        .bind(now)
        .fetch_one(pool)
        .await
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, DevEnvironment>(
            "SELECT id, name, env_type, cpu_limit, memory_limit, env_vars, created_at
             FROM dev_environments WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(pool)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(env_vars: &str) -> DevEnvironment {
        DevEnvironment {
            id: Uuid::new_v4(),
            name: "test".into(),
            env_type: "claude_code".into(),
            cpu_limit: 1.0,
            memory_limit: 1024,
            env_vars: env_vars.into(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn env_vars_map_parses_json_object() {
        let e = env(r#"{"API_KEY":"abc","MODE":"fast"}"#);
        let map = e.env_vars_map();
        assert_eq!(map.get("API_KEY").map(String::as_str), Some("abc"));
        assert_eq!(map.get("MODE").map(String::as_str), Some("fast"));
    }

    #[test]
    fn env_vars_map_tolerates_garbage() {
        assert!(env("not json").env_vars_map().is_empty());
        assert!(env("").env_vars_map().is_empty());
    }
}
