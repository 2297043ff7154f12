use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool, Type};
use strum_macros::{Display, EnumString};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq, EnumString, Display)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum GitCredentialType {
    Password,
    Token,
    SshKey,
}

/// Stored git credential. `secret` is an AES-GCM envelope (see
/// `services::credentials`): the password/token ciphertext for
/// password/token credentials, the private-key ciphertext for ssh keys.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct GitCredential {
    pub id: Uuid,
    pub name: String,
    pub cred_type: GitCredentialType,
    pub username: String,
    pub secret: String,
    pub public_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateGitCredential {
    pub name: String,
    pub cred_type: GitCredentialType,
    pub username: String,
    pub secret: String,
    pub public_key: Option<String>,
}

impl GitCredential {
    pub async fn create(
        pool: &SqlitePool,
        data: &CreateGitCredential,
    ) -> Result<Self, sqlx::Error> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query_as::<_, GitCredential>(
            r#"INSERT INTO git_credentials (id, name, cred_type, username, secret, public_key, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7)
               RETURNING id, name, cred_type, username, secret, public_key, created_at"#,
        )
        .bind(id)
        .bind(&data.name)
        .bind(data.cred_type)
        .bind(&data.username)
        .bind(&data.secret)
        .bind(&data.public_key)
        .bind(now)
        .fetch_one(pool)
        .await
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, GitCredential>(
            "SELECT id, name, cred_type, username, secret, public_key, created_at
             FROM git_credentials WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(pool)
        .await
    }
}
