//! SQLite implementation of the identity repositories.
//!
//! Ids are stored as hyphenated UUID text (so `ORDER BY id` matches UUID
//! ordering), timestamps as RFC 3339 text, keys and secrets as BLOBs.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;
use warden_auth::crypto::SecretToken;
use warden_auth::identity::PublicKey;
use warden_auth::lifecycle::{
    AuthError, IdentityRepos, IdentityStore, Invite, LoginNonce, RepoFuture, Session, User,
    UserState,
};
use warden_auth::StoreError;

const USER: &str = "user";
const INVITE: &str = "invite";
const NONCE: &str = "login nonce";
const SESSION: &str = "session";

/// Identity storage backed by a SQLite pool.
#[derive(Clone)]
pub struct SqliteIdentityStore {
    pool: SqlitePool,
}

impl SqliteIdentityStore {
    /// Open or create the database file at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, sqlx::Error> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                sqlx::Error::Configuration(format!("Failed to create db directory: {}", e).into())
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1) // single writer; also serializes nonce consumption
            .connect_with(options)
            .await?;

        Self::new(pool).await
    }

    /// Wrap an existing pool, creating tables if they don't exist.
    pub async fn new(pool: SqlitePool) -> Result<Self, sqlx::Error> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY,
        name TEXT UNIQUE,
        public_key BLOB,
        state INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS user_invites (
        user_id TEXT PRIMARY KEY,
        token BLOB NOT NULL UNIQUE,
        not_before TEXT NOT NULL,
        not_after TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS login_nonces (
        user_id TEXT PRIMARY KEY,
        nonce BLOB NOT NULL UNIQUE,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS user_sessions (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        token BLOB NOT NULL UNIQUE,
        created_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_user_sessions_user_id ON user_sessions(user_id)",
];

#[async_trait]
impl IdentityStore for SqliteIdentityStore {
    async fn transaction<T, F>(&self, work: F) -> Result<T, AuthError>
    where
        T: Send + 'static,
        F: for<'r> FnOnce(&'r mut dyn IdentityRepos) -> RepoFuture<'r, T> + Send + 'static,
    {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let result = {
            let mut repos = SqliteRepos { conn: &mut tx };
            work(&mut repos).await
        };

        match result {
            Ok(value) => {
                tx.commit().await.map_err(db_err)?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(error = %rollback, "transaction rollback failed");
                }
                Err(err)
            }
        }
    }
}

/// Repositories bound to one open transaction.
struct SqliteRepos<'c> {
    conn: &'c mut SqliteConnection,
}

#[async_trait]
impl IdentityRepos for SqliteRepos<'_> {
    async fn get_user(&mut self, id: Uuid) -> Result<User, StoreError> {
        let row = sqlx::query("SELECT id, name, public_key, state FROM users WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut *self.conn)
            .await
            .map_err(db_err)?;
        row.map(|r| user_from_row(&r))
            .unwrap_or(Err(StoreError::not_found(USER)))
    }

    async fn get_user_by_name(&mut self, name: &str) -> Result<User, StoreError> {
        let row = sqlx::query("SELECT id, name, public_key, state FROM users WHERE name = ?")
            .bind(name)
            .fetch_optional(&mut *self.conn)
            .await
            .map_err(db_err)?;
        row.map(|r| user_from_row(&r))
            .unwrap_or(Err(StoreError::not_found(USER)))
    }

    async fn list_users(
        &mut self,
        after: Option<Uuid>,
        limit: u32,
    ) -> Result<Vec<User>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, name, public_key, state FROM users
             WHERE (?1 IS NULL OR id > ?1)
             ORDER BY id
             LIMIT ?2",
        )
        .bind(after.map(|id| id.to_string()))
        .bind(i64::from(limit))
        .fetch_all(&mut *self.conn)
        .await
        .map_err(db_err)?;
        rows.iter().map(user_from_row).collect()
    }

    async fn insert_user(&mut self, user: &User) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO users (id, name, public_key, state) VALUES (?, ?, ?, ?)")
            .bind(user.id.to_string())
            .bind(&user.name)
            .bind(user.public_key.as_ref().map(|k| k.to_bytes().to_vec()))
            .bind(user.state.code())
            .execute(&mut *self.conn)
            .await
            .map_err(|e| conflict_or(e, USER))?;
        tracing::debug!(user_id = %user.id, "user row inserted");
        Ok(())
    }

    async fn update_user(&mut self, user: &User) -> Result<(), StoreError> {
        let result =
            sqlx::query("UPDATE users SET name = ?, public_key = ?, state = ? WHERE id = ?")
                .bind(&user.name)
                .bind(user.public_key.as_ref().map(|k| k.to_bytes().to_vec()))
                .bind(user.state.code())
                .bind(user.id.to_string())
                .execute(&mut *self.conn)
                .await
                .map_err(|e| conflict_or(e, USER))?;
        require_row(result.rows_affected(), USER)
    }

    async fn delete_user(&mut self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut *self.conn)
            .await
            .map_err(db_err)?;
        require_row(result.rows_affected(), USER)
    }

    async fn save_invite(&mut self, invite: &Invite) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO user_invites (user_id, token, not_before, not_after)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(user_id) DO UPDATE SET
                 token = excluded.token,
                 not_before = excluded.not_before,
                 not_after = excluded.not_after",
        )
        .bind(invite.user_id.to_string())
        .bind(invite.token.as_bytes().to_vec())
        .bind(invite.not_before.to_rfc3339())
        .bind(invite.not_after.to_rfc3339())
        .execute(&mut *self.conn)
        .await
        .map_err(|e| conflict_or(e, INVITE))?;
        Ok(())
    }

    async fn get_invite(&mut self, user_id: Uuid) -> Result<Invite, StoreError> {
        let row = sqlx::query(
            "SELECT user_id, token, not_before, not_after FROM user_invites WHERE user_id = ?",
        )
        .bind(user_id.to_string())
        .fetch_optional(&mut *self.conn)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::not_found(INVITE))?;

        Ok(Invite {
            user_id: uuid_col(&row, "user_id", INVITE)?,
            token: secret_col(&row, "token", INVITE)?,
            not_before: time_col(&row, "not_before", INVITE)?,
            not_after: time_col(&row, "not_after", INVITE)?,
        })
    }

    async fn delete_invite(&mut self, user_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM user_invites WHERE user_id = ?")
            .bind(user_id.to_string())
            .execute(&mut *self.conn)
            .await
            .map_err(db_err)?;
        require_row(result.rows_affected(), INVITE)
    }

    async fn save_nonce(&mut self, nonce: &LoginNonce) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO login_nonces (user_id, nonce, created_at)
             VALUES (?, ?, ?)
             ON CONFLICT(user_id) DO UPDATE SET
                 nonce = excluded.nonce,
                 created_at = excluded.created_at",
        )
        .bind(nonce.user_id.to_string())
        .bind(nonce.nonce.as_bytes().to_vec())
        .bind(nonce.created_at.to_rfc3339())
        .execute(&mut *self.conn)
        .await
        .map_err(|e| conflict_or(e, NONCE))?;
        Ok(())
    }

    async fn consume_nonce(&mut self, user_id: Uuid) -> Result<LoginNonce, StoreError> {
        // One statement: a concurrent consumer either deletes the row first
        // or finds nothing to delete.
        let row = sqlx::query(
            "DELETE FROM login_nonces WHERE user_id = ? RETURNING user_id, nonce, created_at",
        )
        .bind(user_id.to_string())
        .fetch_optional(&mut *self.conn)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::not_found(NONCE))?;

        Ok(LoginNonce {
            user_id: uuid_col(&row, "user_id", NONCE)?,
            nonce: secret_col(&row, "nonce", NONCE)?,
            created_at: time_col(&row, "created_at", NONCE)?,
        })
    }

    async fn delete_nonce(&mut self, user_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM login_nonces WHERE user_id = ?")
            .bind(user_id.to_string())
            .execute(&mut *self.conn)
            .await
            .map_err(db_err)?;
        require_row(result.rows_affected(), NONCE)
    }

    async fn save_session(&mut self, session: &Session) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO user_sessions (id, user_id, token, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(session.id.to_string())
        .bind(session.user_id.to_string())
        .bind(session.token.as_bytes().to_vec())
        .bind(session.created_at.to_rfc3339())
        .execute(&mut *self.conn)
        .await
        .map_err(|e| conflict_or(e, SESSION))?;
        Ok(())
    }

    async fn get_session(&mut self, id: Uuid) -> Result<Session, StoreError> {
        let row = sqlx::query(
            "SELECT id, user_id, token, created_at FROM user_sessions WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&mut *self.conn)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::not_found(SESSION))?;

        Ok(Session {
            id: uuid_col(&row, "id", SESSION)?,
            user_id: uuid_col(&row, "user_id", SESSION)?,
            token: secret_col(&row, "token", SESSION)?,
            created_at: time_col(&row, "created_at", SESSION)?,
        })
    }

    async fn delete_session(&mut self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM user_sessions WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut *self.conn)
            .await
            .map_err(db_err)?;
        require_row(result.rows_affected(), SESSION)
    }

    async fn delete_sessions_for_user(&mut self, user_id: Uuid) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM user_sessions WHERE user_id = ?")
            .bind(user_id.to_string())
            .execute(&mut *self.conn)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected())
    }
}

fn db_err(err: sqlx::Error) -> StoreError {
    StoreError::backend(err)
}

fn conflict_or(err: sqlx::Error, entity: &'static str) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict { entity },
        _ => StoreError::backend(err),
    }
}

fn require_row(rows_affected: u64, entity: &'static str) -> Result<(), StoreError> {
    if rows_affected == 0 {
        Err(StoreError::not_found(entity))
    } else {
        Ok(())
    }
}

fn corrupt(entity: &'static str, reason: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt {
        entity,
        reason: reason.to_string(),
    }
}

fn uuid_col(row: &SqliteRow, column: &str, entity: &'static str) -> Result<Uuid, StoreError> {
    let text: String = row.try_get(column).map_err(db_err)?;
    Uuid::parse_str(&text).map_err(|e| corrupt(entity, e))
}

fn secret_col(
    row: &SqliteRow,
    column: &str,
    entity: &'static str,
) -> Result<SecretToken, StoreError> {
    let bytes: Vec<u8> = row.try_get(column).map_err(db_err)?;
    SecretToken::from_slice(&bytes)
        .ok_or_else(|| corrupt(entity, format!("{column} has {} bytes", bytes.len())))
}

fn time_col(
    row: &SqliteRow,
    column: &str,
    entity: &'static str,
) -> Result<DateTime<Utc>, StoreError> {
    let text: String = row.try_get(column).map_err(db_err)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| corrupt(entity, e))
}

fn user_from_row(row: &SqliteRow) -> Result<User, StoreError> {
    let public_key = row
        .try_get::<Option<Vec<u8>>, _>("public_key")
        .map_err(db_err)?
        .map(|bytes| PublicKey::from_bytes(&bytes))
        .transpose()
        .map_err(|e| corrupt(USER, e))?;
    let code: i64 = row.try_get("state").map_err(db_err)?;
    let state = UserState::from_code(code).ok_or_else(|| corrupt(USER, format!("state {code}")))?;

    Ok(User {
        id: uuid_col(row, "id", USER)?,
        name: row.try_get("name").map_err(db_err)?,
        public_key,
        state,
    })
}
