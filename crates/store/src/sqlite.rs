//! SQLite backend for threads, messages, responses, summaries and profiles.
//!
//! Uses a single SQLite database file with five tables:
//! - `threads`   — one row per conversation
//! - `messages`  — append-only history, ordered by a per-thread `seq`
//! - `responses` — one row per orchestrated turn
//! - `summaries` — at most one folded digest per thread
//! - `profiles`  — user facts, unique by key
//!
//! Connections run in WAL mode with foreign keys enforced. Writes go through
//! a single in-process gate: SQLite allows one writer, and a deferred
//! transaction that upgrades to a write lock fails with `SQLITE_BUSY`
//! instead of waiting.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use localapi_core::error::StoreError;
use localapi_core::message::{Message, Role, ThreadId};
use localapi_core::provider::Usage;
use localapi_core::response::{ResponseDetail, ResponseRecord, ResponseStatus};
use localapi_core::store::{MessageWindow, Store};
use localapi_core::thread::{ProfileFact, Summary, Thread};
use localapi_core::token::estimate_message_tokens;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// A production SQLite store.
pub struct SqliteStore {
    pool: SqlitePool,
    write_gate: tokio::sync::Mutex<()>,
}

fn is_memory_path(path: &str) -> bool {
    matches!(path, ":memory:" | "sqlite::memory:" | "sqlite://:memory:")
}

impl SqliteStore {
    /// Open (or create) the database at `path` and apply the schema.
    ///
    /// Pass `"sqlite::memory:"` for an in-process ephemeral database (useful
    /// for tests). Missing parent directories of a file path are created.
    pub async fn new(path: &str) -> Result<Self, StoreError> {
        let memory = is_memory_path(path);

        let options = if memory {
            SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| StoreError::Storage(format!("Invalid SQLite path: {e}")))?
        } else {
            if let Some(parent) = Path::new(path).parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Storage(format!("Cannot create {}: {e}", parent.display())))?;
            }
            SqliteConnectOptions::new().filename(path)
        };

        let options = options
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .pragma("foreign_keys", "ON")
            .pragma("temp_store", "MEMORY");

        // Every connection to `:memory:` is its own database, so keep exactly one alive
        let pool_options = if memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(4)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Storage(format!("Failed to open SQLite: {e}")))?;

        let store = Self {
            pool,
            write_gate: tokio::sync::Mutex::new(()),
        };
        store.run_migrations().await?;
        info!("SQLite store initialized at {path}");
        Ok(store)
    }

    /// Close the pool, flushing the WAL.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Create tables and indexes if they do not exist.
    async fn run_migrations(&self) -> Result<(), StoreError> {
        let statements: [(&str, &str); 7] = [
            (
                "threads table",
                r#"
                CREATE TABLE IF NOT EXISTS threads (
                    id          TEXT PRIMARY KEY,
                    created_at  TEXT NOT NULL
                )
                "#,
            ),
            (
                "messages table",
                r#"
                CREATE TABLE IF NOT EXISTS messages (
                    id          TEXT PRIMARY KEY,
                    thread_id   TEXT NOT NULL REFERENCES threads(id) ON DELETE CASCADE,
                    seq         INTEGER NOT NULL,
                    role        TEXT NOT NULL CHECK (role IN ('user', 'assistant', 'system', 'tool')),
                    content     TEXT NOT NULL,
                    token_count INTEGER NOT NULL DEFAULT 0,
                    created_at  TEXT NOT NULL,
                    UNIQUE (thread_id, seq)
                )
                "#,
            ),
            (
                "responses table",
                r#"
                CREATE TABLE IF NOT EXISTS responses (
                    id                  TEXT PRIMARY KEY,
                    thread_id           TEXT NOT NULL REFERENCES threads(id) ON DELETE CASCADE,
                    request_message_id  TEXT REFERENCES messages(id),
                    response_message_id TEXT REFERENCES messages(id),
                    status              TEXT NOT NULL CHECK (status IN ('in_progress', 'completed', 'failed')),
                    usage_json          TEXT NOT NULL DEFAULT '{}',
                    error_text          TEXT,
                    created_at          TEXT NOT NULL
                )
                "#,
            ),
            (
                "summaries table",
                r#"
                CREATE TABLE IF NOT EXISTS summaries (
                    thread_id      TEXT PRIMARY KEY REFERENCES threads(id) ON DELETE CASCADE,
                    content        TEXT NOT NULL,
                    folded_through INTEGER NOT NULL DEFAULT 0,
                    created_at     TEXT NOT NULL
                )
                "#,
            ),
            (
                "profiles table",
                r#"
                CREATE TABLE IF NOT EXISTS profiles (
                    id          TEXT PRIMARY KEY,
                    key         TEXT UNIQUE NOT NULL,
                    settings    TEXT NOT NULL,
                    created_at  TEXT NOT NULL
                )
                "#,
            ),
            (
                "messages index",
                "CREATE INDEX IF NOT EXISTS idx_messages_thread_seq ON messages(thread_id, seq)",
            ),
            (
                "responses index",
                "CREATE INDEX IF NOT EXISTS idx_responses_thread ON responses(thread_id)",
            ),
        ];

        for (what, sql) in statements {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::MigrationFailed(format!("{what}: {e}")))?;
        }

        debug!("SQLite migrations complete");
        Ok(())
    }

    /// Insert a message with the next `seq` of its thread.
    async fn insert_message<'e, E>(executor: E, thread_id: &ThreadId, role: Role, content: &str) -> Result<Message, StoreError>
    where
        E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
    {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let token_count = estimate_message_tokens(content);

        let row = sqlx::query(
            r#"
            INSERT INTO messages (id, thread_id, seq, role, content, token_count, created_at)
            VALUES (
                ?1, ?2,
                (SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE thread_id = ?2),
                ?3, ?4, ?5, ?6
            )
            RETURNING seq
            "#,
        )
        .bind(&id)
        .bind(thread_id.as_str())
        .bind(role.as_str())
        .bind(content)
        .bind(token_count as i64)
        .bind(now.to_rfc3339())
        .fetch_one(executor)
        .await
        .map_err(|e| StoreError::Storage(format!("INSERT message failed: {e}")))?;

        let seq: i64 = row
            .try_get("seq")
            .map_err(|e| StoreError::QueryFailed(format!("seq column: {e}")))?;

        Ok(Message {
            id,
            thread_id: thread_id.clone(),
            seq,
            role,
            content: content.to_string(),
            token_count,
            created_at: now,
        })
    }

    fn row_to_message(row: &SqliteRow) -> Result<Message, StoreError> {
        let role: String = column(row, "role")?;
        let token_count: i64 = column(row, "token_count")?;
        Ok(Message {
            id: column(row, "id")?,
            thread_id: ThreadId(column(row, "thread_id")?),
            seq: column(row, "seq")?,
            role: role.parse().map_err(StoreError::QueryFailed)?,
            content: column(row, "content")?,
            token_count: token_count.max(0) as usize,
            created_at: parse_time(&column::<String>(row, "created_at")?),
        })
    }

    fn row_to_response(row: &SqliteRow) -> Result<ResponseRecord, StoreError> {
        let status: String = column(row, "status")?;
        let usage_json: String = column(row, "usage_json")?;
        Ok(ResponseRecord {
            id: column(row, "id")?,
            thread_id: ThreadId(column(row, "thread_id")?),
            request_message_id: column(row, "request_message_id")?,
            response_message_id: column(row, "response_message_id")?,
            status: status.parse().map_err(StoreError::QueryFailed)?,
            usage: serde_json::from_str(&usage_json).unwrap_or_default(),
            error: column(row, "error_text")?,
            created_at: parse_time(&column::<String>(row, "created_at")?),
        })
    }

    fn row_to_profile(row: &SqliteRow) -> Result<ProfileFact, StoreError> {
        let settings: String = column(row, "settings")?;
        Ok(ProfileFact {
            id: column(row, "id")?,
            key: column(row, "key")?,
            value: serde_json::from_str(&settings)
                .map_err(|e| StoreError::QueryFailed(format!("settings column: {e}")))?,
            created_at: parse_time(&column::<String>(row, "created_at")?),
        })
    }

    async fn response_status(&self, response_id: &str) -> Result<Option<ResponseStatus>, StoreError> {
        let row = sqlx::query("SELECT status FROM responses WHERE id = ?1")
            .bind(response_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("response status: {e}")))?;

        row.map(|r| {
            column::<String>(&r, "status")?
                .parse()
                .map_err(StoreError::QueryFailed)
        })
        .transpose()
    }

    fn transition_error(response_id: &str, current: Option<ResponseStatus>, next: ResponseStatus) -> StoreError {
        match current {
            None => StoreError::NotFound(format!("response {response_id}")),
            Some(current) => StoreError::InvalidState(format!(
                "response {response_id} is {current}, cannot become {next}"
            )),
        }
    }
}

fn column<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(name)
        .map_err(|e| StoreError::QueryFailed(format!("{name} column: {e}")))
}

fn parse_time(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn usage_json(usage: &Usage) -> Result<String, StoreError> {
    serde_json::to_string(usage).map_err(|e| StoreError::Storage(format!("Usage serialization: {e}")))
}

#[async_trait]
impl Store for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn create_thread(&self) -> Result<Thread, StoreError> {
        let _write_guard = self.write_gate.lock().await;
        let thread = Thread {
            id: ThreadId::new(),
            created_at: Utc::now(),
        };

        sqlx::query("INSERT INTO threads (id, created_at) VALUES (?1, ?2)")
            .bind(thread.id.as_str())
            .bind(thread.created_at.to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("INSERT thread failed: {e}")))?;

        debug!(thread_id = %thread.id, "Created thread");
        Ok(thread)
    }

    async fn ensure_thread(&self, thread_id: &ThreadId) -> Result<Thread, StoreError> {
        let _write_guard = self.write_gate.lock().await;
        sqlx::query("INSERT INTO threads (id, created_at) VALUES (?1, ?2) ON CONFLICT(id) DO NOTHING")
            .bind(thread_id.as_str())
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("INSERT thread failed: {e}")))?;

        let row = sqlx::query("SELECT id, created_at FROM threads WHERE id = ?1")
            .bind(thread_id.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("SELECT thread: {e}")))?;

        Ok(Thread {
            id: ThreadId(column(&row, "id")?),
            created_at: parse_time(&column::<String>(&row, "created_at")?),
        })
    }

    async fn thread_exists(&self, thread_id: &ThreadId) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 FROM threads WHERE id = ?1")
            .bind(thread_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("thread lookup: {e}")))?;
        Ok(row.is_some())
    }

    async fn thread_for_response(&self, response_id: &str) -> Result<Option<ThreadId>, StoreError> {
        let row = sqlx::query("SELECT thread_id FROM responses WHERE id = ?1")
            .bind(response_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("response lookup: {e}")))?;

        row.map(|r| column::<String>(&r, "thread_id").map(ThreadId))
            .transpose()
    }

    async fn append_message(&self, thread_id: &ThreadId, role: Role, content: &str) -> Result<Message, StoreError> {
        let _write_guard = self.write_gate.lock().await;
        Self::insert_message(&self.pool, thread_id, role, content).await
    }

    async fn list_recent_messages(&self, thread_id: &ThreadId, window: MessageWindow) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM (
                SELECT id, thread_id, seq, role, content, token_count, created_at
                FROM messages
                WHERE thread_id = ?1
                  AND (?2 IS NULL OR seq > ?2)
                  AND (?3 IS NULL OR seq < ?3)
                ORDER BY seq DESC
                LIMIT ?4
            )
            ORDER BY seq ASC
            "#,
        )
        .bind(thread_id.as_str())
        .bind(window.after_seq)
        .bind(window.before_seq)
        .bind(window.limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("recent messages: {e}")))?;

        rows.iter().map(Self::row_to_message).collect()
    }

    async fn count_messages(&self, thread_id: &ThreadId) -> Result<usize, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM messages WHERE thread_id = ?1")
            .bind(thread_id.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("COUNT failed: {e}")))?;

        let n: i64 = column(&row, "n")?;
        Ok(n as usize)
    }

    async fn get_summary(&self, thread_id: &ThreadId) -> Result<Option<Summary>, StoreError> {
        let row = sqlx::query("SELECT thread_id, content, folded_through, created_at FROM summaries WHERE thread_id = ?1")
            .bind(thread_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("summary lookup: {e}")))?;

        row.map(|r| -> Result<Summary, StoreError> {
            Ok(Summary {
                thread_id: ThreadId(column(&r, "thread_id")?),
                content: column(&r, "content")?,
                folded_through: column(&r, "folded_through")?,
                created_at: parse_time(&column::<String>(&r, "created_at")?),
            })
        })
        .transpose()
    }

    async fn upsert_summary(&self, thread_id: &ThreadId, content: &str, folded_through: i64) -> Result<Summary, StoreError> {
        let _write_guard = self.write_gate.lock().await;
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO summaries (thread_id, content, folded_through, created_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(thread_id) DO UPDATE SET
                content = excluded.content,
                folded_through = excluded.folded_through,
                created_at = excluded.created_at
            "#,
        )
        .bind(thread_id.as_str())
        .bind(content)
        .bind(folded_through)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("UPSERT summary failed: {e}")))?;

        debug!(thread_id = %thread_id, folded_through, "Summary replaced");
        Ok(Summary {
            thread_id: thread_id.clone(),
            content: content.to_string(),
            folded_through,
            created_at: now,
        })
    }

    async fn upsert_profile_fact(&self, key: &str, value: serde_json::Value) -> Result<ProfileFact, StoreError> {
        let _write_guard = self.write_gate.lock().await;
        let settings =
            serde_json::to_string(&value).map_err(|e| StoreError::Storage(format!("Profile serialization: {e}")))?;

        let row = sqlx::query(
            r#"
            INSERT INTO profiles (id, key, settings, created_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(key) DO UPDATE SET
                settings = excluded.settings,
                created_at = excluded.created_at
            RETURNING id, key, settings, created_at
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(key)
        .bind(&settings)
        .bind(Utc::now().to_rfc3339())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("UPSERT profile failed: {e}")))?;

        Self::row_to_profile(&row)
    }

    async fn list_profile_facts(&self) -> Result<Vec<ProfileFact>, StoreError> {
        let rows = sqlx::query("SELECT id, key, settings, created_at FROM profiles ORDER BY key")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("profile list: {e}")))?;

        rows.iter().map(Self::row_to_profile).collect()
    }

    async fn begin_turn(&self, thread_id: &ThreadId, user_text: &str) -> Result<(Message, ResponseRecord), StoreError> {
        let _write_guard = self.write_gate.lock().await;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Storage(format!("BEGIN failed: {e}")))?;

        let message = Self::insert_message(&mut *tx, thread_id, Role::User, user_text).await?;

        let record = ResponseRecord {
            id: Uuid::new_v4().to_string(),
            thread_id: thread_id.clone(),
            request_message_id: Some(message.id.clone()),
            response_message_id: None,
            status: ResponseStatus::InProgress,
            usage: Usage::default(),
            error: None,
            created_at: Utc::now(),
        };

        sqlx::query(
            r#"
            INSERT INTO responses (id, thread_id, request_message_id, response_message_id, status, usage_json, error_text, created_at)
            VALUES (?1, ?2, ?3, NULL, ?4, ?5, NULL, ?6)
            "#,
        )
        .bind(&record.id)
        .bind(thread_id.as_str())
        .bind(&message.id)
        .bind(record.status.as_str())
        .bind(usage_json(&record.usage)?)
        .bind(record.created_at.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Storage(format!("INSERT response failed: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Storage(format!("COMMIT failed: {e}")))?;

        Ok((message, record))
    }

    async fn complete_turn(&self, response_id: &str, assistant_text: &str, usage: &Usage) -> Result<Message, StoreError> {
        let _write_guard = self.write_gate.lock().await;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Storage(format!("BEGIN failed: {e}")))?;

        let row = sqlx::query("SELECT thread_id, status FROM responses WHERE id = ?1")
            .bind(response_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("response lookup: {e}")))?
            .ok_or_else(|| StoreError::NotFound(format!("response {response_id}")))?;

        let status: ResponseStatus = column::<String>(&row, "status")?
            .parse()
            .map_err(StoreError::QueryFailed)?;
        if !status.can_transition_to(ResponseStatus::Completed) {
            return Err(Self::transition_error(response_id, Some(status), ResponseStatus::Completed));
        }
        let thread_id = ThreadId(column(&row, "thread_id")?);

        let message = Self::insert_message(&mut *tx, &thread_id, Role::Assistant, assistant_text).await?;

        sqlx::query(
            r#"
            UPDATE responses
            SET response_message_id = ?1, status = ?2, usage_json = ?3, error_text = NULL
            WHERE id = ?4
            "#,
        )
        .bind(&message.id)
        .bind(ResponseStatus::Completed.as_str())
        .bind(usage_json(usage)?)
        .bind(response_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Storage(format!("UPDATE response failed: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Storage(format!("COMMIT failed: {e}")))?;

        Ok(message)
    }

    async fn update_response_status(
        &self,
        response_id: &str,
        status: ResponseStatus,
        usage: Option<&Usage>,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        if !status.is_terminal() {
            let current = self.response_status(response_id).await?;
            return Err(Self::transition_error(response_id, current, status));
        }
        let usage = usage.map(usage_json).transpose()?;

        let _write_guard = self.write_gate.lock().await;
        let result = sqlx::query(
            r#"
            UPDATE responses
            SET status = ?1, usage_json = COALESCE(?2, usage_json), error_text = ?3
            WHERE id = ?4 AND status = 'in_progress'
            "#,
        )
        .bind(status.as_str())
        .bind(usage)
        .bind(error)
        .bind(response_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("UPDATE response failed: {e}")))?;

        if result.rows_affected() == 0 {
            let current = self.response_status(response_id).await?;
            return Err(Self::transition_error(response_id, current, status));
        }

        Ok(())
    }

    async fn get_response(&self, response_id: &str) -> Result<Option<ResponseRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM responses WHERE id = ?1")
            .bind(response_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("response lookup: {e}")))?;

        row.as_ref().map(Self::row_to_response).transpose()
    }

    async fn get_response_detail(&self, response_id: &str) -> Result<Option<ResponseDetail>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT r.id, r.thread_id, r.status, r.usage_json, r.error_text, m.content AS output_text
            FROM responses r
            LEFT JOIN messages m ON m.id = r.response_message_id
            WHERE r.id = ?1
            "#,
        )
        .bind(response_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("response detail: {e}")))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let status: String = column(&row, "status")?;
        let usage: String = column(&row, "usage_json")?;
        let output_text: Option<String> = column(&row, "output_text")?;

        Ok(Some(ResponseDetail {
            response_id: column(&row, "id")?,
            thread_id: ThreadId(column(&row, "thread_id")?),
            status: status.parse().map_err(StoreError::QueryFailed)?,
            output_text: output_text.unwrap_or_default(),
            usage: serde_json::from_str(&usage).unwrap_or_default(),
            error: column(&row, "error_text")?,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> SqliteStore {
        SqliteStore::new("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let store = test_store().await;
        store.run_migrations().await.unwrap();
        store.run_migrations().await.unwrap();
    }

    #[tokio::test]
    async fn foreign_keys_reject_orphan_messages() {
        let store = test_store().await;
        let err = store
            .append_message(&ThreadId::from("missing"), Role::User, "hello")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Storage(_)));
    }

    #[tokio::test]
    async fn seq_is_per_thread() {
        let store = test_store().await;
        let a = store.create_thread().await.unwrap();
        let b = store.create_thread().await.unwrap();

        let a1 = store.append_message(&a.id, Role::User, "a1").await.unwrap();
        let b1 = store.append_message(&b.id, Role::User, "b1").await.unwrap();
        let a2 = store.append_message(&a.id, Role::Assistant, "a2").await.unwrap();

        assert_eq!((a1.seq, a2.seq, b1.seq), (1, 2, 1));
    }

    #[tokio::test]
    async fn file_database_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("local_api.db");
        let path = path.to_str().unwrap();

        let thread_id = {
            let store = SqliteStore::new(path).await.unwrap();
            let thread = store.create_thread().await.unwrap();
            store.append_message(&thread.id, Role::User, "remember me").await.unwrap();
            store.close().await;
            thread.id
        };

        let store = SqliteStore::new(path).await.unwrap();
        let messages = store
            .list_recent_messages(&thread_id, MessageWindow::latest(10))
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "remember me");
    }

    #[tokio::test]
    async fn usage_json_survives_storage() {
        let store = test_store().await;
        let thread = store.create_thread().await.unwrap();
        let (_, record) = store.begin_turn(&thread.id, "Hello!").await.unwrap();
        store
            .complete_turn(&record.id, "Hi there!", &Usage::new(12, 3))
            .await
            .unwrap();

        let stored = store.get_response(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.usage, Usage::new(12, 3));
        assert_eq!(stored.status, ResponseStatus::Completed);
    }
}
