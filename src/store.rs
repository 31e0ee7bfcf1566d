use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Pool, Row, Sqlite};
use std::path::PathBuf;

/// Creates the database file and its parent directory for file-backed
/// `sqlite://` DSNs. In-memory DSNs are left alone.
pub fn ensure_sqlite_file(dsn: &str) -> Result<(), String> {
    let dsn = dsn.trim();
    if !dsn.starts_with("sqlite://") || is_memory_dsn(dsn) {
        return Ok(());
    }
    let path_part = dsn.trim_start_matches("sqlite://");
    let path_part = path_part.split('?').next().unwrap_or("");
    if path_part.is_empty() {
        return Ok(());
    }
    let path = PathBuf::from(path_part);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|err| format!("sqlite_dir_create_failed: {err}"))?;
        }
    }
    if !path.exists() {
        std::fs::File::create(&path).map_err(|err| format!("sqlite_file_create_failed: {err}"))?;
    }
    Ok(())
}

pub fn is_memory_dsn(dsn: &str) -> bool {
    dsn.contains(":memory:") || dsn.contains("mode=memory")
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Chat {
    pub id: i64,
    pub name: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatWithMessages {
    #[serde(flatten)]
    pub chat: Chat,
    pub messages: Vec<StoredMessage>,
}

/// A persisted message as the UI reads it back. JSON columns are decoded
/// when they parse and returned as plain strings otherwise.
#[derive(Debug, Clone, Serialize)]
pub struct StoredMessage {
    pub id: i64,
    pub chat_id: i64,
    pub role: String,
    pub content: String,
    pub raw_content: String,
    pub model: String,
    pub thinking: bool,
    pub done: bool,
    pub function_name: String,
    pub function_call: Value,
    pub function_response: String,
    pub tool_calls: Value,
    pub usage_prompt_tokens: Option<i64>,
    pub usage_completion_tokens: Option<i64>,
    pub usage_total_tokens: Option<i64>,
    pub usage_estimated: bool,
    pub annotations: Value,
    pub annotation_sources: Value,
    pub created_at: i64,
}

/// Body of `POST /v1/messages/{chat_id}`. Accepts both the snake_case column
/// names and the camelCase names the UI uses.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NewMessage {
    pub role: Option<String>,
    pub content: Option<String>,
    #[serde(alias = "rawContent")]
    pub raw_content: Option<String>,
    pub model: Option<String>,
    pub thinking: Option<bool>,
    pub done: Option<bool>,
    #[serde(alias = "functionName")]
    pub function_name: Option<String>,
    #[serde(alias = "functionCall")]
    pub function_call: Option<Value>,
    #[serde(alias = "functionResponse")]
    pub function_response: Option<String>,
    #[serde(alias = "toolCalls")]
    pub tool_calls: Option<Value>,
    pub annotations: Option<Value>,
    #[serde(alias = "annotationSources")]
    pub annotation_sources: Option<Value>,
    pub usage: Option<Value>,
    pub usage_prompt_tokens: Option<Value>,
    pub usage_completion_tokens: Option<Value>,
    pub usage_total_tokens: Option<Value>,
    pub usage_estimated: Option<bool>,
}

impl NewMessage {
    fn usage_counter(&self, direct: &Option<Value>, key: &str) -> Option<i64> {
        let from_usage = self.usage.as_ref().and_then(|u| u.get(key));
        direct
            .as_ref()
            .filter(|v| !v.is_null())
            .or(from_usage)
            .and_then(non_negative_int)
    }

    fn usage_estimated(&self) -> bool {
        self.usage_estimated.unwrap_or_else(|| {
            self.usage
                .as_ref()
                .and_then(|u| u.get("estimated"))
                .and_then(Value::as_bool)
                .unwrap_or(false)
        })
    }
}

/// Editable fields of a stored message.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MessageUpdate {
    pub content: Option<String>,
    #[serde(alias = "rawContent")]
    pub raw_content: Option<String>,
    pub done: Option<bool>,
    pub thinking: Option<bool>,
}

impl MessageUpdate {
    pub fn is_empty(&self) -> bool {
        self.content.is_none()
            && self.raw_content.is_none()
            && self.done.is_none()
            && self.thinking.is_none()
    }
}

#[derive(Clone)]
pub struct ChatStore {
    pool: Pool<Sqlite>,
}

impl ChatStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, String> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS chats (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                chat_id INTEGER NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
                role TEXT NOT NULL,
                content TEXT NOT NULL DEFAULT '',
                raw_content TEXT NOT NULL DEFAULT '',
                model TEXT NOT NULL DEFAULT '',
                thinking INTEGER NOT NULL DEFAULT 0,
                done INTEGER NOT NULL DEFAULT 1,
                function_name TEXT NOT NULL DEFAULT '',
                function_call TEXT NOT NULL DEFAULT '',
                function_response TEXT NOT NULL DEFAULT '',
                tool_calls TEXT NOT NULL DEFAULT '[]',
                usage_prompt_tokens INTEGER,
                usage_completion_tokens INTEGER,
                usage_total_tokens INTEGER,
                usage_estimated INTEGER NOT NULL DEFAULT 0,
                annotations TEXT NOT NULL DEFAULT '[]',
                annotation_sources TEXT NOT NULL DEFAULT '[]',
                created_at INTEGER NOT NULL
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_chat_id ON messages(chat_id)")
            .execute(&pool)
            .await
            .map_err(|e| e.to_string())?;

        Ok(Self { pool })
    }

    pub async fn list_chats(&self) -> Result<Vec<Chat>, String> {
        let rows = sqlx::query_as::<_, (i64, String, i64, i64)>(
            "SELECT id, name, created_at, updated_at FROM chats ORDER BY updated_at DESC, id DESC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(rows.into_iter().map(chat_from_tuple).collect())
    }

    pub async fn get_chat(&self, id: i64) -> Result<Option<Chat>, String> {
        let row = sqlx::query_as::<_, (i64, String, i64, i64)>(
            "SELECT id, name, created_at, updated_at FROM chats WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(row.map(chat_from_tuple))
    }

    pub async fn create_chat(&self, name: &str) -> Result<Chat, String> {
        let now = now_secs();
        let result =
            sqlx::query("INSERT INTO chats (name, created_at, updated_at) VALUES (?, ?, ?)")
                .bind(name)
                .bind(now)
                .bind(now)
                .execute(&self.pool)
                .await
                .map_err(|e| e.to_string())?;
        Ok(Chat {
            id: result.last_insert_rowid(),
            name: name.to_string(),
            created_at: now,
            updated_at: now,
        })
    }

    pub async fn update_chat(&self, id: i64, name: &str) -> Result<Option<Chat>, String> {
        sqlx::query("UPDATE chats SET name = ?, updated_at = ? WHERE id = ?")
            .bind(name)
            .bind(now_secs())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        self.get_chat(id).await
    }

    /// Deletes the chat and, through the foreign key, its messages.
    pub async fn delete_chat(&self, id: i64) -> Result<bool, String> {
        let result = sqlx::query("DELETE FROM chats WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn clear_chat(&self, id: i64) -> Result<u64, String> {
        let result = sqlx::query("DELETE FROM messages WHERE chat_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        Ok(result.rows_affected())
    }

    pub async fn list_messages(&self, chat_id: i64) -> Result<Vec<StoredMessage>, String> {
        let rows = sqlx::query("SELECT * FROM messages WHERE chat_id = ? ORDER BY id ASC")
            .bind(chat_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        rows.iter()
            .map(|row| message_from_row(row).map_err(|e| e.to_string()))
            .collect()
    }

    pub async fn get_message(&self, id: i64) -> Result<Option<StoredMessage>, String> {
        let row = sqlx::query("SELECT * FROM messages WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        row.as_ref()
            .map(message_from_row)
            .transpose()
            .map_err(|e| e.to_string())
    }

    /// Inserts a message and bumps the chat's `updated_at`.
    pub async fn add_message(&self, chat_id: i64, msg: NewMessage) -> Result<StoredMessage, String> {
        let now = now_secs();
        let content = msg.content.clone().unwrap_or_default();
        let raw_content = msg
            .raw_content
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| content.clone());
        let role = msg
            .role
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "user".to_string());
        let prompt = msg.usage_counter(&msg.usage_prompt_tokens, "prompt_tokens");
        let completion = msg.usage_counter(&msg.usage_completion_tokens, "completion_tokens");
        let total = msg.usage_counter(&msg.usage_total_tokens, "total_tokens");

        let mut tx = self.pool.begin().await.map_err(|e| e.to_string())?;
        let result = sqlx::query(
            r#"INSERT INTO messages (
                chat_id, role, content, raw_content, model, thinking, done,
                function_name, function_call, function_response, tool_calls,
                usage_prompt_tokens, usage_completion_tokens, usage_total_tokens, usage_estimated,
                annotations, annotation_sources, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(chat_id)
        .bind(&role)
        .bind(&content)
        .bind(&raw_content)
        .bind(msg.model.clone().unwrap_or_default())
        .bind(msg.thinking.unwrap_or(false))
        .bind(msg.done.unwrap_or(true))
        .bind(msg.function_name.clone().unwrap_or_default())
        .bind(json_column(msg.function_call.as_ref(), ""))
        .bind(msg.function_response.clone().unwrap_or_default())
        .bind(json_column(msg.tool_calls.as_ref(), "[]"))
        .bind(prompt)
        .bind(completion)
        .bind(total)
        .bind(msg.usage_estimated())
        .bind(json_column(msg.annotations.as_ref(), "[]"))
        .bind(json_column(msg.annotation_sources.as_ref(), "[]"))
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| e.to_string())?;
        sqlx::query("UPDATE chats SET updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(chat_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| e.to_string())?;
        tx.commit().await.map_err(|e| e.to_string())?;

        let id = result.last_insert_rowid();
        self.get_message(id)
            .await?
            .ok_or_else(|| format!("message {id} vanished after insert"))
    }

    /// Returns false when nothing was updated: no editable field given or
    /// no such message.
    pub async fn update_message(&self, id: i64, update: MessageUpdate) -> Result<bool, String> {
        if update.is_empty() {
            return Ok(false);
        }
        let result = sqlx::query(
            r#"UPDATE messages SET
                content = COALESCE(?, content),
                raw_content = COALESCE(?, raw_content),
                done = COALESCE(?, done),
                thinking = COALESCE(?, thinking)
            WHERE id = ?"#,
        )
        .bind(update.content)
        .bind(update.raw_content)
        .bind(update.done)
        .bind(update.thinking)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_message(&self, id: i64) -> Result<bool, String> {
        let result = sqlx::query("DELETE FROM messages WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        Ok(result.rows_affected() > 0)
    }

    /// The most recently updated chat with its messages. An empty store
    /// gets a chat named `Default`.
    pub async fn current_chat(&self) -> Result<ChatWithMessages, String> {
        let chat = match self.list_chats().await?.into_iter().next() {
            Some(chat) => chat,
            None => self.create_chat("Default").await?,
        };
        let messages = self.list_messages(chat.id).await?;
        Ok(ChatWithMessages { chat, messages })
    }
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

fn chat_from_tuple((id, name, created_at, updated_at): (i64, String, i64, i64)) -> Chat {
    Chat {
        id,
        name,
        created_at,
        updated_at,
    }
}

fn message_from_row(row: &SqliteRow) -> Result<StoredMessage, sqlx::Error> {
    Ok(StoredMessage {
        id: row.try_get("id")?,
        chat_id: row.try_get("chat_id")?,
        role: row.try_get("role")?,
        content: row.try_get("content")?,
        raw_content: row.try_get("raw_content")?,
        model: row.try_get("model")?,
        thinking: row.try_get("thinking")?,
        done: row.try_get("done")?,
        function_name: row.try_get("function_name")?,
        function_call: decode_json_column(row.try_get("function_call")?),
        function_response: row.try_get("function_response")?,
        tool_calls: decode_json_column(row.try_get("tool_calls")?),
        usage_prompt_tokens: row.try_get("usage_prompt_tokens")?,
        usage_completion_tokens: row.try_get("usage_completion_tokens")?,
        usage_total_tokens: row.try_get("usage_total_tokens")?,
        usage_estimated: row.try_get("usage_estimated")?,
        annotations: decode_json_column(row.try_get("annotations")?),
        annotation_sources: decode_json_column(row.try_get("annotation_sources")?),
        created_at: row.try_get("created_at")?,
    })
}

/// Strings are stored verbatim, other JSON values serialized.
fn json_column(value: Option<&Value>, empty: &str) -> String {
    match value {
        None | Some(Value::Null) => empty.to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn decode_json_column(text: String) -> Value {
    if text.is_empty() {
        return Value::String(text);
    }
    serde_json::from_str(&text).unwrap_or(Value::String(text))
}

/// Token counters may arrive as numbers or numeric strings; negatives and
/// anything unparsable are dropped.
fn non_negative_int(value: &Value) -> Option<i64> {
    let n = match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }?;
    (n >= 0).then_some(n)
}
