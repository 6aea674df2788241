use anyhow::Result;
use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

/// Number of trailing messages replayed into the agent loop.
pub const HISTORY_LIMIT: i64 = 10;

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub role: String,
    pub content: String,
}

/// Create the conversation row if it does not exist yet.
pub async fn ensure_conversation(
    pool: &SqlitePool,
    conversation_id: Uuid,
    user_id: Uuid,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO conversations (conversation_id, user_id, created_at) VALUES (?, ?, ?) \
         ON CONFLICT (conversation_id) DO NOTHING",
    )
    .bind(conversation_id.to_string())
    .bind(user_id.to_string())
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn append_message(
    pool: &SqlitePool,
    conversation_id: Uuid,
    role: &str,
    content: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO messages (message_id, conversation_id, role, content, created_at) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(conversation_id.to_string())
    .bind(role)
    .bind(content)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

/// The most recent messages, returned oldest-first.
pub async fn history(pool: &SqlitePool, conversation_id: Uuid) -> Result<Vec<StoredMessage>> {
    let rows = sqlx::query_as::<_, (String, String)>(
        "SELECT role, content FROM ( \
             SELECT role, content, created_at, rowid AS seq FROM messages \
             WHERE conversation_id = ? \
             ORDER BY created_at DESC, seq DESC LIMIT ? \
         ) ORDER BY created_at ASC, seq ASC",
    )
    .bind(conversation_id.to_string())
    .bind(HISTORY_LIMIT)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(role, content)| StoredMessage { role, content })
        .collect())
}
