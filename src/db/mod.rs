pub mod agent_tokens;
pub mod bots;
pub mod conversations;
pub mod sources;
pub mod tool_cache;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use tracing::info;

const MAX_CONNECTIONS: u32 = 5;

/// Open the SQLite pool and make sure the schema exists.
pub async fn connect(url: &str) -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .connect(url)
        .await
        .with_context(|| format!("failed to open database {url}"))?;
    init_schema(&pool).await?;
    info!("database ready at {}", url);
    Ok(pool)
}

/// Idempotent DDL. Foreign keys cascade so deleting a source drops its
/// cached tools and bot associations.
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query("PRAGMA foreign_keys = ON").execute(pool).await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sources (
            source_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            server_url TEXT NOT NULL,
            auth_headers TEXT NOT NULL DEFAULT '{}',
            owner_user_id TEXT,
            owner_bot_id TEXT,
            instructions TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            is_public INTEGER NOT NULL DEFAULT 0,
            cache_status TEXT NOT NULL DEFAULT 'pending',
            cache_last_refreshed_at TEXT,
            cache_error TEXT,
            CHECK ((owner_user_id IS NULL) != (owner_bot_id IS NULL))
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS source_tools (
            source_id TEXT NOT NULL REFERENCES sources(source_id) ON DELETE CASCADE,
            tool_name TEXT NOT NULL,
            description TEXT,
            schema TEXT NOT NULL DEFAULT '{}',
            refreshed_at TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            PRIMARY KEY (source_id, tool_name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS bot_source_associations (
            bot_id TEXT NOT NULL,
            source_id TEXT NOT NULL REFERENCES sources(source_id) ON DELETE CASCADE,
            custom_instructions TEXT,
            PRIMARY KEY (bot_id, source_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS user_agent_tokens (
            token_id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            token_hash TEXT NOT NULL UNIQUE,
            token_prefix TEXT NOT NULL,
            name TEXT,
            expires_at TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            last_used_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS conversations (
            conversation_id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            message_id TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL REFERENCES conversations(conversation_id) ON DELETE CASCADE,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Build a `?, ?, ?` placeholder list for dynamic IN clauses.
pub(crate) fn placeholders(count: usize) -> String {
    let mut s = String::new();
    for i in 0..count {
        if i > 0 {
            s.push_str(", ");
        }
        s.push('?');
    }
    s
}

#[cfg(test)]
pub(crate) async fn test_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");
    init_schema(&pool).await.expect("schema");
    pool
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_bootstrap_is_idempotent() {
        let pool = test_pool().await;
        init_schema(&pool).await.unwrap();
        init_schema(&pool).await.unwrap();
    }

    #[test]
    fn placeholder_lists() {
        assert_eq!(placeholders(0), "");
        assert_eq!(placeholders(1), "?");
        assert_eq!(placeholders(3), "?, ?, ?");
    }
}
