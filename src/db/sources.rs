use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::collections::HashMap;
use uuid::Uuid;

use crate::db::placeholders;

/// Tool-cache lifecycle of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Pending,
    Caching,
    Cached,
    Error,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Caching => "caching",
            Self::Cached => "cached",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "caching" => Self::Caching,
            "cached" => Self::Cached,
            "error" => Self::Error,
            _ => Self::Pending,
        }
    }
}

/// A configured MCP server.
#[derive(Debug, Clone)]
pub struct Source {
    pub source_id: Uuid,
    pub name: String,
    pub server_url: String,
    pub auth_headers: HashMap<String, String>,
    pub owner_user_id: Option<Uuid>,
    pub owner_bot_id: Option<Uuid>,
    pub instructions: Option<String>,
    pub is_active: bool,
    pub is_public: bool,
    pub cache_status: CacheStatus,
    pub cache_last_refreshed_at: Option<DateTime<Utc>>,
    pub cache_error: Option<String>,
}

impl Source {
    /// Local schemes route through the agent broker instead of SSE.
    pub fn is_local(&self) -> bool {
        is_local_url(&self.server_url)
    }
}

pub fn is_local_url(server_url: &str) -> bool {
    let url = server_url.to_ascii_lowercase();
    url.starts_with("local://") || url.starts_with("stdio://") || url.starts_with("agent://")
}

/// Resolved credentials for one source.
#[derive(Debug, Clone)]
pub struct SourceAuth {
    pub server_url: String,
    pub auth_headers: HashMap<String, String>,
}

type SourceRow = (
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    i64,
    i64,
    String,
    Option<DateTime<Utc>>,
    Option<String>,
);

const SOURCE_COLUMNS: &str = "source_id, name, server_url, auth_headers, owner_user_id, \
     owner_bot_id, instructions, is_active, is_public, cache_status, \
     cache_last_refreshed_at, cache_error";

fn row_to_source(row: SourceRow) -> Result<Source> {
    let (
        source_id,
        name,
        server_url,
        auth_headers,
        owner_user_id,
        owner_bot_id,
        instructions,
        is_active,
        is_public,
        cache_status,
        cache_last_refreshed_at,
        cache_error,
    ) = row;
    Ok(Source {
        source_id: Uuid::parse_str(&source_id)?,
        name,
        server_url,
        auth_headers: serde_json::from_str(&auth_headers).unwrap_or_default(),
        owner_user_id: owner_user_id.as_deref().map(Uuid::parse_str).transpose()?,
        owner_bot_id: owner_bot_id.as_deref().map(Uuid::parse_str).transpose()?,
        instructions,
        is_active: is_active != 0,
        is_public: is_public != 0,
        cache_status: CacheStatus::parse(&cache_status),
        cache_last_refreshed_at,
        cache_error,
    })
}

/// Insert a new source. Exactly one owner must be set; the table CHECK
/// enforces the same at the storage layer.
pub struct NewSource {
    pub name: String,
    pub server_url: String,
    pub auth_headers: HashMap<String, String>,
    pub owner_user_id: Option<Uuid>,
    pub owner_bot_id: Option<Uuid>,
    pub instructions: Option<String>,
    pub is_public: bool,
}

pub async fn create_source(pool: &SqlitePool, new: NewSource) -> Result<Uuid> {
    anyhow::ensure!(
        new.owner_user_id.is_some() != new.owner_bot_id.is_some(),
        "source must have exactly one owner"
    );
    let source_id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO sources (source_id, name, server_url, auth_headers, owner_user_id,
                             owner_bot_id, instructions, is_public)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(source_id.to_string())
    .bind(&new.name)
    .bind(&new.server_url)
    .bind(serde_json::to_string(&new.auth_headers)?)
    .bind(new.owner_user_id.map(|id| id.to_string()))
    .bind(new.owner_bot_id.map(|id| id.to_string()))
    .bind(&new.instructions)
    .bind(i64::from(new.is_public))
    .execute(pool)
    .await?;
    Ok(source_id)
}

/// Resolve `(server_url, auth_headers)` for a source. Absent or inactive
/// sources return `None` rather than erroring.
pub async fn get_source_auth(pool: &SqlitePool, source_id: Uuid) -> Result<Option<SourceAuth>> {
    let row = sqlx::query_as::<_, (String, String)>(
        "SELECT server_url, auth_headers FROM sources WHERE source_id = ? AND is_active = 1",
    )
    .bind(source_id.to_string())
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|(server_url, auth_headers)| SourceAuth {
        server_url,
        auth_headers: serde_json::from_str(&auth_headers).unwrap_or_default(),
    }))
}

pub async fn get_source(pool: &SqlitePool, source_id: Uuid) -> Result<Option<Source>> {
    let row = sqlx::query_as::<_, SourceRow>(&format!(
        "SELECT {SOURCE_COLUMNS} FROM sources WHERE source_id = ?"
    ))
    .bind(source_id.to_string())
    .fetch_optional(pool)
    .await?;
    row.map(row_to_source).transpose()
}

/// Sources available to a user on the execution path: their own active
/// cached sources plus any listed bot sources that are active and cached.
pub async fn list_sources_for_user(
    pool: &SqlitePool,
    user_id: Uuid,
    bot_source_ids: &[Uuid],
) -> Result<Vec<Source>> {
    let mut sources = Vec::new();

    let rows = sqlx::query_as::<_, SourceRow>(&format!(
        "SELECT {SOURCE_COLUMNS} FROM sources \
         WHERE owner_user_id = ? AND is_active = 1 AND cache_status = 'cached'"
    ))
    .bind(user_id.to_string())
    .fetch_all(pool)
    .await?;
    for row in rows {
        sources.push(row_to_source(row)?);
    }

    if !bot_source_ids.is_empty() {
        let query = format!(
            "SELECT {SOURCE_COLUMNS} FROM sources \
             WHERE source_id IN ({}) AND is_active = 1 AND cache_status = 'cached'",
            placeholders(bot_source_ids.len())
        );
        let mut q = sqlx::query_as::<_, SourceRow>(&query);
        for id in bot_source_ids {
            q = q.bind(id.to_string());
        }
        for row in q.fetch_all(pool).await? {
            let source = row_to_source(row)?;
            if !sources.iter().any(|s| s.source_id == source.source_id) {
                sources.push(source);
            }
        }
    }

    Ok(sources)
}

/// Access-checked lookup of specific sources for the execution path.
/// A user can use a source they own, a public source, or any bot-owned
/// source. Only active + cached sources are returned.
pub async fn list_specific_sources(
    pool: &SqlitePool,
    user_id: Uuid,
    source_ids: &[Uuid],
) -> Result<Vec<Source>> {
    if source_ids.is_empty() {
        return Ok(Vec::new());
    }

    let query = format!(
        "SELECT {SOURCE_COLUMNS} FROM sources \
         WHERE source_id IN ({}) AND is_active = 1 AND cache_status = 'cached' \
         AND (owner_user_id = ? OR is_public = 1 OR owner_bot_id IS NOT NULL)",
        placeholders(source_ids.len())
    );
    let mut q = sqlx::query_as::<_, SourceRow>(&query);
    for id in source_ids {
        q = q.bind(id.to_string());
    }
    q = q.bind(user_id.to_string());

    let mut sources = Vec::new();
    for row in q.fetch_all(pool).await? {
        sources.push(row_to_source(row)?);
    }
    Ok(sources)
}

pub async fn set_cache_status(
    pool: &SqlitePool,
    source_id: Uuid,
    status: CacheStatus,
    error: Option<&str>,
) -> Result<()> {
    if status == CacheStatus::Cached {
        sqlx::query(
            "UPDATE sources SET cache_status = ?, cache_error = NULL, \
             cache_last_refreshed_at = ? WHERE source_id = ?",
        )
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(source_id.to_string())
        .execute(pool)
        .await?;
    } else {
        sqlx::query("UPDATE sources SET cache_status = ?, cache_error = ? WHERE source_id = ?")
            .bind(status.as_str())
            .bind(error)
            .bind(source_id.to_string())
            .execute(pool)
            .await?;
    }
    Ok(())
}

/// Soft-delete. Cached tools stay behind the `is_active` filter.
pub async fn deactivate_source(pool: &SqlitePool, source_id: Uuid, owner: Uuid) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE sources SET is_active = 0 WHERE source_id = ? AND owner_user_id = ?",
    )
    .bind(source_id.to_string())
    .bind(owner.to_string())
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Find an existing source by its exact server URL (used by the local
/// refresh flow to reuse the `local://<capability>` source row).
pub async fn find_by_server_url(pool: &SqlitePool, server_url: &str) -> Result<Option<Source>> {
    let row = sqlx::query_as::<_, SourceRow>(&format!(
        "SELECT {SOURCE_COLUMNS} FROM sources WHERE server_url = ? AND is_active = 1"
    ))
    .bind(server_url)
    .fetch_optional(pool)
    .await?;
    row.map(row_to_source).transpose()
}
