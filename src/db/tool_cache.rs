use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::placeholders;

/// A cached tool definition belonging to one source.
#[derive(Debug, Clone)]
pub struct SourceTool {
    pub source_id: Uuid,
    pub tool_name: String,
    pub description: Option<String>,
    pub schema: Value,
    pub refreshed_at: DateTime<Utc>,
    pub is_active: bool,
}

/// A tool definition as discovered from a server, before persistence.
#[derive(Debug, Clone)]
pub struct DiscoveredTool {
    pub name: String,
    pub description: Option<String>,
    pub schema: Option<Value>,
}

/// Replace the cached catalog for a source: delete old rows and insert the
/// discovered set in a single transaction, so readers never observe a
/// half-written catalog. Missing schemas are stored as `{}`.
pub async fn replace_tools(
    pool: &SqlitePool,
    source_id: Uuid,
    tools: &[DiscoveredTool],
) -> Result<usize> {
    let now = Utc::now();
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM source_tools WHERE source_id = ?")
        .bind(source_id.to_string())
        .execute(&mut *tx)
        .await?;

    let mut inserted = 0;
    for tool in tools {
        if tool.name.is_empty() {
            continue;
        }
        let schema = tool.schema.clone().unwrap_or_else(|| Value::Object(Default::default()));
        sqlx::query(
            r#"
            INSERT INTO source_tools (source_id, tool_name, description, schema, refreshed_at, is_active)
            VALUES (?, ?, ?, ?, ?, 1)
            "#,
        )
        .bind(source_id.to_string())
        .bind(&tool.name)
        .bind(&tool.description)
        .bind(schema.to_string())
        .bind(now)
        .execute(&mut *tx)
        .await?;
        inserted += 1;
    }

    tx.commit().await?;
    Ok(inserted)
}

/// Drop all cached tools for a source.
pub async fn clear_tools(pool: &SqlitePool, source_id: Uuid) -> Result<()> {
    sqlx::query("DELETE FROM source_tools WHERE source_id = ?")
        .bind(source_id.to_string())
        .execute(pool)
        .await?;
    Ok(())
}

/// Read-path: active cached tools for a set of sources whose owning source
/// is itself active and fully cached.
pub async fn load_tools_for_sources(
    pool: &SqlitePool,
    source_ids: &[Uuid],
) -> Result<Vec<SourceTool>> {
    if source_ids.is_empty() {
        return Ok(Vec::new());
    }

    let query = format!(
        r#"
        SELECT st.source_id, st.tool_name, st.description, st.schema, st.refreshed_at, st.is_active
        FROM source_tools st
        JOIN sources s ON s.source_id = st.source_id
        WHERE st.source_id IN ({})
          AND st.is_active = 1
          AND s.is_active = 1
          AND s.cache_status = 'cached'
        ORDER BY st.source_id, st.tool_name
        "#,
        placeholders(source_ids.len())
    );

    let mut q =
        sqlx::query_as::<_, (String, String, Option<String>, String, DateTime<Utc>, i64)>(&query);
    for id in source_ids {
        q = q.bind(id.to_string());
    }

    let rows = q.fetch_all(pool).await?;
    let mut tools = Vec::with_capacity(rows.len());
    for (source_id, tool_name, description, schema, refreshed_at, is_active) in rows {
        tools.push(SourceTool {
            source_id: Uuid::parse_str(&source_id)?,
            tool_name,
            description,
            schema: serde_json::from_str(&schema).unwrap_or(Value::Null),
            refreshed_at,
            is_active: is_active != 0,
        });
    }
    Ok(tools)
}
