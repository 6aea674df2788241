use anyhow::Result;
use sqlx::SqlitePool;
use std::collections::HashMap;
use uuid::Uuid;

use crate::db::placeholders;
use crate::db::sources::Source;

/// Associate a source with a bot, optionally overriding the source's
/// instructions for that bot.
pub async fn associate_source(
    pool: &SqlitePool,
    bot_id: Uuid,
    source_id: Uuid,
    custom_instructions: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO bot_source_associations (bot_id, source_id, custom_instructions)
        VALUES (?, ?, ?)
        ON CONFLICT (bot_id, source_id) DO UPDATE SET custom_instructions = excluded.custom_instructions
        "#,
    )
    .bind(bot_id.to_string())
    .bind(source_id.to_string())
    .bind(custom_instructions)
    .execute(pool)
    .await?;
    Ok(())
}

/// All source ids bundled by the given bots.
pub async fn bot_source_ids(pool: &SqlitePool, bot_ids: &[Uuid]) -> Result<Vec<Uuid>> {
    if bot_ids.is_empty() {
        return Ok(Vec::new());
    }
    let query = format!(
        "SELECT DISTINCT source_id FROM bot_source_associations WHERE bot_id IN ({})",
        placeholders(bot_ids.len())
    );
    let mut q = sqlx::query_as::<_, (String,)>(&query);
    for id in bot_ids {
        q = q.bind(id.to_string());
    }
    let rows = q.fetch_all(pool).await?;
    let mut ids = Vec::with_capacity(rows.len());
    for (id,) in rows {
        ids.push(Uuid::parse_str(&id)?);
    }
    Ok(ids)
}

/// Resolve instruction text per source name. A non-empty bot override wins
/// over the source's own instructions; sources with neither are omitted.
pub async fn source_instructions(
    pool: &SqlitePool,
    sources: &[Source],
    bot_ids: &[Uuid],
) -> Result<HashMap<String, String>> {
    let mut map = HashMap::new();

    for source in sources {
        let mut instructions = source.instructions.clone().filter(|s| !s.is_empty());

        if !bot_ids.is_empty() {
            let query = format!(
                "SELECT custom_instructions FROM bot_source_associations \
                 WHERE source_id = ? AND bot_id IN ({}) \
                 AND custom_instructions IS NOT NULL AND custom_instructions != ''",
                placeholders(bot_ids.len())
            );
            let mut q = sqlx::query_as::<_, (Option<String>,)>(&query);
            q = q.bind(source.source_id.to_string());
            for id in bot_ids {
                q = q.bind(id.to_string());
            }
            if let Some((Some(override_text),)) = q.fetch_optional(pool).await? {
                instructions = Some(override_text);
            }
        }

        if let Some(text) = instructions {
            map.insert(source.name.clone(), text);
        }
    }

    Ok(map)
}
