use anyhow::Result;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use uuid::Uuid;

const TOKEN_SCHEME: &str = "scat_";
const PREFIX_LEN: usize = 8;

/// Generate a fresh agent token: `scat_` + 64 hex chars.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    for b in &mut bytes {
        *b = fastrand::u8(..);
    }
    format!("{TOKEN_SCHEME}{}", hex::encode(bytes))
}

/// SHA-256 hex digest of the full token, as stored in the database.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

fn token_prefix(token: &str) -> &str {
    &token[..PREFIX_LEN.min(token.len())]
}

/// Create and persist a token for a user, returning the plaintext exactly
/// once. Only the hash and display prefix are stored.
pub async fn create_token(
    pool: &SqlitePool,
    user_id: Uuid,
    name: Option<&str>,
    expires_at: Option<DateTime<Utc>>,
) -> Result<String> {
    let token = generate_token();
    sqlx::query(
        r#"
        INSERT INTO user_agent_tokens (token_id, user_id, token_hash, token_prefix, name, expires_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(user_id.to_string())
    .bind(hash_token(&token))
    .bind(token_prefix(&token))
    .bind(name)
    .bind(expires_at)
    .execute(pool)
    .await?;
    Ok(token)
}

/// Validate a bearer token. Returns the owning user id for an active,
/// unexpired token and stamps `last_used_at`; anything else is `None`.
pub async fn validate_token(pool: &SqlitePool, token: &str) -> Result<Option<Uuid>> {
    if !token.starts_with(TOKEN_SCHEME) {
        return Ok(None);
    }

    let hash = hash_token(token);
    let row = sqlx::query_as::<_, (String, String, Option<DateTime<Utc>>)>(
        "SELECT token_id, user_id, expires_at FROM user_agent_tokens \
         WHERE token_hash = ? AND is_active = 1",
    )
    .bind(&hash)
    .fetch_optional(pool)
    .await?;

    let Some((token_id, user_id, expires_at)) = row else {
        return Ok(None);
    };

    if let Some(expiry) = expires_at
        && expiry < Utc::now()
    {
        return Ok(None);
    }

    sqlx::query("UPDATE user_agent_tokens SET last_used_at = ? WHERE token_id = ?")
        .bind(Utc::now())
        .bind(token_id)
        .execute(pool)
        .await?;

    Ok(Some(Uuid::parse_str(&user_id)?))
}

/// Revoke a token by id.
pub async fn revoke_token(pool: &SqlitePool, token_id: Uuid, user_id: Uuid) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE user_agent_tokens SET is_active = 0 WHERE token_id = ? AND user_id = ?",
    )
    .bind(token_id.to_string())
    .bind(user_id.to_string())
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}
