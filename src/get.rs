//! Message retrieval by ID, with surrounding conversation context.
//!
//! Used by both the `chv get` CLI command and `GET /messages/{id}`.

use anyhow::{bail, Result};
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::models::{format_ts_iso, ContextMessage};

#[derive(Debug, Clone, Serialize)]
pub struct MessageResponse {
    pub id: String,
    pub conversation_id: String,
    pub conversation_title: String,
    pub provider: String,
    pub role: String,
    pub content: String,
    pub word_count: i64,
    pub timestamp: Option<String>,
    /// Every message in the owning conversation, in order, with this message
    /// flagged.
    pub context: Vec<ContextMessage>,
}

/// Fetch a message and its full sibling list (used by CLI and server).
pub async fn get_message(
    pool: &SqlitePool,
    owner_id: &str,
    id: &str,
) -> Result<MessageResponse> {
    let row = sqlx::query(
        r#"
        SELECT m.id, m.conversation_id, m.role, m.content, m.word_count, m.timestamp,
               c.title, c.provider
        FROM messages m
        JOIN conversations c ON c.id = m.conversation_id
        WHERE m.id = ? AND m.owner_id = ?
        "#,
    )
    .bind(id)
    .bind(owner_id)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        bail!("message not found: {}", id);
    };

    let conversation_id: String = row.get("conversation_id");

    let sibling_rows = sqlx::query(
        "SELECT id, role, content, timestamp FROM messages \
         WHERE conversation_id = ? ORDER BY timestamp, id",
    )
    .bind(&conversation_id)
    .fetch_all(pool)
    .await?;

    let context: Vec<ContextMessage> = sibling_rows
        .iter()
        .map(|sibling| {
            let sibling_id: String = sibling.get("id");
            let timestamp: Option<i64> = sibling.get("timestamp");
            ContextMessage {
                is_match: sibling_id == id,
                id: sibling_id,
                role: sibling.get("role"),
                content: sibling.get("content"),
                timestamp: format_ts_iso(timestamp),
            }
        })
        .collect();

    let timestamp: Option<i64> = row.get("timestamp");
    Ok(MessageResponse {
        id: row.get("id"),
        conversation_id,
        conversation_title: row.get("title"),
        provider: row.get("provider"),
        role: row.get("role"),
        content: row.get("content"),
        word_count: row.get("word_count"),
        timestamp: format_ts_iso(timestamp),
        context,
    })
}

/// CLI entry point: fetch and print one message with its context.
pub async fn run_get(config: &Config, owner_id: &str, id: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    let msg = match get_message(&pool, owner_id, id).await {
        Ok(m) => m,
        Err(e) => {
            pool.close().await;
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };
    pool.close().await;

    println!("--- Message ---");
    println!("id:           {}", msg.id);
    println!("conversation: {}", msg.conversation_id);
    println!("title:        {}", msg.conversation_title);
    println!("provider:     {}", msg.provider);
    println!("role:         {}", msg.role);
    if let Some(ref ts) = msg.timestamp {
        println!("timestamp:    {}", ts);
    }
    println!("word_count:   {}", msg.word_count);
    println!();

    println!("--- Content ---");
    println!("{}", msg.content);
    println!();

    println!("--- Conversation ({} messages) ---", msg.context.len());
    for sibling in &msg.context {
        let marker = if sibling.is_match { ">" } else { " " };
        println!("{} [{}] {}", marker, sibling.role, sibling.content);
    }

    Ok(())
}
