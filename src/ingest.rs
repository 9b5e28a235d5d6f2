//! Export ingestion pipeline.
//!
//! Coordinates the full flow: validation, parsing, per-conversation
//! persistence (with dedup and FTS indexing), and inline embedding. Each
//! conversation commits in its own transaction, so one bad record never
//! rolls back its neighbors.

use anyhow::Result;
use sqlx::SqlitePool;
use std::path::Path;
use uuid::Uuid;

use crate::config::Config;
use crate::db;
use crate::embed_cmd;
use crate::models::{IngestStats, ParsedConversation, Provider};
use crate::parser;

pub async fn run_ingest(
    config: &Config,
    provider: Provider,
    path: &Path,
    owner_id: &str,
) -> Result<IngestStats> {
    let check = parser::validate_file(path, config.ingest.size_warning_bytes)?;
    for warning in &check.warnings {
        eprintln!("Warning: {}", warning);
    }

    let outcome = parser::parse_export(path, provider);

    let pool = db::connect(config).await?;

    let mut stats = IngestStats {
        files_processed: outcome.files_processed,
        errors: outcome.errors,
        ..Default::default()
    };
    let mut new_message_ids: Vec<String> = Vec::new();

    for conv in &outcome.conversations {
        match persist_conversation(&pool, owner_id, conv).await {
            Ok(inserted) => {
                stats.conversations_processed += 1;
                stats.messages_processed += inserted.len() as u64;
                new_message_ids.extend(inserted);
            }
            Err(e) => stats.errors.push(format!(
                "Failed to store conversation '{}': {}",
                conv.title, e
            )),
        }
    }

    let (embedded, pending) =
        embed_cmd::embed_messages_inline(config, &pool, &new_message_ids).await;

    println!("ingest {}", provider);
    println!("  files processed: {}", stats.files_processed.len());
    println!("  conversations: {}", stats.conversations_processed);
    println!("  new messages: {}", stats.messages_processed);
    if config.embedding.is_enabled() {
        println!("  embeddings written: {}", embedded);
        println!("  embeddings pending: {}", pending);
    }
    if !stats.errors.is_empty() {
        println!("  errors: {}", stats.errors.len());
        for e in &stats.errors {
            eprintln!("Warning: {}", e);
        }
    }
    println!("ok");

    pool.close().await;
    Ok(stats)
}

/// Store one parsed conversation, returning the ids of newly inserted
/// messages.
///
/// Conversation identity is (owner_id, provider, external_id); a repeat
/// ingest reuses the existing row and only appends messages not seen before
/// (by provider-assigned message id). Aggregates fold in the new messages
/// only, so re-ingesting the same export is a no-op for counts.
async fn persist_conversation(
    pool: &SqlitePool,
    owner_id: &str,
    conv: &ParsedConversation,
) -> Result<Vec<String>> {
    let now = chrono::Utc::now().timestamp();
    let mut tx = pool.begin().await?;

    let conversation_id: String = match conv.external_id.as_deref() {
        Some(ext) => {
            // Upsert on the identity key, so two ingests of the same export
            // racing each other both resolve to one row instead of one of
            // them failing on the unique index.
            sqlx::query(
                r#"
                INSERT INTO conversations
                    (id, owner_id, provider, external_id, title, source_file, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(owner_id, provider, external_id) DO UPDATE SET
                    title = excluded.title,
                    source_file = excluded.source_file
                "#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(owner_id)
            .bind(conv.provider.as_str())
            .bind(ext)
            .bind(&conv.title)
            .bind(&conv.source_file)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            sqlx::query_scalar(
                "SELECT id FROM conversations \
                 WHERE owner_id = ? AND provider = ? AND external_id = ?",
            )
            .bind(owner_id)
            .bind(conv.provider.as_str())
            .bind(ext)
            .fetch_one(&mut *tx)
            .await?
        }
        // No external id: NULLs never collide on the identity index, every
        // ingest appends a fresh conversation row.
        None => {
            let id = Uuid::new_v4().to_string();
            sqlx::query(
                r#"
                INSERT INTO conversations
                    (id, owner_id, provider, external_id, title, source_file, created_at)
                VALUES (?, ?, ?, NULL, ?, ?, ?)
                "#,
            )
            .bind(&id)
            .bind(owner_id)
            .bind(conv.provider.as_str())
            .bind(&conv.title)
            .bind(&conv.source_file)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            id
        }
    };

    let mut inserted_ids = Vec::new();
    let mut new_words: i64 = 0;
    let mut batch_first: Option<i64> = None;
    let mut batch_last: Option<i64> = None;

    for msg in &conv.messages {
        let message_id = Uuid::new_v4().to_string();

        // Messages with a provider-assigned id dedup on it; the rest are
        // append-only.
        let result = sqlx::query(
            r#"
            INSERT INTO messages
                (id, owner_id, conversation_id, external_id, role, content, word_count, timestamp, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(conversation_id, external_id) DO NOTHING
            "#,
        )
        .bind(&message_id)
        .bind(owner_id)
        .bind(&conversation_id)
        .bind(&msg.external_id)
        .bind(msg.role.as_str())
        .bind(&msg.content)
        .bind(msg.word_count)
        .bind(msg.timestamp)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            continue;
        }

        sqlx::query("INSERT INTO messages_fts (message_id, conversation_id, content) VALUES (?, ?, ?)")
            .bind(&message_id)
            .bind(&conversation_id)
            .bind(&msg.content)
            .execute(&mut *tx)
            .await?;

        new_words += msg.word_count;
        if let Some(ts) = msg.timestamp {
            batch_first = Some(batch_first.map_or(ts, |f| f.min(ts)));
            batch_last = Some(batch_last.map_or(ts, |l| l.max(ts)));
        }
        inserted_ids.push(message_id);
    }

    if !inserted_ids.is_empty() {
        sqlx::query(
            "UPDATE conversations SET message_count = message_count + ?, \
             word_count = word_count + ? WHERE id = ?",
        )
        .bind(inserted_ids.len() as i64)
        .bind(new_words)
        .bind(&conversation_id)
        .execute(&mut *tx)
        .await?;
    }
    if let Some(first) = batch_first {
        sqlx::query(
            "UPDATE conversations SET first_message_at = CASE \
             WHEN first_message_at IS NULL OR first_message_at > ? THEN ? \
             ELSE first_message_at END WHERE id = ?",
        )
        .bind(first)
        .bind(first)
        .bind(&conversation_id)
        .execute(&mut *tx)
        .await?;
    }
    if let Some(last) = batch_last {
        sqlx::query(
            "UPDATE conversations SET last_message_at = CASE \
             WHEN last_message_at IS NULL OR last_message_at < ? THEN ? \
             ELSE last_message_at END WHERE id = ?",
        )
        .bind(last)
        .bind(last)
        .bind(&conversation_id)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(inserted_ids)
}
