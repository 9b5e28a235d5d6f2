use anyhow::{bail, Result};
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::embedding;

/// Find and embed messages that are missing vectors or whose content hash
/// went stale.
pub async fn run_embed_pending(
    config: &Config,
    limit: Option<usize>,
    batch_size_override: Option<usize>,
    dry_run: bool,
) -> Result<()> {
    if !config.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }

    let provider = embedding::create_provider(&config.embedding)?;
    let model_name = provider.model_name().to_string();
    let pool = db::connect(config).await?;
    let batch_size = batch_size_override.unwrap_or(config.embedding.batch_size);

    let pending = find_pending_messages(&pool, &model_name, limit).await?;

    if dry_run {
        println!("embed pending (dry-run)");
        println!("  messages needing embeddings: {}", pending.len());
        return Ok(());
    }

    if pending.is_empty() {
        println!("embed pending");
        println!("  all messages up to date");
        return Ok(());
    }

    let total = pending.len();
    let (embedded, failed) =
        embed_batches(&pool, provider.as_ref(), config, &pending, batch_size).await?;

    println!("embed pending");
    println!("  total pending: {}", total);
    println!("  embedded: {}", embedded);
    println!("  failed: {}", failed);

    pool.close().await;
    Ok(())
}

/// Delete all vectors and regenerate embeddings for every message.
pub async fn run_embed_rebuild(config: &Config, batch_size_override: Option<usize>) -> Result<()> {
    if !config.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }

    let provider = embedding::create_provider(&config.embedding)?;
    let model_name = provider.model_name().to_string();
    let pool = db::connect(config).await?;
    let batch_size = batch_size_override.unwrap_or(config.embedding.batch_size);

    sqlx::query("DELETE FROM message_vectors")
        .execute(&pool)
        .await?;

    println!("embed rebuild: cleared existing vectors");

    let all_messages = find_pending_messages(&pool, &model_name, None).await?;

    if all_messages.is_empty() {
        println!("  no messages to embed");
        pool.close().await;
        return Ok(());
    }

    let total = all_messages.len();
    let (embedded, failed) =
        embed_batches(&pool, provider.as_ref(), config, &all_messages, batch_size).await?;

    println!("embed rebuild");
    println!("  total messages: {}", total);
    println!("  embedded: {}", embedded);
    println!("  failed: {}", failed);

    pool.close().await;
    Ok(())
}

async fn embed_batches(
    pool: &SqlitePool,
    provider: &dyn embedding::EmbeddingProvider,
    config: &Config,
    pending: &[PendingMessage],
    batch_size: usize,
) -> Result<(u64, u64)> {
    let model_name = provider.model_name().to_string();
    let mut embedded = 0u64;
    let mut failed = 0u64;

    for batch in pending.chunks(batch_size) {
        let texts: Vec<String> = batch.iter().map(|p| p.content.clone()).collect();

        match embedding::embed_texts(provider, &config.embedding, &texts).await {
            Ok(vectors) => {
                for (item, vec) in batch.iter().zip(vectors.iter()) {
                    let blob = embedding::vec_to_blob(vec);
                    upsert_vector(
                        pool,
                        &item.message_id,
                        &item.conversation_id,
                        &model_name,
                        provider.dims(),
                        &item.content_hash,
                        &blob,
                    )
                    .await?;
                    embedded += 1;
                }
            }
            Err(e) => {
                eprintln!("Warning: embedding batch failed: {}", e);
                failed += batch.len() as u64;
            }
        }
    }

    Ok((embedded, failed))
}

/// Embed freshly ingested messages inline. Failures leave the messages
/// pending for a later `embed pending` run; ingestion itself never fails
/// because of the embedding backend.
pub async fn embed_messages_inline(
    config: &Config,
    pool: &SqlitePool,
    message_ids: &[String],
) -> (u64, u64) {
    if !config.embedding.is_enabled() || message_ids.is_empty() {
        return (0, 0);
    }

    let provider = match embedding::create_provider(&config.embedding) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Warning: could not create embedding provider: {}", e);
            return (0, message_ids.len() as u64);
        }
    };
    let model_name = provider.model_name().to_string();

    let mut embedded = 0u64;
    let mut pending = 0u64;

    for id_batch in message_ids.chunks(config.embedding.batch_size) {
        let mut batch = Vec::with_capacity(id_batch.len());
        for id in id_batch {
            let row = sqlx::query(
                "SELECT id, conversation_id, content FROM messages WHERE id = ?",
            )
            .bind(id)
            .fetch_optional(pool)
            .await
            .ok()
            .flatten();
            let Some(row) = row else { continue };
            let content: String = row.get("content");
            let content_hash = hash_text(&content);

            let existing: Option<String> = sqlx::query_scalar(
                "SELECT hash FROM message_vectors WHERE message_id = ? AND model = ?",
            )
            .bind(id)
            .bind(&model_name)
            .fetch_optional(pool)
            .await
            .unwrap_or(None);
            if existing.as_deref() == Some(content_hash.as_str()) {
                embedded += 1;
                continue;
            }

            batch.push(PendingMessage {
                message_id: row.get("id"),
                conversation_id: row.get("conversation_id"),
                content,
                content_hash,
            });
        }

        if batch.is_empty() {
            continue;
        }

        let texts: Vec<String> = batch.iter().map(|p| p.content.clone()).collect();
        match embedding::embed_texts(provider.as_ref(), &config.embedding, &texts).await {
            Ok(vectors) => {
                for (item, vec) in batch.iter().zip(vectors.iter()) {
                    let blob = embedding::vec_to_blob(vec);
                    if let Err(e) = upsert_vector(
                        pool,
                        &item.message_id,
                        &item.conversation_id,
                        &model_name,
                        provider.dims(),
                        &item.content_hash,
                        &blob,
                    )
                    .await
                    {
                        eprintln!(
                            "Warning: failed to store vector for {}: {}",
                            item.message_id, e
                        );
                        pending += 1;
                    } else {
                        embedded += 1;
                    }
                }
            }
            Err(e) => {
                eprintln!("Warning: embedding batch failed: {}", e);
                pending += batch.len() as u64;
            }
        }
    }

    (embedded, pending)
}

struct PendingMessage {
    message_id: String,
    conversation_id: String,
    content: String,
    content_hash: String,
}

struct ScannedMessage {
    message_id: String,
    conversation_id: String,
    content: String,
    stored_hash: Option<String>,
}

async fn find_pending_messages(
    pool: &SqlitePool,
    model: &str,
    limit: Option<usize>,
) -> Result<Vec<PendingMessage>> {
    // Messages with no vector for this model, or a stale content hash. The
    // scan is unbounded; the caller's limit counts pending messages, not
    // scanned rows, so it is applied after the hash filter.
    let rows = sqlx::query(
        r#"
        SELECT m.id AS message_id, m.conversation_id, m.content, v.hash AS stored_hash
        FROM messages m
        LEFT JOIN message_vectors v ON v.message_id = m.id AND v.model = ?
        ORDER BY m.conversation_id, m.timestamp, m.id
        "#,
    )
    .bind(model)
    .fetch_all(pool)
    .await?;

    let scanned = rows
        .iter()
        .map(|row| ScannedMessage {
            message_id: row.get("message_id"),
            conversation_id: row.get("conversation_id"),
            content: row.get("content"),
            stored_hash: row.get("stored_hash"),
        })
        .collect();

    Ok(select_pending(scanned, limit))
}

fn select_pending(scanned: Vec<ScannedMessage>, limit: Option<usize>) -> Vec<PendingMessage> {
    let mut pending: Vec<PendingMessage> = scanned
        .into_iter()
        .filter_map(|row| {
            let content_hash = hash_text(&row.content);
            if row.stored_hash.as_deref() == Some(content_hash.as_str()) {
                return None;
            }
            Some(PendingMessage {
                message_id: row.message_id,
                conversation_id: row.conversation_id,
                content: row.content,
                content_hash,
            })
        })
        .collect();

    if let Some(limit) = limit {
        pending.truncate(limit);
    }
    pending
}

async fn upsert_vector(
    pool: &SqlitePool,
    message_id: &str,
    conversation_id: &str,
    model: &str,
    dims: usize,
    content_hash: &str,
    blob: &[u8],
) -> Result<()> {
    let now = chrono::Utc::now().timestamp();

    sqlx::query(
        r#"
        INSERT INTO message_vectors (message_id, conversation_id, model, dims, hash, embedding, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(message_id) DO UPDATE SET
            conversation_id = excluded.conversation_id,
            model = excluded.model,
            dims = excluded.dims,
            hash = excluded.hash,
            embedding = excluded.embedding,
            created_at = excluded.created_at
        "#,
    )
    .bind(message_id)
    .bind(conversation_id)
    .bind(model)
    .bind(dims as i64)
    .bind(content_hash)
    .bind(blob)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(())
}

fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
