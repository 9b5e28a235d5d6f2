//! Corpus statistics and health overview.
//!
//! Summarizes what's ingested: conversation and message counts, embedding
//! coverage, per-provider breakdowns, and recent search activity. Used by
//! `chv stats` to confirm ingests and embedding runs are working.

use anyhow::Result;
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::models::format_ts_iso;

struct ProviderStats {
    provider: String,
    conversation_count: i64,
    message_count: i64,
    embedded_count: i64,
}

pub async fn run_stats(config: &Config, owner_id: &str) -> Result<()> {
    let pool = db::connect(config).await?;

    let total_conversations: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM conversations WHERE owner_id = ?")
            .bind(owner_id)
            .fetch_one(&pool)
            .await?;

    let total_messages: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE owner_id = ?")
            .bind(owner_id)
            .fetch_one(&pool)
            .await?;

    let total_embedded: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM message_vectors v \
         JOIN messages m ON m.id = v.message_id WHERE m.owner_id = ?",
    )
    .bind(owner_id)
    .fetch_one(&pool)
    .await?;

    let total_words: i64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(word_count), 0) FROM conversations WHERE owner_id = ?",
    )
    .bind(owner_id)
    .fetch_one(&pool)
    .await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("chatvault stats");
    println!("===============");
    println!();
    println!("  Database:      {}", config.db.path.display());
    println!("  Size:          {}", format_bytes(db_size));
    println!();
    println!("  Conversations: {}", total_conversations);
    println!("  Messages:      {}", total_messages);
    println!("  Words:         {}", total_words);
    println!(
        "  Embedded:      {} / {} ({}%)",
        total_embedded,
        total_messages,
        if total_messages > 0 {
            (total_embedded * 100) / total_messages
        } else {
            0
        }
    );

    let provider_rows = sqlx::query(
        r#"
        SELECT
            c.provider,
            COUNT(DISTINCT c.id) AS conversation_count,
            COUNT(DISTINCT m.id) AS message_count,
            COUNT(DISTINCT v.message_id) AS embedded_count
        FROM conversations c
        LEFT JOIN messages m ON m.conversation_id = c.id
        LEFT JOIN message_vectors v ON v.message_id = m.id
        WHERE c.owner_id = ?
        GROUP BY c.provider
        ORDER BY conversation_count DESC
        "#,
    )
    .bind(owner_id)
    .fetch_all(&pool)
    .await?;

    let provider_stats: Vec<ProviderStats> = provider_rows
        .iter()
        .map(|row| ProviderStats {
            provider: row.get("provider"),
            conversation_count: row.get("conversation_count"),
            message_count: row.get("message_count"),
            embedded_count: row.get("embedded_count"),
        })
        .collect();

    if !provider_stats.is_empty() {
        println!();
        println!("  By provider:");
        println!(
            "  {:<12} {:>14} {:>10} {:>10}",
            "PROVIDER", "CONVERSATIONS", "MESSAGES", "EMBEDDED"
        );
        println!("  {}", "-".repeat(50));
        for s in &provider_stats {
            println!(
                "  {:<12} {:>14} {:>10} {:>10}",
                s.provider, s.conversation_count, s.message_count, s.embedded_count
            );
        }
    }

    let log = search_log_summary(&pool, owner_id).await?;
    if log.total_searches > 0 {
        println!();
        println!(
            "  Searches:      {} (avg {:.0} ms)",
            log.total_searches, log.avg_execution_time_ms
        );
        println!("  Recent:");
        for entry in &log.recent {
            println!(
                "    [{}] \"{}\" ({} results)",
                entry.mode, entry.query, entry.result_count
            );
        }
    }

    println!();

    pool.close().await;
    Ok(())
}

#[derive(Serialize)]
pub struct SearchLogSummary {
    pub total_searches: i64,
    pub avg_execution_time_ms: f64,
    pub recent: Vec<SearchLogEntry>,
}

#[derive(Serialize)]
pub struct SearchLogEntry {
    pub query: String,
    pub mode: String,
    pub result_count: i64,
    pub execution_time_ms: i64,
    pub created_at: Option<String>,
}

/// Aggregate view of the search log for one owner, shared by `chv stats`
/// and `GET /search/stats`.
pub async fn search_log_summary(pool: &SqlitePool, owner_id: &str) -> Result<SearchLogSummary> {
    let total_searches: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM search_log WHERE owner_id = ?")
            .bind(owner_id)
            .fetch_one(pool)
            .await?;

    let avg_execution_time_ms: Option<f64> = sqlx::query_scalar(
        "SELECT AVG(execution_time_ms) FROM search_log WHERE owner_id = ?",
    )
    .bind(owner_id)
    .fetch_one(pool)
    .await?;

    let rows = sqlx::query(
        "SELECT query, mode, result_count, execution_time_ms, created_at FROM search_log \
         WHERE owner_id = ? ORDER BY created_at DESC LIMIT 5",
    )
    .bind(owner_id)
    .fetch_all(pool)
    .await?;

    let recent = rows
        .iter()
        .map(|row| {
            let created_at: Option<i64> = row.get("created_at");
            SearchLogEntry {
                query: row.get("query"),
                mode: row.get("mode"),
                result_count: row.get("result_count"),
                execution_time_ms: row.get("execution_time_ms"),
                created_at: format_ts_iso(created_at),
            }
        })
        .collect();

    Ok(SearchLogSummary {
        total_searches,
        avg_execution_time_ms: avg_execution_time_ms.unwrap_or(0.0),
        recent,
    })
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
