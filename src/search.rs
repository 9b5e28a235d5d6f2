//! Retrieval engine: lexical, semantic, and hybrid search over messages.
//!
//! Lexical search runs through the FTS5 index and ranks by negated bm25
//! (higher = better). Semantic search embeds the query and scores stored
//! message vectors by cosine similarity in process. Hybrid over-fetches both
//! sides to `2 x limit` candidates from offset 0, fuses them
//! ([`crate::fusion`]), and slices the fused ranking by the caller's
//! original (offset, limit).
//!
//! All queries are scoped to the requesting owner. Retrieval is read-only
//! apart from usage logging, which is fire-and-forget and never fails the
//! response.

use anyhow::Result;
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use std::collections::{HashMap, HashSet};
use std::time::Instant;
use uuid::Uuid;

use crate::config::Config;
use crate::embedding;
use crate::fusion;
use crate::models::{
    format_ts_iso, ContextMessage, ConversationSummary, Provider, Role, SearchMode, SearchResult,
};

/// Optional restrictions applied identically in every mode.
#[derive(Debug, Default, Clone)]
pub struct SearchFilters {
    pub provider: Option<Provider>,
    pub role: Option<Role>,
    pub project_id: Option<String>,
    /// Inclusive epoch-seconds lower bound on message timestamp.
    pub after: Option<i64>,
    /// Inclusive epoch-seconds upper bound on message timestamp.
    pub before: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct SearchParams {
    pub query: String,
    pub mode: SearchMode,
    pub filters: SearchFilters,
    pub limit: i64,
    pub offset: i64,
    /// Per-request override of `retrieval.hybrid_alpha`.
    pub alpha: Option<f64>,
    /// Per-request override of `retrieval.similarity_threshold`.
    pub threshold: Option<f64>,
    pub include_context: bool,
}

#[derive(Debug)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    pub total: usize,
    pub execution_time_ms: u64,
}

/// Run one search request for an owner. Zero results is a successful
/// outcome; only storage failures surface as errors.
pub async fn execute_search(
    pool: &SqlitePool,
    config: &Config,
    owner_id: &str,
    params: &SearchParams,
) -> Result<SearchResponse> {
    let started = Instant::now();
    let alpha = params.alpha.unwrap_or(config.retrieval.hybrid_alpha);
    let threshold = params
        .threshold
        .unwrap_or(config.retrieval.similarity_threshold);

    let mut results = match params.mode {
        SearchMode::Lexical => {
            lexical_search(
                pool,
                owner_id,
                &params.query,
                &params.filters,
                params.limit,
                params.offset,
            )
            .await?
        }
        SearchMode::Semantic => {
            let candidates =
                semantic_candidates(pool, config, owner_id, &params.query, &params.filters, threshold)
                    .await?;
            candidates
                .into_iter()
                .skip(params.offset as usize)
                .take(params.limit as usize)
                .collect()
        }
        SearchMode::Hybrid => {
            let budget = params.limit * 2;
            let lexical =
                lexical_search(pool, owner_id, &params.query, &params.filters, budget, 0).await?;
            let mut semantic =
                semantic_candidates(pool, config, owner_id, &params.query, &params.filters, threshold)
                    .await?;
            semantic.truncate(budget as usize);
            fusion::fuse_results(lexical, semantic, alpha, budget as usize)
                .into_iter()
                .skip(params.offset as usize)
                .take(params.limit as usize)
                .collect()
        }
    };

    if params.include_context {
        attach_context(pool, &mut results).await?;
    }

    let execution_time_ms = started.elapsed().as_millis() as u64;
    log_search(
        pool,
        owner_id,
        &params.query,
        params.mode,
        &params.filters,
        results.len(),
        execution_time_ms,
    );

    Ok(SearchResponse {
        total: results.len(),
        results,
        execution_time_ms,
    })
}

/// Turn a free-text query into an FTS5 MATCH expression. Each whitespace
/// token is quoted so query punctuation cannot inject FTS syntax.
fn fts_match_expr(query: &str) -> String {
    query
        .split_whitespace()
        .map(|token| format!("\"{}\"", token.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ")
}

fn filter_sql(filters: &SearchFilters) -> String {
    let mut sql = String::new();
    if filters.provider.is_some() {
        sql.push_str(" AND c.provider = ?");
    }
    if filters.role.is_some() {
        sql.push_str(" AND m.role = ?");
    }
    if filters.project_id.is_some() {
        sql.push_str(" AND c.project_id = ?");
    }
    if filters.after.is_some() {
        sql.push_str(" AND m.timestamp >= ?");
    }
    if filters.before.is_some() {
        sql.push_str(" AND m.timestamp <= ?");
    }
    sql
}

fn bind_filters<'q>(
    mut q: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    filters: &'q SearchFilters,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    if let Some(provider) = filters.provider {
        q = q.bind(provider.as_str());
    }
    if let Some(role) = filters.role {
        q = q.bind(role.as_str());
    }
    if let Some(project) = &filters.project_id {
        q = q.bind(project);
    }
    if let Some(after) = filters.after {
        q = q.bind(after);
    }
    if let Some(before) = filters.before {
        q = q.bind(before);
    }
    q
}

fn row_to_result(row: &SqliteRow, relevance_score: f64) -> SearchResult {
    let timestamp: Option<i64> = row.get("timestamp");
    SearchResult {
        message_id: row.get("message_id"),
        conversation_id: row.get("conversation_id"),
        title: row.get("title"),
        provider: row.get("provider"),
        role: row.get("role"),
        content: row.get("content"),
        timestamp: format_ts_iso(timestamp),
        word_count: row.get("word_count"),
        relevance_score,
        context: None,
    }
}

async fn lexical_search(
    pool: &SqlitePool,
    owner_id: &str,
    query: &str,
    filters: &SearchFilters,
    limit: i64,
    offset: i64,
) -> Result<Vec<SearchResult>> {
    let match_expr = fts_match_expr(query);
    if match_expr.is_empty() {
        return Ok(Vec::new());
    }

    let sql = format!(
        r#"
        SELECT m.id AS message_id, m.conversation_id, c.title, c.provider,
               m.role, m.content, m.timestamp, m.word_count,
               messages_fts.rank AS rank
        FROM messages_fts
        JOIN messages m ON m.id = messages_fts.message_id
        JOIN conversations c ON c.id = m.conversation_id
        WHERE messages_fts MATCH ? AND m.owner_id = ?{}
        ORDER BY rank, m.id
        LIMIT ? OFFSET ?
        "#,
        filter_sql(filters)
    );

    let q = sqlx::query(&sql).bind(&match_expr).bind(owner_id);
    let rows = bind_filters(q, filters)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await?;

    Ok(rows
        .iter()
        .map(|row| {
            let rank: f64 = row.get("rank");
            // bm25 ranks ascending (more negative = better); negate so
            // higher is better everywhere
            row_to_result(row, -rank)
        })
        .collect())
}

/// All semantic candidates at or above `threshold`, ranked. Returns the full
/// ranked set so callers can page or feed fusion; the degraded contract
/// (provider missing, embedding call failing) is an empty set with a
/// warning, never an error.
async fn semantic_candidates(
    pool: &SqlitePool,
    config: &Config,
    owner_id: &str,
    query: &str,
    filters: &SearchFilters,
    threshold: f64,
) -> Result<Vec<SearchResult>> {
    if !config.embedding.is_enabled() {
        eprintln!("Warning: semantic search skipped: embedding provider is disabled");
        return Ok(Vec::new());
    }

    let provider = match embedding::create_provider(&config.embedding) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Warning: semantic search unavailable: {}", e);
            return Ok(Vec::new());
        }
    };
    let query_vec = match embedding::embed_query(provider.as_ref(), &config.embedding, query).await
    {
        Ok(v) => v,
        Err(e) => {
            eprintln!("Warning: semantic search unavailable: {}", e);
            return Ok(Vec::new());
        }
    };

    let model = provider.model_name().to_string();
    let sql = semantic_scan_sql(filters);
    let q = sqlx::query(&sql).bind(owner_id).bind(&model);
    let rows = bind_filters(q, filters).fetch_all(pool).await?;

    let mut candidates: Vec<SearchResult> = rows
        .iter()
        .filter_map(|row| {
            let blob: Vec<u8> = row.get("embedding");
            let vec = embedding::blob_to_vec(&blob);
            let similarity = embedding::cosine_similarity(&query_vec, &vec) as f64;
            if similarity < threshold {
                return None;
            }
            Some(row_to_result(row, similarity))
        })
        .collect();

    candidates.sort_by(|a, b| {
        b.relevance_score
            .partial_cmp(&a.relevance_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.message_id.cmp(&b.message_id))
    });

    Ok(candidates)
}

/// Vector scan restricted to rows written by the configured model. Vectors
/// left behind by a previously configured model (possibly with different
/// dims) never reach scoring; their messages stay out of semantic results
/// until re-embedded.
fn semantic_scan_sql(filters: &SearchFilters) -> String {
    format!(
        r#"
        SELECT m.id AS message_id, m.conversation_id, c.title, c.provider,
               m.role, m.content, m.timestamp, m.word_count, v.embedding
        FROM message_vectors v
        JOIN messages m ON m.id = v.message_id
        JOIN conversations c ON c.id = m.conversation_id
        WHERE m.owner_id = ? AND v.model = ?{}
        "#,
        filter_sql(filters)
    )
}

/// Attach the ordered sibling-message list to every result on the page,
/// one fetch per distinct conversation.
async fn attach_context(pool: &SqlitePool, results: &mut [SearchResult]) -> Result<()> {
    let conversation_ids: HashSet<String> = results
        .iter()
        .map(|r| r.conversation_id.clone())
        .collect();

    let mut siblings: HashMap<String, Vec<ContextMessage>> = HashMap::new();
    for conv_id in conversation_ids {
        let rows = sqlx::query(
            "SELECT id, role, content, timestamp FROM messages \
             WHERE conversation_id = ? ORDER BY timestamp, id",
        )
        .bind(&conv_id)
        .fetch_all(pool)
        .await?;

        let messages = rows
            .iter()
            .map(|row| {
                let timestamp: Option<i64> = row.get("timestamp");
                ContextMessage {
                    id: row.get("id"),
                    role: row.get("role"),
                    content: row.get("content"),
                    timestamp: format_ts_iso(timestamp),
                    is_match: false,
                }
            })
            .collect();
        siblings.insert(conv_id, messages);
    }

    for result in results.iter_mut() {
        if let Some(messages) = siblings.get(&result.conversation_id) {
            let mut context = messages.clone();
            for msg in &mut context {
                msg.is_match = msg.id == result.message_id;
            }
            result.context = Some(context);
        }
    }

    Ok(())
}

/// Record the search in the usage log without blocking the response.
/// Failures are swallowed with a warning.
fn log_search(
    pool: &SqlitePool,
    owner_id: &str,
    query: &str,
    mode: SearchMode,
    filters: &SearchFilters,
    result_count: usize,
    execution_time_ms: u64,
) {
    let pool = pool.clone();
    let owner_id = owner_id.to_string();
    let query = query.to_string();
    let mode = mode.as_str().to_string();
    let filter_json = serde_json::json!({
        "provider": filters.provider.map(|p| p.as_str()),
        "role": filters.role.map(|r| r.as_str()),
        "project_id": filters.project_id,
        "after": filters.after,
        "before": filters.before,
    })
    .to_string();

    tokio::spawn(async move {
        let result = sqlx::query(
            "INSERT INTO search_log \
             (id, owner_id, query, mode, filter_json, result_count, execution_time_ms, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&owner_id)
        .bind(&query)
        .bind(&mode)
        .bind(&filter_json)
        .bind(result_count as i64)
        .bind(execution_time_ms as i64)
        .bind(chrono::Utc::now().timestamp())
        .execute(&pool)
        .await;

        if let Err(e) = result {
            eprintln!("Warning: failed to record search: {}", e);
        }
    });
}

/// Conversation-metadata listing: title substring match plus the shared
/// filters, paged, newest activity first. Not rank-fused.
pub async fn search_conversations(
    pool: &SqlitePool,
    owner_id: &str,
    title_query: Option<&str>,
    provider: Option<Provider>,
    project_id: Option<&str>,
    limit: i64,
    offset: i64,
) -> Result<Vec<ConversationSummary>> {
    let mut sql = String::from(
        "SELECT id, title, provider, message_count, word_count, \
         first_message_at, last_message_at, project_id \
         FROM conversations WHERE owner_id = ?",
    );
    if title_query.is_some() {
        sql.push_str(" AND title LIKE ?");
    }
    if provider.is_some() {
        sql.push_str(" AND provider = ?");
    }
    if project_id.is_some() {
        sql.push_str(" AND project_id = ?");
    }
    sql.push_str(" ORDER BY COALESCE(last_message_at, created_at) DESC, id LIMIT ? OFFSET ?");

    let mut q = sqlx::query(&sql).bind(owner_id);
    let pattern;
    if let Some(title) = title_query {
        pattern = format!("%{}%", title);
        q = q.bind(&pattern);
    }
    if let Some(p) = provider {
        q = q.bind(p.as_str());
    }
    if let Some(project) = project_id {
        q = q.bind(project);
    }
    let rows = q.bind(limit).bind(offset).fetch_all(pool).await?;

    Ok(rows
        .iter()
        .map(|row| {
            let first: Option<i64> = row.get("first_message_at");
            let last: Option<i64> = row.get("last_message_at");
            ConversationSummary {
                id: row.get("id"),
                title: row.get("title"),
                provider: row.get("provider"),
                message_count: row.get("message_count"),
                word_count: row.get("word_count"),
                first_message_at: format_ts_iso(first),
                last_message_at: format_ts_iso(last),
                project_id: row.get("project_id"),
            }
        })
        .collect())
}

/// CLI entry point: run a search and print ranked results.
#[allow(clippy::too_many_arguments)]
pub async fn run_search(
    config: &Config,
    owner_id: &str,
    query: &str,
    mode: &str,
    filters: SearchFilters,
    limit: Option<i64>,
    offset: i64,
    with_context: bool,
) -> Result<()> {
    if query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }
    let Some(mode) = SearchMode::parse(mode) else {
        anyhow::bail!("Unknown search mode: {}. Use lexical, semantic, or hybrid.", mode);
    };

    let pool = crate::db::connect(config).await?;
    let params = SearchParams {
        query: query.to_string(),
        mode,
        filters,
        limit: limit
            .unwrap_or(config.retrieval.default_limit)
            .clamp(1, config.retrieval.max_limit),
        offset: offset.max(0),
        alpha: None,
        threshold: None,
        include_context: with_context,
    };

    let response = execute_search(&pool, config, owner_id, &params).await?;

    if response.results.is_empty() {
        println!("No results.");
        pool.close().await;
        return Ok(());
    }

    for (i, result) in response.results.iter().enumerate() {
        println!(
            "{}. [{:.3}] {} / {}",
            i + 1 + params.offset as usize,
            result.relevance_score,
            result.provider,
            result.title
        );
        println!("    role: {}", result.role);
        if let Some(ref ts) = result.timestamp {
            println!("    timestamp: {}", ts);
        }
        println!(
            "    excerpt: \"{}\"",
            excerpt(&result.content, 160)
        );
        println!("    id: {}", result.message_id);
        if let Some(ref context) = result.context {
            println!("    context: {} messages in conversation", context.len());
        }
        println!();
    }
    println!(
        "{} results in {} ms",
        response.total, response.execution_time_ms
    );

    pool.close().await;
    Ok(())
}

/// CLI entry point: list conversations matching an optional title query.
pub async fn run_conversations(
    config: &Config,
    owner_id: &str,
    title_query: Option<&str>,
    provider: Option<Provider>,
    limit: Option<i64>,
    offset: i64,
) -> Result<()> {
    let pool = crate::db::connect(config).await?;
    let limit = limit
        .unwrap_or(config.retrieval.default_limit)
        .clamp(1, config.retrieval.max_limit);

    let conversations =
        search_conversations(&pool, owner_id, title_query, provider, None, limit, offset.max(0))
            .await?;

    if conversations.is_empty() {
        println!("No conversations.");
        pool.close().await;
        return Ok(());
    }

    for (i, conv) in conversations.iter().enumerate() {
        println!("{}. [{}] {}", i + 1 + offset as usize, conv.provider, conv.title);
        println!(
            "    {} messages, {} words",
            conv.message_count, conv.word_count
        );
        if let Some(ref last) = conv.last_message_at {
            println!("    last activity: {}", last);
        }
        println!("    id: {}", conv.id);
        println!();
    }

    pool.close().await;
    Ok(())
}

fn excerpt(content: &str, max_chars: usize) -> String {
    let flat = content.replace('\n', " ");
    let flat = flat.trim();
    if flat.chars().count() <= max_chars {
        return flat.to_string();
    }
    let cut: String = flat.chars().take(max_chars).collect();
    format!("{}...", cut.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn match_expr_quotes_tokens() {
        assert_eq!(fts_match_expr("rust async"), "\"rust\" \"async\"");
    }

    #[test]
    fn match_expr_neutralizes_fts_syntax() {
        assert_eq!(fts_match_expr("NEAR(a b)"), "\"NEAR(a\" \"b)\"");
        assert_eq!(fts_match_expr("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn match_expr_empty_for_blank_query() {
        assert_eq!(fts_match_expr("   "), "");
    }

    #[test]
    fn filter_sql_orders_conditions_stably() {
        let filters = SearchFilters {
            provider: Some(Provider::Chatgpt),
            role: Some(Role::User),
            project_id: Some("p1".to_string()),
            after: Some(1),
            before: Some(2),
        };
        assert_eq!(
            filter_sql(&filters),
            " AND c.provider = ? AND m.role = ? AND c.project_id = ? \
             AND m.timestamp >= ? AND m.timestamp <= ?"
        );
        assert_eq!(filter_sql(&SearchFilters::default()), "");
    }

    #[test]
    fn semantic_scan_is_model_scoped() {
        let sql = semantic_scan_sql(&SearchFilters::default());
        assert!(sql.contains("AND v.model = ?"), "got: {}", sql);

        // The model bind comes before any filter binds
        let filters = SearchFilters {
            provider: Some(Provider::Chatgpt),
            ..Default::default()
        };
        let sql = semantic_scan_sql(&filters);
        let model_pos = sql.find("v.model = ?").unwrap();
        let provider_pos = sql.find("c.provider = ?").unwrap();
        assert!(model_pos < provider_pos);
    }

    #[test]
    fn excerpt_truncates_on_char_boundary() {
        assert_eq!(excerpt("short text", 160), "short text");
        let long = "word ".repeat(50);
        let cut = excerpt(&long, 20);
        assert!(cut.ends_with("..."));
        assert!(cut.chars().count() <= 23);
    }
}
