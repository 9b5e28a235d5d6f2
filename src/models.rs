//! Core data models used throughout chatvault.
//!
//! These types represent the conversations, messages, and search results that
//! flow through the ingestion and retrieval pipeline.

use serde::Serialize;

/// Originating chat service. Determines which parsing sub-algorithm applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    Chatgpt,
    Claude,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Chatgpt => "chatgpt",
            Provider::Claude => "claude",
        }
    }

    pub fn parse(s: &str) -> Option<Provider> {
        match s {
            "chatgpt" => Some(Provider::Chatgpt),
            "claude" => Some(Provider::Claude),
            _ => None,
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message author role. Export values outside the known set map to `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
    System,
    Unknown,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Unknown => "unknown",
        }
    }

    /// Strict parse used for search filters.
    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "system" => Some(Role::System),
            "unknown" => Some(Role::Unknown),
            _ => None,
        }
    }

    /// Lenient mapping for export data: unrecognized non-empty roles become
    /// `Unknown`; empty/missing roles take the provider default.
    pub fn from_export(s: Option<&str>, default: Role) -> Role {
        match s {
            None | Some("") => default,
            Some(v) => Role::parse(v).unwrap_or(Role::Unknown),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retrieval mode selected by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Lexical,
    Semantic,
    Hybrid,
}

impl SearchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMode::Lexical => "lexical",
            SearchMode::Semantic => "semantic",
            SearchMode::Hybrid => "hybrid",
        }
    }

    pub fn parse(s: &str) -> Option<SearchMode> {
        match s {
            "lexical" => Some(SearchMode::Lexical),
            "semantic" => Some(SearchMode::Semantic),
            "hybrid" => Some(SearchMode::Hybrid),
            _ => None,
        }
    }
}

/// A message extracted from an export file, before persistence.
#[derive(Debug, Clone)]
pub struct ParsedMessage {
    pub external_id: Option<String>,
    pub role: Role,
    /// Always non-empty; empty-content messages are dropped at parse time.
    pub content: String,
    pub word_count: i64,
    /// Epoch seconds, UTC. None when the export carried no parseable timestamp.
    pub timestamp: Option<i64>,
}

/// A conversation extracted from an export file, with at least one message.
#[derive(Debug, Clone)]
pub struct ParsedConversation {
    pub external_id: Option<String>,
    pub title: String,
    pub provider: Provider,
    pub source_file: String,
    pub messages: Vec<ParsedMessage>,
}

/// Outcome of one ingestion run. Per-file and per-conversation problems are
/// recorded here rather than aborting the batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestStats {
    pub conversations_processed: u64,
    pub messages_processed: u64,
    pub files_processed: Vec<String>,
    pub errors: Vec<String>,
}

/// A sibling message returned as conversational context around a search hit.
#[derive(Debug, Clone, Serialize)]
pub struct ContextMessage {
    pub id: String,
    pub role: String,
    pub content: String,
    pub timestamp: Option<String>,
    pub is_match: bool,
}

/// A single ranked hit from the query engine. Transient, not persisted.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub message_id: String,
    pub conversation_id: String,
    pub title: String,
    pub provider: String,
    pub role: String,
    pub content: String,
    pub timestamp: Option<String>,
    pub word_count: i64,
    /// Mode-dependent scale: negated bm25 for lexical, cosine similarity for
    /// semantic, weighted blend for hybrid. Higher is always better.
    pub relevance_score: f64,
    pub context: Option<Vec<ContextMessage>>,
}

/// Conversation metadata row for the listing endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationSummary {
    pub id: String,
    pub title: String,
    pub provider: String,
    pub message_count: i64,
    pub word_count: i64,
    pub first_message_at: Option<String>,
    pub last_message_at: Option<String>,
    pub project_id: Option<String>,
}

/// Render an optional epoch-seconds timestamp as ISO-8601 UTC.
pub fn format_ts_iso(ts: Option<i64>) -> Option<String> {
    ts.and_then(|t| chrono::DateTime::from_timestamp(t, 0))
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
}
