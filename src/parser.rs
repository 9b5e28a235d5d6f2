//! Export parsing for ChatGPT and Claude conversation dumps.
//!
//! Providers ship several on-disk layouts for the "same" export: a bare JSON
//! array of conversations, an object with a `conversations` key, a zip of
//! either, or a directory tree with files nested under `data/<provider>/`.
//! Message content itself comes in four representations (plain string, object
//! with a `parts` list, object with a `text` field, heterogeneous list).
//!
//! Everything here is schema-tolerant: a file or record that cannot be read
//! is recorded in [`ParseOutcome::errors`] and processing continues. The
//! strictness boundary is the projection into [`ParsedMessage`]: downstream
//! code never sees untyped JSON.

use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::models::{ParsedConversation, ParsedMessage, Provider, Role};

/// Everything extracted from one export, plus the per-file error ledger.
#[derive(Debug, Default)]
pub struct ParseOutcome {
    pub conversations: Vec<ParsedConversation>,
    pub files_processed: Vec<String>,
    pub errors: Vec<String>,
}

/// Pre-flight check result for an export path.
#[derive(Debug)]
pub struct FileCheck {
    pub file_type: &'static str,
    pub size_bytes: u64,
    pub warnings: Vec<String>,
}

/// Validate an export path before any processing begins.
///
/// Disallowed file types are a hard error; an oversized file is only a
/// warning.
pub fn validate_file(path: &Path, size_warning_bytes: u64) -> Result<FileCheck> {
    if path.is_dir() {
        return Ok(FileCheck {
            file_type: "directory_export",
            size_bytes: 0,
            warnings: Vec::new(),
        });
    }

    let metadata = std::fs::metadata(path)
        .with_context(|| format!("export path not found: {}", path.display()))?;
    let size_bytes = metadata.len();

    let file_type = match extension(path) {
        Some("json") => "json_export",
        Some("zip") => "archive_export",
        _ => bail!(
            "unsupported export file type: {} (only .json, .zip, or a directory)",
            path.display()
        ),
    };

    let mut warnings = Vec::new();
    if size_bytes > size_warning_bytes {
        warnings.push(format!(
            "{} is very large ({} bytes) and may take a long time to process",
            file_name(path),
            size_bytes
        ));
    }

    Ok(FileCheck {
        file_type,
        size_bytes,
        warnings,
    })
}

/// Parse a provider export: a single JSON file, a zip archive, or a directory.
///
/// Never fails as a whole; malformed files become entries in
/// [`ParseOutcome::errors`].
pub fn parse_export(path: &Path, provider: Provider) -> ParseOutcome {
    let mut out = ParseOutcome::default();

    if path.is_dir() {
        parse_directory(path, provider, &mut out);
    } else if extension(path) == Some("zip") {
        if let Err(e) = parse_archive(path, provider, &mut out) {
            out.errors
                .push(format!("Failed to process {}: {}", file_name(path), e));
        }
    } else {
        let name = file_name(path);
        match parse_file(path, provider, &mut out) {
            Ok(()) => out.files_processed.push(name),
            Err(e) => out.errors.push(format!("Failed to process {}: {}", name, e)),
        }
    }

    out
}

/// Extract a zip export into a scratch directory and parse it as a directory.
fn parse_archive(path: &Path, provider: Provider, out: &mut ParseOutcome) -> Result<()> {
    let scratch = tempfile::tempdir()?;
    let file = std::fs::File::open(path)?;
    let mut archive = zip::ZipArchive::new(file)?;
    archive.extract(scratch.path())?;
    parse_directory(scratch.path(), provider, out);
    Ok(())
}

fn parse_directory(dir: &Path, provider: Provider, out: &mut ParseOutcome) {
    for file in list_json_files(dir) {
        let name = file_name(&file);
        match parse_file(&file, provider, out) {
            Ok(()) => out.files_processed.push(name),
            Err(e) => out.errors.push(format!("Failed to process {}: {}", name, e)),
        }
    }
}

/// JSON files at the top level, plus one level under `data/<provider>/` to
/// tolerate export-tool layout variance. Sorted for deterministic ordering.
fn list_json_files(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(dir).max_depth(1).into_iter().flatten() {
        if entry.file_type().is_file() && extension(entry.path()) == Some("json") {
            files.push(entry.path().to_path_buf());
        }
    }

    let data_dir = dir.join("data");
    if data_dir.is_dir() {
        for entry in WalkDir::new(&data_dir)
            .min_depth(2)
            .max_depth(2)
            .into_iter()
            .flatten()
        {
            if entry.file_type().is_file() && extension(entry.path()) == Some("json") {
                files.push(entry.path().to_path_buf());
            }
        }
    }

    files.sort();
    files
}

fn parse_file(path: &Path, provider: Provider, out: &mut ParseOutcome) -> Result<()> {
    let bytes = std::fs::read(path)?;
    let text = String::from_utf8_lossy(&bytes);
    let data: Value =
        serde_json::from_str(&text).map_err(|e| anyhow::anyhow!("invalid JSON: {}", e))?;
    parse_document(&data, provider, &file_name(path), out);
    Ok(())
}

/// Parse one decoded JSON document.
///
/// Accepts a top-level list of conversation objects or an object with a
/// `conversations` key; any other shape yields zero conversations without an
/// error.
pub fn parse_document(data: &Value, provider: Provider, source_file: &str, out: &mut ParseOutcome) {
    static EMPTY: Vec<Value> = Vec::new();
    let conversations = match data {
        Value::Array(items) => items,
        Value::Object(obj) => obj
            .get("conversations")
            .and_then(Value::as_array)
            .unwrap_or(&EMPTY),
        _ => &EMPTY,
    };

    for conv in conversations {
        let Some(obj) = conv.as_object() else {
            continue;
        };
        let parsed = match provider {
            Provider::Chatgpt => parse_chatgpt_conversation(obj, source_file),
            Provider::Claude => parse_claude_conversation(obj, source_file),
        };
        if let Some(c) = parsed {
            out.conversations.push(c);
        }
    }
}

type JsonMap = serde_json::Map<String, Value>;

/// Returns None when the conversation has no extractable messages — such a
/// record is neither counted nor persisted.
fn parse_chatgpt_conversation(obj: &JsonMap, source_file: &str) -> Option<ParsedConversation> {
    let external_id = string_id(obj.get("id")).or_else(|| string_id(obj.get("conversation_id")));
    let title = conversation_title(obj);

    // Direct messages list, else flatten the mapping nodes. Mapping values
    // are visited in document order (serde_json preserve_order), so the
    // flatten is stable by parse order even when timestamps are missing.
    let mut raw: Vec<&JsonMap> = obj
        .get("messages")
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(Value::as_object).collect())
        .unwrap_or_default();
    if raw.is_empty() {
        if let Some(mapping) = obj.get("mapping").and_then(Value::as_object) {
            raw = mapping
                .values()
                .filter_map(Value::as_object)
                .filter_map(|node| node.get("message"))
                .filter_map(Value::as_object)
                .collect();
        }
    }

    let messages: Vec<ParsedMessage> = raw
        .into_iter()
        .filter_map(parse_chatgpt_message)
        .collect();
    if messages.is_empty() {
        return None;
    }

    Some(ParsedConversation {
        external_id,
        title,
        provider: Provider::Chatgpt,
        source_file: source_file.to_string(),
        messages,
    })
}

fn parse_chatgpt_message(m: &JsonMap) -> Option<ParsedMessage> {
    let content = extract_content(m)?;

    let role_str = m
        .get("author")
        .and_then(Value::as_object)
        .and_then(|a| a.get("role"))
        .and_then(Value::as_str)
        .or_else(|| m.get("role").and_then(Value::as_str));
    let role = Role::from_export(role_str, Role::Assistant);

    let timestamp = m
        .get("create_time")
        .or_else(|| m.get("timestamp"))
        .and_then(parse_timestamp);

    Some(ParsedMessage {
        external_id: string_id(m.get("id")),
        role,
        word_count: content.split_whitespace().count() as i64,
        content,
        timestamp,
    })
}

fn parse_claude_conversation(obj: &JsonMap, source_file: &str) -> Option<ParsedConversation> {
    let external_id = string_id(obj.get("uuid")).or_else(|| string_id(obj.get("id")));
    let title = conversation_title(obj);

    let raw = obj
        .get("messages")
        .or_else(|| obj.get("chat_messages"))
        .and_then(Value::as_array)?;

    let messages: Vec<ParsedMessage> = raw
        .iter()
        .filter_map(Value::as_object)
        .filter_map(parse_claude_message)
        .collect();
    if messages.is_empty() {
        return None;
    }

    Some(ParsedConversation {
        external_id,
        title,
        provider: Provider::Claude,
        source_file: source_file.to_string(),
        messages,
    })
}

fn parse_claude_message(m: &JsonMap) -> Option<ParsedMessage> {
    // Claude messages carry plain text in `text`, falling back to `content`
    // (which may be a list of blocks in newer exports).
    let value = ["text", "content"]
        .iter()
        .filter_map(|k| m.get(*k))
        .find(|v| !is_empty_value(v))?;
    let content = flatten_content(value);
    let content = content.trim();
    if content.is_empty() {
        return None;
    }

    let role_str = m
        .get("role")
        .and_then(Value::as_str)
        .or_else(|| m.get("sender").and_then(Value::as_str));
    let role = match role_str {
        Some("human") => Role::User,
        other => Role::from_export(other, Role::Unknown),
    };

    let timestamp = m
        .get("created_at")
        .or_else(|| m.get("timestamp"))
        .and_then(parse_timestamp);

    Some(ParsedMessage {
        external_id: string_id(m.get("uuid")).or_else(|| string_id(m.get("id"))),
        role,
        word_count: content.split_whitespace().count() as i64,
        content: content.to_string(),
        timestamp,
    })
}

fn conversation_title(obj: &JsonMap) -> String {
    obj.get("title")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or("Untitled")
        .to_string()
}

/// Extract message content from the export's various representations.
/// Returns None for empty/whitespace-only content — the message is dropped.
fn extract_content(m: &JsonMap) -> Option<String> {
    let value = ["content", "text", "parts"]
        .iter()
        .filter_map(|k| m.get(*k))
        .find(|v| !is_empty_value(v))?;

    let content = flatten_content(value);
    let content = content.trim();
    if content.is_empty() {
        None
    } else {
        Some(content.to_string())
    }
}

fn flatten_content(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Array(items) => join_items(items),
        Value::Object(obj) => {
            if let Some(parts) = obj.get("parts").and_then(Value::as_array) {
                join_items(parts)
            } else if let Some(text) = obj.get("text") {
                stringify_item(text)
            } else {
                String::new()
            }
        }
        other => stringify_item(other),
    }
}

fn join_items(items: &[Value]) -> String {
    items
        .iter()
        .map(stringify_item)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn stringify_item(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn is_empty_value(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

/// Timestamps arrive as epoch seconds (possibly fractional) or ISO-8601
/// strings, sometimes with a literal trailing "Z". Anything unparseable is
/// treated as absent, not an error.
fn parse_timestamp(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_f64().map(|f| f as i64),
        Value::String(s) => {
            let normalized = match s.strip_suffix('Z') {
                Some(stripped) => format!("{}+00:00", stripped),
                None => s.clone(),
            };
            chrono::DateTime::parse_from_rfc3339(&normalized)
                .ok()
                .map(|dt| dt.timestamp())
        }
        _ => None,
    }
}

fn string_id(v: Option<&Value>) -> Option<String> {
    match v? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn extension(path: &Path) -> Option<&str> {
    path.extension().and_then(|e| e.to_str())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}
