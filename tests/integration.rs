use std::collections::HashSet;
use std::fs;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use tempfile::TempDir;

fn chv_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("chv");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    setup_test_env_with_bind("127.0.0.1:7342")
}

fn setup_test_env_with_bind(bind: &str) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::create_dir_all(root.join("data")).unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/chatvault.sqlite"

[retrieval]
hybrid_alpha = 0.5
default_limit = 20
max_limit = 100

[server]
bind = "{}"
"#,
        root.display(),
        bind
    );

    let config_path = config_dir.join("chatvault.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_chv(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = chv_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run chv binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

fn write_chatgpt_export(dir: &Path) -> PathBuf {
    let export = serde_json::json!([
        {
            "id": "conv-rust",
            "title": "Rust Help",
            "messages": [
                {
                    "id": "m1",
                    "author": {"role": "user"},
                    "content": {"parts": ["How do lifetimes work in rust borrow checking"]},
                    "create_time": 1700000000
                },
                {
                    "id": "m2",
                    "author": {"role": "assistant"},
                    "content": {"parts": ["Lifetimes ensure references never outlive their data"]},
                    "create_time": 1700000060
                }
            ]
        },
        {
            "id": "conv-travel",
            "title": "Travel Plans",
            "messages": [
                {
                    "id": "m1",
                    "author": {"role": "user"},
                    "content": "Planning a trip to osaka in the spring",
                    "create_time": 1700001000
                },
                {
                    "id": "m2",
                    "author": {"role": "assistant"},
                    "content": "Osaka is lovely in April, book early",
                    "create_time": 1700001060
                }
            ]
        }
    ]);

    let path = dir.join("conversations.json");
    fs::write(&path, serde_json::to_string_pretty(&export).unwrap()).unwrap();
    path
}

fn write_claude_export(dir: &Path) -> PathBuf {
    let export = serde_json::json!([
        {
            "uuid": "claude-conv-1",
            "title": "Deployment Notes",
            "messages": [
                {"uuid": "c1", "sender": "human", "text": "How should we stage the kubernetes rollout"},
                {"uuid": "c2", "role": "assistant", "text": "Use a canary deployment with small traffic slices"}
            ]
        }
    ]);

    let path = dir.join("claude.json");
    fs::write(&path, serde_json::to_string(&export).unwrap()).unwrap();
    path
}

fn extract_ids(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter(|l| l.trim().starts_with("id:"))
        .filter_map(|l| l.split("id:").nth(1))
        .map(|s| s.trim().to_string())
        .collect()
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_chv(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data").join("chatvault.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_chv(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_chv(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_ingest_chatgpt_export() {
    let (tmp, config_path) = setup_test_env();
    let export = write_chatgpt_export(tmp.path());

    run_chv(&config_path, &["init"]);
    let (stdout, stderr, success) =
        run_chv(&config_path, &["ingest", "chatgpt", export.to_str().unwrap()]);
    assert!(success, "ingest failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("conversations: 2"));
    assert!(stdout.contains("new messages: 4"));
    assert!(stdout.contains("ok"));
}

#[test]
fn test_reingest_is_idempotent() {
    let (tmp, config_path) = setup_test_env();
    let export = write_chatgpt_export(tmp.path());

    run_chv(&config_path, &["init"]);
    let (stdout1, _, _) = run_chv(&config_path, &["ingest", "chatgpt", export.to_str().unwrap()]);
    assert!(stdout1.contains("new messages: 4"));

    // Same export again: conversations resolve to existing rows, messages
    // dedup on their provider ids
    let (stdout2, _, success) =
        run_chv(&config_path, &["ingest", "chatgpt", export.to_str().unwrap()]);
    assert!(success);
    assert!(stdout2.contains("conversations: 2"));
    assert!(stdout2.contains("new messages: 0"));

    let (conv_out, _, _) = run_chv(&config_path, &["conversations"]);
    let count = conv_out.matches("id: ").count();
    assert_eq!(count, 2, "expected 2 conversations, got: {}", conv_out);
}

#[test]
fn test_concurrent_ingest_resolves_to_single_rows() {
    let (tmp, config_path) = setup_test_env();
    let export = write_chatgpt_export(tmp.path());

    run_chv(&config_path, &["init"]);

    // Two processes ingest the same export at once; the identity upsert
    // must resolve the duplicate conversations as updates, not errors
    let spawn_ingest = || {
        Command::new(chv_binary())
            .arg("--config")
            .arg(config_path.to_str().unwrap())
            .args(["ingest", "chatgpt", export.to_str().unwrap()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap()
    };
    let mut first = spawn_ingest();
    let mut second = spawn_ingest();
    let status_first = first.wait().unwrap();
    let status_second = second.wait().unwrap();
    assert!(status_first.success(), "first concurrent ingest failed");
    assert!(status_second.success(), "second concurrent ingest failed");

    let (conv_out, _, _) = run_chv(&config_path, &["conversations"]);
    assert_eq!(
        conv_out.matches("id: ").count(),
        2,
        "expected 2 conversations, got: {}",
        conv_out
    );
    let (stats_out, _, _) = run_chv(&config_path, &["stats"]);
    assert!(stats_out.contains("Messages:      4"), "got: {}", stats_out);
}

#[test]
fn test_ingest_mapping_export() {
    let (tmp, config_path) = setup_test_env();
    let export = serde_json::json!([{
        "id": "mapped-conv",
        "title": "Mapped",
        "mapping": {
            "n1": {"message": {"id": "m1", "author": {"role": "user"}, "content": {"parts": ["mapping question about zebras"]}}},
            "n2": {"message": null},
            "n3": {"message": {"id": "m2", "author": {"role": "assistant"}, "content": {"parts": ["mapping answer about zebras"]}}}
        }
    }]);
    let path = tmp.path().join("mapped.json");
    fs::write(&path, serde_json::to_string(&export).unwrap()).unwrap();

    run_chv(&config_path, &["init"]);
    let (stdout, _, success) = run_chv(&config_path, &["ingest", "chatgpt", path.to_str().unwrap()]);
    assert!(success);
    assert!(stdout.contains("conversations: 1"));
    assert!(stdout.contains("new messages: 2"));
}

#[test]
fn test_ingest_zip_archive() {
    let (tmp, config_path) = setup_test_env();

    let json_path = write_chatgpt_export(tmp.path());
    let zip_path = tmp.path().join("export.zip");
    let file = fs::File::create(&zip_path).unwrap();
    let mut writer = zip::ZipWriter::new(file);
    writer
        .start_file("conversations.json", zip::write::SimpleFileOptions::default())
        .unwrap();
    writer.write_all(&fs::read(&json_path).unwrap()).unwrap();
    writer.finish().unwrap();

    run_chv(&config_path, &["init"]);
    let (stdout, stderr, success) =
        run_chv(&config_path, &["ingest", "chatgpt", zip_path.to_str().unwrap()]);
    assert!(success, "zip ingest failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("conversations: 2"));
}

#[test]
fn test_ingest_unsupported_file_type_rejected() {
    let (tmp, config_path) = setup_test_env();
    let path = tmp.path().join("export.csv");
    fs::write(&path, "a,b,c").unwrap();

    run_chv(&config_path, &["init"]);
    let (_, stderr, success) = run_chv(&config_path, &["ingest", "chatgpt", path.to_str().unwrap()]);
    assert!(!success, "unsupported file type should be rejected");
    assert!(stderr.contains("unsupported"), "got: {}", stderr);
}

#[test]
fn test_ingest_bad_file_continues() {
    let (tmp, config_path) = setup_test_env();

    let export_dir = tmp.path().join("export");
    fs::create_dir_all(&export_dir).unwrap();
    write_chatgpt_export(&export_dir);
    fs::write(export_dir.join("broken.json"), "{this is not json").unwrap();

    run_chv(&config_path, &["init"]);
    let (stdout, _, success) =
        run_chv(&config_path, &["ingest", "chatgpt", export_dir.to_str().unwrap()]);
    assert!(success, "per-file failures must not abort the batch");
    assert!(stdout.contains("conversations: 2"));
    assert!(stdout.contains("errors: 1"));
}

#[test]
fn test_search_lexical() {
    let (tmp, config_path) = setup_test_env();
    let export = write_chatgpt_export(tmp.path());

    run_chv(&config_path, &["init"]);
    run_chv(&config_path, &["ingest", "chatgpt", export.to_str().unwrap()]);

    let (stdout, stderr, success) = run_chv(&config_path, &["search", "lifetimes"]);
    assert!(success, "search failed: {}", stderr);
    assert!(stdout.contains("Rust Help"), "got: {}", stdout);
    assert!(!extract_ids(&stdout).is_empty());
}

#[test]
fn test_search_deterministic() {
    let (tmp, config_path) = setup_test_env();
    let export = write_chatgpt_export(tmp.path());

    run_chv(&config_path, &["init"]);
    run_chv(&config_path, &["ingest", "chatgpt", export.to_str().unwrap()]);

    let (stdout1, _, _) = run_chv(&config_path, &["search", "osaka"]);
    let (stdout2, _, _) = run_chv(&config_path, &["search", "osaka"]);
    // Strip the timing line, which legitimately varies
    let strip = |s: &str| {
        s.lines()
            .filter(|l| !l.contains(" ms"))
            .collect::<Vec<_>>()
            .join("\n")
    };
    assert_eq!(strip(&stdout1), strip(&stdout2));
}

#[test]
fn test_search_empty_query() {
    let (_tmp, config_path) = setup_test_env();

    run_chv(&config_path, &["init"]);
    let (stdout, _, success) = run_chv(&config_path, &["search", ""]);
    assert!(success, "Empty query should not panic");
    assert!(stdout.contains("No results"));
}

#[test]
fn test_search_no_results() {
    let (tmp, config_path) = setup_test_env();
    let export = write_chatgpt_export(tmp.path());

    run_chv(&config_path, &["init"]);
    run_chv(&config_path, &["ingest", "chatgpt", export.to_str().unwrap()]);

    let (stdout, _, success) = run_chv(&config_path, &["search", "xyznonexistent"]);
    assert!(success, "zero results is a successful outcome");
    assert!(stdout.contains("No results"));
}

#[test]
fn test_search_semantic_degrades_to_empty_when_disabled() {
    let (tmp, config_path) = setup_test_env();
    let export = write_chatgpt_export(tmp.path());

    run_chv(&config_path, &["init"]);
    run_chv(&config_path, &["ingest", "chatgpt", export.to_str().unwrap()]);

    let (stdout, stderr, success) =
        run_chv(&config_path, &["search", "lifetimes", "--mode", "semantic"]);
    assert!(success, "semantic mode must degrade, not fail: {}", stderr);
    assert!(stdout.contains("No results"));
    assert!(stderr.contains("disabled"), "expected a warning, got: {}", stderr);
}

#[test]
fn test_search_hybrid_degrades_to_lexical_when_disabled() {
    let (tmp, config_path) = setup_test_env();
    let export = write_chatgpt_export(tmp.path());

    run_chv(&config_path, &["init"]);
    run_chv(&config_path, &["ingest", "chatgpt", export.to_str().unwrap()]);

    let (stdout, _, success) = run_chv(&config_path, &["search", "lifetimes", "--mode", "hybrid"]);
    assert!(success);
    assert!(stdout.contains("Rust Help"), "got: {}", stdout);
}

#[test]
fn test_search_unknown_mode_errors() {
    let (_tmp, config_path) = setup_test_env();

    run_chv(&config_path, &["init"]);
    let (_, stderr, success) = run_chv(&config_path, &["search", "test", "--mode", "invalid"]);
    assert!(!success, "Unknown mode should fail");
    assert!(stderr.contains("Unknown search mode"), "got: {}", stderr);
}

#[test]
fn test_search_provider_filter() {
    let (tmp, config_path) = setup_test_env();
    let chatgpt = write_chatgpt_export(tmp.path());
    let claude = write_claude_export(tmp.path());

    run_chv(&config_path, &["init"]);
    run_chv(&config_path, &["ingest", "chatgpt", chatgpt.to_str().unwrap()]);
    run_chv(&config_path, &["ingest", "claude", claude.to_str().unwrap()]);

    let (stdout, _, success) =
        run_chv(&config_path, &["search", "deployment", "--provider", "claude"]);
    assert!(success);
    assert!(stdout.contains("Deployment Notes"));

    let (stdout, _, _) = run_chv(&config_path, &["search", "deployment", "--provider", "chatgpt"]);
    assert!(stdout.contains("No results"), "got: {}", stdout);
}

#[test]
fn test_search_role_filter() {
    let (tmp, config_path) = setup_test_env();
    let export = write_chatgpt_export(tmp.path());

    run_chv(&config_path, &["init"]);
    run_chv(&config_path, &["ingest", "chatgpt", export.to_str().unwrap()]);

    // "lifetimes" appears in both the question and the answer
    let (stdout, _, success) =
        run_chv(&config_path, &["search", "lifetimes", "--role", "user"]);
    assert!(success);
    assert_eq!(extract_ids(&stdout).len(), 1, "got: {}", stdout);
    assert!(stdout.contains("role: user"));
}

#[test]
fn test_search_pagination_disjoint() {
    let (tmp, config_path) = setup_test_env();

    // 25 distinct messages all matching the same token
    let messages: Vec<serde_json::Value> = (0..25)
        .map(|i| {
            serde_json::json!({
                "id": format!("m{}", i),
                "author": {"role": "user"},
                "content": format!("pagetoken entry number {}", i),
                "create_time": 1700000000 + i
            })
        })
        .collect();
    let export = serde_json::json!([{"id": "big-conv", "title": "Big", "messages": messages}]);
    let path = tmp.path().join("big.json");
    fs::write(&path, serde_json::to_string(&export).unwrap()).unwrap();

    run_chv(&config_path, &["init"]);
    run_chv(&config_path, &["ingest", "chatgpt", path.to_str().unwrap()]);

    let (page1, _, _) = run_chv(
        &config_path,
        &["search", "pagetoken", "--limit", "10", "--offset", "0"],
    );
    let (page2, _, _) = run_chv(
        &config_path,
        &["search", "pagetoken", "--limit", "10", "--offset", "10"],
    );
    let (page3, _, _) = run_chv(
        &config_path,
        &["search", "pagetoken", "--limit", "10", "--offset", "20"],
    );

    let ids1: HashSet<String> = extract_ids(&page1).into_iter().collect();
    let ids2: HashSet<String> = extract_ids(&page2).into_iter().collect();
    let ids3: HashSet<String> = extract_ids(&page3).into_iter().collect();

    assert_eq!(ids1.len(), 10);
    assert_eq!(ids2.len(), 10);
    assert_eq!(ids3.len(), 5);
    assert!(ids1.is_disjoint(&ids2), "pages must not overlap");
    assert!(ids1.is_disjoint(&ids3));
    assert!(ids2.is_disjoint(&ids3));
}

#[test]
fn test_conversations_listing() {
    let (tmp, config_path) = setup_test_env();
    let export = write_chatgpt_export(tmp.path());

    run_chv(&config_path, &["init"]);
    run_chv(&config_path, &["ingest", "chatgpt", export.to_str().unwrap()]);

    let (stdout, _, success) = run_chv(&config_path, &["conversations"]);
    assert!(success);
    assert!(stdout.contains("Rust Help"));
    assert!(stdout.contains("Travel Plans"));
    // Each fixture conversation carries two messages of 8 + 7 words, and
    // the listed word count is the sum over its messages
    assert_eq!(
        stdout.matches("2 messages, 15 words").count(),
        2,
        "got: {}",
        stdout
    );

    let (stdout, _, _) = run_chv(&config_path, &["conversations", "Travel"]);
    assert!(stdout.contains("Travel Plans"));
    assert!(!stdout.contains("Rust Help"));
}

#[test]
fn test_get_message_with_context() {
    let (tmp, config_path) = setup_test_env();
    let export = write_chatgpt_export(tmp.path());

    run_chv(&config_path, &["init"]);
    run_chv(&config_path, &["ingest", "chatgpt", export.to_str().unwrap()]);

    let (search_out, _, _) = run_chv(&config_path, &["search", "lifetimes", "--role", "user"]);
    let ids = extract_ids(&search_out);
    assert!(!ids.is_empty(), "need a message id, got: {}", search_out);

    let (stdout, _, success) = run_chv(&config_path, &["get", &ids[0]]);
    assert!(success, "get should succeed");
    assert!(stdout.contains(&ids[0]));
    assert!(stdout.contains("Conversation (2 messages)"));
    // The matched message is flagged in the sibling list
    assert!(stdout.contains("> [user]"), "got: {}", stdout);
}

#[test]
fn test_get_missing_message() {
    let (_tmp, config_path) = setup_test_env();

    run_chv(&config_path, &["init"]);
    let (_, stderr, success) = run_chv(&config_path, &["get", "nonexistent-id"]);
    assert!(!success, "get with missing ID should fail");
    assert!(stderr.contains("not found"), "got: {}", stderr);
}

#[test]
fn test_embed_pending_errors_when_disabled() {
    let (_tmp, config_path) = setup_test_env();

    run_chv(&config_path, &["init"]);
    let (_, stderr, success) = run_chv(&config_path, &["embed", "pending"]);
    assert!(!success, "embed pending should fail when provider disabled");
    assert!(stderr.contains("disabled"), "got: {}", stderr);
}

#[test]
fn test_embed_rebuild_errors_when_disabled() {
    let (_tmp, config_path) = setup_test_env();

    run_chv(&config_path, &["init"]);
    let (_, stderr, success) = run_chv(&config_path, &["embed", "rebuild"]);
    assert!(!success, "embed rebuild should fail when provider disabled");
    assert!(stderr.contains("disabled"), "got: {}", stderr);
}

#[test]
fn test_stats_reports_counts() {
    let (tmp, config_path) = setup_test_env();
    let export = write_chatgpt_export(tmp.path());

    run_chv(&config_path, &["init"]);
    run_chv(&config_path, &["ingest", "chatgpt", export.to_str().unwrap()]);

    let (stdout, _, success) = run_chv(&config_path, &["stats"]);
    assert!(success);
    assert!(stdout.contains("Conversations: 2"), "got: {}", stdout);
    assert!(stdout.contains("Messages:      4"), "got: {}", stdout);
    assert!(stdout.contains("chatgpt"));
}

#[test]
fn test_server_search_stats_endpoint() {
    let bind = "127.0.0.1:7361";
    let (tmp, config_path) = setup_test_env_with_bind(bind);
    let export = write_chatgpt_export(tmp.path());

    run_chv(&config_path, &["init"]);
    run_chv(&config_path, &["ingest", "chatgpt", export.to_str().unwrap()]);

    let mut server = Command::new(chv_binary())
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .arg("serve")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    // Wait for the listener to come up
    let mut stream = None;
    for _ in 0..50 {
        match TcpStream::connect(bind) {
            Ok(s) => {
                stream = Some(s);
                break;
            }
            Err(_) => std::thread::sleep(Duration::from_millis(100)),
        }
    }
    let mut stream = stream.expect("server did not start listening");

    stream
        .write_all(b"GET /search/stats HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();

    server.kill().unwrap();
    server.wait().unwrap();

    assert!(response.contains("200 OK"), "got: {}", response);
    assert!(response.contains("total_searches"), "got: {}", response);
    assert!(response.contains("avg_execution_time_ms"), "got: {}", response);
    assert!(response.contains("recent"), "got: {}", response);
}

#[test]
fn test_owner_scoping() {
    let (tmp, config_path) = setup_test_env();
    let export = write_chatgpt_export(tmp.path());

    run_chv(&config_path, &["init"]);
    run_chv(
        &config_path,
        &["--owner", "alice", "ingest", "chatgpt", export.to_str().unwrap()],
    );

    let (stdout, _, _) = run_chv(&config_path, &["--owner", "alice", "search", "lifetimes"]);
    assert!(stdout.contains("Rust Help"));

    let (stdout, _, _) = run_chv(&config_path, &["--owner", "bob", "search", "lifetimes"]);
    assert!(stdout.contains("No results"), "got: {}", stdout);
}
