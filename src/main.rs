//! # chatvault CLI (`chv`)
//!
//! The `chv` binary is the primary interface for chatvault. It provides
//! commands for database initialization, export ingestion, search,
//! message retrieval, embedding management, and starting the HTTP server.
//!
//! ## Usage
//!
//! ```bash
//! chv --config ./config/chatvault.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `chv init` | Create the SQLite database and schema |
//! | `chv ingest <provider> <path>` | Ingest a chat export (json, zip, or directory) |
//! | `chv search "<query>"` | Search ingested messages |
//! | `chv conversations` | List conversations |
//! | `chv get <id>` | Retrieve a message with its conversation context |
//! | `chv embed pending` | Backfill missing or stale embeddings |
//! | `chv embed rebuild` | Delete and regenerate all embeddings |
//! | `chv stats` | Show corpus and search-log statistics |
//! | `chv serve` | Start the JSON HTTP server |
//!
//! ## Examples
//!
//! ```bash
//! chv init --config ./config/chatvault.toml
//! chv ingest chatgpt ~/Downloads/chatgpt-export.zip
//! chv search "borrow checker" --mode lexical --limit 5
//! chv search "deployment strategy" --mode hybrid --provider claude
//! chv serve
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use chatvault::models::{Provider, Role};
use chatvault::search::SearchFilters;
use chatvault::{config, embed_cmd, get, ingest, migrate, search, server, stats};

/// chatvault CLI: a local-first search engine for exported chat history.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/chatvault.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "chv",
    about = "chatvault — search your exported ChatGPT and Claude history",
    version,
    long_about = "chatvault ingests conversation exports from ChatGPT and Claude, normalizes \
    them into SQLite, and answers queries with lexical (FTS5), semantic (embedding), and fused \
    hybrid retrieval via a CLI and a JSON HTTP server."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/chatvault.toml")]
    config: PathBuf,

    /// Owner id to scope all reads and writes to.
    #[arg(long, global = true, default_value = "local")]
    owner: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables. Idempotent,
    /// safe to run repeatedly.
    Init,

    /// Ingest a provider chat export.
    ///
    /// Accepts a single JSON file, a zip archive, or an extracted export
    /// directory. Re-ingesting the same export updates existing
    /// conversations instead of duplicating them.
    Ingest {
        /// Export provider: `chatgpt` or `claude`.
        provider: String,

        /// Path to the export file or directory.
        path: PathBuf,
    },

    /// Search ingested messages.
    Search {
        /// The search query string.
        query: String,

        /// Search mode: `lexical` (FTS5), `semantic` (vector), or `hybrid`
        /// (weighted fusion). Semantic and hybrid need an embedding provider.
        #[arg(long, default_value = "lexical")]
        mode: String,

        /// Filter by provider: `chatgpt` or `claude`.
        #[arg(long)]
        provider: Option<String>,

        /// Filter by message role: `user`, `assistant`, `system`, `unknown`.
        #[arg(long)]
        role: Option<String>,

        /// Filter by project id.
        #[arg(long)]
        project: Option<String>,

        /// Maximum number of results to return.
        #[arg(long)]
        limit: Option<i64>,

        /// Number of ranked results to skip.
        #[arg(long, default_value_t = 0)]
        offset: i64,

        /// Attach the full conversation context to each result.
        #[arg(long)]
        context: bool,
    },

    /// List conversations, optionally filtered by title substring.
    Conversations {
        /// Title substring to match.
        query: Option<String>,

        /// Filter by provider: `chatgpt` or `claude`.
        #[arg(long)]
        provider: Option<String>,

        /// Maximum number of conversations to return.
        #[arg(long)]
        limit: Option<i64>,

        /// Number of conversations to skip.
        #[arg(long, default_value_t = 0)]
        offset: i64,
    },

    /// Retrieve a message by id, with its conversation context.
    Get {
        /// Message UUID.
        id: String,
    },

    /// Manage embedding vectors.
    Embed {
        #[command(subcommand)]
        action: EmbedAction,
    },

    /// Show corpus and search-log statistics.
    Stats,

    /// Start the JSON HTTP server on `[server].bind`.
    Serve,
}

#[derive(Subcommand)]
enum EmbedAction {
    /// Embed messages that are missing or have stale embeddings.
    Pending {
        /// Maximum number of messages to embed in this run.
        #[arg(long)]
        limit: Option<usize>,

        /// Override the batch size from config (texts per API call).
        #[arg(long)]
        batch_size: Option<usize>,

        /// Show counts without performing any embedding.
        #[arg(long)]
        dry_run: bool,
    },

    /// Delete and regenerate all embeddings.
    ///
    /// Useful when switching embedding models or dimensions.
    Rebuild {
        /// Override the batch size from config (texts per API call).
        #[arg(long)]
        batch_size: Option<usize>,
    },
}

fn parse_provider(s: &str) -> anyhow::Result<Provider> {
    Provider::parse(s)
        .ok_or_else(|| anyhow::anyhow!("Unknown provider: {}. Use chatgpt or claude.", s))
}

fn parse_role(s: &str) -> anyhow::Result<Role> {
    Role::parse(s).ok_or_else(|| {
        anyhow::anyhow!("Unknown role: {}. Use user, assistant, system, or unknown.", s)
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { provider, path } => {
            let provider = parse_provider(&provider)?;
            ingest::run_ingest(&cfg, provider, &path, &cli.owner).await?;
        }
        Commands::Search {
            query,
            mode,
            provider,
            role,
            project,
            limit,
            offset,
            context,
        } => {
            let filters = SearchFilters {
                provider: provider.as_deref().map(parse_provider).transpose()?,
                role: role.as_deref().map(parse_role).transpose()?,
                project_id: project,
                after: None,
                before: None,
            };
            search::run_search(&cfg, &cli.owner, &query, &mode, filters, limit, offset, context)
                .await?;
        }
        Commands::Conversations {
            query,
            provider,
            limit,
            offset,
        } => {
            let provider = provider.as_deref().map(parse_provider).transpose()?;
            search::run_conversations(&cfg, &cli.owner, query.as_deref(), provider, limit, offset)
                .await?;
        }
        Commands::Get { id } => {
            get::run_get(&cfg, &cli.owner, &id).await?;
        }
        Commands::Embed { action } => match action {
            EmbedAction::Pending {
                limit,
                batch_size,
                dry_run,
            } => {
                embed_cmd::run_embed_pending(&cfg, limit, batch_size, dry_run).await?;
            }
            EmbedAction::Rebuild { batch_size } => {
                embed_cmd::run_embed_rebuild(&cfg, batch_size).await?;
            }
        },
        Commands::Stats => {
            stats::run_stats(&cfg, &cli.owner).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
