//! # chatvault
//!
//! A local-first search engine for exported chat history.
//!
//! chatvault ingests conversation exports from ChatGPT and Claude
//! (JSON files, zip archives, or extracted directories), normalizes them
//! into a single conversation/message model in SQLite, and answers queries
//! with lexical (FTS5), semantic (embedding), and fused hybrid retrieval
//! via a CLI and a JSON HTTP server.
//!
//! ## Quick Start
//!
//! ```bash
//! chv init                                  # create database
//! chv ingest chatgpt ./export.zip           # ingest a provider export
//! chv embed pending                         # generate embeddings (optional)
//! chv search "rust lifetimes" --mode hybrid
//! chv serve                                 # start HTTP server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`parser`] | Schema-tolerant export parsing |
//! | [`ingest`] | Ingestion pipeline and persistence |
//! | [`search`] | Lexical, semantic, and hybrid retrieval |
//! | [`fusion`] | Rank fusion for hybrid mode |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`server`] | HTTP API server |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema setup |

pub mod config;
pub mod db;
pub mod embed_cmd;
pub mod embedding;
pub mod fusion;
pub mod get;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod parser;
pub mod search;
pub mod server;
pub mod stats;
