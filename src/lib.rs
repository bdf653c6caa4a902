//! # kbase
//!
//! A retrieval and index-consistency engine for document knowledge bases.
//!
//! kbase turns uploaded documents (plain text, Markdown, PDF, DOCX) into an
//! append-only vector index with a slot mapping store, and answers questions
//! over them with hybrid retrieval (cosine similarity blended with keyword
//! overlap). The catalog, index, and mappings are kept consistent under a
//! single-writer discipline, verified on startup, and repairable from the
//! catalog when artifacts are damaged.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────────────┐   ┌───────────────┐
//! │ Uploads  │──▶│ Extract+Chunk+    │──▶│ Vector index   │
//! │ txt/md/  │   │ Embed (lifecycle) │   │ + mapping store│
//! │ pdf/docx │   └───────────────────┘   └──────┬────────┘
//! └──────────┘          │                       │
//!                  ┌────▼─────┐          ┌──────▼───────┐
//!                  │  SQLite  │          │ Hybrid query │
//!                  │  catalog │          │ + cache      │
//!                  └──────────┘          └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! kbase init                          # create the catalog database
//! kbase ingest ./manual.pdf           # extract, chunk, embed, index
//! kbase query "how do I deploy?"      # hybrid retrieval
//! kbase check                         # consistency report
//! kbase serve                         # start the HTTP server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`extract`] | Per-format text extraction |
//! | [`chunker`] | Length-adaptive chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`index`] | Append-only flat vector index |
//! | [`mapping`] | Slot mapping store, verify and repair |
//! | [`catalog`] | Document catalog queries |
//! | [`engine`] | Orchestration, retrieval, consistency |
//! | [`server`] | HTTP API server |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod cache;
pub mod catalog;
pub mod chunker;
pub mod config;
pub mod db;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod extract;
pub mod index;
pub mod lifecycle;
pub mod mapping;
pub mod migrate;
pub mod models;
pub mod server;
