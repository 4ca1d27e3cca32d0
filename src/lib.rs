//! # agent-rag
//!
//! Per-agent document ingestion and retrieval for grounding language model
//! answers.
//!
//! Each agent owns a directory of documents. An ingestion re-reads the whole
//! directory, cuts it into overlapping token windows, embeds them, and
//! atomically replaces the agent's vector collection. Retrieval embeds a
//! prompt and returns the most similar chunk texts.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────┐   ┌───────────┐   ┌──────────────┐
//! │  loader  │──▶│ chunk │──▶│ embedding │──▶│ index        │
//! │ agents/* │   └───────┘   └───────────┘   │ (alias swap) │
//! └──────────┘                               └──────┬───────┘
//!       ▲ ingest (jobs, notify outbox)              │ retrieve
//!       │                                           ▼
//!  ┌────┴─────────────────────────────────────────────────┐
//!  │               server (HTTP) / CLI                    │
//!  └──────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Error taxonomy |
//! | [`loader`] | Agent document directory walking |
//! | [`extract`] | PDF / DOCX text extraction |
//! | [`chunk`] | Overlapping token-window chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`index`] | Per-agent vector collections with atomic rebuild |
//! | [`jobs`] | Persistent ingestion job records |
//! | [`notify`] | Status notification outbox |
//! | [`ingest`] | Ingestion orchestration |
//! | [`retrieve`] | Prompt retrieval |
//! | [`services`] | Service wiring |
//! | [`server`] | HTTP server |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod index;
pub mod ingest;
pub mod jobs;
pub mod loader;
pub mod migrate;
pub mod models;
pub mod notify;
pub mod retrieve;
pub mod server;
pub mod services;
