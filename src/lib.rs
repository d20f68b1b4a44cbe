//! # coderank
//!
//! A retrieval layer for document question answering that takes structured
//! identifiers seriously. A query like `XRN-1620B2 수리` is answered by two
//! stages run side by side:
//!
//! - **Stage 0** ([`exact`]) finds documents that contain the code itself,
//!   in any of its spellings, with boundary-safe matching.
//! - **Stage 1** ([`stage1`]) is any best-effort retriever: SQLite FTS5, an
//!   external HTTP service, or nothing at all.
//!
//! The two ranked lists are merged with Reciprocal Rank Fusion, cached per
//! index generation, and served while the index is rebuilt underneath.
//!
//! ## Architecture
//!
//! ```text
//! request ─► QueryCache ─(miss)─► FusionRetriever ─┬─► ExactMatchRetriever ─► CodeIndex (generation N)
//!                                                  └─► Stage1Retriever
//!
//! ReindexCoordinator: stage N+1 ─► validate ─► swap pointer ─► retain N for rollback
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Retrieval error taxonomy |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite document store |
//! | [`sqlite_index`] | Generation-scoped SQLite index |
//! | [`index_backend`] | Generation storage seam |
//! | [`exact`] | Stage 0 exact-match retriever |
//! | [`retriever`] | Two-stage fusion retriever |
//! | [`cache`] | Stampede-safe query cache |
//! | [`reindex`] | Zero-downtime reindex coordinator |
//! | [`metrics`] | Operational counters |
//! | [`stage1`] | Built-in Stage 1 retrievers |
//! | [`service`] | Wires everything together |
//! | [`ingest`] | Minimal filesystem ingestion |
//! | [`server`] | HTTP API |
//! | [`commands`] | CLI commands |
//!
//! Runtime-agnostic pieces (normalization, data model, RRF, in-memory index)
//! live in the `coderank-core` crate.

pub mod cache;
pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod exact;
pub mod index_backend;
pub mod ingest;
pub mod metrics;
pub mod migrate;
pub mod reindex;
pub mod retriever;
pub mod server;
pub mod service;
pub mod sqlite_index;
pub mod sqlite_store;
pub mod stage1;
