//! # coderank core
//!
//! Runtime-agnostic logic for coderank: the retrieval data model, code
//! normalization and extraction, the index / document-store / Stage 1
//! abstractions, in-memory implementations of each, and Reciprocal Rank
//! Fusion.
//!
//! This crate contains no tokio, sqlx, or filesystem I/O. Everything that
//! needs a runtime (timeouts, SQLite, HTTP) lives in the `coderank`
//! application crate and plugs in through the traits defined here.

pub mod fusion;
pub mod index;
pub mod models;
pub mod normalize;
pub mod stage1;
pub mod store;
