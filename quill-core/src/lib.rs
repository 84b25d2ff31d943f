//! # Quill Core Library
//!
//! Knowledge-base retrieval for long-form fiction writing. Narrative text is
//! split into chunks and indexed per category:
//!
//! - **History**: past narrative passages
//! - **Outline**: planned structure and plot beats
//! - **Character**: persona facts
//!
//! Each category has its own chunk store, BM25 keyword index and embedding
//! index. A query is ranked per category by blending normalized keyword and
//! embedding relevance with a recency boost toward the writer's cursor, then
//! merged across the active categories.
//!
//! ## Performance Contract
//!
//! Search is synchronous and in-memory:
//! - Search, 1k chunks per category, top-5: < 2ms
//! - Index mutation per chunk (excluding the embedding call): < 100μs

#![deny(clippy::unwrap_used)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)]

pub mod chunking;
pub mod config;
pub mod context;
pub mod embedding;
pub mod error;
pub mod keyword;
pub mod manager;
pub mod persistence;
pub mod retrieval;
pub mod store;
pub mod types;
pub mod vector;

pub use config::QuillConfig;
pub use error::QuillError;
pub use manager::{IngestReport, KnowledgeBaseManager};
pub use types::*;
