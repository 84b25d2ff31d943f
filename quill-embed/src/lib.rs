//! # quill-embed: HTTP Embedding Clients for Quill
//!
//! Implements [`quill_core::embedding::EmbeddingService`] over HTTP:
//!   - **OpenAI-compatible** `/v1/embeddings` (DashScope, vLLM, LM Studio, OpenAI)
//!   - **Ollama** `/api/embed`
//!
//! Requests are batched by the caller, retried with exponential backoff,
//! and bounded by a per-request timeout. Every failure surfaces to the
//! knowledge base as `QuillError::EmbeddingUnavailable`, which degrades the
//! affected chunks to keyword-only retrieval instead of failing ingestion.

#![deny(clippy::unwrap_used)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod error;

pub use client::{EmbeddingProvider, HttpEmbeddingClient};
pub use error::EmbedError;
