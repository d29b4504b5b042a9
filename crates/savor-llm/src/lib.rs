//! Savor LLM
//!
//! Client for an Ollama-compatible model server. Three call shapes cover
//! everything the pipeline needs:
//!
//! - `embed`: one text in, one raw vector out (`/api/embed`)
//! - `generate_json`: a constrained chat completion that must return a
//!   single strict-JSON object (`/api/chat` with `format: "json"`)
//! - `chat_stream`: a streaming chat completion pulled chunk by chunk
//!   (`/api/chat` with `stream: true`, NDJSON frames)

pub mod client;

pub use client::{ChatStream, OllamaClient};
