//! moondream-server: local HTTP API for the moondream2 vision-language model
//!
//! Provides endpoints for:
//! - POST /query          - visual question answering
//! - POST /caption        - image captioning
//! - POST /query/stream   - question answering as an ndjson chunk stream
//! - POST /caption/stream - captioning as an ndjson chunk stream
//! - GET  /health         - liveness and loaded model
//!
//! Generation is blocking, so it never runs on the async runtime: one-shot
//! requests use the blocking pool and streams get their own worker thread.

pub mod config;
pub mod engines;
pub mod error;
pub mod handlers;
pub mod inference;
pub mod model_config;
pub mod payload;
pub mod router;
pub mod state;
pub mod types;
pub mod utils;
