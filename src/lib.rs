//! triviagen: a resilient client for generating verified multiple-choice
//! trivia questions from a local Ollama-style backend.
//!
//! The pipeline behind [`QuizClient::generate_question`]:
//!   1. cache lookup (bounded FIFO per category/difficulty/topic key)
//!   2. deterministic prompt rendering (the prompt is the coalescing key)
//!   3. one transport call shared by identical concurrent requests
//!   4. tolerant normalization of whatever text the model produced
//!   5. structural checks, then blind verification with auto-correction
//!   6. cache write and a detached prefetch for the same key
//!
//! Environment:
//! - `TRIVIAGEN_CONFIG_PATH`: optional TOML config file
//! - `TRIVIAGEN_SERVER_URL`: pin the backend base URL
//! - `TRIVIAGEN_MODEL`: model name for /api/generate
//! - `LOG_LEVEL` / `LOG_FORMAT`: tracing filter and output format
//!
//! ```no_run
//! use triviagen::{GenerationRequest, QuizClient};
//!
//! # async fn run() -> Result<(), triviagen::GenerateError> {
//! let client = QuizClient::from_env()?;
//! let q = client.generate_question(GenerationRequest::new("historia", "easy")).await?;
//! println!("{} -> {}", q.text, q.answers[q.correct_index]);
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod client;
pub mod config;
pub mod domain;
pub mod error;
pub mod locator;
pub mod normalize;
pub mod ollama;
pub mod prompt;
pub mod similarity;
pub mod stats;
pub mod telemetry;
pub mod util;
pub mod validate;

pub use client::{ClientStats, ConnectionReport, QuizClient};
pub use config::ClientConfig;
pub use domain::{
  CancelSource, CancelToken, Confidence, GenerationRequest, Question, ServerEndpoint,
  ValidationAction, ValidationOutcome,
};
pub use error::GenerateError;
pub use ollama::{GenerateOptions, OllamaBackend, TextBackend};
pub use stats::ValidationStats;
