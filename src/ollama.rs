//! Minimal Ollama client for our use-cases.
//!
//! We only call three endpoints of the local backend:
//!   GET  /api/version   — liveness/version probe
//!   GET  /api/tags      — installed models
//!   POST /api/generate  — non-streaming text generation
//!
//! The `TextBackend` trait is the seam the whole pipeline is written
//! against, so tests can script responses without a network. Calls log model
//! names, latencies and response sizes — never full payloads.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::config::ClientConfig;
use crate::error::GenerateError;

/// Sampling knobs forwarded verbatim to /api/generate.
#[derive(Clone, Debug, Serialize)]
pub struct GenerateOptions {
  pub temperature: f32,
  pub top_p: f32,
  pub top_k: u32,
  pub num_predict: u32,
}

impl GenerateOptions {
  /// Profile for question generation: warm sampling, room for a full object.
  pub fn creative(cfg: &ClientConfig) -> Self {
    Self {
      temperature: cfg.temperature,
      top_p: cfg.top_p,
      top_k: cfg.top_k,
      num_predict: cfg.num_predict,
    }
  }

  /// Profile for blind verification and strict-JSON reformat: cold sampling,
  /// small output budget.
  pub fn strict(cfg: &ClientConfig) -> Self {
    Self {
      temperature: cfg.verify_temperature,
      top_p: cfg.top_p,
      top_k: cfg.top_k,
      num_predict: cfg.verify_num_predict,
    }
  }
}

/// The generation transport the pipeline talks to.
#[async_trait]
pub trait TextBackend: Send + Sync + 'static {
  /// One non-streaming generation call; returns the raw response text.
  async fn generate(
    &self,
    base_url: &str,
    prompt: &str,
    opts: &GenerateOptions,
  ) -> Result<String, GenerateError>;

  /// Liveness probe; returns the backend version string.
  async fn version(&self, base_url: &str, timeout: Duration) -> Result<String, GenerateError>;

  /// Names of installed models.
  async fn tags(&self, base_url: &str) -> Result<Vec<String>, GenerateError>;
}

#[derive(Clone)]
pub struct OllamaBackend {
  http: reqwest::Client,
  model: String,
}

#[derive(Serialize)]
struct GenerateBody<'a> {
  model: &'a str,
  prompt: &'a str,
  stream: bool,
  options: &'a GenerateOptions,
}

#[derive(Deserialize)]
struct GenerateResponse {
  response: String,
}

#[derive(Deserialize)]
struct VersionResponse {
  version: String,
}

#[derive(Deserialize)]
struct TagsResponse {
  #[serde(default)]
  models: Vec<TagEntry>,
}

#[derive(Deserialize)]
struct TagEntry {
  name: String,
}

impl OllamaBackend {
  pub fn new(model: impl Into<String>) -> Result<Self, GenerateError> {
    // No client-level timeout: the pipeline owns per-attempt timeouts so a
    // cancelled attempt and a timed-out attempt stay distinguishable.
    let http = reqwest::Client::builder()
      .build()
      .map_err(|e| GenerateError::Network(e.to_string()))?;
    Ok(Self { http, model: model.into() })
  }

  pub fn model(&self) -> &str {
    &self.model
  }
}

#[async_trait]
impl TextBackend for OllamaBackend {
  #[instrument(level = "debug", skip(self, prompt, opts), fields(model = %self.model, prompt_len = prompt.len()))]
  async fn generate(
    &self,
    base_url: &str,
    prompt: &str,
    opts: &GenerateOptions,
  ) -> Result<String, GenerateError> {
    let url = format!("{}/api/generate", base_url.trim_end_matches('/'));
    let body = GenerateBody { model: &self.model, prompt, stream: false, options: opts };

    let started = std::time::Instant::now();
    let res = self
      .http
      .post(&url)
      .json(&body)
      .send()
      .await
      .map_err(|e| GenerateError::Network(e.to_string()))?;

    if !res.status().is_success() {
      let status = res.status();
      let body = res.text().await.unwrap_or_default();
      return Err(GenerateError::Network(format!(
        "backend HTTP {}: {}",
        status,
        crate::util::trunc_for_log(&body, 200)
      )));
    }

    let parsed: GenerateResponse =
      res.json().await.map_err(|e| GenerateError::Network(e.to_string()))?;
    debug!(
      target: "pipeline",
      elapsed_ms = started.elapsed().as_millis() as u64,
      response_len = parsed.response.len(),
      "generate call finished"
    );
    Ok(parsed.response)
  }

  async fn version(&self, base_url: &str, timeout: Duration) -> Result<String, GenerateError> {
    let url = format!("{}/api/version", base_url.trim_end_matches('/'));
    let res = self
      .http
      .get(&url)
      .timeout(timeout)
      .send()
      .await
      .map_err(|e| GenerateError::Network(e.to_string()))?;
    if !res.status().is_success() {
      return Err(GenerateError::Network(format!("backend HTTP {}", res.status())));
    }
    let v: VersionResponse = res.json().await.map_err(|e| GenerateError::Network(e.to_string()))?;
    Ok(v.version)
  }

  async fn tags(&self, base_url: &str) -> Result<Vec<String>, GenerateError> {
    let url = format!("{}/api/tags", base_url.trim_end_matches('/'));
    let res = self
      .http
      .get(&url)
      .send()
      .await
      .map_err(|e| GenerateError::Network(e.to_string()))?;
    if !res.status().is_success() {
      return Err(GenerateError::Network(format!("backend HTTP {}", res.status())));
    }
    let t: TagsResponse = res.json().await.map_err(|e| GenerateError::Network(e.to_string()))?;
    Ok(t.models.into_iter().map(|m| m.name).collect())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn sampling_profiles_differ_where_it_matters() {
    let cfg = ClientConfig::default();
    let creative = GenerateOptions::creative(&cfg);
    let strict = GenerateOptions::strict(&cfg);
    assert!(strict.temperature < creative.temperature);
    assert!(strict.num_predict < creative.num_predict);
  }

  #[test]
  fn generate_body_serializes_the_ollama_shape() {
    let opts = GenerateOptions { temperature: 0.9, top_p: 0.9, top_k: 40, num_predict: 350 };
    let body = GenerateBody { model: "llama3.2", prompt: "hi", stream: false, options: &opts };
    let json = serde_json::to_value(&body).expect("serialize");
    assert_eq!(json["stream"], false);
    assert_eq!(json["options"]["num_predict"], 350);
  }
}
