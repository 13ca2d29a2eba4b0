//! Client configuration: server selection, sampling, retry/backoff, cache,
//! prefetch, and validation thresholds.
//!
//! Everything has a working default; a TOML file (TRIVIAGEN_CONFIG_PATH) and
//! a couple of env variables can override it. Thresholds are deliberately
//! configuration rather than constants: the 0.6/0.7 cutoffs were chosen
//! empirically and deployments are expected to tune them.

use serde::Deserialize;
use tracing::{error, info};

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
  /// Manual server pin. When set, candidate probing is skipped entirely.
  pub server_url: Option<String>,
  /// Candidate base URLs probed by the locator, best latency wins.
  pub candidate_urls: Vec<String>,
  /// Probe candidates automatically when no server is active.
  pub auto_detect: bool,
  pub probe_timeout_ms: u64,

  /// Model name passed to /api/generate (prefix-matched against /api/tags).
  pub model: String,

  // Per-attempt transport limits.
  pub request_timeout_ms: u64,
  /// Total attempt budget for one generate_question call.
  pub max_retries: u32,
  pub backoff_base_ms: u64,
  /// Upper bound for the random jitter added to each backoff delay.
  pub backoff_jitter_ms: u64,

  // Sampling for question generation (creative).
  pub temperature: f32,
  pub top_p: f32,
  pub top_k: u32,
  pub num_predict: u32,

  // Sampling for blind verification / strict-JSON reformat (cheap, cold).
  pub verify_temperature: f32,
  pub verify_num_predict: u32,

  pub prefetch_enabled: bool,
  /// Target number of cached questions per key that prefetch tops up to.
  pub prefetch_count: usize,
  pub cache_max_per_key: usize,
  pub cache_max_keys: usize,

  /// Experimental: blind-verify every question. When off, only the cheap
  /// pattern heuristic runs, escalating to a one-off verification on demand.
  pub full_verification: bool,
  /// Below this best-match score a mismatch is uninterpretable: regenerate.
  pub regenerate_threshold: f32,
  /// At or above this score (with high/medium confidence) we auto-correct.
  pub correction_threshold: f32,
  pub min_question_len: usize,

  /// Default question language when the request does not specify one.
  pub language: String,
  /// Raises the default tracing filter (see `telemetry::init_tracing_with`)
  /// when LOG_LEVEL is unset.
  pub debug_logging: bool,
}

impl Default for ClientConfig {
  fn default() -> Self {
    Self {
      server_url: None,
      candidate_urls: vec![
        "http://localhost:11434".into(),
        "http://127.0.0.1:11434".into(),
      ],
      auto_detect: true,
      probe_timeout_ms: 2_000,
      model: "llama3.2".into(),
      request_timeout_ms: 30_000,
      max_retries: 3,
      backoff_base_ms: 500,
      backoff_jitter_ms: 250,
      temperature: 0.9,
      top_p: 0.9,
      top_k: 40,
      num_predict: 350,
      verify_temperature: 0.1,
      verify_num_predict: 150,
      prefetch_enabled: true,
      prefetch_count: 2,
      cache_max_per_key: 3,
      cache_max_keys: 24,
      full_verification: false,
      regenerate_threshold: 0.6,
      correction_threshold: 0.7,
      min_question_len: 10,
      language: "es".into(),
      debug_logging: false,
    }
  }
}

impl ClientConfig {
  /// Build config from the environment: TOML file first (if any), then
  /// TRIVIAGEN_SERVER_URL / TRIVIAGEN_MODEL overrides on top.
  pub fn from_env() -> Self {
    let mut cfg = load_config_file().unwrap_or_default();
    if let Ok(url) = std::env::var("TRIVIAGEN_SERVER_URL") {
      if !url.trim().is_empty() {
        cfg.server_url = Some(url);
      }
    }
    if let Ok(model) = std::env::var("TRIVIAGEN_MODEL") {
      if !model.trim().is_empty() {
        cfg.model = model;
      }
    }
    cfg
  }
}

/// Attempt to load config from TRIVIAGEN_CONFIG_PATH. On any parsing/IO
/// error, returns None and the defaults apply.
fn load_config_file() -> Option<ClientConfig> {
  let path = std::env::var("TRIVIAGEN_CONFIG_PATH").ok()?;
  match std::fs::read_to_string(&path) {
    Ok(s) => match toml::from_str::<ClientConfig>(&s) {
      Ok(cfg) => {
        info!(target: "triviagen", %path, "Loaded client config (TOML)");
        Some(cfg)
      }
      Err(e) => {
        error!(target: "triviagen", %path, error = %e, "Failed to parse TOML config");
        None
      }
    },
    Err(e) => {
      error!(target: "triviagen", %path, error = %e, "Failed to read TOML config file");
      None
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_are_sane() {
    let cfg = ClientConfig::default();
    assert!(cfg.max_retries >= 1);
    assert!(cfg.regenerate_threshold < cfg.correction_threshold);
    assert!(!cfg.candidate_urls.is_empty());
  }

  #[test]
  fn partial_toml_falls_back_to_defaults() {
    let cfg: ClientConfig =
      toml::from_str("model = \"mistral\"\nmax_retries = 5").expect("parse");
    assert_eq!(cfg.model, "mistral");
    assert_eq!(cfg.max_retries, 5);
    assert_eq!(cfg.regenerate_threshold, ClientConfig::default().regenerate_threshold);
  }
}
